//! Xray-family adapter: construct, start, block on the token, close.

use crate::backend::{AdapterOptions, EngineAdapter, XrayCore};
use crate::cancel::CancellationToken;
use crate::slot::InstanceSlot;
use crate::RuntimeError;
use corehub_schema::{EngineType, InjectedConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// How often a running instance is checked for an unexpected exit.
pub(crate) const LIVENESS_POLL: Duration = Duration::from_millis(200);

pub struct XrayAdapter {
    core: Arc<dyn XrayCore>,
    options: AdapterOptions,
    slot: InstanceSlot,
}

impl XrayAdapter {
    pub fn new(core: Arc<dyn XrayCore>, options: AdapterOptions) -> Self {
        Self {
            core,
            options,
            slot: InstanceSlot::new("xray"),
        }
    }
}

pub(crate) fn ensure_engine(
    expected: EngineType,
    config: &InjectedConfig,
) -> Result<(), RuntimeError> {
    if config.engine == expected {
        Ok(())
    } else {
        Err(RuntimeError::Validation(format!(
            "{} config handed to the {expected} adapter",
            config.engine
        )))
    }
}

/// Wrap non-panic startup errors so callers can tell them apart.
pub(crate) fn start_failure(err: RuntimeError) -> RuntimeError {
    match err {
        RuntimeError::Panicked(_)
        | RuntimeError::StartFailed(_)
        | RuntimeError::AlreadyRunning(_)
        | RuntimeError::EngineUnavailable(_) => err,
        other => RuntimeError::StartFailed(other.to_string()),
    }
}

impl EngineAdapter for XrayAdapter {
    fn engine(&self) -> EngineType {
        EngineType::Xray
    }

    fn driver(&self) -> &str {
        self.core.name()
    }

    fn start(&self, config: &InjectedConfig, token: CancellationToken) -> Result<(), RuntimeError> {
        ensure_engine(EngineType::Xray, config)?;
        let core = Arc::clone(&self.core);
        let config = config.clone();

        self.slot
            .launch(token, self.options.startup_timeout, move |token, reporter| {
                let mut instance = core.create(&config)?;
                instance.start()?;
                reporter.ready();
                info!(
                    "xray instance started (socks {}, api {})",
                    config.socks_port(),
                    config.api_port()
                );

                while !token.wait_timeout(LIVENESS_POLL) {
                    if !instance.is_alive() {
                        warn!("xray instance exited unexpectedly");
                        break;
                    }
                }

                if let Err(e) = instance.close() {
                    warn!("failed to close xray instance: {e}");
                }
                info!("xray instance closed");
                Ok(())
            })
            .map_err(start_failure)
    }

    fn stop(&self) -> Result<(), RuntimeError> {
        self.slot.halt(self.options.stop_grace)
    }

    fn validate_only(&self, config: &InjectedConfig) -> Result<(), RuntimeError> {
        ensure_engine(EngineType::Xray, config)?;
        self.core.validate(config)
    }

    fn is_running(&self) -> bool {
        self.slot.is_active()
    }

    fn stop_grace(&self) -> Duration {
        self.options.stop_grace
    }
}

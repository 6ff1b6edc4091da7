//! Mihomo-family adapter: parse, apply, block on the token, shut the hub down.
//!
//! Engine logs reach the configured log file through a single
//! [`LogForwarder`]; opening a new subscription closes the previous one.
//! Teardown is scoped to the launch that performed it, so an abandoned
//! instance finishing late never touches its successor.

use crate::backend::{AdapterOptions, EngineAdapter, MihomoHub};
use crate::cancel::CancellationToken;
use crate::logbus::LogForwarder;
use crate::slot::InstanceSlot;
use crate::xray::{ensure_engine, start_failure, LIVENESS_POLL};
use crate::RuntimeError;
use corehub_schema::{EngineType, InjectedConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// The live forwarder, tagged with the launch that opened it.
type ForwarderSlot = Arc<Mutex<Option<(u64, LogForwarder)>>>;

pub struct MihomoAdapter {
    hub: Arc<dyn MihomoHub>,
    options: AdapterOptions,
    slot: InstanceSlot,
    forwarder: ForwarderSlot,
    launches: AtomicU64,
}

impl MihomoAdapter {
    pub fn new(hub: Arc<dyn MihomoHub>, options: AdapterOptions) -> Self {
        Self {
            hub,
            options,
            slot: InstanceSlot::new("mihomo"),
            forwarder: Arc::new(Mutex::new(None)),
            launches: AtomicU64::new(0),
        }
    }

    /// Log file currently receiving engine output, if any.
    pub fn forwarding_to(&self) -> Option<PathBuf> {
        lock(&self.forwarder)
            .as_ref()
            .map(|(_, f)| f.path().to_path_buf())
    }
}

/// The hub home: the asset directory when set, else the working directory.
pub fn resolve_home(config: &InjectedConfig) -> Result<PathBuf, RuntimeError> {
    match &config.asset_dir {
        Some(dir) => Ok(dir.clone()),
        None => Ok(std::env::current_dir()?),
    }
}

/// Create the hub home and its `log/` subdirectory.
pub fn prepare_home(home: &Path) -> Result<(), RuntimeError> {
    std::fs::create_dir_all(home)?;
    std::fs::create_dir_all(home.join("log"))?;
    debug!("mihomo home: {}", home.display());
    Ok(())
}

type Forwarder = Option<(u64, LogForwarder)>;

fn lock(slot: &Mutex<Forwarder>) -> MutexGuard<'_, Forwarder> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn close_forwarder(hub: &dyn MihomoHub, forwarder: LogForwarder) {
    hub.unsubscribe(forwarder.subscription_id());
    forwarder.join();
    debug!("stopped mihomo log forwarding");
}

/// Close the forwarder only while `launch` still owns it.
fn stop_forwarding(hub: &dyn MihomoHub, slot: &Mutex<Forwarder>, launch: u64) {
    let owned = {
        let mut current = lock(slot);
        if current.as_ref().is_some_and(|(owner, _)| *owner == launch) {
            current.take()
        } else {
            None
        }
    };
    if let Some((_, forwarder)) = owned {
        close_forwarder(hub, forwarder);
    }
}

fn start_forwarding(hub: &dyn MihomoHub, slot: &Mutex<Forwarder>, launch: u64, path: &Path) {
    if let Some((_, previous)) = lock(slot).take() {
        close_forwarder(hub, previous);
    }
    let subscription = hub.subscribe();
    let id = subscription.id();
    match LogForwarder::spawn(subscription, path) {
        Ok(forwarder) => {
            info!("forwarding mihomo logs to {}", path.display());
            *lock(slot) = Some((launch, forwarder));
        }
        Err(e) => {
            hub.unsubscribe(id);
            warn!("cannot forward mihomo logs to {}: {e}", path.display());
        }
    }
}

/// Shuts down the hub generation this launch applied and closes its log
/// forwarding when dropped, including while unwinding from a panic on the
/// instance thread.
struct HubSession {
    hub: Arc<dyn MihomoHub>,
    forwarder: ForwarderSlot,
    launch: u64,
    generation: Option<u64>,
}

impl Drop for HubSession {
    fn drop(&mut self) {
        if let Some(generation) = self.generation {
            if let Err(e) = self.hub.shutdown(generation) {
                warn!("mihomo hub shutdown failed: {e}");
            }
        }
        stop_forwarding(self.hub.as_ref(), &self.forwarder, self.launch);
        info!("mihomo launch {} torn down", self.launch);
    }
}

impl EngineAdapter for MihomoAdapter {
    fn engine(&self) -> EngineType {
        EngineType::Mihomo
    }

    fn driver(&self) -> &str {
        self.hub.name()
    }

    fn start(&self, config: &InjectedConfig, token: CancellationToken) -> Result<(), RuntimeError> {
        ensure_engine(EngineType::Mihomo, config)?;
        let home = resolve_home(config)?;
        prepare_home(&home)?;

        let hub = Arc::clone(&self.hub);
        let forwarder = Arc::clone(&self.forwarder);
        let config = config.clone();
        let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;

        self.slot
            .launch(token, self.options.startup_timeout, move |token, reporter| {
                let profile = hub.parse(&config, &home)?;

                let mut session = HubSession {
                    hub: Arc::clone(&hub),
                    forwarder: Arc::clone(&forwarder),
                    launch,
                    generation: None,
                };
                // Subscribe before applying so startup output is captured.
                match &config.log_file {
                    Some(path) => start_forwarding(hub.as_ref(), &forwarder, launch, path),
                    None => debug!("no log file configured; mihomo output is not forwarded"),
                }

                session.generation = Some(hub.apply(&profile)?);
                reporter.ready();
                info!(
                    "mihomo hub applied (mixed {}, api {})",
                    config.socks_port(),
                    config.api_port()
                );

                while !token.wait_timeout(LIVENESS_POLL) {
                    if !hub.is_alive() {
                        warn!("mihomo hub exited unexpectedly");
                        break;
                    }
                }
                Ok(())
            })
            .map_err(start_failure)
    }

    fn stop(&self) -> Result<(), RuntimeError> {
        self.slot.halt(self.options.stop_grace)
    }

    fn validate_only(&self, config: &InjectedConfig) -> Result<(), RuntimeError> {
        ensure_engine(EngineType::Mihomo, config)?;
        let home = resolve_home(config)?;
        prepare_home(&home)?;
        self.hub.parse(config, &home).map(|_| ())
    }

    fn is_running(&self) -> bool {
        self.slot.is_active()
    }

    fn stop_grace(&self) -> Duration {
        self.options.stop_grace
    }
}

use crate::cancel::CancellationToken;
use crate::logbus::Subscription;
use crate::RuntimeError;
use corehub_schema::{ControlPorts, EngineType, InjectedConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Driver sets understood by [`select_backend`].
pub const BACKENDS: &[&str] = &["process", "mock"];

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_millis(1500);
pub const DEFAULT_XRAY_STOP_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_MIHOMO_STOP_GRACE: Duration = Duration::from_secs(3);

/// Timing bounds for one adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterOptions {
    /// How long `start` waits for the instance thread's startup report.
    pub startup_timeout: Duration,
    /// How long `stop` waits for the instance thread before abandoning it.
    pub stop_grace: Duration,
}

impl AdapterOptions {
    pub fn for_engine(engine: EngineType) -> Self {
        let stop_grace = match engine {
            EngineType::Xray => DEFAULT_XRAY_STOP_GRACE,
            EngineType::Mihomo => DEFAULT_MIHOMO_STOP_GRACE,
        };
        Self {
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            stop_grace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub xray_binary: PathBuf,
    pub mihomo_binary: PathBuf,
    pub startup_timeout: Duration,
    pub xray_stop_grace: Duration,
    pub mihomo_stop_grace: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            xray_binary: PathBuf::from("xray"),
            mihomo_binary: PathBuf::from("mihomo"),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            xray_stop_grace: DEFAULT_XRAY_STOP_GRACE,
            mihomo_stop_grace: DEFAULT_MIHOMO_STOP_GRACE,
        }
    }
}

impl BackendConfig {
    pub fn options(&self, engine: EngineType) -> AdapterOptions {
        AdapterOptions {
            startup_timeout: self.startup_timeout,
            stop_grace: match engine {
                EngineType::Xray => self.xray_stop_grace,
                EngineType::Mihomo => self.mihomo_stop_grace,
            },
        }
    }
}

/// The contract the lifecycle manager uses to drive one engine family.
///
/// Calls look synchronous; the instance itself lives on a background thread
/// bound to the token passed to `start`.
pub trait EngineAdapter: Send + Sync {
    fn engine(&self) -> EngineType;

    /// Name of the driver set behind this adapter (`process`, `mock`, ...).
    fn driver(&self) -> &str;

    fn start(&self, config: &InjectedConfig, token: CancellationToken) -> Result<(), RuntimeError>;

    /// Cancel and wait (bounded) for the instance. No-op when stopped.
    fn stop(&self) -> Result<(), RuntimeError>;

    /// Run the engine's load/parse path without constructing an instance.
    fn validate_only(&self, config: &InjectedConfig) -> Result<(), RuntimeError>;

    fn is_running(&self) -> bool;

    fn stop_grace(&self) -> Duration;
}

/// Xray-family factory: builds instances from a prepared JSON document.
pub trait XrayCore: Send + Sync {
    fn name(&self) -> &str;

    fn validate(&self, config: &InjectedConfig) -> Result<(), RuntimeError>;

    fn create(&self, config: &InjectedConfig) -> Result<Box<dyn XrayInstance>, RuntimeError>;
}

/// A constructed, not yet started Xray instance.
pub trait XrayInstance: Send {
    fn start(&mut self) -> Result<(), RuntimeError>;

    fn is_alive(&mut self) -> bool {
        true
    }

    fn close(&mut self) -> Result<(), RuntimeError>;
}

/// A Mihomo document checked by [`MihomoHub::parse`], ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MihomoProfile {
    pub document: Vec<u8>,
    pub home: PathBuf,
    pub ports: ControlPorts,
    pub log_level: String,
}

/// Mihomo-family hub. The hub is process-global: `apply` replaces whatever
/// was applied before and returns the generation that now owns the hub.
pub trait MihomoHub: Send + Sync {
    fn name(&self) -> &str;

    fn parse(&self, config: &InjectedConfig, home: &Path) -> Result<MihomoProfile, RuntimeError>;

    fn apply(&self, profile: &MihomoProfile) -> Result<u64, RuntimeError>;

    /// Tear down `generation`. A generation that a later `apply` superseded
    /// is left alone.
    fn shutdown(&self, generation: u64) -> Result<(), RuntimeError>;

    fn is_alive(&self) -> bool;

    fn subscribe(&self) -> Subscription;

    fn unsubscribe(&self, id: u64);
}

/// Build one adapter per engine family for the named driver set.
pub fn select_backend(
    name: &str,
    config: &BackendConfig,
) -> Result<Vec<Arc<dyn EngineAdapter>>, RuntimeError> {
    let (xray, mihomo): (Arc<dyn XrayCore>, Arc<dyn MihomoHub>) = match name {
        "process" => (
            Arc::new(crate::process::XrayProcess::new(&config.xray_binary)),
            Arc::new(crate::process::MihomoProcess::new(&config.mihomo_binary)),
        ),
        "mock" => (
            Arc::new(crate::mock::MockXrayCore::new()),
            Arc::new(crate::mock::MockMihomoHub::new()),
        ),
        other => return Err(RuntimeError::BackendUnavailable(other.to_owned())),
    };
    Ok(vec![
        Arc::new(crate::xray::XrayAdapter::new(
            xray,
            config.options(EngineType::Xray),
        )),
        Arc::new(crate::mihomo::MihomoAdapter::new(
            mihomo,
            config.options(EngineType::Mihomo),
        )),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_valid_backends() {
        for name in BACKENDS {
            let adapters = select_backend(name, &BackendConfig::default()).unwrap();
            let engines: Vec<EngineType> = adapters.iter().map(|a| a.engine()).collect();
            assert_eq!(engines, EngineType::ALL);
            assert!(adapters.iter().all(|a| a.driver() == *name));
        }
    }

    #[test]
    fn select_invalid_backend_fails() {
        assert!(matches!(
            select_backend("docker", &BackendConfig::default()),
            Err(RuntimeError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn stop_grace_follows_engine_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.options(EngineType::Xray).stop_grace, Duration::from_secs(2));
        assert_eq!(config.options(EngineType::Mihomo).stop_grace, Duration::from_secs(3));
        assert_eq!(
            AdapterOptions::for_engine(EngineType::Mihomo),
            config.options(EngineType::Mihomo)
        );
    }
}

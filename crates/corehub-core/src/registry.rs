//! Process-wide engine registry.
//!
//! Holds one adapter per engine family. Managers share a registry through an
//! `Arc`, so two managers can never run two instances of the same family.

use crate::settings::ManagerSettings;
use crate::CoreError;
use corehub_runtime::{select_backend, BackendConfig, EngineAdapter, RuntimeError};
use corehub_schema::EngineType;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

pub struct EngineRegistry {
    backend: String,
    adapters: HashMap<EngineType, Arc<dyn EngineAdapter>>,
}

impl EngineRegistry {
    /// Later adapters replace earlier ones for the same family.
    pub fn new(backend: &str, adapters: Vec<Arc<dyn EngineAdapter>>) -> Self {
        Self {
            backend: backend.to_owned(),
            adapters: adapters.into_iter().map(|a| (a.engine(), a)).collect(),
        }
    }

    pub fn with_backend(name: &str, config: &BackendConfig) -> Result<Self, CoreError> {
        let adapters = select_backend(name, config).map_err(|e| match e {
            RuntimeError::BackendUnavailable(name) => {
                CoreError::Settings(format!("unknown backend '{name}'"))
            }
            other => CoreError::Settings(other.to_string()),
        })?;
        info!("engine registry initialised with the {name} backend");
        Ok(Self::new(name, adapters))
    }

    pub fn from_settings(settings: &ManagerSettings) -> Result<Self, CoreError> {
        Self::with_backend(&settings.backend, &settings.backend_config())
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn adapter(&self, engine: EngineType) -> Result<Arc<dyn EngineAdapter>, CoreError> {
        self.adapters
            .get(&engine)
            .cloned()
            .ok_or(CoreError::EngineUnavailable(engine))
    }

    /// Registered families in declaration order.
    pub fn engines(&self) -> Vec<EngineType> {
        EngineType::ALL
            .into_iter()
            .filter(|e| self.adapters.contains_key(e))
            .collect()
    }

    pub fn is_any_running(&self) -> bool {
        self.adapters.values().any(|a| a.is_running())
    }

    /// Stop every adapter. Failures are logged, never returned.
    pub fn shutdown(&self) {
        for engine in self.engines() {
            if let Some(adapter) = self.adapters.get(&engine) {
                if let Err(e) = adapter.stop() {
                    warn!("failed to stop {engine} during shutdown: {e}");
                }
            }
        }
        info!("engine registry shut down");
    }
}

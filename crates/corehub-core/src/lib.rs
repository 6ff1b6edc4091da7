//! Lifecycle orchestration for corehub.
//!
//! This crate ties the schema and runtime layers together into the
//! `LifecycleManager`: the state machine that detects which engine a
//! configuration targets, injects the control plane, and moves between
//! stopped and running engines while at most one instance is live. It also
//! provides the process-wide `EngineRegistry`, file-backed settings, the
//! cross-process home lock, and signal handling.

pub mod concurrency;
pub mod lifecycle;
pub mod manager;
pub mod ports;
pub mod registry;
pub mod settings;

pub use concurrency::{install_signal_handler, shutdown_requested, HomeLock};
pub use lifecycle::{validate_transition, ManagerState};
pub use manager::{LifecycleManager, ManagerStats};
pub use ports::{fallback_port, resolve_ports};
pub use registry::EngineRegistry;
pub use settings::ManagerSettings;

use corehub_runtime::RuntimeError;
use corehub_schema::{EngineType, SchemaError};
use std::path::PathBuf;
use thiserror::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read config file {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    ConfigParse(String),
    #[error("unknown engine type: {0}")]
    UnknownEngineType(String),
    #[error("unable to detect engine type from configuration")]
    UndetectableConfig,
    #[error("invalid wrapper format: {0}")]
    InvalidWrapperFormat(String),
    #[error("invalid port: {0}")]
    InvalidPortRange(String),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
    #[error("failed to start {engine}: {source}")]
    EngineStart {
        engine: EngineType,
        source: RuntimeError,
    },
    #[error("failed to stop {engine}: {source}")]
    EngineStop {
        engine: EngineType,
        source: RuntimeError,
    },
    #[error("{engine} rejected the config: {source}")]
    EngineValidation {
        engine: EngineType,
        source: RuntimeError,
    },
    #[error("{0} is already running")]
    AlreadyRunning(EngineType),
    #[error("no engine is running")]
    NotRunning,
    #[error("no adapter registered for {0}")]
    EngineUnavailable(EngineType),
    #[error("settings error: {0}")]
    Settings(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<SchemaError> for CoreError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::Read { path, source } => CoreError::ConfigRead { path, source },
            SchemaError::Parse(msg) | SchemaError::Render(msg) => CoreError::ConfigParse(msg),
            SchemaError::UnknownEngineType(name) => CoreError::UnknownEngineType(name),
            SchemaError::UndetectableConfig => CoreError::UndetectableConfig,
            SchemaError::InvalidWrapperFormat(msg) => CoreError::InvalidWrapperFormat(msg),
            SchemaError::InvalidPort(msg) => CoreError::InvalidPortRange(msg),
        }
    }
}

impl CoreError {
    /// Errors caused by the document itself rather than by an engine.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            CoreError::ConfigRead { .. }
                | CoreError::ConfigParse(_)
                | CoreError::UnknownEngineType(_)
                | CoreError::UndetectableConfig
                | CoreError::InvalidWrapperFormat(_)
                | CoreError::EngineValidation { .. }
        )
    }
}

//! Engine execution layer for corehub.
//!
//! This crate drives one concrete proxy engine instance at a time per family:
//! the `EngineAdapter` trait the lifecycle manager talks to, the background
//! instance thread bound to a `CancellationToken` (`InstanceSlot`), the
//! Xray and Mihomo adapters, child-process drivers for the real engine
//! binaries, in-process mock drivers, and the Mihomo log event bus.

pub mod backend;
pub mod cancel;
pub mod logbus;
pub mod mihomo;
pub mod mock;
pub mod process;
pub mod slot;
pub mod xray;

pub use backend::{
    select_backend, AdapterOptions, BackendConfig, EngineAdapter, MihomoHub, MihomoProfile,
    XrayCore, XrayInstance, BACKENDS, DEFAULT_MIHOMO_STOP_GRACE, DEFAULT_STARTUP_TIMEOUT,
    DEFAULT_XRAY_STOP_GRACE,
};
pub use cancel::CancellationToken;
pub use logbus::{LogBus, LogEvent, LogForwarder, LogLevel, Subscription};
pub use mihomo::MihomoAdapter;
pub use slot::{InstanceSlot, StartupReporter};
pub use xray::XrayAdapter;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend '{0}' is not available")]
    BackendUnavailable(String),
    #[error("engine binary '{0}' could not be launched")]
    EngineUnavailable(String),
    #[error("{0} instance is already running")]
    AlreadyRunning(String),
    #[error("config rejected: {0}")]
    Validation(String),
    #[error("engine failed to start: {0}")]
    StartFailed(String),
    #[error("{0} instance did not exit within its stop grace period")]
    StopTimedOut(String),
    #[error("engine thread panicked: {0}")]
    Panicked(String),
    #[error("engine process error: {0}")]
    ExecFailed(String),
}

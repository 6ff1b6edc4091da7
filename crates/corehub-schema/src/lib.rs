//! Configuration documents, engine detection, and control-plane injection for corehub.
//!
//! This crate defines the schema layer: the closed `EngineType` set and its
//! aliases, JSON/YAML document parsing with wrapper unwrapping, structural
//! engine detection (`detect`), and the per-family `ConfigInjector`s that
//! merge the supervisor's listeners and API endpoint into a caller document
//! (`XrayInjector`, `MihomoInjector`).

pub mod detect;
pub mod document;
pub mod inject;
pub mod mihomo;
pub mod types;
pub mod xray;

pub use detect::{detect, detect_str, detect_unwrapped, Detection, DetectionSource};
pub use document::{
    parse_document, port_from_host_spec, read_config_file, unwrap_document, Document, Unwrapped,
    DISCRIMINATOR_KEY, WRAPPER_KEY,
};
pub use inject::{injector_for, ConfigInjector, InjectParams, InjectedConfig};
pub use mihomo::MihomoInjector;
pub use types::{
    ConfigFormat, ControlPorts, EngineType, EngineVariant, DEFAULT_API_PORT, DEFAULT_HTTP_PORT,
    DEFAULT_SOCKS_PORT,
};
pub use xray::XrayInjector;

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("unknown engine type: {0}")]
    UnknownEngineType(String),
    #[error("unable to detect engine type from configuration")]
    UndetectableConfig,
    #[error("invalid wrapper format: {0}")]
    InvalidWrapperFormat(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("failed to render config: {0}")]
    Render(String),
}

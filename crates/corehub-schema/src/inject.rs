//! Control-plane injection shared by both engine families.
//!
//! An injector turns a caller document into an [`InjectedConfig`]: the
//! wrapper is peeled off, the manager's listeners and API endpoint are merged
//! in, and the result is rendered in the engine's native format. Entries the
//! manager owns are found again by tag, so preparing an already prepared
//! document changes nothing.

use crate::document::{
    parse_document, port_from_host_spec, port_value, unwrap_document, value_kind, Document,
    Unwrapped,
};
use crate::mihomo::MihomoInjector;
use crate::types::{ConfigFormat, ControlPorts, EngineType};
use crate::xray::XrayInjector;
use crate::SchemaError;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Loopback address every injected listener binds to.
pub const LOOPBACK: &str = "127.0.0.1";

/// Host-level key carrying the mixed/SOCKS listener port.
pub const MIXED_PORT_KEY: &str = "mixed-port";
/// Host-level key carrying the control API endpoint as `host:port`.
pub const CONTROLLER_KEY: &str = "external-controller";
/// Host-level key naming the file engine logs are forwarded to.
pub const LOG_FILE_KEY: &str = "log-file";

/// Runtime parameters merged into every prepared document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectParams {
    pub socks_port: u16,
    pub api_port: u16,
    pub asset_dir: Option<PathBuf>,
    pub log_level: String,
}

impl InjectParams {
    pub fn new(socks_port: u16, api_port: u16) -> Self {
        Self {
            socks_port,
            api_port,
            asset_dir: None,
            log_level: "info".to_owned(),
        }
    }

    fn validate(&self) -> Result<(), SchemaError> {
        if self.socks_port == 0 {
            return Err(SchemaError::InvalidPort(format!(
                "socks port {}",
                self.socks_port
            )));
        }
        if self.api_port == 0 {
            return Err(SchemaError::InvalidPort(format!(
                "api port {}",
                self.api_port
            )));
        }
        if self.socks_port == self.api_port {
            return Err(SchemaError::InvalidPort(format!(
                "socks and api ports must differ (both {})",
                self.socks_port
            )));
        }
        Ok(())
    }
}

/// A finalized, directly loadable engine document. Lives only in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedConfig {
    pub engine: EngineType,
    pub format: ConfigFormat,
    pub bytes: Vec<u8>,
    pub ports: ControlPorts,
    pub log_file: Option<PathBuf>,
    pub asset_dir: Option<PathBuf>,
    pub log_level: String,
}

impl InjectedConfig {
    /// The document as text; prepared documents are always UTF-8.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or_default()
    }

    pub fn socks_port(&self) -> u16 {
        self.ports.socks.unwrap_or_default()
    }

    pub fn api_port(&self) -> u16 {
        self.ports.api.unwrap_or_default()
    }
}

pub trait ConfigInjector: Send + Sync {
    fn engine(&self) -> EngineType;

    /// Merge the control-plane fields into an unwrapped engine body.
    /// `log_file` is the path reported by [`ConfigInjector::log_file`].
    fn inject(
        &self,
        body: &mut Document,
        params: &InjectParams,
        log_file: Option<&Path>,
    ) -> Result<(), SchemaError>;

    /// Ports the caller's document asks for, if any. A port key that is
    /// present but unusable is an error, never a silent fallback.
    fn extract_ports(&self, unwrapped: &Unwrapped) -> Result<ControlPorts, SchemaError>;

    /// Log file the engine output should be forwarded to, if any.
    fn log_file(&self, unwrapped: &Unwrapped) -> Option<PathBuf>;

    fn render(&self, body: &Document) -> Result<Vec<u8>, SchemaError>;

    fn prepare(&self, raw: &[u8], params: &InjectParams) -> Result<InjectedConfig, SchemaError> {
        let (doc, _) = parse_document(raw)?;
        self.prepare_unwrapped(unwrap_document(doc)?, params)
    }

    fn prepare_unwrapped(
        &self,
        unwrapped: Unwrapped,
        params: &InjectParams,
    ) -> Result<InjectedConfig, SchemaError> {
        params.validate()?;

        let log_file = self.log_file(&unwrapped);
        match &log_file {
            Some(path) => debug!("{} log file: {}", self.engine(), path.display()),
            None => warn!(
                "no log file configured for {}; engine output will not be forwarded",
                self.engine()
            ),
        }

        let mut body = unwrapped.body;
        self.inject(&mut body, params, log_file.as_deref())?;
        let bytes = self.render(&body)?;
        debug!(
            "prepared {} config: socks={} api={} ({} bytes)",
            self.engine(),
            params.socks_port,
            params.api_port,
            bytes.len()
        );

        Ok(InjectedConfig {
            engine: self.engine(),
            format: self.engine().config_format(),
            bytes,
            ports: ControlPorts::new(params.socks_port, params.api_port),
            log_file,
            asset_dir: params.asset_dir.clone(),
            log_level: params.log_level.clone(),
        })
    }
}

static XRAY: XrayInjector = XrayInjector;
static MIHOMO: MihomoInjector = MihomoInjector;

pub fn injector_for(engine: EngineType) -> &'static dyn ConfigInjector {
    match engine {
        EngineType::Xray => &XRAY,
        EngineType::Mihomo => &MIHOMO,
    }
}

/// Host-level control ports: the body wins over wrapper-level keys.
pub(crate) fn host_ports(unwrapped: &Unwrapped) -> Result<ControlPorts, SchemaError> {
    let lookup = |key: &str| {
        unwrapped
            .body
            .get(key)
            .or_else(|| unwrapped.envelope.get(key))
    };
    let socks = match lookup(MIXED_PORT_KEY) {
        Some(value) => port_value(MIXED_PORT_KEY, value)?,
        None => None,
    };
    let api = match lookup(CONTROLLER_KEY) {
        None | Some(Value::Null) => None,
        Some(Value::String(spec)) if spec.trim().is_empty() => None,
        Some(Value::String(spec)) => Some(port_from_host_spec(CONTROLLER_KEY, spec)?),
        Some(other) => {
            return Err(SchemaError::InvalidPort(format!(
                "'{CONTROLLER_KEY}' is {}, expected host:port",
                value_kind(other)
            )))
        }
    };
    Ok(ControlPorts { socks, api })
}

pub(crate) fn host_log_file(unwrapped: &Unwrapped) -> Option<PathBuf> {
    let value = unwrapped
        .body
        .get(LOG_FILE_KEY)
        .or_else(|| unwrapped.envelope.get(LOG_FILE_KEY))?;
    match value.as_str() {
        Some(path) if !path.trim().is_empty() => Some(PathBuf::from(path.trim())),
        Some(_) => None,
        None => {
            warn!("'{LOG_FILE_KEY}' is {}, expected a path", value_kind(value));
            None
        }
    }
}

/// Borrow `key` as a sequence, creating it when absent.
pub(crate) fn ensure_array<'a>(
    doc: &'a mut Document,
    key: &str,
) -> Result<&'a mut Vec<Value>, SchemaError> {
    let slot = doc
        .entry(key.to_owned())
        .or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    let kind = value_kind(slot);
    slot.as_array_mut()
        .ok_or_else(|| SchemaError::Parse(format!("'{key}' must be a sequence, found {kind}")))
}

/// Borrow `key` as a mapping, creating it when absent.
pub(crate) fn ensure_object<'a>(
    doc: &'a mut Document,
    key: &str,
) -> Result<&'a mut Document, SchemaError> {
    let slot = doc
        .entry(key.to_owned())
        .or_insert_with(|| Value::Object(Document::new()));
    if slot.is_null() {
        *slot = Value::Object(Document::new());
    }
    let kind = value_kind(slot);
    slot.as_object_mut()
        .ok_or_else(|| SchemaError::Parse(format!("'{key}' must be a mapping, found {kind}")))
}

pub(crate) fn find_tagged(list: &[Value], tag: &str) -> Option<usize> {
    list.iter()
        .position(|v| v.get("tag").and_then(Value::as_str) == Some(tag))
}

/// Replace the entry carrying `tag` in place, or insert it at `front_index`
/// (`None` appends).
pub(crate) fn upsert_tagged(
    list: &mut Vec<Value>,
    tag: &str,
    entry: Value,
    front_index: Option<usize>,
) {
    match find_tagged(list, tag) {
        Some(i) => list[i] = entry,
        None => match front_index {
            Some(i) => list.insert(i.min(list.len()), entry),
            None => list.push(entry),
        },
    }
}

pub(crate) fn set_default(doc: &mut Document, key: &str, value: Value) {
    let slot = doc.entry(key.to_owned()).or_insert(Value::Null);
    if slot.is_null() {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn unwrapped(value: Value) -> Unwrapped {
        unwrap_document(value.as_object().unwrap().clone()).unwrap()
    }

    #[test]
    fn params_reject_zero_and_equal_ports() {
        let injector = injector_for(EngineType::Mihomo);
        let raw = b"mode: rule\n";
        assert!(matches!(
            injector.prepare(raw, &InjectParams::new(0, 9090)),
            Err(SchemaError::InvalidPort(_))
        ));
        assert!(matches!(
            injector.prepare(raw, &InjectParams::new(9090, 9090)),
            Err(SchemaError::InvalidPort(_))
        ));
    }

    #[test]
    fn host_ports_prefer_body_over_envelope() {
        let u = unwrapped(json!({
            "mixed-port": 1000,
            "external-controller": "127.0.0.1:2000",
            "coreConfig": {"mixed-port": 3000}
        }));
        let ports = host_ports(&u).unwrap();
        assert_eq!(ports.socks, Some(3000));
        assert_eq!(ports.api, Some(2000));
    }

    #[test]
    fn unusable_host_ports_are_rejected() {
        for doc in [
            json!({"mixed-port": 70000}),
            json!({"mixed-port": "abc"}),
            json!({"external-controller": "127.0.0.1:0"}),
            json!({"external-controller": 9090}),
        ] {
            assert!(
                matches!(host_ports(&unwrapped(doc.clone())), Err(SchemaError::InvalidPort(_))),
                "{doc}"
            );
        }
        let unset = host_ports(&unwrapped(json!({"mixed-port": null, "external-controller": ""})));
        assert_eq!(unset.unwrap(), ControlPorts::default());
    }

    #[test]
    fn log_file_is_optional() {
        assert_eq!(host_log_file(&unwrapped(json!({"mode": "rule"}))), None);
        assert_eq!(
            host_log_file(&unwrapped(json!({"log-file": "/tmp/core.log"}))),
            Some(PathBuf::from("/tmp/core.log"))
        );
        assert_eq!(host_log_file(&unwrapped(json!({"log-file": 5}))), None);
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut list = vec![json!({"tag": "a", "v": 1}), json!({"tag": "b"})];
        upsert_tagged(&mut list, "a", json!({"tag": "a", "v": 2}), Some(0));
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["v"], json!(2));

        upsert_tagged(&mut list, "c", json!({"tag": "c"}), None);
        assert_eq!(list[2]["tag"], json!("c"));
    }

    #[test]
    fn ensure_array_rejects_wrong_shape() {
        let mut doc = json!({"inbounds": {"not": "a list"}})
            .as_object()
            .unwrap()
            .clone();
        assert!(matches!(
            ensure_array(&mut doc, "inbounds"),
            Err(SchemaError::Parse(_))
        ));
    }
}

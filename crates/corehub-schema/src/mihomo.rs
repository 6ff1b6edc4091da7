//! Mihomo (Clash.Meta) control-plane injection.

use crate::document::{Document, Unwrapped};
use crate::inject::{
    host_log_file, host_ports, set_default, ConfigInjector, InjectParams, CONTROLLER_KEY,
    LOOPBACK, MIXED_PORT_KEY,
};
use crate::types::{ControlPorts, EngineType};
use crate::SchemaError;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, Default)]
pub struct MihomoInjector;

impl ConfigInjector for MihomoInjector {
    fn engine(&self) -> EngineType {
        EngineType::Mihomo
    }

    fn inject(
        &self,
        body: &mut Document,
        params: &InjectParams,
        _log_file: Option<&Path>,
    ) -> Result<(), SchemaError> {
        // The listener and controller are mandatory for supervision.
        body.insert(MIXED_PORT_KEY.to_owned(), json!(params.socks_port));
        body.insert(
            CONTROLLER_KEY.to_owned(),
            Value::String(format!("{LOOPBACK}:{}", params.api_port)),
        );

        set_default(body, "allow-lan", Value::Bool(false));
        set_default(body, "bind-address", Value::String(LOOPBACK.to_owned()));
        set_default(body, "mode", Value::String("rule".to_owned()));
        set_default(
            body,
            "log-level",
            Value::String(mihomo_log_level(&params.log_level)),
        );
        set_default(body, "proxies", json!([]));
        set_default(body, "proxy-groups", json!([]));
        set_default(body, "rules", json!(["MATCH,DIRECT"]));
        Ok(())
    }

    fn extract_ports(&self, unwrapped: &Unwrapped) -> Result<ControlPorts, SchemaError> {
        host_ports(unwrapped)
    }

    fn log_file(&self, unwrapped: &Unwrapped) -> Option<PathBuf> {
        host_log_file(unwrapped)
    }

    fn render(&self, body: &Document) -> Result<Vec<u8>, SchemaError> {
        serde_yaml::to_string(body)
            .map(String::into_bytes)
            .map_err(|e| SchemaError::Render(e.to_string()))
    }
}

fn mihomo_log_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" | "trace" => "debug",
        "warn" | "warning" => "warning",
        "error" => "error",
        "silent" | "none" | "off" => "silent",
        _ => "info",
    }
    .to_owned()
}

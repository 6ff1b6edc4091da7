//! Xray/V2Ray control-plane injection.

use crate::document::{port_value, Document, Unwrapped};
use crate::inject::{
    ensure_array, ensure_object, find_tagged, host_log_file, host_ports, set_default,
    upsert_tagged, ConfigInjector, InjectParams, CONTROLLER_KEY, LOG_FILE_KEY, LOOPBACK,
    MIXED_PORT_KEY,
};
use crate::types::{ControlPorts, EngineType};
use crate::SchemaError;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

/// Tag of the injected loopback SOCKS inbound.
pub const SOCKS_INBOUND_TAG: &str = "corehub-socks";
/// Tag of the injected dokodemo-door inbound serving the API.
pub const API_INBOUND_TAG: &str = "corehub-api";
/// Tag of the API handler and its blackhole outbound.
pub const API_TAG: &str = "api";

const API_SERVICES: &[&str] = &["HandlerService", "LoggerService", "StatsService"];
const DEFAULT_DNS_SERVERS: &[&str] = &["1.1.1.1", "8.8.8.8"];

#[derive(Debug, Clone, Copy, Default)]
pub struct XrayInjector;

impl ConfigInjector for XrayInjector {
    fn engine(&self) -> EngineType {
        EngineType::Xray
    }

    fn inject(
        &self,
        body: &mut Document,
        params: &InjectParams,
        log_file: Option<&Path>,
    ) -> Result<(), SchemaError> {
        // Host-level keys are meaningless to Xray; the log file becomes the error log.
        body.remove(MIXED_PORT_KEY);
        body.remove(CONTROLLER_KEY);
        body.remove(LOG_FILE_KEY);
        if let Some(path) = log_file {
            let log = ensure_object(body, "log")?;
            log.insert(
                "error".to_owned(),
                Value::String(path.to_string_lossy().into_owned()),
            );
        }

        inject_inbounds(body, params)?;
        inject_api(body)?;
        set_default(body, "stats", json!({}));
        inject_policy(body)?;
        inject_routing(body)?;
        inject_outbounds(body)?;
        set_default(body, "dns", json!({ "servers": DEFAULT_DNS_SERVERS }));

        let log = ensure_object(body, "log")?;
        set_default(log, "loglevel", Value::String(xray_log_level(&params.log_level)));
        Ok(())
    }

    fn extract_ports(&self, unwrapped: &Unwrapped) -> Result<ControlPorts, SchemaError> {
        let host = host_ports(unwrapped)?;
        let inbound_port = |tag: &str| -> Result<Option<u16>, SchemaError> {
            let Some(inbounds) = unwrapped.body.get("inbounds").and_then(Value::as_array) else {
                return Ok(None);
            };
            match find_tagged(inbounds, tag).and_then(|i| inbounds[i].get("port")) {
                Some(value) => port_value(&format!("{tag} inbound port"), value),
                None => Ok(None),
            }
        };
        Ok(ControlPorts {
            socks: match host.socks {
                Some(port) => Some(port),
                None => inbound_port(SOCKS_INBOUND_TAG)?,
            },
            api: match host.api {
                Some(port) => Some(port),
                None => inbound_port(API_INBOUND_TAG)?,
            },
        })
    }

    fn log_file(&self, unwrapped: &Unwrapped) -> Option<PathBuf> {
        host_log_file(unwrapped).or_else(|| {
            unwrapped
                .body
                .get("log")
                .and_then(|log| log.get("error"))
                .and_then(Value::as_str)
                .filter(|p| !p.trim().is_empty() && *p != "none")
                .map(PathBuf::from)
        })
    }

    fn render(&self, body: &Document) -> Result<Vec<u8>, SchemaError> {
        serde_json::to_vec_pretty(body).map_err(|e| SchemaError::Render(e.to_string()))
    }
}

fn inject_inbounds(body: &mut Document, params: &InjectParams) -> Result<(), SchemaError> {
    let inbounds = ensure_array(body, "inbounds")?;
    let socks = json!({
        "tag": SOCKS_INBOUND_TAG,
        "port": params.socks_port,
        "listen": LOOPBACK,
        "protocol": "socks",
        "settings": { "udp": true, "ip": LOOPBACK, "userLevel": 0 },
    });
    let api = json!({
        "tag": API_INBOUND_TAG,
        "port": params.api_port,
        "listen": LOOPBACK,
        "protocol": "dokodemo-door",
        "settings": { "address": LOOPBACK },
    });
    // Inserting socks then api at the head yields [api, socks, caller...].
    upsert_tagged(inbounds, SOCKS_INBOUND_TAG, socks, Some(0));
    upsert_tagged(inbounds, API_INBOUND_TAG, api, Some(0));
    Ok(())
}

fn inject_api(body: &mut Document) -> Result<(), SchemaError> {
    let api = ensure_object(body, "api")?;
    api.insert("tag".to_owned(), Value::String(API_TAG.to_owned()));
    let services = ensure_array(api, "services")?;
    for service in API_SERVICES {
        if !services.iter().any(|s| s.as_str() == Some(service)) {
            services.push(Value::String((*service).to_owned()));
        }
    }
    Ok(())
}

fn inject_policy(body: &mut Document) -> Result<(), SchemaError> {
    let policy = ensure_object(body, "policy")?;
    let system = ensure_object(policy, "system")?;
    system.insert("statsInboundUplink".to_owned(), Value::Bool(true));
    system.insert("statsInboundDownlink".to_owned(), Value::Bool(true));
    Ok(())
}

fn is_api_rule(rule: &Value) -> bool {
    rule.get("outboundTag").and_then(Value::as_str) == Some(API_TAG)
        && rule
            .get("inboundTag")
            .and_then(Value::as_array)
            .is_some_and(|tags| tags.iter().any(|t| t.as_str() == Some(API_INBOUND_TAG)))
}

fn inject_routing(body: &mut Document) -> Result<(), SchemaError> {
    let routing = ensure_object(body, "routing")?;
    let rules = ensure_array(routing, "rules")?;
    let api_rule = json!({
        "type": "field",
        "inboundTag": [API_INBOUND_TAG],
        "outboundTag": API_TAG,
    });
    match rules.iter().position(is_api_rule) {
        Some(i) => rules[i] = api_rule,
        None => rules.insert(0, api_rule),
    }
    Ok(())
}

fn inject_outbounds(body: &mut Document) -> Result<(), SchemaError> {
    let outbounds = ensure_array(body, "outbounds")?;
    let has_route = outbounds
        .iter()
        .any(|o| o.get("tag").and_then(Value::as_str) != Some(API_TAG));
    if !has_route {
        outbounds.insert(0, json!({ "tag": "direct", "protocol": "freedom" }));
    }
    upsert_tagged(
        outbounds,
        API_TAG,
        json!({ "tag": API_TAG, "protocol": "blackhole" }),
        None,
    );
    Ok(())
}

fn xray_log_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "debug" | "trace" => "debug",
        "warn" | "warning" => "warning",
        "error" => "error",
        "silent" | "none" | "off" => "none",
        _ => "info",
    }
    .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::parse_document;

    fn params() -> InjectParams {
        InjectParams {
            socks_port: 20808,
            api_port: 20809,
            asset_dir: None,
            log_level: "warn".to_owned(),
        }
    }

    fn prepared(raw: &str) -> Document {
        let out = XrayInjector.prepare(raw.as_bytes(), &params()).unwrap();
        parse_document(&out.bytes).unwrap().0
    }

    #[test]
    fn minimal_document_gets_full_scaffolding() {
        let doc = prepared("{}");
        let inbounds = doc["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 2);
        assert_eq!(inbounds[0]["tag"], json!(API_INBOUND_TAG));
        assert_eq!(inbounds[0]["port"], json!(20809));
        assert_eq!(inbounds[1]["tag"], json!(SOCKS_INBOUND_TAG));
        assert_eq!(inbounds[1]["listen"], json!("127.0.0.1"));

        let outbounds = doc["outbounds"].as_array().unwrap();
        assert_eq!(outbounds[0]["protocol"], json!("freedom"));
        assert_eq!(outbounds[1]["tag"], json!("api"));

        assert_eq!(doc["routing"]["rules"][0]["outboundTag"], json!("api"));
        assert_eq!(doc["log"]["loglevel"], json!("warning"));
        assert!(doc.contains_key("stats"));
        assert!(doc.contains_key("dns"));
        assert_eq!(doc["policy"]["system"]["statsInboundUplink"], json!(true));
    }

    #[test]
    fn caller_fields_survive() {
        let doc = prepared(
            r#"{
                "log": {"loglevel": "debug", "access": "/tmp/a.log"},
                "inbounds": [{"tag": "user-http", "port": 8080, "protocol": "http"}],
                "outbounds": [{"tag": "proxy", "protocol": "vless"}],
                "routing": {"domainStrategy": "AsIs", "rules": [{"type": "field", "outboundTag": "proxy"}]},
                "dns": {"servers": ["9.9.9.9"]},
                "api": {"services": ["ReflectionService"]}
            }"#,
        );
        assert_eq!(doc["log"]["loglevel"], json!("debug"));
        assert_eq!(doc["log"]["access"], json!("/tmp/a.log"));
        assert_eq!(doc["dns"]["servers"], json!(["9.9.9.9"]));
        assert_eq!(doc["routing"]["domainStrategy"], json!("AsIs"));

        let inbounds = doc["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 3);
        assert_eq!(inbounds[2]["tag"], json!("user-http"));

        let outbounds = doc["outbounds"].as_array().unwrap();
        assert_eq!(outbounds[0]["tag"], json!("proxy"));
        assert_eq!(outbounds.len(), 2);

        let rules = doc["routing"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1]["outboundTag"], json!("proxy"));

        let services = doc["api"]["services"].as_array().unwrap();
        assert_eq!(services[0], json!("ReflectionService"));
        assert_eq!(services.len(), 4);
    }

    #[test]
    fn prepare_is_idempotent() {
        let raw = r#"{"coreType": "xray", "coreConfig": {
            "inbounds": [{"tag": "user", "port": 1, "protocol": "http"}],
            "outbounds": [{"tag": "proxy", "protocol": "vmess"}],
            "log-file": "/tmp/xray.log"
        }}"#;
        let once = XrayInjector.prepare(raw.as_bytes(), &params()).unwrap();
        let twice = XrayInjector.prepare(&once.bytes, &params()).unwrap();
        assert_eq!(once.bytes, twice.bytes);
        assert_eq!(once.log_file, twice.log_file);
    }

    #[test]
    fn host_keys_are_stripped_and_log_file_mapped() {
        let raw = r#"{"mixed-port": 7000, "external-controller": "127.0.0.1:7001",
                      "log-file": "/tmp/x.log", "inbounds": []}"#;
        let out = XrayInjector.prepare(raw.as_bytes(), &params()).unwrap();
        assert_eq!(out.log_file, Some(PathBuf::from("/tmp/x.log")));
        let doc = parse_document(&out.bytes).unwrap().0;
        assert!(!doc.contains_key("mixed-port"));
        assert!(!doc.contains_key("external-controller"));
        assert!(!doc.contains_key("log-file"));
        assert_eq!(doc["log"]["error"], json!("/tmp/x.log"));
    }

    #[test]
    fn wrapper_log_file_becomes_the_error_log() {
        let raw = r#"{"coreType": "xray", "log-file": "/tmp/wrapped.log",
                      "coreConfig": {"log": {"error": "/tmp/inner.log"}, "inbounds": []}}"#;
        let out = XrayInjector.prepare(raw.as_bytes(), &params()).unwrap();
        assert_eq!(out.log_file, Some(PathBuf::from("/tmp/wrapped.log")));
        let doc = parse_document(&out.bytes).unwrap().0;
        assert_eq!(doc["log"]["error"], json!("/tmp/wrapped.log"));
    }

    #[test]
    fn extracts_ports_from_host_keys_and_tagged_inbounds() {
        let (doc, _) =
            parse_document(br#"{"mixed-port": 7000, "external-controller": ":7001"}"#).unwrap();
        let u = crate::document::unwrap_document(doc).unwrap();
        assert_eq!(XrayInjector.extract_ports(&u).unwrap(), ControlPorts::new(7000, 7001));

        let out = XrayInjector.prepare(b"{}", &params()).unwrap();
        let (doc, _) = parse_document(&out.bytes).unwrap();
        let u = crate::document::unwrap_document(doc).unwrap();
        assert_eq!(XrayInjector.extract_ports(&u).unwrap(), ControlPorts::new(20808, 20809));
    }

    #[test]
    fn unusable_inbound_port_is_rejected() {
        let raw = br#"{"inbounds": [{"tag": "corehub-socks", "port": 0, "protocol": "socks"}]}"#;
        let (doc, _) = parse_document(raw).unwrap();
        let u = crate::document::unwrap_document(doc).unwrap();
        assert!(matches!(
            XrayInjector.extract_ports(&u),
            Err(SchemaError::InvalidPort(_))
        ));
    }

    #[test]
    fn reinjecting_with_new_ports_updates_in_place() {
        let once = XrayInjector.prepare(b"{}", &params()).unwrap();
        let moved = InjectParams {
            socks_port: 30000,
            api_port: 30001,
            ..params()
        };
        let out = XrayInjector.prepare(&once.bytes, &moved).unwrap();
        let doc = parse_document(&out.bytes).unwrap().0;
        let inbounds = doc["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 2);
        assert_eq!(inbounds[0]["port"], json!(30001));
        assert_eq!(inbounds[1]["port"], json!(30000));
    }

    #[test]
    fn wrong_shapes_are_reported() {
        let err = XrayInjector
            .prepare(br#"{"inbounds": "nope"}"#, &params())
            .unwrap_err();
        assert!(matches!(err, SchemaError::Parse(_)));
    }
}

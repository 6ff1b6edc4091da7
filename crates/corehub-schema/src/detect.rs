//! Engine detection for raw configuration documents.
//!
//! An explicit `coreType` discriminator always wins. Without one, the
//! document is classified by counting engine-specific top-level keys. The
//! Mihomo key set overlaps more with generic proxy configuration, so it needs
//! a stronger signal than the Xray set.

use crate::document::{parse_document, unwrap_document, Document, Unwrapped};
use crate::types::{EngineType, EngineVariant};
use crate::SchemaError;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

pub const XRAY_FIELDS: &[&str] = &[
    "inbounds", "outbounds", "routing", "log", "api", "dns", "policy",
];

pub const MIHOMO_FIELDS: &[&str] = &[
    "mixed-port",
    "port",
    "socks-port",
    "redir-port",
    "tproxy-port",
    "external-controller",
    "secret",
    "bind-address",
    "proxy-groups",
    "proxies",
    "rules",
    "rule-providers",
    "mode",
    "log-level",
    "ipv6",
    "allow-lan",
];

pub const XRAY_THRESHOLD: usize = 2;
pub const MIHOMO_THRESHOLD: usize = 3;

const XRAY_ONLY_PROTOCOLS: &[&str] = &["vless", "xtls", "reality"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetectionSource {
    /// Taken from the `coreType` discriminator.
    Explicit,
    /// Inferred from structural field heuristics.
    Heuristic,
    /// Undetectable document; the caller's previously chosen type was used.
    Pinned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Detection {
    pub engine: EngineType,
    pub variant: EngineVariant,
    pub source: DetectionSource,
}

/// Classify raw document text.
pub fn detect_str(input: &str) -> Result<Detection, SchemaError> {
    let (doc, _) = parse_document(input.as_bytes())?;
    detect(doc)
}

/// Classify a parsed document, unwrapping a wrapper first.
pub fn detect(doc: Document) -> Result<Detection, SchemaError> {
    detect_unwrapped(&unwrap_document(doc)?)
}

/// Classify an already unwrapped document.
pub fn detect_unwrapped(unwrapped: &Unwrapped) -> Result<Detection, SchemaError> {
    if let Some(raw) = unwrapped.discriminator.as_deref() {
        let variant = EngineVariant::parse(raw)?;
        debug!("engine taken from discriminator: {variant}");
        return Ok(Detection {
            engine: variant.engine(),
            variant,
            source: DetectionSource::Explicit,
        });
    }
    detect_body(&unwrapped.body)
}

/// Heuristic classification of an unwrapped engine body.
pub fn detect_body(body: &Document) -> Result<Detection, SchemaError> {
    let xray_hits = count_fields(body, XRAY_FIELDS);
    let mihomo_hits = count_fields(body, MIHOMO_FIELDS);
    debug!("detection field counts: xray={xray_hits} mihomo={mihomo_hits}");

    let xray_ok = xray_hits >= XRAY_THRESHOLD;
    let mihomo_ok = mihomo_hits >= MIHOMO_THRESHOLD;

    let engine = match (xray_ok, mihomo_ok) {
        (true, true) if mihomo_hits > xray_hits => EngineType::Mihomo,
        (true, _) => EngineType::Xray,
        (false, true) => EngineType::Mihomo,
        (false, false) => return Err(SchemaError::UndetectableConfig),
    };

    let variant = match engine {
        EngineType::Xray if uses_xray_only_features(body) => EngineVariant::Xray,
        EngineType::Xray => EngineVariant::V2Ray,
        EngineType::Mihomo => EngineVariant::Mihomo,
    };

    Ok(Detection {
        engine,
        variant,
        source: DetectionSource::Heuristic,
    })
}

fn count_fields(body: &Document, fields: &[&str]) -> usize {
    fields.iter().filter(|f| body.contains_key(**f)).count()
}

fn uses_xray_only_features(body: &Document) -> bool {
    let Some(Value::Array(outbounds)) = body.get("outbounds") else {
        return false;
    };
    outbounds.iter().filter_map(Value::as_object).any(|outbound| {
        let protocol_match = outbound
            .get("protocol")
            .and_then(Value::as_str)
            .map(str::to_ascii_lowercase)
            .is_some_and(|p| XRAY_ONLY_PROTOCOLS.iter().any(|x| p.contains(x)));
        let xtls_settings = outbound
            .get("settings")
            .and_then(Value::as_object)
            .is_some_and(|s| s.contains_key("xtlsSettings"));
        protocol_match || xtls_settings
    })
}

//! Raw configuration documents: JSON/YAML parsing and wrapper unwrapping.
//!
//! Both engine families are handled as a `serde_json` object tree. Mihomo
//! documents written in YAML are read into the same tree so detection and
//! injection only ever deal with one representation.

use crate::types::ConfigFormat;
use crate::SchemaError;
use serde_json::{Map, Value};
use std::path::Path;

/// Top-level key naming the engine a host-provided document targets.
pub const DISCRIMINATOR_KEY: &str = "coreType";
/// Top-level key under which a wrapper document embeds the real engine config.
pub const WRAPPER_KEY: &str = "coreConfig";

pub type Document = Map<String, Value>;

/// A document with its wrapper (if any) peeled off.
#[derive(Debug, Clone, PartialEq)]
pub struct Unwrapped {
    /// Raw discriminator value, untrimmed.
    pub discriminator: Option<String>,
    /// The engine configuration proper.
    pub body: Document,
    /// Remaining wrapper-level keys (empty for bare documents).
    pub envelope: Document,
    pub wrapped: bool,
}

pub fn read_config_file(path: &Path) -> Result<Vec<u8>, SchemaError> {
    std::fs::read(path).map_err(|source| SchemaError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse a JSON or YAML document whose top level must be a mapping.
///
/// Input starting with `{` is parsed strictly as JSON; everything else goes
/// through the YAML parser.
pub fn parse_document(input: &[u8]) -> Result<(Document, ConfigFormat), SchemaError> {
    let text = std::str::from_utf8(input)
        .map_err(|e| SchemaError::Parse(format!("document is not valid UTF-8: {e}")))?;
    let trimmed = text.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return Err(SchemaError::Parse("document is empty".to_owned()));
    }

    let (value, format) = if trimmed.starts_with('{') {
        let value: Value = serde_json::from_str(trimmed)
            .map_err(|e| SchemaError::Parse(format!("invalid JSON: {e}")))?;
        (value, ConfigFormat::Json)
    } else {
        let value: Value = serde_yaml::from_str(trimmed)
            .map_err(|e| SchemaError::Parse(format!("invalid YAML: {e}")))?;
        (value, ConfigFormat::Yaml)
    };

    match value {
        Value::Object(map) => Ok((map, format)),
        other => Err(SchemaError::Parse(format!(
            "top-level document must be a mapping, found {}",
            value_kind(&other)
        ))),
    }
}

/// Split a wrapper document into discriminator, engine body and envelope.
///
/// Bare documents come back with the discriminator removed and an empty
/// envelope.
pub fn unwrap_document(mut doc: Document) -> Result<Unwrapped, SchemaError> {
    let discriminator = take_discriminator(&mut doc)?;

    let Some(inner) = doc.remove(WRAPPER_KEY) else {
        return Ok(Unwrapped {
            discriminator,
            body: doc,
            envelope: Document::new(),
            wrapped: false,
        });
    };

    let mut body = match inner {
        Value::Object(map) => map,
        Value::String(nested) => match parse_document(nested.as_bytes()) {
            Ok((map, _)) => map,
            Err(e) => {
                return Err(SchemaError::InvalidWrapperFormat(format!(
                    "'{WRAPPER_KEY}' string is not a parseable document: {e}"
                )))
            }
        },
        other => {
            return Err(SchemaError::InvalidWrapperFormat(format!(
                "'{WRAPPER_KEY}' must be a mapping or a document string, found {}",
                value_kind(&other)
            )))
        }
    };

    // An inner discriminator only counts when the wrapper carries none.
    let inner_discriminator = take_discriminator(&mut body)?;

    Ok(Unwrapped {
        discriminator: discriminator.or(inner_discriminator),
        body,
        envelope: doc,
        wrapped: true,
    })
}

fn take_discriminator(doc: &mut Document) -> Result<Option<String>, SchemaError> {
    match doc.remove(DISCRIMINATOR_KEY) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(SchemaError::UnknownEngineType(other.to_string())),
    }
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

fn checked_port(key: &str, raw: &str) -> Result<u16, SchemaError> {
    match raw.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(SchemaError::InvalidPort(format!(
            "'{key}' must be a port in 1..=65535, got '{}'",
            raw.trim()
        ))),
        Ok(p) => Ok(p),
    }
}

/// Parse the port out of a `host:port` spec such as `127.0.0.1:9090` or `:9090`.
pub fn port_from_host_spec(key: &str, spec: &str) -> Result<u16, SchemaError> {
    let (_, port) = spec.trim().rsplit_once(':').ok_or_else(|| {
        SchemaError::InvalidPort(format!("'{key}' has no port: '{}'", spec.trim()))
    })?;
    checked_port(key, port)
}

/// Read a port stored either as a number or a numeric string. `null` means
/// unset; any other value must be a port in 1..=65535.
pub(crate) fn port_value(key: &str, value: &Value) -> Result<Option<u16>, SchemaError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => checked_port(key, &n.to_string()).map(Some),
        Value::String(s) => checked_port(key, s).map(Some),
        other => Err(SchemaError::InvalidPort(format!(
            "'{key}' is {}, expected a port",
            value_kind(other)
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_json_object() {
        let (doc, format) = parse_document(br#"{"log": {"loglevel": "warning"}}"#).unwrap();
        assert_eq!(format, ConfigFormat::Json);
        assert!(doc.contains_key("log"));
    }

    #[test]
    fn parses_yaml_mapping() {
        let input = b"mixed-port: 7890\nmode: rule\nrules:\n  - MATCH,DIRECT\n";
        let (doc, format) = parse_document(input).unwrap();
        assert_eq!(format, ConfigFormat::Yaml);
        assert_eq!(doc["mixed-port"], json!(7890));
        assert_eq!(doc["rules"], json!(["MATCH,DIRECT"]));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = parse_document(br#"{"inbounds": [}"#).unwrap_err();
        assert!(matches!(err, SchemaError::Parse(_)));
    }

    #[test]
    fn scalar_top_level_is_rejected() {
        assert!(matches!(
            parse_document(b"just a string").unwrap_err(),
            SchemaError::Parse(_)
        ));
        assert!(matches!(
            parse_document(b"   ").unwrap_err(),
            SchemaError::Parse(_)
        ));
    }

    #[test]
    fn bare_document_keeps_body_and_drops_discriminator() {
        let doc = json!({"coreType": "xray", "inbounds": []});
        let unwrapped = unwrap_document(doc.as_object().unwrap().clone()).unwrap();
        assert!(!unwrapped.wrapped);
        assert_eq!(unwrapped.discriminator.as_deref(), Some("xray"));
        assert!(!unwrapped.body.contains_key(DISCRIMINATOR_KEY));
        assert!(unwrapped.body.contains_key("inbounds"));
    }

    #[test]
    fn wrapper_with_embedded_mapping() {
        let doc = json!({
            "coreType": "mihomo",
            "mixed-port": 7890,
            "coreConfig": {"mode": "rule"}
        });
        let unwrapped = unwrap_document(doc.as_object().unwrap().clone()).unwrap();
        assert!(unwrapped.wrapped);
        assert_eq!(unwrapped.body["mode"], json!("rule"));
        assert_eq!(unwrapped.envelope["mixed-port"], json!(7890));
    }

    #[test]
    fn wrapper_with_nested_document_string() {
        let doc = json!({"coreConfig": "{\"outbounds\": [], \"routing\": {}}"});
        let unwrapped = unwrap_document(doc.as_object().unwrap().clone()).unwrap();
        assert!(unwrapped.body.contains_key("outbounds"));
        assert!(unwrapped.body.contains_key("routing"));
    }

    #[test]
    fn wrapper_with_unusable_value_fails() {
        let doc = json!({"coreConfig": 42});
        let err = unwrap_document(doc.as_object().unwrap().clone()).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidWrapperFormat(_)));

        let doc = json!({"coreConfig": "{not a document"});
        let err = unwrap_document(doc.as_object().unwrap().clone()).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidWrapperFormat(_)));
    }

    #[test]
    fn host_spec_ports() {
        let port = |spec| port_from_host_spec("external-controller", spec);
        assert_eq!(port("127.0.0.1:9090").unwrap(), 9090);
        assert_eq!(port(":9090").unwrap(), 9090);
        assert_eq!(port("[::1]:9090").unwrap(), 9090);
        for bad in ["127.0.0.1", "127.0.0.1:0", "127.0.0.1:70000", "localhost:api"] {
            assert!(matches!(port(bad), Err(SchemaError::InvalidPort(_))), "{bad}");
        }
    }

    #[test]
    fn port_values_accept_numbers_and_strings() {
        let port = |value| port_value("mixed-port", &value);
        assert_eq!(port(json!(1080)).unwrap(), Some(1080));
        assert_eq!(port(json!("1080")).unwrap(), Some(1080));
        assert_eq!(port(json!(null)).unwrap(), None);
        for bad in [json!(0), json!(-1), json!(70000), json!(1.5), json!("abc"), json!(true)] {
            assert!(matches!(port(bad.clone()), Err(SchemaError::InvalidPort(_))), "{bad}");
        }
    }
}

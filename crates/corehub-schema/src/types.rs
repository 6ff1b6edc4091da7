//! Engine identity types shared by every corehub crate.
//!
//! `EngineType` is the closed set of engine families the supervisor can run.
//! `EngineVariant` refines it for reporting only and never changes lifecycle
//! behaviour.

use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Preferred loopback port for the local SOCKS/mixed listener.
pub const DEFAULT_SOCKS_PORT: u16 = 15491;
/// Preferred loopback port for the local HTTP listener.
pub const DEFAULT_HTTP_PORT: u16 = 15492;
/// Preferred loopback port for the control API.
pub const DEFAULT_API_PORT: u16 = 15490;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    /// V2Ray/Xray family: JSON documents, construct-start-close instances.
    Xray,
    /// Mihomo (Clash.Meta) family: YAML documents, apply/shutdown hub.
    Mihomo,
}

impl EngineType {
    pub const ALL: [EngineType; 2] = [EngineType::Xray, EngineType::Mihomo];

    /// Parse a user supplied engine name, accepting legacy aliases.
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        EngineVariant::parse(input).map(EngineVariant::engine)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineType::Xray => "xray",
            EngineType::Mihomo => "mihomo",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            EngineType::Xray => "Xray",
            EngineType::Mihomo => "Mihomo",
        }
    }

    /// Every name that [`EngineType::parse`] maps onto this family.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            EngineType::Xray => &["xray", "v2ray"],
            EngineType::Mihomo => &["mihomo", "clash", "clash-meta"],
        }
    }

    /// Variant reported when nothing in the document refines the family.
    pub fn default_variant(self) -> EngineVariant {
        match self {
            EngineType::Xray => EngineVariant::Xray,
            EngineType::Mihomo => EngineVariant::Mihomo,
        }
    }

    /// Returns `(socks, http, api)`.
    pub fn default_ports(self) -> (u16, u16, u16) {
        (DEFAULT_SOCKS_PORT, DEFAULT_HTTP_PORT, DEFAULT_API_PORT)
    }

    /// Native format of the finalized document handed to the engine.
    pub fn config_format(self) -> ConfigFormat {
        match self {
            EngineType::Xray => ConfigFormat::Json,
            EngineType::Mihomo => ConfigFormat::Yaml,
        }
    }

    /// Whether caller documents in `format` are accepted for this engine.
    pub fn supports_format(self, format: &str) -> bool {
        let format = format.trim().to_ascii_lowercase();
        match self {
            EngineType::Xray => format == "json",
            EngineType::Mihomo => format == "json" || format == "yaml" || format == "yml",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineType {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineVariant {
    V2Ray,
    Xray,
    Mihomo,
}

impl EngineVariant {
    pub fn parse(input: &str) -> Result<Self, SchemaError> {
        match input.trim().to_ascii_lowercase().as_str() {
            "v2ray" => Ok(EngineVariant::V2Ray),
            "xray" => Ok(EngineVariant::Xray),
            "mihomo" | "clash" | "clash-meta" => Ok(EngineVariant::Mihomo),
            _ => Err(SchemaError::UnknownEngineType(input.to_owned())),
        }
    }

    pub fn engine(self) -> EngineType {
        match self {
            EngineVariant::V2Ray | EngineVariant::Xray => EngineType::Xray,
            EngineVariant::Mihomo => EngineType::Mihomo,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EngineVariant::V2Ray => "v2ray",
            EngineVariant::Xray => "xray",
            EngineVariant::Mihomo => "mihomo",
        }
    }
}

impl fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl fmt::Display for ConfigFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigFormat::Json => f.write_str("json"),
            ConfigFormat::Yaml => f.write_str("yaml"),
        }
    }
}

/// Listener and control-API ports, as far as they are known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPorts {
    pub socks: Option<u16>,
    pub api: Option<u16>,
}

impl ControlPorts {
    pub fn new(socks: u16, api: u16) -> Self {
        Self {
            socks: Some(socks),
            api: Some(api),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.socks.is_none() && self.api.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_and_whitespace_insensitive() {
        assert_eq!(EngineType::parse("  XRAY ").unwrap(), EngineType::Xray);
        assert_eq!(EngineType::parse("Mihomo").unwrap(), EngineType::Mihomo);
    }

    #[test]
    fn legacy_aliases_map_to_mihomo() {
        assert_eq!(EngineType::parse("clash").unwrap(), EngineType::Mihomo);
        assert_eq!(EngineType::parse("clash-meta").unwrap(), EngineType::Mihomo);
        assert_eq!(EngineType::parse("v2ray").unwrap(), EngineType::Xray);
    }

    #[test]
    fn unknown_name_is_rejected() {
        let err = EngineType::parse("sing-box").unwrap_err();
        assert!(matches!(err, SchemaError::UnknownEngineType(ref s) if s == "sing-box"));
    }

    #[test]
    fn every_alias_parses_back_to_its_family() {
        for engine in EngineType::ALL {
            for alias in engine.aliases() {
                assert_eq!(EngineType::parse(alias).unwrap(), engine);
            }
        }
    }

    #[test]
    fn config_formats() {
        assert_eq!(EngineType::Xray.config_format(), ConfigFormat::Json);
        assert_eq!(EngineType::Mihomo.config_format(), ConfigFormat::Yaml);
        assert!(EngineType::Mihomo.supports_format("YAML"));
        assert!(EngineType::Mihomo.supports_format("json"));
        assert!(!EngineType::Xray.supports_format("yaml"));
    }

    #[test]
    fn serde_uses_lowercase_names() {
        let json = serde_json::to_string(&EngineType::Mihomo).unwrap();
        assert_eq!(json, "\"mihomo\"");
        let back: EngineVariant = serde_json::from_str("\"v2ray\"").unwrap();
        assert_eq!(back.engine(), EngineType::Xray);
    }
}

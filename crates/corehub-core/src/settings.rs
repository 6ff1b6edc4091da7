use crate::CoreError;
use corehub_runtime::process::TERM_GRACE;
use corehub_runtime::{BackendConfig, BACKENDS};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Supervisor settings, read from `~/.config/corehub/settings.toml` or an
/// explicit `--settings` file. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerSettings {
    pub backend: String,
    pub xray_binary: PathBuf,
    pub mihomo_binary: PathBuf,
    pub asset_dir: Option<PathBuf>,
    pub log_level: String,
    pub socks_port: Option<u16>,
    pub api_port: Option<u16>,
    pub startup_timeout_ms: u64,
    pub xray_stop_grace_ms: u64,
    pub mihomo_stop_grace_ms: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            backend: "process".to_owned(),
            xray_binary: PathBuf::from("xray"),
            mihomo_binary: PathBuf::from("mihomo"),
            asset_dir: None,
            log_level: "info".to_owned(),
            socks_port: None,
            api_port: None,
            startup_timeout_ms: 1500,
            xray_stop_grace_ms: 2000,
            mihomo_stop_grace_ms: 3000,
        }
    }
}

impl ManagerSettings {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let settings: Self =
            toml::from_str(input).map_err(|e| CoreError::Settings(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Settings(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Load `explicit` when given, else the default file when it exists,
    /// else built-in defaults.
    pub fn load_or_default(explicit: Option<&Path>) -> Result<Self, CoreError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match default_settings_path() {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !BACKENDS.contains(&self.backend.as_str()) {
            return Err(CoreError::Settings(format!(
                "unknown backend '{}', expected one of: {}",
                self.backend,
                BACKENDS.join(", ")
            )));
        }
        if self.log_level.trim().is_empty() {
            return Err(CoreError::Settings("log_level must not be empty".to_owned()));
        }
        if self.socks_port == Some(0) || self.api_port == Some(0) {
            return Err(CoreError::InvalidPortRange(
                "configured ports must be in 1..=65535".to_owned(),
            ));
        }
        if self.socks_port.is_some() && self.socks_port == self.api_port {
            return Err(CoreError::InvalidPortRange(
                "socks_port and api_port must differ".to_owned(),
            ));
        }
        if self.startup_timeout_ms == 0 {
            return Err(CoreError::Settings(
                "startup_timeout_ms must be positive".to_owned(),
            ));
        }
        // A shorter grace abandons the child before SIGKILL is ever sent.
        let floor = TERM_GRACE.as_millis() as u64;
        for (key, value) in [
            ("xray_stop_grace_ms", self.xray_stop_grace_ms),
            ("mihomo_stop_grace_ms", self.mihomo_stop_grace_ms),
        ] {
            if value < floor {
                return Err(CoreError::Settings(format!(
                    "{key} must be at least {floor}, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig {
            xray_binary: self.xray_binary.clone(),
            mihomo_binary: self.mihomo_binary.clone(),
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            xray_stop_grace: Duration::from_millis(self.xray_stop_grace_ms),
            mihomo_stop_grace: Duration::from_millis(self.mihomo_stop_grace_ms),
        }
    }
}

/// `$XDG_CONFIG_HOME/corehub/settings.toml`, falling back to `~/.config`.
pub fn default_settings_path() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(xdg).join("corehub/settings.toml"));
    }
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".config/corehub/settings.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let settings = ManagerSettings::parse("").unwrap();
        assert_eq!(settings, ManagerSettings::default());
        assert_eq!(settings.backend, "process");
        assert_eq!(
            settings.backend_config().mihomo_stop_grace,
            Duration::from_secs(3)
        );
    }

    #[test]
    fn partial_file_overrides_fields() {
        let settings = ManagerSettings::parse(
            r#"
backend = "mock"
asset_dir = "/var/lib/corehub"
socks_port = 7890
api_port = 9090
xray_stop_grace_ms = 1500
"#,
        )
        .unwrap();
        assert_eq!(settings.backend, "mock");
        assert_eq!(settings.asset_dir, Some(PathBuf::from("/var/lib/corehub")));
        assert_eq!(settings.socks_port, Some(7890));
        let backend = settings.backend_config();
        assert_eq!(backend.xray_stop_grace, Duration::from_millis(1500));
        assert_eq!(backend.startup_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = ManagerSettings::parse("socks = 1\n").unwrap_err();
        assert!(matches!(err, CoreError::Settings(_)));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            ManagerSettings::parse("backend = \"docker\"\n"),
            Err(CoreError::Settings(_))
        ));
        assert!(matches!(
            ManagerSettings::parse("socks_port = 0\n"),
            Err(CoreError::InvalidPortRange(_))
        ));
        assert!(matches!(
            ManagerSettings::parse("socks_port = 9000\napi_port = 9000\n"),
            Err(CoreError::InvalidPortRange(_))
        ));
        assert!(matches!(
            ManagerSettings::parse("socks_port = 70000\n"),
            Err(CoreError::Settings(_))
        ));
    }

    #[test]
    fn stop_grace_below_kill_window_is_rejected() {
        for input in ["mihomo_stop_grace_ms = 0\n", "xray_stop_grace_ms = 999\n"] {
            let err = ManagerSettings::parse(input).unwrap_err();
            assert!(matches!(err, CoreError::Settings(ref m) if m.contains("stop_grace_ms")));
        }
        assert!(ManagerSettings::parse("mihomo_stop_grace_ms = 1000\n").is_ok());
    }

    #[test]
    fn load_reads_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "log_level = \"debug\"\n").unwrap();
        let settings = ManagerSettings::load_or_default(Some(&path)).unwrap();
        assert_eq!(settings.log_level, "debug");

        let missing = dir.path().join("absent.toml");
        assert!(matches!(
            ManagerSettings::load_or_default(Some(&missing)),
            Err(CoreError::Settings(_))
        ));
    }
}

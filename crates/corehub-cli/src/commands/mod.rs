pub mod detect;
pub mod engines;
pub mod prepare;
pub mod run;
pub mod test;

use corehub_core::{CoreError, EngineRegistry, LifecycleManager, ManagerSettings, ManagerStats};
use corehub_schema::EngineType;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_ENGINE_ERROR: u8 = 3;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .expect("valid template")
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    pb.set_style(ProgressStyle::with_template("{msg}").expect("valid template"));
    pb.finish_with_message(format!("✗ {msg}"));
}

pub fn colorize_state(state: &str) -> String {
    use console::Style;
    match state {
        "running" => Style::new().cyan().bold().apply_to(state).to_string(),
        "stopped" => Style::new().dim().apply_to(state).to_string(),
        other => other.to_owned(),
    }
}

/// Render a core error with the prefix `main` maps to an exit code.
pub fn core_error(err: &CoreError) -> String {
    if err.is_config_error() {
        format!("config error: {err}")
    } else if matches!(
        err,
        CoreError::EngineStart { .. }
            | CoreError::EngineUnavailable(_)
            | CoreError::AlreadyRunning(_)
    ) {
        format!("engine error: {err}")
    } else {
        err.to_string()
    }
}

pub fn parse_engine(input: Option<&str>) -> Result<Option<EngineType>, String> {
    input
        .map(|name| EngineType::parse(name).map_err(|e| format!("config error: {e}")))
        .transpose()
}

/// Command-line ports take precedence over the settings file.
pub fn apply_ports(settings: &mut ManagerSettings, socks: Option<u16>, api: Option<u16>) {
    if socks.is_some() {
        settings.socks_port = socks;
    }
    if api.is_some() {
        settings.api_port = api;
    }
}

pub fn build_manager(
    settings: &ManagerSettings,
    engine: Option<EngineType>,
) -> Result<LifecycleManager, String> {
    settings.validate().map_err(|e| core_error(&e))?;
    let registry = EngineRegistry::from_settings(settings).map_err(|e| core_error(&e))?;
    let manager = LifecycleManager::new(Arc::new(registry));

    match (settings.socks_port, settings.api_port) {
        (Some(socks), Some(api)) => manager.set_ports(socks, api).map_err(|e| core_error(&e))?,
        (None, None) => {}
        _ => {
            return Err("settings error: socks and api ports must be given together".to_owned());
        }
    }
    if let Some(engine) = engine {
        manager.set_core_type(engine).map_err(|e| core_error(&e))?;
    }
    manager.set_asset_path(settings.asset_dir.clone());
    manager.set_log_level(&settings.log_level);
    Ok(manager)
}

pub fn print_stats(stats: &ManagerStats) {
    let state = if stats.running { "running" } else { "stopped" };
    let port = |p: Option<u16>| p.map_or_else(|| "(auto)".to_owned(), |p| p.to_string());
    println!("engine:      {}", stats.engine_name);
    if let Some(variant) = stats.variant {
        println!("variant:     {variant}");
    }
    println!("state:       {}", colorize_state(state));
    println!("socks_port:  {}", port(stats.socks_port));
    println!("api_port:    {}", port(stats.api_port));
    if let Some(path) = &stats.config_path {
        println!("config:      {}", path.display());
    }
    if let Some(path) = &stats.log_file {
        println!("log_file:    {}", path.display());
    }
    println!("backend:     {}", stats.backend);
}

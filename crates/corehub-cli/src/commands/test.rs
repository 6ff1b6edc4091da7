use super::{build_manager, core_error, json_pretty, parse_engine, EXIT_SUCCESS};
use corehub_core::ManagerSettings;
use std::path::Path;

pub fn run(
    settings: &ManagerSettings,
    config: &Path,
    engine: Option<&str>,
    json: bool,
) -> Result<u8, String> {
    let manager = build_manager(settings, parse_engine(engine)?)?;
    let detection = manager.detect_file(config).map_err(|e| core_error(&e))?;
    manager.test_config(config).map_err(|e| core_error(&e))?;

    if json {
        let payload = serde_json::json!({
            "config": config,
            "engine": detection.engine,
            "variant": detection.variant,
            "valid": true,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "{}: ok ({})",
            config.display(),
            detection.engine.display_name()
        );
    }
    Ok(EXIT_SUCCESS)
}

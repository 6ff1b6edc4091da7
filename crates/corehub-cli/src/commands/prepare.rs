use super::{core_error, parse_engine, EXIT_SUCCESS};
use corehub_core::{resolve_ports, CoreError, ManagerSettings};
use corehub_schema::{
    detect_unwrapped, injector_for, parse_document, read_config_file, unwrap_document,
    ControlPorts, InjectParams, SchemaError,
};
use std::io::Write;
use std::path::Path;

pub fn run(settings: &ManagerSettings, config: &Path, engine: Option<&str>) -> Result<u8, String> {
    let fallback = parse_engine(engine)?;
    let config_error = |e: SchemaError| format!("config error: {e}");

    let raw = read_config_file(config).map_err(config_error)?;
    let (doc, _) = parse_document(&raw).map_err(config_error)?;
    let unwrapped = unwrap_document(doc).map_err(config_error)?;
    let engine = match (detect_unwrapped(&unwrapped), fallback) {
        (Ok(detection), _) => detection.engine,
        (Err(SchemaError::UndetectableConfig), Some(engine)) => engine,
        (Err(e), _) => return Err(config_error(e)),
    };

    let injector = injector_for(engine);
    let held = ControlPorts {
        socks: settings.socks_port,
        api: settings.api_port,
    };
    let requested = injector
        .extract_ports(&unwrapped)
        .map_err(|e| core_error(&CoreError::from(e)))?;
    let (socks_port, api_port) =
        resolve_ports(engine, requested, held).map_err(|e| core_error(&e))?;
    let params = InjectParams {
        socks_port,
        api_port,
        asset_dir: settings.asset_dir.clone(),
        log_level: settings.log_level.clone(),
    };
    let prepared = injector
        .prepare_unwrapped(unwrapped, &params)
        .map_err(config_error)?;

    let mut document = prepared.bytes;
    if !document.ends_with(b"\n") {
        document.push(b'\n');
    }
    std::io::stdout()
        .lock()
        .write_all(&document)
        .map_err(|e| format!("failed to write document: {e}"))?;
    Ok(EXIT_SUCCESS)
}

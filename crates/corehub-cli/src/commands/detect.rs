use super::{json_pretty, EXIT_SUCCESS};
use corehub_schema::{detect, parse_document, read_config_file, DetectionSource};
use std::path::Path;

pub fn run(config: &Path, json: bool) -> Result<u8, String> {
    let config_error = |e: corehub_schema::SchemaError| format!("config error: {e}");
    let raw = read_config_file(config).map_err(config_error)?;
    let (doc, format) = parse_document(&raw).map_err(config_error)?;
    let detection = detect(doc).map_err(config_error)?;

    if json {
        let payload = serde_json::json!({
            "engine": detection.engine,
            "variant": detection.variant,
            "source": detection.source,
            "format": format,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        let source = match detection.source {
            DetectionSource::Explicit => "coreType",
            DetectionSource::Heuristic => "structure",
            DetectionSource::Pinned => "pinned",
        };
        println!("engine:  {}", detection.engine);
        println!("variant: {}", detection.variant);
        println!("source:  {source}");
        println!("format:  {format}");
    }
    Ok(EXIT_SUCCESS)
}

use super::{json_pretty, EXIT_SUCCESS};
use corehub_core::{ManagerSettings, VERSION};
use corehub_schema::EngineType;

pub fn run(settings: &ManagerSettings, json: bool) -> Result<u8, String> {
    let binary = |engine: EngineType| match engine {
        EngineType::Xray => &settings.xray_binary,
        EngineType::Mihomo => &settings.mihomo_binary,
    };

    if json {
        let engines: Vec<_> = EngineType::ALL
            .into_iter()
            .map(|engine| {
                let (socks, http, api) = engine.default_ports();
                serde_json::json!({
                    "engine": engine,
                    "name": engine.display_name(),
                    "aliases": engine.aliases(),
                    "config_format": engine.config_format(),
                    "default_ports": {"socks": socks, "http": http, "api": api},
                    "binary": binary(engine),
                })
            })
            .collect();
        let payload = serde_json::json!({
            "version": VERSION,
            "backend": settings.backend,
            "engines": engines,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("corehub {VERSION} (backend: {})", settings.backend);
        for engine in EngineType::ALL {
            let (socks, http, api) = engine.default_ports();
            println!();
            println!("{}", engine.display_name());
            println!("  aliases: {}", engine.aliases().join(", "));
            println!("  format:  {}", engine.config_format());
            println!("  ports:   socks {socks}, http {http}, api {api}");
            println!("  binary:  {}", binary(engine).display());
        }
    }
    Ok(EXIT_SUCCESS)
}

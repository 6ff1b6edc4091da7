use super::{
    build_manager, core_error, json_pretty, parse_engine, print_stats, spin_fail, spin_ok, spinner,
    EXIT_SUCCESS,
};
use corehub_core::{shutdown_requested, HomeLock, ManagerSettings};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const SUPERVISE_POLL: Duration = Duration::from_millis(200);

pub fn run(
    settings: &ManagerSettings,
    config: &Path,
    engine: Option<&str>,
    json: bool,
) -> Result<u8, String> {
    let engine = parse_engine(engine)?;
    let home = match &settings.asset_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().map_err(|e| format!("cannot resolve home: {e}"))?,
    };
    let _lock = HomeLock::try_acquire(&home)
        .map_err(|e| format!("home lock: {e}"))?
        .ok_or_else(|| format!("home lock: {} is in use by another corehub", home.display()))?;

    let manager = build_manager(settings, engine)?;

    let pb = if json {
        None
    } else {
        Some(spinner("starting engine..."))
    };
    match manager.run_config(config) {
        Ok(()) => {
            if let Some(ref pb) = pb {
                spin_ok(pb, "engine started");
            }
        }
        Err(e) => {
            if let Some(ref pb) = pb {
                spin_fail(pb, "engine failed to start");
            }
            return Err(core_error(&e));
        }
    }

    let stats = manager.get_stats();
    if json {
        println!("{}", json_pretty(&stats)?);
    } else {
        print_stats(&stats);
        println!("press Ctrl-C to stop");
    }

    let mut died = false;
    while !shutdown_requested() {
        std::thread::sleep(SUPERVISE_POLL);
        if !manager.get_stats().engine_alive {
            warn!("{} exited unexpectedly", stats.engine_type);
            died = true;
            break;
        }
    }

    info!("stopping {}", stats.engine_type);
    let stopped = manager.stop();
    if died {
        return Err(format!(
            "engine error: {} exited unexpectedly",
            stats.engine_type
        ));
    }
    stopped.map_err(|e| core_error(&e))?;
    if !json {
        println!("stopped {}", stats.engine_name);
    }
    Ok(EXIT_SUCCESS)
}

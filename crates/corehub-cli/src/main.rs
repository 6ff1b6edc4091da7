mod commands;

use clap::{Args, Parser, Subcommand};
use commands::{EXIT_CONFIG_ERROR, EXIT_ENGINE_ERROR, EXIT_FAILURE};
use corehub_core::{install_signal_handler, ManagerSettings};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "corehub",
    version,
    about = "Lifecycle manager for Xray and Mihomo proxy engines"
)]
struct Cli {
    /// Settings file (defaults to ~/.config/corehub/settings.toml when present).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Engine drivers: `process` runs the engine binaries, `mock` runs in-process stand-ins.
    #[arg(long, global = true)]
    backend: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Args)]
struct PortArgs {
    /// Local SOCKS/mixed listener port.
    #[arg(long)]
    socks_port: Option<u16>,
    /// Control API port.
    #[arg(long)]
    api_port: Option<u16>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the engine a config targets and supervise it until interrupted.
    Run {
        /// Path to the engine config (JSON or YAML, optionally wrapped).
        config: PathBuf,
        /// Engine to use when the config does not identify one.
        #[arg(long)]
        engine: Option<String>,
        #[command(flatten)]
        ports: PortArgs,
        /// Directory holding geo data files; also the Mihomo home directory.
        #[arg(long)]
        asset_dir: Option<PathBuf>,
        /// Engine log level (debug, info, warning, error, silent).
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Check that a config would be accepted, without starting anything.
    Test {
        config: PathBuf,
        /// Engine to use when the config does not identify one.
        #[arg(long)]
        engine: Option<String>,
    },
    /// Print the engine a config targets.
    Detect { config: PathBuf },
    /// Print the document the engine would be handed.
    Prepare {
        config: PathBuf,
        /// Engine to use when the config does not identify one.
        #[arg(long)]
        engine: Option<String>,
        #[command(flatten)]
        ports: PortArgs,
    },
    /// List supported engines with their aliases and defaults.
    Engines,
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("COREHUB_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    install_signal_handler();

    let mut settings = match ManagerSettings::load_or_default(cli.settings.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    if let Some(backend) = cli.backend {
        settings.backend = backend;
    }
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Run {
            config,
            engine,
            ports,
            asset_dir,
            log_level,
        } => {
            commands::apply_ports(&mut settings, ports.socks_port, ports.api_port);
            if let Some(dir) = asset_dir {
                settings.asset_dir = Some(dir);
            }
            if let Some(level) = log_level {
                settings.log_level = level;
            }
            commands::run::run(&settings, &config, engine.as_deref(), json_output)
        }
        Commands::Test { config, engine } => {
            commands::test::run(&settings, &config, engine.as_deref(), json_output)
        }
        Commands::Detect { config } => commands::detect::run(&config, json_output),
        Commands::Prepare {
            config,
            engine,
            ports,
        } => {
            commands::apply_ports(&mut settings, ports.socks_port, ports.api_port);
            commands::prepare::run(&settings, &config, engine.as_deref())
        }
        Commands::Engines => commands::engines::run(&settings, json_output),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("config error:") {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("engine error:") {
                EXIT_ENGINE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

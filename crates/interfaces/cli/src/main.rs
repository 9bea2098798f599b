use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use persona_config::AppConfig;
use persona_runtime::{AppState, run_server, run_simulation};

#[derive(Debug, Parser)]
#[command(
    name = "persona-server",
    version,
    about = "Local-first conversational persona runtime"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config/persona.toml")]
    config: String,

    /// Override the configured server host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured server port.
    #[arg(long)]
    port: Option<u16>,

    /// Force debug-level logging.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the JSON-RPC WebSocket server (the default).
    Serve,
    /// Run the self-play chatroom simulation instead of serving.
    Simulate {
        /// How many wall-clock minutes to run for.
        #[arg(long, default_value_t = 5)]
        minutes: u64,
    },
}

fn init_tracing(config: &AppConfig, debug: bool) {
    let level = if debug || config.server.debug_mode {
        "debug"
    } else {
        config.server.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn ensure_data_dirs(config: &AppConfig) -> Result<()> {
    for path in [&config.database.sqlite_path, &config.database.vector_path] {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let _ = dotenvy::dotenv();

    let mut config = AppConfig::load_from(&cli.config)?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_tracing(&config, cli.debug);

    let errors = config.validate();
    if !errors.is_empty() {
        for message in &errors {
            error!(%message, "configuration error");
        }
        anyhow::bail!("invalid configuration ({} errors)", errors.len());
    }

    ensure_data_dirs(&config)?;

    let state = AppState::initialize(config).await?;

    if state.generator.client().is_available().await {
        info!("ollama backend reachable");
    } else {
        warn!("ollama backend not reachable; responses will use fallbacks");
    }

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let server_state = state.clone();
            let server = tokio::spawn(async move { run_server(server_state, shutdown_rx).await });

            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
            state.decay.stop().await;

            server.await??;
        }
        Commands::Simulate { minutes } => {
            let report = run_simulation(state, minutes).await?;
            info!(
                conversations = report.conversations,
                turns = report.turns,
                natural_conclusions = report.natural_conclusions,
                "simulation report"
            );
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("fatal: {err}");
            ExitCode::FAILURE
        }
    }
}

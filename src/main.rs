//! Portico: multi-listener HTTP/HTTPS server.
//!
//! This is the application entry point. It initializes tracing, loads the
//! configuration file, starts every configured listener and closes them on
//! Ctrl+C or SIGTERM. The `install-app` subcommand registers a plugin instead.

use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portico::config::{
    ServerConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER, GRACEFUL_SHUTDOWN_SECS,
};
use portico::http::{shutdown_signal, WebServer};
use portico::plugins::install_app;
use portico::routes::create_router;

/// Portico: HTTP and HTTPS listeners for an extensible app server
#[derive(Parser, Debug)]
#[command(name = "portico", version, about)]
struct Args {
    /// Path to configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Log level filter (e.g., "portico=debug,axum_server=info")
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the configured listeners (default)
    Serve,
    /// Register an app directory as a plugin
    InstallApp(InstallAppArgs),
}

#[derive(ClapArgs, Debug)]
struct InstallAppArgs {
    /// App directory containing pluginDefinition.json
    #[arg(short, long)]
    input_app: PathBuf,

    /// Plugins directory; defaults to plugins_dir from the config file
    #[arg(short, long)]
    plugins_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config is needed for the log format, except for install-app with an
    // explicit plugins dir
    let config = match &args.command {
        Some(Command::InstallApp(InstallAppArgs {
            plugins_dir: Some(_),
            ..
        })) => None,
        _ => Some(ServerConfig::load(&args.config)?),
    };

    // Initialize tracing with priority: CLI > env > default
    let log_filter = args
        .log_level
        .clone()
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let json = config
        .as_ref()
        .is_some_and(|config| config.logging.format.eq_ignore_ascii_case("json"));

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    match args.command {
        Some(Command::InstallApp(install)) => {
            let plugins_dir = match (install.plugins_dir, config) {
                (Some(dir), _) => dir,
                (None, Some(config)) => config
                    .plugins_dir
                    .ok_or("plugins_dir is not set in the config file; pass --plugins-dir")?,
                (None, None) => return Err("no plugins directory given".into()),
            };
            install_app(&install.input_app, &plugins_dir)?;
            Ok(())
        }
        Some(Command::Serve) | None => {
            let config = config.ok_or("configuration was not loaded")?;
            serve(config).await
        }
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(
        http_port = ?config.http_port(),
        https_port = ?config.https_port(),
        "Loaded configuration"
    );

    let mut server = WebServer::new();
    server.set_config(config)?;
    server.start_listening(create_router()).await?;

    shutdown_signal().await;

    server.close();
    tracing::info!(
        timeout_secs = GRACEFUL_SHUTDOWN_SECS,
        "Waiting for connections to close"
    );
    server.wait_closed().await;
    tracing::info!("All listeners closed");

    Ok(())
}

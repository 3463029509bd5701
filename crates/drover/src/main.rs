use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use tokio::net::TcpListener;

use drover::api::{self, AppState};
use drover::config::DroverConfig;
use drover::db::Database;
use drover::discovery::Scanner;
use drover::runner::api::{ApiRunner, ApiRunnerConfig, DenyAllTools};
use drover::runner::sidecar::{SidecarConfig, SidecarRunner};
use drover::runner::subprocess::{SubprocessConfig, SubprocessRunner};
use drover::runner::{EventSink, RunnerRegistry};
use drover::session::models::RunnerKind;
use drover::store::SessionStore;

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let mut config = DroverConfig::load(cli.common.config.as_deref())?;
    if let Some(data_dir) = &cli.common.data_dir {
        config.data_dir = data_dir.display().to_string();
    }

    match cli.command {
        None => run_serve(config, ServeCommand::default()),
        Some(Command::Serve(cmd)) => run_serve(config, cmd),
        Some(Command::Config { command }) => handle_config(&config, command),
    }
}

#[tokio::main]
async fn run_serve(config: DroverConfig, cmd: ServeCommand) -> Result<()> {
    let bind = cmd.bind.unwrap_or_else(|| config.bind.clone());
    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {:?}", data_dir))?;

    let db = Database::open(&config.db_path()).await?;
    let store = Arc::new(SessionStore::new(&db, &data_dir, config.journal_max_bytes).await?);

    if config.retention_days > 0 {
        let removed = store.prune_sessions(config.retention_days).await?;
        if removed > 0 {
            info!("Pruned {} expired sessions", removed);
        }
    }

    let sink = EventSink::new(store.clone());
    let runners = Arc::new(RunnerRegistry::new());
    runners.register(SubprocessRunner::new(
        store.clone(),
        sink.clone(),
        SubprocessConfig {
            command: config.worker.command.clone(),
            permission_timeout: config.permission_timeout(),
        },
    ));
    runners.register(SidecarRunner::new(
        store.clone(),
        sink.clone(),
        SidecarConfig {
            base_url: config.sidecar.base_url.clone(),
            token: config.sidecar.token.clone(),
            read_timeout: config.sidecar_read_timeout(),
            permission_timeout: config.permission_timeout(),
        },
    ));
    runners.register(ApiRunner::new(
        store.clone(),
        sink,
        ApiRunnerConfig {
            base_url: config.api.base_url.clone(),
            api_key: std::env::var(&config.api.api_key_env).ok(),
            model: config.api.model.clone(),
            max_tokens: config.api.max_tokens,
            heartbeat_interval: config.heartbeat_interval(),
            permission_timeout: config.permission_timeout(),
        },
        Arc::new(DenyAllTools),
    ));

    let default_adapter: RunnerKind = config
        .default_adapter
        .parse()
        .map_err(|err: String| anyhow::anyhow!(err))?;
    let scanner = Arc::new(Scanner::new(config.scanner_config()));
    let state = AppState::new(
        store,
        runners,
        scanner,
        config.auth_token.clone(),
        default_adapter,
    );
    let router = api::create_router(state);

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("Listening on {}", bind);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down");
}

fn handle_config(config: &DroverConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            println!("bind = {}", config.bind);
            println!("data_dir = {}", config.data_dir().display());
            println!("default_adapter = {}", config.default_adapter);
            println!("journal_max_bytes = {}", config.journal_max_bytes);
            println!("permission_timeout_s = {}", config.permission_timeout_s);
            println!("sidecar.base_url = {}", config.sidecar.base_url);
            println!("api.model = {}", config.api.model);
            println!("worker.command = {:?}", config.worker.command);
        }
        ConfigCommand::Path => match DroverConfig::default_file_path() {
            Some(path) => println!("{}", path.display()),
            None => println!("(no config directory available)"),
        },
    }
    Ok(())
}

fn init_logging(common: &CommonOpts) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = common.log_level.as_deref().unwrap_or("info");
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("drover={level},tower_http={level}")));

    if common.json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        let disable_color = !io::stderr().is_terminal();
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(!disable_color))
            .try_init()
            .ok();
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Drover - agent session broker.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Path to a configuration file (default: <config-dir>/drover/drover.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory override.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON logs.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the broker server (default).
    Serve(ServeCommand),

    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Default, Args)]
struct ServeCommand {
    /// Listen address override, e.g. 127.0.0.1:8787.
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the resolved configuration.
    Show,
    /// Print the default configuration file path.
    Path,
}

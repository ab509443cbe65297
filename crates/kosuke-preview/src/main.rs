use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;
use tokio::net::TcpListener;

use kosuke_preview::api::{self, AppState};
use kosuke_preview::container::ContainerRuntimeApi;
use kosuke_preview::naming::{APP_KIND, REDIS_KIND};
use kosuke_preview::preview::{HttpAppProbe, PreviewService, PreviewStatus, SessionKey};
use kosuke_preview::readiness::{HttpPreviewApi, PreviewWatcher};
use kosuke_preview::settings::{
    APP_NAME, AppConfig, config_file_path, load_config, write_default_config,
};
use kosuke_preview::storage::{PostgresAdmin, SqlxPostgresAdmin, StorageProvisioner};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_watch(ctx: RuntimeContext, cmd: WatchCommand) -> Result<()> {
    handle_watch(&ctx, cmd).await
}

#[tokio::main]
async fn async_teardown(ctx: RuntimeContext, cmd: SessionArgs) -> Result<()> {
    handle_teardown(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Watch(cmd) => async_watch(ctx, cmd),
        Command::Teardown(cmd) => async_teardown(ctx, cmd),
        Command::Names(cmd) => handle_names(&ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Kosuke preview environments: per-session app, database and cache.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the preview HTTP API server
    Serve(ServeCommand),
    /// Wait for a session's preview to become ready, starting it if needed
    Watch(WatchCommand),
    /// Remove a session's app container and storages
    Teardown(SessionArgs),
    /// Print the resource names derived for a session
    Names(NamesCommand),
    /// Create config directories and default files
    Init(InitCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (overrides config)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct SessionArgs {
    /// Project identifier
    project_id: String,
    /// Chat session identifier
    session_id: String,
}

#[derive(Debug, Clone, Args)]
struct WatchCommand {
    #[command(flatten)]
    session: SessionArgs,
    /// Base URL of the preview server
    #[arg(long, env = "KOSUKE_SERVER_URL", default_value = "http://localhost:8080")]
    server: String,
    /// Keep sending heartbeats after the preview is ready
    #[arg(long)]
    follow: bool,
}

#[derive(Debug, Clone, Args)]
struct NamesCommand {
    /// Project identifier
    project_id: String,
    /// Chat session identifier (a fresh UUID when omitted)
    session_id: Option<String>,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Recreate configuration even if it already exists
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Regenerate the default configuration file
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = config_file_path(common.config.clone())?;
        if !config_file.exists() {
            write_default_config(&config_file)?;
        }
        let config = load_config(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("kosuke_preview={level},tower_http={level}"))
        });

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Print a value as JSON, YAML or via the plain renderer.
    fn emit<T: Serialize>(&self, value: &T, plain: impl FnOnce(&T) -> String) -> Result<()> {
        let output = if self.common.json {
            serde_json::to_string_pretty(value).context("serializing output to JSON")?
        } else if self.common.yaml {
            serde_yaml::to_string(value).context("serializing output to YAML")?
        } else {
            plain(value)
        };
        println!("{output}");
        Ok(())
    }
}

/// Build the preview service from configuration.
fn build_preview_service(config: &AppConfig) -> Result<PreviewService> {
    let runtime: Arc<dyn ContainerRuntimeApi> = Arc::new(config.container.runtime());

    let postgres: Option<Arc<dyn PostgresAdmin>> = match config.storage.admin_database_url {
        Some(ref url) => {
            let admin = SqlxPostgresAdmin::connect_lazy(url, config.storage.statement_timeout())
                .context("configuring the administrative database connection")?;
            Some(Arc::new(admin) as Arc<dyn PostgresAdmin>)
        }
        None => {
            warn!("storage.admin_database_url is not set; postgres storages will fail");
            None
        }
    };

    let storage = StorageProvisioner::new(
        config.naming.namer(),
        postgres,
        runtime.clone(),
        config.storage.redis(config.preview.network.as_deref()),
    );
    let probe = HttpAppProbe::new(config.probe.timeout()).context("building app probe client")?;

    Ok(PreviewService::new(
        storage,
        runtime,
        Arc::new(probe),
        config.preview.clone(),
    ))
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let service = build_preview_service(&ctx.config)?;
    let state = AppState::new(service);
    let previews = state.previews.clone();
    let app = api::create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    if ctx.config.server.teardown_on_shutdown {
        let sessions = previews.sessions();
        info!("Tearing down {} preview(s)...", sessions.len());
        let keys: Vec<SessionKey> = sessions.iter().map(|s| s.key()).collect();
        let results =
            futures::future::join_all(keys.iter().map(|key| previews.teardown(key))).await;
        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                warn!("Failed to tear down {}: {}", key, e);
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn handle_watch(ctx: &RuntimeContext, cmd: WatchCommand) -> Result<()> {
    let poller = &ctx.config.poller;
    let api = HttpPreviewApi::new(&cmd.server, poller.request_timeout())?;
    let key = SessionKey::new(cmd.session.project_id, cmd.session.session_id);
    let mut watcher = PreviewWatcher::spawn(Arc::new(api), key.clone(), poller.poller_config());

    let mut rx = watcher.subscribe();
    let state = loop {
        let state = rx.borrow_and_update().clone();
        if !ctx.common.json && !ctx.common.yaml {
            eprintln!(
                "{}: {} ({}%, attempt {}/{})",
                key, state.phase, state.progress, state.attempts, state.max_attempts
            );
        }
        if state.is_settled() {
            break state;
        }
        if rx.changed().await.is_err() {
            break watcher.state();
        }
    };

    ctx.emit(&state, |s| match s.url {
        Some(ref url) => format!("{} {}", s.phase, url),
        None => s.phase.to_string(),
    })?;

    match state.phase {
        PreviewStatus::Ready if cmd.follow => {
            info!("Sending heartbeats for {} until interrupted", key);
            tokio::select! {
                _ = shutdown_signal() => {
                    watcher.cancel();
                    Ok(())
                }
                left = rx.wait_for(|s| s.phase != PreviewStatus::Ready) => {
                    drop(left);
                    let state = watcher.state();
                    Err(anyhow!(
                        "preview left ready: {}",
                        state.error.unwrap_or_else(|| state.phase.to_string())
                    ))
                }
            }
        }
        PreviewStatus::Ready => Ok(()),
        _ => Err(anyhow!(
            "preview failed to start: {}",
            state.error.unwrap_or_else(|| "unknown error".to_string())
        )),
    }
}

async fn handle_teardown(ctx: &RuntimeContext, cmd: SessionArgs) -> Result<()> {
    let service = build_preview_service(&ctx.config)?;
    let key = SessionKey::new(cmd.project_id, cmd.session_id);
    service
        .teardown(&key)
        .await
        .with_context(|| format!("tearing down {key}"))?;
    info!("Tore down {}", key);
    Ok(())
}

#[derive(Debug, Serialize)]
struct SessionNames {
    project_id: String,
    session_id: String,
    database: String,
    app_container: String,
    redis_container: String,
}

fn handle_names(ctx: &RuntimeContext, cmd: NamesCommand) -> Result<()> {
    let namer = ctx.config.naming.namer();
    let session_id = cmd
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let names = SessionNames {
        database: namer.database_name(&cmd.project_id, &session_id)?,
        app_container: namer.resource_name(&cmd.project_id, &session_id, APP_KIND)?,
        redis_container: namer.resource_name(&cmd.project_id, &session_id, REDIS_KIND)?,
        project_id: cmd.project_id,
        session_id,
    };

    ctx.emit(&names, |n| {
        format!(
            "database:        {}\napp container:   {}\nredis container: {}",
            n.database, n.app_container, n.redis_container
        )
    })
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    // A missing file was already written while loading the context
    if cmd.force {
        write_default_config(&ctx.config_file)?;
        info!("Wrote default config to {}", ctx.config_file.display());
    } else {
        info!(
            "Config at {} (use --force to overwrite)",
            ctx.config_file.display()
        );
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let shown = ctx.config.redacted();
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&shown).context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&shown).context("serializing config to YAML")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&shown).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Reset => {
            if !ctx.config_file.exists() {
                bail!("no config file at {}", ctx.config_file.display());
            }
            write_default_config(&ctx.config_file)
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

use anyhow::Result;
use apgwd::{config::GatewayConfig, Gateway};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "apgwd",
    about = "Access-point gateway — TLS WebSocket controller for device fleets",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for gateway.toml and the SQLite database
    #[arg(long, env = "APGWD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "APGWD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "APGWD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway in the foreground (default when no subcommand given).
    Serve,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let _file_guard = setup_logging(&log_level, args.log_file.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "apgwd starting");
    let config = GatewayConfig::new(args.data_dir, args.log);

    // The reactor pool: a fixed set of I/O workers multiplexing every
    // device connection.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.max_reactors.max(1))
        .thread_name("apgwd-reactor")
        .enable_all()
        .build()?;

    match args.command {
        None | Some(Command::Serve) => runtime.block_on(run_server(config)),
    }
}

async fn run_server(config: GatewayConfig) -> Result<()> {
    info!(
        data_dir = %config.data_dir.display(),
        listeners = config.listeners.len(),
        session_timeout = config.session_timeout,
        "config loaded"
    );
    if config.listeners.is_empty() {
        warn!("no [[listener]] sections in gateway.toml — devices have nowhere to connect");
    }
    if config.simulator_enabled() {
        info!(simulator_id = %config.simulator_id, "running as simulator instance");
    }

    let gateway = Gateway::start(config).await?;
    for addr in gateway.listener_addrs() {
        info!(addr = %addr, "accepting devices");
    }

    shutdown_signal().await;
    info!("shutdown signal received — draining sessions");
    gateway.stop().await;
    Ok(())
}

/// Resolves when a shutdown signal is received.
///
/// On Unix we listen for SIGTERM *and* Ctrl-C.
/// On other platforms we listen for Ctrl-C only.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("apgwd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            // Fall back to stdout-only rather than refusing to start.
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt()
                .with_env_filter(log_level)
                .compact()
                .init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        None
    }
}

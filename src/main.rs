use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use researchd::config::DaemonConfig;
use researchd::manager::TaskManager;
use researchd::notify::{NotificationSink, NullSink, WebhookSink};
use researchd::persistence::{SqliteTaskStore, TaskStore};
use researchd::pressure::{run_monitor_loop, PressureMonitor};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "researchd",
    about = "Research task lifecycle daemon — dedup, concurrency, eviction",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Data directory for the task database and config.toml
    #[arg(long, env = "RESEARCHD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RESEARCHD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "RESEARCHD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground (default when no subcommand given).
    Serve,
    /// Print effective configuration and exit.
    ///
    /// Shows the merged result of defaults, {data_dir}/config.toml, and
    /// environment overrides. Useful for verifying a config change before
    /// restarting the daemon.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Init once — must happen before any tracing calls.
    let config = DaemonConfig::new(args.data_dir.clone(), args.log.clone());
    let _file_guard = setup_logging(&config.log, args.log_file.as_deref(), &config.log_format);

    match args.command {
        Some(Command::Config) => {
            println!("data_dir    = {}", config.data_dir.display());
            println!("log         = {} ({})", config.log, config.log_format);
            println!("max_tasks   = {}", config.registry.max_tasks);
            println!("concurrency = {}", config.gate.max_concurrent);
            println!(
                "pressure    = {:.0}% / {:.0}% / {:.0}%",
                config.pressure.warning_percent,
                config.pressure.critical_percent,
                config.pressure.emergency_percent
            );
            println!(
                "webhook     = {}",
                config.notify.webhook_url.as_deref().unwrap_or("(none)")
            );
            Ok(())
        }
        None | Some(Command::Serve) => run_serve(config).await,
    }
}

async fn run_serve(config: DaemonConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir).with_context(|| {
        format!("cannot create data directory {}", config.data_dir.display())
    })?;
    install_panic_hook(config.data_dir.clone());
    check_crash_log(&config.data_dir);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        "researchd starting"
    );

    let store: Arc<dyn TaskStore> = Arc::new(
        SqliteTaskStore::new(&config.data_dir)
            .await
            .context("cannot open task database")?,
    );

    let sink: Arc<dyn NotificationSink> = match &config.notify.webhook_url {
        Some(url) => match WebhookSink::new(url.clone()) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!("webhook sink unavailable, alerts disabled: {e:#}");
                Arc::new(NullSink)
            }
        },
        None => Arc::new(NullSink),
    };

    let manager = Arc::new(TaskManager::new(&config, Arc::clone(&store), sink));

    let rehydrated = manager.rehydrate().await.context("boot rehydration failed")?;
    info!(rehydrated, "durable task records loaded");

    let monitor = Arc::new(PressureMonitor::new(
        config.pressure.clone(),
        manager.registry(),
        manager.gate(),
        manager.connections(),
    )?);
    let monitor_handle = tokio::spawn(run_monitor_loop(Arc::clone(&monitor)));

    // Periodic operational snapshot.
    let stats_manager = Arc::clone(&manager);
    let stats_monitor = Arc::clone(&monitor);
    let stats_handle = tokio::spawn(async move {
        let mut tick = tokio::time::interval(tokio::time::Duration::from_secs(300));
        tick.tick().await; // first tick fires immediately — skip it
        loop {
            tick.tick().await;
            let stats = stats_manager.stats().await;
            let level = stats_monitor.pressure_level().await;
            let health = stats_manager.health_check(level).await;
            info!(
                total = stats.registry.total_tasks,
                running = stats.running_executions,
                connections = stats.total_connections,
                ?level,
                ?health,
                "lifecycle snapshot"
            );
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for shutdown signal")?;
    info!("shutdown signal received");

    monitor_handle.abort();
    stats_handle.abort();
    store.close().await;
    info!("researchd stopped");
    Ok(())
}

/// Initialize the tracing subscriber as a layer stack: a terminal layer
/// (compact by default, JSON when `log_format` is `"json"`) plus, when
/// `log_file` is set, a daily-rolling file layer in the same format.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// If the log directory cannot be created the file layer is skipped with a
/// warning; logging itself never fails the boot.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{
        fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
    };

    let json = log_format == "json";
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = vec![if json {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().compact().boxed()
    }];

    let mut guard = None;
    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("researchd.log"));

        // tracing-appender opens the file lazily; the directory must exist.
        match std::fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, filename);
                let (non_blocking, g) = tracing_appender::non_blocking(appender);
                layers.push(if json {
                    fmt::layer().json().with_writer(non_blocking).boxed()
                } else {
                    fmt::layer().with_writer(non_blocking).boxed()
                });
                guard = Some(g);
            }
            Err(e) => eprintln!(
                "warn: could not create log directory '{}': {e}; logging to stdout only",
                dir.display()
            ),
        }
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(EnvFilter::new(log_level))
        .init();
    guard
}

/// Install a panic hook that writes panic info + backtrace to
/// `{data_dir}/crash.log`. The crash log is reported and removed on the next
/// startup (`check_crash_log`).
fn install_panic_hook(data_dir: std::path::PathBuf) {
    let original = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        // Original hook first (prints to stderr).
        original(info);

        let crash_path = data_dir.join("crash.log");
        let msg = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("unknown panic");

        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        let backtrace = std::backtrace::Backtrace::capture();
        let content = format!(
            "researchd panic at {location}\n\
             message: {msg}\n\
             version: {}\n\
             backtrace:\n{backtrace:#}\n",
            env!("CARGO_PKG_VERSION")
        );

        // Best-effort write — if this fails, we can't do much.
        let _ = std::fs::write(&crash_path, &content);
    }));
}

/// Check for a crash log from the previous run, log it at error level, then
/// delete it.
fn check_crash_log(data_dir: &std::path::Path) {
    let crash_path = data_dir.join("crash.log");
    match std::fs::read_to_string(&crash_path) {
        Ok(content) => {
            tracing::error!(
                crash_report = %content.trim(),
                "previous run ended with a panic — see crash report above"
            );
            let _ = std::fs::remove_file(&crash_path);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(err = %e, "could not read crash.log");
        }
    }
}

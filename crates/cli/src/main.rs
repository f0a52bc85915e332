use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobs::{JobContext, JobError, LogQueue, PipelineController, RunCallbacks, ThreadRegistry};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use webui::config::{normalize_base_url, DEFAULT_CANDIDATE_PORTS, DEFAULT_PORT_TEMPLATE};
use webui::health::MODELS_PATH;
use webui::process::DEFAULT_STOP_GRACE;
use webui::{
    BackendLauncher, ConnectionController, ConnectionOptions, ConnectionState, ProcessConfig,
    ProcessStatus, ProcessSupervisor, SettingsStore, WebUiConfig,
};

const LOG_QUEUE_CAPACITY: usize = 1000;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const TICK: Duration = Duration::from_millis(100);
const MIRROR_POLL: Duration = Duration::from_secs(1);
const MIRROR_MAX_FAILURES: u32 = 5;

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Stagehand - supervise a Stable Diffusion WebUI backend and follow its jobs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings file (defaults to settings.json in the app data directory)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait until a WebUI answers ready
    Probe {
        /// Base URL (defaults to the configured one)
        #[arg(long)]
        url: Option<String>,

        /// Seconds to wait before giving up
        #[arg(long, default_value = "10")]
        timeout: f64,

        /// Seconds between polls
        #[arg(long, default_value = "1")]
        interval: f64,
    },

    /// Look for a WebUI on candidate ports
    FindPort {
        /// URL template containing {port}
        #[arg(long, default_value = DEFAULT_PORT_TEMPLATE)]
        template: String,

        /// Comma-separated ports (defaults to 7860-7865)
        #[arg(long, value_delimiter = ',')]
        ports: Vec<u16>,
    },

    /// Connect to the configured WebUI, launching it if allowed
    Connect {
        /// Never launch the backend
        #[arg(long)]
        no_autostart: bool,
    },

    /// Print the resolved configuration and backend status as JSON
    Status,

    /// Connect, then mirror backend progress until the deadline
    Watch {
        /// Stop after this many seconds
        #[arg(long, default_value = "60")]
        max_seconds: u64,

        /// Never launch the backend
        #[arg(long)]
        no_autostart: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_queue = LogQueue::new(LOG_QUEUE_CAPACITY);
    let watching = matches!(cli.command, Commands::Watch { .. });
    init_logging(cli.verbose, watching.then(|| log_queue.clone()));

    let store = match &cli.settings {
        Some(path) => SettingsStore::open(path)?,
        None => SettingsStore::open_default()?,
    };
    let config = WebUiConfig::from_env(&store.settings())
        .with_context(|| format!("invalid settings in {:?}", store.path()))?;

    let registry = Arc::new(ThreadRegistry::new());
    let backend = Backend::new(config, Arc::clone(&registry));

    let result = match cli.command {
        Commands::Probe {
            url,
            timeout,
            interval,
        } => probe_command(&backend, url, timeout, interval),
        Commands::FindPort { template, ports } => find_port_command(&template, ports),
        Commands::Connect { no_autostart } => connect_command(&backend, !no_autostart),
        Commands::Status => status_command(&backend, store.path()),
        Commands::Watch {
            max_seconds,
            no_autostart,
        } => watch_command(&backend, &registry, &log_queue, max_seconds, !no_autostart),
    };

    let stats = registry.shutdown_all(SHUTDOWN_TIMEOUT);
    if stats.timed_out > 0 {
        warn!(?stats, "threads still running at exit\n{}", registry.dump_status());
    }
    flush_logs(&log_queue);
    if watching {
        println!("{}", serde_json::to_string(&stats)?);
    }
    result
}

/// Logs go to stderr, or into `queue` when a command drains them itself.
fn init_logging(verbose: bool, queue: Option<LogQueue>) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = match queue {
        Some(queue) => builder.with_ansi(false).with_writer(queue).try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

fn flush_logs(queue: &LogQueue) {
    for line in queue.drain() {
        eprintln!("{line}");
    }
    let dropped = queue.dropped();
    if dropped > 0 {
        eprintln!("({dropped} log lines dropped)");
    }
}

/// One supervisor and one connection controller sharing the registry.
struct Backend {
    config: WebUiConfig,
    supervisor: Arc<ProcessSupervisor>,
    connection: ConnectionController,
}

impl Backend {
    fn new(config: WebUiConfig, registry: Arc<ThreadRegistry>) -> Self {
        let supervisor = Arc::new(ProcessSupervisor::new(
            ProcessConfig::from_webui(&config),
            registry,
        ));
        let launcher: Arc<dyn BackendLauncher> = supervisor.clone();
        let connection = ConnectionController::new(
            config.base_url.clone(),
            Some(launcher),
            ConnectionOptions::from_config(&config),
        );

        let configured = config.base_url.clone();
        let rebind = Arc::clone(&supervisor);
        connection.on_ready(move |url| {
            if url != configured {
                rebind.set_base_url_override(Some(url.to_string()));
            }
        });
        connection.on_state_change(|state| info!(%state, "WebUI connection"));

        Self {
            config,
            supervisor,
            connection,
        }
    }

    /// Stops a backend this invocation launched. Its output pipes end with us.
    fn release(&self) {
        if self.supervisor.get_status().pid.is_some() {
            info!("stopping the WebUI launched by this run");
            self.supervisor.stop(DEFAULT_STOP_GRACE);
        }
    }

    fn print_output_tail(&self) {
        for line in self.supervisor.recent_output(20) {
            eprintln!("  {line}");
        }
    }
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        bail!("--{flag} must be a non-negative number of seconds");
    }
    Ok(Duration::from_secs_f64(value))
}

fn probe_command(backend: &Backend, url: Option<String>, timeout: f64, interval: f64) -> Result<()> {
    let url = match url {
        Some(raw) => normalize_base_url(&raw)?,
        None => backend.config.base_url.clone(),
    };
    let timeout = seconds(timeout, "timeout")?;
    let interval = seconds(interval, "interval")?;
    info!(%url, ?timeout, "probing WebUI");
    webui::wait_for_webui_ready(&url, timeout, interval)?;
    println!("{url} ready");
    Ok(())
}

fn find_port_command(template: &str, ports: Vec<u16>) -> Result<()> {
    if !template.contains("{port}") {
        bail!("template must contain {{port}}");
    }
    let ports = if ports.is_empty() {
        DEFAULT_CANDIDATE_PORTS.to_vec()
    } else {
        ports
    };
    match webui::find_webui_port(template, &ports) {
        Some(url) => {
            println!("{url}");
            Ok(())
        }
        None => bail!("no WebUI answered on ports {ports:?}"),
    }
}

fn connect_command(backend: &Backend, autostart: bool) -> Result<()> {
    let state = backend.connection.ensure_connected(autostart);
    println!("WebUI: {state} ({})", backend.connection.base_url());
    let outcome = if state == ConnectionState::Ready {
        Ok(())
    } else {
        backend.print_output_tail();
        Err(anyhow::anyhow!("WebUI not ready: {state}"))
    };
    backend.release();
    outcome
}

#[derive(Serialize)]
struct StatusReport<'a> {
    settings_path: &'a Path,
    base_url: &'a str,
    workdir: Option<&'a Path>,
    autostart_enabled: bool,
    initial_timeout_seconds: f64,
    retry_count: u32,
    retry_interval_seconds: f64,
    total_timeout_seconds: f64,
    reachable: bool,
    connection: ConnectionState,
    process: ProcessStatus,
}

fn status_command(backend: &Backend, settings_path: &Path) -> Result<()> {
    let config = &backend.config;
    let reachable =
        webui::probe_endpoint(&config.base_url, MODELS_PATH, config.initial_timeout).is_ready();
    let report = StatusReport {
        settings_path,
        base_url: &config.base_url,
        workdir: config.workdir.as_deref(),
        autostart_enabled: config.autostart_enabled,
        initial_timeout_seconds: config.initial_timeout.as_secs_f64(),
        retry_count: config.retry_count,
        retry_interval_seconds: config.retry_interval.as_secs_f64(),
        total_timeout_seconds: config.total_timeout.as_secs_f64(),
        reachable,
        connection: backend.connection.state(),
        process: backend.supervisor.get_status(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn watch_command(
    backend: &Backend,
    registry: &Arc<ThreadRegistry>,
    queue: &LogQueue,
    max_seconds: u64,
    autostart: bool,
) -> Result<()> {
    let state = backend.connection.ensure_connected(autostart);
    flush_logs(queue);
    if state != ConnectionState::Ready {
        backend.print_output_tail();
        backend.release();
        bail!("WebUI not ready: {state}");
    }

    let controller = PipelineController::new(Arc::clone(registry));
    controller.set_status_callback(|stage| println!("status: {stage}"));
    controller.set_progress_callback(|percent| println!("progress: {percent:.1}%"));
    controller.set_eta_callback(|eta| {
        if let Some(eta) = eta {
            println!("eta: {:.1}s", eta.as_secs_f64());
        }
    });

    let base_url = backend.connection.base_url();
    let started = controller.start_pipeline(
        move |ctx| mirror_progress(&ctx, &base_url),
        RunCallbacks::new()
            .on_complete(|polls: u64| info!(polls, "progress mirror finished"))
            .on_error(|err| error!(error = %err, "progress mirror failed")),
    );
    if !started {
        backend.release();
        bail!("pipeline refused to start in state {}", controller.state());
    }

    let deadline = Instant::now() + Duration::from_secs(max_seconds);
    while controller.is_running() && Instant::now() < deadline {
        flush_logs(queue);
        thread::sleep(TICK);
    }
    if controller.is_running() {
        controller.stop_pipeline();
    }
    if !controller.wait_for_idle(SHUTDOWN_TIMEOUT) {
        warn!(state = %controller.state(), "pipeline did not settle");
    }
    flush_logs(queue);
    backend.release();
    Ok(())
}

/// Polls the backend's progress endpoint into the controller. Finishes once
/// a job seen running has drained, returning the number of polls.
fn mirror_progress(ctx: &JobContext, base_url: &str) -> Result<u64, JobError> {
    let mut polls = 0u64;
    let mut failures = 0u32;
    let mut saw_busy = false;
    let mut last = None;
    loop {
        ctx.check_cancelled()?;
        match webui::fetch_progress(base_url, MIRROR_POLL) {
            Ok(progress) => {
                failures = 0;
                polls += 1;
                if progress.is_busy() {
                    saw_busy = true;
                } else if saw_busy {
                    return Ok(polls);
                }
                let snapshot = (progress.stage(), progress.percent(), progress.eta());
                if last.as_ref() != Some(&snapshot) {
                    ctx.report_progress(&snapshot.0, snapshot.1, snapshot.2);
                    last = Some(snapshot);
                }
            }
            Err(err) => {
                failures += 1;
                warn!(failures, error = %err, "progress poll failed");
                if failures >= MIRROR_MAX_FAILURES {
                    return Err(JobError::Failed(
                        err.context(format!("backend stopped answering after {failures} polls")),
                    ));
                }
            }
        }
        sleep_cancellable(ctx, MIRROR_POLL)?;
    }
}

fn sleep_cancellable(ctx: &JobContext, total: Duration) -> Result<(), JobError> {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        ctx.check_cancelled()?;
        thread::sleep(TICK.min(deadline.saturating_duration_since(Instant::now())));
    }
    Ok(())
}

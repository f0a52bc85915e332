use std::collections::{BTreeMap, VecDeque};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use jobs::{SharedChild, SpawnOptions, ThreadHandle, ThreadRegistry};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::WebUiConfig;
use crate::error::WebUiError;
use crate::health;

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const HEALTH_POLL: Duration = Duration::from_millis(250);
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const OUTPUT_CAPACITY: usize = 2000;

/// Something that can bring the backend up. Implemented by
/// [`ProcessSupervisor`]; tests substitute their own.
pub trait BackendLauncher: Send + Sync {
    fn launch(&self) -> Result<(), WebUiError>;
}

#[derive(Clone, Debug)]
pub struct ProcessConfig {
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Merged over the inherited environment.
    pub env: BTreeMap<String, String>,
    pub base_url: String,
    pub health_timeout: Duration,
}

impl ProcessConfig {
    pub fn from_webui(config: &WebUiConfig) -> Self {
        Self {
            command: config.command.clone(),
            working_dir: config.workdir.clone(),
            env: config.env.clone(),
            base_url: config.base_url.clone(),
            health_timeout: HEALTH_TIMEOUT,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ProcessStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub start_time: Option<DateTime<Local>>,
    pub last_exit_code: Option<i32>,
    pub command: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

struct ProcessHandle {
    child: SharedChild,
    started_at: DateTime<Local>,
    readers: Vec<ThreadHandle>,
}

/// Owns at most one WebUI child process.
///
/// `handle` only guards the reference; signalling and waiting happen on a
/// cloned [`SharedChild`] with the lock released. `lifecycle` serializes
/// start and stop against each other.
pub struct ProcessSupervisor {
    config: ProcessConfig,
    registry: Arc<ThreadRegistry>,
    base_url_override: RwLock<Option<String>>,
    lifecycle: Mutex<()>,
    handle: Mutex<Option<ProcessHandle>>,
    last_exit_code: Mutex<Option<i32>>,
    output: Arc<Mutex<VecDeque<String>>>,
}

impl ProcessSupervisor {
    pub fn new(config: ProcessConfig, registry: Arc<ThreadRegistry>) -> Self {
        Self {
            config,
            registry,
            base_url_override: RwLock::new(None),
            lifecycle: Mutex::new(()),
            handle: Mutex::new(None),
            last_exit_code: Mutex::new(None),
            output: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    pub fn base_url(&self) -> String {
        self.base_url_override
            .read()
            .clone()
            .unwrap_or_else(|| self.config.base_url.clone())
    }

    pub fn set_base_url_override(&self, url: Option<String>) {
        *self.base_url_override.write() = url;
    }

    pub fn is_running(&self) -> bool {
        let child = self.handle.lock().as_ref().map(|h| h.child.clone());
        let Some(child) = child else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!(target: "webui", pid = child.pid(), %status, "WebUI process exited on its own");
                self.finalize(Some(status));
                false
            }
            Err(err) => {
                warn!(target: "webui", pid = child.pid(), error = %err, "could not poll WebUI process");
                false
            }
        }
    }

    /// Launches the configured command unless a process is already running,
    /// in which case the current status is returned unchanged.
    pub fn start(&self) -> Result<ProcessStatus, WebUiError> {
        let _lifecycle = self.lifecycle.lock();
        if self.is_running() {
            debug!(target: "webui", "start requested while already running");
            return Ok(self.get_status());
        }

        let command_line = self.config.command.join(" ");
        let Some((program, args)) = self.config.command.split_first() else {
            return Err(WebUiError::InvalidConfig("WebUI command is empty".into()));
        };
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().map_err(|source| {
            error!(target: "webui", command = %command_line, error = %source, "failed to spawn WebUI");
            WebUiError::Startup {
                command: command_line.clone(),
                source,
            }
        })?;
        let child = if cfg!(unix) {
            SharedChild::group_leader(child)
        } else {
            SharedChild::new(child)
        };
        let pid = child.pid();
        info!(target: "webui", pid, command = %command_line, "WebUI process started");

        let mut readers = Vec::new();
        if let Some(stdout) = child.take_stdout() {
            readers.extend(self.spawn_reader(stdout, "stdout", pid));
        }
        if let Some(stderr) = child.take_stderr() {
            readers.extend(self.spawn_reader(stderr, "stderr", pid));
        }

        *self.handle.lock() = Some(ProcessHandle {
            child,
            started_at: Local::now(),
            readers,
        });
        Ok(self.get_status())
    }

    fn spawn_reader<R>(&self, stream: R, label: &'static str, pid: u32) -> Option<ThreadHandle>
    where
        R: Read + Send + 'static,
    {
        let output = Arc::clone(&self.output);
        let spawned = self.registry.spawn(
            format!("webui-{label}-{pid}"),
            SpawnOptions::default().purpose(format!("WebUI {label} reader")),
            move || read_lines(stream, label, &output),
        );
        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(target: "webui", pid, stream = label, error = %err, "output reader not started");
                None
            }
        }
    }

    /// Probes the configured (or overridden) base URL. Never fails.
    pub fn check_health(&self) -> bool {
        let url = self.base_url();
        match health::wait_for_webui_ready(&url, self.config.health_timeout, HEALTH_POLL) {
            Ok(ready) => ready,
            Err(err) => {
                debug!(target: "webui", %url, error = %err, "health check failed");
                false
            }
        }
    }

    /// Restarts an unhealthy process or starts a missing one, then reports
    /// health.
    pub fn ensure_running(&self) -> bool {
        if self.is_running() {
            if self.check_health() {
                return true;
            }
            warn!(target: "webui", "WebUI running but unhealthy; restarting");
            self.stop(DEFAULT_STOP_GRACE);
        }
        if let Err(err) = self.start() {
            error!(target: "webui", error = %err, "could not start WebUI");
            return false;
        }
        self.check_health()
    }

    /// Terminates the process (SIGTERM, then kill after `grace`) and always
    /// clears the handle. Returns `true` when nothing is left running.
    pub fn stop(&self, grace: Duration) -> bool {
        let _lifecycle = self.lifecycle.lock();
        let child = self.handle.lock().as_ref().map(|h| h.child.clone());
        let Some(child) = child else {
            return true;
        };
        info!(target: "webui", pid = child.pid(), ?grace, "stopping WebUI");
        let status = child.terminate(grace);
        if status.is_none() {
            error!(target: "webui", pid = child.pid(), "WebUI process could not be reaped");
        }
        self.finalize(status);
        status.is_some()
    }

    fn finalize(&self, status: Option<ExitStatus>) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if let Some(status) = status {
            *self.last_exit_code.lock() = exit_code(status);
        }
        for reader in handle.readers {
            if !reader.join_timeout(READER_JOIN_TIMEOUT) {
                warn!(target: "webui", thread = reader.name(), "output reader still blocked; abandoning");
            }
            self.registry.unregister(&reader);
        }
        debug!(target: "webui", pid = handle.child.pid(), "WebUI handle released");
    }

    pub fn get_status(&self) -> ProcessStatus {
        let (running, pid, start_time) = match self.handle.lock().as_ref() {
            Some(h) => (h.child.is_running(), Some(h.child.pid()), Some(h.started_at)),
            None => (false, None, None),
        };
        ProcessStatus {
            running,
            pid,
            start_time,
            last_exit_code: *self.last_exit_code.lock(),
            command: self.config.command.clone(),
            working_dir: self.config.working_dir.clone(),
        }
    }

    /// Last `max_lines` lines captured from the process, oldest first.
    pub fn recent_output(&self, max_lines: usize) -> Vec<String> {
        let output = self.output.lock();
        let skip = output.len().saturating_sub(max_lines);
        output.iter().skip(skip).cloned().collect()
    }
}

impl BackendLauncher for ProcessSupervisor {
    fn launch(&self) -> Result<(), WebUiError> {
        self.start().map(|_| ())
    }
}

fn read_lines<R: Read>(stream: R, label: &'static str, output: &Mutex<VecDeque<String>>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\r', '\n']);
                info!(target: "webui", stream = label, "{line}");
                let mut output = output.lock();
                if output.len() == OUTPUT_CAPACITY {
                    output.pop_front();
                }
                output.push_back(format!("[{label}] {line}"));
            }
            Err(err) => {
                warn!(target: "webui", stream = label, error = %err, "output reader failed");
                break;
            }
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    // Signal deaths are reported as the negated signal number.
    status.code().or_else(|| status.signal().map(|sig| -sig))
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

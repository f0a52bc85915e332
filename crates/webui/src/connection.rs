//! Answers "is the backend usable right now", autostarting and retrying as
//! configured and falling back to port discovery.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{WebUiConfig, DEFAULT_CANDIDATE_PORTS, DEFAULT_PORT_TEMPLATE};
use crate::health;
use crate::process::BackendLauncher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Ready,
    Error,
    Disabled,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Ready => "READY",
            ConnectionState::Error => "ERROR",
            ConnectionState::Disabled => "DISABLED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub autostart_enabled: bool,
    pub initial_timeout: Duration,
    pub retry_count: u32,
    pub retry_interval: Duration,
    pub total_timeout: Duration,
    /// Pause after launching before the first retry.
    pub settle_interval: Duration,
    pub poll_interval: Duration,
    pub port_template: String,
    pub candidate_ports: Vec<u16>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&WebUiConfig::default())
    }
}

impl ConnectionOptions {
    pub fn from_config(config: &WebUiConfig) -> Self {
        Self {
            autostart_enabled: config.autostart_enabled,
            initial_timeout: config.initial_timeout,
            retry_count: config.retry_count,
            retry_interval: config.retry_interval,
            total_timeout: config.total_timeout,
            settle_interval: Duration::from_secs(3),
            poll_interval: Duration::from_millis(500),
            port_template: DEFAULT_PORT_TEMPLATE.into(),
            candidate_ports: DEFAULT_CANDIDATE_PORTS.to_vec(),
        }
    }
}

type ReadyCallback = Arc<dyn Fn(&str) + Send + Sync>;
type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

pub struct ConnectionController {
    base_url: RwLock<String>,
    launcher: Option<Arc<dyn BackendLauncher>>,
    options: ConnectionOptions,
    state: Mutex<ConnectionState>,
    disabled: AtomicBool,
    attempt: Mutex<()>,
    ready_callbacks: Mutex<Vec<ReadyCallback>>,
    state_callbacks: Mutex<Vec<StateCallback>>,
}

impl ConnectionController {
    pub fn new(
        base_url: impl Into<String>,
        launcher: Option<Arc<dyn BackendLauncher>>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            base_url: RwLock::new(base_url.into()),
            launcher,
            options,
            state: Mutex::new(ConnectionState::Disconnected),
            disabled: AtomicBool::new(false),
            attempt: Mutex::new(()),
            ready_callbacks: Mutex::new(Vec::new()),
            state_callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url.read().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
        if disabled {
            self.set_state(ConnectionState::Disabled);
        } else if self.state() == ConnectionState::Disabled {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Registers a callback fired with the base URL whenever the backend
    /// becomes ready. Runs inside the connection attempt, so it must not call
    /// `ensure_connected` or `reconnect`.
    pub fn on_ready<F>(&self, cb: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.ready_callbacks.lock().push(Arc::new(cb));
    }

    pub fn on_state_change<F>(&self, cb: F)
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.state_callbacks.lock().push(Arc::new(cb));
    }

    /// Runs one connection attempt. Concurrent callers queue behind the
    /// attempt in progress. Bounded by `total_timeout` plus port discovery.
    pub fn ensure_connected(&self, autostart: bool) -> ConnectionState {
        let _attempt = self.attempt.lock();
        if self.disabled.load(Ordering::SeqCst) {
            self.set_state(ConnectionState::Disabled);
            return ConnectionState::Disabled;
        }

        let deadline = Instant::now() + self.options.total_timeout;
        self.set_state(ConnectionState::Connecting);
        let url = self.base_url();

        if self.probe(&url, self.options.initial_timeout, deadline) {
            return self.mark_ready(&url);
        }

        if !autostart || !self.options.autostart_enabled {
            info!(target: "webui", %url, autostart, enabled = self.options.autostart_enabled, "WebUI not ready and autostart not permitted");
            return self.fail();
        }
        let Some(launcher) = self.launcher.as_ref() else {
            warn!(target: "webui", "autostart requested but no launcher configured");
            return self.fail();
        };
        info!(target: "webui", %url, "launching WebUI");
        if let Err(err) = launcher.launch() {
            error!(target: "webui", error = %err, "WebUI launch failed");
            return self.fail();
        }

        sleep_until_capped(self.options.settle_interval, deadline);
        for attempt in 1..=self.options.retry_count {
            if Instant::now() >= deadline {
                warn!(target: "webui", attempt, total = ?self.options.total_timeout, "connection attempt exceeded its total timeout");
                break;
            }
            if self.probe(&url, self.options.initial_timeout, deadline) {
                return self.mark_ready(&url);
            }
            debug!(target: "webui", attempt, retries = self.options.retry_count, "WebUI not ready yet");
            if attempt < self.options.retry_count {
                sleep_until_capped(self.options.retry_interval, deadline);
            }
        }

        if self.options.candidate_ports.is_empty() {
            return self.fail();
        }
        info!(target: "webui", template = %self.options.port_template, "trying port discovery");
        if let Some(found) =
            health::find_webui_port(&self.options.port_template, &self.options.candidate_ports)
        {
            if found != url {
                info!(target: "webui", from = %url, to = %found, "rebinding WebUI base URL");
                *self.base_url.write() = found.clone();
            }
            if self.probe(&found, self.options.initial_timeout, Instant::now() + self.options.initial_timeout) {
                return self.mark_ready(&found);
            }
        }
        self.fail()
    }

    /// User-triggered retry: resets to `Disconnected`, then connects with
    /// autostart. A panic inside the attempt is reported as `Error`.
    pub fn reconnect(&self) -> ConnectionState {
        self.set_state(ConnectionState::Disconnected);
        match panic::catch_unwind(AssertUnwindSafe(|| self.ensure_connected(true))) {
            Ok(state) => state,
            Err(_) => {
                error!(target: "webui", "reconnect attempt panicked");
                self.set_state(ConnectionState::Error);
                ConnectionState::Error
            }
        }
    }

    fn probe(&self, url: &str, timeout: Duration, deadline: Instant) -> bool {
        let timeout = timeout.min(deadline.saturating_duration_since(Instant::now()));
        match health::wait_for_webui_ready(url, timeout, self.options.poll_interval) {
            Ok(ready) => ready,
            Err(err) => {
                debug!(target: "webui", error = %err, "probe failed");
                false
            }
        }
    }

    fn mark_ready(&self, url: &str) -> ConnectionState {
        self.set_state(ConnectionState::Ready);
        info!(target: "webui", %url, "WebUI ready");
        let callbacks: Vec<ReadyCallback> = self.ready_callbacks.lock().clone();
        for cb in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(url))).is_err() {
                error!(target: "webui", "on_ready callback panicked");
            }
        }
        ConnectionState::Ready
    }

    fn fail(&self) -> ConnectionState {
        self.set_state(ConnectionState::Error);
        ConnectionState::Error
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), next);
        if previous == next {
            return;
        }
        debug!(target: "webui", from = %previous, to = %next, "connection state changed");
        let callbacks: Vec<StateCallback> = self.state_callbacks.lock().clone();
        for cb in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| cb(next))).is_err() {
                error!(target: "webui", "state callback panicked");
            }
        }
    }
}

fn sleep_until_capped(duration: Duration, deadline: Instant) {
    let remaining = deadline.saturating_duration_since(Instant::now());
    let nap = duration.min(remaining);
    if !nap.is_zero() {
        thread::sleep(nap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_options() -> ConnectionOptions {
        ConnectionOptions {
            autostart_enabled: true,
            initial_timeout: Duration::from_millis(100),
            retry_count: 2,
            retry_interval: Duration::from_millis(50),
            total_timeout: Duration::from_secs(2),
            settle_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(50),
            port_template: DEFAULT_PORT_TEMPLATE.into(),
            candidate_ports: Vec::new(),
        }
    }

    #[test]
    fn disabled_short_circuits() {
        let controller = ConnectionController::new("http://127.0.0.1:9", None, quick_options());
        controller.set_disabled(true);
        assert_eq!(controller.ensure_connected(true), ConnectionState::Disabled);
        controller.set_disabled(false);
        assert_eq!(controller.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn state_callbacks_see_each_change_once() {
        let controller = ConnectionController::new("http://127.0.0.1:9", None, quick_options());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        controller.on_state_change(move |state| sink.lock().push(state));
        controller.on_state_change(|_| panic!("misbehaving listener"));

        assert_eq!(controller.ensure_connected(true), ConnectionState::Error);
        assert_eq!(
            *seen.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Error]
        );
    }

    #[test]
    fn state_names_are_stable() {
        assert_eq!(ConnectionState::Ready.to_string(), "READY");
        assert_eq!(
            serde_json::to_string(&ConnectionState::Disabled).unwrap(),
            "\"DISABLED\""
        );
    }
}

//! Stateless readiness probes for the WebUI HTTP API.

use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info};

use crate::error::WebUiError;

pub const MODELS_PATH: &str = "/sdapi/v1/sd-models";
pub const OPTIONS_PATH: &str = "/sdapi/v1/options";
pub const PROGRESS_PATH: &str = "/sdapi/v1/progress";

/// Probe timeout used for each candidate during port discovery.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(1500);
const DISCOVERY_POLL: Duration = Duration::from_millis(250);

const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const MIN_REQUEST_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready,
    NotReady(String),
}

impl ProbeOutcome {
    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeOutcome::Ready)
    }
}

pub fn endpoint_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new().build()
}

/// One GET against `base_url + path`. Ready means HTTP 200 with a JSON array
/// or object body.
pub fn probe_endpoint(base_url: &str, path: &str, timeout: Duration) -> ProbeOutcome {
    probe(&agent(), &endpoint_url(base_url, path), timeout, true)
}

fn probe(agent: &ureq::Agent, url: &str, timeout: Duration, require_json: bool) -> ProbeOutcome {
    match agent.get(url).timeout(timeout).call() {
        Ok(resp) => {
            let status = resp.status();
            if status != 200 {
                return ProbeOutcome::NotReady(format!("HTTP {status}"));
            }
            if !require_json {
                return ProbeOutcome::Ready;
            }
            match resp.into_json::<Value>() {
                Ok(Value::Array(_)) | Ok(Value::Object(_)) => ProbeOutcome::Ready,
                Ok(other) => ProbeOutcome::NotReady(format!("unexpected JSON body: {other}")),
                Err(err) => ProbeOutcome::NotReady(format!("invalid JSON body: {err}")),
            }
        }
        Err(ureq::Error::Status(code, _)) => ProbeOutcome::NotReady(format!("HTTP {code}")),
        Err(ureq::Error::Transport(err)) => ProbeOutcome::NotReady(err.to_string()),
    }
}

fn request_timeout(deadline: Instant) -> Duration {
    deadline
        .saturating_duration_since(Instant::now())
        .clamp(MIN_REQUEST_TIMEOUT, MAX_REQUEST_TIMEOUT)
}

/// Polls the models and options endpoints until one answers ready or
/// `timeout` elapses. The progress endpoint is only consulted to tell a
/// loading process apart from an unreachable one.
pub fn wait_for_webui_ready(
    base_url: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<bool, WebUiError> {
    let started = Instant::now();
    let deadline = started + timeout;
    let agent = agent();
    let mut last_endpoint = MODELS_PATH;
    let mut last_error = String::from("no probe completed");
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        for path in [MODELS_PATH, OPTIONS_PATH] {
            let url = endpoint_url(base_url, path);
            match probe(&agent, &url, request_timeout(deadline), true) {
                ProbeOutcome::Ready => {
                    debug!(target: "webui", %base_url, endpoint = path, attempt, elapsed = ?started.elapsed(), "WebUI ready");
                    return Ok(true);
                }
                ProbeOutcome::NotReady(message) => {
                    last_endpoint = path;
                    last_error = message;
                }
            }
        }

        let progress = endpoint_url(base_url, PROGRESS_PATH);
        if probe(&agent, &progress, request_timeout(deadline), false).is_ready() {
            info!(target: "webui", %base_url, attempt, "WebUI process is up but still loading");
        } else {
            debug!(target: "webui", %base_url, attempt, endpoint = last_endpoint, error = %last_error, "WebUI not reachable yet");
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WebUiError::HealthCheckTimeout {
                base_url: base_url.to_string(),
                waited: started.elapsed(),
                endpoint: last_endpoint.to_string(),
                message: last_error,
            });
        }
        thread::sleep(poll_interval.min(deadline - now));
    }
}

/// Tries `url_template` (containing `{port}`) for each candidate port and
/// returns the first URL that answers ready.
pub fn find_webui_port(url_template: &str, candidate_ports: &[u16]) -> Option<String> {
    for port in candidate_ports {
        let url = url_template.replace("{port}", &port.to_string());
        match wait_for_webui_ready(&url, DISCOVERY_TIMEOUT, DISCOVERY_POLL) {
            Ok(_) => {
                info!(target: "webui", %url, "discovered WebUI on candidate port");
                return Some(url);
            }
            Err(err) => debug!(target: "webui", port, error = %err, "candidate port not ready"),
        }
    }
    None
}

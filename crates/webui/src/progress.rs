use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::health::{endpoint_url, PROGRESS_PATH};

pub const STAGE_WAITING: &str = "Waiting";

/// Body of `GET /sdapi/v1/progress`.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendProgress {
    pub progress: f64,
    pub eta_relative: f64,
    pub state: BackendState,
    pub textinfo: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendState {
    pub job: String,
    pub job_count: i64,
    pub job_no: i64,
    pub sampling_step: i64,
    pub sampling_steps: i64,
    pub interrupted: bool,
    pub skipped: bool,
}

impl BackendProgress {
    pub fn is_busy(&self) -> bool {
        self.state.job_count > 0 || self.progress > 0.0
    }

    pub fn stage(&self) -> String {
        if !self.is_busy() {
            return STAGE_WAITING.into();
        }
        let job = self.state.job.trim();
        let name = if job.is_empty() { "Generating" } else { job };
        if self.state.sampling_steps > 0 {
            format!("{name} ({}/{})", self.state.sampling_step, self.state.sampling_steps)
        } else {
            name.to_string()
        }
    }

    pub fn percent(&self) -> f32 {
        (self.progress * 100.0).clamp(0.0, 100.0) as f32
    }

    pub fn eta(&self) -> Option<Duration> {
        (self.eta_relative.is_finite() && self.eta_relative > 0.0)
            .then(|| Duration::from_secs_f64(self.eta_relative))
    }
}

pub fn fetch_progress(base_url: &str, timeout: Duration) -> Result<BackendProgress> {
    let url = format!("{}?skip_current_image=true", endpoint_url(base_url, PROGRESS_PATH));
    ureq::get(&url)
        .timeout(timeout)
        .call()
        .with_context(|| format!("GET {url}"))?
        .into_json()
        .with_context(|| format!("decoding progress from {url}"))
}

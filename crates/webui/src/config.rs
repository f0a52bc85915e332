//! Persisted WebUI connection settings and the validated runtime form.
//!
//! Settings live in `settings.json` under the app data directory. Environment
//! variables override stored values when present; [`WebUiConfig::resolve`]
//! applies them once and validates the result.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::WebUiError;

pub const APP_DIR_NAME: &str = "stagehand";
pub const SETTINGS_FILE: &str = "settings.json";
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:7860";
pub const DEFAULT_PORT_TEMPLATE: &str = "http://127.0.0.1:{port}";
/// Ports the A1111 launcher walks through when 7860 is taken.
pub const DEFAULT_CANDIDATE_PORTS: [u16; 6] = [7860, 7861, 7862, 7863, 7864, 7865];

pub const ENV_BASE_URL: &str = "STAGEHAND_WEBUI_BASE_URL";
pub const ENV_WORKDIR: &str = "STAGEHAND_WEBUI_WORKDIR";
pub const ENV_AUTOSTART: &str = "STAGEHAND_WEBUI_AUTOSTART";
pub const ENV_INITIAL_TIMEOUT: &str = "STAGEHAND_WEBUI_HEALTH_INITIAL_TIMEOUT";
pub const ENV_RETRY_COUNT: &str = "STAGEHAND_WEBUI_HEALTH_RETRY_COUNT";
pub const ENV_RETRY_INTERVAL: &str = "STAGEHAND_WEBUI_HEALTH_RETRY_INTERVAL";
pub const ENV_TOTAL_TIMEOUT: &str = "STAGEHAND_WEBUI_HEALTH_TOTAL_TIMEOUT";

pub fn app_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR_NAME)
}

fn default_command() -> Vec<String> {
    if cfg!(target_os = "windows") {
        vec!["webui-user.bat".into()]
    } else {
        vec!["./webui.sh".into(), "--api".into()]
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebUiSettings {
    pub webui_base_url: String,
    pub webui_workdir: Option<PathBuf>,
    pub webui_autostart_enabled: bool,
    pub webui_health_initial_timeout_seconds: f64,
    pub webui_health_retry_count: u32,
    pub webui_health_retry_interval_seconds: f64,
    pub webui_health_total_timeout_seconds: f64,
    pub webui_command: Vec<String>,
    pub webui_env: BTreeMap<String, String>,
}

impl Default for WebUiSettings {
    fn default() -> Self {
        Self {
            webui_base_url: DEFAULT_BASE_URL.into(),
            webui_workdir: None,
            webui_autostart_enabled: true,
            webui_health_initial_timeout_seconds: 2.0,
            webui_health_retry_count: 30,
            webui_health_retry_interval_seconds: 2.0,
            webui_health_total_timeout_seconds: 120.0,
            webui_command: default_command(),
            webui_env: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: RwLock<WebUiSettings>,
}

impl SettingsStore {
    pub fn open_default() -> Result<Self> {
        Self::open(app_data_dir().join(SETTINGS_FILE))
    }

    /// Loads `path` if it exists. A missing file yields defaults and is only
    /// written on the first [`SettingsStore::update`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let data = fs::read(&path)
                .with_context(|| format!("failed to read settings file {path:?}"))?;
            serde_json::from_slice(&data)
                .with_context(|| format!("failed to parse settings from {path:?}"))?
        } else {
            WebUiSettings::default()
        };
        Ok(Self {
            path,
            settings: RwLock::new(settings),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> WebUiSettings {
        self.settings.read().clone()
    }

    pub fn update<F>(&self, mutate: F) -> Result<WebUiSettings>
    where
        F: FnOnce(&mut WebUiSettings),
    {
        let mut guard = self.settings.write();
        mutate(&mut guard);
        let snapshot = guard.clone();
        self.persist(&snapshot)?;
        Ok(snapshot)
    }

    fn persist(&self, settings: &WebUiSettings) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create settings directory {dir:?}"))?;
        }
        let data = serde_json::to_vec_pretty(settings)?;
        fs::write(&self.path, data)
            .with_context(|| format!("failed to write settings to {:?}", self.path))?;
        Ok(())
    }
}

/// Validated connection parameters, built once at startup.
#[derive(Clone, Debug, PartialEq)]
pub struct WebUiConfig {
    /// Normalized, without a trailing slash.
    pub base_url: String,
    pub workdir: Option<PathBuf>,
    pub autostart_enabled: bool,
    pub initial_timeout: Duration,
    pub retry_count: u32,
    pub retry_interval: Duration,
    pub total_timeout: Duration,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl WebUiConfig {
    /// Resolves against the process environment.
    pub fn from_env(settings: &WebUiSettings) -> Result<Self, WebUiError> {
        Self::resolve(settings, |key| std::env::var(key).ok())
    }

    /// Applies overrides from `lookup` on top of `settings` and validates.
    /// Unparseable override values are logged and ignored.
    pub fn resolve<F>(settings: &WebUiSettings, lookup: F) -> Result<Self, WebUiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw_url = lookup(ENV_BASE_URL).unwrap_or_else(|| settings.webui_base_url.clone());
        let workdir = lookup(ENV_WORKDIR)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .or_else(|| settings.webui_workdir.clone());
        let autostart_enabled = override_with(&lookup, ENV_AUTOSTART, parse_bool)
            .unwrap_or(settings.webui_autostart_enabled);
        let initial = override_with(&lookup, ENV_INITIAL_TIMEOUT, parse_f64)
            .unwrap_or(settings.webui_health_initial_timeout_seconds);
        let retry_count = override_with(&lookup, ENV_RETRY_COUNT, |v| v.trim().parse().ok())
            .unwrap_or(settings.webui_health_retry_count);
        let interval = override_with(&lookup, ENV_RETRY_INTERVAL, parse_f64)
            .unwrap_or(settings.webui_health_retry_interval_seconds);
        let total = override_with(&lookup, ENV_TOTAL_TIMEOUT, parse_f64)
            .unwrap_or(settings.webui_health_total_timeout_seconds);

        let command: Vec<String> = settings
            .webui_command
            .iter()
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect();
        if autostart_enabled && command.is_empty() {
            return Err(WebUiError::InvalidConfig(
                "autostart is enabled but webui_command is empty".into(),
            ));
        }

        Ok(Self {
            base_url: normalize_base_url(&raw_url)?,
            workdir,
            autostart_enabled,
            initial_timeout: seconds("webui_health_initial_timeout_seconds", initial)?,
            retry_count,
            retry_interval: seconds("webui_health_retry_interval_seconds", interval)?,
            total_timeout: seconds("webui_health_total_timeout_seconds", total)?,
            command,
            env: settings.webui_env.clone(),
        })
    }
}

impl Default for WebUiConfig {
    fn default() -> Self {
        let settings = WebUiSettings::default();
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            workdir: None,
            autostart_enabled: settings.webui_autostart_enabled,
            initial_timeout: Duration::from_secs_f64(settings.webui_health_initial_timeout_seconds),
            retry_count: settings.webui_health_retry_count,
            retry_interval: Duration::from_secs_f64(settings.webui_health_retry_interval_seconds),
            total_timeout: Duration::from_secs_f64(settings.webui_health_total_timeout_seconds),
            command: settings.webui_command,
            env: settings.webui_env,
        }
    }
}

fn override_with<T, L, P>(lookup: &L, key: &str, parse: P) -> Option<T>
where
    L: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    let raw = lookup(key)?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(target: "webui", key, value = %raw, "ignoring unparseable environment override");
    }
    parsed
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enable" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disable" | "disabled" => Some(false),
        _ => None,
    }
}

fn parse_f64(value: &str) -> Option<f64> {
    value.trim().parse().ok()
}

fn seconds(key: &str, value: f64) -> Result<Duration, WebUiError> {
    if !value.is_finite() || value < 0.0 {
        return Err(WebUiError::InvalidConfig(format!(
            "{key} must be a non-negative number of seconds, got {value}"
        )));
    }
    Ok(Duration::from_secs_f64(value))
}

/// Accepts `host:port`, `http://host:port/` and similar, returning
/// `scheme://host[:port][/path]` with trailing slashes removed.
pub fn normalize_base_url(raw: &str) -> Result<String, WebUiError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(WebUiError::InvalidConfig("webui_base_url is empty".into()));
    }
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let url = Url::parse(&candidate)
        .map_err(|err| WebUiError::InvalidConfig(format!("invalid webui_base_url {raw:?}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(WebUiError::InvalidConfig(format!(
            "webui_base_url must use http or https, got {}",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(WebUiError::InvalidConfig(format!(
            "webui_base_url {raw:?} has no host"
        )));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

//! Supervision of the Stable Diffusion WebUI backend: readiness probes, the
//! child process that serves the API and the connection state machine the
//! front end watches.

pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod process;
pub mod progress;

pub use config::{SettingsStore, WebUiConfig, WebUiSettings};
pub use connection::{ConnectionController, ConnectionOptions, ConnectionState};
pub use error::WebUiError;
pub use health::{find_webui_port, probe_endpoint, wait_for_webui_ready, ProbeOutcome};
pub use process::{BackendLauncher, ProcessConfig, ProcessStatus, ProcessSupervisor};
pub use progress::{fetch_progress, BackendProgress};

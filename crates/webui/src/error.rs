use std::io;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WebUiError {
    #[error("failed to start WebUI process `{command}`: {source}")]
    Startup {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("WebUI at {base_url} not ready after {waited:?}; last error from {endpoint}: {message}")]
    HealthCheckTimeout {
        base_url: String,
        waited: Duration,
        endpoint: String,
        message: String,
    },
    #[error("invalid WebUI configuration: {0}")]
    InvalidConfig(String),
}

use std::io;

use thiserror::Error;

/// Outcome of a job other than a produced value.
///
/// `Cancelled` is control flow, not a failure: the job observed its
/// [`CancelToken`](crate::CancelToken) and unwound.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl JobError {
    pub fn failed(msg: impl std::fmt::Display) -> Self {
        JobError::Failed(anyhow::anyhow!("{msg}"))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("thread spawned without a name")]
    MissingName,
    #[error("thread registry is shutting down; refusing to spawn `{0}`")]
    ShuttingDown(String),
    #[error("failed to spawn thread `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },
}

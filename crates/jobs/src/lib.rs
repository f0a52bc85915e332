//! Background job lifecycle: cooperative cancellation, tracked threads and
//! the pipeline controller that ties a run's worker, cleanup and progress
//! reporting together.

pub mod cancel;
pub mod controller;
pub mod error;
pub mod progress;
pub mod registry;
pub mod signal;
pub mod state;
pub mod subprocess;

pub use cancel::CancelToken;
pub use controller::{ControllerOptions, JobContext, PipelineController, RunCallbacks};
pub use error::{JobError, RegistryError};
pub use progress::{LogQueue, ProgressEvent, ProgressSnapshot};
pub use registry::{ShutdownStats, SpawnOptions, ThreadHandle, ThreadRegistry, TrackedThread};
pub use signal::Signal;
pub use state::{RunState, RunStateMachine};
pub use subprocess::SharedChild;

//! Top-level orchestration of one pipeline run at a time.
//!
//! A run is `Idle -> Running -> (complete | cancelled | failed) -> cleanup`,
//! with `Stopping` entered only through [`PipelineController::stop_pipeline`].
//! Every run gets a fresh epoch; cleanup tasks carry the epoch they were
//! scheduled for and do nothing once a newer run has started.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::process::Child;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::progress::{
    ProgressEvent, ProgressSink, ProgressSnapshot, STAGE_CANCELLED, STAGE_ERROR, STAGE_IDLE,
};
use crate::registry::panic_message;
use crate::{
    CancelToken, JobError, RunState, RunStateMachine, SharedChild, Signal, SpawnOptions,
    ThreadHandle, ThreadRegistry,
};

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Time a registered subprocess gets to exit after SIGTERM before it is killed.
    pub subprocess_grace: Duration,
    /// Upper bound cleanup waits for the worker thread to unwind.
    pub worker_join_timeout: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            subprocess_grace: Duration::from_secs(5),
            worker_join_timeout: Duration::from_secs(30),
        }
    }
}

type CompleteCallback<T> = Box<dyn FnOnce(T) + Send>;
type ErrorCallback = Box<dyn FnOnce(&anyhow::Error) + Send>;

pub struct RunCallbacks<T> {
    on_complete: Option<CompleteCallback<T>>,
    on_error: Option<ErrorCallback>,
}

impl<T> Default for RunCallbacks<T> {
    fn default() -> Self {
        Self {
            on_complete: None,
            on_error: None,
        }
    }
}

impl<T> RunCallbacks<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_complete(mut self, f: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&anyhow::Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }
}

#[derive(Default)]
struct Lifecycle {
    epoch: u64,
    worker: Option<ThreadHandle>,
    stop_in_progress: bool,
    cleanup_epoch: Option<u64>,
    cancelled: bool,
    errored: bool,
}

struct Inner {
    state: RunStateMachine,
    cancel: CancelToken,
    registry: Arc<ThreadRegistry>,
    options: ControllerOptions,
    lifecycle: Mutex<Lifecycle>,
    cleanup_done: Signal,
    lifecycle_done: Signal,
    subprocess: Mutex<Option<SharedChild>>,
    progress: ProgressSink,
}

/// Handle given to a running job: cancellation, progress and subprocess hooks.
pub struct JobContext {
    inner: Arc<Inner>,
    epoch: u64,
}

impl JobContext {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<(), JobError> {
        self.inner.cancel.check()
    }

    pub fn report_progress(&self, stage: &str, percent: f32, eta: Option<Duration>) {
        if !self.inner.is_current(self.epoch) {
            debug!(target: "pipeline", epoch = self.epoch, %stage, "dropping progress from stale run");
            return;
        }
        self.inner.report_progress(stage, percent, eta);
    }

    /// Hands the controller a child process to kill if the run is stopped.
    pub fn register_subprocess(&self, child: Child) -> SharedChild {
        let shared = SharedChild::new(child);
        if self.inner.is_current(self.epoch) {
            self.inner.register_subprocess(shared.clone());
        } else {
            warn!(target: "pipeline", epoch = self.epoch, pid = shared.pid(), "stale run registered a subprocess; not tracking it");
        }
        shared
    }

    pub fn unregister_subprocess(&self) -> Option<SharedChild> {
        if self.inner.is_current(self.epoch) {
            self.inner.subprocess.lock().take()
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct PipelineController {
    inner: Arc<Inner>,
}

impl PipelineController {
    pub fn new(registry: Arc<ThreadRegistry>) -> Self {
        Self::with_options(registry, ControllerOptions::default())
    }

    pub fn with_options(registry: Arc<ThreadRegistry>, options: ControllerOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RunStateMachine::new(),
                cancel: CancelToken::new(),
                registry,
                options,
                lifecycle: Mutex::new(Lifecycle::default()),
                cleanup_done: Signal::new(true),
                lifecycle_done: Signal::new(true),
                subprocess: Mutex::new(None),
                progress: ProgressSink::default(),
            }),
        }
    }

    pub fn state(&self) -> RunState {
        self.inner.state.current()
    }

    pub fn state_machine(&self) -> &RunStateMachine {
        &self.inner.state
    }

    pub fn epoch(&self) -> u64 {
        self.inner.lifecycle.lock().epoch
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.inner.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), RunState::Running | RunState::Stopping)
    }

    /// Starts `job` on a registry-tracked worker thread.
    ///
    /// Returns `false` without side effects when a run is active or the
    /// previous run's cleanup has not finished yet.
    pub fn start_pipeline<T, F>(&self, job: F, callbacks: RunCallbacks<T>) -> bool
    where
        T: Send + 'static,
        F: FnOnce(JobContext) -> Result<T, JobError> + Send + 'static,
    {
        let inner = &self.inner;
        if !inner.state.can_run() {
            warn!(target: "pipeline", state = %inner.state.current(), "start rejected: pipeline not idle");
            return false;
        }
        if !inner.cleanup_done.is_set() {
            warn!(target: "pipeline", "start rejected: previous run cleanup still in progress");
            return false;
        }
        if inner.state.current() == RunState::Error && !inner.state.transition_to(RunState::Idle) {
            return false;
        }
        if !inner.state.transition_to(RunState::Running) {
            return false;
        }

        let epoch = {
            let mut lc = inner.lifecycle.lock();
            lc.epoch += 1;
            lc.worker = None;
            lc.stop_in_progress = false;
            lc.cancelled = false;
            lc.errored = false;
            lc.epoch
        };
        inner.cancel.reset();
        inner.cleanup_done.clear();
        inner.lifecycle_done.clear();

        let ctx = JobContext {
            inner: Arc::clone(inner),
            epoch,
        };
        let worker_inner = Arc::clone(inner);
        let spawned = inner.registry.spawn(
            format!("pipeline-worker-{epoch}"),
            SpawnOptions::default().purpose("pipeline run"),
            move || run_worker(worker_inner, epoch, ctx, job, callbacks),
        );

        match spawned {
            Ok(handle) => {
                let mut lc = inner.lifecycle.lock();
                if lc.epoch == epoch && lc.cleanup_epoch != Some(epoch) {
                    lc.worker = Some(handle);
                }
                drop(lc);
                info!(target: "pipeline", epoch, "pipeline started");
                true
            }
            Err(err) => {
                error!(target: "pipeline", epoch, error = %err, "failed to spawn pipeline worker");
                inner.lifecycle.lock().errored = true;
                inner.state.transition_to(RunState::Error);
                inner.force_progress(ProgressSnapshot::new(STAGE_ERROR, 0.0, None));
                inner.cleanup_done.set();
                inner.lifecycle_done.set();
                false
            }
        }
    }

    /// Cancels the running job, kills its registered subprocess and
    /// schedules cleanup. A second call while a stop is in flight is
    /// rejected rather than queued.
    pub fn stop_pipeline(&self) -> bool {
        let inner = &self.inner;
        let epoch = {
            let mut lc = inner.lifecycle.lock();
            if lc.stop_in_progress {
                warn!(target: "pipeline", "stop rejected: cleanup already in progress");
                return false;
            }
            if !inner.state.can_stop() {
                debug!(target: "pipeline", state = %inner.state.current(), "stop ignored: nothing running");
                return false;
            }
            lc.stop_in_progress = true;
            lc.cancelled = true;
            lc.epoch
        };

        info!(target: "pipeline", epoch, "stopping pipeline");
        inner.state.transition_to(RunState::Stopping);
        inner.cancel.cancel();
        inner.terminate_subprocess();
        inner.force_progress(ProgressSnapshot::new(STAGE_CANCELLED, 0.0, None));
        schedule_cleanup(inner, epoch, false);
        true
    }

    pub fn register_subprocess(&self, child: Child) -> SharedChild {
        let shared = SharedChild::new(child);
        self.inner.register_subprocess(shared.clone());
        shared
    }

    pub fn unregister_subprocess(&self) -> Option<SharedChild> {
        self.inner.subprocess.lock().take()
    }

    pub fn report_progress(&self, stage: &str, percent: f32, eta: Option<Duration>) {
        self.inner.report_progress(stage, percent, eta);
    }

    pub fn set_status_callback(&self, cb: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.progress.set_status(Arc::new(cb));
    }

    pub fn set_progress_callback(&self, cb: impl Fn(f32) + Send + Sync + 'static) {
        self.inner.progress.set_percent(Arc::new(cb));
    }

    pub fn set_eta_callback(&self, cb: impl Fn(Option<Duration>) + Send + Sync + 'static) {
        self.inner.progress.set_eta(Arc::new(cb));
    }

    pub fn subscribe_progress(&self) -> Receiver<ProgressEvent> {
        self.inner.progress.subscribe()
    }

    pub fn last_progress(&self) -> Option<ProgressSnapshot> {
        self.inner.progress.last()
    }

    /// Blocks until the current run (if any) has been fully cleaned up.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.inner.lifecycle_done.wait(timeout)
    }
}

impl Inner {
    fn is_current(&self, epoch: u64) -> bool {
        self.lifecycle.lock().epoch == epoch
    }

    fn report_progress(&self, stage: &str, percent: f32, eta: Option<Duration>) {
        if self.state.current() == RunState::Error && stage != STAGE_ERROR {
            debug!(target: "pipeline", %stage, "suppressing progress after error");
            return;
        }
        self.progress.emit(ProgressSnapshot::new(stage, percent, eta));
    }

    fn force_progress(&self, snapshot: ProgressSnapshot) {
        self.progress.emit(snapshot);
    }

    fn register_subprocess(&self, child: SharedChild) {
        debug!(target: "pipeline", pid = child.pid(), "subprocess registered");
        let previous = self.subprocess.lock().replace(child);
        if let Some(previous) = previous {
            if previous.is_running() {
                warn!(target: "pipeline", pid = previous.pid(), "replacing a live registered subprocess");
            }
        }
    }

    fn terminate_subprocess(&self) {
        let child = self.subprocess.lock().take();
        if let Some(child) = child {
            info!(target: "pipeline", pid = child.pid(), "terminating registered subprocess");
            child.terminate(self.options.subprocess_grace);
        }
    }

    fn do_cleanup(&self, epoch: u64, error_occurred: bool) {
        let (worker, cancelled, errored) = {
            let mut lc = self.lifecycle.lock();
            if lc.epoch != epoch {
                debug!(target: "pipeline", epoch, current = lc.epoch, "skipping cleanup for superseded run");
                return;
            }
            if lc.cleanup_epoch == Some(epoch) {
                return;
            }
            lc.cleanup_epoch = Some(epoch);
            (lc.worker.take(), lc.cancelled, lc.errored || error_occurred)
        };

        if let Some(worker) = worker {
            if worker.thread_id() != thread::current().id()
                && !worker.join_timeout(self.options.worker_join_timeout)
            {
                error!(
                    target: "pipeline",
                    epoch,
                    timeout = ?self.options.worker_join_timeout,
                    "worker did not observe cancellation in time; leaving it running"
                );
            }
        }

        self.terminate_subprocess();
        if self.state.current() != RunState::Error {
            self.state.transition_to(RunState::Idle);
        }
        self.state.pulse();

        // Starts are gated on `cleanup_done`, so the Idle snapshot must land
        // before it is set or it could overwrite the next run's progress.
        let current = {
            let mut lc = self.lifecycle.lock();
            lc.stop_in_progress = false;
            lc.epoch == epoch
        };
        if current && !cancelled && !errored {
            self.report_progress(STAGE_IDLE, 0.0, None);
        }

        self.cleanup_done.set();
        self.lifecycle_done.set();
        info!(target: "pipeline", epoch, cancelled, errored, "pipeline cleanup finished");
    }
}

fn run_worker<T, F>(
    inner: Arc<Inner>,
    epoch: u64,
    ctx: JobContext,
    job: F,
    callbacks: RunCallbacks<T>,
) where
    F: FnOnce(JobContext) -> Result<T, JobError>,
{
    let RunCallbacks {
        on_complete,
        on_error,
    } = callbacks;

    let outcome = match catch_unwind(AssertUnwindSafe(move || job(ctx))) {
        Ok(result) => result,
        Err(payload) => Err(JobError::Failed(anyhow!(
            "job panicked: {}",
            panic_message(payload.as_ref())
        ))),
    };

    let error_occurred = match outcome {
        Ok(value) => {
            info!(target: "pipeline", epoch, "pipeline job completed");
            if let Some(cb) = on_complete {
                if catch_unwind(AssertUnwindSafe(move || cb(value))).is_err() {
                    error!(target: "pipeline", epoch, "on_complete callback panicked");
                }
            }
            false
        }
        Err(JobError::Cancelled) => {
            info!(target: "pipeline", epoch, "pipeline job cancelled");
            let current = {
                let mut lc = inner.lifecycle.lock();
                if lc.epoch == epoch {
                    lc.cancelled = true;
                }
                lc.epoch == epoch
            };
            if current {
                inner.force_progress(ProgressSnapshot::new(STAGE_CANCELLED, 0.0, None));
            }
            false
        }
        Err(JobError::Failed(err)) => {
            error!(target: "pipeline", epoch, error = ?err, "pipeline job failed");
            let current = {
                let mut lc = inner.lifecycle.lock();
                if lc.epoch == epoch {
                    lc.errored = true;
                }
                lc.epoch == epoch
            };
            if current {
                inner.state.transition_to(RunState::Error);
                inner.force_progress(ProgressSnapshot::new(STAGE_ERROR, 0.0, None));
            }
            if let Some(cb) = on_error {
                if catch_unwind(AssertUnwindSafe(|| cb(&err))).is_err() {
                    error!(target: "pipeline", epoch, "on_error callback panicked");
                }
            }
            true
        }
    };

    schedule_cleanup(&inner, epoch, error_occurred);
}

fn schedule_cleanup(inner: &Arc<Inner>, epoch: u64, error_occurred: bool) {
    let cleanup_inner = Arc::clone(inner);
    let spawned = inner.registry.spawn(
        format!("pipeline-cleanup-{epoch}"),
        SpawnOptions::default().purpose("pipeline cleanup"),
        move || cleanup_inner.do_cleanup(epoch, error_occurred),
    );
    if let Err(err) = spawned {
        warn!(target: "pipeline", epoch, error = %err, "could not spawn cleanup thread; cleaning up inline");
        inner.do_cleanup(epoch, error_occurred);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn controller() -> PipelineController {
        PipelineController::new(Arc::new(ThreadRegistry::new()))
    }

    fn blocking_job(
        release: mpsc::Receiver<()>,
    ) -> impl FnOnce(JobContext) -> Result<(), JobError> + Send + 'static {
        move |ctx| {
            while release.recv_timeout(Duration::from_millis(10)).is_err() {
                ctx.check_cancelled()?;
            }
            Ok(())
        }
    }

    #[test]
    fn stale_cleanup_does_not_touch_newer_run() {
        let ctl = controller();

        let (_tx1, rx1) = mpsc::channel();
        assert!(ctl.start_pipeline(blocking_job(rx1), RunCallbacks::new()));
        assert_eq!(ctl.epoch(), 1);
        assert!(ctl.stop_pipeline());
        assert!(ctl.wait_for_idle(Duration::from_secs(2)));
        assert_eq!(ctl.state(), RunState::Idle);

        let (tx2, rx2) = mpsc::channel();
        assert!(ctl.start_pipeline(blocking_job(rx2), RunCallbacks::new()));
        assert_eq!(ctl.epoch(), 2);

        ctl.inner.do_cleanup(1, false);
        assert_eq!(ctl.state(), RunState::Running);
        assert!(!ctl.inner.cleanup_done.is_set());
        assert!(ctl.inner.lifecycle.lock().worker.is_some());

        tx2.send(()).unwrap();
        assert!(ctl.wait_for_idle(Duration::from_secs(2)));
        assert_eq!(ctl.state(), RunState::Idle);
    }

    #[test]
    fn cleanup_is_idempotent_per_epoch() {
        let ctl = controller();
        let (tx, rx) = mpsc::channel();
        assert!(ctl.start_pipeline(blocking_job(rx), RunCallbacks::new()));
        tx.send(()).unwrap();
        assert!(ctl.wait_for_idle(Duration::from_secs(2)));

        let idle_reports = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&idle_reports);
        ctl.set_status_callback(move |stage| {
            if stage == STAGE_IDLE {
                *counter.lock() += 1;
            }
        });
        ctl.inner.do_cleanup(1, false);
        ctl.inner.do_cleanup(1, false);
        assert_eq!(*idle_reports.lock(), 0);
        assert_eq!(ctl.state(), RunState::Idle);
    }

    #[test]
    fn failed_job_enters_error_and_suppresses_progress() {
        let ctl = controller();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let started = ctl.start_pipeline(
            |_ctx| -> Result<(), JobError> { Err(JobError::failed("sampler exploded")) },
            RunCallbacks::new().on_error(move |err| sink.lock().push(err.to_string())),
        );
        assert!(started);
        assert!(ctl.wait_for_idle(Duration::from_secs(2)));

        assert_eq!(ctl.state(), RunState::Error);
        assert_eq!(*errors.lock(), vec!["sampler exploded".to_string()]);
        assert_eq!(ctl.last_progress().map(|p| p.stage), Some(STAGE_ERROR.to_string()));

        ctl.report_progress("txt2img", 50.0, None);
        assert_eq!(ctl.last_progress().map(|p| p.stage), Some(STAGE_ERROR.to_string()));
        ctl.report_progress(STAGE_ERROR, 12.5, None);
        let passed = ctl.last_progress().expect("error report recorded");
        assert_eq!(passed.stage, STAGE_ERROR);
        assert_eq!(passed.percent, 12.5);

        // A new run may start from Error.
        assert!(ctl.start_pipeline(|_ctx| Ok(()), RunCallbacks::new()));
        assert!(ctl.wait_for_idle(Duration::from_secs(2)));
        assert_eq!(ctl.state(), RunState::Idle);
        assert_eq!(ctl.last_progress().map(|p| p.stage), Some(STAGE_IDLE.to_string()));
    }

    #[test]
    fn panicking_job_is_reported_as_error() {
        let ctl = controller();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        assert!(ctl.start_pipeline(
            |_ctx| -> Result<(), JobError> { panic!("stage sequencer bug") },
            RunCallbacks::new().on_error(move |err| sink.lock().push(err.to_string())),
        ));
        assert!(ctl.wait_for_idle(Duration::from_secs(2)));
        assert_eq!(ctl.state(), RunState::Error);
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("stage sequencer bug"));
    }

    #[test]
    fn stale_context_cannot_report_into_new_run() {
        let ctl = controller();
        let (ctx_tx, ctx_rx) = mpsc::channel();
        assert!(ctl.start_pipeline(
            move |ctx| {
                let token = ctx.cancel_token();
                let _ = ctx_tx.send(JobContext {
                    inner: Arc::clone(&ctx.inner),
                    epoch: ctx.epoch(),
                });
                while !token.is_cancelled() {
                    thread::sleep(Duration::from_millis(5));
                }
                Err::<(), _>(JobError::Cancelled)
            },
            RunCallbacks::new(),
        ));
        let stale = ctx_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(ctl.stop_pipeline());
        assert!(ctl.wait_for_idle(Duration::from_secs(2)));

        let (tx, rx) = mpsc::channel();
        assert!(ctl.start_pipeline(blocking_job(rx), RunCallbacks::new()));
        ctl.report_progress("img2img", 10.0, None);
        stale.report_progress("txt2img", 99.0, None);
        assert_eq!(ctl.last_progress().map(|p| p.stage), Some("img2img".to_string()));

        tx.send(()).unwrap();
        assert!(ctl.wait_for_idle(Duration::from_secs(2)));
    }
}

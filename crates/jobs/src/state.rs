use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    Running,
    Stopping,
    Error,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "IDLE",
            RunState::Running => "RUNNING",
            RunState::Stopping => "STOPPING",
            RunState::Error => "ERROR",
        }
    }

    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Idle, Running)
                | (Idle, Error)
                | (Running, Stopping)
                | (Running, Idle)
                | (Running, Error)
                | (Stopping, Idle)
                | (Stopping, Error)
                | (Error, Idle)
        )
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type EnterCallback = Arc<dyn Fn() + Send + Sync>;
type TransitionCallback = Arc<dyn Fn(RunState, RunState) + Send + Sync>;

/// Run-state machine guarded by its own lock.
///
/// Callbacks are cloned out of the lock before being invoked, so a callback
/// may query or even drive the machine without deadlocking.
pub struct RunStateMachine {
    state: Mutex<RunState>,
    changed: Condvar,
    on_enter: Mutex<HashMap<RunState, Vec<EnterCallback>>>,
    on_transition: Mutex<Vec<TransitionCallback>>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RunState::Idle),
            changed: Condvar::new(),
            on_enter: Mutex::new(HashMap::new()),
            on_transition: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> RunState {
        *self.state.lock()
    }

    pub fn can_run(&self) -> bool {
        matches!(self.current(), RunState::Idle | RunState::Error)
    }

    pub fn can_stop(&self) -> bool {
        self.current() == RunState::Running
    }

    pub fn on_enter<F>(&self, state: RunState, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_enter
            .lock()
            .entry(state)
            .or_default()
            .push(Arc::new(callback));
    }

    pub fn on_transition<F>(&self, callback: F)
    where
        F: Fn(RunState, RunState) + Send + Sync + 'static,
    {
        self.on_transition.lock().push(Arc::new(callback));
    }

    /// Applies `next` if the adjacency table allows it. Illegal transitions
    /// leave the state untouched and return `false`.
    pub fn transition_to(&self, next: RunState) -> bool {
        let old = {
            let mut state = self.state.lock();
            let old = *state;
            if !old.can_transition_to(next) {
                drop(state);
                warn!(target: "pipeline", from = %old, to = %next, "rejected invalid state transition");
                return false;
            }
            *state = next;
            self.changed.notify_all();
            old
        };
        debug!(target: "pipeline", from = %old, to = %next, "state transition");
        self.fire_callbacks(old, next);
        true
    }

    /// Wakes every `wait_until` caller without changing state.
    pub fn pulse(&self) {
        let _guard = self.state.lock();
        self.changed.notify_all();
    }

    /// Blocks until `pred` holds for the current state or `timeout` elapses.
    pub fn wait_until<P>(&self, pred: P, timeout: Duration) -> bool
    where
        P: Fn(RunState) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !pred(*state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return pred(*state);
            }
        }
        true
    }

    fn fire_callbacks(&self, old: RunState, new: RunState) {
        let enter: Vec<EnterCallback> = self
            .on_enter
            .lock()
            .get(&new)
            .cloned()
            .unwrap_or_default();
        let transition: Vec<TransitionCallback> = self.on_transition.lock().clone();

        for callback in enter {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!(target: "pipeline", state = %new, "state entry callback panicked");
            }
        }
        for callback in transition {
            if catch_unwind(AssertUnwindSafe(|| callback(old, new))).is_err() {
                error!(target: "pipeline", from = %old, to = %new, "transition callback panicked");
            }
        }
    }
}

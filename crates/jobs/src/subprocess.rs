use std::io;
use std::process::{Child, ChildStderr, ChildStdout, ExitStatus};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{CancelToken, JobError};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(2);

/// A child process shared between its owner and whoever may need to stop it.
///
/// The lock is only held for the duration of a single `try_wait`/`kill`
/// call, never across a wait loop.
#[derive(Clone, Debug)]
pub struct SharedChild {
    child: Arc<Mutex<Child>>,
    pid: u32,
    group: bool,
}

impl SharedChild {
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child: Arc::new(Mutex::new(child)),
            pid,
            group: false,
        }
    }

    /// For a child spawned as the leader of its own process group (see
    /// `CommandExt::process_group(0)` on unix). Termination signals then go
    /// to the whole group so grandchildren holding the output pipes exit too.
    pub fn group_leader(child: Child) -> Self {
        Self {
            group: true,
            ..Self::new(child)
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn try_wait(&self) -> io::Result<Option<ExitStatus>> {
        self.child.lock().try_wait()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    pub fn take_stdout(&self) -> Option<ChildStdout> {
        self.child.lock().stdout.take()
    }

    pub fn take_stderr(&self) -> Option<ChildStderr> {
        self.child.lock().stderr.take()
    }

    /// Waits for exit, polling `cancel` between checks.
    pub fn wait_cancellable(&self, cancel: &CancelToken) -> Result<ExitStatus, JobError> {
        loop {
            cancel.check()?;
            match self.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(err) => return Err(JobError::Failed(err.into())),
            }
        }
    }

    /// Asks the process to exit, waits up to `grace`, then kills it.
    ///
    /// Never fails; returns the exit status when one could be observed.
    pub fn terminate(&self, grace: Duration) -> Option<ExitStatus> {
        match self.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {}
            Err(err) => {
                warn!(target: "process", pid = self.pid, error = %err, "try_wait failed before terminate");
            }
        }

        self.request_exit();
        if let Some(status) = self.poll_exit(grace) {
            debug!(target: "process", pid = self.pid, %status, "process exited after terminate");
            return Some(status);
        }

        warn!(target: "process", pid = self.pid, ?grace, "process ignored terminate; killing");
        self.signal_group_kill();
        if let Err(err) = self.child.lock().kill() {
            // InvalidInput means it already exited.
            if err.kind() != io::ErrorKind::InvalidInput {
                warn!(target: "process", pid = self.pid, error = %err, "kill failed");
            }
        }
        let status = self.poll_exit(KILL_WAIT);
        if status.is_none() {
            warn!(target: "process", pid = self.pid, "process still not reaped after kill");
        }
        status
    }

    #[cfg(unix)]
    fn request_exit(&self) {
        self.send_signal(libc::SIGTERM);
    }

    #[cfg(not(unix))]
    fn request_exit(&self) {}

    #[cfg(unix)]
    fn signal_group_kill(&self) {
        if self.group {
            self.send_signal(libc::SIGKILL);
        }
    }

    #[cfg(not(unix))]
    fn signal_group_kill(&self) {}

    #[cfg(unix)]
    fn send_signal(&self, signal: libc::c_int) {
        let Ok(pid) = libc::pid_t::try_from(self.pid) else {
            return;
        };
        let target = if self.group { -pid } else { pid };
        // SAFETY: plain signal delivery to a child (or its group) we have not
        // reaped yet.
        let rc = unsafe { libc::kill(target, signal) };
        if rc != 0 {
            debug!(
                target: "process",
                pid = self.pid,
                signal,
                error = %io::Error::last_os_error(),
                "signal delivery failed"
            );
        }
    }

    fn poll_exit(&self, within: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + within;
        loop {
            match self.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(_) => return None,
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

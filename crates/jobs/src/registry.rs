use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::RegistryError;

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub daemon: bool,
    pub purpose: Option<String>,
}

impl SpawnOptions {
    pub fn daemon(mut self) -> Self {
        self.daemon = true;
        self
    }

    pub fn purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = Some(purpose.into());
        self
    }
}

/// Diagnostic snapshot of one tracked thread.
#[derive(Debug, Clone)]
pub struct TrackedThread {
    pub id: u64,
    pub name: String,
    pub daemon: bool,
    pub purpose: Option<String>,
    pub spawned_at: DateTime<Local>,
    pub age: Duration,
    pub alive: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownStats {
    pub total: usize,
    pub joined: usize,
    #[serde(rename = "timeout")]
    pub timed_out: usize,
    pub orphaned: usize,
}

#[derive(Default)]
struct Completion {
    done: Mutex<bool>,
    condvar: Condvar,
}

/// Marks the thread finished when the target returns or unwinds.
struct FinishGuard(Arc<Completion>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        let mut done = self.0.done.lock();
        *done = true;
        self.0.condvar.notify_all();
    }
}

struct HandleInner {
    id: u64,
    name: String,
    daemon: bool,
    purpose: Option<String>,
    spawned_at: Instant,
    spawned_wall: DateTime<Local>,
    thread_id: ThreadId,
    completion: Arc<Completion>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// Shared handle to a thread spawned through [`ThreadRegistry::spawn`].
#[derive(Clone)]
pub struct ThreadHandle {
    inner: Arc<HandleInner>,
}

impl std::fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("daemon", &self.inner.daemon)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl ThreadHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_daemon(&self) -> bool {
        self.inner.daemon
    }

    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    pub fn is_alive(&self) -> bool {
        !*self.inner.completion.done.lock()
    }

    /// Waits up to `timeout` for the thread to finish. Returns `false` if it
    /// is still running; the thread is never interrupted.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        if thread::current().id() == self.inner.thread_id {
            warn!(target: "registry", name = %self.inner.name, "thread attempted to join itself");
            return false;
        }
        let deadline = Instant::now() + timeout;
        {
            let mut done = self.inner.completion.done.lock();
            while !*done {
                if self
                    .inner
                    .completion
                    .condvar
                    .wait_until(&mut done, deadline)
                    .timed_out()
                {
                    break;
                }
            }
            if !*done {
                return false;
            }
        }
        self.reap();
        true
    }

    fn reap(&self) {
        let join = self.inner.join.lock().take();
        if let Some(join) = join {
            if let Err(payload) = join.join() {
                error!(
                    target: "registry",
                    name = %self.inner.name,
                    panic = %panic_message(payload.as_ref()),
                    "tracked thread panicked"
                );
            }
        }
    }

    fn snapshot(&self) -> TrackedThread {
        TrackedThread {
            id: self.inner.id,
            name: self.inner.name.clone(),
            daemon: self.inner.daemon,
            purpose: self.inner.purpose.clone(),
            spawned_at: self.inner.spawned_wall,
            age: self.inner.spawned_at.elapsed(),
            alive: self.is_alive(),
        }
    }
}

/// Tracks every background thread the application starts.
///
/// Construct exactly one at startup and share it as `Arc<ThreadRegistry>`.
pub struct ThreadRegistry {
    threads: Mutex<BTreeMap<u64, ThreadHandle>>,
    next_id: AtomicU64,
    shutdown_requested: AtomicBool,
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn spawn<F>(
        &self,
        name: impl Into<String>,
        options: SpawnOptions,
        target: F,
    ) -> Result<ThreadHandle, RegistryError>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() || name.contains('\0') {
            return Err(RegistryError::MissingName);
        }
        if self.is_shutdown_requested() {
            return Err(RegistryError::ShuttingDown(name));
        }
        if options.daemon {
            warn!(target: "registry", %name, "spawning daemon thread; it will not be joined on shutdown");
        }

        let completion = Arc::new(Completion::default());
        let guard = FinishGuard(Arc::clone(&completion));
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let _guard = guard;
                target();
            })
            .map_err(|source| RegistryError::Spawn {
                name: name.clone(),
                source,
            })?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = ThreadHandle {
            inner: Arc::new(HandleInner {
                id,
                thread_id: join.thread().id(),
                name,
                daemon: options.daemon,
                purpose: options.purpose,
                spawned_at: Instant::now(),
                spawned_wall: Local::now(),
                completion,
                join: Mutex::new(Some(join)),
            }),
        };

        let dead = {
            let mut threads = self.threads.lock();
            let dead = sweep_locked(&mut threads);
            threads.insert(id, handle.clone());
            dead
        };
        reap_all(dead);
        debug!(target: "registry", id, name = %handle.name(), "thread spawned");
        Ok(handle)
    }

    pub fn unregister(&self, handle: &ThreadHandle) -> bool {
        let removed = self.threads.lock().remove(&handle.id()).is_some();
        if removed {
            debug!(target: "registry", name = %handle.name(), "thread unregistered");
        }
        removed
    }

    pub fn get_active_threads(&self) -> Vec<TrackedThread> {
        let (dead, live) = {
            let mut threads = self.threads.lock();
            let dead = sweep_locked(&mut threads);
            let live: Vec<ThreadHandle> = threads.values().cloned().collect();
            (dead, live)
        };
        reap_all(dead);
        live.iter().map(ThreadHandle::snapshot).collect()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Requests shutdown and joins every non-daemon thread, waiting up to
    /// `timeout` for each. Threads that do not finish are reported, not killed.
    pub fn shutdown_all(&self, timeout: Duration) -> ShutdownStats {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        let handles: Vec<ThreadHandle> = self.threads.lock().values().cloned().collect();
        let mut stats = ShutdownStats {
            total: handles.len(),
            ..ShutdownStats::default()
        };
        info!(target: "registry", total = stats.total, ?timeout, "shutting down tracked threads");

        for handle in &handles {
            if handle.is_daemon() {
                if handle.is_alive() {
                    stats.orphaned += 1;
                    warn!(target: "registry", name = %handle.name(), "daemon thread still running at shutdown");
                }
                continue;
            }
            if handle.join_timeout(timeout) {
                stats.joined += 1;
            } else {
                stats.timed_out += 1;
                error!(
                    target: "registry",
                    name = %handle.name(),
                    ?timeout,
                    "thread did not stop within timeout; leaving it running"
                );
            }
        }

        let dead = sweep_locked(&mut self.threads.lock());
        reap_all(dead);
        info!(
            target: "registry",
            joined = stats.joined,
            timed_out = stats.timed_out,
            orphaned = stats.orphaned,
            "thread shutdown finished"
        );
        stats
    }

    pub fn dump_status(&self) -> String {
        let snapshots: Vec<TrackedThread> = {
            let threads = self.threads.lock();
            threads.values().map(ThreadHandle::snapshot).collect()
        };
        let mut out = format!(
            "{} tracked thread(s), shutdown requested: {}\n",
            snapshots.len(),
            self.is_shutdown_requested()
        );
        for t in snapshots {
            let _ = writeln!(
                out,
                "  #{:<4} {:<32} {:<5} daemon={:<5} age={:>8.1}s since={} purpose={}",
                t.id,
                t.name,
                if t.alive { "alive" } else { "dead" },
                t.daemon,
                t.age.as_secs_f64(),
                t.spawned_at.format("%H:%M:%S"),
                t.purpose.as_deref().unwrap_or("-"),
            );
        }
        out
    }
}

fn sweep_locked(threads: &mut BTreeMap<u64, ThreadHandle>) -> Vec<ThreadHandle> {
    let dead_ids: Vec<u64> = threads
        .iter()
        .filter(|(_, h)| !h.is_alive())
        .map(|(id, _)| *id)
        .collect();
    dead_ids
        .into_iter()
        .filter_map(|id| threads.remove(&id))
        .collect()
}

// Joining a finished thread is immediate; it surfaces panics into the log.
fn reap_all(dead: Vec<ThreadHandle>) {
    for handle in dead {
        handle.reap();
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn shutdown_stats_serialize_with_timeout_key() {
        let stats = ShutdownStats {
            total: 4,
            joined: 2,
            timed_out: 1,
            orphaned: 1,
        };
        let value = serde_json::to_value(stats).unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "total": 4, "joined": 2, "timeout": 1, "orphaned": 1 })
        );
        assert!(value.get("timed_out").is_none());
    }

    #[test]
    fn spawn_requires_a_name() {
        let registry = ThreadRegistry::new();
        let (tx, rx) = mpsc::channel::<()>();
        let err = registry
            .spawn("", SpawnOptions::default(), move || {
                let _ = tx.send(());
            })
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingName));
        assert!(matches!(
            registry.spawn("   ", SpawnOptions::default(), || {}),
            Err(RegistryError::MissingName)
        ));
        // The target was dropped without ever running.
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(registry.get_active_threads().is_empty());
    }

    #[test]
    fn active_threads_exclude_finished_ones() {
        let registry = ThreadRegistry::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let blocked = registry
            .spawn("blocked", SpawnOptions::default().purpose("test"), move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        let quick = registry
            .spawn("quick", SpawnOptions::default(), || {})
            .unwrap();
        assert!(quick.join_timeout(Duration::from_secs(2)));

        let active = registry.get_active_threads();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].name, "blocked");
        assert_eq!(active[0].purpose.as_deref(), Some("test"));
        assert!(active[0].alive);

        release_tx.send(()).unwrap();
        assert!(blocked.join_timeout(Duration::from_secs(2)));
        assert!(registry.get_active_threads().is_empty());
    }

    #[test]
    fn shutdown_joins_threads_that_finish_in_time() {
        let registry = ThreadRegistry::new();
        for i in 0..3 {
            registry
                .spawn(format!("short-{i}"), SpawnOptions::default(), || {
                    thread::sleep(Duration::from_millis(30));
                })
                .unwrap();
        }
        let stats = registry.shutdown_all(Duration::from_secs(2));
        assert_eq!(
            stats,
            ShutdownStats {
                total: 3,
                joined: 3,
                timed_out: 0,
                orphaned: 0
            }
        );
        assert!(registry.is_shutdown_requested());

        let again = registry.shutdown_all(Duration::from_secs(2));
        assert_eq!(again.total, 0);
    }

    #[test]
    fn shutdown_reports_slow_threads_and_leaves_them_running() {
        let registry = ThreadRegistry::new();
        let slow = registry
            .spawn("slow", SpawnOptions::default(), || {
                thread::sleep(Duration::from_millis(600));
            })
            .unwrap();
        let stats = registry.shutdown_all(Duration::from_millis(50));
        assert_eq!(stats.total, 1);
        assert!(stats.timed_out >= 1);
        assert!(slow.is_alive());
        assert!(slow.join_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn daemon_threads_are_orphaned_not_joined() {
        let registry = ThreadRegistry::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let daemon = registry
            .spawn("daemon", SpawnOptions::default().daemon(), move || {
                let _ = release_rx.recv();
            })
            .unwrap();
        let stats = registry.shutdown_all(Duration::from_millis(20));
        assert_eq!(stats.orphaned, 1);
        assert_eq!(stats.joined, 0);
        assert!(daemon.is_alive());
        release_tx.send(()).unwrap();
        assert!(daemon.join_timeout(Duration::from_secs(2)));
    }

    #[test]
    fn spawn_after_shutdown_is_rejected() {
        let registry = ThreadRegistry::new();
        registry.shutdown_all(Duration::from_millis(10));
        assert!(matches!(
            registry.spawn("late", SpawnOptions::default(), || {}),
            Err(RegistryError::ShuttingDown(name)) if name == "late"
        ));
    }

    #[test]
    fn panicking_target_does_not_corrupt_bookkeeping() {
        let registry = ThreadRegistry::new();
        let handle = registry
            .spawn("panics", SpawnOptions::default(), || panic!("target failure"))
            .unwrap();
        assert!(handle.join_timeout(Duration::from_secs(2)));
        assert!(!handle.is_alive());
        assert!(registry.get_active_threads().is_empty());
        registry.spawn("after", SpawnOptions::default(), || {}).unwrap();
    }

    #[test]
    fn unregister_and_dump_status() {
        let registry = ThreadRegistry::new();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let handle = registry
            .spawn("reporter", SpawnOptions::default().purpose("diagnostics"), move || {
                let _ = release_rx.recv();
            })
            .unwrap();

        let status = registry.dump_status();
        assert!(status.starts_with("1 tracked thread(s)"));
        assert!(status.contains("reporter"));
        assert!(status.contains("alive"));
        assert!(status.contains("diagnostics"));

        assert!(registry.unregister(&handle));
        assert!(!registry.unregister(&handle));
        assert!(registry.get_active_threads().is_empty());

        release_tx.send(()).unwrap();
        assert!(handle.join_timeout(Duration::from_secs(2)));
    }
}

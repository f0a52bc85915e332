use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::error;
use tracing_subscriber::fmt::MakeWriter;

pub const STAGE_IDLE: &str = "Idle";
pub const STAGE_CANCELLED: &str = "Cancelled";
pub const STAGE_ERROR: &str = "Error";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub stage: String,
    pub percent: f32,
    pub eta: Option<Duration>,
}

impl ProgressSnapshot {
    pub fn new(stage: impl Into<String>, percent: f32, eta: Option<Duration>) -> Self {
        Self {
            stage: stage.into(),
            percent: percent.clamp(0.0, 100.0),
            eta,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    StatusChanged(String),
    ProgressChanged(f32),
    EtaChanged(Option<Duration>),
}

pub type StatusCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type PercentCallback = Arc<dyn Fn(f32) + Send + Sync>;
pub type EtaCallback = Arc<dyn Fn(Option<Duration>) + Send + Sync>;

/// Single-slot callbacks plus channel subscribers for progress fan-out.
#[derive(Default)]
pub(crate) struct ProgressSink {
    status: Mutex<Option<StatusCallback>>,
    percent: Mutex<Option<PercentCallback>>,
    eta: Mutex<Option<EtaCallback>>,
    subscribers: Mutex<Vec<Sender<ProgressEvent>>>,
    last: Mutex<Option<ProgressSnapshot>>,
}

impl ProgressSink {
    pub fn set_status(&self, cb: StatusCallback) {
        *self.status.lock() = Some(cb);
    }

    pub fn set_percent(&self, cb: PercentCallback) {
        *self.percent.lock() = Some(cb);
    }

    pub fn set_eta(&self, cb: EtaCallback) {
        *self.eta.lock() = Some(cb);
    }

    pub fn subscribe(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn last(&self) -> Option<ProgressSnapshot> {
        self.last.lock().clone()
    }

    pub fn emit(&self, snapshot: ProgressSnapshot) {
        *self.last.lock() = Some(snapshot.clone());

        let status = self.status.lock().clone();
        let percent = self.percent.lock().clone();
        let eta = self.eta.lock().clone();

        if let Some(cb) = status {
            guarded("status", || cb(&snapshot.stage));
        }
        if let Some(cb) = percent {
            guarded("progress", || cb(snapshot.percent));
        }
        if let Some(cb) = eta {
            guarded("eta", || cb(snapshot.eta));
        }

        let events = [
            ProgressEvent::StatusChanged(snapshot.stage.clone()),
            ProgressEvent::ProgressChanged(snapshot.percent),
            ProgressEvent::EtaChanged(snapshot.eta),
        ];
        self.subscribers.lock().retain(|tx| {
            events
                .iter()
                .all(|event| tx.send(event.clone()).is_ok())
        });
    }
}

fn guarded(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(target: "pipeline", callback = kind, "progress callback panicked");
    }
}

/// Bounded queue of log lines drained by the UI on its own schedule.
///
/// When full, the oldest line is discarded. Also usable as a
/// `tracing_subscriber` writer so formatted events land in the queue.
#[derive(Clone)]
pub struct LogQueue {
    tx: Sender<String>,
    rx: Receiver<String>,
    dropped: Arc<AtomicU64>,
}

impl LogQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut line = line.into();
        loop {
            match self.tx.try_send(line) {
                Ok(()) => return,
                Err(TrySendError::Full(rejected)) => {
                    if self.rx.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    line = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    pub fn drain(&self) -> Vec<String> {
        self.rx.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct LogQueueWriter {
    queue: LogQueue,
    buf: Vec<u8>,
}

impl io::Write for LogQueueWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(bytes);
        Ok(bytes.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            self.queue.push(line.trim_end());
        }
        Ok(())
    }
}

impl Drop for LogQueueWriter {
    fn drop(&mut self) {
        let _ = io::Write::flush(self);
    }
}

impl<'a> MakeWriter<'a> for LogQueue {
    type Writer = LogQueueWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogQueueWriter {
            queue: self.clone(),
            buf: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn log_queue_drops_oldest_when_full() {
        let queue = LogQueue::new(3);
        for i in 0..5 {
            queue.push(format!("line {i}"));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.drain(), vec!["line 2", "line 3", "line 4"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn writer_splits_lines_on_drop() {
        let queue = LogQueue::new(16);
        {
            let mut writer = queue.make_writer();
            write!(writer, "first\nsecond").unwrap();
            writeln!(writer).unwrap();
            writeln!(writer).unwrap();
        }
        assert_eq!(queue.drain(), vec!["first", "second"]);
    }

    #[test]
    fn tracing_output_lands_in_queue() {
        let queue = LogQueue::new(16);
        let subscriber = tracing_subscriber::fmt()
            .with_writer(queue.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("backend ready");
        });
        let lines = queue.drain();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("backend ready"));
    }

    #[test]
    fn sink_fans_out_to_callbacks_and_subscribers() {
        let sink = ProgressSink::default();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&statuses);
        sink.set_status(Arc::new(move |s: &str| recorded.lock().push(s.to_string())));
        sink.set_percent(Arc::new(|_| panic!("bad callback")));
        let rx = sink.subscribe();

        sink.emit(ProgressSnapshot::new("txt2img", 150.0, Some(Duration::from_secs(3))));

        assert_eq!(*statuses.lock(), vec!["txt2img".to_string()]);
        assert_eq!(sink.last().map(|s| s.percent), Some(100.0));
        let events: Vec<ProgressEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![
                ProgressEvent::StatusChanged("txt2img".into()),
                ProgressEvent::ProgressChanged(100.0),
                ProgressEvent::EtaChanged(Some(Duration::from_secs(3))),
            ]
        );

        drop(rx);
        sink.emit(ProgressSnapshot::new("upscale", 10.0, None));
        assert!(sink.subscribers.lock().is_empty());
    }
}

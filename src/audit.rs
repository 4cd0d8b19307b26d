use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ParseError;

/// Fire-and-forget reporting of pipeline outcomes. Implementations must
/// neither block nor fail the caller.
pub trait AuditSink: Send + Sync {
    fn record_success(&self, elapsed: Duration);
    fn record_failure(&self, url: &str, error: &ParseError);
    fn record_persist(&self, elapsed: Duration);
}

// ── Metrics ──

/// In-process counters and timings.
#[derive(Default)]
pub struct ParseMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
    persisted: AtomicU64,
    parse_micros: AtomicU64,
    persist_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub persisted: u64,
    pub avg_parse_ms: f64,
    pub avg_persist_ms: f64,
}

impl ParseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let successes = self.successes.load(Ordering::Relaxed);
        let persisted = self.persisted.load(Ordering::Relaxed);
        MetricsSnapshot {
            successes,
            failures: self.failures.load(Ordering::Relaxed),
            persisted,
            avg_parse_ms: average_ms(self.parse_micros.load(Ordering::Relaxed), successes),
            avg_persist_ms: average_ms(self.persist_micros.load(Ordering::Relaxed), persisted),
        }
    }

    pub fn report(&self) {
        let s = self.snapshot();
        info!(
            successes = s.successes,
            failures = s.failures,
            persisted = s.persisted,
            "avg parse {:.1} ms, avg persist {:.1} ms",
            s.avg_parse_ms,
            s.avg_persist_ms
        );
    }
}

fn average_ms(total_micros: u64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        total_micros as f64 / count as f64 / 1000.0
    }
}

impl AuditSink for ParseMetrics {
    fn record_success(&self, elapsed: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.parse_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn record_failure(&self, url: &str, error: &ParseError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        debug!(url, %error, "failure recorded");
    }

    fn record_persist(&self, elapsed: Duration) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
        self.persist_micros.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}

// ── Audit log ──

#[derive(Debug, Clone)]
pub enum AuditEvent {
    Parsed { elapsed: Duration },
    Failed { url: String, error: String },
    Persisted { elapsed: Duration },
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEvent::Parsed { elapsed } => write!(f, "parsed in {} ms", elapsed.as_millis()),
            AuditEvent::Failed { url, error } => write!(f, "failed {}: {}", url, error),
            AuditEvent::Persisted { elapsed } => {
                write!(f, "persisted in {} ms", elapsed.as_millis())
            }
        }
    }
}

/// Background writer draining a bounded queue of audit events.
///
/// When the queue is full the event is dropped with a warning.
pub struct AuditLog {
    tx: Mutex<Option<mpsc::Sender<AuditEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    written: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl AuditLog {
    /// Must be called inside a Tokio runtime.
    pub fn spawn(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditEvent>(capacity.max(1));
        let written = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&written);
        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                info!(target: "audit", "{}", event);
                counter.fetch_add(1, Ordering::Relaxed);
            }
            debug!("audit log drained");
        });
        AuditLog {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            written,
            dropped: AtomicU64::new(0),
        }
    }

    fn push(&self, event: AuditEvent) {
        let Ok(guard) = self.tx.lock() else { return };
        let Some(tx) = guard.as_ref() else { return };
        if let Err(TrySendError::Full(event)) = tx.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("audit queue full, dropping: {}", event);
        }
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop accepting events and wait until the queue is written out.
    pub async fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl AuditSink for AuditLog {
    fn record_success(&self, elapsed: Duration) {
        self.push(AuditEvent::Parsed { elapsed });
    }

    fn record_failure(&self, url: &str, error: &ParseError) {
        self.push(AuditEvent::Failed { url: url.to_string(), error: error.to_string() });
    }

    fn record_persist(&self, elapsed: Duration) {
        self.push(AuditEvent::Persisted { elapsed });
    }
}

/// Forwards every event to each inner sink.
pub struct Fanout(pub Vec<Arc<dyn AuditSink>>);

impl AuditSink for Fanout {
    fn record_success(&self, elapsed: Duration) {
        self.0.iter().for_each(|s| s.record_success(elapsed));
    }

    fn record_failure(&self, url: &str, error: &ParseError) {
        self.0.iter().for_each(|s| s.record_failure(url, error));
    }

    fn record_persist(&self, elapsed: Duration) {
        self.0.iter().for_each(|s| s.record_persist(elapsed));
    }
}

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::orchestrator::ParseOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Exhausted,
    /// Processed `backlog[start..end]`.
    Processed { start: usize, end: usize, successes: usize },
}

/// Walks a fixed backlog of URLs one slice per tick.
///
/// The cursor moves past a slice when the slice is claimed, so a batch
/// that fails or panics is never retried.
pub struct BatchScheduler {
    backlog: Vec<String>,
    cursor: AtomicUsize,
    batch_size: usize,
    orchestrator: Arc<ParseOrchestrator>,
}

impl BatchScheduler {
    pub fn new(backlog: Vec<String>, batch_size: usize, orchestrator: Arc<ParseOrchestrator>) -> Self {
        info!("scheduler loaded {} urls, batch size {}", backlog.len(), batch_size.max(1));
        BatchScheduler {
            backlog,
            cursor: AtomicUsize::new(0),
            batch_size: batch_size.max(1),
            orchestrator,
        }
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn remaining(&self) -> usize {
        self.backlog.len() - self.cursor()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor() >= self.backlog.len()
    }

    /// Start over from the first URL.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::SeqCst);
    }

    fn claim(&self) -> Option<(usize, usize)> {
        let len = self.backlog.len();
        let batch = self.batch_size;
        let start = self
            .cursor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c < len).then(|| (c + batch).min(len))
            })
            .ok()?;
        Some((start, (start + batch).min(len)))
    }

    pub async fn tick(&self) -> TickOutcome {
        let Some((start, end)) = self.claim() else {
            debug!("backlog exhausted");
            return TickOutcome::Exhausted;
        };
        info!("processing batch {}-{} of {}", start + 1, end, self.backlog.len());
        let successes = self
            .orchestrator
            .parse_many_counting_successes(&self.backlog[start..end])
            .await;
        TickOutcome::Processed { start, end, successes }
    }

    /// Tick after `initial_delay`, then `interval` after each tick finishes,
    /// until `shutdown` resolves. Returns the number of successful parses.
    pub async fn run(
        &self,
        initial_delay: Duration,
        interval: Duration,
        stop_when_exhausted: bool,
        shutdown: impl Future<Output = ()>,
        mut on_tick: impl FnMut(&TickOutcome),
    ) -> usize {
        tokio::pin!(shutdown);
        let mut total = 0;

        tokio::select! {
            _ = tokio::time::sleep(initial_delay) => {}
            _ = &mut shutdown => return total,
        }
        loop {
            let outcome = tokio::select! {
                outcome = self.tick() => outcome,
                _ = &mut shutdown => break,
            };
            on_tick(&outcome);
            match outcome {
                TickOutcome::Processed { successes, .. } => total += successes,
                TickOutcome::Exhausted if stop_when_exhausted => break,
                TickOutcome::Exhausted => {}
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = &mut shutdown => break,
            }
        }
        info!("scheduler stopped at {}/{}, {} parsed", self.cursor(), self.backlog.len(), total);
        total
    }
}

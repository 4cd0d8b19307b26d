use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, warn, Instrument};

use crate::audit::AuditSink;
use crate::db::ProductStore;
use crate::error::{ParseError, PersistError};
use crate::extract;
use crate::fetch::Fetcher;
use crate::model::Product;
use crate::pool::{TaskHandle, WorkerPool};

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub workers: usize,
    pub queue_capacity: usize,
    /// How long a batch waits for its tasks. `None` waits indefinitely.
    pub join_timeout: Option<Duration>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        OrchestratorOptions {
            workers: 5,
            queue_capacity: 100,
            join_timeout: Some(Duration::from_secs(120)),
        }
    }
}

/// Fetch → extract → persist for a single URL.
struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    store: Arc<dyn ProductStore>,
    audit: Arc<dyn AuditSink>,
}

impl Pipeline {
    async fn run(&self, url: &str) -> Result<Product, ParseError> {
        let started = Instant::now();
        match self.attempt(url).await {
            Ok(product) => {
                self.audit.record_success(started.elapsed());
                info!(
                    id = product.id,
                    price = %product.price,
                    "parsed \"{}\" in {} ms",
                    product.title,
                    started.elapsed().as_millis()
                );
                Ok(product)
            }
            Err(e) => {
                self.audit.record_failure(url, &e);
                warn!("failed: {}", e);
                Err(e)
            }
        }
    }

    async fn attempt(&self, url: &str) -> Result<Product, ParseError> {
        let markup = self.fetcher.fetch(url).await?;
        let product = extract::extract(url, &markup)?;

        let persist_started = Instant::now();
        let saved = self.save(product)?;
        self.audit.record_persist(persist_started.elapsed());
        Ok(saved)
    }

    fn save(&self, mut product: Product) -> Result<Product, PersistError> {
        match self.store.find_by_url(&product.url)? {
            Some(existing) => {
                debug!(id = existing.id, "updating existing product");
                product.adopt_identity(&existing);
            }
            None => debug!("new product"),
        }
        self.store.upsert(&product)
    }
}

/// Outcome for one URL of a batch.
#[derive(Debug)]
pub struct UrlOutcome {
    pub url: String,
    pub result: Result<Product, ParseError>,
}

/// Per-URL outcomes of a batch, in input order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<UrlOutcome>,
    /// Tasks still running when the batch deadline passed.
    pub incomplete: usize,
}

impl BatchReport {
    pub fn successes(&self) -> impl Iterator<Item = &Product> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &ParseError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.url.as_str(), e)))
    }

    pub fn success_count(&self) -> usize {
        self.successes().count()
    }

    pub fn is_complete(&self) -> bool {
        self.incomplete == 0
    }

    pub fn into_products(self) -> Vec<Product> {
        self.outcomes.into_iter().filter_map(|o| o.result.ok()).collect()
    }
}

/// Runs the parse pipeline for URLs on a bounded worker pool.
pub struct ParseOrchestrator {
    pipeline: Arc<Pipeline>,
    pool: WorkerPool,
    join_timeout: Option<Duration>,
}

impl ParseOrchestrator {
    /// Must be called inside a Tokio runtime.
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        store: Arc<dyn ProductStore>,
        audit: Arc<dyn AuditSink>,
        options: OrchestratorOptions,
    ) -> Self {
        let pool = WorkerPool::new(options.workers, options.queue_capacity);
        info!(
            fetcher = fetcher.name(),
            workers = pool.size(),
            queue = options.queue_capacity,
            "orchestrator ready"
        );
        ParseOrchestrator {
            pipeline: Arc::new(Pipeline { fetcher, store, audit }),
            pool,
            join_timeout: options.join_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProductStore> {
        &self.pipeline.store
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Parse and persist one URL on the calling task.
    pub async fn parse_one(&self, url: &str) -> Result<Product, ParseError> {
        self.pipeline
            .run(url)
            .instrument(info_span!("parse", url = %url))
            .await
    }

    /// Submit one URL to the pool. Runs on the caller when the queue is full.
    pub async fn parse_one_async(&self, url: &str) -> TaskHandle<Result<Product, ParseError>> {
        let pipeline = Arc::clone(&self.pipeline);
        let url = url.to_string();
        let span = info_span!("parse", url = %url);
        self.pool
            .submit(async move { pipeline.run(&url).await }.instrument(span))
            .await
    }

    /// Parse every URL concurrently and report each outcome.
    ///
    /// Waits for at most the join timeout; tasks still running then are
    /// reported as [`ParseError::Deadline`] and left to finish on their own.
    pub async fn parse_many_outcomes(&self, urls: &[String]) -> BatchReport {
        let mut pending = Vec::with_capacity(urls.len());
        for url in urls {
            pending.push((url.clone(), self.parse_one_async(url).await));
        }

        let deadline = self.join_timeout.map(|t| tokio::time::Instant::now() + t);
        let mut report = BatchReport::default();
        for (url, handle) in pending {
            let joined = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, handle).await.ok(),
                None => Some(handle.await),
            };
            let result = match joined {
                Some(Ok(result)) => result,
                Some(Err(_)) => {
                    let err = ParseError::WorkerLost { url: url.clone() };
                    self.pipeline.audit.record_failure(&url, &err);
                    Err(err)
                }
                None => {
                    report.incomplete += 1;
                    Err(ParseError::Deadline { url: url.clone() })
                }
            };
            report.outcomes.push(UrlOutcome { url, result });
        }

        if !report.is_complete() {
            warn!(
                "{}/{} tasks still running at the batch deadline",
                report.incomplete,
                urls.len()
            );
        }
        report
    }

    /// Products parsed successfully, in input order. Failures are logged
    /// and audited but otherwise omitted.
    pub async fn parse_many(&self, urls: &[String]) -> Vec<Product> {
        let report = self.parse_many_outcomes(urls).await;
        info!("parsed {}/{} urls", report.success_count(), urls.len());
        report.into_products()
    }

    pub async fn parse_many_counting_successes(&self, urls: &[String]) -> usize {
        let successes = self.parse_many_outcomes(urls).await.success_count();
        info!("batch done: {}/{} succeeded", successes, urls.len());
        successes
    }

    /// Stop accepting pool work and wait for queued tasks.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::ParseMetrics;
    use crate::error::FetchError;
    use crate::testing::{page, rig, ReadOnlyStore, ScriptedFetcher};
    use rust_decimal::Decimal;

    fn urls(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://shop.test/p/{i}")).collect()
    }

    #[tokio::test]
    async fn parse_one_inserts_new_product() {
        let f = ScriptedFetcher::new();
        f.serve("https://shop.test/a", page("Phone A", "1 500"));
        let r = rig(f, OrchestratorOptions::default());

        let p = r.orchestrator.parse_one("https://shop.test/a").await.unwrap();
        assert!(p.id.is_some());
        assert_eq!(p.title, "Phone A");
        assert_eq!(p.price, Decimal::new(1500, 0));
        assert_eq!(p.created_at, Some(p.parsed_at));

        let m = r.metrics.snapshot();
        assert_eq!((m.successes, m.failures, m.persisted), (1, 0, 1));
    }

    #[tokio::test]
    async fn reparse_keeps_identity_and_refreshes_fields() {
        let f = ScriptedFetcher::new();
        f.serve("https://shop.test/a", page("Old", "100"));
        let r = rig(f, OrchestratorOptions::default());

        let first = r.orchestrator.parse_one("https://shop.test/a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        r.fetcher.serve("https://shop.test/a", page("New", "200"));
        let second = r.orchestrator.parse_one("https://shop.test/a").await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert_eq!(second.title, "New");
        assert_eq!(second.price, Decimal::new(200, 0));
        assert!(second.parsed_at > first.parsed_at);
        assert_eq!(r.store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn reparse_of_unchanged_page_is_idempotent() {
        let f = ScriptedFetcher::new();
        f.serve("https://shop.test/a", page("Same", "999"));
        let r = rig(f, OrchestratorOptions::default());

        let a = r.orchestrator.parse_one("https://shop.test/a").await.unwrap();
        let b = r.orchestrator.parse_one("https://shop.test/a").await.unwrap();
        assert_eq!((a.id, &a.title, a.price, &a.description), (b.id, &b.title, b.price, &b.description));
        assert_eq!(r.store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_reported_and_not_persisted() {
        let f = ScriptedFetcher::new();
        f.fail("https://shop.test/gone", 404);
        let r = rig(f, OrchestratorOptions::default());

        let err = r.orchestrator.parse_one("https://shop.test/gone").await.unwrap_err();
        assert!(matches!(err, ParseError::Fetch(FetchError::Status { status: 404, .. })));
        assert!(!r.store.exists_by_url("https://shop.test/gone").unwrap());
        assert_eq!(r.metrics.snapshot().failures, 1);
        assert_eq!(r.metrics.snapshot().persisted, 0);
    }

    #[tokio::test]
    async fn unreadable_markup_is_an_extract_failure() {
        let f = ScriptedFetcher::new();
        f.serve("https://shop.test/bin", "\u{0}\u{1}PNG");
        let r = rig(f, OrchestratorOptions::default());

        let err = r.orchestrator.parse_one("https://shop.test/bin").await.unwrap_err();
        assert!(matches!(err, ParseError::Extract(_)));
        assert_eq!(r.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn persist_failure_is_reported() {
        let f = Arc::new(ScriptedFetcher::new());
        f.serve("https://shop.test/a", page("A", "10"));
        let metrics = Arc::new(ParseMetrics::new());
        let orch = ParseOrchestrator::new(
            f,
            Arc::new(ReadOnlyStore),
            metrics.clone(),
            OrchestratorOptions::default(),
        );

        let err = orch.parse_one("https://shop.test/a").await.unwrap_err();
        assert!(matches!(err, ParseError::Persist(PersistError::Poisoned)));
        assert_eq!(metrics.snapshot().failures, 1);
        assert_eq!(metrics.snapshot().successes, 0);
    }

    #[tokio::test]
    async fn parse_many_omits_failures_and_keeps_order() {
        let list = urls(5);
        let f = ScriptedFetcher::new();
        for (i, url) in list.iter().enumerate() {
            if i == 1 || i == 3 {
                f.fail(url, 500);
            } else {
                f.serve(url, page(&format!("Item {i}"), "10"));
            }
        }
        let r = rig(f, OrchestratorOptions::default());

        let products = r.orchestrator.parse_many(&list).await;
        let titles: Vec<_> = products.iter().map(|p| p.title.as_str()).collect();
        assert_eq!(titles, ["Item 0", "Item 2", "Item 4"]);
        assert_eq!(r.metrics.snapshot().failures, 2);
        assert_eq!(r.store.count().unwrap(), 3);
    }

    #[tokio::test]
    async fn outcomes_report_every_url() {
        let list = urls(3);
        let f = ScriptedFetcher::new();
        f.serve(&list[0], page("A", "1"));
        f.fail(&list[1], 503);
        f.serve(&list[2], page("C", "3"));
        let r = rig(f, OrchestratorOptions::default());

        let report = r.orchestrator.parse_many_outcomes(&list).await;
        assert!(report.is_complete());
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.success_count(), 2);
        let failed: Vec<_> = report.failures().map(|(u, _)| u).collect();
        assert_eq!(failed, [list[1].as_str()]);
    }

    #[tokio::test]
    async fn counting_successes_over_empty_and_mixed_batches() {
        let list = urls(4);
        let f = ScriptedFetcher::new();
        f.serve(&list[0], page("A", "1"));
        f.serve(&list[2], page("C", "1"));
        let r = rig(f, OrchestratorOptions::default());

        assert_eq!(r.orchestrator.parse_many_counting_successes(&[]).await, 0);
        assert_eq!(r.orchestrator.parse_many_counting_successes(&list).await, 2);
        assert_eq!(r.metrics.snapshot().failures, 2);
    }

    #[tokio::test]
    async fn deadline_reports_unfinished_tasks() {
        let list = urls(3);
        let f = ScriptedFetcher::new();
        for url in &list {
            f.serve(url, page("x", "1"));
        }
        f.delay(&list[1], Duration::from_secs(5));
        let r = rig(
            f,
            OrchestratorOptions {
                join_timeout: Some(Duration::from_millis(100)),
                ..OrchestratorOptions::default()
            },
        );

        let report = r.orchestrator.parse_many_outcomes(&list).await;
        assert_eq!(report.incomplete, 1);
        assert!(report.outcomes[1].result.as_ref().is_err_and(ParseError::is_incomplete));
        assert!(report.outcomes[0].result.is_ok());
        assert!(report.outcomes[2].result.is_ok());
        // unfinished task is not counted as a failure by the batch
        assert_eq!(r.metrics.snapshot().failures, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn pool_bounds_in_flight_fetches() {
        let list = urls(8);
        let f = ScriptedFetcher::new();
        for url in &list {
            f.serve(url, page("x", "1")).delay(url, Duration::from_millis(20));
        }
        let r = rig(
            f,
            OrchestratorOptions { workers: 2, queue_capacity: 16, join_timeout: None },
        );

        assert_eq!(r.orchestrator.parse_many_counting_successes(&list).await, 8);
        assert!(r.fetcher.peak_concurrency() <= 2);
        assert_eq!(r.orchestrator.pool().inline_runs(), 0);
    }

    #[tokio::test]
    async fn saturated_queue_still_completes_every_url() {
        let list = urls(6);
        let f = ScriptedFetcher::new();
        for url in &list {
            f.serve(url, page("x", "1")).delay(url, Duration::from_millis(5));
        }
        let r = rig(
            f,
            OrchestratorOptions { workers: 1, queue_capacity: 1, join_timeout: None },
        );

        assert_eq!(r.orchestrator.parse_many(&list).await.len(), 6);
        assert!(r.orchestrator.pool().inline_runs() >= 1);
        assert_eq!(r.fetcher.total_calls(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_urls_do_not_interfere() {
        let list = urls(20);
        let f = ScriptedFetcher::new();
        for (i, url) in list.iter().enumerate() {
            f.serve(url, page(&format!("Item {i}"), &format!("{}", 100 + i)));
        }
        let r = rig(f, OrchestratorOptions::default());

        assert_eq!(r.orchestrator.parse_many_counting_successes(&list).await, 20);
        assert_eq!(r.store.count().unwrap(), 20);
        for (i, url) in list.iter().enumerate() {
            let p = r.store.find_by_url(url).unwrap().unwrap();
            assert_eq!(p.title, format!("Item {i}"));
            assert_eq!(p.price, Decimal::from(100 + i as i64));
        }
    }

    // Known race: two tasks for one URL may both see "absent". The store
    // merges the second insert into the first row, so the last write wins.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn duplicate_url_in_batch_keeps_one_row() {
        let url = "https://shop.test/dup".to_string();
        let f = ScriptedFetcher::new();
        f.serve(&url, page("Dup", "5"));
        let r = rig(f, OrchestratorOptions::default());

        let products = r.orchestrator.parse_many(&[url.clone(), url.clone()]).await;
        assert_eq!(products.len(), 2);
        assert_eq!(products[0].id, products[1].id);
        assert_eq!(r.orchestrator.store().count().unwrap(), 1);
    }
}

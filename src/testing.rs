//! In-process doubles shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::audit::ParseMetrics;
use crate::db::{Page, PageRequest, ProductFilter, ProductStore, SqliteStore};
use crate::error::{FetchError, PersistError};
use crate::fetch::Fetcher;
use crate::model::Product;
use crate::orchestrator::{OrchestratorOptions, ParseOrchestrator};

pub fn page(title: &str, price: &str) -> String {
    format!(
        r#"<html><head><title>{title} | shop</title></head>
           <body><h1 itemprop="name">{title}</h1>
           <span itemprop="price">{price}</span></body></html>"#
    )
}

#[derive(Clone)]
enum Reply {
    Markup(String),
    Status(u16),
}

/// Serves canned markup per URL and counts calls. Unknown URLs get a 404.
#[derive(Default)]
pub struct ScriptedFetcher {
    replies: Mutex<HashMap<String, Reply>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<HashMap<String, usize>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, markup: impl Into<String>) -> &Self {
        self.replies.lock().unwrap().insert(url.to_string(), Reply::Markup(markup.into()));
        self
    }

    pub fn fail(&self, url: &str, status: u16) -> &Self {
        self.replies.lock().unwrap().insert(url.to_string(), Reply::Status(status));
        self
    }

    pub fn delay(&self, url: &str, delay: Duration) -> &Self {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
        self
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let delay = self.delays.lock().unwrap().get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        let reply = self.replies.lock().unwrap().get(url).cloned();
        match reply {
            Some(Reply::Markup(m)) => Ok(m),
            Some(Reply::Status(status)) => Err(FetchError::Status { url: url.to_string(), status }),
            None => Err(FetchError::Status { url: url.to_string(), status: 404 }),
        }
    }
}

/// Store whose writes always fail.
pub struct ReadOnlyStore;

impl ProductStore for ReadOnlyStore {
    fn find_by_url(&self, _url: &str) -> Result<Option<Product>, PersistError> {
        Ok(None)
    }

    fn exists_by_url(&self, _url: &str) -> Result<bool, PersistError> {
        Ok(false)
    }

    fn upsert(&self, _product: &Product) -> Result<Product, PersistError> {
        Err(PersistError::Poisoned)
    }

    fn find_filtered(
        &self,
        _filter: &ProductFilter,
        page: &PageRequest,
    ) -> Result<Page<Product>, PersistError> {
        Ok(Page { items: Vec::new(), total: 0, page: page.page, size: page.size })
    }

    fn find_expensive(&self, _threshold: Decimal) -> Result<Vec<Product>, PersistError> {
        Ok(Vec::new())
    }

    fn count(&self) -> Result<usize, PersistError> {
        Ok(0)
    }
}

pub struct Rig {
    pub fetcher: Arc<ScriptedFetcher>,
    pub store: Arc<SqliteStore>,
    pub metrics: Arc<ParseMetrics>,
    pub orchestrator: ParseOrchestrator,
}

pub fn rig(fetcher: ScriptedFetcher, options: OrchestratorOptions) -> Rig {
    let fetcher = Arc::new(fetcher);
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let metrics = Arc::new(ParseMetrics::new());
    let orchestrator =
        ParseOrchestrator::new(fetcher.clone(), store.clone(), metrics.clone(), options);
    Rig { fetcher, store, metrics, orchestrator }
}

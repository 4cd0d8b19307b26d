use std::path::{Path, PathBuf};
use std::time::Duration;

use ::config::Config;
use serde::Deserialize;
use tracing::{info, warn};

use crate::fetch::{FetchOptions, FetcherKind, DEFAULT_USER_AGENT};
use crate::orchestrator::OrchestratorOptions;

/// Runtime settings. Read from an optional `prices.toml` in the working
/// directory, an optional explicit file, then `PRICES_*` environment
/// variables (e.g. `PRICES_WORKERS=8`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub db_path: PathBuf,
    pub base_url: String,
    pub links_file: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// 0 waits for batches indefinitely.
    pub join_timeout_secs: u64,
    pub user_agent: String,
    pub fetcher: FetcherKind,
    pub retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            db_path: PathBuf::from("data/products.sqlite"),
            base_url: "https://pitergsm.ru".to_string(),
            links_file: PathBuf::from("product_links.json"),
            workers: 5,
            queue_capacity: 100,
            batch_size: 5,
            initial_delay_secs: 5,
            interval_secs: 3,
            fetch_timeout_secs: 10,
            connect_timeout_secs: 5,
            join_timeout_secs: 120,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            fetcher: FetcherKind::default(),
            retries: 2,
            retry_delay_ms: 1000,
        }
    }
}

impl Settings {
    /// Never fails: unreadable configuration falls back to defaults.
    pub fn load(file: Option<&Path>) -> Settings {
        let mut builder = Config::builder()
            .add_source(::config::File::with_name("prices").required(false));
        if let Some(file) = file {
            builder = builder.add_source(::config::File::from(file));
        }
        let settings = builder
            .add_source(::config::Environment::with_prefix("PRICES").try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize::<Settings>());

        match settings {
            Ok(s) => {
                info!(settings_loaded = ?s, "configuration loaded");
                s
            }
            Err(e) => {
                warn!("invalid configuration, using defaults: {}", e);
                Settings::default()
            }
        }
    }

    pub fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_secs(self.fetch_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            user_agent: self.user_agent.clone(),
            headers: Vec::new(),
            retries: self.retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..FetchOptions::default()
        }
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            join_timeout: self.join_timeout(),
        }
    }

    pub fn join_timeout(&self) -> Option<Duration> {
        (self.join_timeout_secs > 0).then(|| Duration::from_secs(self.join_timeout_secs))
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

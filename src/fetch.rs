use std::io::Read;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::FetchError;

const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Downloads page markup. Implementations are interchangeable.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetcherKind {
    Blocking,
    #[default]
    Async,
    Typed,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    /// Extra attempts after a transient failure (async and typed clients only).
    pub retries: u32,
    pub retry_delay: Duration,
    /// Larger bodies are rejected as [`FetchError::Body`].
    pub max_body_bytes: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        FetchOptions {
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            headers: Vec::new(),
            retries: 2,
            retry_delay: Duration::from_secs(1),
            max_body_bytes: MAX_BODY_BYTES,
        }
    }
}

/// Build the fetch strategy selected in configuration.
pub fn build_fetcher(
    kind: FetcherKind,
    options: &FetchOptions,
    base_url: &str,
) -> Result<Box<dyn Fetcher>> {
    Ok(match kind {
        FetcherKind::Blocking => Box::new(BlockingFetcher::new(options)?),
        FetcherKind::Async => Box::new(AsyncFetcher::new(options)?),
        FetcherKind::Typed => Box::new(TypedFetcher::new(base_url, options)?),
    })
}

fn header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name {:?}", name))?;
        let value = HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header {}", name))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn check_size(url: &str, len: Option<u64>, limit: usize) -> Result<(), FetchError> {
    match len {
        Some(n) if n > limit as u64 => Err(FetchError::Body {
            url: url.to_string(),
            message: format!("body exceeds the {} byte limit", limit),
        }),
        _ => Ok(()),
    }
}

/// Delay before retry number `attempt + 1`: doubles each time, capped.
fn backoff(retry_delay: Duration, attempt: u32) -> Duration {
    retry_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(MAX_BACKOFF)
}

// ── Blocking ──

/// Synchronous client run on the blocking thread pool.
///
/// The client owns its own runtime thread, so it is built lazily on the
/// blocking pool and reused for every request.
pub struct BlockingFetcher {
    options: Arc<FetchOptions>,
    headers: HeaderMap,
    client: Arc<OnceLock<reqwest::blocking::Client>>,
}

impl BlockingFetcher {
    pub fn new(options: &FetchOptions) -> Result<Self> {
        Ok(BlockingFetcher {
            headers: header_map(&options.headers)?,
            options: Arc::new(options.clone()),
            client: Arc::default(),
        })
    }
}

impl Drop for BlockingFetcher {
    fn drop(&mut self) {
        // The client joins its runtime thread on drop; keep that off async workers.
        let client = std::mem::take(&mut self.client);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(move || drop(client));
        }
    }
}

fn blocking_client<'a>(
    cell: &'a OnceLock<reqwest::blocking::Client>,
    url: &str,
    options: &FetchOptions,
    headers: HeaderMap,
) -> Result<&'a reqwest::blocking::Client, FetchError> {
    if let Some(client) = cell.get() {
        return Ok(client);
    }
    let built = reqwest::blocking::Client::builder()
        .user_agent(options.user_agent.as_str())
        .default_headers(headers)
        .timeout(options.timeout)
        .connect_timeout(options.connect_timeout)
        .build()
        .map_err(|e| FetchError::from_reqwest(url, e))?;
    debug!("blocking client built");
    Ok(cell.get_or_init(|| built))
}

fn fetch_blocking(
    url: &str,
    client: &reqwest::blocking::Client,
    limit: usize,
) -> Result<String, FetchError> {
    let response = client.get(url).send().map_err(|e| FetchError::from_reqwest(url, e))?;
    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::Status { url: url.to_string(), status: status.as_u16() });
    }
    check_size(url, response.content_length(), limit)?;

    // One byte past the limit is enough to know it was exceeded.
    let mut body = Vec::new();
    response
        .take(limit as u64 + 1)
        .read_to_end(&mut body)
        .map_err(|e| FetchError::Body { url: url.to_string(), message: e.to_string() })?;
    check_size(url, Some(body.len() as u64), limit)?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

#[async_trait]
impl Fetcher for BlockingFetcher {
    fn name(&self) -> &'static str {
        "blocking"
    }

    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let owned = url.to_string();
        let options = Arc::clone(&self.options);
        let headers = self.headers.clone();
        let cell = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            let client = blocking_client(&cell, &owned, &options, headers)?;
            fetch_blocking(&owned, client, options.max_body_bytes)
        })
        .await
            .map_err(|e| FetchError::Transport { url: url.to_string(), message: e.to_string() })?
    }
}

// ── Async ──

/// Non-blocking client with retries on transient failures.
pub struct AsyncFetcher {
    client: reqwest::Client,
    retries: u32,
    retry_delay: Duration,
    max_body_bytes: usize,
}

impl AsyncFetcher {
    pub fn new(options: &FetchOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(options.user_agent.as_str())
            .default_headers(header_map(&options.headers)?)
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(AsyncFetcher {
            client,
            retries: options.retries,
            retry_delay: options.retry_delay,
            max_body_bytes: options.max_body_bytes,
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<String, FetchError> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url: url.to_string(), status: status.as_u16() });
        }
        let limit = self.max_body_bytes;
        check_size(url, response.content_length(), limit)?;

        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::from_reqwest(url, e))?
        {
            body.extend_from_slice(&chunk);
            check_size(url, Some(body.len() as u64), limit)?;
        }
        debug!(url, bytes = body.len(), "fetched");
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

#[async_trait]
impl Fetcher for AsyncFetcher {
    fn name(&self) -> &'static str {
        "async"
    }

    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Err(e) if e.is_transient() && attempt < self.retries => {
                    let backoff = backoff(self.retry_delay, attempt);
                    warn!(
                        "{} (attempt {}/{}), retrying in {:.1}s",
                        e,
                        attempt + 1,
                        self.retries,
                        backoff.as_secs_f64()
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

// ── Typed ──

/// Client declared against a single origin with fixed routes.
pub struct TypedFetcher {
    base: Url,
    inner: AsyncFetcher,
}

impl TypedFetcher {
    pub fn new(base_url: &str, options: &FetchOptions) -> Result<Self> {
        let base = Url::parse(base_url).with_context(|| format!("invalid base url {}", base_url))?;
        Ok(TypedFetcher { base, inner: AsyncFetcher::new(options)? })
    }

    /// `GET /`
    pub async fn get_root(&self) -> Result<String, FetchError> {
        self.inner.fetch(self.base.as_str()).await
    }

    /// `GET /{path}`
    pub async fn get_by_path(&self, path: &str) -> Result<String, FetchError> {
        let url = self.base.join(path).map_err(|e| FetchError::Transport {
            url: path.to_string(),
            message: e.to_string(),
        })?;
        self.inner.fetch(url.as_str()).await
    }

    fn route_for(&self, url: &str) -> Option<String> {
        let parsed = Url::parse(url).ok()?;
        if parsed.origin() != self.base.origin() {
            return None;
        }
        let mut route = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            route.push('?');
            route.push_str(query);
        }
        Some(route)
    }
}

#[async_trait]
impl Fetcher for TypedFetcher {
    fn name(&self) -> &'static str {
        "typed"
    }

    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        match self.route_for(url) {
            Some(route) if route == "/" => self.get_root().await,
            Some(route) => self.get_by_path(&route).await,
            None => Err(FetchError::UnsupportedUrl {
                url: url.to_string(),
                base: self.base.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn http(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        )
    }

    /// Answers one connection per scripted response, in order.
    async fn serve(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            for response in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), hits)
    }

    fn quick() -> FetchOptions {
        FetchOptions {
            timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(500),
            retry_delay: Duration::from_millis(10),
            ..FetchOptions::default()
        }
    }

    #[tokio::test]
    async fn async_fetch_returns_body() {
        let (base, _) = serve(vec![http("200 OK", "<h1>Телефон</h1>")]).await;
        let fetcher = AsyncFetcher::new(&quick()).unwrap();
        let body = fetcher.fetch(&format!("{}/phone", base)).await.unwrap();
        assert_eq!(body, "<h1>Телефон</h1>");
    }

    #[tokio::test]
    async fn async_fetch_retries_server_errors() {
        let (base, hits) = serve(vec![
            http("503 Service Unavailable", ""),
            http("200 OK", "ok"),
        ])
        .await;
        let fetcher = AsyncFetcher::new(&quick()).unwrap();
        assert_eq!(fetcher.fetch(&base).await.unwrap(), "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn async_fetch_does_not_retry_client_errors() {
        let (base, hits) = serve(vec![http("404 Not Found", "gone")]).await;
        let fetcher = AsyncFetcher::new(&quick()).unwrap();
        let err = fetcher.fetch(&base).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_refused_is_a_fetch_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let fetcher = AsyncFetcher::new(&FetchOptions { retries: 0, ..quick() }).unwrap();
        let err = fetcher.fetch(&format!("http://{}/", addr)).await.unwrap_err();
        assert_eq!(err.url(), format!("http://{}/", addr));
        assert!(!matches!(err, FetchError::Status { .. }));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let options = FetchOptions {
            timeout: Duration::from_millis(100),
            retries: 0,
            ..quick()
        };
        let fetcher = AsyncFetcher::new(&options).unwrap();
        let err = fetcher.fetch(&format!("http://{}/", addr)).await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn blocking_fetch_runs_off_the_runtime() {
        let (base, _) = serve(vec![http("200 OK", "blocking body")]).await;
        let fetcher = BlockingFetcher::new(&quick()).unwrap();
        assert_eq!(fetcher.fetch(&base).await.unwrap(), "blocking body");
    }

    #[tokio::test]
    async fn blocking_fetch_maps_status() {
        let (base, _) = serve(vec![http("500 Internal Server Error", "")]).await;
        let fetcher = BlockingFetcher::new(&quick()).unwrap();
        let err = fetcher.fetch(&base).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 500, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_client_is_built_once() {
        let (base, hits) = serve(vec![http("200 OK", "one"), http("200 OK", "two")]).await;
        let fetcher = BlockingFetcher::new(&quick()).unwrap();
        assert_eq!(fetcher.fetch(&base).await.unwrap(), "one");
        let first = fetcher.client.get().map(|c| c as *const _);
        assert_eq!(fetcher.fetch(&base).await.unwrap(), "two");
        assert!(first.is_some());
        assert_eq!(fetcher.client.get().map(|c| c as *const _), first);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    /// Chunked response without a Content-Length header.
    fn chunked(parts: &[String]) -> String {
        let mut out = String::from(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n",
        );
        for part in parts {
            out.push_str(&format!("{:x}\r\n{}\r\n", part.len(), part));
        }
        out.push_str("0\r\n\r\n");
        out
    }

    fn capped() -> FetchOptions {
        FetchOptions { max_body_bytes: 1024, retries: 0, ..quick() }
    }

    #[tokio::test]
    async fn async_fetch_stops_reading_past_the_limit() {
        let big = vec!["x".repeat(600); 3];
        let (base, _) = serve(vec![chunked(&big)]).await;
        let err = AsyncFetcher::new(&capped()).unwrap().fetch(&base).await.unwrap_err();
        assert!(matches!(err, FetchError::Body { .. }), "{err:?}");

        let small = vec!["y".repeat(300); 2];
        let (base, _) = serve(vec![chunked(&small)]).await;
        let body = AsyncFetcher::new(&capped()).unwrap().fetch(&base).await.unwrap();
        assert_eq!(body.len(), 600);
    }

    #[tokio::test]
    async fn blocking_fetch_stops_reading_past_the_limit() {
        let big = vec!["x".repeat(600); 3];
        let (base, _) = serve(vec![chunked(&big)]).await;
        let err = BlockingFetcher::new(&capped()).unwrap().fetch(&base).await.unwrap_err();
        assert!(matches!(err, FetchError::Body { .. }), "{err:?}");
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let second = Duration::from_secs(1);
        assert_eq!(backoff(second, 0), second);
        assert_eq!(backoff(second, 3), Duration::from_secs(8));
        assert_eq!(backoff(second, 40), MAX_BACKOFF);
        assert_eq!(backoff(Duration::MAX, u32::MAX), MAX_BACKOFF);
        assert_eq!(backoff(Duration::ZERO, 50), Duration::ZERO);
    }

    #[tokio::test]
    async fn typed_fetch_only_serves_its_origin() {
        let (base, hits) = serve(vec![http("200 OK", "typed")]).await;
        let fetcher = TypedFetcher::new(&base, &quick()).unwrap();

        let err = fetcher.fetch("https://elsewhere.test/product").await.unwrap_err();
        assert!(matches!(err, FetchError::UnsupportedUrl { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let body = fetcher.fetch(&format!("{}/catalog/phone?id=1", base)).await.unwrap();
        assert_eq!(body, "typed");
    }

    #[test]
    fn invalid_headers_are_rejected() {
        let options = FetchOptions {
            headers: vec![("bad header".into(), "x".into())],
            ..FetchOptions::default()
        };
        assert!(AsyncFetcher::new(&options).is_err());
        assert!(build_fetcher(FetcherKind::Blocking, &options, "https://a.test").is_err());
    }

    #[test]
    fn kinds_deserialize_lowercase() {
        let kind: FetcherKind = serde_json::from_str("\"typed\"").unwrap();
        assert_eq!(kind, FetcherKind::Typed);
        assert_eq!(FetcherKind::default(), FetcherKind::Async);
    }
}

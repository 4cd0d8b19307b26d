use thiserror::Error;

/// Transport-level failure while downloading a page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out fetching {url}")]
    Timeout { url: String },
    #[error("connection to {url} failed: {message}")]
    Connect { url: String, message: String },
    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("{url} is not served by this client (base {base})")]
    UnsupportedUrl { url: String, base: String },
    #[error("unreadable body from {url}: {message}")]
    Body { url: String, message: String },
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            FetchError::Timeout { url }
            | FetchError::Connect { url, .. }
            | FetchError::Status { url, .. }
            | FetchError::UnsupportedUrl { url, .. }
            | FetchError::Body { url, .. }
            | FetchError::Transport { url, .. } => url,
        }
    }

    /// 5xx, 429 and timeouts are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Timeout { .. } => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        let url = url.to_string();
        if err.is_timeout() {
            FetchError::Timeout { url }
        } else if let Some(status) = err.status() {
            FetchError::Status { url, status: status.as_u16() }
        } else if err.is_connect() {
            FetchError::Connect { url, message: err.to_string() }
        } else if err.is_body() || err.is_decode() {
            FetchError::Body { url, message: err.to_string() }
        } else {
            FetchError::Transport { url, message: err.to_string() }
        }
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("markup for {url} could not be read as a document")]
    MalformedMarkup { url: String },
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("corrupt row for {url}: {message}")]
    Corrupt { url: String, message: String },
}

/// Task-level failure for one URL.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("batch deadline passed before {url} finished")]
    Deadline { url: String },
    #[error("worker running {url} stopped without a result")]
    WorkerLost { url: String },
}

impl ParseError {
    /// The task may still finish after this error was reported.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, ParseError::Deadline { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let url = "https://shop".to_string();
        assert!(FetchError::Timeout { url: url.clone() }.is_transient());
        assert!(FetchError::Status { url: url.clone(), status: 503 }.is_transient());
        assert!(FetchError::Status { url: url.clone(), status: 429 }.is_transient());
        assert!(!FetchError::Status { url: url.clone(), status: 404 }.is_transient());
        assert!(!FetchError::Connect { url, message: "refused".into() }.is_transient());
    }

    #[test]
    fn only_deadline_is_incomplete() {
        let err = ParseError::Deadline { url: "u".into() };
        assert!(err.is_incomplete());
        assert!(!ParseError::WorkerLost { url: "u".into() }.is_incomplete());
        let err = ParseError::from(FetchError::Timeout { url: "u".into() });
        assert!(!err.is_incomplete());
        assert!(err.to_string().contains("timed out"));
    }
}

use std::time::Duration;

use thiserror::Error;

/// Application-wide error types for Harrow.
#[derive(Error, Debug)]
pub enum AppError {
    /// The resource does not exist (HTTP 404). Never retried.
    #[error("Nothing found at {url}")]
    ResourceNotFound { url: String },

    /// Connection reset, proxy failure or any other transport-level problem.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Request timed out.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The browser never reached the expected loaded state.
    #[error("Page failed to load: {0}")]
    PageLoadFailed(String),

    /// The server answered with a non-success status.
    #[error("Request failed - {status} raised requesting {url}")]
    RequestFailed { url: String, status: u16 },

    /// A captcha was still present after the solve hook ran.
    #[error("Captcha hit on {url}")]
    CaptchaHit { url: String },

    /// The retry budget was consumed without a successful response.
    #[error("Scrape failed for {url} after {attempts} attempt(s): {source}")]
    ScrapeExhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<AppError>,
    },

    /// Invalid or conflicting settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No registered source matches the URL.
    #[error("No source configured for {url}")]
    UnconfiguredSource { url: String },

    /// A locator resolved to something other than a string leaf.
    #[error("{locator} could not be resolved into a string")]
    WrongFieldType { locator: String },

    /// Cooperative signal asking the task pool to start no further tasks.
    #[error("Pool execution stopped: {0}")]
    PoolStopped(String),

    /// Execution was interrupted (e.g. Ctrl-C). Always aborts a pool run.
    #[error("Interrupted")]
    Interrupted,

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Retry classes consumed by the scraper's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Flaky network: reset connections, proxy errors, timeouts.
    Transport,
    /// The request went through but the status was not a success.
    RequestFailed,
}

impl AppError {
    /// Returns the retry class of this error, or `None` if it is terminal.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self {
            AppError::Transport(_) | AppError::Timeout(_) | AppError::PageLoadFailed(_) => {
                Some(ErrorClass::Transport)
            }
            AppError::RequestFailed { .. } => Some(ErrorClass::RequestFailed),
            _ => None,
        }
    }

    /// Returns true if this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        self.error_class().is_some()
    }

    /// Returns true if this error must abort a whole pool run regardless of
    /// the pool's error policy.
    pub fn is_stopping(&self) -> bool {
        matches!(self, AppError::Interrupted)
    }

    /// Returns true for the cooperative pool-stopper signal.
    pub fn is_pool_stopper(&self) -> bool {
        matches!(self, AppError::PoolStopped(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            AppError::Transport("reset".into()).error_class(),
            Some(ErrorClass::Transport)
        );
        assert_eq!(
            AppError::Timeout(Duration::from_secs(5)).error_class(),
            Some(ErrorClass::Transport)
        );
        assert_eq!(
            AppError::RequestFailed {
                url: "https://example.com".into(),
                status: 503,
            }
            .error_class(),
            Some(ErrorClass::RequestFailed)
        );
        assert!(
            !AppError::ResourceNotFound {
                url: "https://example.com".into()
            }
            .is_retryable()
        );
        assert!(!AppError::Config("bad".into()).is_retryable());
    }

    #[test]
    fn timeout_keeps_sub_second_precision() {
        assert_eq!(
            AppError::Timeout(Duration::from_millis(200)).to_string(),
            "Request timed out after 200ms"
        );
    }

    #[test]
    fn test_stopping_errors() {
        assert!(AppError::Interrupted.is_stopping());
        assert!(!AppError::PoolStopped("done".into()).is_stopping());
        assert!(AppError::PoolStopped("done".into()).is_pool_stopper());
        assert!(!AppError::Transport("reset".into()).is_stopping());
    }

    #[test]
    fn test_exhausted_chains_cause() {
        use std::error::Error;

        let err = AppError::ScrapeExhausted {
            url: "https://example.com".into(),
            attempts: 2,
            source: Box::new(AppError::Transport("reset".into())),
        };
        let cause = err.source().unwrap();
        assert_eq!(cause.to_string(), "Transport error: reset");
        assert!(err.to_string().contains("after 2 attempt(s)"));
    }
}

//! Retrying request driver.
//!
//! Every attempt goes through three stages:
//!
//! 1. **act**: build a [`FetchRequest`] for the current host and hand it to
//!    the backend.
//! 2. **classify**: turn the outcome into a [`Verdict`]. A 404 aborts, a
//!    captcha gets one solve attempt, and any other non-success status is a
//!    retryable request failure.
//! 3. **decide**: charge the failure against the retry budget, rotate the
//!    host when the failure points at it, then retry or give up with
//!    [`AppError::ScrapeExhausted`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppError, ErrorClass};
use crate::hosts::{Host, HostRegistry};
use crate::response::{RawResponse, Response};
use crate::traits::{Backend, FetchRequest, Interactive};

/// Budget units charged per failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct CostTable {
    pub transport: u32,
    pub request_failed: u32,
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            transport: 1,
            request_failed: 2,
        }
    }
}

impl CostTable {
    /// Units charged for `class`, never less than one.
    pub fn cost(&self, class: ErrorClass) -> u32 {
        let units = match class {
            ErrorClass::Transport => self.transport,
            ErrorClass::RequestFailed => self.request_failed,
        };
        units.max(1)
    }
}

/// Retry budget and request defaults for one scraper.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct ScraperConfig {
    /// Budget units available to one call. 0 still allows a single attempt.
    pub request_retries: u32,

    /// Seconds to wait between attempts.
    pub request_retry_interval: f64,

    /// Switch host after a request failure.
    pub rotate_host_on_error: bool,

    pub costs: CostTable,

    /// Per-attempt timeout in seconds.
    pub timeout: f64,

    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,

    /// Body substrings that mark a bot challenge.
    pub captcha_signatures: Vec<String>,

    /// Locator a browser waits for before composing the page.
    pub wait_for: Option<String>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            request_retries: 4,
            request_retry_interval: 1.0,
            rotate_host_on_error: true,
            costs: CostTable::default(),
            timeout: 10.0,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            captcha_signatures: Vec::new(),
            wait_for: None,
        }
    }
}

impl ScraperConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.request_retry_interval).unwrap_or(Duration::ZERO)
    }

    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout).unwrap_or(Duration::ZERO)
    }
}

/// Outcome of the classify stage.
#[derive(Debug)]
enum Verdict {
    Success(Response),
    Retry(AppError),
    Abort(AppError),
}

/// Drives a backend through the retry state machine.
pub struct Scraper<B> {
    backend: B,
    hosts: Arc<HostRegistry>,
    config: ScraperConfig,
    signatures: Arc<[String]>,
}

impl<B: Backend> Scraper<B> {
    pub fn new(backend: B, hosts: Arc<HostRegistry>, config: ScraperConfig) -> Self {
        let signatures = config.captcha_signatures.iter().cloned().collect();
        Self {
            backend,
            hosts,
            config,
            signatures,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn hosts(&self) -> &Arc<HostRegistry> {
        &self.hosts
    }

    pub fn config(&self) -> &ScraperConfig {
        &self.config
    }

    /// Fetches `url`, retrying and rotating hosts until it succeeds or the
    /// budget runs out.
    pub async fn get(&self, url: &str) -> Result<Response, AppError> {
        self.drive(url, move |request| async move {
            self.backend.fetch(&request).await
        })
        .await
    }

    fn fetch_request(&self, url: &str, host: &Host) -> FetchRequest {
        FetchRequest {
            url: url.to_string(),
            headers: self.config.headers.clone(),
            cookies: self.config.cookies.clone(),
            proxy: host.proxy_url(),
            user_agent: host.user_agent.clone(),
            timeout: self.config.timeout(),
            wait_for: self.config.wait_for.clone(),
        }
    }

    async fn drive<F, Fut>(&self, url: &str, mut act: F) -> Result<Response, AppError>
    where
        F: FnMut(FetchRequest) -> Fut,
        Fut: Future<Output = Result<RawResponse, AppError>>,
    {
        let budget = self.config.request_retries;
        let mut spent = 0u32;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let host = self.hosts.current();
            tracing::debug!(url, host = %host, attempt = attempts, "Requesting");

            let outcome = act(self.fetch_request(url, &host)).await;

            let cause = match self.classify(url, outcome).await {
                Verdict::Success(response) => {
                    self.hosts.record_use(host.id);
                    tracing::debug!(url, status = response.status(), "Request succeeded");
                    return Ok(response);
                }
                Verdict::Abort(err) => {
                    tracing::warn!(url, error = %err, "Request aborted");
                    return Err(err);
                }
                Verdict::Retry(cause) => cause,
            };

            // decide
            let class = cause.error_class().unwrap_or(ErrorClass::RequestFailed);
            spent = spent.saturating_add(self.config.costs.cost(class));

            if class == ErrorClass::RequestFailed && self.config.rotate_host_on_error {
                self.hosts.rotate_from(host.id);
            }

            if spent >= budget {
                tracing::warn!(url, attempts, error = %cause, "Retry budget exhausted");
                return Err(AppError::ScrapeExhausted {
                    url: url.to_string(),
                    attempts,
                    source: Box::new(cause),
                });
            }

            tracing::warn!(
                url,
                attempt = attempts,
                spent,
                budget,
                error = %cause,
                "Request failed, retrying"
            );
            tokio::time::sleep(self.config.retry_interval()).await;
        }
    }

    async fn classify(&self, url: &str, outcome: Result<RawResponse, AppError>) -> Verdict {
        let raw = match outcome {
            Ok(raw) => raw,
            Err(err) if err.is_retryable() => return Verdict::Retry(err),
            Err(err) => return Verdict::Abort(err),
        };

        let mut response = Response::new(raw, Arc::clone(&self.signatures));

        if response.is_not_found() {
            return Verdict::Abort(AppError::ResourceNotFound {
                url: url.to_string(),
            });
        }

        if response.is_captcha() {
            tracing::info!(url, "Captcha detected, attempting to solve it");
            response = match self.backend.solve_captcha(response).await {
                Ok(solved) if !solved.is_captcha() => solved,
                Ok(_) => {
                    return Verdict::Abort(AppError::CaptchaHit {
                        url: url.to_string(),
                    });
                }
                Err(err) => {
                    tracing::debug!(url, error = %err, "Captcha solver failed");
                    return Verdict::Abort(AppError::CaptchaHit {
                        url: url.to_string(),
                    });
                }
            };
        }

        if !response.is_success() {
            tracing::info!(url, "{}", response.message());
            return Verdict::Retry(AppError::RequestFailed {
                url: url.to_string(),
                status: response.status(),
            });
        }

        Verdict::Success(response)
    }
}

impl<B: Interactive> Scraper<B> {
    /// Clicks `locator` on the live page, with the same retry policy as [`Scraper::get`].
    pub async fn click(&self, locator: &str) -> Result<Response, AppError> {
        let url = self.backend.current_url().await.unwrap_or_default();
        self.drive(&url, move |request| async move {
            self.backend.click(locator, &request).await
        })
        .await
    }

    /// Waits up to the configured timeout for `locator` to show up.
    pub async fn wait_for(&self, locator: &str) -> Result<bool, AppError> {
        self.backend.wait_for(locator, self.config.timeout()).await
    }
}

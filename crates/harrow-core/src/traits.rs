use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use crate::error::AppError;
use crate::response::{BackendKind, RawResponse, Response};

/// Everything a backend needs to perform one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    /// Proxy URL (`scheme://host:port`), `None` for a direct connection.
    pub proxy: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    /// Locator the browser waits for before composing the response.
    pub wait_for: Option<String>,
}

/// Retrieves raw responses over the network.
///
/// Implemented by the HTTP client and the headless browser; the scraper is
/// generic over it so tests can script responses without any I/O.
pub trait Backend: Send + Sync + Clone {
    fn kind(&self) -> BackendKind;

    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<RawResponse, AppError>> + Send;

    /// Whether several pool workers may call this backend at once.
    fn supports_parallel(&self) -> bool {
        true
    }

    /// Gets one chance to clear a captcha before the scraper gives up.
    ///
    /// The default cannot solve anything and hands the response back.
    fn solve_captcha(
        &self,
        response: Response,
    ) -> impl Future<Output = Result<Response, AppError>> + Send {
        async move { Ok(response) }
    }
}

/// A backend driving a persistent, interactive page.
pub trait Interactive: Backend {
    /// Clicks the element at `locator`, waits for the page, and composes a response.
    fn click(
        &self,
        locator: &str,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<RawResponse, AppError>> + Send;

    /// Polls for `locator` until it appears or `timeout` elapses.
    fn wait_for(
        &self,
        locator: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn current_url(&self) -> impl Future<Output = Option<String>> + Send;

    /// Builds a response out of the current page state.
    fn compose_response(&self) -> impl Future<Output = Result<RawResponse, AppError>> + Send;
}

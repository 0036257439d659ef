//! Test utilities: a scripted backend and response builders.
//!
//! The mock records every request it receives behind `Arc<Mutex<_>>` so
//! tests can assert on hosts, headers and attempt counts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::response::{BackendKind, RawResponse, Response};
use crate::traits::{Backend, FetchRequest, Interactive};

pub const TEST_URL: &str = "https://example.com/page";

/// A raw response for [`TEST_URL`] with no headers or cookies.
pub fn raw_response(status: u16, body: &str) -> RawResponse {
    RawResponse {
        status,
        body: body.to_string(),
        headers: HashMap::new(),
        cookies: HashMap::new(),
        url: TEST_URL.to_string(),
        backend: BackendKind::Http,
    }
}

/// What the mock answers once its queue is empty.
#[derive(Clone)]
enum Fallback {
    Response(RawResponse),
    TransportError,
}

/// Scripted backend. Each call pops the next queued result; once the queue
/// is empty the fallback answers every call.
#[derive(Clone)]
pub struct MockBackend {
    queue: Arc<Mutex<Vec<Result<RawResponse, AppError>>>>,
    fallback: Fallback,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
    clicks: Arc<Mutex<Vec<String>>>,
    solution: Option<RawResponse>,
    solve_calls: Arc<Mutex<usize>>,
    parallel: bool,
}

impl MockBackend {
    fn with_fallback(fallback: Fallback) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            fallback,
            requests: Arc::new(Mutex::new(Vec::new())),
            clicks: Arc::new(Mutex::new(Vec::new())),
            solution: None,
            solve_calls: Arc::new(Mutex::new(0)),
            parallel: true,
        }
    }

    /// Answers every call with `status` and `body`.
    pub fn always(status: u16, body: &str) -> Self {
        Self::with_fallback(Fallback::Response(raw_response(status, body)))
    }

    /// Fails every call with a transport error.
    pub fn always_transport_error() -> Self {
        Self::with_fallback(Fallback::TransportError)
    }

    /// Plays `responses` in order, then answers 200 with an empty page.
    pub fn with_responses(responses: Vec<Result<RawResponse, AppError>>) -> Self {
        let mock = Self::always(200, "<html></html>");
        *mock.queue.lock().unwrap() = responses;
        mock
    }

    /// `solve_captcha` replaces the page with `raw`.
    pub fn with_captcha_solution(mut self, raw: RawResponse) -> Self {
        self.solution = Some(raw);
        self
    }

    /// Reports that the backend cannot be shared by parallel workers.
    pub fn sequential_only(mut self) -> Self {
        self.parallel = false;
        self
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.clicks.lock().unwrap().clone()
    }

    pub fn solve_calls(&self) -> usize {
        *self.solve_calls.lock().unwrap()
    }

    fn next(&self) -> Result<RawResponse, AppError> {
        let mut queue = self.queue.lock().unwrap();
        if !queue.is_empty() {
            return queue.remove(0);
        }
        match &self.fallback {
            Fallback::Response(raw) => Ok(raw.clone()),
            Fallback::TransportError => Err(AppError::Transport("connection reset".into())),
        }
    }
}

impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        self.next()
    }

    fn supports_parallel(&self) -> bool {
        self.parallel
    }

    async fn solve_captcha(&self, response: Response) -> Result<Response, AppError> {
        *self.solve_calls.lock().unwrap() += 1;
        match &self.solution {
            Some(raw) => Ok(Response::new(
                raw.clone(),
                response.captcha_signatures().clone(),
            )),
            None => Ok(response),
        }
    }
}

impl Interactive for MockBackend {
    async fn click(&self, locator: &str, request: &FetchRequest) -> Result<RawResponse, AppError> {
        self.clicks.lock().unwrap().push(locator.to_string());
        self.requests.lock().unwrap().push(request.clone());
        self.next()
    }

    async fn wait_for(&self, _locator: &str, _timeout: Duration) -> Result<bool, AppError> {
        Ok(true)
    }

    async fn current_url(&self) -> Option<String> {
        Some(TEST_URL.to_string())
    }

    async fn compose_response(&self) -> Result<RawResponse, AppError> {
        self.next()
    }
}

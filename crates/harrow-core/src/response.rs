use std::cell::OnceCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use scraper::Html;

/// Which backend produced a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Http,
    Browser,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Http => write!(f, "http"),
            BackendKind::Browser => write!(f, "browser"),
        }
    }
}

/// What a backend hands back for one attempt, before normalisation.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// `0` when the browser composed the page and the status is unknown.
    pub status: u16,
    pub body: String,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub url: String,
    pub backend: BackendKind,
}

/// Normalised response shared by both backends.
///
/// Immutable once built. The parsed document, the parsed JSON body, the
/// captcha flag and the log message are computed on first use and memoised.
#[derive(Debug, Clone)]
pub struct Response {
    raw: RawResponse,
    captcha_signatures: Arc<[String]>,
    document: OnceCell<Html>,
    json: OnceCell<Option<serde_json::Value>>,
    captcha: OnceCell<bool>,
    message: OnceCell<String>,
}

impl Response {
    pub fn new(raw: RawResponse, captcha_signatures: Arc<[String]>) -> Self {
        Self {
            raw,
            captcha_signatures,
            document: OnceCell::new(),
            json: OnceCell::new(),
            captcha: OnceCell::new(),
            message: OnceCell::new(),
        }
    }

    pub fn status(&self) -> u16 {
        self.raw.status
    }

    pub fn body(&self) -> &str {
        &self.raw.body
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.raw.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.raw
            .headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.raw.cookies
    }

    pub fn url(&self) -> &str {
        &self.raw.url
    }

    pub fn backend(&self) -> BackendKind {
        self.raw.backend
    }

    pub fn captcha_signatures(&self) -> &Arc<[String]> {
        &self.captcha_signatures
    }

    /// Status 0 (browser-composed) and anything below 400 count as success.
    pub fn is_success(&self) -> bool {
        self.raw.status == 0 || (200..400).contains(&self.raw.status)
    }

    pub fn is_not_found(&self) -> bool {
        self.raw.status == 404
    }

    /// Parsed HTML document, built once.
    pub fn document(&self) -> &Html {
        self.document
            .get_or_init(|| Html::parse_document(&self.raw.body))
    }

    /// Parsed JSON body, built once. `None` if the body is not JSON.
    pub fn json(&self) -> Option<&serde_json::Value> {
        self.json
            .get_or_init(|| serde_json::from_str(&self.raw.body).ok())
            .as_ref()
    }

    /// True if the body contains any configured captcha signature.
    pub fn is_captcha(&self) -> bool {
        *self.captcha.get_or_init(|| {
            self.captcha_signatures
                .iter()
                .any(|sig| !sig.is_empty() && self.raw.body.contains(sig.as_str()))
        })
    }

    /// Descriptive message for logging.
    pub fn message(&self) -> &str {
        self.message
            .get_or_init(|| format!("{} raised requesting {}", self.raw.status, self.raw.url))
    }

    pub fn into_raw(self) -> RawResponse {
        self.raw
    }
}

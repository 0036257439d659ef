use std::collections::HashMap;
use std::sync::Arc;

use harrow_core::error::AppError;
use harrow_core::registry::SessionCache;
use harrow_core::response::{BackendKind, RawResponse};
use harrow_core::traits::{Backend, FetchRequest};
use reqwest::header::{COOKIE, SET_COOKIE, USER_AGENT};
use reqwest::redirect::Policy;
use reqwest::{Client, Proxy};
use url::Url;

use crate::settings::HttpSettings;

/// Plain HTTP backend on reqwest.
///
/// Keeps one client per proxy so connection pools survive host rotation.
/// Clones share the client cache.
#[derive(Clone)]
pub struct HttpBackend {
    settings: HttpSettings,
    clients: Arc<SessionCache<Option<String>, Client>>,
}

impl HttpBackend {
    pub fn new(settings: HttpSettings) -> Self {
        Self {
            settings,
            clients: Arc::new(SessionCache::new()),
        }
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    fn client_for(&self, proxy: &Option<String>) -> Result<Client, AppError> {
        self.clients
            .get_or_create(proxy, |proxy| build_client(&self.settings, proxy.as_deref()))
    }
}

impl Default for HttpBackend {
    fn default() -> Self {
        Self::new(HttpSettings::default())
    }
}

fn build_client(settings: &HttpSettings, proxy: Option<&str>) -> Result<Client, AppError> {
    let redirect = if settings.max_redirects == 0 {
        Policy::none()
    } else {
        Policy::limited(settings.max_redirects)
    };

    let mut builder = Client::builder()
        .redirect(redirect)
        .connect_timeout(settings.connect_timeout());

    builder = match proxy {
        Some(proxy) => builder.proxy(
            Proxy::all(proxy).map_err(|e| AppError::Config(format!("Invalid proxy {proxy}: {e}")))?,
        ),
        None => builder.no_proxy(),
    };

    tracing::debug!(proxy = proxy.unwrap_or("direct"), "Building HTTP client");
    builder
        .build()
        .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {e}")))
}

impl Backend for HttpBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, AppError> {
        validate_url(&request.url)?;
        let client = self.client_for(&request.proxy)?;

        let mut builder = client
            .get(&request.url)
            .timeout(request.timeout)
            .header(USER_AGENT, request.user_agent.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.cookies.is_empty() {
            builder = builder.header(COOKIE, cookie_header(&request.cookies));
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(request.timeout)
            } else if e.is_connect() {
                AppError::Transport(format!("Connection failed: {e}"))
            } else if e.is_builder() {
                AppError::Config(format!("Invalid request for {}: {e}", request.url))
            } else {
                AppError::Transport(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let url = response.url().to_string();

        let mut headers = HashMap::new();
        let mut cookies = HashMap::new();
        for (name, value) in response.headers() {
            let Ok(value) = value.to_str() else {
                continue;
            };
            if *name == SET_COOKIE {
                if let Some((key, val)) = parse_set_cookie(value) {
                    cookies.insert(key, val);
                }
            }
            append_header(&mut headers, name.as_str(), value);
        }

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(request.timeout)
            } else {
                AppError::Transport(format!("Failed to read response body: {e}"))
            }
        })?;

        Ok(RawResponse {
            status,
            body,
            headers,
            cookies,
            url,
            backend: BackendKind::Http,
        })
    }
}

fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed = Url::parse(url).map_err(|e| AppError::Config(format!("Invalid URL {url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(AppError::Config(format!(
            "Unsupported scheme {scheme:?} in {url}"
        ))),
    }
}

/// Repeated headers keep every value, comma separated.
fn append_header(headers: &mut HashMap<String, String>, name: &str, value: &str) {
    headers
        .entry(name.to_string())
        .and_modify(|existing| {
            existing.push_str(", ");
            existing.push_str(value);
        })
        .or_insert_with(|| value.to_string());
}

fn cookie_header(cookies: &HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = cookies.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join("; ")
}

/// `name=value; Path=/; HttpOnly` -> `(name, value)`.
fn parse_set_cookie(header: &str) -> Option<(String, String)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_string(), value.trim().to_string()))
}

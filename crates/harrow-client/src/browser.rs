use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    CookieParam, EnableParams, EventResponseReceived, Headers, ResourceType,
    SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::listeners::EventStream;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::{FutureExt, StreamExt};
use harrow_core::error::AppError;
use harrow_core::response::{BackendKind, RawResponse, Response};
use harrow_core::traits::{Backend, FetchRequest, Interactive};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::settings::BrowserSettings;

/// Chromium driven over the DevTools protocol.
///
/// One browser process and one persistent page, shared by every clone. The
/// page sits behind an async mutex, so calls are serialised and the backend
/// reports that it cannot serve parallel pool workers. Each proxy gets its
/// own browser context, recreated when the host rotates to another proxy.
#[derive(Clone)]
pub struct BrowserBackend {
    inner: Arc<BrowserInner>,
}

struct BrowserInner {
    browser: Browser,
    settings: BrowserSettings,
    session: Mutex<Session>,
    handler: JoinHandle<()>,
}

impl Drop for BrowserInner {
    fn drop(&mut self) {
        self.handler.abort();
    }
}

#[derive(Default)]
struct Session {
    page: Option<Page>,
    context: Option<BrowserContextId>,
    proxy: Option<String>,
    user_agent: Option<String>,
    responses: Option<EventStream<EventResponseReceived>>,
    status: u16,
}

impl BrowserBackend {
    /// Launches Chromium with `settings`.
    pub async fn launch(settings: BrowserSettings) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder().no_sandbox().disable_default_args();

        if let Some(bin) = settings.chrome_executable.clone().or_else(find_chrome_binary) {
            tracing::info!("Using Chrome binary: {}", bin.display());
            builder = builder.chrome_executable(bin);
        }
        if settings.headless {
            builder = builder.arg("--headless=new");
        } else {
            builder = builder.with_head();
        }

        let config = builder
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--no-first-run")
            .build()
            .map_err(|e| AppError::Config(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| AppError::Config(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            inner: Arc::new(BrowserInner {
                browser,
                settings,
                session: Mutex::new(Session::default()),
                handler,
            }),
        })
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.inner.settings
    }

    /// Closes the page and its browser context.
    pub async fn close(&self) {
        let mut session = self.inner.session.lock().await;
        self.reset(&mut session).await;
    }

    async fn reset(&self, session: &mut Session) {
        if let Some(page) = session.page.take() {
            if let Err(e) = page.close().await {
                tracing::debug!("Failed to close page: {e}");
            }
        }
        if let Some(context) = session.context.take() {
            if let Err(e) = self
                .inner
                .browser
                .execute(DisposeBrowserContextParams::new(context))
                .await
            {
                tracing::debug!("Failed to dispose browser context: {e}");
            }
        }
        session.responses = None;
        session.user_agent = None;
    }

    /// Returns the live page, opening a new one when there is none or the
    /// proxy changed.
    async fn page_for(&self, session: &mut Session, proxy: &Option<String>) -> Result<Page, AppError> {
        if let Some(page) = &session.page {
            if session.proxy == *proxy {
                return Ok(page.clone());
            }
        }
        self.reset(session).await;

        let browser = &self.inner.browser;
        let mut target = CreateTargetParams::new("about:blank");
        if let Some(proxy) = proxy {
            let params = CreateBrowserContextParams::builder()
                .proxy_server(proxy.clone())
                .build();
            let context = browser
                .execute(params)
                .await
                .map_err(|e| AppError::Transport(format!("Failed to create browser context: {e}")))?
                .result
                .browser_context_id;
            target.browser_context_id = Some(context.clone());
            session.context = Some(context);
        }

        let page = browser
            .new_page(target)
            .await
            .map_err(|e| AppError::Transport(format!("Failed to open page: {e}")))?;
        page.execute(EnableParams::default())
            .await
            .map_err(|e| AppError::Transport(format!("Failed to enable network events: {e}")))?;
        let responses = page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to listen for responses: {e}")))?;

        tracing::debug!(proxy = proxy.as_deref().unwrap_or("direct"), "Opened browser page");
        session.page = Some(page.clone());
        session.proxy = proxy.clone();
        session.responses = Some(responses);
        Ok(page)
    }

    async fn prepare(&self, session: &mut Session, request: &FetchRequest) -> Result<Page, AppError> {
        let page = self.page_for(session, &request.proxy).await?;

        if session.user_agent.as_deref() != Some(request.user_agent.as_str()) {
            page.set_user_agent(SetUserAgentOverrideParams::new(request.user_agent.clone()))
                .await
                .map_err(|e| AppError::Transport(format!("Failed to set user agent: {e}")))?;
            session.user_agent = Some(request.user_agent.clone());
        }

        if !request.headers.is_empty() {
            let headers = serde_json::to_value(&request.headers)?;
            page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
                .await
                .map_err(|e| AppError::Transport(format!("Failed to set headers: {e}")))?;
        }

        if !request.cookies.is_empty() {
            let cookies = request
                .cookies
                .iter()
                .map(|(name, value)| {
                    let mut cookie = CookieParam::new(name.clone(), value.clone());
                    cookie.url = Some(request.url.clone());
                    cookie
                })
                .collect::<Vec<_>>();
            page.set_cookies(cookies)
                .await
                .map_err(|e| AppError::Transport(format!("Failed to set cookies: {e}")))?;
        }

        Ok(page)
    }

    /// Polls until the document is complete and `wait_for` (if any) is present.
    async fn wait_loaded(&self, page: &Page, wait_for: Option<&str>) -> Result<(), AppError> {
        let settings = &self.inner.settings;
        for _ in 0..settings.load_retries.max(1) {
            let complete = page
                .evaluate("document.readyState")
                .await
                .ok()
                .and_then(|r| r.into_value::<String>().ok())
                .is_some_and(|state| state == "complete");
            let located = match wait_for {
                Some(locator) => page.find_element(locator).await.is_ok(),
                None => true,
            };
            if complete && located {
                return Ok(());
            }
            tokio::time::sleep(settings.post_load_wait()).await;
        }

        let url = page.url().await.ok().flatten().unwrap_or_default();
        Err(AppError::PageLoadFailed(match wait_for {
            Some(locator) => format!("{url} never showed {locator}"),
            None => format!("{url} never finished loading"),
        }))
    }

    /// Builds a response from the page, picking up the status of the last
    /// document response seen since the previous call.
    async fn compose(&self, session: &mut Session) -> Result<RawResponse, AppError> {
        let page = session
            .page
            .clone()
            .ok_or_else(|| AppError::Generic("No page is open".into()))?;

        if let Some(events) = session.responses.as_mut() {
            while let Some(Some(event)) = events.next().now_or_never() {
                if event.r#type == ResourceType::Document {
                    session.status = u16::try_from(event.response.status).unwrap_or(0);
                }
            }
        }

        let body = page
            .content()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to read page content: {e}")))?;
        let url = page.url().await.ok().flatten().unwrap_or_default();
        let cookies = page
            .get_cookies()
            .await
            .map(|cookies| cookies.into_iter().map(|c| (c.name, c.value)).collect())
            .unwrap_or_default();

        Ok(RawResponse {
            status: std::mem::take(&mut session.status),
            body,
            headers: HashMap::new(),
            cookies,
            url,
            backend: BackendKind::Browser,
        })
    }
}

impl Backend for BrowserBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Browser
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, AppError> {
        let mut session = self.inner.session.lock().await;
        let page = self.prepare(&mut session, request).await?;

        match tokio::time::timeout(request.timeout, page.goto(&request.url)).await {
            Err(_) => return Err(AppError::Timeout(request.timeout)),
            Ok(Err(e)) => {
                return Err(AppError::Transport(format!(
                    "Failed to navigate to {}: {e}",
                    request.url
                )));
            }
            Ok(Ok(_)) => {}
        }

        self.wait_loaded(&page, request.wait_for.as_deref()).await?;
        self.compose(&mut session).await
    }

    fn supports_parallel(&self) -> bool {
        false
    }

    /// In a visible browser, gives a human `captcha_wait` to clear the
    /// challenge, then re-reads the page.
    async fn solve_captcha(&self, response: Response) -> Result<Response, AppError> {
        let settings = &self.inner.settings;
        if settings.headless {
            return Ok(response);
        }

        tracing::warn!(
            url = response.url(),
            wait_secs = settings.captcha_wait,
            "Captcha detected, solve it in the browser window"
        );
        tokio::time::sleep(settings.captcha_wait()).await;

        let raw = self.compose_response().await?;
        Ok(Response::new(raw, Arc::clone(response.captcha_signatures())))
    }
}

impl Interactive for BrowserBackend {
    async fn click(&self, locator: &str, request: &FetchRequest) -> Result<RawResponse, AppError> {
        let mut session = self.inner.session.lock().await;
        let page = session
            .page
            .clone()
            .ok_or_else(|| AppError::Generic("No page is open to click on".into()))?;

        let element = page
            .find_element(locator)
            .await
            .map_err(|e| AppError::PageLoadFailed(format!("No element at {locator}: {e}")))?;
        element
            .click()
            .await
            .map_err(|e| AppError::Transport(format!("Failed to click {locator}: {e}")))?;

        self.wait_loaded(&page, request.wait_for.as_deref()).await?;
        self.compose(&mut session).await
    }

    async fn wait_for(&self, locator: &str, timeout: Duration) -> Result<bool, AppError> {
        let page = {
            let session = self.inner.session.lock().await;
            session.page.clone()
        };
        let Some(page) = page else {
            return Ok(false);
        };

        let poll = self.inner.settings.post_load_wait().max(Duration::from_millis(50));
        let found = tokio::time::timeout(timeout, async {
            while page.find_element(locator).await.is_err() {
                tokio::time::sleep(poll).await;
            }
        })
        .await;
        Ok(found.is_ok())
    }

    async fn current_url(&self) -> Option<String> {
        let page = self.inner.session.lock().await.page.clone()?;
        page.url().await.ok().flatten()
    }

    async fn compose_response(&self) -> Result<RawResponse, AppError> {
        let mut session = self.inner.session.lock().await;
        self.compose(&mut session).await
    }
}

/// Tries to locate the real Chrome/Chromium binary.
///
/// Snap-packaged Chromium exposes a wrapper that drops unknown flags, so the
/// binary inside the snap is preferred. `CHROME_BIN` overrides everything.
fn find_chrome_binary() -> Option<PathBuf> {
    let candidates: &[&str] = &[
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

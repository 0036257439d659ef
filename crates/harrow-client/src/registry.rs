use harrow_core::error::AppError;
use harrow_core::registry::SessionCache;
#[cfg(feature = "browser")]
use harrow_core::registry::SessionSlot;

use crate::ClientBackend;
#[cfg(feature = "browser")]
use crate::browser::BrowserBackend;
use crate::http::HttpBackend;
#[cfg(feature = "browser")]
use crate::settings::BrowserSettings;
use crate::settings::{BackendSettings, HttpSettings};

/// Live backend instances, passed to whoever builds scrapers.
///
/// HTTP backends are shared per settings value. There is at most one browser,
/// and asking for it with different settings while it is live fails.
#[derive(Default)]
pub struct ClientRegistry {
    http: SessionCache<HttpSettings, HttpBackend>,
    #[cfg(feature = "browser")]
    browser: SessionSlot<BrowserSettings, BrowserBackend>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn http(&self, settings: &HttpSettings) -> Result<HttpBackend, AppError> {
        self.http
            .get_or_create(settings, |settings| Ok(HttpBackend::new(settings.clone())))
    }

    #[cfg(feature = "browser")]
    pub async fn browser(&self, settings: &BrowserSettings) -> Result<BrowserBackend, AppError> {
        self.browser
            .get_or_create(settings, BrowserBackend::launch)
            .await
    }

    /// Resolves harvest-file backend settings into a backend.
    pub async fn backend(&self, settings: &BackendSettings) -> Result<ClientBackend, AppError> {
        match settings {
            BackendSettings::Http(http) => Ok(ClientBackend::Http(self.http(http)?)),
            #[cfg(feature = "browser")]
            BackendSettings::Browser(browser) => {
                Ok(ClientBackend::Browser(self.browser(browser).await?))
            }
            #[cfg(not(feature = "browser"))]
            BackendSettings::Browser(_) => Err(AppError::Config(
                "This build has no browser support; rebuild with the `browser` feature".into(),
            )),
        }
    }

    /// Shuts the browser down, if one is live.
    pub async fn release_browser(&self) {
        #[cfg(feature = "browser")]
        if let Some(browser) = self.browser.release().await {
            browser.close().await;
            tracing::debug!("Browser session released");
        }
    }
}

#[cfg(feature = "browser")]
pub mod browser;
pub mod http;
pub mod registry;
pub mod settings;

use harrow_core::error::AppError;
use harrow_core::response::{BackendKind, RawResponse, Response};
use harrow_core::traits::{Backend, FetchRequest};

#[cfg(feature = "browser")]
pub use browser::BrowserBackend;
pub use http::HttpBackend;
pub use registry::ClientRegistry;
pub use settings::{BackendSettings, BrowserSettings, HttpSettings};

/// The backends a source can run on, chosen when the harvest is built.
#[derive(Clone)]
pub enum ClientBackend {
    Http(HttpBackend),
    #[cfg(feature = "browser")]
    Browser(BrowserBackend),
}

impl Backend for ClientBackend {
    fn kind(&self) -> BackendKind {
        match self {
            ClientBackend::Http(backend) => backend.kind(),
            #[cfg(feature = "browser")]
            ClientBackend::Browser(backend) => backend.kind(),
        }
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, AppError> {
        match self {
            ClientBackend::Http(backend) => backend.fetch(request).await,
            #[cfg(feature = "browser")]
            ClientBackend::Browser(backend) => backend.fetch(request).await,
        }
    }

    fn supports_parallel(&self) -> bool {
        match self {
            ClientBackend::Http(backend) => backend.supports_parallel(),
            #[cfg(feature = "browser")]
            ClientBackend::Browser(backend) => backend.supports_parallel(),
        }
    }

    async fn solve_captcha(&self, response: Response) -> Result<Response, AppError> {
        match self {
            ClientBackend::Http(backend) => backend.solve_captcha(response).await,
            #[cfg(feature = "browser")]
            ClientBackend::Browser(backend) => backend.solve_captcha(response).await,
        }
    }
}

//! Ties routing, scraping and extraction together.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::field::FieldMap;
use crate::pool::{Pool, PoolConfig};
use crate::source::SourceRouter;
use crate::traits::Backend;

/// Outcome of one URL in a batch.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct UrlReport {
    pub url: String,
    pub fields: FieldMap,
    /// Set when the URL failed; `fields` is then empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UrlReport {
    fn from_result(url: String, result: Result<FieldMap, AppError>) -> Self {
        match result {
            Ok(fields) => Self {
                url,
                fields,
                error: None,
            },
            Err(err) => Self {
                url,
                fields: FieldMap::new(),
                error: Some(err.to_string()),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Routes URLs to sources and extracts their fields, one URL or many.
pub struct Harvester<B> {
    router: Arc<SourceRouter<B>>,
    pool: PoolConfig,
    cancel: CancellationToken,
}

impl<B: Backend + 'static> Harvester<B> {
    /// Fails when a source's backend cannot be shared and the pool would run
    /// it from several workers.
    pub fn new(router: SourceRouter<B>, pool: PoolConfig) -> Result<Self, AppError> {
        if pool.effective_workers() > 1 {
            if let Some(source) = router
                .sources()
                .iter()
                .find(|s| !s.scraper().backend().supports_parallel())
            {
                return Err(AppError::Config(format!(
                    "Source {:?} uses a {} backend, which cannot run with {} workers",
                    source.name(),
                    source.scraper().backend().kind(),
                    pool.effective_workers()
                )));
            }
        }

        Ok(Self {
            router: Arc::new(router),
            pool,
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn router(&self) -> &SourceRouter<B> {
        &self.router
    }

    /// Scrapes one URL with the most specific matching source.
    pub async fn scrape(&self, url: &str) -> Result<FieldMap, AppError> {
        scrape_with(&self.router, url).await
    }

    /// Calls the endpoint source `name`, filling its template with `params`.
    pub async fn call_endpoint(
        &self,
        name: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<FieldMap, AppError> {
        let source = self
            .router
            .get(name)
            .ok_or_else(|| AppError::Config(format!("No source named {name:?}")))?;
        let url = source.endpoint_url(params)?;

        tracing::info!(source = name, url = %url, "Calling endpoint");
        let response = source.scraper().get(&url).await?;
        Ok(source.fields().extract(&response))
    }

    /// Scrapes every URL on the pool.
    ///
    /// A failing URL yields a report carrying the error. The batch only
    /// fails as a whole on a stopping error (interruption, or any error when
    /// the pool raises on error). Reports come back in input order.
    pub async fn scrape_many(&self, urls: Vec<String>) -> Result<Vec<UrlReport>, AppError> {
        let mut pool = Pool::new(self.pool.clone()).with_cancel_token(self.cancel.clone());
        for url in &urls {
            let router = Arc::clone(&self.router);
            let url = url.clone();
            pool.submit(move || async move { scrape_with(&router, &url).await });
        }

        tracing::info!(urls = urls.len(), workers = self.pool.effective_workers(), "Harvesting");
        let mut outputs = pool.run_all().await?;
        outputs.sort_by_key(|output| output.index);

        let reports: Vec<UrlReport> = outputs
            .into_iter()
            .map(|output| UrlReport::from_result(urls[output.index].clone(), output.result))
            .collect();

        let failed = reports.iter().filter(|r| !r.is_ok()).count();
        tracing::info!(done = reports.len(), failed, "Harvest finished");
        Ok(reports)
    }
}

async fn scrape_with<B: Backend>(
    router: &SourceRouter<B>,
    url: &str,
) -> Result<FieldMap, AppError> {
    let source = router.resolve(url)?;
    tracing::debug!(url, source = source.name(), "Resolved source");
    let response = source.scraper().get(url).await?;
    Ok(source.fields().extract(&response))
}

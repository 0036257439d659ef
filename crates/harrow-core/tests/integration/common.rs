use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use harrow_core::{
    AppError, Backend, BackendKind, FetchRequest, FieldConfig, HostRegistry, HostsConfig,
    RawResponse, Scraper, ScraperConfig,
};

type Handler = dyn Fn(&FetchRequest) -> Result<RawResponse, AppError> + Send + Sync;

/// Backend answering through a closure, recording every request.
#[derive(Clone)]
pub struct ScriptedBackend {
    handler: Arc<Handler>,
    requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl ScriptedBackend {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&FetchRequest) -> Result<RawResponse, AppError> + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Backend for ScriptedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawResponse, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.handler)(request)
    }
}

pub fn page(request: &FetchRequest, status: u16, body: &str) -> RawResponse {
    RawResponse {
        status,
        body: body.to_string(),
        headers: HashMap::new(),
        cookies: HashMap::new(),
        url: request.url.clone(),
        backend: BackendKind::Http,
    }
}

pub fn hosts(proxies: &[&str]) -> Arc<HostRegistry> {
    Arc::new(HostRegistry::new(&HostsConfig {
        proxies: proxies.iter().map(|p| p.to_string()).collect(),
        user_agents: vec!["harrow-test".into()],
        evict_unused: true,
    }))
}

pub fn scraper(backend: ScriptedBackend, hosts: Arc<HostRegistry>) -> Scraper<ScriptedBackend> {
    Scraper::new(
        backend,
        hosts,
        ScraperConfig {
            request_retry_interval: 0.0,
            captcha_signatures: vec!["cf-challenge".into()],
            ..Default::default()
        },
    )
}

pub fn fields(entries: &[(&str, FieldConfig)]) -> BTreeMap<String, FieldConfig> {
    entries
        .iter()
        .map(|(name, config)| (name.to_string(), config.clone()))
        .collect()
}

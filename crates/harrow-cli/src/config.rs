use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use harrow_client::{BackendSettings, ClientBackend, ClientRegistry};
use harrow_core::{
    FieldConfig, Harvester, HostRegistry, HostsConfig, PoolConfig, Scraper, ScraperConfig, Source,
    SourceRouter,
};

/// A harvest file: pool, hosts and the sources to route URLs to.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HarvestFile {
    pub pool: PoolConfig,
    pub hosts: HostsConfig,

    /// Extra proxies, as plain lines or a JSON object of typed lists.
    /// Relative paths resolve against the harvest file's directory.
    pub proxy_file: Option<PathBuf>,

    /// Keeps only proxy lists whose key starts with this prefix.
    pub proxy_type: Option<String>,

    /// Extra user agents, one per line.
    pub user_agents_file: Option<PathBuf>,

    pub sources: Vec<SourceConfig>,
}

/// One source. Exactly one of `patterns` and `endpoint` is set.
#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    pub name: String,

    #[serde(default)]
    pub patterns: Vec<String>,

    /// URL template such as `https://api.example.com/items/{id}`.
    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default)]
    pub backend: BackendSettings,

    #[serde(default)]
    pub scraper: ScraperConfig,

    #[serde(default)]
    pub fields: BTreeMap<String, FieldConfig>,
}

impl HarvestFile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read harvest file: {}", path.display()))?;
        let mut file: HarvestFile = serde_json::from_str(&text)
            .with_context(|| format!("Invalid harvest file: {}", path.display()))?;

        let base = path.parent().unwrap_or(Path::new("."));
        for extra in [&mut file.proxy_file, &mut file.user_agents_file]
            .into_iter()
            .flatten()
        {
            if extra.is_relative() {
                *extra = base.join(&*extra);
            }
        }
        Ok(file)
    }

    /// Inline hosts plus whatever the proxy and user agent files add.
    pub fn hosts_config(&self) -> HostsConfig {
        let mut config = self.hosts.clone();
        if let Some(path) = &self.proxy_file {
            config
                .proxies
                .extend(load_proxies(path, self.proxy_type.as_deref()));
        }
        if let Some(path) = &self.user_agents_file {
            config.user_agents.extend(load_user_agents(path));
        }
        config
    }

    /// Builds one scraper per source over a shared host ring and routes them.
    pub async fn build_router(
        &self,
        registry: &ClientRegistry,
    ) -> Result<SourceRouter<ClientBackend>> {
        if self.sources.is_empty() {
            anyhow::bail!("Harvest file defines no sources");
        }

        let hosts = Arc::new(HostRegistry::new(&self.hosts_config()));
        tracing::info!(hosts = hosts.len(), sources = self.sources.len(), "Building sources");

        let mut router = SourceRouter::new();
        for config in &self.sources {
            let backend = registry
                .backend(&config.backend)
                .await
                .with_context(|| format!("Failed to start backend for source {:?}", config.name))?;
            let scraper = Scraper::new(backend, Arc::clone(&hosts), config.scraper.clone());

            let source = match (&config.endpoint, config.patterns.is_empty()) {
                (Some(template), true) => {
                    Source::endpoint(&config.name, template, scraper, &config.fields)?
                }
                (None, _) => Source::html(&config.name, &config.patterns, scraper, &config.fields)?,
                (Some(_), false) => anyhow::bail!(
                    "Source {:?} sets both patterns and an endpoint",
                    config.name
                ),
            };
            router.register(source)?;
        }
        Ok(router)
    }

    pub async fn build_harvester(
        &self,
        registry: &ClientRegistry,
    ) -> Result<Harvester<ClientBackend>> {
        let router = self.build_router(registry).await?;
        Ok(Harvester::new(router, self.pool.clone())?)
    }
}

/// Reads a proxy file. Any failure logs and yields no proxies.
///
/// Plain text holds one proxy per line. A JSON object maps proxy types to
/// lists; `proxy_type` keeps the keys starting with it, `all` or `None`
/// keeps every list.
pub fn load_proxies(path: &Path, proxy_type: Option<&str>) -> Vec<String> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(path = %path.display(), "Could not read proxy file: {e}");
            return Vec::new();
        }
    };

    if !text.trim_start().starts_with('{') {
        return lines(&text);
    }

    let lists: BTreeMap<String, Vec<String>> = match serde_json::from_str(&text) {
        Ok(lists) => lists,
        Err(e) => {
            tracing::error!(path = %path.display(), "Malformed proxy file: {e}");
            return Vec::new();
        }
    };

    let prefix = proxy_type.filter(|t| *t != "all");
    let proxies: Vec<String> = lists
        .into_iter()
        .filter(|(kind, _)| prefix.is_none_or(|p| kind.starts_with(p)))
        .flat_map(|(_, list)| list)
        .collect();

    if proxies.is_empty() {
        tracing::warn!(
            path = %path.display(),
            proxy_type = proxy_type.unwrap_or("all"),
            "Proxy file has no matching proxies"
        );
    }
    proxies
}

/// Reads one user agent per line. Any failure logs and yields none.
pub fn load_user_agents(path: &Path) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => lines(&text),
        Err(e) => {
            tracing::error!(path = %path.display(), "Could not read user agent file: {e}");
            Vec::new()
        }
    }
}

fn lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::{NamedTempFile, TempDir};

    use super::*;

    fn temp_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn plain_proxy_file_skips_blanks_and_comments() {
        let file = temp_file("http://10.0.0.1:3128\n\n# spare\n  http://10.0.0.2:3128  \n");
        assert_eq!(
            load_proxies(file.path(), None),
            vec!["http://10.0.0.1:3128", "http://10.0.0.2:3128"]
        );
    }

    #[test]
    fn json_proxy_file_filters_by_type_prefix() {
        let file = temp_file(
            r#"{
                "http_dc": ["http://1.1.1.1:80"],
                "http_res": ["http://2.2.2.2:80"],
                "socks5": ["socks5://3.3.3.3:1080"]
            }"#,
        );

        assert_eq!(
            load_proxies(file.path(), Some("http")),
            vec!["http://1.1.1.1:80", "http://2.2.2.2:80"]
        );
        assert_eq!(load_proxies(file.path(), Some("socks")), vec!["socks5://3.3.3.3:1080"]);
        assert_eq!(load_proxies(file.path(), Some("all")).len(), 3);
        assert_eq!(load_proxies(file.path(), None).len(), 3);
        assert!(load_proxies(file.path(), Some("ftp")).is_empty());
    }

    #[test]
    fn broken_proxy_files_degrade_to_no_proxies() {
        let malformed = temp_file(r#"{"http": ["unterminated""#);
        assert!(load_proxies(malformed.path(), None).is_empty());

        let dir = TempDir::new().unwrap();
        assert!(load_proxies(&dir.path().join("missing.txt"), None).is_empty());
    }

    #[test]
    fn harvest_file_resolves_relative_paths_and_merges_hosts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("proxies.txt"), "http://10.0.0.1:3128\n").unwrap();
        std::fs::write(dir.path().join("agents.txt"), "agent-a\nagent-b\n").unwrap();
        let path = dir.path().join("harvest.json");
        std::fs::write(
            &path,
            r#"{
                "pool": {"num_workers": 2},
                "hosts": {"proxies": ["http://10.0.0.9:3128"]},
                "proxy_file": "proxies.txt",
                "user_agents_file": "agents.txt",
                "sources": [{"name": "all", "patterns": ["*"]}]
            }"#,
        )
        .unwrap();

        let file = HarvestFile::load(&path).unwrap();
        assert_eq!(file.pool.num_workers, 2);
        assert_eq!(file.pool.log_step, 10);
        assert_eq!(file.proxy_file, Some(dir.path().join("proxies.txt")));

        let hosts = file.hosts_config();
        assert_eq!(hosts.proxies, vec!["http://10.0.0.9:3128", "http://10.0.0.1:3128"]);
        assert_eq!(hosts.user_agents, vec!["agent-a", "agent-b"]);
        // direct + 2 proxies, times 2 agents
        assert_eq!(HostRegistry::new(&hosts).len(), 6);
    }

    #[test]
    fn invalid_harvest_file_is_reported() {
        let file = temp_file(r#"{"sources": "nope"}"#);
        let err = HarvestFile::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("Invalid harvest file"));
    }

    #[tokio::test]
    async fn router_is_built_from_sources() {
        let file: HarvestFile = serde_json::from_str(
            r#"{
                "sources": [
                    {"name": "catch-all", "patterns": ["*"], "fields": {"title": "title::text"}},
                    {"name": "products", "patterns": ["example\\.com/p/"]},
                    {
                        "name": "api",
                        "endpoint": "https://api.example.com/items/{id}",
                        "fields": {"name": "item&&name"}
                    }
                ]
            }"#,
        )
        .unwrap();

        let registry = ClientRegistry::new();
        let router = file.build_router(&registry).await.unwrap();

        assert_eq!(router.len(), 3);
        assert_eq!(router.resolve("https://example.com/p/1").unwrap().name(), "products");
        assert_eq!(router.resolve("https://other.org/").unwrap().name(), "catch-all");
        assert_eq!(
            router.resolve("https://api.example.com/items/7").unwrap().name(),
            "api"
        );

        let params = BTreeMap::from([("id".to_string(), "7".to_string())]);
        assert_eq!(
            router.get("api").unwrap().endpoint_url(&params).unwrap(),
            "https://api.example.com/items/7"
        );
    }

    #[tokio::test]
    async fn conflicting_or_missing_sources_are_rejected() {
        let registry = ClientRegistry::new();

        let both: HarvestFile = serde_json::from_str(
            r#"{"sources": [{"name": "x", "patterns": ["a"], "endpoint": "https://a/{id}"}]}"#,
        )
        .unwrap();
        assert!(both.build_router(&registry).await.is_err());

        let none = HarvestFile::default();
        assert!(none.build_router(&registry).await.is_err());

        let duplicate: HarvestFile = serde_json::from_str(
            r#"{"sources": [
                {"name": "x", "patterns": ["a"]},
                {"name": "x", "patterns": ["b"]}
            ]}"#,
        )
        .unwrap();
        assert!(duplicate.build_router(&registry).await.is_err());
    }
}

//! Proxy/user-agent identities and their rotation.
//!
//! Hosts are the cartesian product of `[direct] + proxies` and user agents,
//! kept in a ring. Rotating away from a host that never served a request
//! evicts it, so dead proxies drop out of the cycle instead of being retried
//! forever.

use std::fmt;
use std::sync::{Mutex, MutexGuard};

/// User agent used when none are configured.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0 Safari/537.36";

/// One proxy + user-agent identity.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Host {
    pub id: usize,
    /// `None` is the direct (no proxy) sentinel.
    pub proxy: Option<String>,
    pub user_agent: String,
    /// Successful requests since the host was last rotated in.
    pub use_count: u64,
    /// Times the registry rotated away from this host.
    pub rotation_count: u64,
}

impl Host {
    /// The proxy as a URL, adding `http://` to bare `ip:port` entries.
    pub fn proxy_url(&self) -> Option<String> {
        self.proxy.as_ref().map(|p| {
            if p.contains("://") {
                p.clone()
            } else {
                format!("http://{p}")
            }
        })
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let agent: String = self.user_agent.chars().take(20).collect();
        match &self.proxy {
            Some(proxy) => write!(f, "{proxy} - {agent}..."),
            None => write!(f, "localhost - {agent}..."),
        }
    }
}

/// Host configuration, handed to the core as plain data.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct HostsConfig {
    pub proxies: Vec<String>,
    pub user_agents: Vec<String>,
    /// Drop hosts that never served a request when rotating away from them.
    pub evict_unused: bool,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            proxies: Vec::new(),
            user_agents: Vec::new(),
            evict_unused: true,
        }
    }
}

#[derive(Debug)]
struct HostRing {
    hosts: Vec<Host>,
    cursor: usize,
}

impl HostRing {
    fn current(&self) -> &Host {
        &self.hosts[self.cursor]
    }
}

/// Thread-safe ring of hosts with a rotation cursor.
#[derive(Debug)]
pub struct HostRegistry {
    ring: Mutex<HostRing>,
    evict_unused: bool,
}

impl HostRegistry {
    /// Builds the ring. Never fails: with no user agents the default one is
    /// used, and the direct host is always first.
    pub fn new(config: &HostsConfig) -> Self {
        let mut proxies: Vec<Option<String>> = vec![None];
        proxies.extend(
            config
                .proxies
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty() && *p != "localhost")
                .map(|p| Some(p.to_string())),
        );

        let user_agents: Vec<String> = if config.user_agents.is_empty() {
            vec![DEFAULT_USER_AGENT.to_string()]
        } else {
            config.user_agents.clone()
        };

        let mut hosts = Vec::with_capacity(proxies.len() * user_agents.len());
        for proxy in &proxies {
            for user_agent in &user_agents {
                hosts.push(Host {
                    id: hosts.len(),
                    proxy: proxy.clone(),
                    user_agent: user_agent.clone(),
                    use_count: 0,
                    rotation_count: 0,
                });
            }
        }

        tracing::debug!(hosts = hosts.len(), "Host registry built");

        Self {
            ring: Mutex::new(HostRing { hosts, cursor: 0 }),
            evict_unused: config.evict_unused,
        }
    }

    /// A single direct host with the default user agent.
    pub fn direct() -> Self {
        Self::new(&HostsConfig::default())
    }

    /// Acquires the ring lock, recovering from poison if necessary.
    fn lock_ring(&self) -> MutexGuard<'_, HostRing> {
        self.ring.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned host registry mutex");
            poisoned.into_inner()
        })
    }

    /// The active host, without advancing.
    pub fn current(&self) -> Host {
        self.lock_ring().current().clone()
    }

    /// Advances to the next host and returns it.
    pub fn rotate(&self) -> Host {
        let mut ring = self.lock_ring();
        self.advance(&mut ring)
    }

    /// Rotates only if `id` is still the active host.
    ///
    /// Workers that saw the same host fail concurrently rotate once between
    /// them instead of skipping healthy hosts.
    pub fn rotate_from(&self, id: usize) -> Host {
        let mut ring = self.lock_ring();
        if ring.current().id != id {
            return ring.current().clone();
        }
        self.advance(&mut ring)
    }

    /// Counts a successful request against host `id`.
    pub fn record_use(&self, id: usize) {
        let mut ring = self.lock_ring();
        if let Some(host) = ring.hosts.iter_mut().find(|h| h.id == id) {
            host.use_count += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.lock_ring().hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the ring in rotation order.
    pub fn hosts(&self) -> Vec<Host> {
        self.lock_ring().hosts.clone()
    }

    fn advance(&self, ring: &mut HostRing) -> Host {
        let cursor = ring.cursor;
        let evict =
            ring.hosts[cursor].use_count == 0 && self.evict_unused && ring.hosts.len() > 1;

        if evict {
            let evicted = ring.hosts.remove(cursor);
            tracing::info!(host = %evicted, "Evicting host that never served a request");
            // The next host slid into `cursor`.
            if ring.cursor >= ring.hosts.len() {
                ring.cursor = 0;
            }
        } else {
            let outgoing = &mut ring.hosts[cursor];
            outgoing.use_count = 0;
            outgoing.rotation_count += 1;
            ring.cursor = (cursor + 1) % ring.hosts.len();
        }

        let next = ring.current().clone();
        tracing::info!(host = %next, "Rotated host");
        next
    }
}

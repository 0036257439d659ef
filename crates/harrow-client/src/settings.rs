use std::path::PathBuf;
use std::time::Duration;

/// HTTP client settings. Backends built with equal settings share clients.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Follow redirects up to this many hops. 0 disables redirects.
    pub max_redirects: usize,

    /// Seconds allowed for establishing a connection.
    pub connect_timeout: f64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            connect_timeout: 10.0,
        }
    }
}

impl HttpSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.connect_timeout).unwrap_or(Duration::from_secs(10))
    }
}

/// Headless browser settings.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct BrowserSettings {
    pub headless: bool,

    /// Polls of the page state before giving up on a load.
    pub load_retries: u32,

    /// Seconds between load polls.
    pub post_load_wait: f64,

    /// Seconds a human gets to clear a captcha in a visible browser.
    pub captcha_wait: f64,

    /// Chrome binary; looked up in well-known locations when unset.
    pub chrome_executable: Option<PathBuf>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            load_retries: 10,
            post_load_wait: 0.5,
            captcha_wait: 60.0,
            chrome_executable: None,
        }
    }
}

impl BrowserSettings {
    pub fn post_load_wait(&self) -> Duration {
        Duration::try_from_secs_f64(self.post_load_wait).unwrap_or(Duration::ZERO)
    }

    pub fn captcha_wait(&self) -> Duration {
        Duration::try_from_secs_f64(self.captcha_wait).unwrap_or(Duration::ZERO)
    }
}

/// Which backend a source runs on, as written in a harvest file.
#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSettings {
    Http(HttpSettings),
    Browser(BrowserSettings),
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings::Http(HttpSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_settings_are_tagged_by_kind() {
        let http: BackendSettings =
            serde_json::from_str(r#"{"kind": "http", "max_redirects": 0}"#).unwrap();
        assert_eq!(
            http,
            BackendSettings::Http(HttpSettings {
                max_redirects: 0,
                ..Default::default()
            })
        );

        let browser: BackendSettings =
            serde_json::from_str(r#"{"kind": "browser", "headless": false}"#).unwrap();
        match browser {
            BackendSettings::Browser(settings) => {
                assert!(!settings.headless);
                assert_eq!(settings.load_retries, 10);
                assert_eq!(settings.post_load_wait(), Duration::from_millis(500));
            }
            other => panic!("expected browser settings, got {other:?}"),
        }

        assert!(serde_json::from_str::<BackendSettings>(r#"{"kind": "ftp"}"#).is_err());
    }
}

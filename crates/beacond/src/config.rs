use anyhow::Context;
use beacon_api_client::{Url, DEFAULT_TIMEOUT};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("base_url is not configured")]
    MissingBaseUrl,
    #[error("base_url {url:?} is invalid: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("base_url {0:?} must use the http or https scheme")]
    UnsupportedScheme(String),
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TrackingConfig {
    /// The tracking service. There is no default; without it
    /// nothing is rewritten and no events are sent.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Deadline for each delivery event dispatch. Accepts either
    /// a humantime string such as "5s", or a number of seconds.
    #[serde(
        default = "TrackingConfig::default_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,

    /// Maximum number of dispatches in flight; beyond this,
    /// events wait in the background until a slot frees up.
    #[serde(default = "TrackingConfig::default_max_in_flight")]
    pub max_in_flight: usize,

    /// Whether deferred outcomes are reported to the tracking service
    #[serde(default)]
    pub dispatch_deferred: bool,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: Self::default_timeout(),
            max_in_flight: Self::default_max_in_flight(),
            dispatch_deferred: false,
        }
    }
}

impl TrackingConfig {
    fn default_timeout() -> Duration {
        DEFAULT_TIMEOUT
    }

    fn default_max_in_flight() -> usize {
        128
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("parsing tracking configuration")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url.replace(base_url.to_string());
        self
    }

    /// Validate the base url, returning it in normalized form
    /// without a trailing `/` so that the tracking paths can be
    /// appended to it directly.
    pub fn tracking_base(&self) -> Result<String, ConfigError> {
        let raw = self
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or(ConfigError::MissingBaseUrl)?;

        let url = Url::parse(raw).map_err(|err| ConfigError::InvalidBaseUrl {
            url: raw.to_string(),
            reason: err.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(raw.to_string()));
        }
        if url.query().is_some() || url.fragment().is_some() {
            return Err(ConfigError::InvalidBaseUrl {
                url: raw.to_string(),
                reason: "a query string or fragment cannot be extended with a path".to_string(),
            });
        }

        Ok(url.as_str().trim_end_matches('/').to_string())
    }
}

fn deserialize_duration<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Seconds(u64),
        Text(String),
    }

    match Repr::deserialize(d)? {
        Repr::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Repr::Text(text) => humantime::parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_full() {
        let config = TrackingConfig::from_toml_str(
            r#"
base_url = "http://localhost:3000"
timeout = "1m 30s"
max_in_flight = 4
dispatch_deferred = true
"#,
        )
        .unwrap();
        k9::assert_equal!(
            config,
            TrackingConfig {
                base_url: Some("http://localhost:3000".to_string()),
                timeout: Duration::from_secs(90),
                max_in_flight: 4,
                dispatch_deferred: true,
            }
        );
    }

    #[test]
    fn parse_defaults() {
        let config = TrackingConfig::from_toml_str("").unwrap();
        k9::assert_equal!(config, TrackingConfig::default());
        k9::assert_equal!(config.timeout, Duration::from_secs(10));
        k9::assert_equal!(config.tracking_base(), Err(ConfigError::MissingBaseUrl));
    }

    #[test]
    fn example_config_parses() {
        let config =
            TrackingConfig::from_toml_str(include_str!("../beacond.example.toml")).unwrap();
        k9::assert_equal!(
            config.tracking_base(),
            Ok("http://localhost:3000".to_string())
        );
        k9::assert_equal!(config.max_in_flight, 128);
    }

    #[test]
    fn timeout_in_seconds() {
        let config = TrackingConfig::from_toml_str("timeout = 3").unwrap();
        k9::assert_equal!(config.timeout, Duration::from_secs(3));
    }

    #[test]
    fn unknown_fields_rejected() {
        assert!(TrackingConfig::from_toml_str("base_uri = \"http://x\"").is_err());
    }

    #[test]
    fn tracking_base_validation() {
        let check = |url: &str| TrackingConfig::default().with_base_url(url).tracking_base();

        k9::assert_equal!(
            check("http://localhost:3000"),
            Ok("http://localhost:3000".to_string())
        );
        k9::assert_equal!(
            check(" https://t.example.com/hooks/ "),
            Ok("https://t.example.com/hooks".to_string())
        );
        k9::assert_equal!(check("   "), Err(ConfigError::MissingBaseUrl));
        k9::assert_equal!(
            check("ftp://t.example.com"),
            Err(ConfigError::UnsupportedScheme("ftp://t.example.com".to_string()))
        );
        assert!(matches!(
            check("not a url"),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
        assert!(matches!(
            check("http://t.example.com/?a=b"),
            Err(ConfigError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "base_url = \"http://127.0.0.1:8080\"").unwrap();
        let config = TrackingConfig::load(file.path()).unwrap();
        k9::assert_equal!(config.base_url.as_deref(), Some("http://127.0.0.1:8080"));

        let err = TrackingConfig::load(Path::new("/nonexistent/beacond.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/beacond.toml"));
    }
}

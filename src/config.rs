use std::env;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use tokio::fs;

use crate::process::RetryPolicy;
use crate::request::ProxyConfig;
use crate::rotation::{RotationConfig, RotationPolicy};
use crate::{Error, Result, DEFAULT_BASE_URL};

/// Scraper configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Origin of the StockX site (default: https://stockx.com)
    pub base_url: String,
    /// Proxy the client starts with; empty means a direct connection
    pub proxy: ProxyConfig,
    /// Pool the rotator selects from
    pub proxies: Vec<ProxyConfig>,
    pub rotation: RotationConfig,
    /// Retry policy for single item lookups
    pub retry: RetryPolicy,
    /// Per request timeout
    pub timeout: Duration,
    pub market: MarketConfig,
}

/// Locale and market parameters embedded in every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketConfig {
    pub category: String,
    pub currency: String,
    pub country: String,
    pub market: String,
    /// Sent as `accept-language`, lowercased in referer paths
    pub locale: String,
    /// Sent in the locale cookies
    pub language: String,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            category: "sneakers".into(),
            currency: "EUR".into(),
            country: "FR".into(),
            market: "FR".into(),
            locale: "fr-FR".into(),
            language: "fr".into(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            proxy: ProxyConfig::default(),
            proxies: Vec::new(),
            rotation: RotationConfig::default(),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
            market: MarketConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub async fn from_env() -> Result<Self> {
        let proxy = match env::var("STOCKX_PROXY") {
            Ok(url) if !url.trim().is_empty() => ProxyConfig::from_url(url.trim()),
            _ => ProxyConfig::default(),
        };
        let proxies = match env::var("STOCKX_PROXIES_FILE") {
            Ok(path) if !path.trim().is_empty() => load_proxies(path.trim()).await?,
            _ => Vec::new(),
        };

        Ok(Config {
            base_url: get_env_or("STOCKX_BASE_URL", DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            proxy,
            proxies,
            rotation: RotationConfig {
                enabled: parse_env("STOCKX_ROTATION", "false")?,
                random_enabled: parse_env("STOCKX_RANDOM_ROTATION", "true")?,
                rand_rate: parse_env("STOCKX_ROTATION_RATE", "0.15")?,
                policy: RotationPolicy::parse(&get_env_or("STOCKX_ROTATION_POLICY", "random")),
            },
            retry: RetryPolicy {
                max_attempts: parse_env("STOCKX_MAX_ATTEMPTS", "2")?,
                delay: Duration::from_millis(parse_env("STOCKX_RETRY_DELAY_MS", "1000")?),
            },
            timeout: Duration::from_secs(parse_env("STOCKX_TIMEOUT_SECS", "30")?),
            market: MarketConfig::default(),
        })
    }
}

/// Reads a JSON array of proxy maps, e.g. `[{"all": "http://10.0.0.1:8080"}]`.
pub async fn load_proxies(path: impl AsRef<Path>) -> Result<Vec<ProxyConfig>> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path).await?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::Config(format!("{} is not a valid proxy list: {e}", path.display())))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: &str) -> Result<T> {
    let raw = get_env_or(key, default);
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} has an invalid value: {raw}")))
}

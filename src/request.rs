use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_LANGUAGE, COOKIE};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::{Config, MarketConfig};
use crate::{Error, Result};

/// Opaque description of an outbound proxy.
///
/// Nothing outside the transport looks inside. [`StockxClient`] reads the `all`,
/// `http` and `https` keys as proxy URLs and `username`/`password` as basic auth
/// credentials. An empty map is a direct connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProxyConfig(BTreeMap<String, String>);

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A proxy used for every scheme.
    pub fn from_url(url: impl Into<String>) -> Self {
        let mut proxy = Self::new();
        proxy.insert("all", url);
        proxy
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_direct(&self) -> bool {
        self.0.is_empty()
    }

    /// Converts the map into reqwest proxies. Unknown keys are ignored.
    fn to_reqwest(&self) -> Result<Vec<reqwest::Proxy>> {
        let credentials = self.get("username").map(|u| (u, self.get("password").unwrap_or("")));

        let mut proxies = Vec::new();
        for (key, url) in &self.0 {
            let proxy = match key.as_str() {
                "all" => reqwest::Proxy::all(url.as_str()),
                "http" => reqwest::Proxy::http(url.as_str()),
                "https" => reqwest::Proxy::https(url.as_str()),
                _ => continue,
            }
            .map_err(|e| Error::InvalidProxy(format!("{key}={url}: {e}")))?;

            proxies.push(match credentials {
                Some((username, password)) => proxy.basic_auth(username, password),
                None => proxy,
            });
        }
        Ok(proxies)
    }
}

impl FromIterator<(String, String)> for ProxyConfig {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_direct() {
            return write!(f, "direct");
        }
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            if key == "password" {
                write!(f, "{key}=***")?;
            } else {
                write!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

/// A GraphQL operation as posted to the gateway.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphqlRequest {
    pub operation_name: &'static str,
    pub query: &'static str,
    pub variables: Value,
}

/// Status and raw body of a finished HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: StatusCode,
    pub body: String,
}

impl Response {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    async fn read(res: reqwest::Response) -> Result<Self> {
        let status = res.status();
        let body = res.text().await?;
        Ok(Self { status, body })
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::OK
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == StatusCode::FORBIDDEN
    }

    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

/// The network side of the scraper.
#[async_trait]
pub trait Transport: Send {
    /// Posts a GraphQL operation.
    async fn query(&mut self, request: &GraphqlRequest, headers: &HeaderMap) -> Result<Response>;

    /// Lists the sales activity of a product.
    async fn product_activity(
        &mut self,
        product_id: &str,
        params: &[(&'static str, String)],
        headers: &HeaderMap,
    ) -> Result<Response>;

    /// Routes every following request through `proxy`.
    fn set_proxy(&mut self, proxy: &ProxyConfig) -> Result<()>;
}

/// [`Transport`] over a `reqwest::Client` talking to the real site.
pub struct StockxClient {
    http: Client,
    base_url: String,
    timeout: Duration,
    market: MarketConfig,
    proxy: ProxyConfig,
}

impl StockxClient {
    pub fn new(
        base_url: impl Into<String>,
        market: MarketConfig,
        proxy: ProxyConfig,
        timeout: Duration,
    ) -> Result<Self> {
        let http = build_http(&market, &proxy, timeout)?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            timeout,
            market,
            proxy,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.base_url.clone(),
            config.market.clone(),
            config.proxy.clone(),
            config.timeout,
        )
    }

    pub fn proxy(&self) -> &ProxyConfig {
        &self.proxy
    }

    fn graphql_url(&self) -> String {
        format!("{}/api/p/e", self.base_url)
    }

    fn activity_url(&self, product_id: &str) -> String {
        format!("{}/api/products/{product_id}/activity", self.base_url)
    }
}

#[async_trait]
impl Transport for StockxClient {
    async fn query(&mut self, request: &GraphqlRequest, headers: &HeaderMap) -> Result<Response> {
        debug!(operation = request.operation_name, "posting graphql query");
        let res = self
            .http
            .post(self.graphql_url())
            .headers(headers.clone())
            .json(request)
            .send()
            .await?;
        Response::read(res).await
    }

    async fn product_activity(
        &mut self,
        product_id: &str,
        params: &[(&'static str, String)],
        headers: &HeaderMap,
    ) -> Result<Response> {
        debug!(product_id, "requesting product activity");
        let res = self
            .http
            .get(self.activity_url(product_id))
            .query(params)
            .headers(headers.clone())
            .send()
            .await?;
        Response::read(res).await
    }

    fn set_proxy(&mut self, proxy: &ProxyConfig) -> Result<()> {
        // reqwest fixes proxies at build time, so swap in a fresh client.
        self.http = build_http(&self.market, proxy, self.timeout)?;
        self.proxy = proxy.clone();
        Ok(())
    }
}

/// Locale headers and cookies sent with every request.
fn default_headers(market: &MarketConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_str(&market.locale)?);
    headers.insert(
        HeaderName::from_static("selected-country"),
        HeaderValue::from_str(&market.country)?,
    );
    let cookies = format!(
        "language_code={lang}; stockx_selected_locale={lang}; stockx_selected_region={country}",
        lang = market.language,
        country = market.country,
    );
    headers.insert(COOKIE, HeaderValue::from_str(&cookies)?);
    Ok(headers)
}

fn build_http(market: &MarketConfig, proxy: &ProxyConfig, timeout: Duration) -> Result<Client> {
    let mut builder = Client::builder()
        .default_headers(default_headers(market)?)
        .timeout(timeout);
    for p in proxy.to_reqwest()? {
        builder = builder.proxy(p);
    }
    Ok(builder.build()?)
}

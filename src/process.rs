use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::Local;
use rand::rngs::StdRng;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, REFERER};
use serde_json::{json, Value};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::config::{Config, MarketConfig};
use crate::parse::{self, Edge};
use crate::queries;
use crate::request::{GraphqlRequest, ProxyConfig, Response, StockxClient, Transport};
use crate::rotation::ProxyRotator;
use crate::{info_time, Error, Result, DEFAULT_BASE_URL, START_PAGE};

/// Which side of the order book a query targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Bid,
    Ask,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bid => "BID",
            Self::Ask => "ASK",
        }
    }
}

impl FromStr for TransactionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "BID" => Ok(Self::Bid),
            "ASK" => Ok(Self::Ask),
            other => Err(Error::InvalidTransactionType(other.to_string())),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded retry for the single item lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Wait before the first retry, doubled on every following one
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Wait after the failed attempt number `attempt` (1 based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.delay.saturating_mul(1 << exp)
    }
}

/// How a paginated fetch ended.
#[derive(Debug)]
pub enum FetchStatus {
    /// A page came back empty
    Exhausted,
    /// The configured stop page was reached
    PageCeiling,
    /// The request itself failed, or a 200 body had no result list
    Failed(Error),
    /// Non 200 status other than 403
    HttpStatus(Response),
    /// 403. Proxies were rotated before returning, unless applying the new one failed.
    RateLimited(Response),
    /// Rejected before any request was sent
    InvalidArgument(String),
}

/// Items accumulated by a paginated fetch, in page order.
#[derive(Debug)]
pub struct FetchOutcome {
    pub items: Vec<Edge>,
    /// Last page requested
    pub page: usize,
    pub status: FetchStatus,
}

impl FetchOutcome {
    fn new(items: Vec<Edge>, page: usize, status: FetchStatus) -> Self {
        Self {
            items,
            page,
            status,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, FetchStatus::Exhausted | FetchStatus::PageCeiling)
    }

    /// The response that stopped the fetch, if it stopped on a status code.
    pub fn response(&self) -> Option<&Response> {
        match &self.status {
            FetchStatus::HttpStatus(res) | FetchStatus::RateLimited(res) => Some(res),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProductsQuery {
    pub limit: usize,
    pub start_page: usize,
    /// Pagination stops once this page index is reached
    pub stop_page: Option<usize>,
    /// Use the query without per-variant market data
    pub light: bool,
    /// Accepted for compatibility. Pages are always fetched one after another.
    pub multi_threaded: bool,
}

impl Default for ProductsQuery {
    fn default() -> Self {
        Self {
            limit: 15,
            start_page: START_PAGE,
            stop_page: None,
            light: false,
            multi_threaded: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BidsAsksQuery {
    pub limit: usize,
    /// Price levels returned per product
    pub transaction_type_limit: usize,
    pub start_page: usize,
    pub stop_page: Option<usize>,
}

impl Default for BidsAsksQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            transaction_type_limit: 50,
            start_page: START_PAGE,
            stop_page: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriceLevelsQuery {
    /// Product id, or variant id when `is_variant` is set
    pub product_id: String,
    pub transaction_type: TransactionType,
    pub is_variant: bool,
    pub page: usize,
    pub limit: usize,
}

impl PriceLevelsQuery {
    pub fn new(product_id: impl Into<String>, transaction_type: TransactionType) -> Self {
        Self {
            product_id: product_id.into(),
            transaction_type,
            is_variant: false,
            page: START_PAGE,
            limit: 50,
        }
    }
}

/// One browse operation, re-sent with a new page index on every iteration.
struct BrowseRequest {
    label: &'static str,
    query: &'static str,
    variables: Value,
    limit: usize,
    headers: HeaderMap,
}

impl BrowseRequest {
    fn for_page(&mut self, page: usize) -> GraphqlRequest {
        self.variables["page"] = json!({ "index": page, "limit": self.limit });
        GraphqlRequest {
            operation_name: queries::BROWSE_OPERATION,
            query: self.query,
            variables: self.variables.clone(),
        }
    }
}

enum DetailRequest {
    Graphql {
        request: GraphqlRequest,
        headers: HeaderMap,
    },
    Activity {
        product_id: String,
        params: Vec<(&'static str, String)>,
        headers: HeaderMap,
    },
}

/// Drives the paginated browse queries and the detail lookups, rotating
/// proxies through its [`ProxyRotator`].
pub struct StockxScraper<T, R = StdRng> {
    client: T,
    rotator: ProxyRotator<R>,
    market: MarketConfig,
    retry: RetryPolicy,
}

impl StockxScraper<StockxClient> {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self::new(StockxClient::from_config(config)?, config))
    }
}

impl<T: Transport> StockxScraper<T> {
    pub fn new(client: T, config: &Config) -> Self {
        let rotator = ProxyRotator::new(config.proxies.clone(), config.rotation.clone());
        Self::with_rotator(client, rotator, config.market.clone(), config.retry.clone())
    }
}

impl<T: Transport, R: Rng> StockxScraper<T, R> {
    pub fn with_rotator(
        client: T,
        rotator: ProxyRotator<R>,
        market: MarketConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            rotator,
            market,
            retry,
        }
    }

    pub fn client(&self) -> &T {
        &self.client
    }

    pub fn rotator(&self) -> &ProxyRotator<R> {
        &self.rotator
    }

    /// Unconditional rotation, optionally to a given proxy or from a new pool.
    pub fn rotate_proxies(
        &mut self,
        proxy: Option<ProxyConfig>,
        pool: Option<Vec<ProxyConfig>>,
    ) -> Result<Option<ProxyConfig>> {
        self.rotator.rotate(&mut self.client, proxy, pool, false)
    }

    /// Browses the product catalog until an empty page.
    pub async fn fetch_products(&mut self, query: &ProductsQuery) -> FetchOutcome {
        if query.multi_threaded {
            debug!("multi_threaded is ignored, pages are fetched sequentially");
        }
        let mut request = BrowseRequest {
            label: "products",
            query: if query.light {
                queries::BROWSE_PRODUCTS_LIGHT
            } else {
                queries::BROWSE_PRODUCTS
            },
            variables: self.browse_variables(),
            limit: query.limit,
            headers: HeaderMap::new(),
        };
        self.paginate(&mut request, query.start_page, query.stop_page)
            .await
    }

    /// Browses products with one side of their order book.
    /// `transaction_type` must be `BID` or `ASK`; anything else returns
    /// without sending a request.
    pub async fn fetch_bids_asks(
        &mut self,
        transaction_type: &str,
        query: &BidsAsksQuery,
    ) -> FetchOutcome {
        let transaction_type = match transaction_type.parse::<TransactionType>() {
            Ok(t) => t,
            Err(e) => {
                warn!("Please provide valid transaction type: BID or ASK");
                return FetchOutcome::new(
                    Vec::new(),
                    query.start_page,
                    FetchStatus::InvalidArgument(e.to_string()),
                );
            }
        };

        let mut variables = self.browse_variables();
        variables["transactionType"] = json!(transaction_type.as_str());
        variables["limit"] = json!(query.transaction_type_limit);

        let mut request = BrowseRequest {
            label: "products bids asks",
            query: queries::BROWSE_BIDS_ASKS,
            variables,
            limit: query.limit,
            headers: legacy_price_levels_headers(),
        };
        self.paginate(&mut request, query.start_page, query.stop_page)
            .await
    }

    /// Order book levels of one product or variant. The raw response is returned,
    /// see [`parse::price_levels`].
    pub async fn fetch_product_price_levels(
        &mut self,
        query: &PriceLevelsQuery,
    ) -> Result<Response> {
        let request = GraphqlRequest {
            operation_name: queries::PRICE_LEVELS_OPERATION,
            query: queries::GET_PRODUCT_PRICE_LEVELS,
            variables: json!({
                "productId": query.product_id,
                "country": self.market.country,
                "currencyCode": self.market.currency,
                "transactionType": query.transaction_type.as_str(),
                "page": query.page,
                "limit": query.limit,
                "isVariant": query.is_variant,
            }),
        };
        let label = format!("price levels {}", query.product_id);
        self.fetch_detail(
            &label,
            DetailRequest::Graphql {
                request,
                headers: legacy_price_levels_headers(),
            },
        )
        .await
    }

    /// Latest sales of a product.
    pub async fn fetch_product_sales(
        &mut self,
        url_key: &str,
        product_id: &str,
        limit: usize,
    ) -> Result<Response> {
        let referer = format!(
            "{DEFAULT_BASE_URL}/{}/{url_key}",
            self.market.locale.to_lowercase()
        );
        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_str(&referer)?);

        let params = vec![
            ("limit", limit.to_string()),
            ("page", "1".to_string()),
            ("sort", "createdAt".to_string()),
            ("order", "DESC".to_string()),
            ("state", "480".to_string()),
            ("currency", self.market.currency.clone()),
            ("country", self.market.country.clone()),
        ];
        let label = format!("order {url_key}");
        self.fetch_detail(
            &label,
            DetailRequest::Activity {
                product_id: product_id.to_string(),
                params,
                headers,
            },
        )
        .await
    }

    fn browse_variables(&self) -> Value {
        let market = &self.market;
        json!({
            "category": market.category,
            "filters": [
                { "id": "browseVerticals", "selectedValues": [market.category] },
                { "id": "currency", "selectedValues": [market.currency] },
            ],
            "sort": { "id": "most-active", "order": "DESC" },
            "currency": market.currency,
            "country": market.country,
            "market": market.market,
        })
    }

    async fn paginate(
        &mut self,
        request: &mut BrowseRequest,
        start_page: usize,
        stop_page: Option<usize>,
    ) -> FetchOutcome {
        let start_time = Local::now();
        let outcome = self.paginate_pages(request, start_page, stop_page).await;
        info_time!(
            start_time,
            "Fetched {} {} up to page {} (success: {})",
            outcome.items.len(),
            request.label,
            outcome.page,
            outcome.is_success()
        );
        outcome
    }

    async fn paginate_pages(
        &mut self,
        request: &mut BrowseRequest,
        start_page: usize,
        stop_page: Option<usize>,
    ) -> FetchOutcome {
        let label = request.label;
        let mut items = Vec::new();
        let mut page = start_page;

        loop {
            info!("Fetching {label} page {page} ...");
            if let Err(e) = self.rotator.maybe_rotate(&mut self.client) {
                error!("Error {e} rotating proxies before {label} page {page}");
                return FetchOutcome::new(items, page, FetchStatus::Failed(e));
            }

            let gql = request.for_page(page);
            let res = match self.client.query(&gql, &request.headers).await {
                Ok(res) => res,
                Err(e) => {
                    error!("Error {e} fetching {label} page {page}");
                    return FetchOutcome::new(items, page, FetchStatus::Failed(e));
                }
            };

            if !res.is_ok() {
                warn!("Error {} fetching {label} page {page}", res.status);
                if res.is_rate_limited() {
                    if let Err(e) = self.rotator.rotate_now(&mut self.client) {
                        error!("Error {e} rotating proxies after {label} page {page}");
                    }
                    return FetchOutcome::new(items, page, FetchStatus::RateLimited(res));
                }
                return FetchOutcome::new(items, page, FetchStatus::HttpStatus(res));
            }

            let edges = match res.json().and_then(|body| parse::browse_edges(&body)) {
                Ok(edges) => edges,
                Err(e) => {
                    error!("Error {e} reading {label} page {page}");
                    return FetchOutcome::new(items, page, FetchStatus::Failed(e));
                }
            };
            if edges.is_empty() {
                return FetchOutcome::new(items, page, FetchStatus::Exhausted);
            }

            items.extend(edges);
            page += 1;
            if stop_page.is_some_and(|stop| page >= stop) {
                return FetchOutcome::new(items, page, FetchStatus::PageCeiling);
            }
        }
    }

    async fn send_detail(&mut self, request: &DetailRequest) -> Result<Response> {
        match request {
            DetailRequest::Graphql { request, headers } => {
                self.client.query(request, headers).await
            }
            DetailRequest::Activity {
                product_id,
                params,
                headers,
            } => {
                self.client
                    .product_activity(product_id, params, headers)
                    .await
            }
        }
    }

    /// Sends `request`, rotating and retrying on 403 until the retry policy
    /// runs out or a rotation fails. Other statuses are returned as they are.
    async fn fetch_detail(&mut self, label: &str, request: DetailRequest) -> Result<Response> {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let res = self.send_detail(&request).await?;
            if res.is_ok() {
                return Ok(res);
            }

            warn!(attempt, "Error {} fetching {label}", res.status);
            if !res.is_rate_limited() {
                return Ok(res);
            }

            if let Err(e) = self.rotator.rotate_now(&mut self.client) {
                error!("Error {e} rotating proxies after {label}");
                return Ok(res);
            }
            if attempt >= max_attempts {
                return Ok(res);
            }

            let delay = self.retry.delay_for(attempt);
            debug!(?delay, "Retrying {label}");
            sleep(delay).await;
            attempt += 1;
        }
    }
}

fn legacy_price_levels_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-user-legacy-price-levels"),
        HeaderValue::from_static("legacy"),
    );
    headers
}

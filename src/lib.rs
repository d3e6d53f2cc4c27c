//! STOCKX SCRAPER
//! Paginated browse, order book and sales lookups with proxy rotation on rate limits.

pub mod config;
mod error;
mod macros;
pub mod parse;
pub mod process;
pub mod queries;
pub mod request;
pub mod rotation;

pub use config::{Config, MarketConfig};
pub use error::{Error, Result};
pub use parse::{Edge, PriceLevel};
pub use process::{
    BidsAsksQuery, FetchOutcome, FetchStatus, PriceLevelsQuery, ProductsQuery, RetryPolicy,
    StockxScraper, TransactionType,
};
pub use request::{GraphqlRequest, ProxyConfig, Response, StockxClient, Transport};
pub use rotation::{ProxyRotator, RotationConfig, RotationPolicy};

/// Browse pages are 1 based.
pub const START_PAGE: usize = 1;
pub const DEFAULT_BASE_URL: &str = "https://stockx.com";

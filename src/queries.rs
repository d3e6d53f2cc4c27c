//! Static GraphQL documents. They are sent exactly as written.

pub const BROWSE_PRODUCTS: &str = include_str!("../queries/browse_products.graphql");
/// Same as [`BROWSE_PRODUCTS`] without the per-variant market data.
pub const BROWSE_PRODUCTS_LIGHT: &str = include_str!("../queries/browse_products_light.graphql");
pub const BROWSE_BIDS_ASKS: &str = include_str!("../queries/browse_bids_asks.graphql");
pub const GET_PRODUCT_PRICE_LEVELS: &str =
    include_str!("../queries/get_product_price_levels.graphql");

pub const BROWSE_OPERATION: &str = "Browse";
pub const PRICE_LEVELS_OPERATION: &str = "GetProductPriceLevels";

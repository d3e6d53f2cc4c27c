use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

const BROWSE_EDGES: &str = "/data/browse/results/edges";

/// One browse result, wrapped with its object identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default)]
    pub object_id: String,
    #[serde(default)]
    pub node: Value,
}

impl Edge {
    /// Order book levels of a bid/ask browse edge.
    pub fn price_levels(&self) -> Result<Vec<PriceLevel>> {
        levels_at(&self.node, "/market/priceLevels/edges")
    }
}

/// An aggregated order book bucket for one size variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceLevel {
    pub count: u64,
    pub own_count: u64,
    pub amount: f64,
    pub variant_id: Option<String>,
    pub size: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLevel {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    own_count: u64,
    #[serde(default)]
    amount: f64,
    #[serde(default)]
    variant: Option<RawVariant>,
}

#[derive(Deserialize)]
struct RawVariant {
    id: Option<String>,
    traits: Option<RawTraits>,
}

#[derive(Deserialize)]
struct RawTraits {
    size: Option<String>,
}

impl From<RawLevel> for PriceLevel {
    fn from(raw: RawLevel) -> Self {
        let (variant_id, size) = match raw.variant {
            Some(v) => (v.id, v.traits.and_then(|t| t.size)),
            None => (None, None),
        };
        Self {
            count: raw.count,
            own_count: raw.own_count,
            amount: raw.amount,
            variant_id,
            size,
        }
    }
}

/// Extracts `data.browse.results.edges` from a browse response body.
/// An empty list is the end of the pagination.
pub fn browse_edges(body: &Value) -> Result<Vec<Edge>> {
    let edges = body
        .pointer(BROWSE_EDGES)
        .ok_or_else(|| Error::MissingField(BROWSE_EDGES.into()))?;
    Ok(Vec::<Edge>::deserialize(edges)?)
}

/// Price levels of a `GetProductPriceLevels` response, for either a product or a variant lookup.
pub fn price_levels(body: &Value) -> Result<Vec<PriceLevel>> {
    let market = ["/data/product/market", "/data/variant/market"]
        .into_iter()
        .find_map(|p| body.pointer(p).filter(|m| !m.is_null()))
        .ok_or_else(|| Error::MissingField("/data/{product,variant}/market".into()))?;
    levels_at(market, "/priceLevels/edges")
}

fn levels_at(value: &Value, pointer: &str) -> Result<Vec<PriceLevel>> {
    let edges = value
        .pointer(pointer)
        .and_then(Value::as_array)
        .ok_or_else(|| Error::MissingField(pointer.into()))?;

    edges
        .iter()
        .filter_map(|edge| edge.get("node"))
        .map(|node| -> Result<PriceLevel> { Ok(RawLevel::deserialize(node)?.into()) })
        .collect()
}

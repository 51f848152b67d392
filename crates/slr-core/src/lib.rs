//! Core domain model and error taxonomy for SLR.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "slr-core";

/// Whether a listing offers to buy or to sell an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    Buy,
    Sell,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Buy => "buy",
            Intent::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Intent {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Intent::Buy),
            "sell" => Ok(Intent::Sell),
            other => Err(ReconcileError::StoreWrite(format!(
                "unknown intent `{other}` in stored row"
            ))),
        }
    }
}

/// Raw money payloads from the snapshot source are duck-typed JSON; this is
/// the only shape we accept. Unknown fields reject the whole payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCurrencies {
    keys: Option<f64>,
    metal: Option<f64>,
}

/// Validated money value: key count plus refined-metal amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Currencies {
    pub keys: f64,
    pub metal: f64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CurrencyError {
    #[error("currency payload missing")]
    Missing,
    #[error("currency payload has unexpected shape: {0}")]
    Shape(String),
    #[error("currency amounts must be finite and non-negative")]
    Amount,
    #[error("currency payload carries neither keys nor metal")]
    Empty,
}

impl Currencies {
    /// Validate a raw payload from the wire. Accepts an object carrying at
    /// least one of `keys`/`metal`, both finite and non-negative.
    pub fn parse(raw: Option<&JsonValue>) -> Result<Self, CurrencyError> {
        let raw = raw.ok_or(CurrencyError::Missing)?;
        let parsed: RawCurrencies = serde_json::from_value(raw.clone())
            .map_err(|err| CurrencyError::Shape(err.to_string()))?;
        if parsed.keys.is_none() && parsed.metal.is_none() {
            return Err(CurrencyError::Empty);
        }
        let keys = parsed.keys.unwrap_or(0.0);
        let metal = parsed.metal.unwrap_or(0.0);
        if !keys.is_finite() || !metal.is_finite() || keys < 0.0 || metal < 0.0 {
            return Err(CurrencyError::Amount);
        }
        Ok(Self { keys, metal })
    }
}

/// Composite identity of a listing: one stored row exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListingKey {
    pub steamid: String,
    pub name: String,
    pub sku: String,
    pub intent: Intent,
}

/// A reconciled buy/sell offer for one item by one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub name: String,
    pub sku: String,
    pub currencies: Currencies,
    pub intent: Intent,
    /// Unix seconds of the last accepted observation.
    pub updated: i64,
    pub steamid: String,
}

impl Listing {
    pub fn key(&self) -> ListingKey {
        ListingKey {
            steamid: self.steamid.clone(),
            name: self.name.clone(),
            sku: self.sku.clone(),
            intent: self.intent,
        }
    }
}

/// Pipeline error taxonomy. Catalog load failures are recovered in place;
/// the per-item kinds are logged and skip that item; init failures abort
/// the process before the first pass.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("catalog load failed: {0}")]
    CatalogLoad(String),
    #[error("no matching catalog entry for `{0}`")]
    NoMatchingCatalogEntry(String),
    #[error("snapshot source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("store write failed: {0}")]
    StoreWrite(String),
    #[error("source initialization failed: {0}")]
    SourceInit(String),
}

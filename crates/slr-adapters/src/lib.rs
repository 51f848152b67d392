//! External-source edge: snapshot client, item-name → SKU resolution, and
//! the record filter/normalizer that turns raw wire records into canonical
//! listings.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use slr_core::{Currencies, Intent, Listing, ListingKey, ReconcileError};
use tracing::trace;
use unicode_normalization::UnicodeNormalization;

pub const CRATE_NAME: &str = "slr-adapters";

/// Flat backoff subtracted from the batch timestamp, so a snapshot batch
/// never outranks a more recent real-time-sourced update unless it is
/// genuinely newer.
pub const SNAPSHOT_BACKOFF_SECS: i64 = 60;

/// One raw listing record as returned by the snapshot source.
#[derive(Debug, Clone, Deserialize)]
pub struct RawListing {
    pub steamid: String,
    pub intent: Intent,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub item: Option<RawItem>,
    /// Automated-agent marker. Presence is what matters; the payload itself
    /// is opaque to us.
    #[serde(default, rename = "userAgent")]
    pub user_agent: Option<JsonValue>,
    #[serde(default)]
    pub currencies: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawItem {
    #[serde(default)]
    pub attributes: Vec<RawAttribute>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAttribute {
    #[serde(default)]
    pub float_value: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
struct SnapshotResponse {
    /// Absent entirely when the source cannot resolve the item name;
    /// distinct from an empty list.
    #[serde(default)]
    listings: Option<Vec<RawListing>>,
}

/// Per-item snapshot fetch seam.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the current raw listings for one item name. An empty vec means
    /// the item legitimately has no active listings;
    /// [`ReconcileError::NoMatchingCatalogEntry`] means the source could not
    /// resolve the name at all.
    async fn fetch(&self, name: &str) -> Result<Vec<RawListing>, ReconcileError>;
}

#[derive(Debug, Clone)]
pub struct SnapshotClientConfig {
    pub base_url: String,
    pub token: String,
    pub appid: u32,
    pub timeout: Duration,
}

impl Default for SnapshotClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://backpack.tf/api/classifieds/listings/snapshot".to_string(),
            token: String::new(),
            appid: 440,
            timeout: Duration::from_secs(20),
        }
    }
}

/// HTTP client for the classifieds snapshot endpoint.
#[derive(Debug)]
pub struct BackpackSnapshotClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    appid: String,
}

impl BackpackSnapshotClient {
    pub fn new(config: SnapshotClientConfig) -> Result<Self, ReconcileError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .map_err(|err| ReconcileError::SourceInit(err.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url,
            token: config.token,
            appid: config.appid.to_string(),
        })
    }
}

#[async_trait]
impl SnapshotSource for BackpackSnapshotClient {
    async fn fetch(&self, name: &str) -> Result<Vec<RawListing>, ReconcileError> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[
                ("sku", name),
                ("appid", self.appid.as_str()),
                ("token", self.token.as_str()),
            ])
            .send()
            .await
            .map_err(|err| ReconcileError::SourceUnavailable(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ReconcileError::SourceUnavailable(format!(
                "http status {status} fetching snapshot for `{name}`"
            )));
        }

        let snapshot: SnapshotResponse = response
            .json()
            .await
            .map_err(|err| ReconcileError::SourceUnavailable(err.to_string()))?;

        snapshot
            .listings
            .ok_or_else(|| ReconcileError::NoMatchingCatalogEntry(name.to_string()))
    }
}

/// Item-name → SKU resolution seam. Catalog entries carry display names
/// only; the stable type identifier comes from here, per pass.
pub trait SkuResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

#[derive(Debug, Clone, Deserialize)]
struct SchemaDocument {
    items: Vec<SchemaItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct SchemaItem {
    name: String,
    sku: String,
}

/// [`SkuResolver`] backed by a schema document fetched once at startup.
/// A failed fetch is fatal by design: without the schema no item can be
/// reconciled, so the worker must not start.
#[derive(Debug)]
pub struct HttpSchemaResolver {
    by_name: HashMap<String, String>,
}

impl HttpSchemaResolver {
    pub async fn init(url: &str, timeout: Duration) -> Result<Self, ReconcileError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .build()
            .map_err(|err| ReconcileError::SourceInit(err.to_string()))?;

        let response = client
            .get(url)
            .send()
            .await
            .map_err(|err| ReconcileError::SourceInit(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ReconcileError::SourceInit(format!(
                "http status {status} fetching schema from {url}"
            )));
        }

        let document: SchemaDocument = response
            .json()
            .await
            .map_err(|err| ReconcileError::SourceInit(err.to_string()))?;
        if document.items.is_empty() {
            return Err(ReconcileError::SourceInit(
                "schema document lists no items".to_string(),
            ));
        }

        Ok(Self::from_entries(
            document.items.into_iter().map(|item| (item.name, item.sku)),
        ))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            by_name: entries.into_iter().collect(),
        }
    }
}

impl SkuResolver for HttpSchemaResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        self.by_name.get(name).cloned()
    }
}

/// Trust/policy rules applied to each raw record.
#[derive(Debug, Clone, Default)]
pub struct FilterRules {
    excluded_descriptions: Vec<String>,
    blocked_attributes: BTreeMap<String, f64>,
}

impl FilterRules {
    /// Excluded substrings are normalized once here so per-record matching
    /// compares like with like.
    pub fn new(
        excluded_descriptions: Vec<String>,
        blocked_attributes: BTreeMap<String, f64>,
    ) -> Self {
        Self {
            excluded_descriptions: excluded_descriptions
                .iter()
                .map(|phrase| normalize_description(phrase))
                .collect(),
            blocked_attributes,
        }
    }
}

/// Unicode compatibility-decompose, lowercase and trim free text, defeating
/// homoglyph/fullwidth spellings of excluded phrases.
pub fn normalize_description(text: &str) -> String {
    text.nfkd().collect::<String>().to_lowercase().trim().to_string()
}

fn is_trusted_agent(raw: &RawListing) -> bool {
    raw.user_agent.is_some()
}

fn has_excluded_description(raw: &RawListing, rules: &FilterRules) -> bool {
    let Some(details) = raw.details.as_deref() else {
        return false;
    };
    let normalized = normalize_description(details);
    rules
        .excluded_descriptions
        .iter()
        .any(|phrase| normalized.contains(phrase))
}

/// A record is attribute-blocked when some attribute's float value matches a
/// configured blocked value and none of the exemption keys appears in the
/// item name. Values are compared stringified, matching how the source
/// reports them.
fn has_blocked_attribute(name: &str, raw: &RawListing, rules: &FilterRules) -> bool {
    let Some(item) = raw.item.as_ref() else {
        return false;
    };
    let blocked_hit = item
        .attributes
        .iter()
        .filter_map(|attribute| attribute.float_value)
        .any(|value| {
            rules
                .blocked_attributes
                .values()
                .any(|blocked| value.to_string() == blocked.to_string())
        });
    if !blocked_hit {
        return false;
    }
    let exempted = rules
        .blocked_attributes
        .keys()
        .any(|key| name.contains(key.as_str()));
    !exempted
}

/// Filter, deduplicate and canonicalize one fetched batch for `name`/`sku`.
/// Every surviving record shares `updated = now - SNAPSHOT_BACKOFF_SECS`.
/// An empty result is not an error; the absent-payload case never reaches
/// this function.
pub fn normalize_batch(
    name: &str,
    sku: &str,
    raw: Vec<RawListing>,
    rules: &FilterRules,
    now: i64,
) -> Vec<Listing> {
    let updated = now - SNAPSHOT_BACKOFF_SECS;
    let mut seen: HashSet<ListingKey> = HashSet::new();
    let mut out = Vec::new();

    for record in raw {
        if !is_trusted_agent(&record) {
            trace!(item = name, steamid = %record.steamid, "dropped manual listing");
            continue;
        }
        if has_excluded_description(&record, rules) {
            trace!(item = name, steamid = %record.steamid, "dropped excluded description");
            continue;
        }
        if has_blocked_attribute(name, &record, rules) {
            trace!(item = name, steamid = %record.steamid, "dropped blocked attribute");
            continue;
        }
        let Ok(currencies) = Currencies::parse(record.currencies.as_ref()) else {
            trace!(item = name, steamid = %record.steamid, "dropped invalid currencies");
            continue;
        };

        let key = ListingKey {
            steamid: record.steamid.clone(),
            name: name.to_string(),
            sku: sku.to_string(),
            intent: record.intent,
        };
        // First occurrence wins: every record in one fetch shares the same
        // effective timestamp, so batch order decides.
        if !seen.insert(key) {
            continue;
        }

        out.push(Listing {
            name: name.to_string(),
            sku: sku.to_string(),
            currencies,
            intent: record.intent,
            updated,
            steamid: record.steamid,
        });
    }

    out
}

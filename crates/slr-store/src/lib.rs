//! Reconciliation store: recency-guarded bulk upserts, coverage counts and
//! staleness eviction over the `listings` table.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use slr_core::{Currencies, Listing, ListingKey, ReconcileError};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::debug;

pub const CRATE_NAME: &str = "slr-store";

/// Listings older than this are presumed delisted. Source-side refresh
/// ("bump") cadence is ~30 minutes for well-behaved agents; 35 minutes
/// leaves one grace cycle.
pub const STALE_AGE_SECS: i64 = 2100;

/// Coverage thresholds below which a fresh snapshot fetch is warranted.
pub const MIN_SELL_COVERAGE: i64 = 1;
pub const MIN_BUY_COVERAGE: i64 = 10;

/// Rows per bulk-insert statement, keeping bind counts well under the
/// Postgres protocol limit.
const UPSERT_CHUNK_ROWS: usize = 1000;

/// Stored listing counts for one item name, grouped by intent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntentCounts {
    pub buy: i64,
    pub sell: i64,
}

impl IntentCounts {
    /// True when the store already holds enough breadth for this item that
    /// an external fetch can be skipped this pass.
    pub fn is_sufficient(&self) -> bool {
        self.sell >= MIN_SELL_COVERAGE && self.buy >= MIN_BUY_COVERAGE
    }
}

/// Persistence seam for the reconciliation pipeline.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Bulk-write normalized listings. On key conflict the stored
    /// `currencies`/`updated` are replaced only when the incoming `updated`
    /// is strictly greater. Empty input is a no-op.
    async fn upsert(&self, listings: &[Listing]) -> Result<(), ReconcileError>;

    /// Per-intent stored counts for one item name.
    async fn coverage(&self, name: &str) -> Result<IntentCounts, ReconcileError>;

    /// Delete every row whose age relative to `now` is at least
    /// [`STALE_AGE_SECS`]; returns the number of rows removed.
    async fn reap(&self, now: i64) -> Result<u64, ReconcileError>;
}

/// Postgres-backed [`ListingStore`].
#[derive(Debug, Clone)]
pub struct PgListingStore {
    pool: PgPool,
}

impl PgListingStore {
    pub async fn connect(options: PgConnectOptions) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `listings` table if missing. The primary key doubles as
    /// the upsert conflict target.
    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS listings (
                name TEXT NOT NULL,
                sku TEXT NOT NULL,
                currencies TEXT NOT NULL,
                intent TEXT NOT NULL,
                updated BIGINT NOT NULL,
                steamid TEXT NOT NULL,
                PRIMARY KEY (name, sku, intent, steamid)
            )",
        )
        .execute(&self.pool)
        .await
        .context("creating listings table")?;
        Ok(())
    }
}

#[async_trait]
impl ListingStore for PgListingStore {
    async fn upsert(&self, listings: &[Listing]) -> Result<(), ReconcileError> {
        if listings.is_empty() {
            return Ok(());
        }

        for chunk in listings.chunks(UPSERT_CHUNK_ROWS) {
            let mut rows = Vec::with_capacity(chunk.len());
            for listing in chunk {
                let currencies = serde_json::to_string(&listing.currencies)
                    .map_err(|err| ReconcileError::StoreWrite(err.to_string()))?;
                rows.push((listing, currencies));
            }

            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO listings (name, sku, currencies, intent, updated, steamid) ",
            );
            builder.push_values(rows.iter(), |mut b, (listing, currencies)| {
                b.push_bind(&listing.name)
                    .push_bind(&listing.sku)
                    .push_bind(currencies.as_str())
                    .push_bind(listing.intent.as_str())
                    .push_bind(listing.updated)
                    .push_bind(&listing.steamid);
            });
            builder.push(
                " ON CONFLICT (name, sku, intent, steamid) DO UPDATE \
                 SET currencies = EXCLUDED.currencies, updated = EXCLUDED.updated \
                 WHERE listings.updated < EXCLUDED.updated",
            );

            builder
                .build()
                .execute(&self.pool)
                .await
                .map_err(|err| ReconcileError::StoreWrite(err.to_string()))?;
        }

        debug!(rows = listings.len(), "upserted listing batch");
        Ok(())
    }

    async fn coverage(&self, name: &str) -> Result<IntentCounts, ReconcileError> {
        let rows = sqlx::query(
            "SELECT intent, COUNT(*) AS n FROM listings WHERE name = $1 GROUP BY intent",
        )
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| ReconcileError::StoreWrite(err.to_string()))?;

        let mut counts = IntentCounts::default();
        for row in rows {
            let intent: String = row
                .try_get("intent")
                .map_err(|err| ReconcileError::StoreWrite(err.to_string()))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|err| ReconcileError::StoreWrite(err.to_string()))?;
            match intent.parse()? {
                slr_core::Intent::Buy => counts.buy = n,
                slr_core::Intent::Sell => counts.sell = n,
            }
        }
        Ok(counts)
    }

    async fn reap(&self, now: i64) -> Result<u64, ReconcileError> {
        let result = sqlx::query("DELETE FROM listings WHERE $1 - updated >= $2")
            .bind(now)
            .bind(STALE_AGE_SECS)
            .execute(&self.pool)
            .await
            .map_err(|err| ReconcileError::StoreWrite(err.to_string()))?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Clone)]
struct StoredRow {
    currencies: Currencies,
    updated: i64,
}

/// In-memory [`ListingStore`] with the same conflict semantics as the
/// Postgres store. Backs the pipeline tests and local dry runs.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    rows: Mutex<HashMap<ListingKey, StoredRow>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &ListingKey) -> Option<(Currencies, i64)> {
        self.rows
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .map(|row| (row.currencies, row.updated))
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn upsert(&self, listings: &[Listing]) -> Result<(), ReconcileError> {
        let mut rows = self.rows.lock().expect("store lock poisoned");
        for listing in listings {
            let incoming = StoredRow {
                currencies: listing.currencies,
                updated: listing.updated,
            };
            rows.entry(listing.key())
                .and_modify(|stored| {
                    if stored.updated < listing.updated {
                        *stored = incoming.clone();
                    }
                })
                .or_insert(incoming);
        }
        Ok(())
    }

    async fn coverage(&self, name: &str) -> Result<IntentCounts, ReconcileError> {
        let rows = self.rows.lock().expect("store lock poisoned");
        let mut counts = IntentCounts::default();
        for key in rows.keys().filter(|key| key.name == name) {
            match key.intent {
                slr_core::Intent::Buy => counts.buy += 1,
                slr_core::Intent::Sell => counts.sell += 1,
            }
        }
        Ok(counts)
    }

    async fn reap(&self, now: i64) -> Result<u64, ReconcileError> {
        let mut rows = self.rows.lock().expect("store lock poisoned");
        let before = rows.len();
        rows.retain(|_, row| now - row.updated < STALE_AGE_SECS);
        Ok((before - rows.len()) as u64)
    }
}

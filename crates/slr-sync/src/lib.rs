//! Pass orchestration: configuration, the hot-reloadable catalog, and the
//! sequential reconcile loop over the catalog's current name set.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::Utc;
use serde::Deserialize;
use slr_adapters::{
    normalize_batch, BackpackSnapshotClient, FilterRules, HttpSchemaResolver, SkuResolver,
    SnapshotClientConfig, SnapshotSource,
};
use slr_core::ReconcileError;
use slr_store::{ListingStore, PgListingStore};
use sqlx::postgres::PgConnectOptions;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "slr-sync";

/// How often the catalog file's mtime is checked for changes.
const CATALOG_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Credential sent to the snapshot source on every fetch.
    pub api_key: String,
    pub excluded_listing_descriptions: Vec<String>,
    /// Exemption-key → blocked attribute float value.
    pub blocked_attributes: BTreeMap<String, f64>,
    /// Force a snapshot fetch every pass, bypassing the coverage check.
    pub always_query_snapshot_api: bool,
    /// Minutes slept between passes.
    pub price_timeout_min: u64,
    pub catalog_path: PathBuf,
    pub snapshot_url: String,
    pub schema_url: String,
    pub http_timeout_secs: u64,
    pub database: DatabaseConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            excluded_listing_descriptions: Vec::new(),
            blocked_attributes: BTreeMap::new(),
            always_query_snapshot_api: false,
            price_timeout_min: 30,
            catalog_path: PathBuf::from("item_list.json"),
            snapshot_url: "https://backpack.tf/api/classifieds/listings/snapshot".to_string(),
            schema_url: "http://localhost:8080/schema/items".to_string(),
            http_timeout_secs: 20,
            database: DatabaseConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub schema: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            name: "slr".to_string(),
            user: "slr".to_string(),
            password: String::new(),
            schema: "public".to_string(),
        }
    }
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password)
            .options([("search_path", self.schema.as_str())])
    }
}

impl SyncConfig {
    pub fn config_path_from_env() -> PathBuf {
        std::env::var("SLR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.json"))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Secrets can be supplied via the environment instead of the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("SLR_API_KEY") {
            self.api_key = key;
        }
        if let Ok(password) = std::env::var("SLR_DB_PASSWORD") {
            self.database.password = password;
        }
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.price_timeout_min.max(1) * 60)
    }

    pub fn filter_rules(&self) -> FilterRules {
        FilterRules::new(
            self.excluded_listing_descriptions.clone(),
            self.blocked_attributes.clone(),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogFile {
    items: Vec<CatalogItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogItem {
    name: String,
}

/// The set of item names this worker tracks. Reload atomically replaces the
/// inner reference, so a pass that captured the previous `Arc` keeps
/// iterating an unchanged set.
#[derive(Debug)]
pub struct Catalog {
    path: PathBuf,
    names: RwLock<Arc<BTreeSet<String>>>,
}

impl Catalog {
    /// Open the catalog, loading the initial set. A failed initial load is
    /// recovered to an empty set (a later reload can still populate it).
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let names = match Self::read_names(&path).await {
            Ok(names) => names,
            Err(err) => {
                warn!(error = %err, "initial catalog load failed; starting empty");
                BTreeSet::new()
            }
        };
        Self {
            path,
            names: RwLock::new(Arc::new(names)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_names(&self) -> Arc<BTreeSet<String>> {
        self.names.read().expect("catalog lock poisoned").clone()
    }

    /// Re-read the catalog document. On failure the previous set is
    /// retained; this error kind never propagates.
    pub async fn reload(&self) {
        match Self::read_names(&self.path).await {
            Ok(names) => {
                let count = names.len();
                *self.names.write().expect("catalog lock poisoned") = Arc::new(names);
                info!(items = count, "catalog reloaded");
            }
            Err(err) => {
                warn!(error = %err, "catalog reload failed; retaining previous set");
            }
        }
    }

    async fn read_names(path: &Path) -> Result<BTreeSet<String>, ReconcileError> {
        let text = fs::read_to_string(path).await.map_err(|err| {
            ReconcileError::CatalogLoad(format!("reading {}: {err}", path.display()))
        })?;
        let file: CatalogFile = serde_json::from_str(&text).map_err(|err| {
            ReconcileError::CatalogLoad(format!("parsing {}: {err}", path.display()))
        })?;
        Ok(file.items.into_iter().map(|item| item.name).collect())
    }
}

/// Poll the catalog file's mtime and trigger a reload when it changes.
pub fn spawn_catalog_watcher(catalog: Arc<Catalog>, poll_interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_modified: Option<SystemTime> = None;
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match fs::metadata(catalog.path()).await {
                Ok(meta) => {
                    let modified = meta.modified().ok();
                    if last_modified.is_some() && modified != last_modified {
                        catalog.reload().await;
                    }
                    last_modified = modified;
                }
                Err(err) => {
                    debug!(path = %catalog.path().display(), error = %err, "catalog file not readable");
                }
            }
        }
    })
}

/// Ephemeral per-pass counters; reset at pass start, never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub total: usize,
    pub completed: usize,
    /// Items refreshed through the snapshot pipeline this pass.
    pub fetched: usize,
    /// Items served by existing store coverage, no external call made.
    pub skipped_coverage: usize,
    pub failed: usize,
}

impl PassStats {
    fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    pub fn remaining(&self) -> usize {
        self.total.saturating_sub(self.completed)
    }
}

/// Drives one sequential reconcile pass over the catalog. Items are
/// processed one at a time; every external call is a suspension point.
pub struct PassRunner {
    catalog: Arc<Catalog>,
    store: Arc<dyn ListingStore>,
    source: Arc<dyn SnapshotSource>,
    resolver: Arc<dyn SkuResolver>,
    rules: FilterRules,
    always_query: bool,
}

impl PassRunner {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Arc<dyn ListingStore>,
        source: Arc<dyn SnapshotSource>,
        resolver: Arc<dyn SkuResolver>,
        rules: FilterRules,
        always_query: bool,
    ) -> Self {
        Self {
            catalog,
            store,
            source,
            resolver,
            rules,
            always_query,
        }
    }

    /// Run one full pass. Per-item failures are logged and skipped so a
    /// single bad catalog entry cannot abort the rest of the pass.
    pub async fn run_pass(&self) -> PassStats {
        let names = self.catalog.current_names();
        let mut stats = PassStats::new(names.len());

        for name in names.iter() {
            if let Err(err) = self.process_item(name, &mut stats).await {
                stats.failed += 1;
                warn!(item = %name, error = %err, "item failed; continuing pass");
            }
            stats.completed += 1;
            debug!(
                completed = stats.completed,
                remaining = stats.remaining(),
                "pass progress"
            );
        }

        stats
    }

    async fn process_item(&self, name: &str, stats: &mut PassStats) -> Result<(), ReconcileError> {
        let now = Utc::now().timestamp();

        // Store-wide, so mostly redundant at this cadence, but it keeps the
        // eviction bound tight without a separate timer.
        let reaped = self.store.reap(now).await?;
        if reaped > 0 {
            debug!(reaped, "evicted stale listings");
        }

        let Some(sku) = self.resolver.resolve(name) else {
            return Err(ReconcileError::NoMatchingCatalogEntry(name.to_string()));
        };

        if !self.always_query && self.store.coverage(name).await?.is_sufficient() {
            stats.skipped_coverage += 1;
            debug!(item = name, "coverage sufficient; skipping fetch");
            return Ok(());
        }

        let raw = self.source.fetch(name).await?;
        let batch = normalize_batch(name, &sku, raw, &self.rules, now);
        self.store.upsert(&batch).await?;
        stats.fetched += 1;
        debug!(item = name, listings = batch.len(), "item reconciled");
        Ok(())
    }

    /// Pass loop: run, sleep the configured interval, repeat. Passes never
    /// overlap; the next one starts only after this one fully completes.
    pub async fn run_forever(&self, interval: Duration) {
        loop {
            let started = std::time::Instant::now();
            let stats = self.run_pass().await;
            info!(
                items = stats.total,
                fetched = stats.fetched,
                skipped = stats.skipped_coverage,
                failed = stats.failed,
                elapsed_secs = started.elapsed().as_secs(),
                "pass complete"
            );
            tokio::time::sleep(interval).await;
        }
    }
}

/// Fully wired worker: store, source, resolver and catalog built from one
/// [`SyncConfig`]. Resolver initialization failure is fatal here, before
/// any pass begins.
pub struct Worker {
    pub runner: PassRunner,
    pub interval: Duration,
    _watcher: JoinHandle<()>,
}

impl Worker {
    pub async fn init(config: SyncConfig) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(config.http_timeout_secs);

        let resolver = HttpSchemaResolver::init(&config.schema_url, timeout)
            .await
            .context("initializing sku resolver")?;

        let store = PgListingStore::connect(config.database.connect_options()).await?;
        store.ensure_schema().await?;

        let source = BackpackSnapshotClient::new(SnapshotClientConfig {
            base_url: config.snapshot_url.clone(),
            token: config.api_key.clone(),
            timeout,
            ..SnapshotClientConfig::default()
        })?;

        let catalog = Arc::new(Catalog::open(&config.catalog_path).await);
        let watcher = spawn_catalog_watcher(catalog.clone(), CATALOG_POLL_INTERVAL);

        let runner = PassRunner::new(
            catalog,
            Arc::new(store),
            Arc::new(source),
            Arc::new(resolver),
            config.filter_rules(),
            config.always_query_snapshot_api,
        );

        Ok(Self {
            runner,
            interval: config.pass_interval(),
            _watcher: watcher,
        })
    }

    pub async fn run(&self) {
        self.runner.run_forever(self.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use slr_core::{Currencies, Intent, Listing, ListingKey};
    use slr_store::MemoryListingStore;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn write_catalog(path: &Path, names: &[&str]) {
        let items: Vec<_> = names.iter().map(|n| json!({"name": n})).collect();
        std::fs::write(path, json!({"items": items}).to_string()).expect("write catalog");
    }

    async fn catalog_of(dir: &Path, names: &[&str]) -> Arc<Catalog> {
        let path = dir.join("item_list.json");
        write_catalog(&path, names);
        Arc::new(Catalog::open(path).await)
    }

    struct FakeSource {
        responses: HashMap<String, Result<Vec<slr_adapters::RawListing>, ReconcileError>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeSource {
        fn new() -> Self {
            Self {
                responses: HashMap::new(),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn with_listings(mut self, name: &str, listings: Vec<slr_adapters::RawListing>) -> Self {
            self.responses.insert(name.to_string(), Ok(listings));
            self
        }

        fn with_error(mut self, name: &str, err: ReconcileError) -> Self {
            self.responses.insert(name.to_string(), Err(err));
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl SnapshotSource for FakeSource {
        async fn fetch(&self, name: &str) -> Result<Vec<slr_adapters::RawListing>, ReconcileError> {
            self.calls.lock().expect("calls lock").push(name.to_string());
            match self.responses.get(name) {
                Some(Ok(listings)) => Ok(listings.clone()),
                Some(Err(err)) => Err(clone_err(err)),
                None => Err(ReconcileError::NoMatchingCatalogEntry(name.to_string())),
            }
        }
    }

    fn clone_err(err: &ReconcileError) -> ReconcileError {
        match err {
            ReconcileError::CatalogLoad(m) => ReconcileError::CatalogLoad(m.clone()),
            ReconcileError::NoMatchingCatalogEntry(m) => {
                ReconcileError::NoMatchingCatalogEntry(m.clone())
            }
            ReconcileError::SourceUnavailable(m) => ReconcileError::SourceUnavailable(m.clone()),
            ReconcileError::StoreWrite(m) => ReconcileError::StoreWrite(m.clone()),
            ReconcileError::SourceInit(m) => ReconcileError::SourceInit(m.clone()),
        }
    }

    fn resolver_for(names: &[&str]) -> Arc<HttpSchemaResolver> {
        Arc::new(HttpSchemaResolver::from_entries(
            names
                .iter()
                .enumerate()
                .map(|(i, n)| (n.to_string(), format!("{};6", 100 + i))),
        ))
    }

    fn raw_listing(steamid: &str, intent: &str) -> slr_adapters::RawListing {
        serde_json::from_value(json!({
            "steamid": steamid,
            "intent": intent,
            "userAgent": {"client": "bot"},
            "currencies": {"keys": 0, "metal": 5.33}
        }))
        .expect("raw listing")
    }

    fn seed_listing(name: &str, steamid: &str, intent: Intent, updated: i64) -> Listing {
        Listing {
            name: name.to_string(),
            sku: "100;6".to_string(),
            currencies: Currencies { keys: 0.0, metal: 1.0 },
            intent,
            updated,
            steamid: steamid.to_string(),
        }
    }

    #[tokio::test]
    async fn catalog_reload_failure_retains_previous_set() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("item_list.json");
        write_catalog(&path, &["Team Captain", "Tour of Duty Ticket"]);

        let catalog = Catalog::open(&path).await;
        assert_eq!(catalog.current_names().len(), 2);

        std::fs::write(&path, "{not json").expect("corrupt catalog");
        catalog.reload().await;
        assert_eq!(catalog.current_names().len(), 2);

        write_catalog(&path, &["Team Captain"]);
        catalog.reload().await;
        assert_eq!(catalog.current_names().len(), 1);
    }

    #[tokio::test]
    async fn pass_snapshot_is_immune_to_concurrent_reload() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("item_list.json");
        write_catalog(&path, &["Team Captain", "Tour of Duty Ticket"]);

        let catalog = Catalog::open(&path).await;
        let snapshot = catalog.current_names();

        write_catalog(&path, &["Rocket Launcher"]);
        catalog.reload().await;

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains("Team Captain"));
        assert!(catalog.current_names().contains("Rocket Launcher"));
    }

    #[tokio::test]
    async fn sufficient_coverage_skips_the_fetch() {
        let dir = tempdir().expect("tempdir");
        let catalog = catalog_of(dir.path(), &["Team Captain"]).await;
        let store = Arc::new(MemoryListingStore::new());
        let now = Utc::now().timestamp();

        let mut seed = vec![seed_listing("Team Captain", "S1", Intent::Sell, now)];
        for i in 0..10 {
            seed.push(seed_listing("Team Captain", &format!("B{i}"), Intent::Buy, now));
        }
        store.upsert(&seed).await.expect("seed");

        let source = Arc::new(FakeSource::new());
        let runner = PassRunner::new(
            catalog,
            store,
            source.clone(),
            resolver_for(&["Team Captain"]),
            FilterRules::default(),
            false,
        );

        let stats = runner.run_pass().await;
        assert!(source.calls().is_empty());
        assert_eq!(stats.skipped_coverage, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn full_refresh_mode_fetches_despite_coverage() {
        let dir = tempdir().expect("tempdir");
        let catalog = catalog_of(dir.path(), &["Team Captain"]).await;
        let store = Arc::new(MemoryListingStore::new());
        let now = Utc::now().timestamp();

        let mut seed = vec![seed_listing("Team Captain", "S1", Intent::Sell, now)];
        for i in 0..10 {
            seed.push(seed_listing("Team Captain", &format!("B{i}"), Intent::Buy, now));
        }
        store.upsert(&seed).await.expect("seed");

        let source =
            Arc::new(FakeSource::new().with_listings("Team Captain", vec![raw_listing("A", "sell")]));
        let runner = PassRunner::new(
            catalog,
            store,
            source.clone(),
            resolver_for(&["Team Captain"]),
            FilterRules::default(),
            true,
        );

        let stats = runner.run_pass().await;
        assert_eq!(source.calls(), vec!["Team Captain".to_string()]);
        assert_eq!(stats.fetched, 1);
        assert_eq!(stats.skipped_coverage, 0);
    }

    #[tokio::test]
    async fn one_failing_item_does_not_abort_the_pass() {
        let dir = tempdir().expect("tempdir");
        let catalog = catalog_of(dir.path(), &["Broken Item", "Team Captain"]).await;
        let store = Arc::new(MemoryListingStore::new());

        let source = Arc::new(
            FakeSource::new()
                .with_error(
                    "Broken Item",
                    ReconcileError::SourceUnavailable("connection refused".to_string()),
                )
                .with_listings("Team Captain", vec![raw_listing("A", "sell")]),
        );
        let runner = PassRunner::new(
            catalog,
            store.clone(),
            source,
            resolver_for(&["Broken Item", "Team Captain"]),
            FilterRules::default(),
            false,
        );

        let stats = runner.run_pass().await;
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.fetched, 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn unresolvable_name_fails_without_a_fetch() {
        let dir = tempdir().expect("tempdir");
        let catalog = catalog_of(dir.path(), &["Unknown Thing"]).await;
        let store = Arc::new(MemoryListingStore::new());
        let source = Arc::new(FakeSource::new());

        let runner = PassRunner::new(
            catalog,
            store,
            source.clone(),
            resolver_for(&[]),
            FilterRules::default(),
            false,
        );

        let stats = runner.run_pass().await;
        assert_eq!(stats.failed, 1);
        assert!(source.calls().is_empty());
    }

    #[tokio::test]
    async fn fetched_listings_land_in_the_store_with_backed_off_timestamp() {
        let dir = tempdir().expect("tempdir");
        let catalog = catalog_of(dir.path(), &["Team Captain"]).await;
        let store = Arc::new(MemoryListingStore::new());
        let source = Arc::new(FakeSource::new().with_listings(
            "Team Captain",
            vec![raw_listing("A", "sell"), raw_listing("B", "buy")],
        ));

        let before = Utc::now().timestamp();
        let runner = PassRunner::new(
            catalog,
            store.clone(),
            source,
            resolver_for(&["Team Captain"]),
            FilterRules::default(),
            false,
        );
        let stats = runner.run_pass().await;
        let after = Utc::now().timestamp();

        assert_eq!(stats.fetched, 1);
        assert_eq!(store.len(), 2);
        let key = ListingKey {
            steamid: "A".to_string(),
            name: "Team Captain".to_string(),
            sku: "100;6".to_string(),
            intent: Intent::Sell,
        };
        let (_, updated) = store.get(&key).expect("stored row");
        assert!(updated >= before - slr_adapters::SNAPSHOT_BACKOFF_SECS);
        assert!(updated <= after - slr_adapters::SNAPSHOT_BACKOFF_SECS);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"api_key": "abc", "price_timeout_min": 5}"#).expect("config");
        assert_eq!(config.api_key, "abc");
        assert_eq!(config.pass_interval(), Duration::from_secs(300));
        assert!(!config.always_query_snapshot_api);
        assert_eq!(config.database.port, 5432);
    }
}

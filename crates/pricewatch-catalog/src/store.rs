//! The canonical catalog: products, the append-only change log and the set of
//! imported artifacts, persisted as one JSON document replaced atomically.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use chrono::{DateTime, Utc};
use pricewatch_core::{CanonicalProduct, Observation, Platform, PlatformLink, PriceChange, PricePoint};
use pricewatch_storage::{read_json_opt, sha256_hex, write_json_atomic};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

use crate::detect::detect;
use crate::matcher::{CanonicalMatcher, MatchDecision};

pub const SCHEMA_VERSION: u32 = 1;

/// Temp files younger than this may belong to a commit still in progress.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog schema version {0} is newer than supported version {SCHEMA_VERSION}")]
    UnsupportedSchema(u32),
    #[error(transparent)]
    Persistence(#[from] anyhow::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub schema_version: u32,
    /// Bumped on every successful commit.
    pub version: u64,
    pub products: BTreeMap<String, CanonicalProduct>,
    pub price_changes: Vec<PriceChange>,
    #[serde(default)]
    pub imported_artifacts: BTreeSet<String>,
}

impl Default for CatalogDocument {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            version: 0,
            products: BTreeMap::new(),
            price_changes: Vec::new(),
            imported_artifacts: BTreeSet::new(),
        }
    }
}

/// Everything one observation does to the catalog, computed without touching it.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Same or older than what the link already holds.
    Replay { canonical_id: String },
    Create { product: CanonicalProduct },
    Update {
        product: CanonicalProduct,
        change: Option<PriceChange>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Created { canonical_id: String },
    Updated {
        canonical_id: String,
        change: Option<PriceChange>,
    },
    Replayed { canonical_id: String },
}

impl IngestOutcome {
    pub fn canonical_id(&self) -> &str {
        match self {
            IngestOutcome::Created { canonical_id }
            | IngestOutcome::Updated { canonical_id, .. }
            | IngestOutcome::Replayed { canonical_id } => canonical_id,
        }
    }

    pub fn change(&self) -> Option<&PriceChange> {
        match self {
            IngestOutcome::Updated { change, .. } => change.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub version: u64,
    pub total_products: usize,
    pub total_changes: usize,
    pub total_price_points: usize,
    /// Products with a link on each platform.
    pub platform_breakdown: BTreeMap<Platform, usize>,
}

/// In-memory catalog with its `(platform, url)` index.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    doc: CatalogDocument,
    url_index: HashMap<(Platform, String), String>,
}

impl Catalog {
    /// Rebuild the index and repair links that disagree with their history.
    /// Returns the catalog and the number of repairs made.
    pub fn from_document(mut doc: CatalogDocument) -> (Self, usize) {
        let mut repairs = 0;
        for product in doc.products.values_mut() {
            repairs += repair_links(product);
        }

        let mut url_index = HashMap::new();
        for product in doc.products.values() {
            for (platform, link) in &product.platform_links {
                let key = (*platform, link.url.clone());
                if let Some(existing) = url_index.get(&key) {
                    warn!(
                        platform = %platform,
                        url = %link.url,
                        kept = %existing,
                        ignored = %product.id,
                        "url linked from two products; keeping the first"
                    );
                    repairs += 1;
                    continue;
                }
                url_index.insert(key, product.id.clone());
            }
        }

        (Self { doc, url_index }, repairs)
    }

    pub fn document(&self) -> &CatalogDocument {
        &self.doc
    }

    pub fn version(&self) -> u64 {
        self.doc.version
    }

    pub fn products(&self) -> impl Iterator<Item = &CanonicalProduct> {
        self.doc.products.values()
    }

    pub fn get_product(&self, id: &str) -> Option<&CanonicalProduct> {
        self.doc.products.get(id)
    }

    pub fn lookup_url(&self, platform: Platform, url: &str) -> Option<&CanonicalProduct> {
        self.url_index
            .get(&(platform, url.to_string()))
            .and_then(|id| self.doc.products.get(id))
    }

    pub fn price_changes(&self) -> &[PriceChange] {
        &self.doc.price_changes
    }

    pub fn is_imported(&self, artifact_key: &str) -> bool {
        self.doc.imported_artifacts.contains(artifact_key)
    }

    pub fn mark_imported(&mut self, artifact_key: impl Into<String>) {
        self.doc.imported_artifacts.insert(artifact_key.into());
    }

    /// Decide what `observation` would change. The catalog is left untouched.
    pub fn stage(&self, observation: &Observation, matcher: &CanonicalMatcher) -> Mutation {
        match matcher.resolve(observation, self) {
            MatchDecision::Exact { canonical_id } | MatchDecision::Fuzzy { canonical_id, .. } => {
                match self.doc.products.get(&canonical_id) {
                    Some(product) => stage_update(product, observation),
                    None => self.stage_create(observation, matcher),
                }
            }
            MatchDecision::New => self.stage_create(observation, matcher),
        }
    }

    fn stage_create(&self, observation: &Observation, matcher: &CanonicalMatcher) -> Mutation {
        let id = canonical_id(&matcher.titles().normalize(&observation.title), observation);
        if let Some(existing) = self.doc.products.get(&id) {
            return stage_update(existing, observation);
        }
        Mutation::Create {
            product: CanonicalProduct {
                id,
                display_title: observation.title.clone(),
                platform_links: BTreeMap::from([(observation.platform, link_for(observation))]),
                price_history: vec![point_for(observation)],
                created_at: observation.observed_at,
                updated_at: observation.observed_at,
            },
        }
    }

    /// Apply a staged mutation. The product and its change land together.
    pub fn apply(&mut self, mutation: Mutation) -> IngestOutcome {
        match mutation {
            Mutation::Replay { canonical_id } => IngestOutcome::Replayed { canonical_id },
            Mutation::Create { product } => {
                let canonical_id = product.id.clone();
                self.put(product);
                IngestOutcome::Created { canonical_id }
            }
            Mutation::Update { product, change } => {
                let canonical_id = product.id.clone();
                self.put(product);
                if let Some(change) = &change {
                    self.doc.price_changes.push(change.clone());
                }
                IngestOutcome::Updated { canonical_id, change }
            }
        }
    }

    pub fn ingest(&mut self, observation: &Observation, matcher: &CanonicalMatcher) -> IngestOutcome {
        let mutation = self.stage(observation, matcher);
        self.apply(mutation)
    }

    fn put(&mut self, product: CanonicalProduct) {
        if let Some(previous) = self.doc.products.get(&product.id) {
            for (platform, link) in &previous.platform_links {
                let still_linked = product
                    .link(*platform)
                    .is_some_and(|current| current.url == link.url);
                if !still_linked {
                    self.url_index.remove(&(*platform, link.url.clone()));
                }
            }
        }
        for (platform, link) in &product.platform_links {
            self.url_index
                .insert((*platform, link.url.clone()), product.id.clone());
        }
        self.doc.products.insert(product.id.clone(), product);
    }

    pub fn get_stats(&self) -> CatalogStats {
        let mut platform_breakdown = BTreeMap::new();
        let mut total_price_points = 0;
        for product in self.doc.products.values() {
            total_price_points += product.price_history.len();
            for platform in product.platform_links.keys() {
                *platform_breakdown.entry(*platform).or_insert(0) += 1;
            }
        }
        CatalogStats {
            version: self.doc.version,
            total_products: self.doc.products.len(),
            total_changes: self.doc.price_changes.len(),
            total_price_points,
            platform_breakdown,
        }
    }

    /// Changes at or after `since` whose absolute move is at least `min_abs_pct`, newest first.
    pub fn get_price_changes(
        &self,
        since: Option<DateTime<Utc>>,
        min_abs_pct: Option<f64>,
    ) -> Vec<PriceChange> {
        let mut changes: Vec<PriceChange> = self
            .doc
            .price_changes
            .iter()
            .filter(|c| since.is_none_or(|since| c.detected_at >= since))
            .filter(|c| min_abs_pct.is_none_or(|min| c.pct_change.abs() >= min))
            .cloned()
            .collect();
        changes.reverse();
        changes.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        changes
    }
}

fn stage_update(product: &CanonicalProduct, observation: &Observation) -> Mutation {
    if let Some(link) = product.link(observation.platform) {
        if observation.observed_at <= link.latest_observed_at {
            return Mutation::Replay {
                canonical_id: product.id.clone(),
            };
        }
    }

    let change = detect(product.latest_price(observation.platform), observation, &product.id);
    let mut updated = product.clone();
    updated
        .platform_links
        .insert(observation.platform, link_for(observation));
    updated.price_history.push(point_for(observation));
    updated.updated_at = updated.updated_at.max(observation.observed_at);
    Mutation::Update {
        product: updated,
        change,
    }
}

fn link_for(observation: &Observation) -> PlatformLink {
    PlatformLink {
        url: observation.url.clone(),
        latest_price: observation.price,
        latest_observed_at: observation.observed_at,
    }
}

fn point_for(observation: &Observation) -> PricePoint {
    PricePoint {
        platform: observation.platform,
        price: observation.price,
        observed_at: observation.observed_at,
    }
}

/// First 16 hex chars of sha256 over normalized title, platform and url.
pub fn canonical_id(normalized_title: &str, observation: &Observation) -> String {
    let key = format!(
        "{normalized_title}\u{1f}{}\u{1f}{}",
        observation.platform, observation.url
    );
    sha256_hex(key.as_bytes())[..16].to_string()
}

fn repair_links(product: &mut CanonicalProduct) -> usize {
    let mut repairs = 0;
    let platforms: Vec<Platform> = product.platform_links.keys().copied().collect();
    for platform in platforms {
        let Some(point) = product.last_recorded(platform).cloned() else {
            continue;
        };
        let Some(link) = product.platform_links.get_mut(&platform) else {
            continue;
        };
        if link.latest_price != point.price || link.latest_observed_at != point.observed_at {
            warn!(
                canonical_id = %product.id,
                platform = %platform,
                link_price = link.latest_price,
                history_price = point.price,
                "repairing platform link from price history"
            );
            link.latest_price = point.price;
            link.latest_observed_at = point.observed_at;
            repairs += 1;
        }
    }
    repairs
}

/// File-backed catalog persistence.
#[derive(Debug, Clone)]
pub struct CatalogStore {
    path: PathBuf,
}

impl CatalogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing document is an empty catalog. Never writes, so readers can
    /// load while a commit is in flight.
    pub async fn load(&self) -> Result<Catalog, CatalogError> {
        let Some(doc) = read_json_opt::<CatalogDocument>(&self.path).await? else {
            debug!(path = %self.path.display(), "no catalog yet; starting empty");
            return Ok(Catalog::default());
        };
        if doc.schema_version > SCHEMA_VERSION {
            return Err(CatalogError::UnsupportedSchema(doc.schema_version));
        }
        let (catalog, repairs) = Catalog::from_document(doc);
        if repairs > 0 {
            warn!(path = %self.path.display(), repairs, "catalog repaired on load");
        }
        Ok(catalog)
    }

    /// Persist the whole catalog as the next version.
    pub async fn commit(&self, catalog: &mut Catalog) -> Result<u64, CatalogError> {
        catalog.doc.version += 1;
        catalog.doc.schema_version = SCHEMA_VERSION;
        if let Err(err) = write_json_atomic(&self.path, &catalog.doc).await {
            catalog.doc.version -= 1;
            return Err(err.into());
        }
        debug!(path = %self.path.display(), version = catalog.doc.version, "catalog committed");
        Ok(catalog.doc.version)
    }

    /// Remove temp files an interrupted commit left next to the catalog.
    /// Only files last modified more than `older_than` ago are touched.
    pub async fn sweep_stale_temp_files(&self, older_than: Duration) -> Result<usize, CatalogError> {
        let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(0);
        };
        let mut entries = match fs::read_dir(parent).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("reading {}", parent.display()))
                    .into())
            }
        };
        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading entry in {}", parent.display()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.starts_with('.') && name.ends_with(".tmp")) {
                continue;
            }
            let age = entry
                .metadata()
                .await
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if !matches!(age, Some(age) if age >= older_than) {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    warn!(file = %name, "removed temp file from interrupted commit");
                    removed += 1;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("removing {}", entry.path().display()))
                        .into())
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use pricewatch_core::Condition;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    fn obs(platform: Platform, url: &str, price: u64, minutes: i64) -> Observation {
        Observation {
            platform,
            title: "Sony A7 IV Body JP".into(),
            url: url.into(),
            price,
            condition: Condition::New,
            rating: None,
            review_count: None,
            observed_at: t0() + Duration::minutes(minutes),
        }
    }

    #[test]
    fn first_sighting_creates_then_price_move_records_change() {
        let matcher = CanonicalMatcher::default();
        let mut catalog = Catalog::default();

        let created = catalog.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 160000, 0), &matcher);
        assert!(matches!(created, IngestOutcome::Created { .. }));
        assert!(catalog.price_changes().is_empty());

        let updated = catalog.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 150000, 60), &matcher);
        let change = updated.change().expect("price change");
        assert_eq!(change.canonical_id, created.canonical_id());
        assert!((change.pct_change - -0.0625).abs() < 1e-12);

        let product = catalog.get_product(created.canonical_id()).unwrap();
        assert_eq!(product.price_history.len(), 2);
        assert_eq!(product.latest_price(Platform::AmazonJp), Some(150000));
        assert_eq!(product.updated_at, t0() + Duration::minutes(60));
        assert_eq!(product.created_at, t0());
        assert_eq!(catalog.price_changes().len(), 1);
    }

    #[test]
    fn unchanged_price_appends_history_without_change() {
        let matcher = CanonicalMatcher::default();
        let mut catalog = Catalog::default();
        catalog.ingest(&obs(Platform::Rakuten, "https://r/1", 120000, 0), &matcher);
        let outcome = catalog.ingest(&obs(Platform::Rakuten, "https://r/1", 120000, 30), &matcher);
        assert!(matches!(outcome, IngestOutcome::Updated { change: None, .. }));
        assert_eq!(catalog.products().next().unwrap().price_history.len(), 2);
    }

    #[test]
    fn replayed_and_out_of_order_observations_are_noops() {
        let matcher = CanonicalMatcher::default();
        let mut catalog = Catalog::default();
        catalog.ingest(&obs(Platform::Mercari, "https://m/1", 30000, 10), &matcher);
        let before = catalog.document().clone();

        let replay = catalog.ingest(&obs(Platform::Mercari, "https://m/1", 30000, 10), &matcher);
        assert!(matches!(replay, IngestOutcome::Replayed { .. }));
        let stale = catalog.ingest(&obs(Platform::Mercari, "https://m/1", 25000, 5), &matcher);
        assert!(matches!(stale, IngestOutcome::Replayed { .. }));

        assert_eq!(catalog.document(), &before);
    }

    #[test]
    fn staging_leaves_catalog_untouched_until_applied() {
        let matcher = CanonicalMatcher::default();
        let mut catalog = Catalog::default();
        catalog.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 160000, 0), &matcher);
        let before = catalog.document().clone();

        let staged = catalog.stage(&obs(Platform::AmazonJp, "https://a/dp/1", 150000, 60), &matcher);
        assert!(matches!(staged, Mutation::Update { change: Some(_), .. }));
        assert_eq!(catalog.document(), &before);

        drop(staged);
        assert_eq!(catalog.document(), &before);
    }

    #[test]
    fn ids_are_content_derived_and_stable() {
        let matcher = CanonicalMatcher::default();
        let mut first = Catalog::default();
        let mut second = Catalog::default();
        let a = first.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 1, 0), &matcher);
        let b = second.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 1, 0), &matcher);
        assert_eq!(a.canonical_id(), b.canonical_id());
        assert_eq!(a.canonical_id().len(), 16);
    }

    #[test]
    fn stats_and_change_filters() {
        let matcher = CanonicalMatcher::default();
        let mut catalog = Catalog::default();
        catalog.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 1000, 0), &matcher);
        catalog.ingest(&obs(Platform::Rakuten, "https://r/1", 1000, 1), &matcher);
        catalog.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 990, 10), &matcher);
        catalog.ingest(&obs(Platform::Rakuten, "https://r/1", 500, 20), &matcher);

        let stats = catalog.get_stats();
        assert_eq!(stats.total_products, 1);
        assert_eq!(stats.total_changes, 2);
        assert_eq!(stats.total_price_points, 4);
        assert_eq!(stats.platform_breakdown.get(&Platform::AmazonJp), Some(&1));
        assert_eq!(stats.platform_breakdown.get(&Platform::Rakuten), Some(&1));

        let all = catalog.get_price_changes(None, None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].platform, Platform::Rakuten);

        let big = catalog.get_price_changes(None, Some(0.1));
        assert_eq!(big.len(), 1);
        assert_eq!(big[0].new_price, 500);

        let recent = catalog.get_price_changes(Some(t0() + Duration::minutes(15)), None);
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn commit_then_load_round_trips_and_bumps_version() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path().join("catalog.json"));
        let matcher = CanonicalMatcher::default();

        let mut catalog = store.load().await.expect("empty load");
        assert_eq!(catalog.version(), 0);
        let created = catalog.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 1000, 0), &matcher);
        catalog.mark_imported("job/a.json");
        assert_eq!(store.commit(&mut catalog).await.expect("commit"), 1);

        let reloaded = store.load().await.expect("reload");
        assert_eq!(reloaded.version(), 1);
        assert!(reloaded.is_imported("job/a.json"));
        assert_eq!(
            reloaded
                .lookup_url(Platform::AmazonJp, "https://a/dp/1")
                .map(|p| p.id.as_str()),
            Some(created.canonical_id())
        );
    }

    #[tokio::test]
    async fn failed_commit_keeps_version_and_leaves_no_temp_files() {
        let dir = tempdir().expect("tempdir");
        let target = dir.path().join("catalog.json");
        std::fs::create_dir_all(target.join("occupied")).unwrap();
        let store = CatalogStore::new(&target);

        let mut catalog = Catalog::default();
        catalog.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 1000, 0), &CanonicalMatcher::default());
        assert!(store.commit(&mut catalog).await.is_err());
        assert_eq!(catalog.version(), 0);

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn failed_commit_leaves_last_committed_document_intact() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        let store = CatalogStore::new(&path);
        let matcher = CanonicalMatcher::default();

        let mut catalog = Catalog::default();
        let created = catalog.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 160000, 0), &matcher);
        assert_eq!(store.commit(&mut catalog).await.expect("commit v1"), 1);
        let committed = std::fs::read(&path).unwrap();

        // Park v1 aside and occupy the target so the rename of v2 cannot land.
        let parked = dir.path().join("parked.json");
        std::fs::rename(&path, &parked).unwrap();
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let outcome = catalog.ingest(&obs(Platform::AmazonJp, "https://a/dp/1", 150000, 60), &matcher);
        assert!(outcome.change().is_some());
        assert!(store.commit(&mut catalog).await.is_err());
        assert_eq!(catalog.version(), 1);
        assert_eq!(std::fs::read(&parked).unwrap(), committed);

        std::fs::remove_dir_all(&path).unwrap();
        std::fs::rename(&parked, &path).unwrap();
        let reloaded = store.load().await.expect("reload");
        assert_eq!(reloaded.version(), 1);
        assert!(reloaded.price_changes().is_empty());
        let product = reloaded.get_product(created.canonical_id()).unwrap();
        assert_eq!(product.latest_price(Platform::AmazonJp), Some(160000));
        assert_eq!(product.price_history.len(), 1);
    }

    #[tokio::test]
    async fn load_repairs_links_from_history_without_touching_temp_files() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        let matcher = CanonicalMatcher::default();

        let mut catalog = Catalog::default();
        let created = catalog.ingest(&obs(Platform::Rakuten, "https://r/1", 1000, 0), &matcher);
        catalog.ingest(&obs(Platform::Rakuten, "https://r/1", 900, 5), &matcher);
        let mut doc = catalog.document().clone();
        let link = doc
            .products
            .get_mut(created.canonical_id())
            .and_then(|p| p.platform_links.get_mut(&Platform::Rakuten))
            .unwrap();
        link.latest_price = 1000;
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        std::fs::write(dir.path().join(".pending.12.tmp"), b"partial").unwrap();

        let loaded = CatalogStore::new(&path).load().await.expect("load");
        let product = loaded.get_product(created.canonical_id()).unwrap();
        assert_eq!(product.latest_price(Platform::Rakuten), Some(900));
        assert!(dir.path().join(".pending.12.tmp").exists());
    }

    #[tokio::test]
    async fn sweep_removes_only_stale_temp_files() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path().join("catalog.json"));
        let stale = dir.path().join(".abandoned.12.tmp");
        let fresh = dir.path().join(".inflight.12.tmp");
        std::fs::write(&stale, b"partial").unwrap();
        std::fs::write(&fresh, b"partial").unwrap();
        std::fs::File::options()
            .write(true)
            .open(&stale)
            .unwrap()
            .set_modified(SystemTime::now() - std::time::Duration::from_secs(3600))
            .unwrap();

        assert_eq!(store.sweep_stale_temp_files(STALE_TEMP_AGE).await.unwrap(), 1);
        assert!(!stale.exists());
        assert!(fresh.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn loads_during_commits_do_not_break_them() {
        let dir = tempdir().expect("tempdir");
        let store = CatalogStore::new(dir.path().join("catalog.json"));
        let matcher = CanonicalMatcher::default();
        let stop = Arc::new(AtomicBool::new(false));

        let reader = {
            let store = store.clone();
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let mut loads = 0usize;
                while !stop.load(Ordering::Relaxed) {
                    store.load().await.expect("concurrent load");
                    loads += 1;
                    tokio::task::yield_now().await;
                }
                loads
            })
        };

        let mut catalog = Catalog::default();
        for i in 0..40u64 {
            catalog.ingest(
                &obs(Platform::AmazonJp, &format!("https://a/dp/{i}"), 1000 + i, i as i64),
                &matcher,
            );
            store.commit(&mut catalog).await.expect("commit during reads");
        }
        stop.store(true, Ordering::Relaxed);
        reader.await.expect("reader task");

        assert_eq!(store.load().await.unwrap().version(), 40);
    }

    #[tokio::test]
    async fn newer_schema_is_refused() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("catalog.json");
        let doc = CatalogDocument {
            schema_version: SCHEMA_VERSION + 1,
            ..CatalogDocument::default()
        };
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
        assert!(matches!(
            CatalogStore::new(&path).load().await,
            Err(CatalogError::UnsupportedSchema(_))
        ));
    }
}

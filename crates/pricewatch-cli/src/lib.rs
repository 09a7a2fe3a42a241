//! Environment-driven wiring shared by the `pricewatch` binary and its
//! scenario tests.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, TimeDelta, Utc};
use pricewatch_adapters::SearchSource;
use pricewatch_batch::{BatchConfig, BatchOrchestrator};
use pricewatch_catalog::{CanonicalMatcher, CatalogStore, Importer, MatcherConfig};
use pricewatch_storage::{BackoffPolicy, FileJobLedger, ResultSink};

pub const CRATE_NAME: &str = "pricewatch-cli";

#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    pub data_dir: PathBuf,
    pub concurrency: usize,
    pub request_delay: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub task_timeout: Duration,
    pub similarity_threshold: f64,
    pub workers_file: PathBuf,
    pub bind: SocketAddr,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparsable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        Self {
            data_dir: lookup("PRICEWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            concurrency: parsed("PRICEWATCH_CONCURRENCY")
                .map(|v| v.max(1) as usize)
                .unwrap_or(5),
            request_delay: Duration::from_millis(parsed("PRICEWATCH_REQUEST_DELAY_MS").unwrap_or(1000)),
            max_attempts: parsed("PRICEWATCH_MAX_ATTEMPTS")
                .and_then(|v| u32::try_from(v).ok())
                .map(|v| v.max(1))
                .unwrap_or(3),
            backoff_base: Duration::from_millis(parsed("PRICEWATCH_BACKOFF_BASE_MS").unwrap_or(1000)),
            backoff_max: Duration::from_millis(parsed("PRICEWATCH_BACKOFF_MAX_MS").unwrap_or(30_000)),
            task_timeout: Duration::from_secs(parsed("PRICEWATCH_TASK_TIMEOUT_SECS").unwrap_or(120)),
            similarity_threshold: lookup("PRICEWATCH_SIMILARITY_THRESHOLD")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(0.82),
            workers_file: lookup("PRICEWATCH_WORKERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./workers.yaml")),
            bind: lookup("PRICEWATCH_BIND")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080))),
        }
    }

    pub fn results_dir(&self) -> PathBuf {
        self.data_dir.join("results")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    pub fn summaries_dir(&self) -> PathBuf {
        self.data_dir.join("summaries")
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.data_dir.join("catalog").join("catalog.json")
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            concurrency: self.concurrency,
            request_delay: self.request_delay,
            task_timeout: self.task_timeout,
            backoff: BackoffPolicy {
                max_attempts: self.max_attempts,
                base_delay: self.backoff_base,
                max_delay: self.backoff_max,
            },
        }
    }

    pub fn matcher_config(&self) -> MatcherConfig {
        MatcherConfig {
            similarity_threshold: self.similarity_threshold,
            ..MatcherConfig::default()
        }
    }

    pub fn catalog_store(&self) -> CatalogStore {
        CatalogStore::new(self.catalog_path())
    }

    pub fn orchestrator(&self, source: Arc<dyn SearchSource>) -> BatchOrchestrator {
        BatchOrchestrator::new(
            source,
            Arc::new(FileJobLedger::new(self.jobs_dir())),
            ResultSink::new(self.results_dir()),
            self.summaries_dir(),
            self.batch_config(),
        )
    }

    pub fn importer(&self) -> Importer {
        Importer::new(
            ResultSink::new(self.results_dir()),
            self.catalog_store(),
            CanonicalMatcher::new(self.matcher_config()),
        )
    }
}

/// `--since` accepts RFC 3339 or a look-back such as `30m`, `24h`, `7d`.
pub fn parse_since(raw: &str, now: DateTime<Utc>) -> anyhow::Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let Some(unit) = raw.chars().last() else {
        bail!("empty --since value");
    };
    let amount: i64 = raw[..raw.len() - unit.len_utf8()]
        .parse()
        .with_context(|| format!("invalid --since value `{raw}`"))?;
    let span = match unit {
        'm' => TimeDelta::try_minutes(amount),
        'h' => TimeDelta::try_hours(amount),
        'd' => TimeDelta::try_days(amount),
        _ => bail!("invalid --since value `{raw}`; use RFC 3339 or a number with m, h or d"),
    };
    match span.and_then(|span| now.checked_sub_signed(span)) {
        Some(since) => Ok(since),
        None => bail!("--since value `{raw}` reaches outside the supported date range"),
    }
}

/// Keywords from `--keyword` flags plus an optional keyword file.
pub fn collect_keywords(flags: &[String], file: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let mut keywords = flags.to_vec();
    if let Some(path) = file {
        keywords.extend(pricewatch_batch::load_keywords(path)?);
    }
    Ok(pricewatch_batch::dedupe_keywords(keywords))
}

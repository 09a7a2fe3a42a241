//! Durable file primitives for pricewatch: atomic replace-on-write, the raw
//! results sink, the batch job ledger and the retry backoff policy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pricewatch_core::{BatchJob, Platform, RawProductBatch};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Lowercase ASCII-alphanumeric slug; non-ASCII keywords fall back to a hash prefix.
pub fn keyword_slug(keyword: &str) -> String {
    let slug = keyword
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        format!("kw-{}", &sha256_hex(keyword.as_bytes())[..12])
    } else {
        slug
    }
}

/// Write `bytes` to a sibling temp file, flush, then rename over `path`.
///
/// Readers see either the previous file or the new one, never a partial write.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes).await
}

/// `Ok(None)` when the file does not exist.
pub async fn read_json_opt<T: DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let value =
        serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(value))
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Raw results sink: one immutable JSON artifact per successful (keyword, platform) task.
#[derive(Debug, Clone)]
pub struct ResultSink {
    root: PathBuf,
}

impl ResultSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_relative_path(
        &self,
        job_id: &str,
        fetched_at: DateTime<Utc>,
        keyword: &str,
        platform: Platform,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(job_id).join(format!(
            "{stamp}__{}__{platform}__{}.json",
            keyword_slug(keyword),
            &content_hash[..12]
        ))
    }

    /// Store a batch under a hash-addressed name; identical content is written once.
    pub async fn store_batch(&self, batch: &RawProductBatch) -> anyhow::Result<StoredArtifact> {
        let bytes = serde_json::to_vec_pretty(batch).context("serializing raw product batch")?;
        let content_hash = sha256_hex(&bytes);
        let relative_path = self.artifact_relative_path(
            &batch.job_id,
            batch.fetched_at,
            &batch.keyword,
            batch.platform,
            &content_hash,
        );
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, &bytes).await?;
        }
        debug!(path = %relative_path.display(), deduplicated, "stored raw product batch");

        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    /// Every artifact under the sink, relative to its root, oldest stamp first.
    pub async fn list_artifacts(&self) -> anyhow::Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .with_context(|| format!("reading entry in {}", dir.display()))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .with_context(|| format!("inspecting {}", path.display()))?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == "json")
                    && !entry.file_name().to_string_lossy().starts_with('.')
                {
                    if let Ok(rel) = path.strip_prefix(&self.root) {
                        out.push(rel.to_path_buf());
                    }
                }
            }
        }
        out.sort_by(|a, b| {
            let name_a = a.file_name().map(|n| n.to_os_string());
            let name_b = b.file_name().map(|n| n.to_os_string());
            name_a.cmp(&name_b).then_with(|| a.cmp(b))
        });
        Ok(out)
    }

    pub async fn load_batch(&self, relative_path: &Path) -> anyhow::Result<RawProductBatch> {
        let path = self.root.join(relative_path);
        read_json_opt(&path)
            .await?
            .with_context(|| format!("artifact {} disappeared", path.display()))
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid job id `{0}`")]
    InvalidJobId(String),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

/// Persistence seam for batch job state.
#[async_trait]
pub trait JobLedger: Send + Sync {
    /// Active jobs first, then archived ones.
    async fn load(&self, job_id: &str) -> Result<Option<BatchJob>, LedgerError>;
    async fn save(&self, job: &BatchJob) -> Result<(), LedgerError>;
    /// Move a finished job out of the active set, keeping its failed items.
    async fn archive(&self, job: &BatchJob) -> Result<(), LedgerError>;
}

pub fn validate_job_id(job_id: &str) -> Result<(), LedgerError> {
    let valid = !job_id.is_empty()
        && job_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !job_id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidJobId(job_id.to_string()))
    }
}

/// JSON-file ledger: `jobs/{job_id}.json`, archived under `jobs/archive/`.
#[derive(Debug, Clone)]
pub struct FileJobLedger {
    root: PathBuf,
}

impl FileJobLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn active_path(&self, job_id: &str) -> PathBuf {
        self.root.join(format!("{job_id}.json"))
    }

    fn archive_path(&self, job_id: &str) -> PathBuf {
        self.root.join("archive").join(format!("{job_id}.json"))
    }
}

#[async_trait]
impl JobLedger for FileJobLedger {
    async fn load(&self, job_id: &str) -> Result<Option<BatchJob>, LedgerError> {
        validate_job_id(job_id)?;
        if let Some(job) = read_json_opt(&self.active_path(job_id)).await? {
            return Ok(Some(job));
        }
        Ok(read_json_opt(&self.archive_path(job_id)).await?)
    }

    async fn save(&self, job: &BatchJob) -> Result<(), LedgerError> {
        validate_job_id(&job.job_id)?;
        write_json_atomic(&self.active_path(&job.job_id), job).await?;
        Ok(())
    }

    async fn archive(&self, job: &BatchJob) -> Result<(), LedgerError> {
        validate_job_id(&job.job_id)?;
        write_json_atomic(&self.archive_path(&job.job_id), job).await?;
        let active = self.active_path(&job.job_id);
        match fs::remove_file(&active).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(LedgerError::Io(
                anyhow::Error::new(err).context(format!("removing {}", active.display())),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts per task, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry that follows failed attempt number `attempt` (1-based).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn should_retry(&self, attempts: u32, disposition: RetryDisposition) -> bool {
        disposition == RetryDisposition::Retryable && attempts < self.max_attempts
    }
}

//! Batch scraping orchestration: keyword x platform search tasks over a bounded
//! worker pool, retried with backoff, checkpointed through a [`JobLedger`].
//!
//! A single coordinator owns the [`BatchJob`]. Workers only search and report
//! their outcome over a channel; every ledger write, artifact write and
//! checkpoint decision happens in the coordinator.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use pricewatch_adapters::{SearchError, SearchSource};
use pricewatch_core::{BatchJob, FailedItem, JobStatus, Platform, RawProduct, RawProductBatch};
use pricewatch_storage::{write_json_atomic, BackoffPolicy, JobLedger, LedgerError, ResultSink};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pricewatch-batch";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Search tasks in flight at once.
    pub concurrency: usize,
    /// Pause before every search call, retries included.
    pub request_delay: Duration,
    pub task_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            request_delay: Duration::from_secs(1),
            task_timeout: Duration::from_secs(120),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("no keywords to search")]
    NoKeywords,
    #[error("no platforms selected")]
    NoPlatforms,
    #[error("batch job `{0}` not found")]
    UnknownJob(String),
    #[error("job ledger: {0}")]
    Ledger(#[from] LedgerError),
    #[error("results sink: {0:#}")]
    Sink(anyhow::Error),
    #[error("batch summary: {0:#}")]
    Summary(anyhow::Error),
}

/// One successful (keyword, platform) task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub keyword: String,
    pub platform: Platform,
    pub attempts: u32,
    pub products: usize,
    /// Relative to the results sink root.
    pub artifact: PathBuf,
}

/// Written to `summaries/{job_id}.json` at the end of every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub keywords: usize,
    pub platforms: Vec<Platform>,
    pub tasks_succeeded: usize,
    pub tasks_failed: usize,
    pub success_rate: f64,
    pub products_found: usize,
    pub elapsed_secs: f64,
    pub cancelled: bool,
    pub checkpoint: Option<usize>,
    pub failed_items: Vec<FailedItem>,
}

#[derive(Debug, Clone)]
pub struct BatchResult {
    pub job: BatchJob,
    pub reports: Vec<TaskReport>,
    pub summary: BatchSummary,
}

#[derive(Debug, Clone)]
struct Task {
    /// `None` for retried failures of keywords already behind the checkpoint.
    keyword_index: Option<usize>,
    keyword: String,
    platform: Platform,
    attempts: u32,
    not_before: Option<Instant>,
}

struct TaskOutcome {
    task: Task,
    result: Result<Vec<RawProduct>, SearchError>,
    fetched_at: DateTime<Utc>,
}

struct RunState {
    job: BatchJob,
    /// Unresolved task count per keyword index.
    remaining: BTreeMap<usize, usize>,
    /// Resolved keywords not yet covered by the checkpoint.
    resolved: BTreeSet<usize>,
    delayed: Vec<Task>,
    reports: Vec<TaskReport>,
    failed: usize,
}

pub struct BatchOrchestrator {
    source: Arc<dyn SearchSource>,
    ledger: Arc<dyn JobLedger>,
    sink: ResultSink,
    summaries_dir: PathBuf,
    config: BatchConfig,
    cancel: CancellationToken,
}

impl BatchOrchestrator {
    pub fn new(
        source: Arc<dyn SearchSource>,
        ledger: Arc<dyn JobLedger>,
        sink: ResultSink,
        summaries_dir: impl Into<PathBuf>,
        config: BatchConfig,
    ) -> Self {
        Self {
            source,
            ledger,
            sink,
            summaries_dir: summaries_dir.into(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Start a new job over `keywords x platforms`.
    pub async fn run(
        &self,
        keywords: Vec<String>,
        platforms: BTreeSet<Platform>,
        per_keyword_limit: usize,
    ) -> Result<BatchResult, BatchError> {
        let keywords = dedupe_keywords(keywords);
        if keywords.is_empty() {
            return Err(BatchError::NoKeywords);
        }
        if platforms.is_empty() {
            return Err(BatchError::NoPlatforms);
        }
        let now = Utc::now();
        let job = BatchJob::new(new_job_id(now), keywords, platforms, per_keyword_limit, now);
        self.execute(job, false).await
    }

    /// Continue a persisted job after its checkpoint. With `retry_failed`,
    /// previously failed pairs behind the checkpoint run again too.
    pub async fn resume(&self, job_id: &str, retry_failed: bool) -> Result<BatchResult, BatchError> {
        let job = self
            .ledger
            .load(job_id)
            .await?
            .ok_or_else(|| BatchError::UnknownJob(job_id.to_string()))?;
        info!(
            job_id,
            checkpoint = ?job.checkpoint,
            failed_items = job.failed_items.len(),
            retry_failed,
            "resuming batch job"
        );
        self.execute(job, retry_failed).await
    }

    async fn execute(&self, job: BatchJob, retry_failed: bool) -> Result<BatchResult, BatchError> {
        let span = info_span!("batch", job_id = %job.job_id);
        async move {
            let started = Instant::now();
            let mut state = RunState {
                remaining: BTreeMap::new(),
                resolved: BTreeSet::new(),
                delayed: Vec::new(),
                reports: Vec::new(),
                failed: 0,
                job,
            };
            let ready = initial_tasks(&mut state, retry_failed);
            info!(
                keywords = state.job.keywords.len(),
                platforms = state.job.platforms.len(),
                tasks = ready.len(),
                concurrency = self.config.concurrency,
                "batch started"
            );

            state.job.status = JobStatus::Running;
            state.job.updated_at = Utc::now();
            self.ledger.save(&state.job).await?;

            let cancelled = match self.drive(&mut state, ready).await {
                Ok(cancelled) => cancelled,
                Err(err) => {
                    state.job.status = JobStatus::Failed;
                    state.job.updated_at = Utc::now();
                    if let Err(save_err) = self.ledger.save(&state.job).await {
                        warn!(error = %save_err, "could not record failed job status");
                    }
                    return Err(err);
                }
            };

            state.job.updated_at = Utc::now();
            if state.job.resume_index() >= state.job.keywords.len() {
                state.job.status = JobStatus::Completed;
                self.ledger.archive(&state.job).await?;
            } else {
                self.ledger.save(&state.job).await?;
            }

            let summary = summarize(&state, cancelled, started.elapsed());
            let summary_path = self.summaries_dir.join(format!("{}.json", state.job.job_id));
            write_json_atomic(&summary_path, &summary)
                .await
                .map_err(BatchError::Summary)?;
            info!(
                status = ?summary.status,
                succeeded = summary.tasks_succeeded,
                failed = summary.tasks_failed,
                products = summary.products_found,
                checkpoint = ?summary.checkpoint,
                cancelled,
                "batch finished"
            );

            Ok(BatchResult {
                job: state.job,
                reports: state.reports,
                summary,
            })
        }
        .instrument(span)
        .await
    }

    /// Coordinator loop. Returns whether the run was cancelled.
    async fn drive(&self, state: &mut RunState, mut ready: VecDeque<Task>) -> Result<bool, BatchError> {
        let concurrency = self.config.concurrency.max(1);
        let (tx, mut rx) = mpsc::channel::<TaskOutcome>(concurrency);
        let mut in_flight = 0usize;
        let mut cancelled = false;

        loop {
            if !cancelled && self.cancel.is_cancelled() {
                cancelled = true;
                info!(
                    in_flight,
                    abandoned = ready.len() + state.delayed.len(),
                    "cancellation requested; draining in-flight searches"
                );
            }

            if !cancelled {
                let now = Instant::now();
                let mut i = 0;
                while i < state.delayed.len() {
                    if state.delayed[i].not_before.is_none_or(|at| at <= now) {
                        ready.push_back(state.delayed.swap_remove(i));
                    } else {
                        i += 1;
                    }
                }
                while in_flight < concurrency {
                    let Some(mut task) = ready.pop_front() else {
                        break;
                    };
                    task.attempts += 1;
                    self.spawn_worker(state.job.per_keyword_limit, task, tx.clone());
                    in_flight += 1;
                }
            }

            if in_flight == 0 && (cancelled || (ready.is_empty() && state.delayed.is_empty())) {
                return Ok(cancelled);
            }

            let next_due = state.delayed.iter().filter_map(|t| t.not_before).min();
            let can_dispatch = !cancelled && in_flight < concurrency;
            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancelled => {}
                Some(outcome) = rx.recv(), if in_flight > 0 => {
                    in_flight -= 1;
                    self.handle_outcome(state, outcome, cancelled || self.cancel.is_cancelled()).await?;
                }
                _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if can_dispatch && next_due.is_some() => {}
            }
        }
    }

    fn spawn_worker(&self, limit: usize, task: Task, tx: mpsc::Sender<TaskOutcome>) {
        let source = Arc::clone(&self.source);
        let request_delay = self.config.request_delay;
        let task_timeout = self.config.task_timeout;
        let span = info_span!(
            "search_task",
            keyword = %task.keyword,
            platform = %task.platform,
            attempt = task.attempts
        );

        tokio::spawn(
            async move {
                sleep(request_delay).await;
                let result = match timeout(task_timeout, source.search(&task.keyword, task.platform, limit)).await {
                    Ok(result) => result,
                    Err(_) => Err(SearchError::Transient(format!(
                        "search timed out after {}s",
                        task_timeout.as_secs()
                    ))),
                };
                let outcome = TaskOutcome {
                    task,
                    result,
                    fetched_at: Utc::now(),
                };
                if tx.send(outcome).await.is_err() {
                    debug!("coordinator gone; dropping search outcome");
                }
            }
            .instrument(span),
        );
    }

    async fn handle_outcome(
        &self,
        state: &mut RunState,
        outcome: TaskOutcome,
        cancelled: bool,
    ) -> Result<(), BatchError> {
        let TaskOutcome {
            task,
            result,
            fetched_at,
        } = outcome;

        match result {
            Ok(products) => {
                let batch = RawProductBatch {
                    job_id: state.job.job_id.clone(),
                    keyword: task.keyword.clone(),
                    platform: task.platform,
                    count: products.len(),
                    fetched_at,
                    products,
                };
                let stored = self.sink.store_batch(&batch).await.map_err(BatchError::Sink)?;
                info!(
                    keyword = %task.keyword,
                    platform = %task.platform,
                    attempts = task.attempts,
                    products = batch.count,
                    artifact = %stored.relative_path.display(),
                    "search task succeeded"
                );
                let cleared = state.job.clear_failure(&task.keyword, task.platform);
                state.reports.push(TaskReport {
                    keyword: task.keyword,
                    platform: task.platform,
                    attempts: task.attempts,
                    products: batch.count,
                    artifact: stored.relative_path,
                });
                self.resolve(state, task.keyword_index, cleared).await
            }
            Err(err) => {
                let retry = self
                    .config
                    .backoff
                    .should_retry(task.attempts, err.disposition());
                if retry && !cancelled {
                    let delay = self.config.backoff.delay_after_attempt(task.attempts);
                    warn!(
                        keyword = %task.keyword,
                        platform = %task.platform,
                        attempt = task.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "search failed; retrying"
                    );
                    state.delayed.push(Task {
                        not_before: Some(Instant::now() + delay),
                        ..task
                    });
                    return Ok(());
                }
                if retry {
                    info!(
                        keyword = %task.keyword,
                        platform = %task.platform,
                        "retry abandoned by cancellation"
                    );
                    return Ok(());
                }

                warn!(
                    keyword = %task.keyword,
                    platform = %task.platform,
                    attempts = task.attempts,
                    error = %err,
                    "search task failed permanently"
                );
                state.job.record_failure(FailedItem {
                    keyword: task.keyword,
                    platform: task.platform,
                    last_error: err.to_string(),
                    attempts: task.attempts,
                });
                state.failed += 1;
                self.resolve(state, task.keyword_index, true).await
            }
        }
    }

    /// Count a task as resolved and advance the checkpoint over the contiguous
    /// prefix of fully resolved keywords. Persists when anything changed.
    async fn resolve(
        &self,
        state: &mut RunState,
        keyword_index: Option<usize>,
        mut dirty: bool,
    ) -> Result<(), BatchError> {
        if let Some(index) = keyword_index {
            if let Some(left) = state.remaining.get_mut(&index) {
                *left = left.saturating_sub(1);
                if *left == 0 {
                    state.remaining.remove(&index);
                    state.resolved.insert(index);
                }
            }
            let mut next = state.job.resume_index();
            while state.resolved.remove(&next) {
                state.job.checkpoint = Some(next);
                debug!(checkpoint = next, "checkpoint advanced");
                next += 1;
                dirty = true;
            }
        }
        if dirty {
            state.job.updated_at = Utc::now();
            self.ledger.save(&state.job).await?;
        }
        Ok(())
    }
}

fn initial_tasks(state: &mut RunState, retry_failed: bool) -> VecDeque<Task> {
    let job = &state.job;
    let mut ready = VecDeque::new();
    for (index, keyword) in job.keywords.iter().enumerate().skip(job.resume_index()) {
        state.remaining.insert(index, job.platforms.len());
        for platform in &job.platforms {
            ready.push_back(Task {
                keyword_index: Some(index),
                keyword: keyword.clone(),
                platform: *platform,
                attempts: 0,
                not_before: None,
            });
        }
    }

    if retry_failed {
        for item in &job.failed_items {
            let index = job.keywords.iter().position(|k| k == &item.keyword);
            if index.is_some_and(|i| !job.is_keyword_done(i)) {
                // Still ahead of the checkpoint, so already queued above.
                continue;
            }
            ready.push_back(Task {
                keyword_index: None,
                keyword: item.keyword.clone(),
                platform: item.platform,
                attempts: 0,
                not_before: None,
            });
        }
    }
    ready
}

fn summarize(state: &RunState, cancelled: bool, elapsed: Duration) -> BatchSummary {
    let succeeded = state.reports.len();
    let attempted = succeeded + state.failed;
    BatchSummary {
        job_id: state.job.job_id.clone(),
        status: state.job.status,
        keywords: state.job.keywords.len(),
        platforms: state.job.platforms.iter().copied().collect(),
        tasks_succeeded: succeeded,
        tasks_failed: state.failed,
        success_rate: if attempted == 0 {
            0.0
        } else {
            succeeded as f64 / attempted as f64
        },
        products_found: state.reports.iter().map(|r| r.products).sum(),
        elapsed_secs: elapsed.as_secs_f64(),
        cancelled,
        checkpoint: state.job.checkpoint,
        failed_items: state.job.failed_items.clone(),
    }
}

/// `batch-YYYYmmdd-HHMMSS-xxxxxxxx`
pub fn new_job_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("batch-{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// Trim, drop blanks and drop repeats, keeping first-seen order.
pub fn dedupe_keywords<I>(keywords: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut seen = HashSet::new();
    keywords
        .into_iter()
        .map(|k| k.as_ref().trim().to_string())
        .filter(|k| !k.is_empty())
        .filter(|k| seen.insert(k.clone()))
        .collect()
}

/// Keywords from a `.txt` file (one per line) or a `.csv` file (first column,
/// optional `keyword` header).
pub fn load_keywords(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading keyword file {}", path.display()))?;
    let is_csv = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));
    if !is_csv {
        return Ok(dedupe_keywords(text.lines()));
    }

    let mut rows = text
        .lines()
        .map(first_csv_field)
        .filter(|cell| !cell.is_empty())
        .peekable();
    if rows
        .peek()
        .is_some_and(|first| first.eq_ignore_ascii_case("keyword"))
    {
        rows.next();
    }
    Ok(dedupe_keywords(rows))
}

/// First field of a CSV record. Quoted fields may hold commas and `""` escapes.
fn first_csv_field(line: &str) -> String {
    let line = line.trim_start();
    let Some(quoted) = line.strip_prefix('"') else {
        return line.split(',').next().unwrap_or_default().trim().to_string();
    };
    let mut field = String::new();
    let mut chars = quoted.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' => break,
            _ => field.push(c),
        }
    }
    field.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pricewatch_storage::FileJobLedger;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    type Scripted = VecDeque<Result<Vec<RawProduct>, SearchError>>;

    #[derive(Default)]
    struct ScriptedSource {
        scripts: Mutex<HashMap<(String, Platform), Scripted>>,
        latency: HashMap<String, Duration>,
        cancel_on: Option<(String, CancellationToken)>,
        calls: Mutex<Vec<(String, Platform, Instant)>>,
    }

    impl ScriptedSource {
        fn script(self, keyword: &str, platform: Platform, outcomes: Vec<Result<Vec<RawProduct>, SearchError>>) -> Self {
            self.scripts
                .lock()
                .unwrap()
                .insert((keyword.to_string(), platform), outcomes.into());
            self
        }

        fn calls(&self) -> Vec<(String, Platform, Instant)> {
            self.calls.lock().unwrap().clone()
        }

        fn searched(&self) -> Vec<(String, Platform)> {
            self.calls().into_iter().map(|(k, p, _)| (k, p)).collect()
        }
    }

    fn product(keyword: &str, platform: Platform) -> RawProduct {
        RawProduct {
            platform,
            title: format!("{keyword} listing"),
            price: Some("¥1,000".into()),
            url: format!("https://example.test/{platform}/{}", keyword.replace(' ', "-")),
            rating: None,
            review_count: None,
            seller: None,
            condition: None,
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap(),
        }
    }

    #[async_trait]
    impl SearchSource for ScriptedSource {
        async fn search(&self, keyword: &str, platform: Platform, _limit: usize) -> Result<Vec<RawProduct>, SearchError> {
            self.calls
                .lock()
                .unwrap()
                .push((keyword.to_string(), platform, Instant::now()));
            if let Some(latency) = self.latency.get(keyword) {
                sleep(*latency).await;
            }
            if let Some((trigger, token)) = &self.cancel_on {
                if trigger == keyword {
                    token.cancel();
                }
            }
            let scripted = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(&(keyword.to_string(), platform))
                .and_then(|queue| queue.pop_front());
            scripted.unwrap_or_else(|| Ok(vec![product(keyword, platform)]))
        }
    }

    /// File ledger that also remembers the checkpoint of every save.
    struct RecordingLedger {
        inner: FileJobLedger,
        saved: Mutex<Vec<Option<usize>>>,
    }

    #[async_trait]
    impl JobLedger for RecordingLedger {
        async fn load(&self, job_id: &str) -> Result<Option<BatchJob>, LedgerError> {
            self.inner.load(job_id).await
        }

        async fn save(&self, job: &BatchJob) -> Result<(), LedgerError> {
            self.saved.lock().unwrap().push(job.checkpoint);
            self.inner.save(job).await
        }

        async fn archive(&self, job: &BatchJob) -> Result<(), LedgerError> {
            self.inner.archive(job).await
        }
    }

    struct BrokenLedger;

    #[async_trait]
    impl JobLedger for BrokenLedger {
        async fn load(&self, _job_id: &str) -> Result<Option<BatchJob>, LedgerError> {
            Ok(None)
        }

        async fn save(&self, _job: &BatchJob) -> Result<(), LedgerError> {
            Err(LedgerError::Io(anyhow::anyhow!("disk full")))
        }

        async fn archive(&self, _job: &BatchJob) -> Result<(), LedgerError> {
            Err(LedgerError::Io(anyhow::anyhow!("disk full")))
        }
    }

    fn config(concurrency: usize) -> BatchConfig {
        BatchConfig {
            concurrency,
            request_delay: Duration::from_secs(1),
            task_timeout: Duration::from_secs(3600),
            backoff: BackoffPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
            },
        }
    }

    fn orchestrator(dir: &TempDir, source: Arc<ScriptedSource>, ledger: Arc<dyn JobLedger>, concurrency: usize) -> BatchOrchestrator {
        BatchOrchestrator::new(
            source,
            ledger,
            ResultSink::new(dir.path().join("results")),
            dir.path().join("summaries"),
            config(concurrency),
        )
    }

    fn file_ledger(dir: &TempDir) -> Arc<FileJobLedger> {
        Arc::new(FileJobLedger::new(dir.path().join("jobs")))
    }

    fn keywords(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn transient(msg: &str) -> Result<Vec<RawProduct>, SearchError> {
        Err(SearchError::Transient(msg.into()))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_with_backoff_then_succeed() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default().script(
            "iPhone 15",
            Platform::Rakuten,
            vec![transient("503"), transient("503")],
        ));
        let batch = orchestrator(&dir, source.clone(), file_ledger(&dir), 1);

        let result = batch
            .run(keywords(&["iPhone 15"]), BTreeSet::from([Platform::Rakuten]), 5)
            .await
            .expect("batch");

        assert_eq!(result.reports.len(), 1);
        assert_eq!(result.reports[0].attempts, 3);
        assert!(result.job.failed_items.is_empty());
        assert_eq!(result.job.status, JobStatus::Completed);

        let calls = source.calls();
        assert_eq!(calls.len(), 3);
        // backoff after attempt n is base * 2^(n-1), plus the request delay
        assert!(calls[1].2 - calls[0].2 >= Duration::from_secs(2));
        assert!(calls[2].2 - calls[1].2 >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_failed_items_without_aborting() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default().script(
            "iPhone 15",
            Platform::Mercari,
            vec![transient("timeout"), transient("timeout"), transient("http status 503")],
        ));
        let ledger = file_ledger(&dir);
        let batch = orchestrator(&dir, source.clone(), ledger.clone(), 2);

        let result = batch
            .run(
                keywords(&["iPhone 15"]),
                BTreeSet::from([Platform::Rakuten, Platform::Mercari]),
                5,
            )
            .await
            .expect("batch");

        assert_eq!(result.reports.len(), 1);
        assert_eq!(result.reports[0].platform, Platform::Rakuten);
        assert_eq!(result.job.failed_items.len(), 1);
        let failed = &result.job.failed_items[0];
        assert_eq!(failed.platform, Platform::Mercari);
        assert_eq!(failed.attempts, 3);
        assert!(failed.last_error.contains("503"));
        assert_eq!(result.job.checkpoint, Some(0));
        assert_eq!(result.job.status, JobStatus::Completed);

        let archived = ledger.load(&result.job.job_id).await.unwrap().expect("archived");
        assert_eq!(archived.failed_items, result.job.failed_items);

        let summary_path = dir.path().join("summaries").join(format!("{}.json", result.job.job_id));
        let summary: BatchSummary = serde_json::from_slice(&std::fs::read(summary_path).unwrap()).unwrap();
        assert_eq!(summary.tasks_succeeded, 1);
        assert_eq!(summary.tasks_failed, 1);
        assert_eq!(summary.success_rate, 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::default().script(
            "Switch",
            Platform::AmazonJp,
            vec![Err(SearchError::Permanent("http status 404".into()))],
        ));
        let batch = orchestrator(&dir, source.clone(), file_ledger(&dir), 1);

        let result = batch
            .run(keywords(&["Switch"]), BTreeSet::from([Platform::AmazonJp]), 5)
            .await
            .expect("batch");

        assert_eq!(source.calls().len(), 1);
        assert_eq!(result.job.failed_items[0].attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn checkpoint_waits_for_the_slowest_earlier_keyword() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource {
            latency: HashMap::from([("a".to_string(), Duration::from_secs(10))]),
            ..ScriptedSource::default()
        });
        let ledger = Arc::new(RecordingLedger {
            inner: FileJobLedger::new(dir.path().join("jobs")),
            saved: Mutex::new(Vec::new()),
        });
        let batch = orchestrator(&dir, source, ledger.clone(), 3);

        let result = batch
            .run(keywords(&["a", "b", "c"]), BTreeSet::from([Platform::Rakuten]), 5)
            .await
            .expect("batch");

        assert_eq!(result.job.checkpoint, Some(2));
        assert_eq!(*ledger.saved.lock().unwrap(), vec![None, Some(2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_skips_keywords_at_or_before_checkpoint() {
        let dir = tempdir().unwrap();
        let ledger = file_ledger(&dir);
        let now = Utc::now();
        let mut job = BatchJob::new("batch-resume", keywords(&["a", "b", "c"]), BTreeSet::from([Platform::Rakuten]), 5, now);
        job.status = JobStatus::Running;
        job.checkpoint = Some(0);
        ledger.save(&job).await.unwrap();

        let source = Arc::new(ScriptedSource::default());
        let batch = orchestrator(&dir, source.clone(), ledger.clone(), 1);
        let result = batch.resume("batch-resume", false).await.expect("resume");

        assert_eq!(
            source.searched(),
            vec![("b".to_string(), Platform::Rakuten), ("c".to_string(), Platform::Rakuten)]
        );
        assert_eq!(result.job.checkpoint, Some(2));
        assert_eq!(result.job.status, JobStatus::Completed);
        assert!(!dir.path().join("jobs").join("batch-resume.json").exists());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_failed_reruns_archived_failures_and_clears_them() {
        let dir = tempdir().unwrap();
        let ledger = file_ledger(&dir);
        let mut job = BatchJob::new("batch-done", keywords(&["a"]), BTreeSet::from([Platform::Rakuten, Platform::Mercari]), 5, Utc::now());
        job.status = JobStatus::Completed;
        job.checkpoint = Some(0);
        job.record_failure(FailedItem {
            keyword: "a".into(),
            platform: Platform::Mercari,
            last_error: "http status 503".into(),
            attempts: 3,
        });
        ledger.archive(&job).await.unwrap();

        let source = Arc::new(ScriptedSource::default());
        let untouched = orchestrator(&dir, source.clone(), ledger.clone(), 2)
            .resume("batch-done", false)
            .await
            .expect("plain resume");
        assert!(source.calls().is_empty());
        assert_eq!(untouched.job.failed_items.len(), 1);

        let retried = orchestrator(&dir, source.clone(), ledger.clone(), 2)
            .resume("batch-done", true)
            .await
            .expect("retry failed");
        assert_eq!(source.searched(), vec![("a".to_string(), Platform::Mercari)]);
        assert!(retried.job.failed_items.is_empty());
        assert_eq!(retried.job.status, JobStatus::Completed);
        assert!(ledger.load("batch-done").await.unwrap().unwrap().failed_items.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drains_in_flight_and_leaves_job_resumable() {
        let dir = tempdir().unwrap();
        let token = CancellationToken::new();
        let source = Arc::new(ScriptedSource {
            cancel_on: Some(("b".to_string(), token.clone())),
            ..ScriptedSource::default()
        });
        let ledger = file_ledger(&dir);
        let batch = orchestrator(&dir, source.clone(), ledger.clone(), 1).with_cancellation(token);

        let result = batch
            .run(keywords(&["a", "b", "c", "d"]), BTreeSet::from([Platform::AmazonJp]), 5)
            .await
            .expect("cancelled batch");

        assert!(result.summary.cancelled);
        assert_eq!(result.job.checkpoint, Some(1));
        assert_eq!(result.job.status, JobStatus::Running);
        assert_eq!(source.calls().len(), 2);

        let fresh = Arc::new(ScriptedSource::default());
        let resumed = orchestrator(&dir, fresh.clone(), ledger, 1)
            .resume(&result.job.job_id, false)
            .await
            .expect("resume");
        assert_eq!(
            fresh.searched(),
            vec![("c".to_string(), Platform::AmazonJp), ("d".to_string(), Platform::AmazonJp)]
        );
        assert_eq!(resumed.job.status, JobStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn ledger_write_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let batch = orchestrator(&dir, Arc::new(ScriptedSource::default()), Arc::new(BrokenLedger), 1);
        let err = batch
            .run(keywords(&["a"]), BTreeSet::from([Platform::Rakuten]), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::Ledger(_)));
    }

    #[tokio::test]
    async fn empty_inputs_are_rejected() {
        let dir = tempdir().unwrap();
        let batch = orchestrator(&dir, Arc::new(ScriptedSource::default()), file_ledger(&dir), 1);
        assert!(matches!(
            batch.run(keywords(&["  "]), BTreeSet::from([Platform::Rakuten]), 5).await,
            Err(BatchError::NoKeywords)
        ));
        assert!(matches!(
            batch.run(keywords(&["a"]), BTreeSet::new(), 5).await,
            Err(BatchError::NoPlatforms)
        ));
        assert!(matches!(
            batch.resume("batch-missing", false).await,
            Err(BatchError::UnknownJob(_))
        ));
    }

    #[test]
    fn keyword_files_are_trimmed_and_deduplicated() {
        let dir = tempdir().unwrap();
        let txt = dir.path().join("keywords.txt");
        std::fs::write(&txt, "iPhone 15\n\n  Sony A7 IV \niPhone 15\nワイヤレスイヤホン\n").unwrap();
        assert_eq!(
            load_keywords(&txt).unwrap(),
            keywords(&["iPhone 15", "Sony A7 IV", "ワイヤレスイヤホン"])
        );

        let csv = dir.path().join("keywords.csv");
        std::fs::write(&csv, "keyword,category\n\"Nintendo Switch\",games\nSony A7 IV,camera\n,empty\n").unwrap();
        assert_eq!(
            load_keywords(&csv).unwrap(),
            keywords(&["Nintendo Switch", "Sony A7 IV"])
        );

        let quoted = dir.path().join("quoted.csv");
        std::fs::write(
            &quoted,
            "keyword\n\"Sony, A7 IV\",camera\n\"Canon EOS R6, Mark II\",camera\n\"27\"\" Monitor\",display\n",
        )
        .unwrap();
        assert_eq!(
            load_keywords(&quoted).unwrap(),
            keywords(&["Sony, A7 IV", "Canon EOS R6, Mark II", "27\" Monitor"])
        );
    }

    #[test]
    fn job_ids_are_path_safe_and_stamped() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap();
        let id = new_job_id(now);
        assert!(id.starts_with("batch-20260301-093000-"));
        assert_eq!(id.len(), "batch-20260301-093000-".len() + 8);
        assert!(pricewatch_storage::validate_job_id(&id).is_ok());
    }
}

//! Artifact import: results sink -> normalizer -> matcher -> detector -> catalog.

use std::collections::BTreeSet;
use std::path::Path;

use pricewatch_storage::ResultSink;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::matcher::CanonicalMatcher;
use crate::normalize::normalize;
use crate::store::{CatalogError, CatalogStore, IngestOutcome, STALE_TEMP_AGE};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub artifacts_seen: usize,
    pub artifacts_imported: usize,
    /// Already imported on an earlier run.
    pub artifacts_skipped: usize,
    pub new_products: usize,
    /// Distinct existing products that gained a price point.
    pub updated_products: usize,
    pub price_changes: usize,
    pub rejected: usize,
    pub replayed: usize,
    /// Artifacts that could not be read; left unmarked for the next run.
    pub failed_artifacts: Vec<String>,
    pub catalog_version: u64,
}

pub struct Importer {
    sink: ResultSink,
    store: CatalogStore,
    matcher: CanonicalMatcher,
}

impl Importer {
    pub fn new(sink: ResultSink, store: CatalogStore, matcher: CanonicalMatcher) -> Self {
        Self { sink, store, matcher }
    }

    /// Import every artifact not yet recorded in the catalog. With `force`,
    /// already imported artifacts are fed through again; replays make that a no-op.
    ///
    /// The catalog is committed after each artifact, so an interrupted import
    /// resumes at the first unmarked artifact.
    pub async fn import_all(&self, force: bool) -> Result<ImportSummary, CatalogError> {
        let span = info_span!("import", sink = %self.sink.root().display(), force);
        async move {
            self.store.sweep_stale_temp_files(STALE_TEMP_AGE).await?;
            let mut catalog = self.store.load().await?;
            let mut summary = ImportSummary {
                catalog_version: catalog.version(),
                ..ImportSummary::default()
            };
            let mut created = BTreeSet::new();
            let mut updated = BTreeSet::new();

            for relative in self.sink.list_artifacts().await? {
                summary.artifacts_seen += 1;
                let key = artifact_key(&relative);
                if !force && catalog.is_imported(&key) {
                    summary.artifacts_skipped += 1;
                    continue;
                }

                let batch = match self.sink.load_batch(&relative).await {
                    Ok(batch) => batch,
                    Err(err) => {
                        warn!(artifact = %key, error = %format!("{err:#}"), "skipping unreadable artifact");
                        summary.failed_artifacts.push(key);
                        continue;
                    }
                };

                for raw in &batch.products {
                    let observation = match normalize(raw) {
                        Ok(observation) => observation,
                        Err(err) => {
                            warn!(
                                artifact = %key,
                                platform = %raw.platform,
                                title = %raw.title,
                                error = %err,
                                "rejected raw product"
                            );
                            summary.rejected += 1;
                            continue;
                        }
                    };
                    match catalog.ingest(&observation, &self.matcher) {
                        IngestOutcome::Created { canonical_id } => {
                            summary.new_products += 1;
                            created.insert(canonical_id);
                        }
                        IngestOutcome::Updated { canonical_id, change } => {
                            if change.is_some() {
                                summary.price_changes += 1;
                            }
                            if !created.contains(&canonical_id) {
                                updated.insert(canonical_id);
                            }
                        }
                        IngestOutcome::Replayed { .. } => summary.replayed += 1,
                    }
                }

                catalog.mark_imported(key);
                summary.catalog_version = self.store.commit(&mut catalog).await?;
                summary.artifacts_imported += 1;
            }

            summary.updated_products = updated.len();
            info!(
                imported = summary.artifacts_imported,
                skipped = summary.artifacts_skipped,
                new_products = summary.new_products,
                updated_products = summary.updated_products,
                price_changes = summary.price_changes,
                rejected = summary.rejected,
                replayed = summary.replayed,
                failed = summary.failed_artifacts.len(),
                "import finished"
            );
            Ok(summary)
        }
        .instrument(span)
        .await
    }
}

/// Sink-relative path with `/` separators, used as the imported-artifact key.
pub fn artifact_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

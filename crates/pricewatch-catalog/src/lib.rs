//! Canonical product catalog: normalization, cross-platform matching, price
//! change detection, durable storage and artifact import.

mod detect;
mod import;
mod matcher;
mod normalize;
mod report;
mod similarity;
mod store;

pub use detect::detect;
pub use import::{artifact_key, ImportSummary, Importer};
pub use matcher::{CanonicalMatcher, MatchDecision, MatcherConfig, TieBreak};
pub use normalize::{canonicalize_url, map_condition, normalize, parse_price_jpy, NormalizeError};
pub use report::render_markdown_report;
pub use similarity::{is_cjk, jaccard, similarity, TitleNormalizer};
pub use store::{
    canonical_id, Catalog, CatalogDocument, CatalogError, CatalogStats, CatalogStore, IngestOutcome,
    Mutation, SCHEMA_VERSION, STALE_TEMP_AGE,
};

pub const CRATE_NAME: &str = "pricewatch-catalog";

//! Core domain model for pricewatch: platforms, raw search results, normalized
//! observations, canonical products, price changes and batch job bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "pricewatch-core";

/// Marketplaces a scraper worker can search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    AmazonJp,
    Rakuten,
    Mercari,
    YahooShopping,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::AmazonJp,
        Platform::Rakuten,
        Platform::Mercari,
        Platform::YahooShopping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::AmazonJp => "amazon_jp",
            Platform::Rakuten => "rakuten",
            Platform::Mercari => "mercari",
            Platform::YahooShopping => "yahoo_shopping",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownPlatform(pub String);

impl fmt::Display for UnknownPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown platform `{}`", self.0)
    }
}

impl std::error::Error for UnknownPlatform {}

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "amazon_jp" | "amazon" => Ok(Platform::AmazonJp),
            "rakuten" => Ok(Platform::Rakuten),
            "mercari" => Ok(Platform::Mercari),
            "yahoo_shopping" | "yahoo" => Ok(Platform::YahooShopping),
            _ => Err(UnknownPlatform(s.to_string())),
        }
    }
}

/// Item condition, mostly meaningful for second-hand listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    New,
    LikeNew,
    Good,
    Acceptable,
    Poor,
    #[default]
    Unknown,
}

/// One search hit exactly as a scraper worker reported it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProduct {
    pub platform: Platform,
    pub title: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub price: Option<String>,
    pub url: String,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub review_count: Option<u32>,
    #[serde(default)]
    pub seller: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

/// Workers are inconsistent about quoting prices, so accept both `"¥1,980"` and `1980`.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(match Option::<Raw>::deserialize(deserializer)? {
        None => None,
        Some(Raw::Text(text)) => Some(text),
        Some(Raw::Integer(value)) => Some(value.to_string()),
        Some(Raw::Float(value)) => Some(value.to_string()),
    })
}

/// Results-sink artifact: everything one (keyword, platform) task found.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawProductBatch {
    pub job_id: String,
    pub keyword: String,
    pub platform: Platform,
    pub count: usize,
    pub fetched_at: DateTime<Utc>,
    pub products: Vec<RawProduct>,
}

/// Normalized, platform-scoped snapshot of one listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub platform: Platform,
    pub title: String,
    pub url: String,
    /// Whole yen.
    pub price: u64,
    pub condition: Condition,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformLink {
    pub url: String,
    pub latest_price: u64,
    pub latest_observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePoint {
    pub platform: Platform,
    pub price: u64,
    pub observed_at: DateTime<Utc>,
}

/// Deduplicated cross-platform identity of a physical product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalProduct {
    pub id: String,
    pub display_title: String,
    pub platform_links: BTreeMap<Platform, PlatformLink>,
    pub price_history: Vec<PricePoint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalProduct {
    pub fn link(&self, platform: Platform) -> Option<&PlatformLink> {
        self.platform_links.get(&platform)
    }

    pub fn latest_price(&self, platform: Platform) -> Option<u64> {
        self.link(platform).map(|link| link.latest_price)
    }

    /// Most recent history entry for `platform`, which the link must mirror.
    pub fn last_recorded(&self, platform: Platform) -> Option<&PricePoint> {
        self.price_history.iter().rev().find(|p| p.platform == platform)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub canonical_id: String,
    pub platform: Platform,
    pub old_price: u64,
    pub new_price: u64,
    /// Signed fraction, `(new - old) / old`.
    pub pct_change: f64,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub keyword: String,
    pub platform: Platform,
    pub last_error: String,
    pub attempts: u32,
}

/// Orchestration bookkeeping for one batch run, persisted between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchJob {
    pub job_id: String,
    pub keywords: Vec<String>,
    pub platforms: BTreeSet<Platform>,
    pub per_keyword_limit: usize,
    pub status: JobStatus,
    /// Index of the last keyword whose platforms all resolved.
    pub checkpoint: Option<usize>,
    #[serde(default)]
    pub failed_items: Vec<FailedItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchJob {
    pub fn new(
        job_id: impl Into<String>,
        keywords: Vec<String>,
        platforms: BTreeSet<Platform>,
        per_keyword_limit: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            keywords,
            platforms,
            per_keyword_limit,
            status: JobStatus::Pending,
            checkpoint: None,
            failed_items: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// First keyword index that still has to run.
    pub fn resume_index(&self) -> usize {
        self.checkpoint.map(|idx| idx + 1).unwrap_or(0)
    }

    pub fn is_keyword_done(&self, index: usize) -> bool {
        self.checkpoint.is_some_and(|checkpoint| index <= checkpoint)
    }

    /// Insert or replace the failure for `(keyword, platform)`.
    pub fn record_failure(&mut self, item: FailedItem) {
        self.clear_failure(&item.keyword, item.platform);
        self.failed_items.push(item);
    }

    pub fn clear_failure(&mut self, keyword: &str, platform: Platform) -> bool {
        let before = self.failed_items.len();
        self.failed_items
            .retain(|f| !(f.keyword == keyword && f.platform == platform));
        before != self.failed_items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).single().unwrap()
    }

    #[test]
    fn platform_parses_aliases_and_round_trips_names() {
        assert_eq!("amazon-jp".parse::<Platform>().unwrap(), Platform::AmazonJp);
        assert_eq!("Yahoo".parse::<Platform>().unwrap(), Platform::YahooShopping);
        assert!("qoo10".parse::<Platform>().is_err());
        for platform in Platform::ALL {
            assert_eq!(platform.as_str().parse::<Platform>().unwrap(), platform);
        }
    }

    #[test]
    fn raw_product_accepts_numeric_and_text_prices() {
        let numeric: RawProduct = serde_json::from_str(
            r#"{"platform":"rakuten","title":"x","price":1980,"url":"https://r/x","fetched_at":"2026-03-01T09:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(numeric.price.as_deref(), Some("1980"));

        let text: RawProduct = serde_json::from_str(
            r#"{"platform":"rakuten","title":"x","price":"¥1,980","url":"https://r/x","fetched_at":"2026-03-01T09:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(text.price.as_deref(), Some("¥1,980"));

        let missing: RawProduct = serde_json::from_str(
            r#"{"platform":"rakuten","title":"x","url":"https://r/x","fetched_at":"2026-03-01T09:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(missing.price, None);
    }

    #[test]
    fn failures_are_keyed_by_keyword_and_platform() {
        let mut job = BatchJob::new("job", vec!["a".into()], BTreeSet::from([Platform::Rakuten]), 5, ts());
        job.record_failure(FailedItem {
            keyword: "a".into(),
            platform: Platform::Rakuten,
            last_error: "timeout".into(),
            attempts: 3,
        });
        job.record_failure(FailedItem {
            keyword: "a".into(),
            platform: Platform::Rakuten,
            last_error: "503".into(),
            attempts: 3,
        });
        assert_eq!(job.failed_items.len(), 1);
        assert_eq!(job.failed_items[0].last_error, "503");
        assert!(job.clear_failure("a", Platform::Rakuten));
        assert!(job.failed_items.is_empty());
    }

    #[test]
    fn checkpoint_marks_prefix_done() {
        let mut job = BatchJob::new("job", vec!["a".into(), "b".into()], BTreeSet::new(), 5, ts());
        assert_eq!(job.resume_index(), 0);
        assert!(!job.is_keyword_done(0));
        job.checkpoint = Some(0);
        assert!(job.is_keyword_done(0));
        assert!(!job.is_keyword_done(1));
        assert_eq!(job.resume_index(), 1);
    }
}

//! RawProduct -> Observation boundary. Anything that cannot be represented
//! faithfully is rejected here instead of leaking into the catalog.

use std::sync::LazyLock;

use pricewatch_core::{Condition, Observation, Platform, RawProduct};
use regex::Regex;
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use url::Url;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("missing title")]
    MissingTitle,
    #[error("missing price")]
    MissingPrice,
    #[error("unparsable price `{0}`")]
    UnparsablePrice(String),
    #[error("price range `{0}` is ambiguous")]
    AmbiguousPrice(String),
    #[error("negative price `{0}`")]
    NegativePrice(String),
    #[error("invalid url `{0}`")]
    InvalidUrl(String),
}

static PRICE_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(-?)(\d[\d,]*(?:\.\d+)?)").expect("valid price regex"));

/// Parse a yen amount such as `¥1,980`, `１９８０円` or `税込 12,800円 送料無料`.
pub fn parse_price_jpy(raw: &str) -> Result<u64, NormalizeError> {
    let folded: String = raw.nfkc().collect();
    let folded = folded.trim();
    if folded.is_empty() {
        return Err(NormalizeError::MissingPrice);
    }

    let numbers: Vec<_> = PRICE_NUMBER.captures_iter(folded).collect();
    let captures = match numbers.as_slice() {
        [] => return Err(NormalizeError::UnparsablePrice(raw.to_string())),
        [only] => only,
        _ => return Err(NormalizeError::AmbiguousPrice(raw.to_string())),
    };

    if !captures[1].is_empty() {
        return Err(NormalizeError::NegativePrice(raw.to_string()));
    }

    let digits = captures[2].replace(',', "");
    if let Ok(whole) = digits.parse::<u64>() {
        return Ok(whole);
    }
    match digits.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 && value < u64::MAX as f64 => {
            Ok(value.round() as u64)
        }
        _ => Err(NormalizeError::UnparsablePrice(raw.to_string())),
    }
}

/// Strip query and fragment; Amazon listings collapse to `/dp/{ASIN}`.
pub fn canonicalize_url(platform: Platform, raw: &str) -> Result<String, NormalizeError> {
    let invalid = || NormalizeError::InvalidUrl(raw.to_string());
    let mut url = Url::parse(raw.trim()).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(invalid());
    }

    if platform == Platform::AmazonJp {
        if let Some(asin) = amazon_asin(&url) {
            return Ok(format!("https://www.amazon.co.jp/dp/{asin}"));
        }
    }

    url.set_query(None);
    url.set_fragment(None);
    let trimmed = url.path().trim_end_matches('/').to_string();
    url.set_path(&trimmed);
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn amazon_asin(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments()?.collect();
    segments.windows(2).find_map(|pair| match pair {
        ["dp", asin] | ["product", asin] if is_asin(asin) => Some(asin.to_ascii_uppercase()),
        _ => None,
    })
}

fn is_asin(candidate: &str) -> bool {
    candidate.len() == 10 && candidate.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Map free-form condition labels, including Mercari's Japanese ones.
pub fn map_condition(label: Option<&str>) -> Condition {
    let Some(label) = label else {
        return Condition::Unknown;
    };
    let folded: String = label.nfkc().collect::<String>().trim().to_lowercase();
    let folded = folded
        .strip_prefix("used")
        .map(|rest| rest.trim_start_matches([' ', '-', ':', '/']).trim())
        .filter(|rest| !rest.is_empty())
        .unwrap_or(folded.as_str());

    match folded {
        "new" | "brand new" | "新品" | "新品、未使用" | "新品未使用" => Condition::New,
        "like new" | "like_new" | "mint" | "未使用に近い" => Condition::LikeNew,
        "good" | "very good" | "目立った傷や汚れなし" => Condition::Good,
        "acceptable" | "fair" | "やや傷や汚れあり" => Condition::Acceptable,
        "poor" | "bad" | "傷や汚れあり" | "全体的に状態が悪い" => Condition::Poor,
        _ => Condition::Unknown,
    }
}

pub fn normalize(raw: &RawProduct) -> Result<Observation, NormalizeError> {
    let title = raw.title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        return Err(NormalizeError::MissingTitle);
    }
    let price = parse_price_jpy(raw.price.as_deref().ok_or(NormalizeError::MissingPrice)?)?;
    let url = canonicalize_url(raw.platform, &raw.url)?;
    let rating = raw
        .rating
        .filter(|r| r.is_finite() && (0.0..=5.0).contains(r));

    Ok(Observation {
        platform: raw.platform,
        title,
        url,
        price,
        condition: map_condition(raw.condition.as_deref()),
        rating,
        review_count: raw.review_count,
        observed_at: raw.fetched_at,
    })
}

//! Price change detection against the last recorded price on a platform.

use pricewatch_core::{Observation, PriceChange};

/// Compare an observation against the last recorded price on its platform.
///
/// No record without a prior price, when the prior price is zero (the
/// percentage is undefined) or when the price did not move.
pub fn detect(old_price: Option<u64>, observation: &Observation, canonical_id: &str) -> Option<PriceChange> {
    let old_price = old_price?;
    if old_price == 0 || old_price == observation.price {
        return None;
    }
    let pct_change = (observation.price as f64 - old_price as f64) / old_price as f64;
    Some(PriceChange {
        canonical_id: canonical_id.to_string(),
        platform: observation.platform,
        old_price,
        new_price: observation.price,
        pct_change,
        detected_at: observation.observed_at,
    })
}

//! Resolves an observation to an existing canonical product, or decides a new
//! one is needed. Resolution is read-only; the catalog applies the decision.

use std::cmp::Ordering;

use pricewatch_core::{CanonicalProduct, Observation};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::similarity::{jaccard, TitleNormalizer};
use crate::store::Catalog;

/// Which candidate wins when fuzzy scores are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    #[default]
    MostRecentlyUpdated,
    EarliestCreated,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Inclusive lower bound for a fuzzy merge.
    pub similarity_threshold: f64,
    /// Runner-up within this distance of the winner is logged as ambiguous.
    pub ambiguity_margin: f64,
    pub tie_break: TieBreak,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.82,
            ambiguity_margin: 0.02,
            tie_break: TieBreak::MostRecentlyUpdated,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    /// `(platform, url)` already linked; authoritative.
    Exact { canonical_id: String },
    Fuzzy { canonical_id: String, score: f64 },
    New,
}

#[derive(Debug, Clone, Default)]
pub struct CanonicalMatcher {
    config: MatcherConfig,
    titles: TitleNormalizer,
}

impl CanonicalMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self {
            config,
            titles: TitleNormalizer::default(),
        }
    }

    pub fn with_title_normalizer(mut self, titles: TitleNormalizer) -> Self {
        self.titles = titles;
        self
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    pub fn titles(&self) -> &TitleNormalizer {
        &self.titles
    }

    pub fn resolve(&self, observation: &Observation, catalog: &Catalog) -> MatchDecision {
        if let Some(product) = catalog.lookup_url(observation.platform, &observation.url) {
            return MatchDecision::Exact {
                canonical_id: product.id.clone(),
            };
        }

        let wanted = self.titles.tokens(&observation.title);
        let mut candidates: Vec<(f64, &CanonicalProduct)> = catalog
            .products()
            .filter(|p| p.link(observation.platform).is_none())
            .map(|p| (jaccard(&wanted, &self.titles.tokens(&p.display_title)), p))
            .filter(|(score, _)| *score >= self.config.similarity_threshold)
            .collect();

        candidates.sort_by(|(score_a, a), (score_b, b)| {
            score_b
                .partial_cmp(score_a)
                .unwrap_or(Ordering::Equal)
                .then_with(|| self.tie_break(a, b))
                .then_with(|| a.id.cmp(&b.id))
        });

        let Some((score, best)) = candidates.first() else {
            return MatchDecision::New;
        };
        if let Some((runner_score, runner)) = candidates.get(1) {
            if score - runner_score <= self.config.ambiguity_margin {
                warn!(
                    title = %observation.title,
                    platform = %observation.platform,
                    chosen = %best.id,
                    chosen_score = score,
                    runner_up = %runner.id,
                    runner_up_score = runner_score,
                    "ambiguous canonical match"
                );
            }
        }

        MatchDecision::Fuzzy {
            canonical_id: best.id.clone(),
            score: *score,
        }
    }

    fn tie_break(&self, a: &CanonicalProduct, b: &CanonicalProduct) -> Ordering {
        match self.config.tie_break {
            TieBreak::MostRecentlyUpdated => b.updated_at.cmp(&a.updated_at),
            TieBreak::EarliestCreated => a.created_at.cmp(&b.created_at),
        }
    }
}

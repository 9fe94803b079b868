//! Hybrid ranking: score fusion and the store-agnostic search pipeline.
//!
//! # Algorithm
//!
//! 1. Embed the query with the configured [`EmbeddingProvider`].
//! 2. Fetch the top `N = max(k * multiplier, min_candidates)` chunks by
//!    cosine similarity.
//! 3. Independently fetch up to `N` chunks by keyword overlap.
//! 4. Union both sets by `chunk_id`; a chunk missing from one channel scores
//!    0 there. Fuse with [`hybrid_score`].
//! 5. Sort by fused score descending, then `chunk_id` ascending; keep `k`.
//!
//! [`search`] never returns an error. Provider failures degrade to keyword
//! scoring, a store that holds vectors of the wrong dimension reports
//! [`SearchOutcome::DimensionMismatch`], and store failures report
//! [`SearchOutcome::Unavailable`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::{EmbedPurpose, EmbeddingProvider};
use crate::error::{ConfigError, StoreError};
use crate::keyword::query_terms;
use crate::models::SearchResult;
use crate::store::{check_dimensions, ChunkCandidate, KnowledgeStore};

pub const DEFAULT_SEMANTIC_WEIGHT: f64 = 0.7;
pub const DEFAULT_KEYWORD_WEIGHT: f64 = 0.3;
pub const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Validated pair of fusion weights summing to 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FusionWeights {
    semantic: f64,
    keyword: f64,
}

impl FusionWeights {
    pub const SEMANTIC_ONLY: FusionWeights = FusionWeights {
        semantic: 1.0,
        keyword: 0.0,
    };
    pub const KEYWORD_ONLY: FusionWeights = FusionWeights {
        semantic: 0.0,
        keyword: 1.0,
    };

    /// Rejects negative, non-finite, or non-normalized weights. Weights are
    /// never silently renormalized.
    pub fn new(semantic: f64, keyword: f64) -> Result<Self, ConfigError> {
        if !semantic.is_finite() || !keyword.is_finite() || semantic < 0.0 || keyword < 0.0 {
            return Err(ConfigError::InvalidWeight { semantic, keyword });
        }
        let sum = semantic + keyword;
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::WeightsDoNotSumToOne {
                semantic,
                keyword,
                sum,
            });
        }
        Ok(Self { semantic, keyword })
    }

    pub fn semantic(&self) -> f64 {
        self.semantic
    }

    pub fn keyword(&self) -> f64 {
        self.keyword
    }
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            semantic: DEFAULT_SEMANTIC_WEIGHT,
            keyword: DEFAULT_KEYWORD_WEIGHT,
        }
    }
}

/// Fuses two component scores. Inputs are clamped to `[0, 1]`, so the result
/// is in `[0, 1]` and non-decreasing in each component.
pub fn hybrid_score(semantic: f64, keyword: f64, weights: FusionWeights) -> f64 {
    let s = clamp_unit(semantic);
    let k = clamp_unit(keyword);
    clamp_unit(weights.semantic * s + weights.keyword * k)
}

fn clamp_unit(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Hybrid,
    Semantic,
    Keyword,
}

impl SearchMode {
    /// Weights actually used for a mode: semantic and keyword modes pin the
    /// weight pair, hybrid uses the configured one.
    pub fn effective_weights(&self, configured: FusionWeights) -> FusionWeights {
        match self {
            SearchMode::Hybrid => configured,
            SearchMode::Semantic => FusionWeights::SEMANTIC_ONLY,
            SearchMode::Keyword => FusionWeights::KEYWORD_ONLY,
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SearchMode::Hybrid => "hybrid",
            SearchMode::Semantic => "semantic",
            SearchMode::Keyword => "keyword",
        })
    }
}

impl FromStr for SearchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hybrid" => Ok(SearchMode::Hybrid),
            "semantic" => Ok(SearchMode::Semantic),
            "keyword" => Ok(SearchMode::Keyword),
            _ => Err(ConfigError::UnknownSearchMode(s.to_string())),
        }
    }
}

/// Tuning that comes from configuration rather than from the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub weights: FusionWeights,
    pub min_candidates: usize,
    pub candidate_multiplier: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            weights: FusionWeights::default(),
            min_candidates: 20,
            candidate_multiplier: 4,
        }
    }
}

impl SearchParams {
    /// Candidates fetched per channel for a final list of `k`.
    pub fn candidate_pool(&self, k: usize) -> usize {
        k.saturating_mul(self.candidate_multiplier)
            .max(self.min_candidates)
            .max(k)
    }
}

/// One search call.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub k: usize,
    pub mode: SearchMode,
    pub category: Option<&'a str>,
}

impl<'a> SearchRequest<'a> {
    pub fn new(query: &'a str, k: usize) -> Self {
        Self {
            query,
            k,
            mode: SearchMode::Hybrid,
            category: None,
        }
    }
}

/// What a search produced. Callers must handle every variant; none of them
/// is an error in the `Result` sense.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SearchOutcome {
    Ranked {
        results: Vec<SearchResult>,
    },
    /// The semantic channel was unavailable; results use keyword scoring only.
    KeywordOnly {
        results: Vec<SearchResult>,
        reason: String,
    },
    /// Stored vectors do not match the provider. Search is blocked until the
    /// corpus is re-embedded.
    DimensionMismatch {
        configured: usize,
        stored: Vec<usize>,
    },
    /// The store could not be read.
    Unavailable {
        reason: String,
    },
}

impl SearchOutcome {
    /// Ranked results, or an empty slice for the blocking outcomes.
    pub fn results(&self) -> &[SearchResult] {
        match self {
            SearchOutcome::Ranked { results } | SearchOutcome::KeywordOnly { results, .. } => {
                results
            }
            _ => &[],
        }
    }

    pub fn is_degraded(&self) -> bool {
        !matches!(self, SearchOutcome::Ranked { .. })
    }
}

impl From<StoreError> for SearchOutcome {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DimensionMismatch { configured, stored } => {
                SearchOutcome::DimensionMismatch { configured, stored }
            }
            other => SearchOutcome::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

/// Unions two candidate channels and returns the top `k` fused results.
///
/// Pure function: the same inputs always give the same ordered output.
pub fn fuse_candidates(
    semantic: &[ChunkCandidate],
    keyword: &[ChunkCandidate],
    weights: FusionWeights,
    k: usize,
) -> Vec<SearchResult> {
    let mut merged: BTreeMap<&str, (f64, f64, &ChunkCandidate)> = BTreeMap::new();
    for c in semantic {
        merged.insert(c.chunk_id.as_str(), (clamp_unit(c.raw_score), 0.0, c));
    }
    for c in keyword {
        merged
            .entry(c.chunk_id.as_str())
            .and_modify(|e| e.1 = clamp_unit(c.raw_score))
            .or_insert((0.0, clamp_unit(c.raw_score), c));
    }

    let mut results: Vec<SearchResult> = merged
        .into_values()
        .map(|(s, kw, c)| SearchResult {
            chunk_id: c.chunk_id.clone(),
            score: hybrid_score(s, kw, weights),
            semantic_score: s,
            keyword_score: kw,
            question: c.question.clone(),
            answer: c.answer.clone(),
            category: c.category.clone(),
            subcategory: c.subcategory.clone(),
            location: c.location.clone(),
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(k);
    results
}

/// Runs a hybrid search against a [`KnowledgeStore`] backend.
///
/// This is the function every frontend (CLI, library callers) delegates to.
pub async fn search<S>(
    store: &S,
    provider: &dyn EmbeddingProvider,
    req: &SearchRequest<'_>,
    params: &SearchParams,
) -> SearchOutcome
where
    S: KnowledgeStore + ?Sized,
{
    if req.query.trim().is_empty() || req.k == 0 {
        return SearchOutcome::Ranked {
            results: Vec::new(),
        };
    }

    let census = match store.dimension_census().await {
        Ok(c) => c,
        Err(e) => return e.into(),
    };
    let dimension_check = if provider.is_enabled() {
        check_dimensions(&census, provider.dims())
    } else if census.len() > 1 {
        check_dimensions(&census, 0)
    } else {
        Ok(())
    };
    if let Err(e) = dimension_check {
        warn!(error = %e, "search blocked by embedding dimension mismatch");
        return e.into();
    }

    let pool = params.candidate_pool(req.k);
    let terms = query_terms(req.query);
    let mut degraded: Option<String> = None;

    let semantic = if req.mode == SearchMode::Keyword {
        Vec::new()
    } else if !provider.is_enabled() {
        degraded = Some("embedding provider disabled".to_string());
        Vec::new()
    } else {
        match provider.embed(req.query, EmbedPurpose::Query).await {
            Ok(qv) => match store.top_k_by_similarity(&qv, pool, req.category).await {
                Ok(c) => c,
                Err(e) => return e.into(),
            },
            Err(e) => {
                warn!(error = %e, "query embedding failed; falling back to keyword scoring");
                degraded = Some(e.to_string());
                Vec::new()
            }
        }
    };

    let keyword = if req.mode == SearchMode::Semantic && degraded.is_none() {
        Vec::new()
    } else {
        match store.keyword_match(&terms, pool, req.category).await {
            Ok(c) => c,
            Err(e) => return e.into(),
        }
    };

    debug!(
        semantic = semantic.len(),
        keyword = keyword.len(),
        pool,
        mode = %req.mode,
        "fusing candidates"
    );

    match degraded {
        None => SearchOutcome::Ranked {
            results: fuse_candidates(
                &semantic,
                &keyword,
                req.mode.effective_weights(params.weights),
                req.k,
            ),
        },
        Some(reason) => SearchOutcome::KeywordOnly {
            results: fuse_candidates(&[], &keyword, FusionWeights::KEYWORD_ONLY, req.k),
            reason,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(id: &str, score: f64) -> ChunkCandidate {
        ChunkCandidate {
            chunk_id: id.into(),
            raw_score: score,
            question: format!("q {id}"),
            answer: format!("a {id}"),
            category: "General".into(),
            subcategory: "General".into(),
            location: None,
        }
    }

    #[test]
    fn weights_must_sum_to_one() {
        assert!(FusionWeights::new(0.7, 0.3).is_ok());
        assert!(FusionWeights::new(0.5, 0.5000001).is_ok());
        assert!(matches!(
            FusionWeights::new(0.7, 0.7),
            Err(ConfigError::WeightsDoNotSumToOne { .. })
        ));
        assert!(matches!(
            FusionWeights::new(1.2, -0.2),
            Err(ConfigError::InvalidWeight { .. })
        ));
        assert!(FusionWeights::new(f64::NAN, 0.5).is_err());
    }

    #[test]
    fn hybrid_score_is_bounded_and_monotonic() {
        let grid = [0.0, 0.1, 0.25, 0.5, 0.75, 0.9, 1.0];
        for w in [0.0, 0.3, 0.5, 0.7, 1.0] {
            let weights = FusionWeights::new(w, 1.0 - w).unwrap();
            for &s in &grid {
                for &k in &grid {
                    let h = hybrid_score(s, k, weights);
                    assert!((0.0..=1.0).contains(&h));
                    assert!(hybrid_score((s + 0.1).min(1.0), k, weights) >= h);
                    assert!(hybrid_score(s, (k + 0.1).min(1.0), weights) >= h);
                }
            }
        }
    }

    #[test]
    fn hybrid_score_clamps_out_of_range_inputs() {
        let w = FusionWeights::default();
        assert_eq!(hybrid_score(-0.4, 0.0, w), 0.0);
        assert!((hybrid_score(1.5, 1.0, w) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn candidate_pool_has_floor() {
        let p = SearchParams::default();
        assert_eq!(p.candidate_pool(3), 20);
        assert_eq!(p.candidate_pool(10), 40);
    }

    #[test]
    fn fusion_keeps_keyword_only_matches() {
        let semantic = vec![cand("faq", 0.8), cand("hours", 0.6)];
        let keyword = vec![cand("contact", 1.0)];
        let results = fuse_candidates(&semantic, &keyword, FusionWeights::default(), 5);
        let ids: Vec<_> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["faq", "hours", "contact"]);
        let contact = &results[2];
        assert_eq!(contact.semantic_score, 0.0);
        assert!((contact.score - 0.3).abs() < 1e-12);
    }

    #[test]
    fn fusion_adds_both_components() {
        let results = fuse_candidates(
            &[cand("a", 0.5)],
            &[cand("a", 1.0)],
            FusionWeights::default(),
            5,
        );
        assert_eq!(results.len(), 1);
        assert!((results[0].score - (0.7 * 0.5 + 0.3)).abs() < 1e-12);
    }

    #[test]
    fn fusion_breaks_ties_by_chunk_id() {
        let semantic = vec![cand("b", 0.5), cand("c", 0.5), cand("a", 0.5)];
        let results = fuse_candidates(&semantic, &[], FusionWeights::default(), 2);
        let ids: Vec<_> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn mode_parsing_and_weights() {
        assert_eq!("Keyword".parse::<SearchMode>().unwrap(), SearchMode::Keyword);
        assert!("fuzzy".parse::<SearchMode>().is_err());
        assert_eq!(
            SearchMode::Semantic.effective_weights(FusionWeights::default()),
            FusionWeights::SEMANTIC_ONLY
        );
    }
}

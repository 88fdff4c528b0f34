//! Hybrid (semantic + keyword) search over a [`FactStore`].
//!
//! # Scoring
//!
//! 1. Fetch `top_k × candidate_multiplier` semantic candidates from the store.
//! 2. Extract query keywords: drop stop words and short tokens, de-duplicate
//!    in order.
//! 3. Score each candidate's keywords (see [`keyword_score`]). Keyword scores
//!    below `min_keyword_score` are zeroed.
//! 4. Combine: `hybrid = semantic_weight × semantic + keyword_weight × keyword`.
//! 5. Sort by hybrid score, drop exact duplicates (content hash) and near
//!    duplicates (word-set Jaccard above `near_duplicate_threshold`),
//!    keeping the higher-ranked copy.
//! 6. Truncate to `top_k` and assign ranks.
//!
//! If anything in that pipeline fails, the engine retries as a plain
//! semantic search and only returns an empty list when that fails too.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;

use crate::config::HybridConfig;
use crate::models::{assign_ranks, SearchResult};
use crate::store::{FactStore, SearchFilters};
use crate::text;

/// Upper bound on the repeat-count boost for a single keyword.
const MAX_REPEAT_BOOST: f64 = 2.0;
/// Boost applied when the keyword appears in the source label.
const SOURCE_BOOST: f64 = 2.0;
/// Weight of a partial (substring) match relative to a verbatim one.
const PARTIAL_MATCH_WEIGHT: f64 = 0.5;
/// Per-keyword score that maps to a keyword score of 1.0.
const KEYWORD_SATURATION: f64 = 2.0;

/// Keyword relevance of `content` (with source label `source`) in `[0, 1]`.
///
/// Each keyword contributes:
/// - verbatim match: `(1 + ln count)` capped at [`MAX_REPEAT_BOOST`], doubled
///   when the keyword also appears in the source label;
/// - otherwise, the best substring overlap ratio against any content token,
///   at half weight.
///
/// The mean contribution is divided by [`KEYWORD_SATURATION`] and clamped.
pub fn keyword_score(keywords: &[String], content: &str, source: &str) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let tokens = text::tokenize(content);
    if tokens.is_empty() {
        return 0.0;
    }
    let source_lower = source.to_lowercase();

    let total: f64 = keywords
        .iter()
        .map(|kw| {
            let count = tokens.iter().filter(|t| *t == kw).count();
            if count > 0 {
                let repeat = (1.0 + (count as f64).ln()).min(MAX_REPEAT_BOOST);
                let source_boost = if source_lower.contains(kw.as_str()) {
                    SOURCE_BOOST
                } else {
                    1.0
                };
                repeat * source_boost
            } else {
                PARTIAL_MATCH_WEIGHT * best_partial_overlap(kw, &tokens)
            }
        })
        .sum();

    (total / keywords.len() as f64 / KEYWORD_SATURATION).clamp(0.0, 1.0)
}

/// Best `shorter / longer` length ratio over tokens that contain, or are
/// contained in, `keyword`. Tokens under three chars are ignored.
fn best_partial_overlap(keyword: &str, tokens: &[String]) -> f64 {
    let kw_len = keyword.chars().count();
    tokens
        .iter()
        .filter(|t| t.chars().count() >= 3)
        .filter(|t| t.contains(keyword) || keyword.contains(t.as_str()))
        .map(|t| {
            let t_len = t.chars().count();
            kw_len.min(t_len) as f64 / kw_len.max(t_len) as f64
        })
        .fold(0.0, f64::max)
}

/// Drop exact duplicates, then near-duplicates whose word-set Jaccard
/// similarity to an already-kept result exceeds `threshold`. Input order is
/// preserved, so the first (highest-ranked) copy always survives.
pub fn deduplicate(results: Vec<SearchResult>, threshold: f64) -> Vec<SearchResult> {
    let mut seen_hashes = HashSet::new();
    let mut kept_sets: Vec<HashSet<String>> = Vec::new();
    let mut kept = Vec::new();

    for r in results {
        if !seen_hashes.insert(r.content_key()) {
            continue;
        }
        let words = text::word_set(&r.content);
        if kept_sets
            .iter()
            .any(|k| text::jaccard(k, &words) > threshold)
        {
            continue;
        }
        kept_sets.push(words);
        kept.push(r);
    }
    kept
}

/// Sort results by hybrid score, best first.
pub fn sort_by_hybrid(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.hybrid_score
            .partial_cmp(&a.hybrid_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

pub struct HybridSearchEngine {
    store: Arc<dyn FactStore>,
    config: HybridConfig,
}

impl HybridSearchEngine {
    pub fn new(store: Arc<dyn FactStore>, config: HybridConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &HybridConfig {
        &self.config
    }

    pub fn extract_keywords(&self, query: &str) -> Vec<String> {
        text::extract_keywords(query, self.config.min_keyword_length)
    }

    /// Weighted sum of semantic and keyword scores. Keyword scores below
    /// `min_keyword_score` count as zero.
    pub fn combine(&self, semantic: f64, keyword: f64) -> f64 {
        let keyword = if keyword < self.config.min_keyword_score {
            0.0
        } else {
            keyword
        };
        self.config.semantic_weight * semantic + self.config.keyword_weight * keyword
    }

    /// Hybrid-ranked search. Never fails: on error it degrades to semantic
    /// ranking, then to an empty list.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&SearchFilters>,
    ) -> Vec<SearchResult> {
        match self.try_search(query, top_k, filters).await {
            Ok(results) => results,
            Err(e) => {
                tracing::warn!(error = %e, query, "hybrid search failed, falling back to semantic");
                self.semantic_only(query, top_k, filters).await
            }
        }
    }

    async fn try_search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&SearchFilters>,
    ) -> Result<Vec<SearchResult>> {
        let fetch = top_k.saturating_mul(self.config.candidate_multiplier.max(1));
        let hits = self.store.search(query, fetch, filters).await?;
        let keywords = self.extract_keywords(query);

        let mut results: Vec<SearchResult> = hits
            .into_iter()
            .map(|hit| {
                let mut r = SearchResult::from_hit(hit);
                r.keyword_score = keyword_score(&keywords, &r.content, &r.source);
                r.hybrid_score = self.combine(r.semantic_score, r.keyword_score);
                r
            })
            .collect();

        sort_by_hybrid(&mut results);
        let mut results = deduplicate(results, self.config.near_duplicate_threshold);
        results.truncate(top_k);
        assign_ranks(&mut results);
        Ok(results)
    }

    /// Store-ranked semantic results with no keyword fusion.
    pub async fn semantic_only(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&SearchFilters>,
    ) -> Vec<SearchResult> {
        match self.store.search(query, top_k, filters).await {
            Ok(hits) => {
                let mut results: Vec<SearchResult> =
                    hits.into_iter().map(SearchResult::from_hit).collect();
                sort_by_hybrid(&mut results);
                assign_ranks(&mut results);
                results
            }
            Err(e) => {
                tracing::warn!(error = %e, query, "semantic search failed");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Fact, FactHit, Metadata};
    use crate::store::memory::InMemoryFactStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn kws(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn result(content: &str, hybrid: f64) -> SearchResult {
        SearchResult {
            content: content.to_string(),
            metadata: Metadata::new(),
            semantic_score: hybrid,
            keyword_score: 0.0,
            hybrid_score: hybrid,
            rerank_score: None,
            rank: 0,
            source: String::new(),
            chunk_index: None,
        }
    }

    #[test]
    fn test_keyword_score_verbatim_vs_absent() {
        let k = kws(&["redis", "port"]);
        let full = keyword_score(&k, "Redis default port is 6379", "");
        let half = keyword_score(&k, "Redis is an in-memory store", "");
        let none = keyword_score(&k, "Kubernetes schedules pods", "");
        assert!((full - 0.5).abs() < 1e-9);
        assert!((half - 0.25).abs() < 1e-9);
        assert_eq!(none, 0.0);
    }

    #[test]
    fn test_keyword_score_source_boost() {
        let k = kws(&["redis"]);
        let plain = keyword_score(&k, "redis config", "docs/cache.md");
        let boosted = keyword_score(&k, "redis config", "docs/redis.md");
        assert!((boosted - 2.0 * plain).abs() < 1e-9);
    }

    #[test]
    fn test_keyword_score_repeat_boost_is_capped() {
        let k = kws(&["redis"]);
        let once = keyword_score(&k, "redis", "");
        let twice = keyword_score(&k, "redis redis", "");
        let many = keyword_score(&k, &"redis ".repeat(50), "");
        assert!(twice > once);
        assert!((many - MAX_REPEAT_BOOST / KEYWORD_SATURATION).abs() < 1e-9);
    }

    #[test]
    fn test_keyword_score_partial_match_half_weight() {
        let k = kws(&["cache"]);
        let verbatim = keyword_score(&k, "cache layer", "");
        let partial = keyword_score(&k, "caches layer", "");
        assert!(partial > 0.0);
        assert!(partial < verbatim * PARTIAL_MATCH_WEIGHT + 1e-9);
    }

    fn engine(store: Arc<dyn FactStore>) -> HybridSearchEngine {
        HybridSearchEngine::new(store, HybridConfig::default())
    }

    #[test]
    fn test_combine_is_monotone() {
        let e = engine(Arc::new(InMemoryFactStore::new()));
        let steps: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        for &s in &steps {
            for &k in &steps {
                let base = e.combine(s, k);
                assert!(e.combine((s + 0.05).min(1.0), k) >= base);
                assert!(e.combine(s, (k + 0.05).min(1.0)) >= base);
            }
        }
    }

    #[test]
    fn test_combine_zeroes_weak_keyword_scores() {
        let e = engine(Arc::new(InMemoryFactStore::new()));
        assert!((e.combine(1.0, 0.05) - 0.7).abs() < 1e-9);
        assert!((e.combine(1.0, 0.5) - 0.85).abs() < 1e-9);
    }

    #[test]
    fn test_deduplicate_exact_and_near() {
        let results = vec![
            result("the redis default port is 6379", 0.9),
            result("the redis default port is 6379", 0.8),
            result("The Redis default port is 6379!", 0.7),
            result("kubernetes schedules pods", 0.6),
        ];
        let kept = deduplicate(results, 0.9);
        assert_eq!(kept.len(), 2);
        assert!((kept[0].hybrid_score - 0.9).abs() < 1e-9);
        assert_eq!(kept[1].content, "kubernetes schedules pods");
    }

    #[tokio::test]
    async fn test_search_ranks_keyword_matches_higher() {
        let store = Arc::new(InMemoryFactStore::new());
        let mut m = Metadata::new();
        m.insert("source".into(), "docs/redis.md".into());
        store
            .store_fact("redis default port 6379 redis port", &m)
            .await
            .unwrap();
        store
            .store_fact("default settings for the port scanner", &Metadata::new())
            .await
            .unwrap();

        let e = engine(store);
        let results = e.search("redis default port", 5, None).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rank, 1);
        assert_eq!(results[0].source, "docs/redis.md");
        assert!(results[0].hybrid_score > results[1].hybrid_score);
    }

    struct FlakyStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FactStore for FlakyStore {
        async fn store_fact(&self, _text: &str, _metadata: &Metadata) -> Result<String> {
            Ok("id".into())
        }
        async fn delete_fact(&self, _id: &str) -> Result<()> {
            Ok(())
        }
        async fn get_all_facts(&self) -> Result<Vec<Fact>> {
            Ok(vec![])
        }
        async fn search(
            &self,
            _query: &str,
            _top_k: usize,
            _filters: Option<&SearchFilters>,
        ) -> Result<Vec<FactHit>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("transient store error");
            }
            Ok(vec![FactHit {
                fact: Fact {
                    id: "f1".into(),
                    text: "semantic only".into(),
                    metadata: Metadata::new(),
                },
                score: 0.42,
            }])
        }
    }

    #[tokio::test]
    async fn test_search_falls_back_to_semantic_only() {
        let store = Arc::new(FlakyStore {
            calls: AtomicUsize::new(0),
        });
        let e = engine(store);
        let results = e.search("anything", 3, None).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].keyword_score, 0.0);
        assert!((results[0].hybrid_score - 0.42).abs() < 1e-9);
    }
}

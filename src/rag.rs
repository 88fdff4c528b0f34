//! Multi-stage retrieval: classify, expand, retrieve, diversify, rerank,
//! assemble.
//!
//! [`RagOptimizer::advanced_search`] runs the whole pipeline under a timeout
//! and reports per-stage accounting in [`RagMetrics`]. Collaborator failures
//! inside the pipeline degrade the affected stage instead of failing the
//! call. Only the timeout surfaces as an error, and
//! [`RagOptimizer::search_with_fallback`] turns that into a plain fact-store
//! search.
//!
//! # Pipeline
//!
//! | Stage | What happens |
//! |-------|--------------|
//! | Classify | Keyword-set membership picks a [`QueryType`]; complexity picks the context budget. |
//! | Expand | Up to five variants: the original, synonym substitutions, one domain-qualified form. |
//! | Retrieve | Semantic fetch per variant plus a keyword fetch over the full corpus, merged by content hash. |
//! | Diversify | Greedy: keep a candidate only if its Jaccard similarity to every kept one is below the threshold. |
//! | Rerank | Cross-encoder blend, or a deterministic term-overlap blend when no reranker answers. |
//! | Assemble | Truncate to `max_results`, widened to the target chunk count for high-quality candidates. |

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::Mutex;

use crate::config::{HybridConfig, RagConfig};
use crate::embedding::EmbeddingGateway;
use crate::error::EngineError;
use crate::hybrid::{self, HybridSearchEngine};
use crate::models::{assign_ranks, FactHit, QueryContext, QueryType, RagMetrics, SearchResult};
use crate::store::{matches_filters, FactStore, SearchFilters};
use crate::text;

const MAX_VARIANTS: usize = 5;

const TECHNICAL_TERMS: &[&str] = &[
    "api",
    "algorithm",
    "architecture",
    "cache",
    "class",
    "code",
    "config",
    "configuration",
    "database",
    "endpoint",
    "function",
    "http",
    "implementation",
    "json",
    "latency",
    "memory",
    "method",
    "performance",
    "port",
    "protocol",
    "query",
    "schema",
    "server",
    "sql",
];

const PROCEDURAL_TERMS: &[&str] = &[
    "configure",
    "create",
    "deploy",
    "guide",
    "how",
    "install",
    "procedure",
    "process",
    "setup",
    "step",
    "steps",
    "tutorial",
];

const TROUBLESHOOTING_TERMS: &[&str] = &[
    "broken",
    "bug",
    "crash",
    "debug",
    "error",
    "exception",
    "fail",
    "failed",
    "failing",
    "fix",
    "issue",
    "problem",
    "troubleshoot",
    "wrong",
];

const TECHNICAL_SYNONYMS: &[(&str, &str)] = &[
    ("api", "interface"),
    ("config", "configuration"),
    ("configuration", "settings"),
    ("database", "datastore"),
    ("default", "standard"),
    ("function", "method"),
    ("performance", "latency"),
    ("server", "service"),
];

const PROCEDURAL_SYNONYMS: &[(&str, &str)] = &[
    ("configure", "set up"),
    ("create", "build"),
    ("deploy", "release"),
    ("install", "setup"),
    ("setup", "installation"),
    ("how", "steps"),
];

const TROUBLESHOOTING_SYNONYMS: &[(&str, &str)] = &[
    ("broken", "not working"),
    ("crash", "failure"),
    ("error", "failure"),
    ("fix", "resolve"),
    ("issue", "problem"),
    ("problem", "issue"),
];

const GENERAL_SYNONYMS: &[(&str, &str)] = &[
    ("about", "regarding"),
    ("explain", "describe"),
    ("overview", "summary"),
];

fn category_terms(query_type: QueryType) -> &'static [&'static str] {
    match query_type {
        QueryType::Technical => TECHNICAL_TERMS,
        QueryType::Procedural => PROCEDURAL_TERMS,
        QueryType::Troubleshooting => TROUBLESHOOTING_TERMS,
        QueryType::General => &[],
    }
}

fn synonyms(query_type: QueryType) -> &'static [(&'static str, &'static str)] {
    match query_type {
        QueryType::Technical => TECHNICAL_SYNONYMS,
        QueryType::Procedural => PROCEDURAL_SYNONYMS,
        QueryType::Troubleshooting => TROUBLESHOOTING_SYNONYMS,
        QueryType::General => GENERAL_SYNONYMS,
    }
}

fn domain_variant(query: &str, query_type: QueryType) -> String {
    match query_type {
        QueryType::Technical => format!("{} technical documentation", query),
        QueryType::Procedural => format!("step by step {}", query),
        QueryType::Troubleshooting => format!("{} solution", query),
        QueryType::General => format!("{} overview", query),
    }
}

/// Classify a query. Categories are checked in precedence order
/// technical, procedural, troubleshooting; anything else is general.
pub fn classify_query(query: &str) -> QueryType {
    let tokens = text::tokenize(query);
    let has_any = |set: &[&str]| tokens.iter().any(|t| set.contains(&t.as_str()));

    if has_any(TECHNICAL_TERMS) {
        QueryType::Technical
    } else if has_any(PROCEDURAL_TERMS) {
        QueryType::Procedural
    } else if has_any(TROUBLESHOOTING_TERMS) {
        QueryType::Troubleshooting
    } else {
        QueryType::General
    }
}

/// Category complexity, raised by 0.1 for long queries (more than ten
/// words) and by 0.1 when over 30% of the words are category terms.
pub fn query_complexity(query: &str, query_type: QueryType) -> f64 {
    let tokens = text::tokenize(query);
    let mut complexity = query_type.base_complexity();
    if tokens.len() > 10 {
        complexity += 0.1;
    }
    if !tokens.is_empty() {
        let terms = category_terms(query_type);
        let hits = tokens.iter().filter(|t| terms.contains(&t.as_str())).count();
        if hits as f64 / tokens.len() as f64 > 0.3 {
            complexity += 0.1;
        }
    }
    complexity.min(1.0)
}

/// `(target_context_length, target_chunks)` for a complexity score.
pub fn context_budget(complexity: f64) -> (usize, usize) {
    if complexity < 0.4 {
        (2000, 3)
    } else if complexity < 0.7 {
        (4000, 5)
    } else {
        (8000, 8)
    }
}

/// Query variants, original first, de-duplicated case-insensitively and
/// capped at five.
pub fn expand_query(query: &str, query_type: QueryType) -> Vec<String> {
    let original = query.trim().to_string();
    let tokens = text::tokenize(&original);

    let mut candidates = vec![original.clone()];
    for (word, replacement) in synonyms(query_type) {
        if tokens.iter().any(|t| t == word) {
            let substituted: Vec<&str> = tokens
                .iter()
                .map(|t| if t == word { *replacement } else { t.as_str() })
                .collect();
            candidates.push(substituted.join(" "));
        }
    }
    let domain = domain_variant(&original, query_type);

    let mut seen = HashSet::new();
    let mut variants: Vec<String> = candidates
        .into_iter()
        .filter(|v| !v.is_empty() && seen.insert(v.to_lowercase()))
        .take(MAX_VARIANTS - 1)
        .collect();
    if seen.insert(domain.to_lowercase()) {
        variants.push(domain);
    }
    variants
}

/// Build the [`QueryContext`] for a query.
pub fn analyze_query(query: &str) -> QueryContext {
    let query_type = classify_query(query);
    let complexity = query_complexity(query, query_type);
    let (target_context_length, target_chunks) = context_budget(complexity);
    QueryContext {
        original: query.to_string(),
        variants: expand_query(query, query_type),
        query_type,
        complexity,
        target_context_length,
        target_chunks,
    }
}

/// Greedy diversification. The first result is always kept; later ones are
/// kept only while their word-set Jaccard similarity to every kept result is
/// below `threshold`, up to `max` results.
pub fn diversify(results: Vec<SearchResult>, threshold: f64, max: usize) -> Vec<SearchResult> {
    let mut kept: Vec<SearchResult> = Vec::new();
    let mut kept_sets: Vec<HashSet<String>> = Vec::new();
    for r in results {
        if kept.len() >= max.max(1) {
            break;
        }
        let words = text::word_set(&r.content);
        if kept_sets.iter().all(|k| text::jaccard(k, &words) < threshold) {
            kept_sets.push(words);
            kept.push(r);
        }
    }
    kept
}

/// Fraction of query keywords present in `content`.
fn term_match(keywords: &[String], content: &str) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let words = text::word_set(content);
    keywords.iter().filter(|k| words.contains(*k)).count() as f64 / keywords.len() as f64
}

fn squash(score: f32) -> f64 {
    let s = score as f64;
    if (0.0..=1.0).contains(&s) {
        s
    } else {
        1.0 / (1.0 + (-s).exp())
    }
}

fn sort_by_final(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.final_score()
            .partial_cmp(&a.final_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Parameters of one advanced search.
#[derive(Debug, Clone)]
pub struct AdvancedSearchRequest {
    pub query: String,
    pub max_results: usize,
    pub enable_rerank: bool,
    /// Minimum semantic score for a candidate to be considered.
    pub score_threshold: Option<f64>,
    pub filters: Option<SearchFilters>,
    /// Overrides `rag.search_timeout_ms`.
    pub timeout: Option<Duration>,
}

impl AdvancedSearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            max_results: 10,
            enable_rerank: true,
            score_threshold: None,
            filters: None,
            timeout: None,
        }
    }

    pub fn max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }

    pub fn rerank(mut self, enabled: bool) -> Self {
        self.enable_rerank = enabled;
        self
    }

    pub fn score_threshold(mut self, threshold: f64) -> Self {
        self.score_threshold = Some(threshold);
        self
    }

    pub fn filters(mut self, filters: SearchFilters) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey {
            query: self.query.clone(),
            max_results: self.max_results,
            enable_rerank: self.enable_rerank,
            score_threshold: self.score_threshold.map(f64::to_bits),
            filters: self
                .filters
                .as_ref()
                .map(|f| serde_json::Value::Object(f.clone()).to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    max_results: usize,
    enable_rerank: bool,
    score_threshold: Option<u64>,
    filters: Option<String>,
}

struct CacheEntry {
    results: Vec<SearchResult>,
    seq: u64,
}

/// Size-bounded result cache. Once over capacity, the oldest 20% of entries
/// (by insertion order) are dropped.
struct ResultCache {
    entries: HashMap<CacheKey, CacheEntry>,
    capacity: usize,
    next_seq: u64,
}

impl ResultCache {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            next_seq: 0,
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Vec<SearchResult>> {
        self.entries.get(key).map(|e| e.results.clone())
    }

    fn insert(&mut self, key: CacheKey, results: Vec<SearchResult>) {
        if self.capacity == 0 {
            return;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, CacheEntry { results, seq });

        if self.entries.len() > self.capacity {
            let evict = (self.entries.len() / 5).max(1);
            let mut by_age: Vec<(u64, CacheKey)> = self
                .entries
                .iter()
                .map(|(k, e)| (e.seq, k.clone()))
                .collect();
            by_age.sort_by_key(|(seq, _)| *seq);
            for (_, k) in by_age.into_iter().take(evict) {
                self.entries.remove(&k);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct RagOptimizer {
    store: Arc<dyn FactStore>,
    gateway: Arc<dyn EmbeddingGateway>,
    hybrid: HybridSearchEngine,
    config: RagConfig,
    cache: Mutex<ResultCache>,
}

impl RagOptimizer {
    pub fn new(
        store: Arc<dyn FactStore>,
        gateway: Arc<dyn EmbeddingGateway>,
        hybrid_config: HybridConfig,
        config: RagConfig,
    ) -> Self {
        let cache = Mutex::new(ResultCache::new(config.cache_capacity));
        Self {
            hybrid: HybridSearchEngine::new(store.clone(), hybrid_config),
            store,
            gateway,
            config,
            cache,
        }
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn hybrid(&self) -> &HybridSearchEngine {
        &self.hybrid
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }

    pub async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Run the full pipeline under the request timeout (or
    /// `rag.search_timeout_ms`). The only error is [`EngineError::Timeout`].
    ///
    /// Results are cached per request until [`clear_cache`](Self::clear_cache).
    /// Engines that change the corpus clear it when given the optimizer via
    /// `IncrementalSyncEngine::with_search` or
    /// `TemporalKnowledgeManager::with_search`.
    pub async fn advanced_search(
        &self,
        request: &AdvancedSearchRequest,
    ) -> Result<(Vec<SearchResult>, RagMetrics), EngineError> {
        let limit = request
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.config.search_timeout_ms));
        tokio::time::timeout(limit, self.run_pipeline(request))
            .await
            .map_err(|_| EngineError::Timeout(limit))
    }

    /// [`advanced_search`](Self::advanced_search), falling back to
    /// [`plain_search`](Self::plain_search) on timeout.
    pub async fn search_with_fallback(
        &self,
        request: &AdvancedSearchRequest,
    ) -> (Vec<SearchResult>, RagMetrics) {
        match self.advanced_search(request).await {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(error = %e, query = %request.query, "advanced search failed, using plain search");
                let start = Instant::now();
                let ctx = analyze_query(&request.query);
                let results = self
                    .plain_search(
                        &request.query,
                        request.max_results,
                        request.score_threshold,
                        request.filters.as_ref(),
                    )
                    .await;
                let mut metrics = RagMetrics::new(ctx.query_type, ctx.complexity);
                metrics.fallback_used = true;
                metrics.result_count = results.len();
                metrics.total_time = start.elapsed();
                (results, metrics)
            }
        }
    }

    /// Fact-store search with an optional score floor. Errors yield an
    /// empty list.
    pub async fn plain_search(
        &self,
        query: &str,
        max_results: usize,
        score_threshold: Option<f64>,
        filters: Option<&SearchFilters>,
    ) -> Vec<SearchResult> {
        let hits = match self.store.search(query, max_results, filters).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, query, "plain search failed");
                return Vec::new();
            }
        };
        let mut results: Vec<SearchResult> = hits
            .into_iter()
            .filter(|h| score_threshold.map_or(true, |t| h.score >= t))
            .map(SearchResult::from_hit)
            .collect();
        hybrid::sort_by_hybrid(&mut results);
        results.truncate(max_results);
        assign_ranks(&mut results);
        results
    }

    async fn run_pipeline(&self, request: &AdvancedSearchRequest) -> (Vec<SearchResult>, RagMetrics) {
        let start = Instant::now();

        let ctx = analyze_query(&request.query);
        let mut metrics = RagMetrics::new(ctx.query_type, ctx.complexity);
        metrics.variants = ctx.variants.len();
        metrics.classify_time = start.elapsed();

        let key = request.cache_key();
        if let Some(results) = self.cache.lock().await.get(&key) {
            tracing::debug!(query = %request.query, "result cache hit");
            metrics.cache_hit = true;
            metrics.result_count = results.len();
            metrics.total_time = start.elapsed();
            return (results, metrics);
        }

        let stage = Instant::now();
        let candidates = self.retrieve(&ctx, request, &mut metrics).await;
        metrics.retrieve_time = stage.elapsed();

        let stage = Instant::now();
        let mut results = diversify(
            candidates,
            self.config.diversity_threshold,
            self.config.max_diversified,
        );
        metrics.diversified = results.len();
        metrics.diversify_time = stage.elapsed();

        if request.enable_rerank && !results.is_empty() {
            let stage = Instant::now();
            self.rerank(&request.query, &mut results, &mut metrics).await;
            metrics.rerank_time = stage.elapsed();
        }

        let mut results = self.assemble(results, request.max_results, ctx.target_chunks);
        assign_ranks(&mut results);

        self.cache.lock().await.insert(key, results.clone());

        metrics.result_count = results.len();
        metrics.total_time = start.elapsed();
        tracing::debug!(
            query = %request.query,
            query_type = ?metrics.query_type,
            results = metrics.result_count,
            elapsed_ms = metrics.total_time.as_millis() as u64,
            "advanced search complete"
        );
        (results, metrics)
    }

    /// Semantic fetch per variant plus a keyword fetch over the corpus,
    /// merged by content hash and ranked by hybrid score.
    async fn retrieve(
        &self,
        ctx: &QueryContext,
        request: &AdvancedSearchRequest,
        metrics: &mut RagMetrics,
    ) -> Vec<SearchResult> {
        let filters = request.filters.as_ref();
        let keywords = self.hybrid.extract_keywords(&ctx.original);

        let mut merged: Vec<SearchResult> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        // Scores against the query as written. Variants widen the candidate
        // set but never decide the threshold.
        let mut query_scores: HashMap<String, f64> = HashMap::new();

        let fetches = ctx
            .variants
            .iter()
            .map(|v| self.store.search(v, self.config.semantic_top_k, filters));
        let original = ctx.original.trim();
        for (variant, outcome) in ctx.variants.iter().zip(join_all(fetches).await) {
            let is_original = variant.eq_ignore_ascii_case(original);
            match outcome {
                Ok(hits) => {
                    for hit in hits {
                        let r = SearchResult::from_hit(hit);
                        let key = r.content_key();
                        if is_original {
                            query_scores.insert(key.clone(), r.semantic_score);
                        }
                        match index.get(&key) {
                            Some(&i) => {
                                let existing = &mut merged[i];
                                existing.semantic_score = existing.semantic_score.max(r.semantic_score);
                            }
                            None => {
                                index.insert(key, merged.len());
                                merged.push(r);
                            }
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, variant = %variant, "semantic fetch failed"),
            }
        }
        metrics.semantic_candidates = merged.len();

        match self.store.get_all_facts().await {
            Ok(facts) => {
                metrics.documents_considered = facts.len();
                let mut scored: Vec<SearchResult> = facts
                    .into_iter()
                    .filter(|f| matches_filters(&f.metadata, filters))
                    .map(|fact| {
                        let mut r = SearchResult::from_hit(FactHit { fact, score: 0.0 });
                        r.keyword_score = hybrid::keyword_score(&keywords, &r.content, &r.source);
                        r
                    })
                    .filter(|r| r.keyword_score > 0.0)
                    .collect();
                scored.sort_by(|a, b| {
                    b.keyword_score
                        .partial_cmp(&a.keyword_score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                scored.truncate(self.config.keyword_top_k);
                metrics.keyword_candidates = scored.len();

                for r in scored {
                    let key = r.content_key();
                    match index.get(&key) {
                        Some(&i) => {
                            let existing = &mut merged[i];
                            existing.keyword_score = existing.keyword_score.max(r.keyword_score);
                        }
                        None => {
                            index.insert(key, merged.len());
                            merged.push(r);
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "keyword fetch failed"),
        }
        if metrics.documents_considered == 0 {
            metrics.documents_considered = merged.len();
        }

        for r in merged.iter_mut() {
            if let Some(&score) = query_scores.get(&r.content_key()) {
                r.semantic_score = score;
            }
        }
        if let Some(threshold) = request.score_threshold {
            merged.retain(|r| {
                query_scores
                    .get(&r.content_key())
                    .is_some_and(|&score| score >= threshold)
            });
        }

        for r in merged.iter_mut() {
            let fresh = hybrid::keyword_score(&keywords, &r.content, &r.source);
            r.keyword_score = r.keyword_score.max(fresh);
            r.hybrid_score = self.hybrid.combine(r.semantic_score, r.keyword_score);
        }
        metrics.hybrid_executed = true;

        hybrid::sort_by_hybrid(&mut merged);
        merged
    }

    /// Cross-encoder rerank, time-boxed by `rag.rerank_timeout_ms`. Falls
    /// back to the term-overlap heuristic on any failure.
    async fn rerank(&self, query: &str, results: &mut [SearchResult], metrics: &mut RagMetrics) {
        let documents: Vec<String> = results.iter().map(|r| r.content.clone()).collect();
        let limit = Duration::from_millis(self.config.rerank_timeout_ms);

        let scores = match tokio::time::timeout(limit, self.gateway.rerank(query, &documents)).await {
            Ok(Ok(scores)) if scores.len() == results.len() => Some(scores),
            Ok(Ok(scores)) => {
                tracing::warn!(
                    expected = results.len(),
                    got = scores.len(),
                    "reranker returned wrong number of scores"
                );
                None
            }
            Ok(Err(e)) => {
                match e.downcast_ref::<EngineError>() {
                    Some(EngineError::RerankerUnavailable) => {
                        tracing::debug!("no reranker configured, using heuristic rerank")
                    }
                    _ => tracing::warn!(error = %e, "rerank failed, using heuristic rerank"),
                }
                None
            }
            Err(_) => {
                tracing::warn!(timeout_ms = limit.as_millis() as u64, "rerank timed out");
                None
            }
        };

        match scores {
            Some(scores) => {
                let w = self.config.rerank_weight;
                for (r, s) in results.iter_mut().zip(scores) {
                    r.rerank_score = Some(w * squash(s) + (1.0 - w) * r.hybrid_score);
                }
                metrics.rerank_executed = true;
            }
            None => {
                self.heuristic_rerank(query, results);
                metrics.rerank_fallback_used = true;
            }
        }
        sort_by_final(results);
    }

    fn heuristic_rerank(&self, query: &str, results: &mut [SearchResult]) {
        let keywords = self.hybrid.extract_keywords(query);
        let needle = query.trim().to_lowercase();
        for r in results.iter_mut() {
            let exact = if !needle.is_empty() && r.content.to_lowercase().contains(&needle) {
                self.config.fallback_exact_bonus
            } else {
                0.0
            };
            r.rerank_score = Some(
                self.config.fallback_hybrid_weight * r.hybrid_score
                    + self.config.fallback_term_weight * term_match(&keywords, &r.content)
                    + exact,
            );
        }
    }

    /// Keep `max_results`, extended up to `target_chunks` by candidates
    /// whose final score clears `rag.quality_threshold`.
    fn assemble(
        &self,
        mut results: Vec<SearchResult>,
        max_results: usize,
        target_chunks: usize,
    ) -> Vec<SearchResult> {
        let mut keep = max_results.min(results.len());
        if target_chunks > max_results && results.len() > max_results {
            keep += results[max_results..]
                .iter()
                .take(target_chunks - max_results)
                .take_while(|r| r.final_score() >= self.config.quality_threshold)
                .count();
        }
        results.truncate(keep);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::models::Metadata;
    use crate::store::memory::InMemoryFactStore;
    use anyhow::Result;
    use async_trait::async_trait;

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
    fn test_classify_precedence() {
        assert_eq!(classify_query("how to fix the api error"), QueryType::Technical);
        assert_eq!(classify_query("how to fix this error"), QueryType::Procedural);
        assert_eq!(classify_query("login error after upgrade"), QueryType::Troubleshooting);
        assert_eq!(classify_query("tell me about the team"), QueryType::General);
    }

    #[test]
    fn test_complexity_rises_with_length_and_density() {
        let short = query_complexity("api", QueryType::Technical);
        let long = query_complexity(
            "what is the api that the team uses for the new billing work today",
            QueryType::Technical,
        );
        assert!((short - 0.8).abs() < 1e-9);
        assert!((long - 0.8).abs() < 1e-9);
        assert!((query_complexity("tell me about it", QueryType::General) - 0.3).abs() < 1e-9);
        assert!(query_complexity("api schema port sql", QueryType::Technical) <= 1.0);
    }

    #[test]
    fn test_context_budget_tiers() {
        assert_eq!(context_budget(0.3), (2000, 3));
        assert_eq!(context_budget(0.5), (4000, 5));
        assert_eq!(context_budget(0.9), (8000, 8));
    }

    #[test]
    fn test_expand_query_original_first_and_capped() {
        let variants = expand_query("Redis default config for the api server", QueryType::Technical);
        assert_eq!(variants[0], "Redis default config for the api server");
        assert!(variants.len() <= MAX_VARIANTS);
        assert!(variants
            .last()
            .unwrap()
            .ends_with("technical documentation"));
        let lower: HashSet<String> = variants.iter().map(|v| v.to_lowercase()).collect();
        assert_eq!(lower.len(), variants.len());
    }

    #[test]
    fn test_expand_query_general() {
        let variants = expand_query("explain the roadmap", QueryType::General);
        assert_eq!(
            variants,
            vec![
                "explain the roadmap".to_string(),
                "describe the roadmap".to_string(),
                "explain the roadmap overview".to_string(),
            ]
        );
    }

    #[test]
    fn test_diversify_keeps_top_and_drops_near_duplicates() {
        let input = vec![
            result("redis default port is 6379", 0.9),
            result("Redis default port is 6379.", 0.8),
            result("kubernetes schedules pods", 0.7),
        ];
        let out = diversify(input, 0.85, 10);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content, "redis default port is 6379");

        let many: Vec<SearchResult> = (0..20)
            .map(|i| result(&format!("distinct topic number {}", i), 1.0 - i as f64 * 0.01))
            .collect();
        let capped = diversify(many, 0.99, 10);
        assert_eq!(capped.len(), 10);
        assert!((capped[0].hybrid_score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_evicts_oldest_fifth() {
        let mut cache = ResultCache::new(10);
        let key = |i: usize| AdvancedSearchRequest::new(format!("q{}", i)).cache_key();
        for i in 0..11 {
            cache.insert(key(i), vec![]);
        }
        assert_eq!(cache.len(), 9);
        assert!(cache.get(&key(0)).is_none());
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(2)).is_some());
        assert!(cache.get(&key(10)).is_some());
    }

    async fn corpus() -> Arc<InMemoryFactStore> {
        let gateway = Arc::new(HashingEmbedder::new(256).unwrap());
        let store = Arc::new(InMemoryFactStore::with_gateway(gateway));
        for (text, source) in [
            ("Redis listens on default port 6379 for client connections.", "docs/redis.md"),
            ("Postgres uses port 5432 by default.", "docs/postgres.md"),
            ("The team offsite is scheduled for spring.", "notes/offsite.md"),
        ] {
            let mut m = Metadata::new();
            m.insert("source".into(), source.into());
            store.store_fact(text, &m).await.unwrap();
        }
        store
    }

    fn optimizer(store: Arc<dyn FactStore>) -> RagOptimizer {
        RagOptimizer::new(
            store,
            Arc::new(HashingEmbedder::new(256).unwrap()),
            HybridConfig::default(),
            RagConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_advanced_search_uses_heuristic_rerank_without_reranker() {
        let rag = optimizer(corpus().await);
        let request = AdvancedSearchRequest::new("Redis default port").max_results(2);
        let (results, metrics) = rag.advanced_search(&request).await.unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].source, "docs/redis.md");
        assert_eq!(results[0].rank, 1);
        assert!(results[0].rerank_score.is_some());
        assert!(metrics.hybrid_executed);
        assert!(!metrics.rerank_executed);
        assert!(metrics.rerank_fallback_used);
        assert_eq!(metrics.query_type, QueryType::Technical);
    }

    #[tokio::test]
    async fn test_second_identical_search_hits_cache() {
        let rag = optimizer(corpus().await);
        let request = AdvancedSearchRequest::new("postgres port").rerank(false);
        let (first, m1) = rag.advanced_search(&request).await.unwrap();
        let (second, m2) = rag.advanced_search(&request).await.unwrap();
        assert!(!m1.cache_hit);
        assert!(m2.cache_hit);
        assert_eq!(first.len(), second.len());

        rag.clear_cache().await;
        let (_, m3) = rag.advanced_search(&request).await.unwrap();
        assert!(!m3.cache_hit);
    }

    struct ScriptedReranker;

    #[async_trait]
    impl EmbeddingGateway for ScriptedReranker {
        fn model_name(&self) -> &str {
            "scripted"
        }
        fn dims(&self) -> usize {
            4
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0, 0.0]).collect())
        }
        async fn rerank(&self, _query: &str, documents: &[String]) -> Result<Vec<f32>> {
            // Prefer whatever mentions the offsite.
            Ok(documents
                .iter()
                .map(|d| if d.contains("offsite") { 5.0 } else { -5.0 })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_cross_encoder_scores_reorder_results() {
        let store = corpus().await;
        let rag = RagOptimizer::new(
            store,
            Arc::new(ScriptedReranker),
            HybridConfig::default(),
            RagConfig::default(),
        );
        let request = AdvancedSearchRequest::new("port offsite").max_results(3);
        let (results, metrics) = rag.advanced_search(&request).await.unwrap();
        assert!(metrics.rerank_executed);
        assert!(!metrics.rerank_fallback_used);
        assert_eq!(results[0].source, "notes/offsite.md");
        for pair in results.windows(2) {
            assert!(pair[0].final_score() >= pair[1].final_score());
        }
    }

    #[test]
    fn test_squash_maps_logits_into_unit_range() {
        assert_eq!(squash(0.25), 0.25);
        assert!(squash(5.0) > 0.99);
        assert!(squash(-5.0) < 0.01);
    }
}

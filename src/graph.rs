//! Graph-aware search: expand a baseline result set with entities reached
//! through the relationship graph.
//!
//! Entity references come from the metadata of the top baseline results:
//! an `entities` list (strings or `{ "name": ... }` objects) and a
//! `session_id`, which is treated as an entity of its own. Each resolved
//! reference becomes a starting point whose relevance is the originating
//! result's hybrid score scaled by a rank weight (1.0 for the first result,
//! down to 0.5 for the fifth).
//!
//! A related entity at the end of a path of strength `s` becomes a synthetic
//! result scored `(1 - w) * base + w * (base * s)` where `w` is
//! `graph.graph_weight` and `base` the starting point's relevance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;

use crate::config::GraphConfig;
use crate::models::{
    assign_ranks, Direction, EntityMatch, GraphMetrics, Metadata, RelatedEntity, SearchResult,
};
use crate::rag::{AdvancedSearchRequest, RagOptimizer};
use crate::store::GraphStore;

/// Rank weight lost per position among the seed results.
const RANK_DECAY: f64 = 0.125;
const MIN_RANK_WEIGHT: f64 = 0.5;

/// Rank weight for the `index`-th (0-based) seed result.
pub fn rank_weight(index: usize) -> f64 {
    (1.0 - RANK_DECAY * index as f64).max(MIN_RANK_WEIGHT)
}

/// Proximity-weighted score of a graph-derived result.
pub fn graph_score(base_relevance: f64, strength: f64, graph_weight: f64) -> f64 {
    (1.0 - graph_weight) * base_relevance + graph_weight * (base_relevance * strength)
}

/// Entity names referenced by a result's metadata, in order.
pub fn entity_refs(metadata: &Metadata) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(Value::Array(items)) = metadata.get("entities") {
        for item in items {
            let name = match item {
                Value::String(s) => Some(s.as_str()),
                Value::Object(obj) => obj.get("name").and_then(Value::as_str),
                _ => None,
            };
            if let Some(n) = name.map(str::trim).filter(|n| !n.is_empty()) {
                names.push(n.to_string());
            }
        }
    }
    if let Some(session) = metadata
        .get("session_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        names.push(session.to_string());
    }
    names
}

pub struct GraphExpansionService {
    rag: Arc<RagOptimizer>,
    graph: Arc<dyn GraphStore>,
    config: GraphConfig,
}

impl GraphExpansionService {
    pub fn new(rag: Arc<RagOptimizer>, graph: Arc<dyn GraphStore>, config: GraphConfig) -> Self {
        Self { rag, graph, config }
    }

    /// Graph-aware search with the configured traversal depth.
    pub async fn search(&self, query: &str, max_results: usize) -> (Vec<SearchResult>, GraphMetrics) {
        self.graph_aware_search(query, None, self.config.max_depth, max_results)
            .await
    }

    /// Baseline search expanded through the entity graph.
    ///
    /// `start_entity`, when given, is an extra starting point with relevance
    /// 1.0. Lookup and traversal failures are counted in
    /// `failed_lookups` and skipped.
    pub async fn graph_aware_search(
        &self,
        query: &str,
        start_entity: Option<&str>,
        max_depth: usize,
        max_results: usize,
    ) -> (Vec<SearchResult>, GraphMetrics) {
        let start = Instant::now();
        let mut metrics = GraphMetrics::default();

        let request = AdvancedSearchRequest::new(query).max_results(max_results);
        let (baseline, rag_metrics) = self.rag.search_with_fallback(&request).await;
        metrics.baseline_results = baseline.len();
        metrics.baseline_fallback_used = rag_metrics.fallback_used;

        let refs = self.collect_refs(&baseline, start_entity);
        metrics.entities_extracted = refs.len();

        let starts = self.resolve(refs, &mut metrics).await;
        metrics.starting_points = starts.len();

        let graph_results = if max_depth == 0 {
            Vec::new()
        } else {
            self.expand(&starts, max_depth, &mut metrics).await
        };

        let baseline_keys: HashSet<String> = baseline.iter().map(|r| r.content_key()).collect();
        let mut merged: HashMap<String, SearchResult> = HashMap::new();
        for r in baseline.into_iter().chain(graph_results) {
            let key = r.content_key();
            let keep_existing = merged
                .get(&key)
                .is_some_and(|existing| existing.hybrid_score >= r.hybrid_score);
            if !keep_existing {
                merged.insert(key, r);
            }
        }

        // Ties are broken on content so ranks do not depend on map order.
        let mut results: Vec<SearchResult> = merged.into_values().collect();
        results.sort_by(|a, b| {
            b.hybrid_score
                .partial_cmp(&a.hybrid_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.content.cmp(&b.content))
        });
        results.truncate(max_results);
        assign_ranks(&mut results);
        metrics.graph_results_added = results
            .iter()
            .filter(|r| !baseline_keys.contains(&r.content_key()))
            .count();
        metrics.elapsed = start.elapsed();

        tracing::debug!(
            query,
            baseline = metrics.baseline_results,
            starting_points = metrics.starting_points,
            added = metrics.graph_results_added,
            failed = metrics.failed_lookups,
            "graph-aware search complete"
        );
        (results, metrics)
    }

    /// `(name, relevance)` pairs from the seed results, first occurrence wins.
    fn collect_refs(&self, baseline: &[SearchResult], start_entity: Option<&str>) -> Vec<(String, f64)> {
        let mut seen = HashSet::new();
        let mut refs = Vec::new();
        if let Some(name) = start_entity.map(str::trim).filter(|n| !n.is_empty()) {
            seen.insert(name.to_string());
            refs.push((name.to_string(), 1.0));
        }
        for (i, result) in baseline.iter().take(self.config.seed_results).enumerate() {
            let relevance = result.hybrid_score * rank_weight(i);
            for name in entity_refs(&result.metadata) {
                if seen.insert(name.clone()) {
                    refs.push((name, relevance));
                }
            }
        }
        refs
    }

    async fn resolve(&self, refs: Vec<(String, f64)>, metrics: &mut GraphMetrics) -> Vec<EntityMatch> {
        let lookups = refs.iter().map(|(name, _)| self.graph.get_entity(name, true));
        let outcomes = join_all(lookups).await;

        let mut starts = Vec::new();
        for ((name, relevance), outcome) in refs.into_iter().zip(outcomes) {
            match outcome {
                Ok(Some(entity)) => starts.push(EntityMatch {
                    entity,
                    relevance,
                    distance: 0,
                    relation_path: Vec::new(),
                }),
                Ok(None) => tracing::debug!(entity = %name, "entity not in graph"),
                Err(e) => {
                    metrics.failed_lookups += 1;
                    tracing::warn!(error = %e, entity = %name, "entity lookup failed");
                }
            }
        }
        starts
    }

    async fn expand(
        &self,
        starts: &[EntityMatch],
        max_depth: usize,
        metrics: &mut GraphMetrics,
    ) -> Vec<SearchResult> {
        let traversals = starts.iter().map(|s| {
            self.graph
                .get_related_entities(&s.entity.name, None, Direction::Both, max_depth)
        });
        let outcomes = join_all(traversals).await;

        let mut results = Vec::new();
        for (origin, outcome) in starts.iter().zip(outcomes) {
            match outcome {
                Ok(related) => {
                    metrics.related_found += related.len();
                    results.extend(related.into_iter().map(|r| self.to_result(origin, r)));
                }
                Err(e) => {
                    metrics.failed_lookups += 1;
                    tracing::warn!(error = %e, entity = %origin.entity.name, "graph traversal failed");
                }
            }
        }
        results
    }

    fn to_result(&self, origin: &EntityMatch, related: RelatedEntity) -> SearchResult {
        let found = EntityMatch {
            relevance: origin.relevance,
            distance: related.depth,
            relation_path: related.path,
            entity: related.entity,
        };
        let score = graph_score(
            found.relevance,
            related.relation.strength,
            self.config.graph_weight,
        );

        let mut metadata = Metadata::new();
        metadata.insert("entity".into(), found.entity.name.clone().into());
        metadata.insert("entity_type".into(), found.entity.entity_type.clone().into());
        metadata.insert("origin_entity".into(), origin.entity.name.clone().into());
        metadata.insert("graph_distance".into(), found.distance.into());
        metadata.insert("relation_path".into(), found.relation_path.clone().into());
        metadata.insert("relation_strength".into(), related.relation.strength.into());

        SearchResult {
            content: found.entity.describe(),
            metadata,
            semantic_score: 0.0,
            keyword_score: 0.0,
            hybrid_score: score,
            rerank_score: None,
            rank: 0,
            source: format!("graph:{}", found.entity.name),
            chunk_index: None,
        }
    }
}

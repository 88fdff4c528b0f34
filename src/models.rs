//! Core data models shared by the sync, search, graph, and temporal layers.
//!
//! Query type, priority, freshness state, job type, and traversal direction
//! are closed enums; every consumer matches on them exhaustively.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::text;

/// Free-form metadata attached to chunks, facts, and results.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ============ Sync ============

/// Sync state for one file under the configured root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub relative_path: String,
    /// Hex SHA-256 of the file bytes. Empty when the last processing attempt
    /// did not complete, which forces reprocessing on the next run.
    pub content_hash: String,
    pub size: u64,
    /// File mtime, Unix seconds.
    pub modified_at: i64,
    /// Unix seconds of the last successful processing.
    pub last_synced_at: i64,
    /// Fact ids owned by this file.
    pub chunk_ids: Vec<String>,
    pub chunk_count: usize,
    pub processing_ms: u64,
}

/// Outcome counters for a single [`sync`](crate::sync::IncrementalSyncEngine::sync) run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncMetrics {
    pub scanned: usize,
    /// Known files whose content hash changed.
    pub changed: usize,
    pub added: usize,
    pub removed: usize,
    /// Files whose mtime moved but whose bytes did not.
    pub timestamp_only: usize,
    pub failed: usize,
    pub chunks_processed: usize,
    pub elapsed: Duration,
    pub used_accelerated_path: bool,
}

// ============ Chunking ============

/// A sentence-coherent slice of a document.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub content: String,
    pub sentences: Vec<String>,
    /// Index of the first sentence in the source document.
    pub start_sentence: usize,
    /// One past the last sentence index.
    pub end_sentence: usize,
    /// Mean pairwise cosine similarity of member sentences, `[0, 1]`.
    pub coherence: f64,
    pub metadata: Metadata,
}

// ============ Stores ============

/// A fact as held by the external fact store.
#[derive(Debug, Clone, Serialize)]
pub struct Fact {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
}

/// A fact returned from a fact-store similarity search.
#[derive(Debug, Clone)]
pub struct FactHit {
    pub fact: Fact,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entity {
    pub name: String,
    pub entity_type: String,
    #[serde(default)]
    pub observations: Vec<String>,
}

impl Entity {
    /// Text used when an entity is surfaced as a search result.
    pub fn describe(&self) -> String {
        if self.observations.is_empty() {
            format!("{} ({})", self.name, self.entity_type)
        } else {
            format!(
                "{} ({}): {}",
                self.name,
                self.entity_type,
                self.observations.join(" ")
            )
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Relation {
    pub relation_type: String,
    /// Edge strength in `[0, 1]`.
    pub strength: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Outgoing,
    Incoming,
    Both,
}

/// An entity reached by traversal from a starting entity.
#[derive(Debug, Clone)]
pub struct RelatedEntity {
    pub entity: Entity,
    /// The last edge on the path; its strength is the product along the path.
    pub relation: Relation,
    pub direction: Direction,
    /// Hop count from the starting entity.
    pub depth: usize,
    /// Relation types traversed, in order.
    pub path: Vec<String>,
}

// ============ Search ============

/// A ranked search result. Built per query and never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub content: String,
    pub metadata: Metadata,
    pub semantic_score: f64,
    pub keyword_score: f64,
    pub hybrid_score: f64,
    pub rerank_score: Option<f64>,
    /// 1-based position in the returned list.
    pub rank: usize,
    pub source: String,
    pub chunk_index: Option<usize>,
}

impl SearchResult {
    /// Build a result from a fact-store hit, with semantic and hybrid scores
    /// both set to the store score.
    pub fn from_hit(hit: FactHit) -> Self {
        let source = hit
            .fact
            .metadata
            .get("source")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let chunk_index = hit
            .fact
            .metadata
            .get("chunk_index")
            .and_then(|v| v.as_u64())
            .map(|i| i as usize);
        Self {
            content: hit.fact.text,
            metadata: hit.fact.metadata,
            semantic_score: hit.score,
            keyword_score: 0.0,
            hybrid_score: hit.score,
            rerank_score: None,
            rank: 0,
            source,
            chunk_index,
        }
    }

    /// Rerank score when present, hybrid score otherwise.
    pub fn final_score(&self) -> f64 {
        self.rerank_score.unwrap_or(self.hybrid_score)
    }

    /// Content-hash key used for merging and exact deduplication.
    pub fn content_key(&self) -> String {
        text::content_hash(&self.content)
    }
}

/// Assign 1-based ranks in list order.
pub fn assign_ranks(results: &mut [SearchResult]) {
    for (i, r) in results.iter_mut().enumerate() {
        r.rank = i + 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    General,
    Technical,
    Procedural,
    Troubleshooting,
}

impl QueryType {
    /// Base complexity carried by the category.
    pub fn base_complexity(self) -> f64 {
        match self {
            QueryType::General => 0.3,
            QueryType::Procedural => 0.5,
            QueryType::Troubleshooting => 0.6,
            QueryType::Technical => 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryContext {
    pub original: String,
    /// At most five variants; the first is always the original query.
    pub variants: Vec<String>,
    pub query_type: QueryType,
    pub complexity: f64,
    pub target_context_length: usize,
    pub target_chunks: usize,
}

/// Per-stage accounting for one advanced search.
#[derive(Debug, Clone, Serialize)]
pub struct RagMetrics {
    pub query_type: QueryType,
    pub complexity: f64,
    pub variants: usize,
    pub documents_considered: usize,
    pub semantic_candidates: usize,
    pub keyword_candidates: usize,
    pub diversified: usize,
    pub hybrid_executed: bool,
    pub rerank_executed: bool,
    pub rerank_fallback_used: bool,
    pub cache_hit: bool,
    pub fallback_used: bool,
    pub classify_time: Duration,
    pub retrieve_time: Duration,
    pub diversify_time: Duration,
    pub rerank_time: Duration,
    pub total_time: Duration,
    pub result_count: usize,
}

impl RagMetrics {
    pub fn new(query_type: QueryType, complexity: f64) -> Self {
        Self {
            query_type,
            complexity,
            variants: 0,
            documents_considered: 0,
            semantic_candidates: 0,
            keyword_candidates: 0,
            diversified: 0,
            hybrid_executed: false,
            rerank_executed: false,
            rerank_fallback_used: false,
            cache_hit: false,
            fallback_used: false,
            classify_time: Duration::ZERO,
            retrieve_time: Duration::ZERO,
            diversify_time: Duration::ZERO,
            rerank_time: Duration::ZERO,
            total_time: Duration::ZERO,
            result_count: 0,
        }
    }
}

// ============ Graph ============

/// An entity reached from a search result, with inherited relevance.
#[derive(Debug, Clone)]
pub struct EntityMatch {
    pub entity: Entity,
    pub relevance: f64,
    /// Hop count; 0 for a starting point.
    pub distance: usize,
    pub relation_path: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphMetrics {
    pub baseline_results: usize,
    pub entities_extracted: usize,
    pub starting_points: usize,
    pub related_found: usize,
    pub graph_results_added: usize,
    pub failed_lookups: usize,
    pub baseline_fallback_used: bool,
    pub elapsed: Duration,
}

// ============ Temporal ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn ttl_hours(self) -> f64 {
        match self {
            Priority::Critical => 24.0,
            Priority::High => 72.0,
            Priority::Medium => 168.0,
            Priority::Low => 720.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessState {
    Fresh,
    Aging,
    Stale,
    Expired,
}

impl FreshnessState {
    /// State for an `age / ttl` ratio.
    pub fn from_age_ratio(ratio: f64) -> Self {
        if ratio > 1.0 {
            FreshnessState::Expired
        } else if ratio >= 0.8 {
            FreshnessState::Stale
        } else if ratio >= 0.5 {
            FreshnessState::Aging
        } else {
            FreshnessState::Fresh
        }
    }
}

/// Lifecycle bookkeeping for one piece of stored content.
#[derive(Debug, Clone, Serialize)]
pub struct TemporalRecord {
    pub content_id: String,
    pub category: String,
    pub path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub modification_count: u64,
    pub priority: Priority,
    pub ttl_hours: f64,
    pub freshness: f64,
    /// Updates per day since creation.
    pub update_frequency: f64,
    /// Explicit invalidation time; overrides the TTL when set.
    pub invalidate_at: Option<DateTime<Utc>>,
}

impl TemporalRecord {
    pub fn age_hours(&self, now: DateTime<Utc>) -> f64 {
        hours_between(self.modified_at, now)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.invalidate_at {
            Some(at) => now >= at,
            None => self.age_hours(now) > self.ttl_hours,
        }
    }

    pub fn state(&self, now: DateTime<Utc>) -> FreshnessState {
        if self.is_expired(now) {
            return FreshnessState::Expired;
        }
        let ratio = if self.ttl_hours > 0.0 {
            self.age_hours(now) / self.ttl_hours
        } else {
            f64::INFINITY
        };
        match FreshnessState::from_age_ratio(ratio) {
            // An explicit invalidation time in the future keeps the record alive.
            FreshnessState::Expired => FreshnessState::Stale,
            other => other,
        }
    }
}

/// Fractional hours from `from` to `to`, floored at zero.
pub fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds() as f64 / 3_600_000.0).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Expiry,
    Manual,
    Dependency,
}

/// A batch of content ids to delete, consumed once by the invalidation worker.
#[derive(Debug, Clone, Serialize)]
pub struct InvalidationJob {
    pub id: String,
    pub content_ids: Vec<String>,
    pub priority: Priority,
    pub scheduled_at: DateTime<Utc>,
    pub job_type: JobType,
    pub estimated_duration: Duration,
}

//! TOML configuration for every engine component.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration. [`load_config`] reads and validates a file;
//! [`Config::from_toml_str`] does the same for an in-memory document.
//!
//! ```toml
//! [sync]
//! root = "./docs"
//! include_globs = ["**/*.md"]
//! max_concurrency = 4
//!
//! [hybrid]
//! semantic_weight = 0.7
//! keyword_weight = 0.3
//!
//! [embedding]
//! provider = "hashing"
//! dims = 256
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::EngineError;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub hybrid: HybridConfig,
    #[serde(default)]
    pub rag: RagConfig,
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub temporal: TemporalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// SQLite file holding the `FileRecord` table.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    /// Files processed concurrently per run.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            state_path: default_state_path(),
            max_concurrency: default_max_concurrency(),
            embed_batch_size: default_embed_batch_size(),
            interval_secs: default_sync_interval(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_state_path() -> PathBuf {
    PathBuf::from("./data/sync-state.sqlite")
}
fn default_max_concurrency() -> usize {
    4
}
fn default_embed_batch_size() -> usize {
    32
}
fn default_sync_interval() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Chunks shorter than this (in chars) are merged into a neighbour.
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,
    /// Chunks longer than this (in chars) are split.
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Sentences carried from one split piece into the next.
    #[serde(default = "default_overlap_sentences")]
    pub overlap_sentences: usize,
    /// Percentile of the consecutive-distance distribution used as the
    /// breakpoint threshold.
    #[serde(default = "default_breakpoint_percentile")]
    pub breakpoint_percentile: f64,
    #[serde(default = "default_min_sentences_between_breaks")]
    pub min_sentences_between_breaks: usize,
    #[serde(default = "default_fallback_chunk_size")]
    pub fallback_chunk_size: usize,
    #[serde(default = "default_fallback_coherence")]
    pub fallback_coherence: f64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            overlap_sentences: default_overlap_sentences(),
            breakpoint_percentile: default_breakpoint_percentile(),
            min_sentences_between_breaks: default_min_sentences_between_breaks(),
            fallback_chunk_size: default_fallback_chunk_size(),
            fallback_coherence: default_fallback_coherence(),
        }
    }
}

fn default_min_chunk_size() -> usize {
    100
}
fn default_max_chunk_size() -> usize {
    1500
}
fn default_overlap_sentences() -> usize {
    1
}
fn default_breakpoint_percentile() -> f64 {
    95.0
}
fn default_min_sentences_between_breaks() -> usize {
    2
}
fn default_fallback_chunk_size() -> usize {
    1000
}
fn default_fallback_coherence() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct HybridConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    /// Keyword scores below this are zeroed before combination.
    #[serde(default = "default_min_keyword_score")]
    pub min_keyword_score: f64,
    #[serde(default = "default_near_duplicate_threshold")]
    pub near_duplicate_threshold: f64,
    #[serde(default = "default_min_keyword_length")]
    pub min_keyword_length: usize,
    /// Semantic candidates fetched per requested result.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
}

impl Default for HybridConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            min_keyword_score: default_min_keyword_score(),
            near_duplicate_threshold: default_near_duplicate_threshold(),
            min_keyword_length: default_min_keyword_length(),
            candidate_multiplier: default_candidate_multiplier(),
        }
    }
}

fn default_semantic_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_min_keyword_score() -> f64 {
    0.1
}
fn default_near_duplicate_threshold() -> f64 {
    0.9
}
fn default_min_keyword_length() -> usize {
    3
}
fn default_candidate_multiplier() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    #[serde(default = "default_top_k")]
    pub semantic_top_k: usize,
    #[serde(default = "default_top_k")]
    pub keyword_top_k: usize,
    #[serde(default = "default_diversity_threshold")]
    pub diversity_threshold: f64,
    #[serde(default = "default_max_diversified")]
    pub max_diversified: usize,
    /// Share of the cross-encoder score in the final score.
    #[serde(default = "default_rerank_weight")]
    pub rerank_weight: f64,
    /// Heuristic reranker weights, used when no cross-encoder is available.
    #[serde(default = "default_fallback_hybrid_weight")]
    pub fallback_hybrid_weight: f64,
    #[serde(default = "default_fallback_term_weight")]
    pub fallback_term_weight: f64,
    #[serde(default = "default_fallback_exact_bonus")]
    pub fallback_exact_bonus: f64,
    #[serde(default = "default_rerank_timeout_ms")]
    pub rerank_timeout_ms: u64,
    #[serde(default = "default_search_timeout_ms")]
    pub search_timeout_ms: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Minimum score for a candidate to widen the result set past `max_results`.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            semantic_top_k: default_top_k(),
            keyword_top_k: default_top_k(),
            diversity_threshold: default_diversity_threshold(),
            max_diversified: default_max_diversified(),
            rerank_weight: default_rerank_weight(),
            fallback_hybrid_weight: default_fallback_hybrid_weight(),
            fallback_term_weight: default_fallback_term_weight(),
            fallback_exact_bonus: default_fallback_exact_bonus(),
            rerank_timeout_ms: default_rerank_timeout_ms(),
            search_timeout_ms: default_search_timeout_ms(),
            cache_capacity: default_cache_capacity(),
            quality_threshold: default_quality_threshold(),
        }
    }
}

fn default_top_k() -> usize {
    20
}
fn default_diversity_threshold() -> f64 {
    0.85
}
fn default_max_diversified() -> usize {
    10
}
fn default_rerank_weight() -> f64 {
    0.8
}
fn default_fallback_hybrid_weight() -> f64 {
    0.7
}
fn default_fallback_term_weight() -> f64 {
    0.2
}
fn default_fallback_exact_bonus() -> f64 {
    0.1
}
fn default_rerank_timeout_ms() -> u64 {
    2_000
}
fn default_search_timeout_ms() -> u64 {
    10_000
}
fn default_cache_capacity() -> usize {
    256
}
fn default_quality_threshold() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct GraphConfig {
    #[serde(default = "default_graph_weight")]
    pub graph_weight: f64,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// How many top baseline results entities are extracted from.
    #[serde(default = "default_seed_results")]
    pub seed_results: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            graph_weight: default_graph_weight(),
            max_depth: default_max_depth(),
            seed_results: default_seed_results(),
        }
    }
}

fn default_graph_weight() -> f64 {
    0.3
}
fn default_max_depth() -> usize {
    2
}
fn default_seed_results() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemporalConfig {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
    /// Access count above which an aging record is proposed for refresh.
    #[serde(default = "default_refresh_access_threshold")]
    pub refresh_access_threshold: u64,
}

impl Default for TemporalConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
            refresh_access_threshold: default_refresh_access_threshold(),
        }
    }
}

fn default_scan_interval() -> u64 {
    3_600
}
fn default_refresh_access_threshold() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `"hashing"` (offline, deterministic) or `"http"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Cross-encoder endpoint; reranking falls back to a heuristic when unset.
    #[serde(default)]
    pub rerank_url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            rerank_url: None,
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), EngineError> {
        let err = |msg: &str| Err(EngineError::Config(msg.to_string()));

        if self.sync.max_concurrency == 0 {
            return err("sync.max_concurrency must be >= 1");
        }
        if self.sync.embed_batch_size == 0 {
            return err("sync.embed_batch_size must be >= 1");
        }
        if self.chunking.max_chunk_size == 0 || self.chunking.fallback_chunk_size == 0 {
            return err("chunking sizes must be > 0");
        }
        if self.chunking.min_chunk_size > self.chunking.max_chunk_size {
            return err("chunking.min_chunk_size must not exceed chunking.max_chunk_size");
        }
        if !(self.chunking.breakpoint_percentile > 0.0
            && self.chunking.breakpoint_percentile <= 100.0)
        {
            return err("chunking.breakpoint_percentile must be in (0, 100]");
        }
        for (name, w) in [
            ("hybrid.semantic_weight", self.hybrid.semantic_weight),
            ("hybrid.keyword_weight", self.hybrid.keyword_weight),
            ("hybrid.near_duplicate_threshold", self.hybrid.near_duplicate_threshold),
            ("rag.diversity_threshold", self.rag.diversity_threshold),
            ("rag.rerank_weight", self.rag.rerank_weight),
            ("graph.graph_weight", self.graph.graph_weight),
        ] {
            if !(0.0..=1.0).contains(&w) {
                return Err(EngineError::Config(format!("{} must be in [0.0, 1.0]", name)));
            }
        }
        if self.rag.max_diversified == 0 {
            return err("rag.max_diversified must be >= 1");
        }
        match self.embedding.provider.as_str() {
            "hashing" => {
                if self.embedding.dims == 0 {
                    return err("embedding.dims must be > 0");
                }
            }
            "http" => {
                if self.embedding.model.is_none() {
                    return err("embedding.model must be specified when provider is 'http'");
                }
            }
            other => {
                return Err(EngineError::Config(format!(
                    "Unknown embedding provider: '{}'. Must be hashing or http.",
                    other
                )))
            }
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    Config::from_toml_str(&content)
}

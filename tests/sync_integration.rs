//! End-to-end tests for incremental sync: change detection, failure
//! isolation, bounded concurrency, persistence, and the search and temporal
//! hooks.

use anyhow::Result;
use async_trait::async_trait;
use knowledge_harness::chunk::SemanticChunker;
use knowledge_harness::config::{ChunkingConfig, HybridConfig, RagConfig, SyncConfig, TemporalConfig};
use knowledge_harness::embedding::{EmbeddingGateway, HashingEmbedder};
use knowledge_harness::models::{Fact, FactHit, Metadata, Priority};
use knowledge_harness::rag::{AdvancedSearchRequest, RagOptimizer};
use knowledge_harness::store::memory::InMemoryFactStore;
use knowledge_harness::store::{FactStore, SearchFilters};
use knowledge_harness::sync::IncrementalSyncEngine;
use knowledge_harness::sync_state::{InMemorySyncState, SqliteSyncState, SyncStateStore};
use knowledge_harness::temporal::TemporalKnowledgeManager;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

// ─── Helpers ────────────────────────────────────────────────────────

fn gateway() -> Arc<dyn EmbeddingGateway> {
    Arc::new(HashingEmbedder::new(256).unwrap())
}

fn setup_corpus() -> TempDir {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    fs::create_dir_all(&docs).unwrap();
    fs::write(
        docs.join("redis.md"),
        "# Redis\n\nRedis listens on port 6379 by default. It keeps the working set in memory.",
    )
    .unwrap();
    fs::write(
        docs.join("postgres.md"),
        "# Postgres\n\nPostgres uses port 5432 by default. Connections are pooled by the API.",
    )
    .unwrap();
    fs::write(
        docs.join("offsite.txt"),
        "The team offsite is planned for spring. Travel is booked through the usual portal.",
    )
    .unwrap();
    tmp
}

fn sync_config(root: &Path) -> SyncConfig {
    SyncConfig {
        root: root.join("docs"),
        max_concurrency: 2,
        ..Default::default()
    }
}

fn engine_with(
    root: &Path,
    store: Arc<dyn FactStore>,
    state: Arc<dyn SyncStateStore>,
) -> IncrementalSyncEngine {
    let chunker = SemanticChunker::new(gateway(), ChunkingConfig::default());
    IncrementalSyncEngine::new(sync_config(root), chunker, store, state)
}

/// One chunk per sentence for the short sentences used below.
fn sentence_chunks() -> ChunkingConfig {
    ChunkingConfig {
        min_chunk_size: 1,
        max_chunk_size: 40,
        overlap_sentences: 0,
        ..Default::default()
    }
}

fn set_mtime(path: &Path, time: SystemTime) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(time).unwrap();
}

fn mtime(path: &Path) -> SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

async fn texts_from(store: &InMemoryFactStore, source: &str) -> Vec<String> {
    let mut texts: Vec<String> = store
        .get_all_facts()
        .await
        .unwrap()
        .into_iter()
        .filter(|f| f.metadata.get("source").and_then(|v| v.as_str()) == Some(source))
        .map(|f| f.text)
        .collect();
    texts.sort();
    texts
}

async fn sources(store: &InMemoryFactStore) -> Vec<String> {
    let mut s: Vec<String> = store
        .get_all_facts()
        .await
        .unwrap()
        .into_iter()
        .filter_map(|f| f.metadata.get("source").and_then(|v| v.as_str()).map(String::from))
        .collect();
    s.sort();
    s.dedup();
    s
}

// ─── Change detection ───────────────────────────────────────────────

#[tokio::test]
async fn test_first_sync_adds_every_file() {
    let tmp = setup_corpus();
    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()));

    let metrics = engine.sync().await.unwrap();
    assert_eq!(metrics.scanned, 3);
    assert_eq!(metrics.added, 3);
    assert_eq!(metrics.changed, 0);
    assert_eq!(metrics.failed, 0);
    assert!(metrics.chunks_processed >= 3);
    assert!(!metrics.used_accelerated_path);
    assert_eq!(store.len().await, metrics.chunks_processed);
    assert_eq!(
        sources(&store).await,
        vec!["offsite.txt", "postgres.md", "redis.md"]
    );
}

#[tokio::test]
async fn test_sync_idempotent() {
    let tmp = setup_corpus();
    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()));

    engine.sync().await.unwrap();
    let facts_after_first = store.len().await;

    let second = engine.sync().await.unwrap();
    assert_eq!(second.changed, 0);
    assert_eq!(second.added, 0);
    assert_eq!(second.removed, 0);
    assert_eq!(second.chunks_processed, 0);
    assert_eq!(store.len().await, facts_after_first);
}

#[tokio::test]
async fn test_touch_without_edit_is_timestamp_only() {
    let tmp = setup_corpus();
    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()));
    engine.sync().await.unwrap();

    let path = tmp.path().join("docs/redis.md");
    set_mtime(&path, mtime(&path) + Duration::from_secs(3600));

    let metrics = engine.sync().await.unwrap();
    assert_eq!(metrics.timestamp_only, 1);
    assert_eq!(metrics.changed, 0);
    assert_eq!(metrics.chunks_processed, 0);

    // The new mtime was recorded, so a third run is a no-op.
    let third = engine.sync().await.unwrap();
    assert_eq!(third.timestamp_only, 0);
}

#[tokio::test]
async fn test_edit_with_same_mtime_is_reprocessed() {
    let tmp = setup_corpus();
    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()));
    engine.sync().await.unwrap();

    let path = tmp.path().join("docs/redis.md");
    let original = mtime(&path);
    fs::write(&path, "Redis now listens on port 6380 in staging.").unwrap();
    set_mtime(&path, original);

    let metrics = engine.sync().await.unwrap();
    assert_eq!(metrics.changed, 1);
    assert_eq!(metrics.added, 0);

    let texts: Vec<String> = store
        .get_all_facts()
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.text)
        .collect();
    assert!(texts.iter().any(|t| t.contains("6380")));
    assert!(!texts.iter().any(|t| t.contains("6379")));
}

#[tokio::test]
async fn test_rename_then_edit_scenario() {
    let tmp = setup_corpus();
    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()));
    engine.sync().await.unwrap();

    let docs = tmp.path().join("docs");
    fs::rename(docs.join("offsite.txt"), docs.join("offsite-2025.txt")).unwrap();
    let renamed = engine.sync().await.unwrap();
    assert_eq!(renamed.changed, 0);
    assert_eq!(renamed.added, 1);
    assert_eq!(renamed.removed, 1);

    fs::write(
        docs.join("postgres.md"),
        "# Postgres\n\nPostgres 16 uses port 5433 in this cluster.",
    )
    .unwrap();
    let edited = engine.sync().await.unwrap();
    assert_eq!(edited.changed, 1);
    assert_eq!(edited.added, 0);
    assert_eq!(edited.removed, 0);
}

#[tokio::test]
async fn test_removed_file_deletes_owned_facts() {
    let tmp = setup_corpus();
    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()));
    engine.sync().await.unwrap();

    fs::remove_file(tmp.path().join("docs/redis.md")).unwrap();
    let metrics = engine.sync().await.unwrap();
    assert_eq!(metrics.removed, 1);
    assert_eq!(sources(&store).await, vec!["offsite.txt", "postgres.md"]);
}

#[tokio::test]
async fn test_empty_file_is_tracked_without_facts() {
    let tmp = setup_corpus();
    fs::write(tmp.path().join("docs/empty.md"), "").unwrap();
    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()));

    let metrics = engine.sync().await.unwrap();
    assert_eq!(metrics.added, 4);
    assert_eq!(sources(&store).await.len(), 3);
    assert_eq!(engine.sync().await.unwrap().added, 0);
}

// ─── Failure isolation ──────────────────────────────────────────────

/// Rejects any fact whose text mentions POISON.
struct PickyStore {
    inner: InMemoryFactStore,
}

#[async_trait]
impl FactStore for PickyStore {
    async fn store_fact(&self, text: &str, metadata: &Metadata) -> Result<String> {
        if text.contains("POISON") {
            anyhow::bail!("rejected by store");
        }
        self.inner.store_fact(text, metadata).await
    }

    async fn store_fact_with_embedding(
        &self,
        text: &str,
        metadata: &Metadata,
        embedding: &[f32],
    ) -> Result<String> {
        if text.contains("POISON") {
            anyhow::bail!("rejected by store");
        }
        self.inner
            .store_fact_with_embedding(text, metadata, embedding)
            .await
    }

    async fn delete_fact(&self, id: &str) -> Result<()> {
        self.inner.delete_fact(id).await
    }

    async fn get_all_facts(&self) -> Result<Vec<Fact>> {
        self.inner.get_all_facts().await
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&SearchFilters>,
    ) -> Result<Vec<FactHit>> {
        self.inner.search(query, top_k, filters).await
    }
}

#[tokio::test]
async fn test_failing_file_does_not_abort_batch() {
    let tmp = setup_corpus();
    let bad = tmp.path().join("docs/bad.md");
    fs::write(&bad, "This file contains POISON.").unwrap();

    let store = Arc::new(PickyStore {
        inner: InMemoryFactStore::with_gateway(gateway()),
    });
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()));

    let metrics = engine.sync().await.unwrap();
    assert_eq!(metrics.added, 3);
    assert_eq!(metrics.failed, 1);

    // The failed file keeps being retried until it succeeds.
    let retry = engine.sync().await.unwrap();
    assert_eq!(retry.failed, 1);
    assert_eq!(retry.added + retry.changed, 0);

    fs::write(&bad, "This file is fine now.").unwrap();
    let healed = engine.sync().await.unwrap();
    assert_eq!(healed.failed, 0);
    assert_eq!(healed.changed, 1);
    assert_eq!(engine.sync().await.unwrap().changed, 0);
}

#[tokio::test]
async fn test_rejected_chunk_keeps_siblings_until_file_heals() {
    let tmp = setup_corpus();
    let multi = tmp.path().join("docs/multi.md");
    fs::write(
        &multi,
        "Alpha notes cover the cache tier. POISON sits in this line. Gamma notes cover the queue tier.",
    )
    .unwrap();

    let store = Arc::new(PickyStore {
        inner: InMemoryFactStore::with_gateway(gateway()),
    });
    let chunker = SemanticChunker::new(gateway(), sentence_chunks());
    let engine = IncrementalSyncEngine::new(
        sync_config(tmp.path()),
        chunker,
        store.clone(),
        Arc::new(InMemorySyncState::new()),
    );

    let first = engine.sync().await.unwrap();
    assert_eq!(first.failed, 1);
    assert_eq!(first.added, 3);
    assert_eq!(
        texts_from(&store.inner, "multi.md").await,
        vec![
            "Alpha notes cover the cache tier.",
            "Gamma notes cover the queue tier."
        ]
    );

    // Still rejected: reprocessed, and every stored sibling stays tracked.
    let second = engine.sync().await.unwrap();
    assert_eq!(second.failed, 1);
    assert_eq!(texts_from(&store.inner, "multi.md").await.len(), 4);

    fs::write(
        &multi,
        "Alpha notes cover the cache tier. Beta sits in this line. Gamma notes cover the queue tier.",
    )
    .unwrap();
    let healed = engine.sync().await.unwrap();
    assert_eq!(healed.failed, 0);
    assert_eq!(healed.changed, 1);
    assert_eq!(
        texts_from(&store.inner, "multi.md").await,
        vec![
            "Alpha notes cover the cache tier.",
            "Beta sits in this line.",
            "Gamma notes cover the queue tier."
        ]
    );
}

#[tokio::test]
async fn test_missing_root_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryFactStore::new());
    let engine = engine_with(tmp.path(), store, Arc::new(InMemorySyncState::new()));
    assert!(engine.sync().await.is_err());
}

// ─── Concurrency ────────────────────────────────────────────────────

/// Records the largest number of overlapping `embed` calls.
struct TrackingEmbedder {
    inner: HashingEmbedder,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl EmbeddingGateway for TrackingEmbedder {
    fn model_name(&self) -> &str {
        "tracking"
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(15)).await;
        let out = self.inner.embed(texts).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        out
    }
}

#[tokio::test]
async fn test_files_processed_within_concurrency_limit() {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    fs::create_dir_all(&docs).unwrap();
    for i in 0..8 {
        fs::write(
            docs.join(format!("note-{}.md", i)),
            format!("Note {} covers one topic. It has a second sentence too.", i),
        )
        .unwrap();
    }

    let tracker = Arc::new(TrackingEmbedder {
        inner: HashingEmbedder::new(64).unwrap(),
        in_flight: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let config = sync_config(tmp.path());
    let limit = config.max_concurrency;
    let chunker = SemanticChunker::new(tracker.clone(), ChunkingConfig::default());
    let engine = IncrementalSyncEngine::new(
        config,
        chunker,
        Arc::new(InMemoryFactStore::new()),
        Arc::new(InMemorySyncState::new()),
    );

    let metrics = engine.sync().await.unwrap();
    assert_eq!(metrics.added, 8);
    let peak = tracker.peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= limit, "peak {} exceeds limit {}", peak, limit);
}

// ─── Persistence ────────────────────────────────────────────────────

#[tokio::test]
async fn test_sqlite_state_survives_restart() {
    let tmp = setup_corpus();
    let state_path = tmp.path().join("data/sync.sqlite");
    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));

    {
        let state = Arc::new(SqliteSyncState::open(&state_path).await.unwrap());
        let engine = engine_with(tmp.path(), store.clone(), state.clone());
        assert_eq!(engine.sync().await.unwrap().added, 3);
        state.close().await;
    }

    let state = Arc::new(SqliteSyncState::open(&state_path).await.unwrap());
    let engine = engine_with(tmp.path(), store.clone(), state);
    let metrics = engine.sync().await.unwrap();
    assert_eq!(metrics.added, 0);
    assert_eq!(metrics.changed, 0);

    fs::remove_file(tmp.path().join("docs/offsite.txt")).unwrap();
    assert_eq!(engine.sync().await.unwrap().removed, 1);
    assert_eq!(sources(&store).await, vec!["postgres.md", "redis.md"]);
}

// ─── Search cache ───────────────────────────────────────────────────

#[tokio::test]
async fn test_corpus_changes_clear_search_cache() {
    let tmp = setup_corpus();
    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let rag = Arc::new(RagOptimizer::new(
        store.clone(),
        gateway(),
        HybridConfig::default(),
        RagConfig::default(),
    ));
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()))
        .with_search(rag.clone());
    engine.sync().await.unwrap();

    let request = AdvancedSearchRequest::new("redis port").rerank(false);
    let (results, _) = rag.advanced_search(&request).await.unwrap();
    assert!(results.iter().any(|r| r.source == "redis.md"));

    // Nothing changed on disk, so the cached answer stands.
    engine.sync().await.unwrap();
    assert_eq!(rag.cache_len().await, 1);

    fs::remove_file(tmp.path().join("docs/redis.md")).unwrap();
    assert_eq!(engine.sync().await.unwrap().removed, 1);
    assert_eq!(rag.cache_len().await, 0);

    let (results, metrics) = rag.advanced_search(&request).await.unwrap();
    assert!(!metrics.cache_hit);
    assert!(results.iter().all(|r| r.source != "redis.md"));
}

// ─── Temporal hooks ─────────────────────────────────────────────────

#[tokio::test]
async fn test_sync_registers_and_forgets_temporal_records() {
    let tmp = setup_corpus();
    let security = tmp.path().join("docs/security");
    fs::create_dir_all(&security).unwrap();
    fs::write(security.join("keys.md"), "Rotate signing keys every quarter.").unwrap();

    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let temporal = Arc::new(TemporalKnowledgeManager::new(
        store.clone(),
        TemporalConfig::default(),
    ));
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()))
        .with_temporal(temporal.clone());

    engine.sync().await.unwrap();
    assert_eq!(temporal.len().await, store.len().await);

    let facts = store.get_all_facts().await.unwrap();
    let key_fact = facts
        .iter()
        .find(|f| f.metadata.get("source").and_then(|v| v.as_str()) == Some("security/keys.md"))
        .unwrap();
    let record = temporal.get(&key_fact.id).await.unwrap();
    assert_eq!(record.priority, Priority::Critical);
    assert_eq!(record.category, "security/keys.md");

    fs::remove_file(security.join("keys.md")).unwrap();
    engine.sync().await.unwrap();
    assert!(temporal.get(&key_fact.id).await.is_none());
    assert_eq!(temporal.len().await, store.len().await);
}

#[tokio::test]
async fn test_expired_critical_content_is_invalidated_first() {
    let tmp = setup_corpus();
    let security = tmp.path().join("docs/security");
    fs::create_dir_all(&security).unwrap();
    fs::write(security.join("keys.md"), "Rotate signing keys every quarter.").unwrap();

    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let temporal = Arc::new(TemporalKnowledgeManager::new(
        store.clone(),
        TemporalConfig::default(),
    ));
    let engine = engine_with(tmp.path(), store.clone(), Arc::new(InMemorySyncState::new()))
        .with_temporal(temporal.clone());
    engine.sync().await.unwrap();
    let before = store.len().await;

    // Two days on, only the 24h critical tier has expired.
    let report = temporal
        .run_cycle_at(chrono::Utc::now() + chrono::Duration::hours(48))
        .await;
    assert_eq!(report.jobs_created, 1);
    assert_eq!(report.failed, 0);
    assert!(report.deleted >= 1);
    assert_eq!(store.len().await, before - report.deleted);
    assert!(!sources(&store).await.contains(&"security/keys.md".to_string()));
    assert_eq!(temporal.len().await, store.len().await);
}

// ─── Daemon ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_sync_daemon_runs_and_stops() {
    let tmp = setup_corpus();
    let store = Arc::new(InMemoryFactStore::with_gateway(gateway()));
    let engine = Arc::new(engine_with(
        tmp.path(),
        store.clone(),
        Arc::new(InMemorySyncState::new()),
    ));

    let handle = engine.spawn_daemon(Some(Duration::from_millis(20)));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(handle.is_running());
    handle.shutdown().await;

    assert_eq!(sources(&store).await.len(), 3);
}

//! Incremental filesystem sync into the fact store.
//!
//! A run:
//!
//! 1. Loads the [`FileRecord`] table from the [`SyncStateStore`].
//! 2. Walks `sync.root`, keeping files that match `include_globs` and none
//!    of the excludes (`.git`, `target`, and `node_modules` are always
//!    excluded), hashing each file's bytes with SHA-256.
//! 3. Diffs against the table. The content hash is authoritative: a new
//!    hash means reprocessing whatever the mtime says, and an mtime change
//!    with an unchanged hash only updates the record. Tracked files that
//!    are no longer on disk are removed.
//! 4. Processes new and changed files concurrently, at most
//!    `sync.max_concurrency` at a time: chunk, embed in batches, store each
//!    chunk as a fact. Only a fully stored file gets its new hash recorded
//!    and its previous facts deleted.
//! 5. Deletes every fact owned by a removed file, then evicts its record.
//! 6. Clears the attached search cache if anything was stored or removed,
//!    then writes the whole table back once.
//!
//! A file whose processing fails is counted in `failed` and skipped. If only
//! some chunks were stored, the stored fact ids are kept on the record and
//! its hash is cleared, so the next run reprocesses the file and cleans up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tokio::sync::Mutex;
use walkdir::WalkDir;

use crate::chunk::SemanticChunker;
use crate::config::SyncConfig;
use crate::daemon::{PeriodicTask, ShutdownHandle};
use crate::embedding::embed_batched;
use crate::models::{FileRecord, Metadata, SyncMetrics};
use crate::rag::RagOptimizer;
use crate::store::FactStore;
use crate::sync_state::{FileRecords, SyncStateStore};
use crate::temporal::TemporalKnowledgeManager;
use crate::text;

/// A file found by the scan.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub relative_path: String,
    pub content_hash: String,
    pub size: u64,
    pub modified_at: i64,
}

/// Files found by one scan. Paths that matched but could not be read are
/// listed separately so their records are neither reprocessed nor removed.
#[derive(Debug, Default)]
pub struct ScanResult {
    pub files: Vec<ScannedFile>,
    pub unreadable: Vec<String>,
}

/// Walk `config.root` and hash every matching file.
pub fn scan_files(config: &SyncConfig) -> Result<ScanResult> {
    let root = &config.root;
    if !root.exists() {
        bail!("Sync root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut result = ScanResult::default();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        match scan_file(path, &rel_str) {
            Ok(file) => result.files.push(file),
            Err(e) => {
                tracing::warn!(path = %rel_str, error = %e, "failed to read file");
                result.unreadable.push(rel_str);
            }
        }
    }

    // Sort for deterministic ordering
    result
        .files
        .sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    Ok(result)
}

fn scan_file(path: &Path, relative_path: &str) -> Result<ScannedFile> {
    let metadata = std::fs::metadata(path)?;
    let bytes = std::fs::read(path)?;
    Ok(ScannedFile {
        path: path.to_path_buf(),
        relative_path: relative_path.to_string(),
        content_hash: text::hash_bytes(&bytes),
        size: bytes.len() as u64,
        modified_at: mtime_secs(metadata.modified().ok()),
    })
}

fn mtime_secs(modified: Option<SystemTime>) -> i64 {
    modified
        .unwrap_or(UNIX_EPOCH)
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeKind {
    Added,
    Changed,
}

/// The diff between a scan and the stored table.
#[derive(Debug, Default)]
pub struct SyncPlan {
    /// New files.
    pub added: Vec<ScannedFile>,
    /// Known files whose content hash differs.
    pub changed: Vec<ScannedFile>,
    /// Known files whose mtime moved but whose bytes did not.
    pub timestamp_only: Vec<ScannedFile>,
    /// Relative paths of tracked files that are gone.
    pub removed: Vec<String>,
}

/// Diff `scan` against `previous`.
pub fn plan_sync(scan: &ScanResult, previous: &FileRecords) -> SyncPlan {
    let mut plan = SyncPlan::default();
    for file in &scan.files {
        match previous.get(&file.relative_path) {
            None => plan.added.push(file.clone()),
            Some(record) if record.content_hash != file.content_hash => {
                plan.changed.push(file.clone())
            }
            Some(record) if record.modified_at != file.modified_at => {
                plan.timestamp_only.push(file.clone())
            }
            Some(_) => {}
        }
    }

    let present: std::collections::HashSet<&str> = scan
        .files
        .iter()
        .map(|f| f.relative_path.as_str())
        .chain(scan.unreadable.iter().map(String::as_str))
        .collect();
    plan.removed = previous
        .keys()
        .filter(|k| !present.contains(k.as_str()))
        .cloned()
        .collect();
    plan.removed.sort();
    plan
}

enum FileOutcome {
    Stored {
        record: FileRecord,
        kind: ChangeKind,
        chunks: usize,
    },
    Partial {
        record: FileRecord,
        chunks: usize,
    },
    Failed {
        relative_path: String,
    },
}

enum RemovalOutcome {
    Evicted { relative_path: String },
    Retained { record: FileRecord },
}

pub struct IncrementalSyncEngine {
    config: SyncConfig,
    chunker: SemanticChunker,
    store: Arc<dyn FactStore>,
    state: Arc<dyn SyncStateStore>,
    temporal: Option<Arc<TemporalKnowledgeManager>>,
    search: Option<Arc<RagOptimizer>>,
    run_lock: Mutex<()>,
}

impl IncrementalSyncEngine {
    pub fn new(
        config: SyncConfig,
        chunker: SemanticChunker,
        store: Arc<dyn FactStore>,
        state: Arc<dyn SyncStateStore>,
    ) -> Self {
        Self {
            config,
            chunker,
            store,
            state,
            temporal: None,
            search: None,
            run_lock: Mutex::new(()),
        }
    }

    /// Register stored facts with `temporal` and forget deleted ones.
    pub fn with_temporal(mut self, temporal: Arc<TemporalKnowledgeManager>) -> Self {
        self.temporal = Some(temporal);
        self
    }

    /// Clear `search`'s result cache after any run that changes the corpus.
    pub fn with_search(mut self, search: Arc<RagOptimizer>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Run one sync. Concurrent calls are serialized.
    ///
    /// Per-file failures are counted in the metrics. An error means the run
    /// could not start (unreadable state, missing root) or its result could
    /// not be persisted.
    pub async fn sync(&self) -> Result<SyncMetrics> {
        let _guard = self.run_lock.lock().await;
        let start = Instant::now();
        let mut metrics = SyncMetrics::default();

        let mut records = self.state.load().await?;

        let scan_config = self.config.clone();
        let scan = tokio::task::spawn_blocking(move || scan_files(&scan_config))
            .await
            .context("Filesystem scan panicked")??;
        metrics.scanned = scan.files.len() + scan.unreadable.len();
        metrics.failed += scan.unreadable.len();

        let plan = plan_sync(&scan, &records);
        tracing::debug!(
            added = plan.added.len(),
            changed = plan.changed.len(),
            timestamp_only = plan.timestamp_only.len(),
            removed = plan.removed.len(),
            "sync plan"
        );

        for file in &plan.timestamp_only {
            if let Some(record) = records.get_mut(&file.relative_path) {
                record.modified_at = file.modified_at;
                record.size = file.size;
                metrics.timestamp_only += 1;
            }
        }

        let work: Vec<(ScannedFile, ChangeKind, Option<FileRecord>)> = plan
            .added
            .into_iter()
            .map(|f| (f, ChangeKind::Added))
            .chain(plan.changed.into_iter().map(|f| (f, ChangeKind::Changed)))
            .map(|(f, kind)| {
                let previous = records.get(&f.relative_path).cloned();
                (f, kind, previous)
            })
            .collect();

        let outcomes: Vec<FileOutcome> = stream::iter(work)
            .map(|(file, kind, previous)| self.process_file(file, kind, previous))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut processed_any = false;
        for outcome in outcomes {
            match outcome {
                FileOutcome::Stored {
                    record,
                    kind,
                    chunks,
                } => {
                    processed_any = true;
                    metrics.chunks_processed += chunks;
                    match kind {
                        ChangeKind::Added => metrics.added += 1,
                        ChangeKind::Changed => metrics.changed += 1,
                    }
                    records.insert(record.relative_path.clone(), record);
                }
                FileOutcome::Partial { record, chunks } => {
                    processed_any = true;
                    metrics.chunks_processed += chunks;
                    metrics.failed += 1;
                    records.insert(record.relative_path.clone(), record);
                }
                FileOutcome::Failed { relative_path } => {
                    tracing::debug!(path = %relative_path, "file left for the next run");
                    metrics.failed += 1;
                }
            }
        }

        let removals: Vec<FileRecord> = plan
            .removed
            .iter()
            .filter_map(|rel| records.get(rel).cloned())
            .collect();
        let removal_outcomes: Vec<RemovalOutcome> = stream::iter(removals)
            .map(|record| self.remove_file(record))
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;
        for outcome in removal_outcomes {
            match outcome {
                RemovalOutcome::Evicted { relative_path } => {
                    records.remove(&relative_path);
                    metrics.removed += 1;
                }
                RemovalOutcome::Retained { record } => {
                    metrics.failed += 1;
                    records.insert(record.relative_path.clone(), record);
                }
            }
        }

        if processed_any || metrics.removed > 0 {
            if let Some(search) = &self.search {
                search.clear_cache().await;
            }
        }

        self.state
            .save_all(&records)
            .await
            .context("Failed to persist sync state")?;

        metrics.used_accelerated_path = processed_any && self.chunker.gateway().is_accelerated();
        metrics.elapsed = start.elapsed();
        tracing::info!(
            scanned = metrics.scanned,
            added = metrics.added,
            changed = metrics.changed,
            removed = metrics.removed,
            timestamp_only = metrics.timestamp_only,
            failed = metrics.failed,
            chunks = metrics.chunks_processed,
            elapsed_ms = metrics.elapsed.as_millis() as u64,
            "sync complete"
        );
        Ok(metrics)
    }

    async fn process_file(
        &self,
        file: ScannedFile,
        kind: ChangeKind,
        previous: Option<FileRecord>,
    ) -> FileOutcome {
        let start = Instant::now();
        let rel = file.relative_path.clone();

        // Re-read so the recorded hash always matches what was chunked.
        let bytes = match tokio::fs::read(&file.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(path = %rel, error = %e, "failed to read file");
                return FileOutcome::Failed { relative_path: rel };
            }
        };
        let content_hash = text::hash_bytes(&bytes);
        let content = String::from_utf8_lossy(&bytes);

        let mut metadata = Metadata::new();
        metadata.insert("source".into(), rel.clone().into());
        metadata.insert("path".into(), file.path.to_string_lossy().to_string().into());
        metadata.insert("content_hash".into(), content_hash.clone().into());

        let chunks: Vec<_> = self
            .chunker
            .chunk(&content, &metadata)
            .await
            .into_iter()
            .filter(|c| !c.content.trim().is_empty())
            .collect();
        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();

        let vectors = match embed_batched(
            self.chunker.gateway().as_ref(),
            &texts,
            self.config.embed_batch_size,
        )
        .await
        {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(path = %rel, error = %e, "embedding failed");
                return FileOutcome::Failed { relative_path: rel };
            }
        };

        let writes = chunks.iter().zip(vectors.iter()).map(|(chunk, vector)| {
            self.store
                .store_fact_with_embedding(&chunk.content, &chunk.metadata, vector)
        });
        let mut stored_ids = Vec::with_capacity(chunks.len());
        let mut write_failures = 0;
        for outcome in join_all(writes).await {
            match outcome {
                Ok(id) => stored_ids.push(id),
                Err(e) => {
                    write_failures += 1;
                    tracing::warn!(path = %rel, error = %e, "failed to store chunk");
                }
            }
        }

        let previous_ids = previous
            .as_ref()
            .map(|r| r.chunk_ids.clone())
            .unwrap_or_default();
        let now = Utc::now().timestamp();
        let processing_ms = start.elapsed().as_millis() as u64;
        self.register_temporal(&stored_ids, &rel, &file.path, kind).await;

        if write_failures > 0 {
            let mut chunk_ids = previous_ids;
            chunk_ids.extend(stored_ids.iter().cloned());
            let record = FileRecord {
                path: file.path,
                relative_path: rel,
                content_hash: String::new(),
                size: bytes.len() as u64,
                modified_at: file.modified_at,
                last_synced_at: previous.map(|r| r.last_synced_at).unwrap_or(0),
                chunk_count: chunk_ids.len(),
                chunk_ids,
                processing_ms,
            };
            return FileOutcome::Partial {
                record,
                chunks: stored_ids.len(),
            };
        }

        // Replace: drop the facts of the previous version.
        let leftover = self.delete_facts(&previous_ids, &rel).await;
        let mut chunk_ids = stored_ids;
        let chunk_count = chunk_ids.len();
        chunk_ids.extend(leftover);

        FileOutcome::Stored {
            record: FileRecord {
                path: file.path,
                relative_path: rel,
                content_hash,
                size: bytes.len() as u64,
                modified_at: file.modified_at,
                last_synced_at: now,
                chunk_ids,
                chunk_count,
                processing_ms,
            },
            kind,
            chunks: chunk_count,
        }
    }

    async fn remove_file(&self, mut record: FileRecord) -> RemovalOutcome {
        let leftover = self
            .delete_facts(&record.chunk_ids, &record.relative_path)
            .await;
        if leftover.is_empty() {
            tracing::debug!(path = %record.relative_path, "file removed");
            RemovalOutcome::Evicted {
                relative_path: record.relative_path,
            }
        } else {
            record.chunk_count = leftover.len();
            record.chunk_ids = leftover;
            RemovalOutcome::Retained { record }
        }
    }

    /// Delete facts in parallel, returning the ids that could not be deleted.
    async fn delete_facts(&self, ids: &[String], rel: &str) -> Vec<String> {
        let outcomes = join_all(ids.iter().map(|id| self.store.delete_fact(id))).await;
        let mut leftover = Vec::new();
        for (id, outcome) in ids.iter().zip(outcomes) {
            match outcome {
                Ok(()) => {
                    if let Some(temporal) = &self.temporal {
                        temporal.forget(id).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %rel, fact_id = %id, error = %e, "failed to delete fact");
                    leftover.push(id.clone());
                }
            }
        }
        leftover
    }

    async fn register_temporal(&self, ids: &[String], rel: &str, path: &Path, kind: ChangeKind) {
        let Some(temporal) = &self.temporal else {
            return;
        };
        let path = path.to_string_lossy();
        for id in ids {
            temporal.register_content(id, rel, Some(&path)).await;
            if kind == ChangeKind::Changed {
                temporal.update_modification(id).await;
            }
        }
    }

    /// Run [`sync`](Self::sync) every `interval` (defaults to
    /// `sync.interval_secs`) until the handle is shut down.
    pub fn spawn_daemon(self: &Arc<Self>, interval: Option<Duration>) -> ShutdownHandle {
        let interval = interval.unwrap_or_else(|| Duration::from_secs(self.config.interval_secs));
        let engine = Arc::clone(self);
        PeriodicTask::new("sync-daemon", interval).spawn(move || {
            let engine = Arc::clone(&engine);
            async move { engine.sync().await.map(|_| ()) }
        })
    }
}

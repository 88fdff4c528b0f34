//! Durable [`FileRecord`] table.
//!
//! The sync engine loads the whole table at the start of a run and writes
//! it back once at the end. [`SqliteSyncState`] replaces the table inside a
//! single transaction, so a crash mid-run leaves the previous run's state
//! intact.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use tokio::sync::Mutex;

use crate::config::SyncConfig;
use crate::db;
use crate::migrate;
use crate::models::FileRecord;

/// Records keyed by path relative to the sync root.
pub type FileRecords = HashMap<String, FileRecord>;

#[async_trait]
pub trait SyncStateStore: Send + Sync {
    async fn load(&self) -> Result<FileRecords>;

    /// Replace the stored table with `records`.
    async fn save_all(&self, records: &FileRecords) -> Result<()>;
}

pub struct SqliteSyncState {
    pool: SqlitePool,
}

impl SqliteSyncState {
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool)
            .await
            .context("Failed to migrate sync state")?;
        Ok(Self { pool })
    }

    /// Open the database at `sync.state_path`.
    pub async fn from_config(config: &SyncConfig) -> Result<Self> {
        Self::open(&config.state_path).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl SyncStateStore for SqliteSyncState {
    async fn load(&self) -> Result<FileRecords> {
        let rows = sqlx::query(
            r#"
            SELECT relative_path, path, content_hash, size, modified_at, last_synced_at,
                   chunk_ids, chunk_count, processing_ms
            FROM file_records
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load sync state")?;

        let mut records = FileRecords::with_capacity(rows.len());
        for row in &rows {
            let relative_path: String = row.get("relative_path");
            let chunk_ids_json: String = row.get("chunk_ids");
            // An unreadable row is dropped, so the file is treated as new.
            let chunk_ids: Vec<String> = match serde_json::from_str(&chunk_ids_json) {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::warn!(relative_path = %relative_path, error = %e, "skipping corrupt sync record");
                    continue;
                }
            };
            let path: String = row.get("path");
            let size: i64 = row.get("size");
            let chunk_count: i64 = row.get("chunk_count");
            let processing_ms: i64 = row.get("processing_ms");

            records.insert(
                relative_path.clone(),
                FileRecord {
                    path: PathBuf::from(path),
                    relative_path,
                    content_hash: row.get("content_hash"),
                    size: size.max(0) as u64,
                    modified_at: row.get("modified_at"),
                    last_synced_at: row.get("last_synced_at"),
                    chunk_ids,
                    chunk_count: chunk_count.max(0) as usize,
                    processing_ms: processing_ms.max(0) as u64,
                },
            );
        }
        Ok(records)
    }

    async fn save_all(&self, records: &FileRecords) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM file_records")
            .execute(&mut *tx)
            .await?;

        for record in records.values() {
            let chunk_ids = serde_json::to_string(&record.chunk_ids)?;
            sqlx::query(
                r#"
                INSERT INTO file_records (relative_path, path, content_hash, size, modified_at,
                    last_synced_at, chunk_ids, chunk_count, processing_ms)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.relative_path)
            .bind(record.path.to_string_lossy().to_string())
            .bind(&record.content_hash)
            .bind(record.size as i64)
            .bind(record.modified_at)
            .bind(record.last_synced_at)
            .bind(chunk_ids)
            .bind(record.chunk_count as i64)
            .bind(record.processing_ms as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await.context("Failed to commit sync state")?;
        Ok(())
    }
}

/// Non-durable state, for tests and ephemeral engines.
#[derive(Default)]
pub struct InMemorySyncState {
    records: Mutex<FileRecords>,
}

impl InMemorySyncState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStateStore for InMemorySyncState {
    async fn load(&self) -> Result<FileRecords> {
        Ok(self.records.lock().await.clone())
    }

    async fn save_all(&self, records: &FileRecords) -> Result<()> {
        *self.records.lock().await = records.clone();
        Ok(())
    }
}

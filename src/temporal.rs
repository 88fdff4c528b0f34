//! Time-based lifecycle management for stored content.
//!
//! Each registered piece of content gets a [`TemporalRecord`] whose
//! [`Priority`] is fixed at registration from its category and path, and
//! whose TTL follows from the priority:
//!
//! | Priority | Matched terms (substring) | TTL |
//! |----------|---------------------------|-----|
//! | critical | security, auth, credential, secret, incident, ... | 24h |
//! | high | api, config, deployment, production, database, ... | 72h |
//! | medium | guide, tutorial, documentation, reference, ... (default) | 168h |
//! | low | archive, draft, note, misc, deprecated, ... | 720h |
//!
//! A maintenance cycle ([`TemporalKnowledgeManager::run_cycle`]) groups
//! expired ids into one [`InvalidationJob`] per priority and processes the
//! queue: each job deletes its facts in parallel and forgets only the
//! records whose deletion succeeded, so failures are retried by the next
//! scan.
//!
//! Every time-dependent method has an `_at` variant taking `now` explicitly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::TemporalConfig;
use crate::daemon::{PeriodicTask, ShutdownHandle};
use crate::models::{
    hours_between, FreshnessState, InvalidationJob, JobType, Priority, TemporalRecord,
};
use crate::rag::RagOptimizer;
use crate::store::FactStore;

const CRITICAL_TERMS: &[&str] = &[
    "security",
    "auth",
    "authentication",
    "credential",
    "password",
    "secret",
    "vulnerability",
    "compliance",
    "incident",
];

const HIGH_TERMS: &[&str] = &[
    "api",
    "config",
    "configuration",
    "deployment",
    "production",
    "infrastructure",
    "database",
    "architecture",
];

const MEDIUM_TERMS: &[&str] = &[
    "guide",
    "tutorial",
    "documentation",
    "howto",
    "reference",
    "procedure",
];

const LOW_TERMS: &[&str] = &[
    "archive", "draft", "note", "misc", "personal", "deprecated",
];

/// Window over which access recency decays to zero.
const ACCESS_WINDOW_HOURS: f64 = 24.0;
/// Update frequency (per day) at which the frequency factor saturates.
const MAX_UPDATE_FREQUENCY: f64 = 2.0;
const PER_ITEM_DELETE_ESTIMATE: Duration = Duration::from_millis(10);

fn terms_for(priority: Priority) -> &'static [&'static str] {
    match priority {
        Priority::Critical => CRITICAL_TERMS,
        Priority::High => HIGH_TERMS,
        Priority::Medium => MEDIUM_TERMS,
        Priority::Low => LOW_TERMS,
    }
}

/// Priority for a category and optional path. Both are lowercased and
/// searched for each tier's terms as substrings; the highest tier with a
/// match wins and no match is medium.
pub fn classify_priority(category: &str, path: Option<&str>) -> Priority {
    let category = category.to_lowercase();
    let path = path.map(str::to_lowercase).unwrap_or_default();
    Priority::ALL
        .into_iter()
        .find(|p| {
            terms_for(*p)
                .iter()
                .any(|t| category.contains(t) || path.contains(t))
        })
        .unwrap_or(Priority::Medium)
}

/// Freshness in `[0, 1]`: 50% age decay over the TTL, 30% access recency
/// over 24h, 20% update frequency capped at two updates per day.
pub fn freshness_score(record: &TemporalRecord, now: DateTime<Utc>) -> f64 {
    let age_factor = if record.ttl_hours > 0.0 {
        (1.0 - record.age_hours(now) / record.ttl_hours).max(0.0)
    } else {
        0.0
    };
    let access_factor =
        (1.0 - hours_between(record.accessed_at, now) / ACCESS_WINDOW_HOURS).max(0.0);
    let frequency_factor = record.update_frequency.min(MAX_UPDATE_FREQUENCY) / MAX_UPDATE_FREQUENCY;
    (0.5 * age_factor + 0.3 * access_factor + 0.2 * frequency_factor).clamp(0.0, 1.0)
}

fn update_frequency(record: &TemporalRecord, now: DateTime<Utc>) -> f64 {
    let days = (hours_between(record.created_at, now) / 24.0).max(1.0);
    record.modification_count as f64 / days
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TemporalAnalytics {
    pub total: usize,
    pub by_priority: HashMap<Priority, usize>,
    pub by_state: HashMap<FreshnessState, usize>,
    pub average_freshness: f64,
    pub expired: usize,
    pub refresh_candidates: usize,
}

/// Outcome of processing one invalidation job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub deleted: usize,
    pub failed: usize,
}

/// Summary of one maintenance cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub jobs_created: usize,
    pub deleted: usize,
    pub failed: usize,
    pub refresh_candidates: Vec<String>,
}

pub struct TemporalKnowledgeManager {
    store: Arc<dyn FactStore>,
    config: TemporalConfig,
    records: RwLock<HashMap<String, TemporalRecord>>,
    queue: Mutex<VecDeque<InvalidationJob>>,
    search: Option<Arc<RagOptimizer>>,
}

impl TemporalKnowledgeManager {
    pub fn new(store: Arc<dyn FactStore>, config: TemporalConfig) -> Self {
        Self {
            store,
            config,
            records: RwLock::new(HashMap::new()),
            queue: Mutex::new(VecDeque::new()),
            search: None,
        }
    }

    /// Clear `search`'s result cache whenever a job deletes content.
    pub fn with_search(mut self, search: Arc<RagOptimizer>) -> Self {
        self.search = Some(search);
        self
    }

    pub async fn register_content(
        &self,
        content_id: &str,
        category: &str,
        path: Option<&str>,
    ) -> TemporalRecord {
        self.register_content_at(content_id, category, path, Utc::now())
            .await
    }

    /// Register content. Registering a known id counts as a modification.
    pub async fn register_content_at(
        &self,
        content_id: &str,
        category: &str,
        path: Option<&str>,
        now: DateTime<Utc>,
    ) -> TemporalRecord {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get_mut(content_id) {
            touch_modified(existing, now);
            return existing.clone();
        }

        let priority = classify_priority(category, path);
        let mut record = TemporalRecord {
            content_id: content_id.to_string(),
            category: category.to_string(),
            path: path.map(str::to_string),
            created_at: now,
            modified_at: now,
            accessed_at: now,
            access_count: 0,
            modification_count: 0,
            priority,
            ttl_hours: priority.ttl_hours(),
            freshness: 0.0,
            update_frequency: 0.0,
            invalidate_at: None,
        };
        record.freshness = freshness_score(&record, now);
        records.insert(content_id.to_string(), record.clone());
        tracing::trace!(content_id, ?priority, "registered content");
        record
    }

    /// Record an access. Returns the new freshness, or `None` for an
    /// unknown id.
    pub async fn update_access(&self, content_id: &str) -> Option<f64> {
        self.update_access_at(content_id, Utc::now()).await
    }

    pub async fn update_access_at(&self, content_id: &str, now: DateTime<Utc>) -> Option<f64> {
        let mut records = self.records.write().await;
        let record = records.get_mut(content_id)?;
        record.access_count += 1;
        record.accessed_at = now;
        record.freshness = freshness_score(record, now);
        Some(record.freshness)
    }

    /// Record a modification. Returns the new freshness, or `None` for an
    /// unknown id.
    pub async fn update_modification(&self, content_id: &str) -> Option<f64> {
        self.update_modification_at(content_id, Utc::now()).await
    }

    pub async fn update_modification_at(
        &self,
        content_id: &str,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let mut records = self.records.write().await;
        let record = records.get_mut(content_id)?;
        touch_modified(record, now);
        Some(record.freshness)
    }

    /// Drop a record without touching the fact store.
    pub async fn forget(&self, content_id: &str) -> bool {
        self.records.write().await.remove(content_id).is_some()
    }

    pub async fn get(&self, content_id: &str) -> Option<TemporalRecord> {
        self.records.read().await.get(content_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Override the TTL with an explicit invalidation time.
    pub async fn set_invalidation_time(&self, content_id: &str, at: DateTime<Utc>) -> bool {
        match self.records.write().await.get_mut(content_id) {
            Some(record) => {
                record.invalidate_at = Some(at);
                true
            }
            None => false,
        }
    }

    /// Group expired ids by priority into queued expiry jobs.
    pub async fn scan_expired(&self) -> Vec<InvalidationJob> {
        self.scan_expired_at(Utc::now()).await
    }

    pub async fn scan_expired_at(&self, now: DateTime<Utc>) -> Vec<InvalidationJob> {
        let mut groups: HashMap<Priority, Vec<String>> = HashMap::new();
        {
            let records = self.records.read().await;
            for record in records.values().filter(|r| r.is_expired(now)) {
                groups
                    .entry(record.priority)
                    .or_default()
                    .push(record.content_id.clone());
            }
        }

        let mut queued: HashSet<String> = HashSet::new();
        {
            let queue = self.queue.lock().await;
            for job in queue.iter() {
                queued.extend(job.content_ids.iter().cloned());
            }
        }

        let mut jobs = Vec::new();
        for priority in Priority::ALL {
            let Some(mut ids) = groups.remove(&priority) else {
                continue;
            };
            ids.retain(|id| !queued.contains(id));
            if ids.is_empty() {
                continue;
            }
            ids.sort();
            jobs.push(new_job(ids, priority, JobType::Expiry, now));
        }

        if !jobs.is_empty() {
            let mut queue = self.queue.lock().await;
            queue.extend(jobs.iter().cloned());
        }
        jobs
    }

    /// Queue a manual invalidation of `ids`.
    pub async fn invalidate_now(&self, ids: &[String]) -> Option<InvalidationJob> {
        self.enqueue_manual(ids.to_vec(), JobType::Manual).await
    }

    /// Queue invalidation of content derived from `source_id`. The source
    /// itself is not included.
    pub async fn invalidate_dependents(
        &self,
        source_id: &str,
        dependents: &[String],
    ) -> Option<InvalidationJob> {
        let ids: Vec<String> = dependents
            .iter()
            .filter(|d| d.as_str() != source_id)
            .cloned()
            .collect();
        tracing::debug!(source_id, dependents = ids.len(), "invalidating dependents");
        self.enqueue_manual(ids, JobType::Dependency).await
    }

    async fn enqueue_manual(&self, mut ids: Vec<String>, job_type: JobType) -> Option<InvalidationJob> {
        ids.sort();
        ids.dedup();
        if ids.is_empty() {
            return None;
        }
        let priority = {
            let records = self.records.read().await;
            ids.iter()
                .filter_map(|id| records.get(id).map(|r| r.priority))
                .min()
                .unwrap_or(Priority::Medium)
        };
        let job = new_job(ids, priority, job_type, Utc::now());
        self.queue.lock().await.push_back(job.clone());
        Some(job)
    }

    pub async fn pending_jobs(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Delete a job's facts in parallel. Records are forgotten only for
    /// confirmed deletions.
    pub async fn process_job(&self, job: &InvalidationJob) -> JobOutcome {
        let deletions = job.content_ids.iter().map(|id| self.store.delete_fact(id));
        let outcomes = join_all(deletions).await;

        let mut deleted = Vec::new();
        let mut failed = 0;
        for (id, outcome) in job.content_ids.iter().zip(outcomes) {
            match outcome {
                Ok(()) => deleted.push(id),
                Err(e) => {
                    failed += 1;
                    tracing::warn!(content_id = %id, job = %job.id, error = %e, "invalidation delete failed");
                }
            }
        }

        {
            let mut records = self.records.write().await;
            for id in &deleted {
                records.remove(*id);
            }
        }
        if !deleted.is_empty() {
            if let Some(search) = &self.search {
                search.clear_cache().await;
            }
        }

        JobOutcome {
            deleted: deleted.len(),
            failed,
        }
    }

    /// Drain and process every queued job.
    pub async fn process_pending(&self) -> JobOutcome {
        let jobs: Vec<InvalidationJob> = self.queue.lock().await.drain(..).collect();
        let mut total = JobOutcome::default();
        for job in &jobs {
            let outcome = self.process_job(job).await;
            tracing::info!(
                job = %job.id,
                job_type = ?job.job_type,
                priority = ?job.priority,
                deleted = outcome.deleted,
                failed = outcome.failed,
                "invalidation job processed"
            );
            total.deleted += outcome.deleted;
            total.failed += outcome.failed;
        }
        total
    }

    /// Ids worth refreshing: stale critical or high priority records, and
    /// aging records accessed at least `refresh_access_threshold` times.
    pub async fn refresh_candidates(&self) -> Vec<String> {
        self.refresh_candidates_at(Utc::now()).await
    }

    pub async fn refresh_candidates_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let records = self.records.read().await;
        let mut ids: Vec<String> = records
            .values()
            .filter(|r| self.is_refresh_candidate(r, now))
            .map(|r| r.content_id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn is_refresh_candidate(&self, record: &TemporalRecord, now: DateTime<Utc>) -> bool {
        match record.state(now) {
            FreshnessState::Stale => matches!(record.priority, Priority::Critical | Priority::High),
            FreshnessState::Aging => record.access_count >= self.config.refresh_access_threshold,
            FreshnessState::Fresh | FreshnessState::Expired => false,
        }
    }

    pub async fn temporal_analytics(&self) -> TemporalAnalytics {
        self.temporal_analytics_at(Utc::now()).await
    }

    pub async fn temporal_analytics_at(&self, now: DateTime<Utc>) -> TemporalAnalytics {
        let records = self.records.read().await;
        let mut analytics = TemporalAnalytics {
            total: records.len(),
            ..Default::default()
        };
        let mut freshness_sum = 0.0;
        for record in records.values() {
            *analytics.by_priority.entry(record.priority).or_default() += 1;
            let state = record.state(now);
            *analytics.by_state.entry(state).or_default() += 1;
            if state == FreshnessState::Expired {
                analytics.expired += 1;
            }
            if self.is_refresh_candidate(record, now) {
                analytics.refresh_candidates += 1;
            }
            freshness_sum += freshness_score(record, now);
        }
        if !records.is_empty() {
            analytics.average_freshness = freshness_sum / records.len() as f64;
        }
        analytics
    }

    /// Scan, process the queue, and collect refresh candidates.
    pub async fn run_cycle(&self) -> CycleReport {
        self.run_cycle_at(Utc::now()).await
    }

    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> CycleReport {
        let jobs = self.scan_expired_at(now).await;
        let outcome = self.process_pending().await;
        let refresh_candidates = self.refresh_candidates_at(now).await;
        tracing::info!(
            jobs = jobs.len(),
            deleted = outcome.deleted,
            failed = outcome.failed,
            refresh_candidates = refresh_candidates.len(),
            "temporal maintenance cycle complete"
        );
        CycleReport {
            jobs_created: jobs.len(),
            deleted: outcome.deleted,
            failed: outcome.failed,
            refresh_candidates,
        }
    }

    /// Run [`run_cycle`](Self::run_cycle) every `interval` (defaults to
    /// `temporal.scan_interval_secs`) until the handle is shut down.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Option<Duration>) -> ShutdownHandle {
        let interval =
            interval.unwrap_or_else(|| Duration::from_secs(self.config.scan_interval_secs));
        let manager = Arc::clone(self);
        PeriodicTask::new("temporal-maintenance", interval).spawn(move || {
            let manager = Arc::clone(&manager);
            async move {
                manager.run_cycle().await;
                Ok::<(), anyhow::Error>(())
            }
        })
    }
}

fn touch_modified(record: &mut TemporalRecord, now: DateTime<Utc>) {
    record.modified_at = now;
    record.modification_count += 1;
    record.update_frequency = update_frequency(record, now);
    record.freshness = freshness_score(record, now);
}

fn new_job(
    content_ids: Vec<String>,
    priority: Priority,
    job_type: JobType,
    now: DateTime<Utc>,
) -> InvalidationJob {
    InvalidationJob {
        id: Uuid::new_v4().to_string(),
        estimated_duration: PER_ITEM_DELETE_ESTIMATE * content_ids.len() as u32,
        content_ids,
        priority,
        scheduled_at: now,
        job_type,
    }
}

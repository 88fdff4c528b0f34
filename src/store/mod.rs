//! Collaborator contracts for the external fact and graph stores.
//!
//! The engine never runs multi-step transactions against either store:
//! every mutation is a single idempotent call, and both stores are assumed
//! to synchronize access internally. Implementations must be `Send + Sync`.
//!
//! [`memory`] provides in-process implementations of both traits.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Direction, Entity, Fact, FactHit, Metadata, RelatedEntity};

/// Equality filters over fact metadata keys.
pub type SearchFilters = Metadata;

/// Storage and similarity search for facts (chunks of ingested content).
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`store_fact`](FactStore::store_fact) | Persist a fact, returning its id |
/// | [`store_fact_with_embedding`](FactStore::store_fact_with_embedding) | Persist with a precomputed vector |
/// | [`delete_fact`](FactStore::delete_fact) | Remove a fact by id |
/// | [`get_all_facts`](FactStore::get_all_facts) | Enumerate the corpus |
/// | [`search`](FactStore::search) | Semantic top-K search |
#[async_trait]
pub trait FactStore: Send + Sync {
    /// Store a fact and return its id.
    async fn store_fact(&self, text: &str, metadata: &Metadata) -> Result<String>;

    /// Store a fact whose embedding was already computed by the caller.
    ///
    /// Stores that embed internally may ignore the vector.
    async fn store_fact_with_embedding(
        &self,
        text: &str,
        metadata: &Metadata,
        _embedding: &[f32],
    ) -> Result<String> {
        self.store_fact(text, metadata).await
    }

    /// Delete a fact. Deleting an unknown id is not an error.
    async fn delete_fact(&self, id: &str) -> Result<()>;

    async fn get_all_facts(&self) -> Result<Vec<Fact>>;

    /// Semantic search, best first. Scores are similarities in `[0, 1]`.
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&SearchFilters>,
    ) -> Result<Vec<FactHit>>;
}

/// Entity lookup and relationship traversal.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_entity(&self, name: &str, include_relations: bool) -> Result<Option<Entity>>;

    /// Entities reachable from `name` within `max_depth` hops.
    async fn get_related_entities(
        &self,
        name: &str,
        relation_type: Option<&str>,
        direction: Direction,
        max_depth: usize,
    ) -> Result<Vec<RelatedEntity>>;
}

/// True when every filter key is present in `metadata` with an equal value.
pub fn matches_filters(metadata: &Metadata, filters: Option<&SearchFilters>) -> bool {
    match filters {
        None => true,
        Some(f) => f.iter().all(|(k, v)| metadata.get(k) == Some(v)),
    }
}

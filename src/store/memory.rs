//! In-memory [`FactStore`] and [`GraphStore`] implementations.
//!
//! Both use `tokio::sync::RwLock`. Fact search is brute-force cosine
//! similarity when an embedding gateway is attached, and query-term
//! overlap otherwise. Graph traversal is breadth-first over an edge list.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::embedding::{cosine_similarity, embed_query, EmbeddingGateway};
use crate::models::{Direction, Entity, Fact, FactHit, Metadata, RelatedEntity, Relation};
use crate::text;

use super::{matches_filters, FactStore, GraphStore, SearchFilters};

struct StoredFact {
    fact: Fact,
    vector: Option<Vec<f32>>,
}

/// In-memory fact store.
pub struct InMemoryFactStore {
    facts: RwLock<Vec<StoredFact>>,
    gateway: Option<Arc<dyn EmbeddingGateway>>,
}

impl InMemoryFactStore {
    /// A store that scores by query-term overlap.
    pub fn new() -> Self {
        Self {
            facts: RwLock::new(Vec::new()),
            gateway: None,
        }
    }

    /// A store that embeds facts and queries with `gateway`.
    pub fn with_gateway(gateway: Arc<dyn EmbeddingGateway>) -> Self {
        Self {
            facts: RwLock::new(Vec::new()),
            gateway: Some(gateway),
        }
    }

    pub async fn len(&self) -> usize {
        self.facts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.facts.read().await.is_empty()
    }

    async fn insert(&self, text: &str, metadata: &Metadata, vector: Option<Vec<f32>>) -> String {
        let id = Uuid::new_v4().to_string();
        self.facts.write().await.push(StoredFact {
            fact: Fact {
                id: id.clone(),
                text: text.to_string(),
                metadata: metadata.clone(),
            },
            vector,
        });
        id
    }
}

impl Default for InMemoryFactStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Fraction of query terms present in `text`.
fn term_overlap(terms: &[String], text: &str) -> f64 {
    if terms.is_empty() {
        return 0.0;
    }
    let words = text::word_set(text);
    let hits = terms.iter().filter(|t| words.contains(*t)).count();
    hits as f64 / terms.len() as f64
}

#[async_trait]
impl FactStore for InMemoryFactStore {
    async fn store_fact(&self, text: &str, metadata: &Metadata) -> Result<String> {
        let vector = match &self.gateway {
            Some(gw) => Some(embed_query(gw.as_ref(), text).await?),
            None => None,
        };
        Ok(self.insert(text, metadata, vector).await)
    }

    async fn store_fact_with_embedding(
        &self,
        text: &str,
        metadata: &Metadata,
        embedding: &[f32],
    ) -> Result<String> {
        Ok(self.insert(text, metadata, Some(embedding.to_vec())).await)
    }

    async fn delete_fact(&self, id: &str) -> Result<()> {
        self.facts.write().await.retain(|sf| sf.fact.id != id);
        Ok(())
    }

    async fn get_all_facts(&self) -> Result<Vec<Fact>> {
        Ok(self
            .facts
            .read()
            .await
            .iter()
            .map(|sf| sf.fact.clone())
            .collect())
    }

    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: Option<&SearchFilters>,
    ) -> Result<Vec<FactHit>> {
        let query_vec = match &self.gateway {
            Some(gw) => Some(embed_query(gw.as_ref(), query).await?),
            None => None,
        };
        let terms = text::extract_keywords(query, 1);

        let facts = self.facts.read().await;
        let mut hits: Vec<FactHit> = facts
            .iter()
            .filter(|sf| matches_filters(&sf.fact.metadata, filters))
            .map(|sf| {
                let score = match (&query_vec, &sf.vector) {
                    (Some(q), Some(v)) => (cosine_similarity(q, v) as f64).max(0.0),
                    _ => term_overlap(&terms, &sf.fact.text),
                };
                FactHit {
                    fact: sf.fact.clone(),
                    score,
                }
            })
            .filter(|h| h.score > 0.0)
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

struct Edge {
    from: String,
    to: String,
    relation: Relation,
}

/// In-memory entity graph with directed, weighted edges.
pub struct InMemoryGraphStore {
    entities: RwLock<HashMap<String, Entity>>,
    edges: RwLock<Vec<Edge>>,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            edges: RwLock::new(Vec::new()),
        }
    }

    pub async fn add_entity(&self, entity: Entity) {
        self.entities
            .write()
            .await
            .insert(entity.name.clone(), entity);
    }

    /// Add a directed edge `from → to`.
    pub async fn add_relation(&self, from: &str, to: &str, relation_type: &str, strength: f64) {
        self.edges.write().await.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
            relation: Relation {
                relation_type: relation_type.to_string(),
                strength: strength.clamp(0.0, 1.0),
            },
        });
    }
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn get_entity(&self, name: &str, _include_relations: bool) -> Result<Option<Entity>> {
        Ok(self.entities.read().await.get(name).cloned())
    }

    async fn get_related_entities(
        &self,
        name: &str,
        relation_type: Option<&str>,
        direction: Direction,
        max_depth: usize,
    ) -> Result<Vec<RelatedEntity>> {
        let entities = self.entities.read().await;
        let edges = self.edges.read().await;

        struct Frontier {
            name: String,
            depth: usize,
            strength: f64,
            path: Vec<String>,
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(name.to_string());
        let mut queue = VecDeque::new();
        queue.push_back(Frontier {
            name: name.to_string(),
            depth: 0,
            strength: 1.0,
            path: Vec::new(),
        });
        let mut related = Vec::new();

        while let Some(node) = queue.pop_front() {
            if node.depth >= max_depth {
                continue;
            }
            for edge in edges.iter() {
                if let Some(rt) = relation_type {
                    if edge.relation.relation_type != rt {
                        continue;
                    }
                }
                let (neighbour, dir) = if edge.from == node.name
                    && matches!(direction, Direction::Outgoing | Direction::Both)
                {
                    (&edge.to, Direction::Outgoing)
                } else if edge.to == node.name
                    && matches!(direction, Direction::Incoming | Direction::Both)
                {
                    (&edge.from, Direction::Incoming)
                } else {
                    continue;
                };
                if !visited.insert(neighbour.clone()) {
                    continue;
                }
                let Some(entity) = entities.get(neighbour) else {
                    continue;
                };

                let strength = node.strength * edge.relation.strength;
                let mut path = node.path.clone();
                path.push(edge.relation.relation_type.clone());

                related.push(RelatedEntity {
                    entity: entity.clone(),
                    relation: Relation {
                        relation_type: edge.relation.relation_type.clone(),
                        strength,
                    },
                    direction: dir,
                    depth: node.depth + 1,
                    path: path.clone(),
                });
                queue.push_back(Frontier {
                    name: neighbour.clone(),
                    depth: node.depth + 1,
                    strength,
                    path,
                });
            }
        }

        Ok(related)
    }
}

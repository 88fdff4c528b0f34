//! # Knowledge Harness
//!
//! A knowledge retrieval and synchronization engine.
//!
//! Knowledge Harness keeps a searchable corpus fresh by diffing files on
//! content hash, serves multi-stage (semantic + keyword) search with
//! diversification and reranking, expands results through a relationship
//! graph, and ages stored knowledge out on priority-weighted TTLs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌────────────┐
//! │ Sync engine  │──▶│  Chunker    │──▶│ Fact store │
//! │ scan + diff  │   │ + embedding │   │ (external) │
//! └──────┬───────┘   └─────────────┘   └─────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌────────────┐   ┌──────────────┐
//! │  Temporal    │                    │ RAG search │──▶│ Graph search │
//! │  manager     │                    │ (hybrid)   │   │ (expansion)  │
//! └──────────────┘                    └────────────┘   └──────────────┘
//! ```
//!
//! Components are plain structs wired together by the caller; nothing is a
//! global. Stores and the embedding service are traits
//! ([`store::FactStore`], [`store::GraphStore`],
//! [`embedding::EmbeddingGateway`]) with in-process implementations for
//! tests and offline use.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed initialization and timeout errors |
//! | [`models`] | Core data types |
//! | [`text`] | Tokenization, keywords, hashing |
//! | [`embedding`] | Embedding gateway abstraction |
//! | [`store`] | Fact and graph store contracts |
//! | [`chunk`] | Semantic chunking |
//! | [`hybrid`] | Keyword + semantic score fusion |
//! | [`rag`] | Multi-stage retrieval pipeline |
//! | [`graph`] | Graph-aware result expansion |
//! | [`temporal`] | Priority TTLs, freshness, invalidation |
//! | [`sync`] | Incremental filesystem sync |
//! | [`sync_state`] | Persisted sync state |
//! | [`daemon`] | Cancellable periodic tasks |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod daemon;
pub mod db;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod hybrid;
pub mod migrate;
pub mod models;
pub mod rag;
pub mod store;
pub mod sync;
pub mod sync_state;
pub mod temporal;
pub mod text;

//! Typed failures callers are expected to branch on.
//!
//! Most of the crate reports errors through `anyhow::Result`. The variants
//! here cover the cases where a caller needs to react differently: an
//! invalid configuration, a component that could not be constructed, a
//! scoring service that does not offer reranking, and a search that ran
//! past its deadline.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration failed validation.
    #[error("config error: {0}")]
    Config(String),

    /// A component (gateway, state store) could not be constructed.
    #[error("initialization failed: {0}")]
    Init(String),

    /// The embedding gateway has no cross-encoder attached.
    #[error("reranker unavailable")]
    RerankerUnavailable,

    /// The search pipeline did not finish within its deadline.
    #[error("search timed out after {0:?}")]
    Timeout(Duration),
}

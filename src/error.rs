//! Unified error type for the engine surface.

use thiserror::Error;

use crate::audit::AuditError;
use crate::config::ConfigError;
use crate::keys::KeyError;
use crate::retriever::EmbeddingError;
use crate::store::StoreError;

/// Everything a caller of [`crate::RetrievalOrchestrator`] can see fail.
/// Denied authorization is not here: denials are data, not errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("Invalid ingestion record: {0}")]
    InvalidRecord(String),

    #[error("Query aborted: deadline exceeded")]
    QueryTimeout,
}

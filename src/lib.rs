//! vaultsearch: an encrypted, classification-aware retrieval engine.
//!
//! Embedded vectors and their metadata live on disk only inside
//! authenticated AES-256-GCM envelopes under a single master key. Every
//! chunk carries a classification label; queries return only what the
//! caller's clearance dominates, and every grant or denial lands in an
//! append-only encrypted audit log before the response is returned.
//!
//! [`RetrievalOrchestrator`] is the front door; the submodules are public
//! for callers that need direct store or audit access.

pub mod access;
pub mod audit;
pub mod classification;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod retriever;
pub mod store;

pub use access::{AccessControl, Role, User};
pub use audit::{AuditEvent, AuditEventType, AuditFilter, AuditLog, AuditRecord};
pub use classification::{ClassificationLevel, Permission};
pub use config::EngineConfig;
pub use error::EngineError;
pub use keys::{KeyError, KeyManager, MasterKey};
pub use retriever::{
    AuditReadOutcome, EmbeddingError, EmbeddingProvider, IngestReceipt, IngestRecord, QueryInput,
    QueryOptions, QueryResponse, QueryStatus, RankedItem, RetrievalOrchestrator,
};
pub use store::{Chunk, EncryptedVectorStore, SearchHit, SourceRef, StoreError, StoreStats};

//! Retrieval orchestration for vaultsearch
//!
//! Drives the per-query protocol:
//! `RECEIVED -> AUTHORIZED|DENIED -> SEARCHED -> FILTERED -> RERANKED -> LOGGED -> RETURNED`,
//! where the DENIED path skips straight to LOGGED -> RETURNED. The audit
//! record is always committed before the response leaves this module, so a
//! crash after responding cannot leave an unlogged action.
//!
//! Authorization outcomes are data, never errors. A denial carries a
//! generic reason and reveals nothing about what was withheld.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::access::{AccessControl, Role};
use crate::audit::{payload_hash, AuditEvent, AuditEventType, AuditFilter, AuditLog, AuditRecord};
use crate::classification::{ClassificationLevel, Permission};
use crate::config::{EngineConfig, CANDIDATE_MULTIPLIER};
use crate::error::EngineError;
use crate::store::{Chunk, EncryptedVectorStore, SearchHit, SourceRef, StoreStats};

/// RRF constant; a document at rank r contributes `1 / (r + 60)`.
const RRF_K: f64 = 60.0;

/// Denial text returned to callers. Deliberately generic: it never reveals
/// the existence, count or classification of suppressed matches.
const DENIED_REASON: &str = "insufficient clearance";

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("Embedding provider failed: {0}")]
    Provider(String),
}

/// Black-box vector producer. Implementations must be deterministic for
/// identical input and order-preserving for batches.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Query payload: raw text (embedded by the provider) or a precomputed
/// vector.
#[derive(Debug, Clone)]
pub enum QueryInput {
    Text(String),
    Vector(Vec<f32>),
}

impl From<&str> for QueryInput {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

/// Per-call overrides; `None` falls back to the engine config.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub top_k: Option<usize>,
    pub threshold: Option<f32>,
    /// Secondary lexical ranking (chunk ids, best first). When present,
    /// vector and lexical rankings are fused with RRF.
    pub hybrid: Option<Vec<String>>,
    /// Deadline for the whole query. On expiry a best-effort
    /// `query_timeout` audit event is written and the query aborts.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Granted,
    Denied,
}

/// One returned result with its similarity and label.
#[derive(Debug, Clone, Serialize)]
pub struct RankedItem {
    pub chunk_id: String,
    /// Cosine similarity of the item to the query, also under hybrid
    /// fusion (RRF decides order, similarity stays reported).
    pub score: f32,
    pub classification: ClassificationLevel,
    pub source: SourceRef,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub status: QueryStatus,
    pub items: Vec<RankedItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_reason: Option<String>,
}

impl QueryResponse {
    fn granted(items: Vec<RankedItem>) -> Self {
        Self {
            status: QueryStatus::Granted,
            items,
            denied_reason: None,
        }
    }

    fn denied() -> Self {
        Self {
            status: QueryStatus::Denied,
            items: Vec::new(),
            denied_reason: Some(DENIED_REASON.to_string()),
        }
    }
}

/// Fixed-shape ingestion record, validated at this boundary.
#[derive(Debug, Clone)]
pub struct IngestRecord {
    pub text: String,
    pub classification: ClassificationLevel,
    pub source: SourceRef,
}

#[derive(Debug, Serialize)]
pub struct IngestReceipt {
    pub status: QueryStatus,
    pub chunk_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denied_reason: Option<String>,
}

/// Outcome of an audit read request.
pub enum AuditReadOutcome {
    Granted(Vec<AuditRecord>),
    Denied,
}

/// Composes key manager, store, access control and audit log into the
/// query protocol. One instance exclusively owns its store path.
pub struct RetrievalOrchestrator {
    config: EngineConfig,
    store: RwLock<EncryptedVectorStore>,
    access: RwLock<AccessControl>,
    audit: AuditLog,
    embedder: Box<dyn EmbeddingProvider>,
}

impl std::fmt::Debug for RetrievalOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalOrchestrator").finish_non_exhaustive()
    }
}

impl RetrievalOrchestrator {
    /// Build the engine. Store corruption (`DecryptionError`) is fatal
    /// here, not recoverable per-query.
    pub fn new(
        config: EngineConfig,
        embedder: Box<dyn EmbeddingProvider>,
    ) -> Result<Self, EngineError> {
        config.validate()?;

        let store =
            EncryptedVectorStore::initialize(config.dimension, &config.store_dir, &config.key_path)?;
        let audit = AuditLog::open(&config.audit_path, store.key().duplicate())?;

        audit.log(&AuditEvent::new(AuditEventType::SystemStart, "system"))?;
        tracing::info!(dimension = config.dimension, "retrieval engine started");

        Ok(Self {
            config,
            store: RwLock::new(store),
            access: RwLock::new(AccessControl::new()),
            audit,
            embedder,
        })
    }

    /// Register a user with the given roles.
    pub fn register_user(&self, user_id: &str, roles: Vec<Role>) {
        self.access.write().add_user(user_id, roles);
    }

    /// Deactivate a user; returns false for an unknown id.
    pub fn deactivate_user(&self, user_id: &str) -> bool {
        self.access.write().deactivate(user_id)
    }

    /// Run one query through the full protocol.
    pub fn query(
        &self,
        user_id: &str,
        input: QueryInput,
        options: &QueryOptions,
    ) -> Result<QueryResponse, EngineError> {
        let started = Instant::now();

        if !self.access.read().authorize(user_id, Permission::Query) {
            self.audit.log(
                &AuditEvent::new(AuditEventType::AccessDenied, user_id)
                    .with_details(serde_json::json!({ "operation": "query" }))
                    .denied(),
            )?;
            tracing::warn!(user_id, "query denied");
            return Ok(QueryResponse::denied());
        }

        // Hashed up front so a failure after the grant can still be
        // attributed to this query.
        let query_hash = match &input {
            QueryInput::Text(text) => payload_hash(text.as_bytes()),
            QueryInput::Vector(vector) => payload_hash(&vector_bytes(vector)),
        };

        match self.run_granted_query(user_id, input, options, started, &query_hash) {
            Ok(response) => Ok(response),
            Err(e) => {
                self.log_failure(&e, user_id, Some(&query_hash), AuditEventType::Query);
                Err(e)
            }
        }
    }

    fn run_granted_query(
        &self,
        user_id: &str,
        input: QueryInput,
        options: &QueryOptions,
        started: Instant,
        query_hash: &str,
    ) -> Result<QueryResponse, EngineError> {
        let query_vector = match input {
            QueryInput::Text(text) => self
                .embedder
                .embed(&text)
                .map_err(EngineError::Embedding)?,
            QueryInput::Vector(vector) => vector,
        };
        check_deadline(started, options)?;

        let top_k = options.top_k.unwrap_or(self.config.top_k);
        let threshold = options.threshold.unwrap_or(self.config.similarity_threshold);

        // Over-fetch to absorb clearance filtering losses
        let raw = self
            .store
            .read()
            .search(&query_vector, top_k.saturating_mul(CANDIDATE_MULTIPLIER))?;
        check_deadline(started, options)?;

        let cleared = self.access.read().filter_by_clearance(raw, user_id);

        let reranked = match &options.hybrid {
            Some(lexical) => rrf_fuse(cleared, lexical),
            None => cleared,
        };

        // Threshold before truncation; fewer than k survivors stay fewer
        let survivors: Vec<SearchHit> = reranked
            .into_iter()
            .filter(|h| h.score >= threshold)
            .take(top_k)
            .collect();

        let max_classification = survivors
            .iter()
            .map(|h| h.classification)
            .max()
            .unwrap_or_default();
        let chunk_ids: Vec<&str> = survivors.iter().map(|h| h.chunk_id.as_str()).collect();

        // Committed before the response leaves this function
        self.audit.log(
            &AuditEvent::new(AuditEventType::Query, user_id)
                .with_query_hash(query_hash)
                .with_classification(max_classification)
                .with_details(serde_json::json!({
                    "chunk_ids": chunk_ids,
                    "returned": survivors.len(),
                })),
        )?;

        let items = survivors
            .into_iter()
            .map(|h| RankedItem {
                chunk_id: h.chunk_id,
                score: h.score,
                classification: h.classification,
                source: h.source,
            })
            .collect();
        Ok(QueryResponse::granted(items))
    }

    /// Embed and append a batch of records. Requires `Permission::Ingest`;
    /// one audit event covers the batch.
    pub fn ingest(
        &self,
        user_id: &str,
        records: Vec<IngestRecord>,
    ) -> Result<IngestReceipt, EngineError> {
        if !self.access.read().authorize(user_id, Permission::Ingest) {
            self.audit.log(
                &AuditEvent::new(AuditEventType::AccessDenied, user_id)
                    .with_details(serde_json::json!({ "operation": "ingest" }))
                    .denied(),
            )?;
            return Ok(IngestReceipt {
                status: QueryStatus::Denied,
                chunk_ids: Vec::new(),
                denied_reason: Some(DENIED_REASON.to_string()),
            });
        }

        match self.run_granted_ingest(user_id, records) {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                self.log_failure(&e, user_id, None, AuditEventType::DocumentIngest);
                Err(e)
            }
        }
    }

    fn run_granted_ingest(
        &self,
        user_id: &str,
        records: Vec<IngestRecord>,
    ) -> Result<IngestReceipt, EngineError> {
        for record in &records {
            if record.text.trim().is_empty() {
                return Err(EngineError::InvalidRecord("empty text".into()));
            }
            if record.source.document_id.is_empty() || record.source.origin.is_empty() {
                return Err(EngineError::InvalidRecord(
                    "source requires document_id and origin".into(),
                ));
            }
        }

        let texts: Vec<String> = records.iter().map(|r| r.text.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .map_err(EngineError::Embedding)?;
        if vectors.len() != records.len() {
            return Err(EngineError::Embedding(EmbeddingError::Provider(format!(
                "batch returned {} vectors for {} records",
                vectors.len(),
                records.len()
            ))));
        }

        let chunks: Vec<Chunk> = records
            .into_iter()
            .zip(vectors)
            .map(|(record, vector)| Chunk {
                id: Uuid::new_v4().to_string(),
                vector,
                classification: record.classification,
                source: record.source,
            })
            .collect();
        let chunk_ids: Vec<String> = chunks.iter().map(|c| c.id.clone()).collect();
        let max_classification = chunks
            .iter()
            .map(|c| c.classification)
            .max()
            .unwrap_or_default();

        self.store.write().add(chunks)?;

        self.audit.log(
            &AuditEvent::new(AuditEventType::DocumentIngest, user_id)
                .with_classification(max_classification)
                .with_details(serde_json::json!({
                    "chunk_ids": chunk_ids,
                    "count": chunk_ids.len(),
                })),
        )?;

        Ok(IngestReceipt {
            status: QueryStatus::Granted,
            chunk_ids,
            denied_reason: None,
        })
    }

    /// Read the audit trail. Requires `Permission::ViewAudit`; the read
    /// itself is audited.
    pub fn read_audit(
        &self,
        user_id: &str,
        filter: AuditFilter,
    ) -> Result<AuditReadOutcome, EngineError> {
        if !self.access.read().authorize(user_id, Permission::ViewAudit) {
            self.audit.log(
                &AuditEvent::new(AuditEventType::AccessDenied, user_id)
                    .with_details(serde_json::json!({ "operation": "view_audit" }))
                    .denied(),
            )?;
            return Ok(AuditReadOutcome::Denied);
        }

        let records: Vec<AuditRecord> = self.audit.read(filter)?.collect();
        self.audit
            .log(&AuditEvent::new(AuditEventType::AuditRead, user_id))?;
        Ok(AuditReadOutcome::Granted(records))
    }

    /// Persist the store. Takes the exclusive lock: no search observes a
    /// half-written index.
    pub fn save(&self) -> Result<(), EngineError> {
        let store = self.store.write();
        store.save()?;
        Ok(())
    }

    /// Mark a chunk logically deleted.
    pub fn tombstone(&self, chunk_id: &str) -> bool {
        self.store.write().tombstone(chunk_id)
    }

    /// Physically drop tombstoned chunks.
    pub fn compact(&self) -> usize {
        self.store.write().compact()
    }

    pub fn stats(&self) -> StoreStats {
        self.store.read().stats()
    }

    /// Save and close, logging a `system_stop` record.
    pub fn shutdown(self) -> Result<(), EngineError> {
        self.store.write().save()?;
        self.audit
            .log(&AuditEvent::new(AuditEventType::SystemStop, "system"))?;
        tracing::info!("retrieval engine stopped");
        Ok(())
    }

    /// A grant whose operation then failed still yields exactly one audit
    /// record. Best effort: a failing audit disk must not mask the
    /// original error.
    fn log_failure(
        &self,
        error: &EngineError,
        user_id: &str,
        query_hash: Option<&str>,
        granted_as: AuditEventType,
    ) {
        // An audit write failure already surfaced as the error itself;
        // writing again would duplicate or fail the same way.
        if matches!(error, EngineError::Audit(_)) {
            return;
        }

        let event_type = match error {
            EngineError::QueryTimeout => AuditEventType::QueryTimeout,
            _ => granted_as,
        };
        let mut event = AuditEvent::new(event_type, user_id)
            .with_details(serde_json::json!({ "error": error.to_string() }))
            .denied();
        if let Some(hash) = query_hash {
            event = event.with_query_hash(hash);
        }
        if let Err(e) = self.audit.log(&event) {
            tracing::error!(error = %e, "failed to record operation failure");
        }
    }
}

fn check_deadline(started: Instant, options: &QueryOptions) -> Result<(), EngineError> {
    match options.timeout {
        Some(timeout) if started.elapsed() > timeout => Err(EngineError::QueryTimeout),
        _ => Ok(()),
    }
}

/// Fuse the clearance-filtered vector ranking with a lexical ranking via
/// Reciprocal Rank Fusion. Only cleared vector candidates can appear in the
/// output; the lexical list contributes rank boosts, never new items, so
/// fusion can never reintroduce over-clearance content.
fn rrf_fuse(cleared: Vec<SearchHit>, lexical: &[String]) -> Vec<SearchHit> {
    let lexical_rank: HashMap<&str, usize> = lexical
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i + 1))
        .collect();

    let mut scored: Vec<(f64, SearchHit)> = cleared
        .into_iter()
        .enumerate()
        .map(|(i, hit)| {
            let mut score = 1.0 / ((i + 1) as f64 + RRF_K);
            if let Some(rank) = lexical_rank.get(hit.chunk_id.as_str()) {
                score += 1.0 / (*rank as f64 + RRF_K);
            }
            (score, hit)
        })
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.index.cmp(&b.1.index)));
    scored.into_iter().map(|(_, hit)| hit).collect()
}

fn vector_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

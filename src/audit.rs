//! Sealed audit trail for vaultsearch
//!
//! Every authorization decision produces exactly one record. Records are
//! sealed independently (own nonce and tag each) and framed as
//! `[u32 length][nonce || ciphertext || tag]`, so a corrupted record
//! surfaces as a gap in the trail instead of making the rest unreadable.
//! Raw query text is never written; only SHA-256 hashes.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::classification::ClassificationLevel;
use crate::crypto::{Crypto, NONCE_LEN, TAG_LEN};
use crate::keys::{create_secure_dir, set_secure_permissions, MasterKey, FILE_PERMISSIONS};

/// Upper bound for a single sealed record; anything larger in a length
/// prefix means the frame stream is broken.
const MAX_RECORD_LEN: u32 = 1024 * 1024;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("Audit log I/O error: {0}")]
    Io(String),
    #[error("Audit record serialization error: {0}")]
    Serialization(String),
    #[error("Audit record seal error: {0}")]
    Seal(String),
}

/// Auditable event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A granted retrieval query
    Query,
    /// A granted ingestion batch
    DocumentIngest,
    /// Any denied authorization check
    AccessDenied,
    /// A granted audit trail read
    AuditRead,
    /// A query aborted on its deadline
    QueryTimeout,
    SystemStart,
    SystemStop,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Query => write!(f, "query"),
            Self::DocumentIngest => write!(f, "document_ingest"),
            Self::AccessDenied => write!(f, "access_denied"),
            Self::AuditRead => write!(f, "audit_read"),
            Self::QueryTimeout => write!(f, "query_timeout"),
            Self::SystemStart => write!(f, "system_start"),
            Self::SystemStop => write!(f, "system_stop"),
        }
    }
}

/// One audit record. Append-only; never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub user_id: String,
    /// SHA-256 hex of the query text or vector; never the raw payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_hash: Option<String>,
    /// Highest classification among any returned content.
    pub classification: ClassificationLevel,
    /// Additional context (chunk ids, counts); never secrets.
    pub details: serde_json::Value,
    pub success: bool,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, user_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            user_id: user_id.into(),
            query_hash: None,
            classification: ClassificationLevel::Unclassified,
            details: serde_json::Value::Null,
            success: true,
        }
    }

    pub fn with_query_hash(mut self, hash: impl Into<String>) -> Self {
        self.query_hash = Some(hash.into());
        self
    }

    pub fn with_classification(mut self, classification: ClassificationLevel) -> Self {
        self.classification = classification;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn denied(mut self) -> Self {
        self.success = false;
        self
    }
}

/// SHA-256 hex digest for audit payload hashing.
pub fn payload_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Criteria for [`AuditLog::read`]. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub user_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
}

impl AuditFilter {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(t) = self.event_type {
            if event.event_type != t {
                return false;
            }
        }
        if let Some(user) = &self.user_id {
            if &event.user_id != user {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        true
    }
}

/// Item yielded while reading the trail: a decrypted event, or a gap where
/// a record could not be recovered.
#[derive(Debug)]
pub enum AuditRecord {
    Event(AuditEvent),
    /// A record that failed to decrypt or parse. `recoverable` is false
    /// when the frame stream itself is broken and nothing after this
    /// offset can be read.
    Gap {
        offset: u64,
        reason: String,
        recoverable: bool,
    },
}

/// Append-only encrypted audit log.
///
/// The append handle is held behind a mutex for the lifetime of the log:
/// one record is one atomic append, so concurrent writers can never
/// interleave frames.
pub struct AuditLog {
    path: PathBuf,
    key: MasterKey,
    writer: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the audit log at `path`, creating its parent
    /// directory with owner-only permissions.
    pub fn open(path: impl Into<PathBuf>, key: MasterKey) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            create_secure_dir(parent).map_err(|e| AuditError::Io(e.to_string()))?;
        }

        let is_new = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AuditError::Io(e.to_string()))?;
        if is_new {
            set_secure_permissions(&path, FILE_PERMISSIONS)
                .map_err(|e| AuditError::Io(e.to_string()))?;
        }

        Ok(Self {
            path,
            key,
            writer: Mutex::new(file),
        })
    }

    /// Seal and append one record, flushing to disk before returning.
    /// The write is committed before any caller responds to its user.
    pub fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let plaintext =
            serde_json::to_vec(event).map_err(|e| AuditError::Serialization(e.to_string()))?;
        let envelope = Crypto::seal(self.key.as_bytes(), &plaintext)
            .map_err(|e| AuditError::Seal(e.to_string()))?;

        let len = u32::try_from(envelope.len())
            .map_err(|_| AuditError::Serialization("record exceeds frame limit".into()))?;
        let mut frame = Vec::with_capacity(4 + envelope.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&envelope);

        let mut file = self.writer.lock();
        file.write_all(&frame)
            .map_err(|e| AuditError::Io(e.to_string()))?;
        file.sync_data().map_err(|e| AuditError::Io(e.to_string()))?;
        drop(file);

        tracing::debug!(event = %event.event_type, user = %event.user_id, "audit record committed");
        Ok(())
    }

    /// Lazy, restartable read of the trail from the beginning. Each call
    /// opens a fresh reader; corrupted records surface as
    /// [`AuditRecord::Gap`] items, never as a read failure for the rest.
    pub fn read(&self, filter: AuditFilter) -> Result<AuditReader, AuditError> {
        let file = std::fs::File::open(&self.path).map_err(|e| AuditError::Io(e.to_string()))?;
        Ok(AuditReader {
            reader: BufReader::new(file),
            key: self.key.duplicate(),
            filter,
            offset: 0,
            broken: false,
        })
    }
}

/// Iterator over decrypted audit records matching a filter.
pub struct AuditReader {
    reader: BufReader<std::fs::File>,
    key: MasterKey,
    filter: AuditFilter,
    offset: u64,
    broken: bool,
}

impl AuditReader {
    /// Read the next frame regardless of filter.
    fn next_record(&mut self) -> Option<AuditRecord> {
        if self.broken {
            return None;
        }

        let frame_offset = self.offset;
        let mut len_bytes = [0u8; 4];
        match self.reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
            Err(e) => {
                self.broken = true;
                return Some(AuditRecord::Gap {
                    offset: frame_offset,
                    reason: format!("read failed: {}", e),
                    recoverable: false,
                });
            }
        }
        self.offset += 4;

        let len = u32::from_le_bytes(len_bytes);
        if len < (NONCE_LEN + TAG_LEN) as u32 || len > MAX_RECORD_LEN {
            // Length prefix is implausible; the frame stream cannot be
            // resynchronized past this point.
            self.broken = true;
            return Some(AuditRecord::Gap {
                offset: frame_offset,
                reason: format!("implausible record length {}", len),
                recoverable: false,
            });
        }

        let mut envelope = vec![0u8; len as usize];
        if let Err(e) = self.reader.read_exact(&mut envelope) {
            self.broken = true;
            return Some(AuditRecord::Gap {
                offset: frame_offset,
                reason: format!("truncated record: {}", e),
                recoverable: false,
            });
        }
        self.offset += u64::from(len);

        let plaintext = match Crypto::open(self.key.as_bytes(), &envelope) {
            Ok(p) => p,
            Err(e) => {
                // This record is lost, but framing is intact; keep reading.
                return Some(AuditRecord::Gap {
                    offset: frame_offset,
                    reason: e.to_string(),
                    recoverable: true,
                });
            }
        };

        match serde_json::from_slice::<AuditEvent>(&plaintext) {
            Ok(event) => Some(AuditRecord::Event(event)),
            Err(e) => Some(AuditRecord::Gap {
                offset: frame_offset,
                reason: format!("unparseable record: {}", e),
                recoverable: true,
            }),
        }
    }
}

impl Iterator for AuditReader {
    type Item = AuditRecord;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.next_record()? {
                AuditRecord::Event(event) if !self.filter.matches(&event) => continue,
                record => return Some(record),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_log(dir: &TempDir) -> AuditLog {
        AuditLog::open(dir.path().join("logs").join("audit.log"), MasterKey::generate()).unwrap()
    }

    fn events_of(log: &AuditLog, filter: AuditFilter) -> Vec<AuditEvent> {
        log.read(filter)
            .unwrap()
            .filter_map(|r| match r {
                AuditRecord::Event(e) => Some(e),
                AuditRecord::Gap { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_log_and_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);

        log.log(
            &AuditEvent::new(AuditEventType::Query, "alice")
                .with_query_hash(payload_hash(b"where are the launch codes"))
                .with_classification(ClassificationLevel::Secret)
                .with_details(serde_json::json!({"chunk_ids": ["a", "b"]})),
        )
        .unwrap();
        log.log(&AuditEvent::new(AuditEventType::AccessDenied, "mallory").denied())
            .unwrap();

        let events = events_of(&log, AuditFilter::default());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::Query);
        assert_eq!(events[0].classification, ClassificationLevel::Secret);
        assert!(events[0].query_hash.is_some());
        assert!(!events[1].success);
    }

    #[test]
    fn test_raw_query_never_on_disk() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        let secret_query = "codeword ABRAXAS location";

        log.log(
            &AuditEvent::new(AuditEventType::Query, "alice")
                .with_query_hash(payload_hash(secret_query.as_bytes())),
        )
        .unwrap();

        let raw = std::fs::read(dir.path().join("logs").join("audit.log")).unwrap();
        let haystack = String::from_utf8_lossy(&raw);
        assert!(!haystack.contains("ABRAXAS"));
    }

    #[test]
    fn test_filter_by_type_and_user() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        log.log(&AuditEvent::new(AuditEventType::Query, "alice")).unwrap();
        log.log(&AuditEvent::new(AuditEventType::Query, "bob")).unwrap();
        log.log(&AuditEvent::new(AuditEventType::AccessDenied, "bob").denied())
            .unwrap();

        let bob_denied = events_of(
            &log,
            AuditFilter {
                event_type: Some(AuditEventType::AccessDenied),
                user_id: Some("bob".into()),
                since: None,
            },
        );
        assert_eq!(bob_denied.len(), 1);
        assert_eq!(bob_denied[0].user_id, "bob");
    }

    #[test]
    fn test_corrupted_record_is_a_gap_not_a_failure() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        log.log(&AuditEvent::new(AuditEventType::Query, "one")).unwrap();
        log.log(&AuditEvent::new(AuditEventType::Query, "two")).unwrap();
        log.log(&AuditEvent::new(AuditEventType::Query, "three")).unwrap();

        // Corrupt a byte inside the second record's ciphertext, leaving
        // both length prefixes intact.
        let path = dir.path().join("logs").join("audit.log");
        let mut bytes = std::fs::read(&path).unwrap();
        let first_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let second_payload_start = 4 + first_len + 4;
        bytes[second_payload_start + NONCE_LEN + 2] ^= 0xFF;
        std::fs::write(&path, &bytes).unwrap();

        let records: Vec<AuditRecord> = log.read(AuditFilter::default()).unwrap().collect();
        assert_eq!(records.len(), 3);
        assert!(matches!(records[0], AuditRecord::Event(_)));
        assert!(matches!(
            records[1],
            AuditRecord::Gap {
                recoverable: true,
                ..
            }
        ));
        assert!(matches!(records[2], AuditRecord::Event(_)));
    }

    #[test]
    fn test_read_is_restartable() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        log.log(&AuditEvent::new(AuditEventType::Query, "alice")).unwrap();

        let first: Vec<_> = log.read(AuditFilter::default()).unwrap().collect();
        let second: Vec<_> = log.read(AuditFilter::default()).unwrap().collect();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
    }

    #[test]
    fn test_implausible_length_ends_stream() {
        let dir = TempDir::new().unwrap();
        let log = open_log(&dir);
        log.log(&AuditEvent::new(AuditEventType::Query, "alice")).unwrap();

        // Append garbage that cannot be a valid frame header
        let path = dir.path().join("logs").join("audit.log");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"junk");
        std::fs::write(&path, &bytes).unwrap();

        let records: Vec<AuditRecord> = log.read(AuditFilter::default()).unwrap().collect();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0], AuditRecord::Event(_)));
        assert!(matches!(
            records[1],
            AuditRecord::Gap {
                recoverable: false,
                ..
            }
        ));
    }

    #[test]
    fn test_concurrent_writers_never_interleave_frames() {
        let dir = TempDir::new().unwrap();
        let log = std::sync::Arc::new(open_log(&dir));

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        log.log(
                            &AuditEvent::new(AuditEventType::Query, format!("user-{}", t))
                                .with_details(serde_json::json!({ "seq": i })),
                        )
                        .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let records: Vec<AuditRecord> = log.read(AuditFilter::default()).unwrap().collect();
        assert_eq!(records.len(), 8 * 200);
        assert!(records
            .iter()
            .all(|r| matches!(r, AuditRecord::Event(_))));
    }

    #[test]
    fn test_payload_hash_is_stable() {
        assert_eq!(payload_hash(b"x"), payload_hash(b"x"));
        assert_ne!(payload_hash(b"x"), payload_hash(b"y"));
    }
}

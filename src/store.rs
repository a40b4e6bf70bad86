//! Encrypted vector store for vaultsearch
//!
//! Exact inner-product search over L2-normalized vectors, persisted as two
//! authenticated envelopes (`index.bin.enc`, `metadata.bin.enc`). The index
//! is append-only: insertion order is the deterministic tie-break for
//! equal-similarity results, and deletion is a tombstone followed by an
//! explicit compaction rebuild.
//!
//! # Security
//! An authentication failure on load is fatal for the artifact. The store
//! never falls back to an empty or partially decrypted index, and never
//! regenerates a key when ciphertext already exists on disk.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::classification::ClassificationLevel;
use crate::crypto::{Crypto, CryptoError};
use crate::keys::{
    create_secure_dir, set_secure_permissions, KeyError, KeyManager, MasterKey, FILE_PERMISSIONS,
};

/// Sealed index envelope file name.
pub const INDEX_FILE: &str = "index.bin.enc";

/// Sealed metadata envelope file name.
pub const METADATA_FILE: &str = "metadata.bin.enc";

/// Advisory lock guarding single-process ownership of a store directory.
const LOCK_FILE: &str = ".lock";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Vector dimension mismatch: expected {expected}, got {found}")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Invalid vector: {0}")]
    InvalidVector(String),
    #[error(
        "Failed to decrypt {artifact}: {detail}. Either the master key does not \
         match the one this store was encrypted with (wrong or replaced key file), \
         or the file was corrupted on disk. Restore the matching key or a backup \
         of the store; the data cannot be read as-is."
    )]
    Decryption { artifact: String, detail: String },
    #[error("Store is inconsistent: {0}")]
    Corrupt(String),
    #[error("Store directory is locked by another process: {0}")]
    Locked(String),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error("Store I/O error: {0}")]
    Io(String),
    #[error("Index serialization error: {0}")]
    Serialization(String),
}

/// Fixed-shape source reference attached to every chunk, validated at the
/// ingestion boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub document_id: String,
    pub origin: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// A chunk submitted for storage. Immutable once added.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub vector: Vec<f32>,
    pub classification: ClassificationLevel,
    pub source: SourceRef,
}

/// Per-chunk metadata persisted alongside the vector index.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkMeta {
    id: String,
    classification: ClassificationLevel,
    source: SourceRef,
    /// SHA-256 over id, classification and the normalized vector bytes.
    checksum: String,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    /// Inner product of unit vectors (cosine similarity, range [-1, 1]).
    pub score: f32,
    pub classification: ClassificationLevel,
    pub source: SourceRef,
    /// Insertion position; lower index wins similarity ties.
    pub index: usize,
}

/// Index statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StoreStats {
    pub total_chunks: usize,
    pub tombstoned: usize,
    pub dimension: usize,
}

/// Serialized form of the vector index envelope.
#[derive(Serialize, Deserialize)]
struct IndexImage {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

/// Serialized form of the metadata envelope.
#[derive(Serialize, Deserialize)]
struct MetadataImage {
    records: Vec<ChunkMeta>,
    tombstones: Vec<String>,
}

/// Encrypted, append-only vector store with exact nearest-neighbor search.
pub struct EncryptedVectorStore {
    dimension: usize,
    store_dir: PathBuf,
    key: MasterKey,
    vectors: Vec<Vec<f32>>,
    meta: Vec<ChunkMeta>,
    tombstones: HashSet<String>,
    // Held for the lifetime of the store; released on drop.
    _lock: File,
}

impl EncryptedVectorStore {
    /// Open or create a store at `store_dir`, resolving the master key via
    /// the key manager.
    ///
    /// Takes an exclusive advisory lock on the directory; a second process
    /// opening the same path fails with [`StoreError::Locked`]. If sealed
    /// data exists it is loaded eagerly, so a wrong key fails here rather
    /// than at first query.
    pub fn initialize(
        dimension: usize,
        store_dir: &Path,
        key_path: &Path,
    ) -> Result<Self, StoreError> {
        create_secure_dir(store_dir).map_err(|e| StoreError::Io(e.to_string()))?;

        let data_present =
            store_dir.join(INDEX_FILE).exists() || store_dir.join(METADATA_FILE).exists();
        let key = KeyManager::load_or_create(key_path, data_present)?;

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(store_dir.join(LOCK_FILE))
            .map_err(|e| StoreError::Io(e.to_string()))?;
        lock.try_lock_exclusive()
            .map_err(|_| StoreError::Locked(store_dir.display().to_string()))?;

        let mut store = Self {
            dimension,
            store_dir: store_dir.to_path_buf(),
            key,
            vectors: Vec::new(),
            meta: Vec::new(),
            tombstones: HashSet::new(),
            _lock: lock,
        };

        if data_present {
            store.load()?;
        }

        tracing::info!(
            dimension,
            chunks = store.vectors.len(),
            path = %store_dir.display(),
            "vector store initialized"
        );
        Ok(store)
    }

    /// The master key, for components that seal with the same key but
    /// independently (the audit log).
    pub fn key(&self) -> &MasterKey {
        &self.key
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of stored chunks, tombstoned included.
    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            total_chunks: self.vectors.len(),
            tombstoned: self.tombstones.len(),
            dimension: self.dimension,
        }
    }

    /// Append chunks to the in-memory index.
    ///
    /// The whole batch is validated before anything is appended: on any
    /// rejection the store is unchanged.
    pub fn add(&mut self, chunks: Vec<Chunk>) -> Result<usize, StoreError> {
        let mut normalized = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            if chunk.vector.len() != self.dimension {
                return Err(StoreError::DimensionMismatch {
                    expected: self.dimension,
                    found: chunk.vector.len(),
                });
            }
            if chunk.vector.iter().any(|v| !v.is_finite()) {
                return Err(StoreError::InvalidVector(format!(
                    "chunk {} contains a non-finite component",
                    chunk.id
                )));
            }
            normalized.push(l2_normalize(&chunk.vector).ok_or_else(|| {
                StoreError::InvalidVector(format!("chunk {} has zero norm", chunk.id))
            })?);
        }

        let added = chunks.len();
        for (chunk, vector) in chunks.into_iter().zip(normalized) {
            let checksum = chunk_checksum(&chunk.id, chunk.classification, &vector);
            self.meta.push(ChunkMeta {
                id: chunk.id,
                classification: chunk.classification,
                source: chunk.source,
                checksum,
            });
            self.vectors.push(vector);
        }

        tracing::debug!(added, total = self.vectors.len(), "chunks appended");
        Ok(added)
    }

    /// Exact top-`k` search by inner product over unit vectors.
    ///
    /// Deterministic: equal scores are broken by lower insertion index.
    /// Tombstoned chunks never appear in results.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, StoreError> {
        if query.len() != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                found: query.len(),
            });
        }
        let query = l2_normalize(query)
            .ok_or_else(|| StoreError::InvalidVector("query vector has zero norm".into()))?;

        let mut hits: Vec<SearchHit> = self
            .vectors
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.tombstones.contains(&self.meta[*i].id))
            .map(|(i, v)| {
                let score = dot(&query, v);
                let m = &self.meta[i];
                SearchHit {
                    chunk_id: m.id.clone(),
                    score,
                    classification: m.classification,
                    source: m.source.clone(),
                    index: i,
                }
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.index.cmp(&b.index)));
        hits.truncate(k);
        Ok(hits)
    }

    /// Serialize, seal and atomically write both envelopes. A fresh nonce
    /// is drawn per envelope per save; a crash mid-save leaves the previous
    /// files intact.
    pub fn save(&self) -> Result<(), StoreError> {
        let index_image = IndexImage {
            dimension: self.dimension,
            vectors: self.vectors.clone(),
        };
        let metadata_image = MetadataImage {
            records: self.meta.clone(),
            tombstones: {
                let mut t: Vec<String> = self.tombstones.iter().cloned().collect();
                t.sort();
                t
            },
        };

        self.write_sealed(INDEX_FILE, &index_image)?;
        self.write_sealed(METADATA_FILE, &metadata_image)?;

        tracing::info!(
            chunks = self.vectors.len(),
            path = %self.store_dir.display(),
            "vector store saved"
        );
        Ok(())
    }

    /// Decrypt and deserialize both envelopes, replacing the in-memory
    /// index. Fails loudly on tag mismatch; never leaves partial state.
    pub fn load(&mut self) -> Result<(), StoreError> {
        let index_image: IndexImage = self.read_sealed(INDEX_FILE)?;
        let metadata_image: MetadataImage = self.read_sealed(METADATA_FILE)?;

        if index_image.dimension != self.dimension {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimension,
                found: index_image.dimension,
            });
        }
        if index_image.vectors.len() != metadata_image.records.len() {
            return Err(StoreError::Corrupt(format!(
                "index holds {} vectors but metadata holds {} records",
                index_image.vectors.len(),
                metadata_image.records.len()
            )));
        }
        // Both envelopes authenticate individually; the checksums catch a
        // pairing of index and metadata files from two different saves.
        for (m, v) in metadata_image.records.iter().zip(&index_image.vectors) {
            if chunk_checksum(&m.id, m.classification, v) != m.checksum {
                return Err(StoreError::Corrupt(format!(
                    "checksum mismatch for chunk {}: index and metadata do not belong together",
                    m.id
                )));
            }
        }

        self.vectors = index_image.vectors;
        self.meta = metadata_image.records;
        self.tombstones = metadata_image.tombstones.into_iter().collect();

        tracing::info!(chunks = self.vectors.len(), "vector store loaded");
        Ok(())
    }

    /// Mark a chunk logically deleted. Returns false if the id is unknown.
    /// The vector stays on disk until [`Self::compact`] rebuilds the index.
    pub fn tombstone(&mut self, chunk_id: &str) -> bool {
        if self.meta.iter().any(|m| m.id == chunk_id) {
            self.tombstones.insert(chunk_id.to_string());
            true
        } else {
            false
        }
    }

    /// Rebuild the index without tombstoned chunks. Returns the number of
    /// chunks physically removed. Insertion order of survivors is
    /// preserved, so tie-break behavior stays stable.
    pub fn compact(&mut self) -> usize {
        if self.tombstones.is_empty() {
            return 0;
        }
        let before = self.vectors.len();
        let mut vectors = Vec::with_capacity(before);
        let mut meta = Vec::with_capacity(before);
        for (v, m) in self.vectors.drain(..).zip(self.meta.drain(..)) {
            if !self.tombstones.contains(&m.id) {
                vectors.push(v);
                meta.push(m);
            }
        }
        self.vectors = vectors;
        self.meta = meta;
        self.tombstones.clear();
        let removed = before - self.vectors.len();
        tracing::info!(removed, remaining = self.vectors.len(), "store compacted");
        removed
    }

    fn write_sealed<T: Serialize>(&self, file_name: &str, image: &T) -> Result<(), StoreError> {
        let plaintext =
            bincode::serialize(image).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let envelope = Crypto::seal(self.key.as_bytes(), &plaintext)
            .map_err(|e| StoreError::Io(e.to_string()))?;

        let path = self.store_dir.join(file_name);
        let mut temp = NamedTempFile::new_in(&self.store_dir)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        temp.write_all(&envelope)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        #[cfg(unix)]
        {
            temp.as_file()
                .set_permissions(fs::Permissions::from_mode(FILE_PERMISSIONS))
                .map_err(|e| StoreError::Io(e.to_string()))?;
        }
        temp.persist(&path)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        set_secure_permissions(&path, FILE_PERMISSIONS)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn read_sealed<T: for<'de> Deserialize<'de>>(
        &self,
        file_name: &str,
    ) -> Result<T, StoreError> {
        let path = self.store_dir.join(file_name);
        let envelope = fs::read(&path).map_err(|e| {
            StoreError::Corrupt(format!("missing or unreadable {}: {}", file_name, e))
        })?;

        let plaintext = Crypto::open(self.key.as_bytes(), &envelope).map_err(|e| match e {
            CryptoError::Decryption(detail) | CryptoError::Encryption(detail) => {
                StoreError::Decryption {
                    artifact: file_name.to_string(),
                    detail,
                }
            }
            CryptoError::EnvelopeTooShort { len, min } => StoreError::Decryption {
                artifact: file_name.to_string(),
                detail: format!("envelope truncated to {} bytes (minimum {})", len, min),
            },
        })?;

        bincode::deserialize(&plaintext).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Unit-normalize a vector; None for zero (or numerically zero) norm.
fn l2_normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return None;
    }
    Some(v.iter().map(|x| x / norm).collect())
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn chunk_checksum(id: &str, classification: ClassificationLevel, vector: &[f32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    hasher.update(classification.to_string().as_bytes());
    for component in vector {
        hasher.update(component.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_chunk(id: &str, vector: Vec<f32>, classification: ClassificationLevel) -> Chunk {
        Chunk {
            id: id.to_string(),
            vector,
            classification,
            source: SourceRef {
                document_id: format!("doc-{}", id),
                origin: "test.md".to_string(),
                section: None,
            },
        }
    }

    fn open_store(dir: &TempDir, dimension: usize) -> EncryptedVectorStore {
        EncryptedVectorStore::initialize(
            dimension,
            &dir.path().join("vectors"),
            &dir.path().join("keys").join("master.key"),
        )
        .expect("store init failed")
    }

    #[test]
    fn test_add_and_search_own_vector() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, 3);

        store
            .add(vec![
                test_chunk("a", vec![1.0, 0.0, 0.0], ClassificationLevel::Unclassified),
                test_chunk("b", vec![0.0, 1.0, 0.0], ClassificationLevel::Secret),
            ])
            .unwrap();

        let hits = store.search(&[0.0, 1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].chunk_id, "b");
        assert!((hits[0].score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch_leaves_store_unchanged() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, 3);
        store
            .add(vec![test_chunk(
                "a",
                vec![1.0, 0.0, 0.0],
                ClassificationLevel::Unclassified,
            )])
            .unwrap();

        // Batch with one good and one bad chunk must be rejected whole
        let result = store.add(vec![
            test_chunk("good", vec![0.0, 1.0, 0.0], ClassificationLevel::Unclassified),
            test_chunk("bad", vec![1.0, 0.0], ClassificationLevel::Unclassified),
        ]);
        assert!(matches!(
            result,
            Err(StoreError::DimensionMismatch {
                expected: 3,
                found: 2
            })
        ));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_tie_break_by_insertion_order() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, 2);
        // Identical vectors: identical similarity to any query
        store
            .add(vec![
                test_chunk("first", vec![1.0, 0.0], ClassificationLevel::Unclassified),
                test_chunk("second", vec![1.0, 0.0], ClassificationLevel::Unclassified),
            ])
            .unwrap();

        let hits = store.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].chunk_id, "first");
        assert_eq!(hits[1].chunk_id, "second");
    }

    #[test]
    fn test_save_load_roundtrip_identical_results() {
        let dir = TempDir::new().unwrap();
        let query = [0.6f32, 0.8, 0.0];

        let before = {
            let mut store = open_store(&dir, 3);
            for i in 0..10 {
                let angle = i as f32 * 0.3;
                store
                    .add(vec![test_chunk(
                        &format!("c{}", i),
                        vec![angle.cos(), angle.sin(), 0.1],
                        ClassificationLevel::Unclassified,
                    )])
                    .unwrap();
            }
            let hits = store.search(&query, 10).unwrap();
            store.save().unwrap();
            hits
        };

        let store = open_store(&dir, 3);
        let after = store.search(&query, 10).unwrap();

        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.chunk_id, a.chunk_id);
            assert!((b.score - a.score).abs() < 1e-6);
        }
    }

    #[test]
    fn test_flipped_byte_fails_load() {
        let dir = TempDir::new().unwrap();
        {
            let mut store = open_store(&dir, 2);
            store
                .add(vec![test_chunk(
                    "a",
                    vec![1.0, 0.0],
                    ClassificationLevel::Secret,
                )])
                .unwrap();
            store.save().unwrap();
        }

        let index_path = dir.path().join("vectors").join(INDEX_FILE);
        let mut bytes = fs::read(&index_path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        fs::write(&index_path, &bytes).unwrap();

        let result = EncryptedVectorStore::initialize(
            2,
            &dir.path().join("vectors"),
            &dir.path().join("keys").join("master.key"),
        );
        assert!(matches!(result, Err(StoreError::Decryption { .. })));
    }

    #[test]
    fn test_missing_key_with_data_is_fatal() {
        let dir = TempDir::new().unwrap();
        let key_path = dir.path().join("keys").join("master.key");
        {
            let mut store =
                EncryptedVectorStore::initialize(2, &dir.path().join("vectors"), &key_path)
                    .unwrap();
            store
                .add(vec![test_chunk(
                    "a",
                    vec![1.0, 0.0],
                    ClassificationLevel::Unclassified,
                )])
                .unwrap();
            store.save().unwrap();
        }
        fs::remove_file(&key_path).unwrap();

        let result =
            EncryptedVectorStore::initialize(2, &dir.path().join("vectors"), &key_path);
        assert!(matches!(
            result,
            Err(StoreError::Key(KeyError::MissingKeyForExistingData))
        ));
    }

    #[test]
    fn test_mismatched_envelope_pair_fails_load() {
        let dir = TempDir::new().unwrap();
        let index_path = dir.path().join("vectors").join(INDEX_FILE);

        // First save: two chunks
        {
            let mut store = open_store(&dir, 2);
            store
                .add(vec![
                    test_chunk("a", vec![1.0, 0.0], ClassificationLevel::Unclassified),
                    test_chunk("b", vec![0.0, 1.0], ClassificationLevel::Secret),
                ])
                .unwrap();
            store.save().unwrap();
        }
        let stale_index = fs::read(&index_path).unwrap();

        // Second save: same chunk count, different content
        {
            let mut store = open_store(&dir, 2);
            assert!(store.tombstone("a"));
            store.compact();
            store
                .add(vec![test_chunk(
                    "c",
                    vec![1.0, 1.0],
                    ClassificationLevel::Unclassified,
                )])
                .unwrap();
            store.save().unwrap();
        }

        // Pair the old index with the new metadata; both still authenticate
        fs::write(&index_path, &stale_index).unwrap();
        let result = EncryptedVectorStore::initialize(
            2,
            &dir.path().join("vectors"),
            &dir.path().join("keys").join("master.key"),
        );
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_tombstone_and_compact() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, 2);
        store
            .add(vec![
                test_chunk("keep", vec![1.0, 0.0], ClassificationLevel::Unclassified),
                test_chunk("drop", vec![0.0, 1.0], ClassificationLevel::Unclassified),
            ])
            .unwrap();

        assert!(store.tombstone("drop"));
        assert!(!store.tombstone("unknown"));

        let hits = store.search(&[0.0, 1.0], 2).unwrap();
        assert!(hits.iter().all(|h| h.chunk_id != "drop"));

        assert_eq!(store.compact(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().tombstoned, 0);
    }

    #[test]
    fn test_zero_vector_rejected() {
        let dir = TempDir::new().unwrap();
        let mut store = open_store(&dir, 2);
        let result = store.add(vec![test_chunk(
            "z",
            vec![0.0, 0.0],
            ClassificationLevel::Unclassified,
        )]);
        assert!(matches!(result, Err(StoreError::InvalidVector(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _store = open_store(&dir, 2);
        let result = EncryptedVectorStore::initialize(
            2,
            &dir.path().join("vectors"),
            &dir.path().join("keys").join("master.key"),
        );
        assert!(matches!(result, Err(StoreError::Locked(_))));
    }
}

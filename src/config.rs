//! Engine configuration for vaultsearch
//!
//! A single validated config struct replaces ambient globals; the engine
//! owns its copy and every path is explicit.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default embedding dimension (all-MiniLM-class models).
pub const DEFAULT_DIMENSION: usize = 384;

/// Default number of results returned per query.
pub const DEFAULT_TOP_K: usize = 5;

/// Default minimum cosine similarity for a result to be returned.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Raw candidates fetched per requested result, to absorb clearance
/// filtering losses.
pub const CANDIDATE_MULTIPLIER: usize = 3;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid embedding dimension: {0} (must be > 0)")]
    InvalidDimension(usize),
    #[error("Invalid top_k: {0} (must be > 0)")]
    InvalidTopK(usize),
    #[error("Invalid similarity threshold: {0} (must be within [-1, 1])")]
    InvalidThreshold(f32),
    #[error("Invalid path for {field}: must not be empty")]
    EmptyPath { field: &'static str },
}

/// Engine configuration. Construct with [`EngineConfig::new`] for the
/// standard layout under a base directory, or fill fields explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Embedding vector dimension; fixed for the lifetime of a store.
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Directory holding `index.bin.enc` and `metadata.bin.enc`.
    pub store_dir: PathBuf,
    /// Path to the 32-byte master key file.
    pub key_path: PathBuf,
    /// Path to the sealed audit log.
    pub audit_path: PathBuf,
    /// Results returned per query unless overridden per call.
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Minimum similarity for returned results unless overridden.
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f32,
}

fn default_dimension() -> usize {
    DEFAULT_DIMENSION
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_threshold() -> f32 {
    DEFAULT_SIMILARITY_THRESHOLD
}

impl EngineConfig {
    /// Standard layout under `base`: `data/vectors`, `data/keys/master.key`,
    /// `logs/audit.log`.
    pub fn new(base: &Path) -> Self {
        Self {
            dimension: DEFAULT_DIMENSION,
            store_dir: base.join("data").join("vectors"),
            key_path: base.join("data").join("keys").join("master.key"),
            audit_path: base.join("logs").join("audit.log"),
            top_k: DEFAULT_TOP_K,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    /// Validate before any file is touched; failures are fatal at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dimension == 0 {
            return Err(ConfigError::InvalidDimension(self.dimension));
        }
        if self.top_k == 0 {
            return Err(ConfigError::InvalidTopK(self.top_k));
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold)
            || self.similarity_threshold.is_nan()
        {
            return Err(ConfigError::InvalidThreshold(self.similarity_threshold));
        }
        if self.store_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath { field: "store_dir" });
        }
        if self.key_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath { field: "key_path" });
        }
        if self.audit_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath { field: "audit_path" });
        }
        Ok(())
    }
}

//! Common test utilities for vaultsearch integration tests
//!
//! Provides a deterministic bag-of-words embedder, a temp-directory engine
//! context and a small mixed-classification seed corpus.

use tempfile::TempDir;

use vaultsearch::retriever::{EmbeddingError, EmbeddingProvider};
use vaultsearch::{
    ClassificationLevel, EngineConfig, IngestRecord, RetrievalOrchestrator, Role, SourceRef,
};

/// Vocabulary of the test embedder; one dimension per word.
pub const VOCAB: [&str; 8] = [
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel",
];

/// Deterministic bag-of-words embedder: component `i` counts occurrences
/// of `VOCAB[i]`. Identical text always embeds identically, and texts
/// sharing words score high cosine similarity.
pub struct KeywordEmbedder;

impl EmbeddingProvider for KeywordEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let lower = text.to_lowercase();
        Ok(VOCAB
            .iter()
            .map(|w| lower.split_whitespace().filter(|t| t == w).count() as f32)
            .collect())
    }
}

/// Embedder that always fails, for error-path tests.
#[allow(dead_code)]
pub struct BrokenEmbedder;

impl EmbeddingProvider for BrokenEmbedder {
    fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::Provider("model unavailable".into()))
    }
}

#[allow(dead_code)]
pub struct TestContext {
    // Held so the directory outlives the engine
    pub tmp: TempDir,
    pub config: EngineConfig,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        // Idempotent; lets RUST_LOG surface engine traces in test output
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let tmp = TempDir::new().unwrap();
        let mut config = EngineConfig::new(tmp.path());
        config.dimension = VOCAB.len();
        Self { tmp, config }
    }

    /// Engine with the standard user roster registered.
    pub fn engine(&self) -> RetrievalOrchestrator {
        let engine =
            RetrievalOrchestrator::new(self.config.clone(), Box::new(KeywordEmbedder)).unwrap();
        engine.register_user("admin", vec![Role::admin()]);
        engine.register_user("analyst_ts", vec![Role::analyst_ts()]);
        engine.register_user("analyst_s", vec![Role::analyst_s()]);
        engine.register_user("analyst_c", vec![Role::analyst_c()]);
        engine.register_user("operator", vec![Role::operator()]);
        engine
    }
}

#[allow(dead_code)]
pub fn record(text: &str, classification: ClassificationLevel, doc: &str) -> IngestRecord {
    IngestRecord {
        text: text.to_string(),
        classification,
        source: SourceRef {
            document_id: doc.to_string(),
            origin: "test-suite".to_string(),
            section: None,
        },
    }
}

/// A small mixed-classification corpus keyed on distinct vocabulary words.
pub fn seed_corpus(engine: &RetrievalOrchestrator) -> Vec<String> {
    let receipt = engine
        .ingest(
            "admin",
            vec![
                record("alpha alpha bravo", ClassificationLevel::Unclassified, "u-1"),
                record("alpha charlie", ClassificationLevel::Confidential, "c-1"),
                record("alpha delta", ClassificationLevel::Secret, "s-1"),
                record("alpha echo", ClassificationLevel::TopSecret, "ts-1"),
            ],
        )
        .unwrap();
    receipt.chunk_ids
}

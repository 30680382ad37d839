//! # Evigraph Pipeline
//!
//! The eight-stage GraphRAG core:
//!
//! 0. [`chunker`] — semantic chunking with section paths
//! 1. [`coref`] — coreference and alias resolution
//! 2. [`linker`] — multi-retrieval entity linking with ontology gating
//! 3. [`claims`] — claim extraction with inter-claim relations
//!    (plus [`dedup`], [`align`], [`nli`])
//! 4. [`themes`] — topic-community detection and summarization
//! 5. [`governor`] — predicate normalization and type constraints
//! 6. [`graph_service`] — idempotent persistence with provenance
//! 7. [`query`] — theme-first hybrid retrieval with anchored answers
//! 8. [`quality`] + [`feedback`] — metrics and the feedback loop
//!
//! [`ingest`] chains stages 0-6 per document. Stages are sequential async
//! functions; the only suspension points are the LLM, embedding and store
//! calls, and every suspension point polls the job's cancellation token.
//! Distinct documents run concurrently; within a document, chunk order is
//! preserved.
//!
//! Providers are trait objects ([`LlmClient`], [`EmbeddingClient`]) so tests
//! substitute deterministic mocks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use evigraph_config::{EvigraphConfig, GovernanceConfig};
use evigraph_core::{AliasDictionary, GraphStore};

pub mod align;
pub mod chunker;
pub mod claims;
pub mod coref;
pub mod dedup;
pub mod error;
pub mod feedback;
pub mod governor;
pub mod graph_service;
pub mod ingest;
pub mod linker;
pub mod nli;
pub mod quality;
pub mod query;
pub mod themes;

pub use error::PipelineError;

// ---------------------------------------------------------------------------
// Provider contracts
// ---------------------------------------------------------------------------

/// One chat message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// A chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// LLM provider contract. Implementations are thin protocol adapters; model
/// name and endpoint come from configuration.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError>;
}

/// Embedding provider contract. Dimensionality is fixed per deployment.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError>;
    fn dim(&self) -> usize;
}

/// Process-local embedding cache keyed by text hash. Optional; wraps any
/// [`EmbeddingClient`].
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingClient>,
    cache: Mutex<HashMap<String, Vec<f32>>>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingClient>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }
}

#[async_trait]
impl EmbeddingClient for CachedEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<(usize, String)> = Vec::new();
        {
            let cache = self.cache.lock().unwrap();
            for (i, text) in texts.iter().enumerate() {
                match cache.get(&Self::key(text)) {
                    Some(hit) => out[i] = Some(hit.clone()),
                    None => misses.push((i, text.clone())),
                }
            }
        }
        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|(_, t)| t.clone()).collect();
            let vectors = self.inner.embed(&miss_texts).await?;
            if vectors.len() != miss_texts.len() {
                return Err(PipelineError::Embedding(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    miss_texts.len()
                )));
            }
            let mut cache = self.cache.lock().unwrap();
            for ((i, text), vector) in misses.into_iter().zip(vectors) {
                cache.insert(Self::key(&text), vector.clone());
                out[i] = Some(vector);
            }
        }
        Ok(out.into_iter().map(|v| v.expect("filled")).collect())
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }
}

// ---------------------------------------------------------------------------
// Governance handle
// ---------------------------------------------------------------------------

/// Copy-on-write handle to the governance configuration.
///
/// A running ingestion takes one snapshot and sees it unchanged for the whole
/// build; feedback updates publish a new snapshot that the next build picks
/// up.
#[derive(Clone)]
pub struct GovernanceHandle {
    inner: Arc<RwLock<Arc<GovernanceConfig>>>,
}

impl GovernanceHandle {
    pub fn new(config: GovernanceConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<GovernanceConfig> {
        self.inner.read().unwrap().clone()
    }

    /// Publish an updated configuration derived from the current snapshot.
    pub fn update(&self, mutate: impl FnOnce(&mut GovernanceConfig)) {
        let mut guard = self.inner.write().unwrap();
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }
}

// ---------------------------------------------------------------------------
// Pipeline context
// ---------------------------------------------------------------------------

/// Everything a stage needs, passed explicitly instead of ambient globals:
/// configuration, provider handles, the store, the alias dictionary snapshot
/// source, and the job's cancellation token.
#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<EvigraphConfig>,
    pub governance: Arc<GovernanceConfig>,
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub store: Arc<dyn GraphStore>,
    pub aliases: AliasDictionary,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    /// Cancellation poll; called at every suspension point.
    pub fn checkpoint(&self) -> Result<(), PipelineError> {
        if self.cancel.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Build a chat request with the configured model and sampling settings.
    pub fn chat(&self, messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            messages,
            model: self.config.llm.model.clone(),
            max_tokens: self.config.llm.max_tokens,
            temperature: self.config.llm.temperature,
        }
    }

    /// Embed a batch, respecting the configured sub-batch size.
    pub async fn embed_batched(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let batch_size = self.config.embedding.batch_size.max(1);
        let mut out = Vec::with_capacity(texts.len());
        for sub in texts.chunks(batch_size) {
            self.checkpoint()?;
            out.extend(self.embedder.embed(sub).await?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingClient for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            self.calls.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn dim(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn cached_embedder_deduplicates_calls() {
        let inner = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedEmbedder::new(inner.clone());

        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let first = cached.embed(&texts).await.unwrap();
        let second = cached.embed(&texts).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);

        let mixed = vec!["alpha".to_string(), "gamma".to_string()];
        cached.embed(&mixed).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn governance_handle_is_copy_on_write() {
        let handle = GovernanceHandle::new(GovernanceConfig::default());
        let before = handle.snapshot();
        handle.update(|g| {
            g.predicates
                .insert("等同于".into(), evigraph_core::Predicate::SimilarTo);
        });
        assert!(before.predicates.normalize("等同于").is_none());
        assert_eq!(
            handle.snapshot().predicates.normalize("等同于"),
            Some(evigraph_core::Predicate::SimilarTo)
        );
    }

    #[test]
    fn checkpoint_reports_cancellation() {
        let ctx_cancel = CancellationToken::new();
        ctx_cancel.cancel();
        assert!(ctx_cancel.is_cancelled());
    }
}

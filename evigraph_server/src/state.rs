//! Application state shared across request handlers.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use evigraph_config::EvigraphConfig;
use evigraph_core::{AliasDictionary, GraphStore, MemoryGraph};
use evigraph_pipeline::feedback::FeedbackService;
use evigraph_pipeline::quality::QualityService;
use evigraph_pipeline::query::QueryService;
use evigraph_pipeline::{
    CachedEmbedder, EmbeddingClient, GovernanceHandle, LlmClient, PipelineContext,
};

use crate::jobs::JobRegistry;
use crate::llm::{MockEmbedder, MockLlm, OpenAiCompatEmbedder, OpenAiCompatLlm};
use crate::metrics::PrometheusMetrics;

/// Shared application state, wrapped in `Arc` and handed to Axum's `State`
/// extractor.
pub struct AppState {
    pub config: Arc<EvigraphConfig>,
    pub governance: GovernanceHandle,
    pub store: Arc<dyn GraphStore>,
    pub aliases: AliasDictionary,
    pub llm: Arc<dyn LlmClient>,
    pub embedder: Arc<dyn EmbeddingClient>,
    pub jobs: JobRegistry,
    pub query: QueryService,
    pub feedback: FeedbackService,
    pub metrics: PrometheusMetrics,
    pub start_time: Instant,
}

impl AppState {
    /// Wire up providers and services from configuration. The embedded
    /// in-memory store backs the graph; external backends implement the same
    /// `GraphStore` contract.
    pub fn from_config(config: EvigraphConfig, governance: GovernanceHandle) -> Arc<Self> {
        let store: Arc<dyn GraphStore> = Arc::new(MemoryGraph::new());
        Self::with_store(config, governance, store)
    }

    pub fn with_store(
        config: EvigraphConfig,
        governance: GovernanceHandle,
        store: Arc<dyn GraphStore>,
    ) -> Arc<Self> {
        let config = Arc::new(config);
        let aliases = AliasDictionary::new();

        let llm: Arc<dyn LlmClient> = match config.llm.provider.as_str() {
            "openai-compatible" => Arc::new(OpenAiCompatLlm::from_config(&config)),
            _ => Arc::new(MockLlm),
        };
        let raw_embedder: Arc<dyn EmbeddingClient> = match config.embedding.provider.as_str() {
            "openai-compatible" => Arc::new(OpenAiCompatEmbedder::from_config(&config)),
            _ => Arc::new(MockEmbedder::new(config.embedding.dim)),
        };
        let embedder: Arc<dyn EmbeddingClient> = if config.embedding.cache_enabled {
            Arc::new(CachedEmbedder::new(raw_embedder))
        } else {
            raw_embedder
        };

        let query_ctx = PipelineContext {
            config: config.clone(),
            governance: governance.snapshot(),
            llm: llm.clone(),
            embedder: embedder.clone(),
            store: store.clone(),
            aliases: aliases.clone(),
            cancel: CancellationToken::new(),
        };

        Arc::new(Self {
            feedback: FeedbackService::new(store.clone(), aliases.clone(), governance.clone()),
            query: QueryService::new(query_ctx),
            config,
            governance,
            store,
            aliases,
            llm,
            embedder,
            jobs: JobRegistry::new(),
            metrics: PrometheusMetrics::new(),
            start_time: Instant::now(),
        })
    }

    /// Fresh pipeline context for a new job, bound to the current governance
    /// snapshot.
    pub fn pipeline_ctx(&self) -> PipelineContext {
        PipelineContext {
            config: self.config.clone(),
            governance: self.governance.snapshot(),
            llm: self.llm.clone(),
            embedder: self.embedder.clone(),
            store: self.store.clone(),
            aliases: self.aliases.clone(),
            cancel: CancellationToken::new(),
        }
    }

    /// Quality service bound to the current snapshot.
    pub fn quality(&self) -> QualityService {
        QualityService::new(self.pipeline_ctx())
    }
}

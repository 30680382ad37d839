//! Typed error taxonomy for the pipeline.
//!
//! Each variant maps to a job-status error kind. Per-chunk failures are
//! absorbed into diagnostics by the orchestrator; only document-level
//! failures propagate as `PipelineError`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Rejected before stage 0 (empty document, unsupported kind).
    #[error("input rejected: {0}")]
    Input(String),

    /// The LLM call itself failed (network, HTTP status, provider error).
    #[error("llm call failed: {0}")]
    Llm(String),

    /// The LLM answered but the response did not match the schema, even
    /// after the repair retry.
    #[error("llm response parse failed: {0}")]
    LlmParse(String),

    /// Embedding provider failure.
    #[error("embedding call failed: {0}")]
    Embedding(String),

    /// Edge rejected by the ontology type constraints.
    #[error("ontology violation: {0}")]
    Ontology(String),

    /// Store failure that survived the retry budget.
    #[error("store error: {0}")]
    Store(String),

    /// Invalid configuration detected past startup validation.
    #[error("configuration error: {0}")]
    Config(String),

    /// The job's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// A per-request or per-stage time budget was exceeded.
    #[error("deadline exceeded: {0}")]
    Timeout(String),
}

impl PipelineError {
    /// Stable taxonomy kind, surfaced in job status.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Input(_) => "input",
            PipelineError::Llm(_) => "llm",
            PipelineError::LlmParse(_) => "llm_parse",
            PipelineError::Embedding(_) => "embedding",
            PipelineError::Ontology(_) => "ontology",
            PipelineError::Store(_) => "store",
            PipelineError::Config(_) => "config",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Timeout(_) => "timeout",
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        PipelineError::Store(err.to_string())
    }
}

//! # Evigraph Server
//!
//! HTTP surface for the Evigraph GraphRAG engine: document ingestion with
//! async jobs, hybrid query, feedback and quality metrics. The pipeline
//! itself lives in `evigraph_pipeline`; this crate wires providers,
//! configuration and routing around it.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

pub mod error;
pub mod handlers;
pub mod jobs;
pub mod llm;
pub mod metrics;
pub mod state;
pub mod types;

pub use state::AppState;

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/api/v1/documents", post(handlers::ingest_document))
        .route("/api/v1/jobs/:id", get(handlers::job_status))
        .route("/api/v1/jobs/:id/cancel", post(handlers::cancel_job))
        .route("/api/v1/query", post(handlers::query))
        .route("/api/v1/feedback/merge", post(handlers::submit_merge))
        .route(
            "/api/v1/feedback/correction",
            post(handlers::submit_correction),
        )
        .route("/api/v1/feedback/unlink", post(handlers::submit_unlink))
        .route("/api/v1/feedback/pending", get(handlers::pending_feedback))
        .route(
            "/api/v1/feedback/review/:id",
            post(handlers::review_feedback),
        )
        .route(
            "/api/v1/metrics/builds/:version",
            get(handlers::build_metrics),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

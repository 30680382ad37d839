//! Axum route handlers for the Evigraph REST API.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use uuid::Uuid;

use evigraph_core::GraphStore;
use evigraph_pipeline::chunker::ParsedDocument;
use evigraph_pipeline::feedback::{FeedbackOperation, FeedbackRequest};
use evigraph_pipeline::quality::BuildQualityReport;
use evigraph_pipeline::query::QueryResponse;

use crate::error::{ApiError, AppError};
use crate::state::AppState;
use crate::types::*;

/// Health check with component status and graph totals.
#[utoipa::path(
    get,
    path = "/api/v1/health",
    tag = "Health",
    responses((status = 200, description = "Server is healthy", body = HealthResponse))
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, AppError> {
    state.metrics.track("health");
    let counts = state.store.counts().map_err(AppError::from)?;
    Ok(Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        llm_provider: state.config.llm.provider.clone(),
        embedding_provider: state.config.embedding.provider.clone(),
        embedding_dim: state.config.embedding.dim,
        graph_nodes: counts.documents + counts.chunks + counts.concepts + counts.claims
            + counts.themes,
        graph_edges: counts.edges,
    }))
}

/// Prometheus metrics in the text exposition format.
pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    if let Ok(counts) = state.store.counts() {
        let nodes =
            counts.documents + counts.chunks + counts.concepts + counts.claims + counts.themes;
        state.metrics.graph_nodes.set(nodes as i64);
        state.metrics.graph_edges.set(counts.edges as i64);
    }
    state.metrics.render()
}

/// Accept a pre-parsed document and enqueue an ingest job.
#[utoipa::path(
    post,
    path = "/api/v1/documents",
    tag = "Ingest",
    request_body = IngestRequest,
    responses(
        (status = 202, description = "Job accepted", body = IngestAccepted),
        (status = 400, description = "Empty text or unsupported kind", body = ApiError)
    )
)]
pub async fn ingest_document(
    State(state): State<Arc<AppState>>,
    Json(request): Json<IngestRequest>,
) -> Result<(axum::http::StatusCode, Json<IngestAccepted>), AppError> {
    state.metrics.track("documents");
    let kind = request
        .document_kind()
        .ok_or_else(|| AppError::bad_request(format!("unsupported document kind: {}", request.kind)))?;
    if request.text.trim().is_empty() {
        return Err(AppError::bad_request("document text is empty"));
    }

    state.metrics.ingest_jobs_total.inc();
    let doc_id = evigraph_core::ids::document_id(request.text.trim());
    let job_id = state.jobs.spawn_ingest(
        state.pipeline_ctx(),
        ParsedDocument::from_text(request.text),
        kind,
    );
    Ok((
        axum::http::StatusCode::ACCEPTED,
        Json(IngestAccepted {
            job_id: job_id.to_string(),
            doc_id,
        }),
    ))
}

/// Job status: stage, per-stage counts, review-queue size and error.
#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    tag = "Ingest",
    responses(
        (status = 200, description = "Job status", body = JobStatusResponse),
        (status = 404, description = "Unknown job", body = ApiError)
    )
)]
pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobStatusResponse>, AppError> {
    state.metrics.track("jobs");
    let uuid = Uuid::parse_str(&id).map_err(|_| AppError::bad_request("malformed job id"))?;
    let entry = state
        .jobs
        .get(&uuid)
        .ok_or_else(|| AppError::not_found(format!("no such job: {id}")))?;
    Ok(Json(JobStatusResponse::from_entry(id, &entry)))
}

/// Request cancellation of a running job.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<axum::http::StatusCode, AppError> {
    state.metrics.track("jobs");
    let uuid = Uuid::parse_str(&id).map_err(|_| AppError::bad_request("malformed job id"))?;
    if state.jobs.cancel(&uuid) {
        Ok(axum::http::StatusCode::ACCEPTED)
    } else {
        Err(AppError::not_found(format!(
            "no cancellable job with id {id}"
        )))
    }
}

/// Hybrid retrieval. Never fails on insufficient evidence; the structured
/// response carries whatever reasoning chain was assembled.
#[utoipa::path(
    post,
    path = "/api/v1/query",
    tag = "Query",
    request_body = QueryRequest,
    responses((status = 200, description = "Structured answer with evidence"))
)]
pub async fn query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    state.metrics.track("query");
    state.metrics.queries_total.inc();
    let top_k = request
        .top_k
        .unwrap_or(state.governance_top_k());
    let response = state
        .query
        .answer(&request.question, request.mode, top_k)
        .await?;
    Ok(Json(response))
}

impl AppState {
    fn governance_top_k(&self) -> usize {
        self.governance.snapshot().thresholds.retrieval_top_k
    }
}

// -- Feedback ---------------------------------------------------------------

pub async fn submit_merge(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MergeRequestBody>,
) -> Result<Json<FeedbackAccepted>, AppError> {
    state.metrics.track("feedback");
    state.metrics.feedback_total.inc();
    let request_id = state.feedback.submit(
        FeedbackOperation::Merge {
            source_concept_id: body.source_concept_id,
            target_concept_id: body.target_concept_id,
        },
        body.reason,
    );
    Ok(Json(FeedbackAccepted { request_id }))
}

pub async fn submit_correction(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CorrectionRequestBody>,
) -> Result<Json<FeedbackAccepted>, AppError> {
    state.metrics.track("feedback");
    state.metrics.feedback_total.inc();
    if body.new_predicate.is_none() && body.new_object.is_none() {
        return Err(AppError::bad_request(
            "correction must set new_predicate or new_object",
        ));
    }
    let request_id = state.feedback.submit(
        FeedbackOperation::Correct {
            src: body.src,
            edge_type: body.edge_type,
            dst: body.dst,
            new_predicate: body.new_predicate,
            new_object: body.new_object,
        },
        body.reason,
    );
    Ok(Json(FeedbackAccepted { request_id }))
}

pub async fn submit_unlink(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UnlinkRequestBody>,
) -> Result<Json<FeedbackAccepted>, AppError> {
    state.metrics.track("feedback");
    state.metrics.feedback_total.inc();
    let request_id = state.feedback.submit(
        FeedbackOperation::Unlink {
            mention_text: body.mention_text,
            doc_id: body.doc_id,
            concept_name: body.concept_name,
        },
        body.reason,
    );
    Ok(Json(FeedbackAccepted { request_id }))
}

pub async fn pending_feedback(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<FeedbackRequest>> {
    state.metrics.track("feedback");
    Json(state.feedback.pending())
}

pub async fn review_feedback(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ReviewRequestBody>,
) -> Result<axum::http::StatusCode, AppError> {
    state.metrics.track("feedback");
    state.feedback.review(&id, body.approve)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

// -- Quality ----------------------------------------------------------------

/// Quality metrics for one build version.
pub async fn build_metrics(
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
    Query(params): Query<BuildMetricsQuery>,
) -> Result<Json<BuildQualityReport>, AppError> {
    state.metrics.track("metrics");
    let report = state.quality().compute(&version, params.other)?;
    Ok(Json(report))
}

//! Request/response payloads for the REST API.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use evigraph_core::types::DocumentKind;
use evigraph_pipeline::ingest::StageCounts;
use evigraph_pipeline::query::QueryMode;

use crate::jobs::{JobEntry, JobState};

/// Ingest request: pre-parsed document text. Parsers (PDF, HTML, ...) live
/// outside the core; uploads arrive here already extracted.
#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestRequest {
    /// One of `plain_text`, `markdown`, `pdf`, `html`.
    pub kind: String,
    pub text: String,
}

impl IngestRequest {
    pub fn document_kind(&self) -> Option<DocumentKind> {
        match self.kind.as_str() {
            "plain_text" | "text" => Some(DocumentKind::PlainText),
            "markdown" => Some(DocumentKind::Markdown),
            "pdf" => Some(DocumentKind::Pdf),
            "html" => Some(DocumentKind::Html),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IngestAccepted {
    pub job_id: String,
    /// Content-derived document id; stable across re-uploads of the same
    /// text.
    pub doc_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobErrorBody {
    /// Error taxonomy kind (`input`, `llm_parse`, `store`, ...).
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobCountsBody {
    pub chunks: usize,
    pub skipped_chunks: usize,
    pub links: usize,
    pub nil_links: usize,
    pub review_links: usize,
    pub claims: usize,
    pub claim_relations: usize,
    pub themes: usize,
    pub concept_edges: usize,
}

impl From<&StageCounts> for JobCountsBody {
    fn from(c: &StageCounts) -> Self {
        Self {
            chunks: c.chunks,
            skipped_chunks: c.skipped_chunks,
            links: c.links,
            nil_links: c.nil_links,
            review_links: c.review_links,
            claims: c.claims,
            claim_relations: c.claim_relations,
            themes: c.themes,
            concept_edges: c.concept_edges,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct JobStatusResponse {
    pub job_id: String,
    #[schema(value_type = String)]
    pub state: JobState,
    pub stage: String,
    pub counts: JobCountsBody,
    pub review_queue_size: usize,
    pub doc_id: Option<String>,
    pub build_version: Option<String>,
    pub error: Option<JobErrorBody>,
}

impl JobStatusResponse {
    pub fn from_entry(job_id: String, entry: &JobEntry) -> Self {
        Self {
            job_id,
            state: entry.state,
            stage: entry.stage.to_string(),
            counts: JobCountsBody::from(&entry.counts),
            review_queue_size: entry.counts.review_queue,
            doc_id: entry.doc_id.clone(),
            build_version: entry.build_version.clone(),
            error: entry
                .error
                .as_ref()
                .map(|(kind, message)| JobErrorBody {
                    kind: kind.clone(),
                    message: message.clone(),
                }),
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default)]
    #[schema(value_type = String)]
    pub mode: QueryMode,
    #[serde(default)]
    pub top_k: Option<usize>,
}

// -- Feedback ---------------------------------------------------------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct MergeRequestBody {
    pub source_concept_id: String,
    pub target_concept_id: String,
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CorrectionRequestBody {
    pub src: String,
    pub edge_type: String,
    pub dst: String,
    #[serde(default)]
    pub new_predicate: Option<String>,
    #[serde(default)]
    pub new_object: Option<String>,
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UnlinkRequestBody {
    pub mention_text: String,
    pub doc_id: String,
    pub concept_name: String,
    pub reason: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReviewRequestBody {
    pub approve: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FeedbackAccepted {
    pub request_id: String,
}

// -- Health -----------------------------------------------------------------

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub llm_provider: String,
    pub embedding_provider: String,
    pub embedding_dim: usize,
    pub graph_nodes: usize,
    pub graph_edges: usize,
}

#[derive(Debug, Deserialize)]
pub struct BuildMetricsQuery {
    /// OTHER-predicate count observed during the build's governance pass.
    #[serde(default)]
    pub other: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_request_kind_parsing() {
        let request = IngestRequest {
            kind: "markdown".into(),
            text: "x".into(),
        };
        assert_eq!(request.document_kind(), Some(DocumentKind::Markdown));
        let bad = IngestRequest {
            kind: "docx".into(),
            text: "x".into(),
        };
        assert_eq!(bad.document_kind(), None);
    }

    #[test]
    fn query_request_defaults_to_hybrid() {
        let request: QueryRequest =
            serde_json::from_str(r#"{"question": "What is Transformer?"}"#).unwrap();
        assert_eq!(request.mode, QueryMode::Hybrid);
        assert!(request.top_k.is_none());
    }
}

//! Full-pipeline integration: ingest a bilingual document with aliases,
//! inline predicates and claims, then exercise retrieval, metrics and
//! rollback against the same store.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use evigraph_config::{EvigraphConfig, GovernanceConfig};
use evigraph_core::types::{DocumentKind, EdgeKind, NodeBody, NodeLabel, Predicate};
use evigraph_core::{AliasDictionary, GraphStore, MemoryGraph};
use evigraph_pipeline::chunker::ParsedDocument;
use evigraph_pipeline::ingest::IngestOrchestrator;
use evigraph_pipeline::quality::QualityService;
use evigraph_pipeline::query::{QueryMode, QueryService};
use evigraph_pipeline::{
    ChatRequest, ChatResponse, EmbeddingClient, LlmClient, PipelineContext, PipelineError,
    TokenUsage,
};

/// Prompt-family router: claims, theme summaries, NLI verdicts and anchored
/// answers, all deterministic.
struct RouterLlm;

#[async_trait]
impl LlmClient for RouterLlm {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let text = if prompt.contains("atomic claims") {
            if prompt.contains("Transformer") {
                r#"{
                    "claims": [
                        {"text": "Transformer is a neural-network architecture based on self-attention",
                         "claim_type": "fact", "modality": "assertive", "polarity": "positive",
                         "certainty": 0.95, "sentence_indices": [0],
                         "evidence_quote": "Transformer is a neural-network architecture based on self-attention"},
                        {"text": "Removing recurrence therefore enables parallel training",
                         "claim_type": "conclusion", "certainty": 0.85, "sentence_indices": [1]}
                    ],
                    "relations": [
                        {"source": 1, "target": 0, "relation_type": "SUPPORTS", "confidence": 0.8}
                    ]
                }"#
                .to_string()
            } else {
                r#"{"claims": [], "relations": []}"#.to_string()
            }
        } else if prompt.contains("topical community") {
            r#"{"label": "Neural architectures", "summary": "Designs built around attention."}"#
                .to_string()
        } else if prompt.contains("natural-language-inference") {
            r#"{"label": "entailment", "confidence": 0.8}"#.to_string()
        } else if prompt.contains("cite by anchor") {
            "Transformer is a self-attention architecture [E1].".to_string()
        } else {
            "{}".to_string()
        };
        Ok(ChatResponse {
            text,
            usage: TokenUsage::default(),
        })
    }
}

/// Hash embedder with a synonym table so alias pairs share a direction.
struct SeededEmbedder;

#[async_trait]
impl EmbeddingClient for SeededEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Ok(texts
            .iter()
            .map(|t| {
                let canonical = if t.contains("人工智能") || t == "AI" {
                    "人工智能"
                } else {
                    t.as_str()
                };
                let seed = canonical
                    .bytes()
                    .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
                let mut v: Vec<f32> = (0u32..12)
                    .map(|i| ((seed.wrapping_add(i.wrapping_mul(2_654_435_761))) as f32).sin())
                    .collect();
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
                v.iter_mut().for_each(|x| *x /= norm);
                v
            })
            .collect())
    }

    fn dim(&self) -> usize {
        12
    }
}

fn context(store: Arc<MemoryGraph>) -> PipelineContext {
    PipelineContext {
        config: Arc::new(EvigraphConfig::default()),
        governance: Arc::new(GovernanceConfig::default()),
        llm: Arc::new(RouterLlm),
        embedder: Arc::new(SeededEmbedder),
        store,
        aliases: AliasDictionary::new(),
        cancel: CancellationToken::new(),
    }
}

const DOC: &str = "Transformer is a neural-network architecture based on self-attention. \
    Removing recurrence therefore enables parallel training in practice. \
    Transformer 基于 Attention 机制，人工智能（AI）领域影响深远。 \
    AI 研究者广泛采用这种架构来处理自然语言与多模态任务。";

#[tokio::test]
async fn full_ingest_builds_an_anchored_graph() {
    let store = Arc::new(MemoryGraph::new());
    let ctx = context(store.clone());
    let report = IngestOrchestrator::new(ctx.clone())
        .ingest(ParsedDocument::from_text(DOC), DocumentKind::PlainText)
        .await
        .unwrap();

    assert!(report.counts.chunks >= 1);
    assert!(report.counts.links > 0);
    assert!(report.counts.claims >= 2);
    assert!(report.counts.claim_relations >= 1);

    // The alias dictionary learned the parenthesis alias for future builds.
    assert_eq!(
        ctx.aliases.snapshot().resolve("AI", Some(&report.doc_id)),
        Some("人工智能".to_string())
    );

    // Predicate closure: every concept-concept edge on disk is whitelisted
    // (the type system enforces it; check the wire names anyway).
    for edge in store.all_edges().unwrap() {
        if let EdgeKind::Concept(p) = edge.kind {
            assert!(Predicate::parse(p.as_str()).is_some());
        }
    }

    // The inline 基于 triple was governed into USES.
    let uses_edges: Vec<_> = store
        .all_edges()
        .unwrap()
        .into_iter()
        .filter(|e| matches!(e.kind, EdgeKind::Concept(Predicate::Uses)))
        .collect();
    assert!(
        !uses_edges.is_empty(),
        "expected a governed USES edge from the inline 基于 triple"
    );

    // Claim redirection invariant: every shell points at a live claim.
    for node in store.nodes_with_label(NodeLabel::Claim).unwrap() {
        if let NodeBody::Claim(claim) = node {
            if let Some(target) = &claim.canonical_id {
                match store.get_node(target).unwrap() {
                    Some(NodeBody::Claim(live)) => assert!(live.canonical_id.is_none()),
                    other => panic!("redirect target missing: {other:?}"),
                }
            }
        }
    }
}

#[tokio::test]
async fn hybrid_query_cites_the_ingested_evidence() {
    let store = Arc::new(MemoryGraph::new());
    let ctx = context(store.clone());
    IngestOrchestrator::new(ctx.clone())
        .ingest(ParsedDocument::from_text(DOC), DocumentKind::PlainText)
        .await
        .unwrap();

    let query = QueryService::new(ctx);
    let response = query
        .answer("What is Transformer?", QueryMode::Hybrid, 5)
        .await
        .unwrap();

    assert!(!response.evidence.is_empty());
    assert!(response
        .evidence
        .iter()
        .all(|e| !e.doc_id.is_empty() && !e.chunk_id.is_empty() && !e.sentence_ids.is_empty()));
    if let Some(answer) = &response.answer {
        assert!(answer.contains("[E1]"));
    }
    assert!(!response.reasoning_chain.is_empty());
}

#[tokio::test]
async fn rollback_returns_the_graph_to_its_prior_state() {
    let store = Arc::new(MemoryGraph::new());
    let ctx = context(store.clone());
    let orchestrator = IngestOrchestrator::new(ctx);

    // First document becomes the baseline.
    orchestrator
        .ingest(ParsedDocument::from_text(DOC), DocumentKind::PlainText)
        .await
        .unwrap();
    let baseline = store.counts().unwrap();

    // Second document shares no content.
    let report = orchestrator
        .ingest(
            ParsedDocument::from_text(
                "Databases persist structured records reliably. \
                 Indexes make lookups fast even at scale. \
                 Storage engines trade write amplification for read speed.",
            ),
            DocumentKind::PlainText,
        )
        .await
        .unwrap();
    assert_ne!(store.counts().unwrap(), baseline);

    let stats = store.delete_build_version(&report.build_version).unwrap();
    assert!(stats.nodes_removed > 0);

    let after = store.counts().unwrap();
    // Counts return to the snapshot, modulo concepts that other builds still
    // reference (none here) and orphans awaiting maintenance.
    assert_eq!(after.documents, baseline.documents);
    assert_eq!(after.chunks, baseline.chunks);
    assert_eq!(after.claims, baseline.claims);
    assert_eq!(after.themes, baseline.themes);
    assert_eq!(after.edges, baseline.edges);
    store.cleanup_orphan_concepts().unwrap();
    assert_eq!(store.counts().unwrap().concepts, baseline.concepts);
}

#[tokio::test]
async fn quality_metrics_cover_the_build() {
    let store = Arc::new(MemoryGraph::new());
    let ctx = context(store.clone());
    let report = IngestOrchestrator::new(ctx.clone())
        .ingest(ParsedDocument::from_text(DOC), DocumentKind::PlainText)
        .await
        .unwrap();

    let quality = QualityService::new(ctx);
    let metrics = quality
        .compute(&report.build_version, report.review_items.len())
        .unwrap();
    assert!(
        metrics.provenance_completeness > 0.99,
        "completeness was {}",
        metrics.provenance_completeness
    );
    assert!(metrics.avg_degree > 0.0);

    let precision = quality
        .claim_relation_precision(&report.build_version, 5)
        .await
        .unwrap();
    if let Some(p) = precision {
        assert!(p > 0.0);
    }
}

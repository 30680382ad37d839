//! Ingestion orchestrator: chains stages 0-6 for one document.
//!
//! Stages run strictly in sequence; chunk order is preserved throughout.
//! Per-chunk failures (an LLM hiccup, a parse failure past repair) are
//! absorbed into the diagnostics and the chunk degrades gracefully;
//! document-level failures trigger a compensating delete of the whole build
//! version, so readers never observe a half-committed document.
//!
//! The only suspension points are the embedding, LLM and store calls, and
//! every one of them polls the job's cancellation token.

use std::time::{Duration, Instant};

use tracing::{debug, info, info_span, warn};

use evigraph_core::ids;
use evigraph_core::types::{
    BuildVersion, DocId, Document, DocumentKind, DocumentStatus, MentionSpan, Provenance,
};
use evigraph_core::{AliasDictionary, AliasEntry, GraphStore};

use crate::chunker::{Chunker, ParsedDocument};
use crate::claims::{ClaimExtractor, ClaimRelation};
use crate::coref::{CorefMode, CorefOutcome, CorefResolver};
use crate::dedup::deduplicate;
use crate::error::PipelineError;
use crate::governor::{GovernorDecision, PredicateGovernor, ReviewItem};
use crate::graph_service::{ConceptUpsert, GraphService};
use crate::linker::{EntityLinker, LinkerOutput};
use crate::themes::ThemeBuilder;
use crate::PipelineContext;

/// Counters surfaced in job status.
#[derive(Debug, Clone, Default)]
pub struct StageCounts {
    pub chunks: usize,
    pub skipped_chunks: usize,
    pub links: usize,
    pub nil_links: usize,
    pub review_links: usize,
    pub claims: usize,
    pub claim_redirects: usize,
    pub claim_relations: usize,
    pub themes: usize,
    pub concept_edges: usize,
    pub review_queue: usize,
}

/// One absorbed per-chunk problem.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub stage: &'static str,
    pub chunk_id: Option<String>,
    pub kind: String,
    pub message: String,
}

/// Outcome of one document ingestion.
#[derive(Debug)]
pub struct IngestReport {
    pub doc_id: DocId,
    pub build_version: BuildVersion,
    pub counts: StageCounts,
    pub diagnostics: Vec<Diagnostic>,
    pub review_items: Vec<ReviewItem>,
}

/// Progress callback: `(stage_label, counts_so_far)`.
pub type ProgressSink = std::sync::Arc<dyn Fn(&'static str, &StageCounts) + Send + Sync>;

/// The stage 0-6 orchestrator.
pub struct IngestOrchestrator {
    ctx: PipelineContext,
    progress: Option<ProgressSink>,
}

impl IngestOrchestrator {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx, progress: None }
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    fn report(&self, stage: &'static str, counts: &StageCounts) {
        if let Some(sink) = &self.progress {
            sink(stage, counts);
        }
    }

    /// Ingest one parsed document under a fresh build version. On any
    /// document-level failure (including cancellation) the build version is
    /// purged before the error returns.
    pub async fn ingest(
        &self,
        parsed: ParsedDocument,
        kind: DocumentKind,
    ) -> Result<IngestReport, PipelineError> {
        let text = parsed.text.trim();
        if text.is_empty() {
            return Err(PipelineError::Input("document text is empty".into()));
        }
        let doc_id = ids::document_id(text);
        let build_version = format!(
            "{}_{}_{}",
            self.ctx.config.build.version_prefix,
            &doc_id[4..],
            chrono::Utc::now().timestamp_millis()
        );
        self.ingest_with_version(parsed, kind, build_version).await
    }

    /// Ingest under a caller-pinned build version. Re-running the same
    /// document with the same version and configuration leaves the graph
    /// unchanged.
    pub async fn ingest_with_version(
        &self,
        parsed: ParsedDocument,
        kind: DocumentKind,
        build_version: BuildVersion,
    ) -> Result<IngestReport, PipelineError> {
        let text = parsed.text.trim();
        if text.is_empty() {
            return Err(PipelineError::Input("document text is empty".into()));
        }
        let doc_id = ids::document_id(text);

        let span = info_span!("evigraph.ingest", doc_id = %doc_id, build = %build_version);
        let _guard = span.enter();
        let started = Instant::now();

        let service = GraphService::new(self.ctx.store.clone());
        match self
            .ingest_inner(&parsed, kind, &doc_id, &build_version, &service)
            .await
        {
            Ok(report) => {
                info!(
                    doc_id = %doc_id,
                    chunks = report.counts.chunks,
                    links = report.counts.links,
                    claims = report.counts.claims,
                    themes = report.counts.themes,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "ingestion complete"
                );
                Ok(report)
            }
            Err(e) => {
                // Compensating delete: the build either fully lands or fully
                // disappears.
                warn!(doc_id = %doc_id, error = %e, "ingestion failed, purging build version");
                if let Err(purge_err) = service.rollback(&build_version).await {
                    warn!(error = %purge_err, "compensating purge failed");
                }
                Err(e)
            }
        }
    }

    async fn ingest_inner(
        &self,
        parsed: &ParsedDocument,
        kind: DocumentKind,
        doc_id: &DocId,
        build_version: &BuildVersion,
        service: &GraphService,
    ) -> Result<IngestReport, PipelineError> {
        let thresholds = &self.ctx.governance.thresholds;
        let mut counts = StageCounts::default();
        let mut diagnostics: Vec<Diagnostic> = Vec::new();

        // The alias snapshot is fixed for the whole build; feedback landing
        // mid-run becomes visible on the next ingestion.
        let aliases = self.ctx.aliases.snapshot();

        // ── Stage 0: chunking ───────────────────────────────────────────
        let chunker = Chunker::from_thresholds(thresholds);
        let mut chunks = chunker.split(doc_id, parsed, build_version);
        counts.chunks = chunks.len();
        self.report("chunk", &counts);

        // Chunk embeddings, batched.
        if !chunks.is_empty() {
            let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
            let vectors = self.ctx.embed_batched(&texts).await?;
            for (chunk, vector) in chunks.iter_mut().zip(vectors) {
                chunk.embedding = Some(vector);
            }
        }

        // ── Stage 1: coreference ────────────────────────────────────────
        self.ctx.checkpoint()?;
        let resolver = CorefResolver::from_thresholds(thresholds);
        let mut corefs: Vec<CorefOutcome> = Vec::with_capacity(chunks.len());
        let mut new_aliases: Vec<AliasEntry> = Vec::new();
        for chunk in chunks.iter_mut() {
            let outcome = resolver.resolve(chunk);
            if outcome.mode == CorefMode::Rewrite {
                chunk.resolved_text = Some(outcome.resolved_text.clone());
            }
            for m in &outcome.matches {
                if m.confidence >= 0.9 {
                    // Parenthesis aliases become document-local dictionary
                    // rows for future builds.
                    new_aliases.push(AliasEntry {
                        surface_form: m.mention.clone(),
                        canonical: m.antecedent.clone(),
                        doc_id: Some(doc_id.clone()),
                        confidence: m.confidence,
                        negative: false,
                        created_at: chrono::Utc::now(),
                    });
                }
            }
            corefs.push(outcome);
        }
        self.report("coref", &counts);

        // ── Stage 2: entity linking ─────────────────────────────────────
        let linker = EntityLinker::new(&self.ctx, aliases.clone());
        let mut link_outputs: Vec<LinkerOutput> = Vec::with_capacity(chunks.len());
        for (chunk, coref) in chunks.iter().zip(&corefs) {
            match linker.link_chunk(chunk, coref).await {
                Ok(output) => {
                    counts.links += output.links.len();
                    counts.nil_links += output.links.iter().filter(|l| l.is_nil).count();
                    counts.review_links += output.links.iter().filter(|l| l.is_review).count();
                    link_outputs.push(output);
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    counts.skipped_chunks += 1;
                    diagnostics.push(Diagnostic {
                        stage: "link",
                        chunk_id: Some(chunk.id.clone()),
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                    link_outputs.push(LinkerOutput::default());
                }
            }
        }
        self.report("link", &counts);

        // ── Stage 3: claims ─────────────────────────────────────────────
        let extractor = ClaimExtractor::new(&self.ctx);
        let stage_deadline =
            Instant::now() + Duration::from_secs(self.ctx.config.llm.stage_budget_secs.max(1));
        let mut all_claims = Vec::new();
        let mut all_relations: Vec<ClaimRelation> = Vec::new();
        for chunk in &chunks {
            if Instant::now() >= stage_deadline {
                counts.skipped_chunks += 1;
                diagnostics.push(Diagnostic {
                    stage: "claims",
                    chunk_id: Some(chunk.id.clone()),
                    kind: "timeout".into(),
                    message: "claim-extraction stage budget exceeded".into(),
                });
                continue;
            }
            match extractor.extract(chunk).await {
                Ok(extraction) => {
                    for _ in 0..extraction.dropped_windows {
                        diagnostics.push(Diagnostic {
                            stage: "claims",
                            chunk_id: Some(chunk.id.clone()),
                            kind: "llm_parse".into(),
                            message: "window dropped after repair retry".into(),
                        });
                    }
                    all_claims.extend(extraction.claims);
                    all_relations.extend(extraction.relations);
                }
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => {
                    counts.skipped_chunks += 1;
                    diagnostics.push(Diagnostic {
                        stage: "claims",
                        chunk_id: Some(chunk.id.clone()),
                        kind: e.kind().to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }

        // Claim embeddings, then document-wide dedup (hash + soft cluster).
        if !all_claims.is_empty() {
            let texts: Vec<String> = all_claims.iter().map(|c| c.text.clone()).collect();
            match self.ctx.embed_batched(&texts).await {
                Ok(vectors) => {
                    for (claim, vector) in all_claims.iter_mut().zip(vectors) {
                        claim.embedding = Some(vector);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "claim embedding failed; soft clustering skipped");
                }
            }
        }
        let dedup = deduplicate(all_claims, Some(thresholds.claim_soft_cluster_threshold));
        let redirect_of: std::collections::HashMap<String, String> = dedup
            .redirects
            .iter()
            .filter_map(|r| r.canonical_id.clone().map(|c| (r.id.clone(), c)))
            .collect();
        let mut relations: Vec<ClaimRelation> = Vec::new();
        for mut relation in all_relations {
            if let Some(live) = redirect_of.get(&relation.source_id) {
                relation.source_id = live.clone();
            }
            if let Some(live) = redirect_of.get(&relation.target_id) {
                relation.target_id = live.clone();
            }
            if relation.source_id == relation.target_id {
                continue;
            }
            if !relations.iter().any(|r| {
                r.source_id == relation.source_id
                    && r.target_id == relation.target_id
                    && r.kind == relation.kind
            }) {
                relations.push(relation);
            }
        }
        counts.claims = dedup.canonical.len();
        counts.claim_redirects = dedup.redirects.len();
        counts.claim_relations = relations.len();
        self.report("claims", &counts);

        // ── Stage 6 (part one): persist in dependency order ─────────────
        self.ctx.checkpoint()?;
        let document = Document {
            id: doc_id.clone(),
            checksum: ids::content_checksum(parsed.text.trim()),
            kind,
            size: parsed.text.len(),
            status: DocumentStatus::Ingesting,
            created_at: chrono::Utc::now(),
            build_version: build_version.clone(),
        };
        service.upsert_document(document).await?;
        for chunk in &chunks {
            service.upsert_chunk(chunk.clone()).await?;
        }

        // Concepts and MENTIONS with four-level evidence.
        for (chunk, output) in chunks.iter().zip(&link_outputs) {
            for link in &output.links {
                self.ctx.checkpoint()?;
                let request = ConceptUpsert {
                    name: link.concept_name.clone(),
                    description: None,
                    category: link.node_type.clone(),
                    domain: None,
                    embedding: None,
                    source: if link.is_nil {
                        evigraph_core::ConceptSource::NilProposal
                    } else {
                        evigraph_core::ConceptSource::Linked
                    },
                    confidence: link.confidence,
                    build_version: build_version.clone(),
                };
                let (concept_id, _created) = service
                    .upsert_concept(request, &aliases, Some(doc_id))
                    .await?;

                let sentence_id = link
                    .evidence
                    .sentence_id
                    .clone()
                    .unwrap_or_else(|| chunk.sentence_ids.first().cloned().unwrap_or_default());
                service
                    .attach_mention(
                        &chunk.id,
                        &concept_id,
                        MentionSpan {
                            sentence_id: sentence_id.clone(),
                            start: link.evidence.start,
                            end: link.evidence.end,
                        },
                        link.confidence,
                        link.is_review,
                        build_version,
                    )
                    .await?;
                service
                    .attach_evidence(
                        &concept_id,
                        Provenance {
                            doc_id: doc_id.clone(),
                            chunk_id: chunk.id.clone(),
                            section_path: chunk.section_path.clone(),
                            sentence_ids: vec![sentence_id],
                        },
                        build_version,
                    )
                    .await?;
            }
        }

        // Claims, their redirects, then inter-claim relations.
        let chunk_by_id = |id: &str| chunks.iter().find(|c| c.id == id);
        for claim in &dedup.canonical {
            let provenance = Provenance {
                doc_id: doc_id.clone(),
                chunk_id: claim.chunk_id.clone(),
                section_path: claim.section_path.clone(),
                sentence_ids: claim.sentence_ids.clone(),
            };
            service.upsert_claim(claim.clone(), provenance).await?;
        }
        for shell in &dedup.redirects {
            // Shells still resolve to a chunk for provenance completeness.
            if chunk_by_id(&shell.chunk_id).is_some() {
                service.upsert_claim_redirect(shell.clone()).await?;
                service
                    .attach_evidence(
                        &shell.id,
                        Provenance {
                            doc_id: doc_id.clone(),
                            chunk_id: shell.chunk_id.clone(),
                            section_path: shell.section_path.clone(),
                            sentence_ids: shell.sentence_ids.clone(),
                        },
                        build_version,
                    )
                    .await?;
            }
        }
        for relation in &relations {
            service.link_claims(relation, build_version).await?;
        }
        self.report("persist", &counts);

        // ── Stage 4: themes (reads the just-persisted subgraph) ─────────
        self.ctx.checkpoint()?;
        let themes = ThemeBuilder::new(&self.ctx)
            .build(Some(doc_id), build_version)
            .await?;
        for built in &themes {
            service.upsert_theme(built).await?;
        }
        counts.themes = themes.len();
        self.report("themes", &counts);

        // ── Stage 5: predicate governance over the queued triples ───────
        let mut governor = PredicateGovernor::new(thresholds.governor_synonym_threshold);
        governor.prime(self.ctx.embedder.as_ref()).await?;
        for output in &link_outputs {
            for triple in &output.triples {
                self.ctx.checkpoint()?;
                let subject = self
                    .ctx
                    .store
                    .concept_by_name(&triple.subject)
                    .map_err(PipelineError::store)?;
                let object = self
                    .ctx
                    .store
                    .concept_by_name(&triple.object)
                    .map_err(PipelineError::store)?;
                let (Some(subject), Some(object)) = (subject, object) else {
                    continue;
                };
                let subject_type = subject.category.clone().unwrap_or_else(|| "Concept".into());
                let object_type = object.category.clone().unwrap_or_else(|| "Concept".into());

                match governor
                    .normalize(&self.ctx, triple, &subject_type, &object_type)
                    .await?
                {
                    GovernorDecision::Accepted(predicate) => {
                        service
                            .upsert_concept_edge(
                                &subject.id,
                                predicate,
                                &object.id,
                                triple.confidence,
                                build_version,
                            )
                            .await?;
                        counts.concept_edges += 1;
                    }
                    GovernorDecision::Other { surface } => {
                        debug!(surface = %surface, "triple parked as OTHER for review");
                    }
                    GovernorDecision::Rejected { reason, .. } => {
                        diagnostics.push(Diagnostic {
                            stage: "governance",
                            chunk_id: None,
                            kind: "ontology".into(),
                            message: reason,
                        });
                    }
                }
            }
        }
        let review_items = governor.take_review_queue();
        counts.review_queue = review_items.len();
        self.report("governance", &counts);

        // Finalize: document becomes visible as Ready, aliases publish for
        // the next build.
        service
            .set_document_status(doc_id, DocumentStatus::Ready)
            .await?;
        self.ctx.aliases.publish(new_aliases);
        self.report("done", &counts);

        Ok(IngestReport {
            doc_id: doc_id.clone(),
            build_version: build_version.clone(),
            counts,
            diagnostics,
            review_items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ChatRequest, ChatResponse, EmbeddingClient, LlmClient, PipelineError, TokenUsage,
    };
    use async_trait::async_trait;
    use evigraph_config::{EvigraphConfig, GovernanceConfig};
    use evigraph_core::{GraphStore, MemoryGraph, NodeLabel};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    /// LLM that answers claim-extraction prompts with one claim and
    /// everything else with a bland JSON object.
    struct StubLlm;

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
            let prompt = request
                .messages
                .last()
                .map(|m| m.content.as_str())
                .unwrap_or_default();
            let text = if prompt.contains("atomic claims") {
                r#"{"claims": [{"text": "Evigraph ingests documents into a property graph",
                    "claim_type": "fact", "certainty": 0.9, "sentence_indices": [0]}],
                    "relations": []}"#
                    .to_string()
            } else if prompt.contains("topical community") {
                r#"{"label": "Graph ingestion", "summary": "How documents become graphs."}"#
                    .to_string()
            } else {
                r#"{"label": "neutral", "confidence": 0.5}"#.to_string()
            };
            Ok(ChatResponse {
                text,
                usage: TokenUsage::default(),
            })
        }
    }

    struct HashEmbedder;

    #[async_trait]
    impl EmbeddingClient for HashEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let seed = t
                        .bytes()
                        .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
                    let mut v: Vec<f32> = (0u32..8)
                        .map(|i| ((seed.wrapping_add(i.wrapping_mul(2654435761))) as f32).sin())
                        .collect();
                    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                    v.iter_mut().for_each(|x| *x /= norm.max(1e-6));
                    v
                })
                .collect())
        }
        fn dim(&self) -> usize {
            8
        }
    }

    fn ctx(store: Arc<MemoryGraph>) -> PipelineContext {
        PipelineContext {
            config: Arc::new(EvigraphConfig::default()),
            governance: Arc::new(GovernanceConfig::default()),
            llm: Arc::new(StubLlm),
            embedder: Arc::new(HashEmbedder),
            store,
            aliases: evigraph_core::AliasDictionary::new(),
            cancel: CancellationToken::new(),
        }
    }

    const DOC: &str = "Evigraph ingests documents into a property graph. \
        The pipeline links entities and extracts claims from every chunk. \
        Claims carry provenance down to the sentence level always.";

    #[tokio::test]
    async fn empty_document_is_rejected_before_stage_zero() {
        let ctx = ctx(Arc::new(MemoryGraph::new()));
        let orchestrator = IngestOrchestrator::new(ctx);
        let err = orchestrator
            .ingest(ParsedDocument::from_text("   "), DocumentKind::PlainText)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "input");
    }

    #[tokio::test]
    async fn ingest_produces_document_chunks_and_claims() {
        let store = Arc::new(MemoryGraph::new());
        let orchestrator = IngestOrchestrator::new(ctx(store.clone()));
        let report = orchestrator
            .ingest(ParsedDocument::from_text(DOC), DocumentKind::PlainText)
            .await
            .unwrap();

        assert!(report.counts.chunks >= 1);
        assert!(report.counts.claims >= 1);
        let counts = store.counts().unwrap();
        assert_eq!(counts.documents, 1);
        assert!(counts.chunks >= 1);
        assert!(counts.claims >= 1);

        // Document landed as Ready.
        if let Some(evigraph_core::NodeBody::Document(doc)) =
            store.get_node(&report.doc_id).unwrap()
        {
            assert_eq!(doc.status, DocumentStatus::Ready);
        } else {
            panic!("document missing");
        }
    }

    #[tokio::test]
    async fn ingest_is_idempotent_for_pinned_build_version() {
        let store = Arc::new(MemoryGraph::new());
        let orchestrator = IngestOrchestrator::new(ctx(store.clone()));
        let version = "build_test_v1".to_string();
        orchestrator
            .ingest_with_version(
                ParsedDocument::from_text(DOC),
                DocumentKind::PlainText,
                version.clone(),
            )
            .await
            .unwrap();
        let after_first = store.counts().unwrap();

        orchestrator
            .ingest_with_version(
                ParsedDocument::from_text(DOC),
                DocumentKind::PlainText,
                version,
            )
            .await
            .unwrap();
        let after_second = store.counts().unwrap();

        // Same document, configuration and build version: the graph is
        // byte-for-byte the same size, edges included.
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn re_ingesting_same_content_does_not_duplicate_identity_keyed_nodes() {
        let store = Arc::new(MemoryGraph::new());
        let orchestrator = IngestOrchestrator::new(ctx(store.clone()));
        orchestrator
            .ingest(ParsedDocument::from_text(DOC), DocumentKind::PlainText)
            .await
            .unwrap();
        let after_first = store.counts().unwrap();

        orchestrator
            .ingest(ParsedDocument::from_text(DOC), DocumentKind::PlainText)
            .await
            .unwrap();
        let after_second = store.counts().unwrap();

        // A new build version re-chunks, but documents, concepts and claims
        // key on stable identity and never duplicate.
        assert_eq!(after_first.documents, after_second.documents);
        assert_eq!(after_first.concepts, after_second.concepts);
        assert_eq!(after_first.claims, after_second.claims);
    }

    #[tokio::test]
    async fn cancellation_purges_partial_build() {
        let store = Arc::new(MemoryGraph::new());
        let context = ctx(store.clone());
        context.cancel.cancel();
        let orchestrator = IngestOrchestrator::new(context);
        let err = orchestrator
            .ingest(ParsedDocument::from_text(DOC), DocumentKind::PlainText)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        // Nothing from the cancelled build survived.
        let counts = store.counts().unwrap();
        assert_eq!(counts.documents, 0);
        assert_eq!(counts.chunks, 0);
    }

    #[tokio::test]
    async fn provenance_completeness_for_concepts_and_claims() {
        let store = Arc::new(MemoryGraph::new());
        let orchestrator = IngestOrchestrator::new(ctx(store.clone()));
        let report = orchestrator
            .ingest(ParsedDocument::from_text(DOC), DocumentKind::PlainText)
            .await
            .unwrap();

        for label in [NodeLabel::Concept, NodeLabel::Claim] {
            for node in store.nodes_with_label(label).unwrap() {
                if node.build_version() != report.build_version {
                    continue;
                }
                let has_evidence = store
                    .edges_from(node.id())
                    .unwrap()
                    .into_iter()
                    .any(|e| {
                        e.kind == evigraph_core::EdgeKind::EvidenceFrom
                            && e.provenance
                                .as_ref()
                                .map(|p| p.doc_id == report.doc_id && !p.sentence_ids.is_empty())
                                .unwrap_or(false)
                    });
                assert!(
                    has_evidence,
                    "node {} lacks resolvable EVIDENCE_FROM",
                    node.id()
                );
            }
        }
    }

    #[tokio::test]
    async fn progress_sink_sees_the_stage_ladder() {
        let store = Arc::new(MemoryGraph::new());
        let seen: Arc<std::sync::Mutex<Vec<&'static str>>> =
            Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let orchestrator = IngestOrchestrator::new(ctx(store)).with_progress(Arc::new(
            move |stage, _| {
                seen_clone.lock().unwrap().push(stage);
            },
        ));
        orchestrator
            .ingest(ParsedDocument::from_text(DOC), DocumentKind::PlainText)
            .await
            .unwrap();
        let stages = seen.lock().unwrap().clone();
        assert_eq!(stages.first(), Some(&"chunk"));
        assert_eq!(stages.last(), Some(&"done"));
        assert!(stages.contains(&"persist"));
        assert!(stages.contains(&"themes"));
    }
}

//! Stage 6: the single writer.
//!
//! Every mutation of the graph goes through this service. It enforces the
//! upsert discipline (concepts by unique name after alias canonicalization,
//! chunks and documents by id, claims by `(doc_id, normalized_text_hash)`,
//! edges by identity), stamps `build_version` on every write, retries
//! transient store errors with exponential backoff, and exposes the
//! delete-by-version rollback.
//!
//! Concurrent documents racing on the same concept are arbitrated by the
//! store's uniqueness constraint: a lost race is resolved by re-reading the
//! winner.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use evigraph_core::ids;
use evigraph_core::store::PurgeStats;
use evigraph_core::types::{
    BuildVersion, Chunk, Claim, ClaimId, Concept, ConceptId, ConceptSource, Document,
    DocumentStatus, Edge, EdgeKind, GraphCounts, MentionSpan, NodeBody, Predicate, Provenance,
};
use evigraph_core::{AliasSnapshot, GraphStore};

use crate::claims::ClaimRelation;
use crate::error::PipelineError;
use crate::themes::BuiltTheme;

/// Request to upsert (or NIL-create) a concept.
#[derive(Debug, Clone)]
pub struct ConceptUpsert {
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub domain: Option<String>,
    pub embedding: Option<Vec<f32>>,
    pub source: ConceptSource,
    pub confidence: f32,
    pub build_version: BuildVersion,
}

/// Stage 6 writer.
pub struct GraphService {
    store: Arc<dyn GraphStore>,
    max_retries: u32,
    base_backoff: Duration,
}

impl GraphService {
    pub fn new(store: Arc<dyn GraphStore>) -> Self {
        Self {
            store,
            max_retries: 3,
            base_backoff: Duration::from_millis(50),
        }
    }

    #[cfg(test)]
    fn with_backoff(store: Arc<dyn GraphStore>, max_retries: u32, base_backoff: Duration) -> Self {
        Self {
            store,
            max_retries,
            base_backoff,
        }
    }

    /// Run a store operation with exponential backoff. Constraint violations
    /// are not transient and surface immediately.
    async fn with_retry<T>(
        &self,
        what: &str,
        op: impl Fn() -> anyhow::Result<T>,
    ) -> Result<T, PipelineError> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.to_string().contains("uniqueness constraint") => {
                    return Err(PipelineError::store(e));
                }
                Err(e) if attempt < self.max_retries => {
                    let delay = self.base_backoff * 2u32.pow(attempt);
                    warn!(what, attempt, error = %e, "store error, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(PipelineError::Store(format!(
                        "{what} failed after {attempt} retries: {e}"
                    )));
                }
            }
        }
    }

    pub async fn upsert_document(&self, document: Document) -> Result<(), PipelineError> {
        self.with_retry("upsert document", || {
            self.store.upsert_node(NodeBody::Document(document.clone()))
        })
        .await
    }

    pub async fn set_document_status(
        &self,
        doc_id: &str,
        status: DocumentStatus,
    ) -> Result<(), PipelineError> {
        let node = self
            .with_retry("read document", || self.store.get_node(doc_id))
            .await?;
        if let Some(NodeBody::Document(mut document)) = node {
            document.status = status;
            self.with_retry("update document status", || {
                self.store.upsert_node(NodeBody::Document(document.clone()))
            })
            .await?;
        }
        Ok(())
    }

    pub async fn upsert_chunk(&self, chunk: Chunk) -> Result<(), PipelineError> {
        let doc_id = chunk.doc_id.clone();
        let chunk_id = chunk.id.clone();
        let build_version = chunk.build_version.clone();
        self.with_retry("upsert chunk", || {
            self.store.upsert_node(NodeBody::Chunk(chunk.clone()))
        })
        .await?;
        self.upsert_edge(Edge {
            src: doc_id,
            kind: EdgeKind::Contains,
            dst: chunk_id,
            confidence: 1.0,
            review: false,
            mention: None,
            provenance: None,
            build_version,
        })
        .await
    }

    /// Upsert a concept by unique name.
    ///
    /// The name is canonicalized through the alias snapshot first. A NIL
    /// proposal only creates a node when no alias, exact or fuzzy match
    /// exists; otherwise the existing concept accretes the new description
    /// and embedding. Returns `(id, created)`.
    pub async fn upsert_concept(
        &self,
        request: ConceptUpsert,
        aliases: &AliasSnapshot,
        doc_id: Option<&str>,
    ) -> Result<(ConceptId, bool), PipelineError> {
        let canonical = aliases
            .resolve(&request.name, doc_id)
            .unwrap_or_else(|| request.name.trim().to_string());

        // Exact (case-insensitive) name match.
        if let Some(existing) = self
            .with_retry("concept lookup", || self.store.concept_by_name(&canonical))
            .await?
        {
            let id = existing.id.clone();
            self.accrete(existing, &request).await?;
            return Ok((id, false));
        }

        // Fuzzy match: normalized-name equality over the lexical candidates.
        let normalized = ids::normalize_claim_text(&canonical);
        let candidates = self
            .with_retry("concept fuzzy lookup", || {
                self.store.concepts_matching(&canonical, 5)
            })
            .await?;
        if let Some(matched) = candidates
            .into_iter()
            .find(|c| ids::normalize_claim_text(&c.name) == normalized)
        {
            let id = matched.id.clone();
            self.accrete(matched, &request).await?;
            return Ok((id, false));
        }

        // Create. Losing a race on the uniqueness constraint means another
        // writer created the concept between lookup and insert: re-read.
        let now = chrono::Utc::now();
        let concept = Concept {
            id: ids::concept_id(&canonical),
            name: canonical.clone(),
            description: request.description.clone(),
            domain: request.domain.clone(),
            category: request.category.clone(),
            importance: request.confidence.clamp(0.0, 1.0),
            tags: Vec::new(),
            embedding: request.embedding.clone(),
            source: request.source,
            redirect_to: None,
            created_at: now,
            updated_at: now,
            build_version: request.build_version.clone(),
        };
        match self
            .with_retry("create concept", || {
                self.store.upsert_node(NodeBody::Concept(concept.clone()))
            })
            .await
        {
            Ok(()) => Ok((concept.id, true)),
            Err(PipelineError::Store(msg)) if msg.contains("uniqueness constraint") => {
                let winner = self
                    .with_retry("re-read concept after race", || {
                        self.store.concept_by_name(&canonical)
                    })
                    .await?
                    .ok_or_else(|| PipelineError::Store(msg))?;
                debug!(name = %canonical, winner = %winner.id, "lost concept race, reusing winner");
                Ok((winner.id, false))
            }
            Err(e) => Err(e),
        }
    }

    /// Accrete description/embedding onto an existing concept without
    /// touching its identity or build version.
    async fn accrete(&self, mut existing: Concept, request: &ConceptUpsert) -> Result<(), PipelineError> {
        let mut changed = false;
        if existing.description.is_none() && request.description.is_some() {
            existing.description = request.description.clone();
            changed = true;
        }
        if existing.embedding.is_none() && request.embedding.is_some() {
            existing.embedding = request.embedding.clone();
            changed = true;
        }
        if existing.category.is_none() && request.category.is_some() {
            existing.category = request.category.clone();
            changed = true;
        }
        if changed {
            existing.updated_at = chrono::Utc::now();
            self.with_retry("accrete concept", || {
                self.store.upsert_node(NodeBody::Concept(existing.clone()))
            })
            .await?;
        }
        Ok(())
    }

    /// `MENTIONS` edge from a chunk (or document) to a concept, with span
    /// evidence. Identical spans collapse into one edge.
    pub async fn attach_mention(
        &self,
        src: &str,
        concept_id: &ConceptId,
        mention: MentionSpan,
        confidence: f32,
        review: bool,
        build_version: &BuildVersion,
    ) -> Result<(), PipelineError> {
        self.upsert_edge(Edge {
            src: src.to_string(),
            kind: EdgeKind::Mentions,
            dst: concept_id.clone(),
            confidence,
            review,
            mention: Some(mention),
            provenance: None,
            build_version: build_version.clone(),
        })
        .await
    }

    /// `EVIDENCE_FROM` edge carrying the four-level locator.
    pub async fn attach_evidence(
        &self,
        node_id: &str,
        provenance: Provenance,
        build_version: &BuildVersion,
    ) -> Result<(), PipelineError> {
        let chunk_id = provenance.chunk_id.clone();
        self.upsert_edge(Edge {
            src: node_id.to_string(),
            kind: EdgeKind::EvidenceFrom,
            dst: chunk_id,
            confidence: 1.0,
            review: false,
            mention: None,
            provenance: Some(provenance),
            build_version: build_version.clone(),
        })
        .await
    }

    /// Upsert a claim by `(doc_id, normalized_text_hash)`.
    ///
    /// An already-present claim unions the incoming sentence ids and gains
    /// this chunk's `EVIDENCE_FROM`. Returns the id of the live claim.
    pub async fn upsert_claim(
        &self,
        claim: Claim,
        provenance: Provenance,
    ) -> Result<ClaimId, PipelineError> {
        // Evidence contributed by this run is stamped with this run's
        // version, even when it lands on a claim from an earlier build.
        let evidence_version = claim.build_version.clone();
        let existing = self
            .with_retry("claim lookup", || {
                self.store
                    .claim_by_hash(&claim.doc_id, &claim.normalized_text_hash)
            })
            .await?;

        let live_id = match existing {
            Some(prior) => {
                // Follow the redirect (length ≤ 1 by invariant) and union
                // the incoming sentence ids into the live claim.
                let target_id = prior.canonical_id.clone().unwrap_or_else(|| prior.id.clone());
                let live = self
                    .with_retry("read live claim", || self.store.get_node(&target_id))
                    .await?;
                if let Some(NodeBody::Claim(mut live)) = live {
                    let mut changed = false;
                    for sid in &claim.sentence_ids {
                        if !live.sentence_ids.contains(sid) {
                            live.sentence_ids.push(sid.clone());
                            changed = true;
                        }
                    }
                    if changed {
                        self.with_retry("union claim evidence", || {
                            self.store.upsert_node(NodeBody::Claim(live.clone()))
                        })
                        .await?;
                    }
                }
                target_id
            }
            None => {
                let build_version = claim.build_version.clone();
                let chunk_id = claim.chunk_id.clone();
                let id = claim.id.clone();
                self.with_retry("upsert claim", || {
                    self.store.upsert_node(NodeBody::Claim(claim.clone()))
                })
                .await?;
                self.upsert_edge(Edge {
                    src: chunk_id,
                    kind: EdgeKind::ContainsClaim,
                    dst: id.clone(),
                    confidence: 1.0,
                    review: false,
                    mention: None,
                    provenance: None,
                    build_version,
                })
                .await?;
                id
            }
        };

        self.attach_evidence(&live_id, provenance, &evidence_version)
            .await?;
        Ok(live_id)
    }

    /// Persist a redirect shell (a deduplicated claim pointing at its
    /// canonical).
    pub async fn upsert_claim_redirect(&self, shell: Claim) -> Result<(), PipelineError> {
        debug_assert!(shell.canonical_id.is_some());
        self.with_retry("upsert claim redirect", || {
            self.store.upsert_node(NodeBody::Claim(shell.clone()))
        })
        .await
    }

    /// Inter-claim relation edge.
    pub async fn link_claims(
        &self,
        relation: &ClaimRelation,
        build_version: &BuildVersion,
    ) -> Result<(), PipelineError> {
        self.upsert_edge(Edge {
            src: relation.source_id.clone(),
            kind: EdgeKind::Claim(relation.kind),
            dst: relation.target_id.clone(),
            confidence: relation.confidence,
            review: false,
            mention: None,
            provenance: None,
            build_version: build_version.clone(),
        })
        .await
    }

    /// Theme node plus its membership edges.
    pub async fn upsert_theme(&self, built: &BuiltTheme) -> Result<(), PipelineError> {
        self.with_retry("upsert theme", || {
            self.store.upsert_node(NodeBody::Theme(built.theme.clone()))
        })
        .await?;
        for edge in &built.member_edges {
            self.upsert_edge(edge.clone()).await?;
        }
        Ok(())
    }

    /// Governed concept-concept predicate edge.
    pub async fn upsert_concept_edge(
        &self,
        src: &ConceptId,
        predicate: Predicate,
        dst: &ConceptId,
        confidence: f32,
        build_version: &BuildVersion,
    ) -> Result<(), PipelineError> {
        self.upsert_edge(Edge {
            src: src.clone(),
            kind: EdgeKind::Concept(predicate),
            dst: dst.clone(),
            confidence,
            review: false,
            mention: None,
            provenance: None,
            build_version: build_version.clone(),
        })
        .await
    }

    async fn upsert_edge(&self, edge: Edge) -> Result<(), PipelineError> {
        self.with_retry("upsert edge", || self.store.upsert_edge(edge.clone()))
            .await
    }

    /// Compensating delete: purge everything stamped with a build version.
    pub async fn rollback(&self, build_version: &BuildVersion) -> Result<PurgeStats, PipelineError> {
        self.with_retry("rollback build", || {
            self.store.delete_build_version(build_version)
        })
        .await
    }

    pub fn counts(&self) -> Result<GraphCounts, PipelineError> {
        self.store.counts().map_err(PipelineError::store)
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evigraph_core::types::DocumentKind;
    use evigraph_core::{AliasDictionary, MemoryGraph};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> GraphService {
        GraphService::with_backoff(
            Arc::new(MemoryGraph::new()),
            2,
            Duration::from_millis(1),
        )
    }

    fn concept_request(name: &str) -> ConceptUpsert {
        ConceptUpsert {
            name: name.into(),
            description: Some("a description".into()),
            category: Some("Method".into()),
            domain: None,
            embedding: Some(vec![0.1, 0.2]),
            source: ConceptSource::Linked,
            confidence: 0.9,
            build_version: "v1".into(),
        }
    }

    fn claim(text: &str, chunk_id: &str) -> Claim {
        let hash = ids::claim_text_hash(text);
        Claim {
            id: ids::claim_id("doc_1", &hash),
            text: text.into(),
            normalized_text_hash: hash,
            canonical_id: None,
            doc_id: "doc_1".into(),
            chunk_id: chunk_id.into(),
            sentence_ids: vec![format!("doc_1:s0")],
            section_path: vec![],
            claim_type: evigraph_core::ClaimType::Fact,
            modality: evigraph_core::Modality::Assertive,
            polarity: evigraph_core::Polarity::Positive,
            certainty: 0.9,
            confidence: 0.9,
            evidence_span: None,
            embedding: None,
            build_version: "v1".into(),
        }
    }

    fn provenance(chunk_id: &str, sentence: &str) -> Provenance {
        Provenance {
            doc_id: "doc_1".into(),
            chunk_id: chunk_id.into(),
            section_path: vec![],
            sentence_ids: vec![sentence.into()],
        }
    }

    async fn seed_chunk(service: &GraphService, chunk_id: &str) {
        let document = Document {
            id: "doc_1".into(),
            checksum: "x".into(),
            kind: DocumentKind::PlainText,
            size: 1,
            status: DocumentStatus::Ingesting,
            created_at: chrono::Utc::now(),
            build_version: "v1".into(),
        };
        service.upsert_document(document).await.unwrap();
        let chunk = Chunk {
            id: chunk_id.into(),
            doc_id: "doc_1".into(),
            chunk_index: 0,
            text: "some text".into(),
            resolved_text: None,
            section_path: vec![],
            page_num: None,
            sentence_ids: vec!["doc_1:s0".into()],
            window_start: 0,
            window_end: 0,
            embedding: None,
            build_version: "v1".into(),
        };
        service.upsert_chunk(chunk).await.unwrap();
    }

    #[tokio::test]
    async fn idempotent_concept_upsert_scenario() {
        let service = service();
        seed_chunk(&service, "chunk_1").await;
        let aliases = AliasDictionary::new().snapshot();

        let (id1, created1) = service
            .upsert_concept(concept_request("Transformer"), &aliases, None)
            .await
            .unwrap();
        let (id2, created2) = service
            .upsert_concept(concept_request("Transformer"), &aliases, None)
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert!(created1);
        assert!(!created2);

        let span = MentionSpan {
            sentence_id: "doc_1:s0".into(),
            start: 0,
            end: 11,
        };
        service
            .attach_mention("chunk_1", &id1, span.clone(), 0.9, false, &"v1".to_string())
            .await
            .unwrap();
        service
            .attach_mention("chunk_1", &id1, span, 0.9, false, &"v1".to_string())
            .await
            .unwrap();

        let counts = service.counts().unwrap();
        assert_eq!(counts.concepts, 1);
        // doc CONTAINS chunk + one MENTIONS edge.
        assert_eq!(counts.edges, 2);
    }

    #[tokio::test]
    async fn concept_upsert_canonicalizes_via_alias() {
        let service = service();
        let dictionary = AliasDictionary::new();
        dictionary.publish(vec![evigraph_core::alias::alias("AI", "人工智能", 0.9)]);
        let aliases = dictionary.snapshot();

        let (id1, _) = service
            .upsert_concept(concept_request("人工智能"), &aliases, None)
            .await
            .unwrap();
        let (id2, created) = service
            .upsert_concept(concept_request("AI"), &aliases, None)
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert!(!created);
        assert_eq!(service.counts().unwrap().concepts, 1);
    }

    #[tokio::test]
    async fn fuzzy_match_absorbs_punctuation_variants() {
        let service = service();
        let aliases = AliasDictionary::new().snapshot();
        let (id1, _) = service
            .upsert_concept(concept_request("Self-Attention"), &aliases, None)
            .await
            .unwrap();
        let (id2, created) = service
            .upsert_concept(concept_request("self attention"), &aliases, None)
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert!(!created);
    }

    #[tokio::test]
    async fn claim_upsert_unions_evidence() {
        let service = service();
        seed_chunk(&service, "chunk_1").await;
        seed_chunk(&service, "chunk_2").await;

        let first = claim("Transformers use attention.", "chunk_1");
        let id1 = service
            .upsert_claim(first, provenance("chunk_1", "doc_1:s0"))
            .await
            .unwrap();

        let mut second = claim("transformers use attention", "chunk_2");
        second.sentence_ids = vec!["doc_1:s5".into()];
        let id2 = service
            .upsert_claim(second, provenance("chunk_2", "doc_1:s5"))
            .await
            .unwrap();

        assert_eq!(id1, id2);
        let counts = service.counts().unwrap();
        assert_eq!(counts.claims, 1);

        // Sentence ids were unioned, and both chunks provide evidence.
        if let Some(NodeBody::Claim(stored)) = service.store().get_node(&id1).unwrap() {
            assert!(stored.sentence_ids.contains(&"doc_1:s0".to_string()));
            assert!(stored.sentence_ids.contains(&"doc_1:s5".to_string()));
        } else {
            panic!("claim missing");
        }
        let evidence: Vec<_> = service
            .store()
            .edges_from(&id1)
            .unwrap()
            .into_iter()
            .filter(|e| e.kind == EdgeKind::EvidenceFrom)
            .collect();
        assert_eq!(evidence.len(), 2);
    }

    #[tokio::test]
    async fn rollback_restores_counts() {
        let service = service();
        seed_chunk(&service, "chunk_1").await;
        let baseline = service.counts().unwrap();

        let aliases = AliasDictionary::new().snapshot();
        let (id, _) = service
            .upsert_concept(concept_request("Ephemeral"), &aliases, None)
            .await
            .unwrap();
        service
            .attach_mention(
                "chunk_1",
                &id,
                MentionSpan {
                    sentence_id: "doc_1:s0".into(),
                    start: 0,
                    end: 4,
                },
                0.9,
                false,
                &"v1".to_string(),
            )
            .await
            .unwrap();
        assert_ne!(service.counts().unwrap(), baseline);

        let stats = service.rollback(&"v1".to_string()).await.unwrap();
        assert!(stats.nodes_removed > 0);
        let after = service.counts().unwrap();
        assert_eq!(after.concepts, 0);
        assert_eq!(after.edges, 0);
    }

    // -- Transient failure injection ---------------------------------------

    struct FlakyStore {
        inner: MemoryGraph,
        failures_left: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryGraph::new(),
                failures_left: AtomicUsize::new(failures),
            }
        }

        fn maybe_fail(&self) -> anyhow::Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                anyhow::bail!("transient store hiccup");
            }
            Ok(())
        }
    }

    impl GraphStore for FlakyStore {
        fn upsert_node(&self, node: NodeBody) -> anyhow::Result<()> {
            self.maybe_fail()?;
            self.inner.upsert_node(node)
        }
        fn get_node(&self, id: &str) -> anyhow::Result<Option<NodeBody>> {
            self.inner.get_node(id)
        }
        fn nodes_with_label(
            &self,
            label: evigraph_core::NodeLabel,
        ) -> anyhow::Result<Vec<NodeBody>> {
            self.inner.nodes_with_label(label)
        }
        fn concept_by_name(&self, name: &str) -> anyhow::Result<Option<Concept>> {
            self.inner.concept_by_name(name)
        }
        fn concepts_matching(&self, needle: &str, limit: usize) -> anyhow::Result<Vec<Concept>> {
            self.inner.concepts_matching(needle, limit)
        }
        fn claim_by_hash(&self, doc_id: &str, hash: &str) -> anyhow::Result<Option<Claim>> {
            self.inner.claim_by_hash(doc_id, hash)
        }
        fn upsert_edge(&self, edge: Edge) -> anyhow::Result<()> {
            self.maybe_fail()?;
            self.inner.upsert_edge(edge)
        }
        fn remove_edge(&self, identity: &str) -> anyhow::Result<bool> {
            self.inner.remove_edge(identity)
        }
        fn reassign_edges(&self, from: &str, to: &str) -> anyhow::Result<usize> {
            self.inner.reassign_edges(from, to)
        }
        fn edges_of(&self, id: &str) -> anyhow::Result<Vec<Edge>> {
            self.inner.edges_of(id)
        }
        fn edges_from(&self, id: &str) -> anyhow::Result<Vec<Edge>> {
            self.inner.edges_from(id)
        }
        fn all_edges(&self) -> anyhow::Result<Vec<Edge>> {
            self.inner.all_edges()
        }
        fn node_degree(&self, id: &str) -> anyhow::Result<usize> {
            self.inner.node_degree(id)
        }
        fn vector_search(
            &self,
            label: evigraph_core::NodeLabel,
            query: &[f32],
            top_k: usize,
        ) -> anyhow::Result<Vec<(String, f32)>> {
            self.inner.vector_search(label, query, top_k)
        }
        fn delete_build_version(&self, v: &str) -> anyhow::Result<PurgeStats> {
            self.inner.delete_build_version(v)
        }
        fn cleanup_orphan_concepts(&self) -> anyhow::Result<usize> {
            self.inner.cleanup_orphan_concepts()
        }
        fn counts(&self) -> anyhow::Result<GraphCounts> {
            self.inner.counts()
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_within_budget() {
        let service = GraphService::with_backoff(
            Arc::new(FlakyStore::new(2)),
            3,
            Duration::from_millis(1),
        );
        let aliases = AliasDictionary::new().snapshot();
        let (_, created) = service
            .upsert_concept(concept_request("Resilient"), &aliases, None)
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn errors_past_the_budget_fail_the_operation() {
        let service = GraphService::with_backoff(
            Arc::new(FlakyStore::new(10)),
            2,
            Duration::from_millis(1),
        );
        let aliases = AliasDictionary::new().snapshot();
        let err = service
            .upsert_concept(concept_request("Doomed"), &aliases, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "store");
    }
}

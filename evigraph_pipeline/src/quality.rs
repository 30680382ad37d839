//! Stage 8 (metrics): quality measurement over one build version.
//!
//! Structural metrics (provenance completeness, predicate distribution,
//! isolated nodes, average degree) come straight from the graph; accuracy
//! metrics run only when a labeled set or ground truth is supplied, and the
//! claim-relation precision sample uses the LLM as judge.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use evigraph_core::types::{EdgeKind, NodeBody, NodeLabel};
use evigraph_core::GraphStore;

use crate::error::PipelineError;
use crate::nli::NliVerifier;
use crate::PipelineContext;

/// Metrics computed for one build version.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BuildQualityReport {
    pub build_version: String,
    /// Share of the build's concepts and claims with a resolvable
    /// `EVIDENCE_FROM` locator.
    pub provenance_completeness: f32,
    /// Stored concept-concept edge counts per predicate.
    pub predicate_distribution: HashMap<String, usize>,
    /// OTHER share: review-parked predicates over all predicate proposals.
    /// Must stay below the warning ratio.
    pub other_share: f32,
    pub other_share_exceeded: bool,
    pub isolated_node_ratio: f32,
    pub avg_degree: f32,
    pub alias_count: usize,
    /// Only when a labeled set was provided.
    pub entity_link_accuracy: Option<f32>,
    /// Only when a ground-truth classification was provided.
    pub theme_nmi: Option<f32>,
    /// Only when a judge sample ran.
    pub claim_relation_precision: Option<f32>,
}

/// Stage 8 metrics service.
pub struct QualityService {
    ctx: PipelineContext,
}

impl QualityService {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// Structural metrics for a build. `other_predicates` is the number of
    /// predicate proposals parked as OTHER during that build's governance
    /// pass.
    pub fn compute(
        &self,
        build_version: &str,
        other_predicates: usize,
    ) -> Result<BuildQualityReport, PipelineError> {
        let store = &self.ctx.store;
        let mut report = BuildQualityReport {
            build_version: build_version.to_string(),
            ..Default::default()
        };

        // Provenance completeness over this build's concepts and claims.
        let mut anchored = 0usize;
        let mut total = 0usize;
        for label in [NodeLabel::Concept, NodeLabel::Claim] {
            for node in store.nodes_with_label(label).map_err(PipelineError::store)? {
                if node.build_version() != build_version {
                    continue;
                }
                total += 1;
                let has_locator = store
                    .edges_from(node.id())
                    .map_err(PipelineError::store)?
                    .iter()
                    .any(|e| {
                        e.kind == EdgeKind::EvidenceFrom
                            && e.provenance
                                .as_ref()
                                .map(|p| !p.sentence_ids.is_empty() && !p.chunk_id.is_empty())
                                .unwrap_or(false)
                    });
                if has_locator {
                    anchored += 1;
                }
            }
        }
        report.provenance_completeness = if total == 0 {
            1.0
        } else {
            anchored as f32 / total as f32
        };

        // Predicate distribution and OTHER share.
        let mut stored_predicates = 0usize;
        for edge in store.all_edges().map_err(PipelineError::store)? {
            if edge.build_version != build_version {
                continue;
            }
            if let EdgeKind::Concept(p) = edge.kind {
                *report
                    .predicate_distribution
                    .entry(p.as_str().to_string())
                    .or_default() += 1;
                stored_predicates += 1;
            }
        }
        let proposals = stored_predicates + other_predicates;
        report.other_share = if proposals == 0 {
            0.0
        } else {
            other_predicates as f32 / proposals as f32
        };
        report.other_share_exceeded =
            report.other_share > self.ctx.governance.thresholds.governor_other_warning_ratio;

        // Graph-shape statistics over the whole store.
        let mut node_ids: Vec<String> = Vec::new();
        for label in [
            NodeLabel::Concept,
            NodeLabel::Claim,
            NodeLabel::Chunk,
            NodeLabel::Theme,
        ] {
            for node in store.nodes_with_label(label).map_err(PipelineError::store)? {
                node_ids.push(node.id().to_string());
            }
        }
        if !node_ids.is_empty() {
            let mut isolated = 0usize;
            let mut degree_sum = 0usize;
            for id in &node_ids {
                let degree = store.node_degree(id).map_err(PipelineError::store)?;
                degree_sum += degree;
                if degree == 0 {
                    isolated += 1;
                }
            }
            report.isolated_node_ratio = isolated as f32 / node_ids.len() as f32;
            report.avg_degree = degree_sum as f32 / node_ids.len() as f32;
        }

        report.alias_count = self.ctx.aliases.snapshot().len();
        debug!(
            build = build_version,
            completeness = report.provenance_completeness,
            "quality computed"
        );
        Ok(report)
    }

    /// Accuracy of mention → concept resolution against a labeled set of
    /// `(surface_form, expected_concept_name)` pairs.
    pub fn entity_link_accuracy(&self, labeled: &[(String, String)]) -> Option<f32> {
        if labeled.is_empty() {
            return None;
        }
        let snapshot = self.ctx.aliases.snapshot();
        let mut correct = 0usize;
        for (surface, expected) in labeled {
            let resolved = snapshot
                .resolve(surface, None)
                .or_else(|| {
                    self.ctx
                        .store
                        .concept_by_name(surface)
                        .ok()
                        .flatten()
                        .map(|c| c.name)
                });
            if resolved.as_deref() == Some(expected.as_str()) {
                correct += 1;
            }
        }
        Some(correct as f32 / labeled.len() as f32)
    }

    /// Normalized mutual information between the built theme assignment and
    /// a ground-truth classification (`member_id -> class`).
    pub fn theme_nmi(&self, ground_truth: &HashMap<String, String>) -> Result<Option<f32>, PipelineError> {
        if ground_truth.is_empty() {
            return Ok(None);
        }
        // Theme assignment from BELONGS_TO_THEME edges, coarse themes only.
        let mut assignment: HashMap<String, String> = HashMap::new();
        for node in self
            .ctx
            .store
            .nodes_with_label(NodeLabel::Theme)
            .map_err(PipelineError::store)?
        {
            if let NodeBody::Theme(theme) = node {
                if theme.parent_theme_id.is_some() {
                    continue;
                }
                for member in theme.concept_ids.iter().chain(theme.claim_ids.iter()) {
                    assignment.insert(member.clone(), theme.id.clone());
                }
            }
        }

        let common: Vec<&String> = ground_truth
            .keys()
            .filter(|k| assignment.contains_key(*k))
            .collect();
        if common.len() < 2 {
            return Ok(None);
        }
        let predicted: Vec<&str> = common.iter().map(|k| assignment[*k].as_str()).collect();
        let truth: Vec<&str> = common.iter().map(|k| ground_truth[*k].as_str()).collect();
        Ok(Some(normalized_mutual_information(&predicted, &truth)))
    }

    /// Judge a sample of stored claim relations with the NLI verifier and
    /// report the surviving share.
    pub async fn claim_relation_precision(
        &self,
        build_version: &str,
        sample_size: usize,
    ) -> Result<Option<f32>, PipelineError> {
        let store = &self.ctx.store;
        let mut sampled = 0usize;
        let mut valid = 0usize;
        let verifier = NliVerifier::new(&self.ctx);

        let mut edges: Vec<_> = store
            .all_edges()
            .map_err(PipelineError::store)?
            .into_iter()
            .filter(|e| e.build_version == build_version)
            .filter(|e| matches!(e.kind, EdgeKind::Claim(_)))
            .collect();
        edges.sort_by(|a, b| a.identity().cmp(&b.identity())); // deterministic sample

        for edge in edges.into_iter().take(sample_size) {
            let (source, target) = (
                store.get_node(&edge.src).map_err(PipelineError::store)?,
                store.get_node(&edge.dst).map_err(PipelineError::store)?,
            );
            let (Some(NodeBody::Claim(source)), Some(NodeBody::Claim(target))) = (source, target)
            else {
                continue;
            };
            let EdgeKind::Claim(kind) = edge.kind else {
                continue;
            };
            sampled += 1;
            if verifier
                .verify_relation(&source.text, &target.text, kind, None)
                .await?
            {
                valid += 1;
            }
        }
        if sampled == 0 {
            return Ok(None);
        }
        Ok(Some(valid as f32 / sampled as f32))
    }
}

/// NMI over two parallel label sequences.
fn normalized_mutual_information(a: &[&str], b: &[&str]) -> f32 {
    fn count<'a>(labels: &[&'a str]) -> HashMap<&'a str, f32> {
        let mut m: HashMap<&'a str, f32> = HashMap::new();
        for l in labels {
            *m.entry(*l).or_default() += 1.0;
        }
        m
    }
    let n = a.len() as f32;
    let pa = count(a);
    let pb = count(b);

    let mut joint: HashMap<(&str, &str), f32> = HashMap::new();
    for (x, y) in a.iter().zip(b) {
        *joint.entry((x, y)).or_default() += 1.0;
    }

    let mut mutual_information = 0.0f32;
    for ((x, y), nxy) in &joint {
        let pxy = nxy / n;
        let px = pa[x] / n;
        let py = pb[y] / n;
        mutual_information += pxy * (pxy / (px * py)).ln();
    }

    let entropy = |p: &HashMap<&str, f32>| -> f32 {
        p.values()
            .map(|c| {
                let q = c / n;
                -q * q.ln()
            })
            .sum()
    };
    let ha = entropy(&pa);
    let hb = entropy(&pb);
    if ha == 0.0 || hb == 0.0 {
        // Degenerate single-cluster partitions: perfect match or no signal.
        return if joint.len() == pa.len().max(pb.len()) { 1.0 } else { 0.0 };
    }
    (mutual_information / (ha * hb).sqrt()).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatRequest, ChatResponse, EmbeddingClient, LlmClient, TokenUsage};
    use async_trait::async_trait;
    use evigraph_config::{EvigraphConfig, GovernanceConfig};
    use evigraph_core::types::{
        Concept, ConceptSource, Edge, Predicate, Provenance, Theme, ThemeLevel,
    };
    use evigraph_core::alias::alias;
    use evigraph_core::{AliasDictionary, GraphStore, MemoryGraph};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct EntailLlm;

    #[async_trait]
    impl LlmClient for EntailLlm {
        async fn chat_completion(&self, _: ChatRequest) -> Result<ChatResponse, PipelineError> {
            Ok(ChatResponse {
                text: r#"{"label": "entailment", "confidence": 0.9}"#.into(),
                usage: TokenUsage::default(),
            })
        }
    }

    struct NullEmbedder;

    #[async_trait]
    impl EmbeddingClient for NullEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            Ok(texts.iter().map(|_| vec![0.0; 2]).collect())
        }
        fn dim(&self) -> usize {
            2
        }
    }

    fn ctx(store: Arc<MemoryGraph>) -> PipelineContext {
        PipelineContext {
            config: Arc::new(EvigraphConfig::default()),
            governance: Arc::new(GovernanceConfig::default()),
            llm: Arc::new(EntailLlm),
            embedder: Arc::new(NullEmbedder),
            store,
            aliases: AliasDictionary::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn concept(id: &str, name: &str, build: &str) -> NodeBody {
        NodeBody::Concept(Concept {
            id: id.into(),
            name: name.into(),
            description: None,
            domain: None,
            category: None,
            importance: 0.5,
            tags: vec![],
            embedding: None,
            source: ConceptSource::Linked,
            redirect_to: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            build_version: build.into(),
        })
    }

    #[test]
    fn provenance_completeness_counts_anchored_nodes() {
        let store = Arc::new(MemoryGraph::new());
        store.upsert_node(concept("c1", "Anchored", "v1")).unwrap();
        store.upsert_node(concept("c2", "Orphan", "v1")).unwrap();
        store
            .upsert_node(NodeBody::Chunk(evigraph_core::Chunk {
                id: "chunk_1".into(),
                doc_id: "doc_1".into(),
                chunk_index: 0,
                text: "text".into(),
                resolved_text: None,
                section_path: vec![],
                page_num: None,
                sentence_ids: vec!["doc_1:s0".into()],
                window_start: 0,
                window_end: 0,
                embedding: None,
                build_version: "v1".into(),
            }))
            .unwrap();
        store
            .upsert_edge(Edge {
                src: "c1".into(),
                kind: EdgeKind::EvidenceFrom,
                dst: "chunk_1".into(),
                confidence: 1.0,
                review: false,
                mention: None,
                provenance: Some(Provenance {
                    doc_id: "doc_1".into(),
                    chunk_id: "chunk_1".into(),
                    section_path: vec![],
                    sentence_ids: vec!["doc_1:s0".into()],
                }),
                build_version: "v1".into(),
            })
            .unwrap();

        let service = QualityService::new(ctx(store));
        let report = service.compute("v1", 0).unwrap();
        assert!((report.provenance_completeness - 0.5).abs() < 1e-6);
        assert!(report.isolated_node_ratio > 0.0);
    }

    #[test]
    fn other_share_flags_above_threshold() {
        let store = Arc::new(MemoryGraph::new());
        store.upsert_node(concept("c1", "A", "v1")).unwrap();
        store.upsert_node(concept("c2", "B", "v1")).unwrap();
        store
            .upsert_edge(Edge {
                src: "c1".into(),
                kind: EdgeKind::Concept(Predicate::Uses),
                dst: "c2".into(),
                confidence: 1.0,
                review: false,
                mention: None,
                provenance: None,
                build_version: "v1".into(),
            })
            .unwrap();

        let service = QualityService::new(ctx(store));
        // 1 stored + 1 OTHER = 50% OTHER share, way above 10%.
        let report = service.compute("v1", 1).unwrap();
        assert!((report.other_share - 0.5).abs() < 1e-6);
        assert!(report.other_share_exceeded);
        assert_eq!(report.predicate_distribution.get("USES"), Some(&1));

        let quiet = service.compute("v1", 0).unwrap();
        assert!(!quiet.other_share_exceeded);
    }

    #[test]
    fn entity_link_accuracy_uses_aliases_and_names() {
        let store = Arc::new(MemoryGraph::new());
        store.upsert_node(concept("c1", "人工智能", "v1")).unwrap();
        let context = ctx(store);
        context.aliases.publish(vec![alias("AI", "人工智能", 0.9)]);
        let service = QualityService::new(context);

        let labeled = vec![
            ("AI".to_string(), "人工智能".to_string()),
            ("人工智能".to_string(), "人工智能".to_string()),
            ("ML".to_string(), "机器学习".to_string()),
        ];
        let accuracy = service.entity_link_accuracy(&labeled).unwrap();
        assert!((accuracy - 2.0 / 3.0).abs() < 1e-6);
        assert!(service.entity_link_accuracy(&[]).is_none());
    }

    #[test]
    fn theme_nmi_perfect_and_degenerate() {
        let store = Arc::new(MemoryGraph::new());
        for (theme_id, members) in [("t1", ["m1", "m2"]), ("t2", ["m3", "m4"])] {
            store
                .upsert_node(NodeBody::Theme(Theme {
                    id: theme_id.into(),
                    label: theme_id.into(),
                    summary: "s".into(),
                    level: ThemeLevel::Coarse,
                    keywords: vec![],
                    community_id: 0,
                    member_count: 2,
                    concept_ids: members.iter().map(|m| m.to_string()).collect(),
                    claim_ids: vec![],
                    parent_theme_id: None,
                    embedding: None,
                    build_version: "v1".into(),
                }))
                .unwrap();
        }
        let service = QualityService::new(ctx(store));

        let truth: HashMap<String, String> = [
            ("m1", "classA"),
            ("m2", "classA"),
            ("m3", "classB"),
            ("m4", "classB"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let nmi = service.theme_nmi(&truth).unwrap().unwrap();
        assert!(nmi > 0.99, "perfect agreement should give NMI ≈ 1, got {nmi}");

        assert!(service.theme_nmi(&HashMap::new()).unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_relation_precision_judges_a_sample() {
        let store = Arc::new(MemoryGraph::new());
        let make_claim = |id: &str, text: &str| {
            NodeBody::Claim(evigraph_core::Claim {
                id: id.into(),
                text: text.into(),
                normalized_text_hash: id.into(),
                canonical_id: None,
                doc_id: "doc_1".into(),
                chunk_id: "chunk_1".into(),
                sentence_ids: vec![],
                section_path: vec![],
                claim_type: evigraph_core::ClaimType::Fact,
                modality: evigraph_core::Modality::Assertive,
                polarity: evigraph_core::Polarity::Positive,
                certainty: 0.9,
                confidence: 0.9,
                evidence_span: None,
                embedding: None,
                build_version: "v1".into(),
            })
        };
        store.upsert_node(make_claim("cl1", "Attention scales well")).unwrap();
        store.upsert_node(make_claim("cl2", "Scaling improves accuracy")).unwrap();
        store
            .upsert_edge(Edge {
                src: "cl1".into(),
                kind: EdgeKind::Claim(evigraph_core::ClaimRelationKind::Supports),
                dst: "cl2".into(),
                confidence: 0.8,
                review: false,
                mention: None,
                provenance: None,
                build_version: "v1".into(),
            })
            .unwrap();

        let service = QualityService::new(ctx(store));
        let precision = service.claim_relation_precision("v1", 10).await.unwrap();
        assert_eq!(precision, Some(1.0));
        assert!(service
            .claim_relation_precision("v_unknown", 10)
            .await
            .unwrap()
            .is_none());
    }
}

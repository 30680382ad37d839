//! Stage 8 (feedback): merge, correct and unlink operations.
//!
//! Feedback requests land in a review queue; approving one applies it:
//!
//! - **merge** rewrites aliases and edges from the source concept to the
//!   target and turns the source into a redirect.
//! - **correct** fixes one edge and, once the same correction recurs often
//!   enough, promotes it into the predicate governor's mapping table.
//! - **unlink** adds a negative alias entry so the surface form stops
//!   resolving to that concept within the document's context.
//!
//! Alias and governance updates go through copy-on-write handles, so they
//! take effect on the next ingestion, never mid-build.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use evigraph_core::types::{Edge, EdgeKind, NodeBody, Predicate};
use evigraph_core::{AliasDictionary, AliasEntry, GraphStore};

use crate::error::PipelineError;
use crate::GovernanceHandle;

/// Review state of a feedback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Pending,
    Approved,
    Rejected,
}

/// The three feedback operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedbackOperation {
    Merge {
        source_concept_id: String,
        target_concept_id: String,
    },
    Correct {
        src: String,
        edge_type: String,
        dst: String,
        /// New predicate name (whitelisted) or new object concept id.
        new_predicate: Option<String>,
        new_object: Option<String>,
    },
    Unlink {
        mention_text: String,
        doc_id: String,
        concept_name: String,
    },
}

/// A queued feedback request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRequest {
    pub id: String,
    pub operation: FeedbackOperation,
    pub reason: String,
    pub status: FeedbackStatus,
    pub created_at: DateTime<Utc>,
}

/// Append-only application log entry.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackLogEntry {
    pub request_id: String,
    pub action: String,
    pub affected_edges: usize,
    pub processed_at: DateTime<Utc>,
}

struct FeedbackState {
    queue: Vec<FeedbackRequest>,
    log: Vec<FeedbackLogEntry>,
    /// `(old_predicate, new_predicate)` recurrence counter for promotion.
    correction_counts: HashMap<(String, String), usize>,
    next_id: u64,
}

/// Stage 8 feedback service.
pub struct FeedbackService {
    store: std::sync::Arc<dyn GraphStore>,
    aliases: AliasDictionary,
    governance: GovernanceHandle,
    promote_threshold: usize,
    state: Mutex<FeedbackState>,
}

impl FeedbackService {
    pub fn new(
        store: std::sync::Arc<dyn GraphStore>,
        aliases: AliasDictionary,
        governance: GovernanceHandle,
    ) -> Self {
        let promote_threshold = governance
            .snapshot()
            .thresholds
            .governor_correction_promote_count;
        Self {
            store,
            aliases,
            governance,
            promote_threshold,
            state: Mutex::new(FeedbackState {
                queue: Vec::new(),
                log: Vec::new(),
                correction_counts: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Queue a request for review. Returns its id.
    pub fn submit(&self, operation: FeedbackOperation, reason: String) -> String {
        let mut state = self.state.lock().unwrap();
        let id = format!("fb_{}", state.next_id);
        state.next_id += 1;
        state.queue.push(FeedbackRequest {
            id: id.clone(),
            operation,
            reason,
            status: FeedbackStatus::Pending,
            created_at: Utc::now(),
        });
        id
    }

    pub fn pending(&self) -> Vec<FeedbackRequest> {
        self.state
            .lock()
            .unwrap()
            .queue
            .iter()
            .filter(|r| r.status == FeedbackStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn log(&self) -> Vec<FeedbackLogEntry> {
        self.state.lock().unwrap().log.clone()
    }

    /// Approve or reject a pending request; approval applies the operation.
    pub fn review(&self, request_id: &str, approve: bool) -> Result<(), PipelineError> {
        let request = {
            let mut state = self.state.lock().unwrap();
            let Some(request) = state.queue.iter_mut().find(|r| r.id == request_id) else {
                return Err(PipelineError::Input(format!(
                    "unknown feedback request: {request_id}"
                )));
            };
            if request.status != FeedbackStatus::Pending {
                return Err(PipelineError::Input(format!(
                    "feedback request {request_id} already reviewed"
                )));
            }
            request.status = if approve {
                FeedbackStatus::Approved
            } else {
                FeedbackStatus::Rejected
            };
            request.clone()
        };

        let affected = if approve {
            self.apply(&request.operation)?
        } else {
            0
        };
        let mut state = self.state.lock().unwrap();
        state.log.push(FeedbackLogEntry {
            request_id: request_id.to_string(),
            action: if approve { "approved" } else { "rejected" }.into(),
            affected_edges: affected,
            processed_at: Utc::now(),
        });
        Ok(())
    }

    fn apply(&self, operation: &FeedbackOperation) -> Result<usize, PipelineError> {
        match operation {
            FeedbackOperation::Merge {
                source_concept_id,
                target_concept_id,
            } => self.apply_merge(source_concept_id, target_concept_id),
            FeedbackOperation::Correct {
                src,
                edge_type,
                dst,
                new_predicate,
                new_object,
            } => self.apply_correct(src, edge_type, dst, new_predicate.as_deref(), new_object.as_deref()),
            FeedbackOperation::Unlink {
                mention_text,
                doc_id,
                concept_name,
            } => {
                self.aliases.publish(vec![AliasEntry {
                    surface_form: mention_text.clone(),
                    canonical: concept_name.clone(),
                    doc_id: Some(doc_id.clone()),
                    confidence: 1.0,
                    negative: true,
                    created_at: Utc::now(),
                }]);
                info!(mention = %mention_text, concept = %concept_name, "negative alias added");
                Ok(0)
            }
        }
    }

    /// Rewrite edges and aliases from source to target, then leave the
    /// source as a redirect shell.
    fn apply_merge(&self, source_id: &str, target_id: &str) -> Result<usize, PipelineError> {
        let source = self
            .store
            .get_node(source_id)
            .map_err(PipelineError::store)?
            .ok_or_else(|| PipelineError::Input(format!("unknown concept: {source_id}")))?;
        let target = self
            .store
            .get_node(target_id)
            .map_err(PipelineError::store)?
            .ok_or_else(|| PipelineError::Input(format!("unknown concept: {target_id}")))?;
        let (NodeBody::Concept(mut source), NodeBody::Concept(target)) = (source, target) else {
            return Err(PipelineError::Input(
                "merge endpoints must be concepts".into(),
            ));
        };

        let moved = self
            .store
            .reassign_edges(source_id, target_id)
            .map_err(PipelineError::store)?;

        self.aliases.redirect_canonical(&source.name, &target.name);
        // The old name keeps resolving, to the surviving concept.
        self.aliases.publish(vec![AliasEntry {
            surface_form: source.name.clone(),
            canonical: target.name.clone(),
            doc_id: None,
            confidence: 1.0,
            negative: false,
            created_at: Utc::now(),
        }]);

        source.redirect_to = Some(target.id.clone());
        source.updated_at = Utc::now();
        self.store
            .upsert_node(NodeBody::Concept(source))
            .map_err(PipelineError::store)?;

        info!(source = source_id, target = target_id, moved, "concepts merged");
        Ok(moved)
    }

    /// Replace one edge's predicate or object. Recurring predicate
    /// corrections grow the governor's mapping table.
    fn apply_correct(
        &self,
        src: &str,
        edge_type: &str,
        dst: &str,
        new_predicate: Option<&str>,
        new_object: Option<&str>,
    ) -> Result<usize, PipelineError> {
        let identity = format!("{src}|{edge_type}|{dst}|");
        let edges = self.store.edges_of(src).map_err(PipelineError::store)?;
        let Some(old_edge) = edges.iter().find(|e| e.identity() == identity) else {
            return Err(PipelineError::Input(format!("unknown edge: {identity}")));
        };

        let mut fixed: Edge = old_edge.clone();
        match (new_predicate, new_object) {
            (Some(predicate_name), _) => {
                let Some(predicate) = Predicate::parse(predicate_name) else {
                    return Err(PipelineError::Ontology(format!(
                        "corrected predicate '{predicate_name}' is not whitelisted"
                    )));
                };
                fixed.kind = EdgeKind::Concept(predicate);

                // Promotion: the same old→new correction seen often enough
                // becomes a standing mapping for the next builds.
                let key = (edge_type.to_string(), predicate_name.to_string());
                let count = {
                    let mut state = self.state.lock().unwrap();
                    let count = state.correction_counts.entry(key).or_insert(0);
                    *count += 1;
                    *count
                };
                if count >= self.promote_threshold {
                    let surface = edge_type.to_string();
                    self.governance.update(|g| {
                        g.predicates.insert(surface.clone(), predicate);
                    });
                    debug!(
                        from = edge_type,
                        to = predicate_name,
                        occurrences = count,
                        "correction promoted into the predicate map"
                    );
                }
            }
            (None, Some(object_id)) => {
                if self
                    .store
                    .get_node(object_id)
                    .map_err(PipelineError::store)?
                    .is_none()
                {
                    return Err(PipelineError::Input(format!(
                        "unknown corrected object: {object_id}"
                    )));
                }
                fixed.dst = object_id.to_string();
            }
            (None, None) => {
                return Err(PipelineError::Input(
                    "correction must set a new predicate or a new object".into(),
                ));
            }
        }

        self.store
            .remove_edge(&identity)
            .map_err(PipelineError::store)?;
        if let Err(e) = self.store.upsert_edge(fixed) {
            warn!(error = %e, "re-inserting corrected edge failed");
            return Err(PipelineError::store(e));
        }
        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evigraph_config::GovernanceConfig;
    use evigraph_core::types::{Concept, ConceptSource};
    use evigraph_core::MemoryGraph;
    use std::sync::Arc;

    fn concept(id: &str, name: &str) -> NodeBody {
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
            build_version: "v1".into(),
        })
    }

    fn edge(src: &str, kind: EdgeKind, dst: &str) -> Edge {
        Edge {
            src: src.into(),
            kind,
            dst: dst.into(),
            confidence: 0.9,
            review: false,
            mention: None,
            provenance: None,
            build_version: "v1".into(),
        }
    }

    fn service(store: Arc<MemoryGraph>) -> (FeedbackService, AliasDictionary, GovernanceHandle) {
        let aliases = AliasDictionary::new();
        let governance = GovernanceHandle::new(GovernanceConfig::default());
        let service = FeedbackService::new(store, aliases.clone(), governance.clone());
        (service, aliases, governance)
    }

    #[test]
    fn merge_moves_edges_and_redirects_source() {
        let store = Arc::new(MemoryGraph::new());
        store.upsert_node(concept("c_src", "Bert Model")).unwrap();
        store.upsert_node(concept("c_dst", "BERT")).unwrap();
        store.upsert_node(concept("c_other", "NLP")).unwrap();
        store
            .upsert_edge(edge("c_src", EdgeKind::Concept(Predicate::RelatedTo), "c_other"))
            .unwrap();

        let (service, aliases, _) = service(store.clone());
        let id = service.submit(
            FeedbackOperation::Merge {
                source_concept_id: "c_src".into(),
                target_concept_id: "c_dst".into(),
            },
            "same model, different surface".into(),
        );
        service.review(&id, true).unwrap();

        // Edge now hangs off the target; source redirects.
        assert_eq!(store.edges_of("c_src").unwrap().len(), 0);
        assert_eq!(store.edges_of("c_dst").unwrap().len(), 1);
        if let Some(NodeBody::Concept(src)) = store.get_node("c_src").unwrap() {
            assert_eq!(src.redirect_to.as_deref(), Some("c_dst"));
        } else {
            panic!("source concept missing");
        }
        // The old name resolves to the survivor.
        assert_eq!(
            aliases.snapshot().resolve("Bert Model", None),
            Some("BERT".to_string())
        );
        assert_eq!(service.log().len(), 1);
        assert_eq!(service.log()[0].affected_edges, 1);
    }

    #[test]
    fn unlink_blocks_resolution_in_document_scope() {
        let store = Arc::new(MemoryGraph::new());
        let (service, aliases, _) = service(store);
        aliases.publish(vec![evigraph_core::alias::alias(
            "attention",
            "Attention (mechanism)",
            0.9,
        )]);

        let id = service.submit(
            FeedbackOperation::Unlink {
                mention_text: "attention".into(),
                doc_id: "doc_essay".into(),
                concept_name: "Attention (mechanism)".into(),
            },
            "informal usage, not the concept".into(),
        );
        service.review(&id, true).unwrap();

        let snapshot = aliases.snapshot();
        assert_eq!(snapshot.resolve("attention", Some("doc_essay")), None);
        assert!(snapshot.resolve("attention", Some("doc_other")).is_some());
    }

    #[test]
    fn correct_replaces_predicate_and_promotes_after_recurrence() {
        let store = Arc::new(MemoryGraph::new());
        store.upsert_node(concept("c_a", "Transformer")).unwrap();
        store.upsert_node(concept("c_b", "Attention")).unwrap();

        let (service, _, governance) = service(store.clone());
        let threshold = governance
            .snapshot()
            .thresholds
            .governor_correction_promote_count;

        for i in 0..threshold {
            store
                .upsert_edge(edge("c_a", EdgeKind::Concept(Predicate::Uses), "c_b"))
                .unwrap();
            let id = service.submit(
                FeedbackOperation::Correct {
                    src: "c_a".into(),
                    edge_type: "USES".into(),
                    dst: "c_b".into(),
                    new_predicate: Some("DERIVES_FROM".into()),
                    new_object: None,
                },
                format!("correction number {i}"),
            );
            service.review(&id, true).unwrap();
        }

        // Edge carries the corrected predicate.
        let kinds: Vec<EdgeKind> = store.edges_of("c_a").unwrap().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EdgeKind::Concept(Predicate::DerivesFrom)));
        // Recurrence promoted the mapping.
        assert_eq!(
            governance.snapshot().predicates.normalize("USES"),
            Some(Predicate::DerivesFrom)
        );
    }

    #[test]
    fn correct_rejects_non_whitelisted_predicate() {
        let store = Arc::new(MemoryGraph::new());
        store.upsert_node(concept("c_a", "A")).unwrap();
        store.upsert_node(concept("c_b", "B")).unwrap();
        store
            .upsert_edge(edge("c_a", EdgeKind::Concept(Predicate::Uses), "c_b"))
            .unwrap();

        let (service, _, _) = service(store);
        let id = service.submit(
            FeedbackOperation::Correct {
                src: "c_a".into(),
                edge_type: "USES".into(),
                dst: "c_b".into(),
                new_predicate: Some("FRIENDS_WITH".into()),
                new_object: None,
            },
            "bogus predicate".into(),
        );
        let err = service.review(&id, true).unwrap_err();
        assert_eq!(err.kind(), "ontology");
    }

    #[test]
    fn rejected_requests_apply_nothing() {
        let store = Arc::new(MemoryGraph::new());
        store.upsert_node(concept("c_src", "A")).unwrap();
        store.upsert_node(concept("c_dst", "B")).unwrap();

        let (service, _, _) = service(store.clone());
        let id = service.submit(
            FeedbackOperation::Merge {
                source_concept_id: "c_src".into(),
                target_concept_id: "c_dst".into(),
            },
            "mistaken merge".into(),
        );
        service.review(&id, false).unwrap();

        if let Some(NodeBody::Concept(src)) = store.get_node("c_src").unwrap() {
            assert!(src.redirect_to.is_none());
        }
        assert!(service.pending().is_empty());
        assert_eq!(service.log()[0].action, "rejected");
    }

    #[test]
    fn double_review_is_an_error() {
        let store = Arc::new(MemoryGraph::new());
        store.upsert_node(concept("c_src", "A")).unwrap();
        store.upsert_node(concept("c_dst", "B")).unwrap();
        let (service, _, _) = service(store);
        let id = service.submit(
            FeedbackOperation::Merge {
                source_concept_id: "c_src".into(),
                target_concept_id: "c_dst".into(),
            },
            "once only".into(),
        );
        service.review(&id, true).unwrap();
        assert!(service.review(&id, true).is_err());
        assert!(service.review("fb_999", true).is_err());
    }
}

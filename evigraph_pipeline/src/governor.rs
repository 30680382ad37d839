//! Stage 5: predicate governance.
//!
//! Free-text predicates are normalized into the closed whitelist through
//! three gates: already-canonical names, the configured surface → canonical
//! table, and an embedding synonym fallback against the whitelist labels.
//! Surfaces that survive none of them become OTHER and land on the review
//! queue instead of the graph. Whatever the mapping outcome, the ontology's
//! type constraints get the final say.
//!
//! The governor never writes; stage 6 consumes its decisions.

use std::sync::Mutex;

use tracing::{debug, warn};

use evigraph_core::store::cosine;
use evigraph_core::types::Predicate;

use crate::error::PipelineError;
use crate::linker::ProposedTriple;
use crate::{EmbeddingClient, PipelineContext};

/// Outcome of normalizing one proposed triple.
#[derive(Debug, Clone, PartialEq)]
pub enum GovernorDecision {
    /// Mapped into the whitelist and type-valid.
    Accepted(Predicate),
    /// No mapping found; queued for human review, not written.
    Other { surface: String },
    /// Mapped but rejected by a type constraint.
    Rejected { predicate: Predicate, reason: String },
}

/// A triple waiting for human review.
#[derive(Debug, Clone)]
pub struct ReviewItem {
    pub triple: ProposedTriple,
    pub reason: String,
}

/// Stage 5 governor. Holds the whitelist label embeddings for the synonym
/// fallback and collects its own review queue.
pub struct PredicateGovernor {
    /// `(predicate, label_embedding)`; empty until primed.
    synonym_index: Vec<(Predicate, Vec<f32>)>,
    synonym_threshold: f32,
    review_queue: Mutex<Vec<ReviewItem>>,
}

impl PredicateGovernor {
    pub fn new(synonym_threshold: f32) -> Self {
        Self {
            synonym_index: Vec::new(),
            synonym_threshold,
            review_queue: Mutex::new(Vec::new()),
        }
    }

    /// Embed the whitelist labels once per build. Failure leaves the synonym
    /// fallback disabled; mapping-table hits still work.
    pub async fn prime(&mut self, embedder: &dyn EmbeddingClient) -> Result<(), PipelineError> {
        let labels: Vec<String> = Predicate::ALL
            .iter()
            .map(|p| p.as_str().replace('_', " ").to_lowercase())
            .collect();
        match embedder.embed(&labels).await {
            Ok(vectors) if vectors.len() == Predicate::ALL.len() => {
                self.synonym_index = Predicate::ALL.iter().copied().zip(vectors).collect();
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "synonym index priming failed; fallback disabled");
                Ok(())
            }
        }
    }

    /// Normalize one triple's predicate and validate its type constraint.
    pub async fn normalize(
        &self,
        ctx: &PipelineContext,
        triple: &ProposedTriple,
        subject_type: &str,
        object_type: &str,
    ) -> Result<GovernorDecision, PipelineError> {
        let surface = triple.predicate_text.trim();

        // Gate 1: already canonical.
        // Gate 2: configured surface mapping.
        let mapped = Predicate::parse(surface)
            .or_else(|| ctx.governance.predicates.normalize(surface));

        // Gate 3: embedding synonym lookup over the whitelist labels.
        let mapped = match mapped {
            Some(p) => Some(p),
            None if !self.synonym_index.is_empty() => {
                ctx.checkpoint()?;
                match ctx.embedder.embed(&[surface.to_lowercase()]).await {
                    Ok(vectors) if !vectors.is_empty() => {
                        let query = &vectors[0];
                        let best = self
                            .synonym_index
                            .iter()
                            .map(|(p, emb)| (*p, cosine(query, emb)))
                            .max_by(|a, b| {
                                a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
                            });
                        match best {
                            Some((p, score)) if score >= self.synonym_threshold => {
                                debug!(surface, predicate = p.as_str(), score, "synonym mapped");
                                Some(p)
                            }
                            _ => None,
                        }
                    }
                    _ => None,
                }
            }
            None => None,
        };

        let Some(predicate) = mapped else {
            self.enqueue(triple, "unmapped predicate surface");
            return Ok(GovernorDecision::Other {
                surface: surface.to_string(),
            });
        };

        if !ctx
            .governance
            .ontology
            .allows(subject_type, predicate, object_type)
        {
            let reason = format!(
                "{subject_type} -{}-> {object_type} violates the ontology",
                predicate.as_str()
            );
            self.enqueue(triple, &reason);
            return Ok(GovernorDecision::Rejected { predicate, reason });
        }

        Ok(GovernorDecision::Accepted(predicate))
    }

    fn enqueue(&self, triple: &ProposedTriple, reason: &str) {
        self.review_queue.lock().unwrap().push(ReviewItem {
            triple: triple.clone(),
            reason: reason.to_string(),
        });
    }

    /// Drain the accumulated review queue.
    pub fn take_review_queue(&self) -> Vec<ReviewItem> {
        std::mem::take(&mut self.review_queue.lock().unwrap())
    }

    pub fn review_queue_len(&self) -> usize {
        self.review_queue.lock().unwrap().len()
    }
}

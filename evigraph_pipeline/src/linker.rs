//! Stage 2: entity linking.
//!
//! For each detected mention: candidates come from three recall routes
//! (alias dictionary, lexical match over concept names/descriptions, vector
//! similarity), get reranked by a six-feature blend, and pass through
//! per-node-type thresholds. Low-and-flat score distributions yield NIL — a
//! proposal for a new concept that stage 6 materializes only after
//! deduplication. Negative alias entries from unlink feedback disqualify a
//! candidate outright.
//!
//! Inline `(subject, predicate_text, object)` triples are queued for the
//! predicate governor when both sides linked; everything else is deferred to
//! the claim extractor.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, info_span};

use evigraph_core::store::cosine;
use evigraph_core::types::{Chunk, ConceptId, EdgeKind};
use evigraph_core::{AliasSnapshot, GraphStore};

use crate::coref::{entity_terms, CorefMode, CorefOutcome};
use crate::error::PipelineError;
use crate::PipelineContext;

/// Rerank feature breakdown, kept on the link for explainability.
#[derive(Debug, Clone, Default)]
pub struct LinkFeatures {
    pub lexical: f32,
    pub semantic: f32,
    pub context: f32,
    pub type_consistency: f32,
    pub frequency: f32,
    pub graph: f32,
}

/// Where the mention was seen, for the `MENTIONS` edge.
#[derive(Debug, Clone)]
pub struct LinkEvidence {
    pub sentence_id: Option<String>,
    pub start: usize,
    pub end: usize,
    pub match_type: String,
    pub features: LinkFeatures,
}

/// One linking decision.
#[derive(Debug, Clone)]
pub struct LinkOutcome {
    pub mention: String,
    /// `None` for NIL proposals; the concept is created in stage 6.
    pub concept_id: Option<ConceptId>,
    /// Canonical concept name (for NIL, the proposed name).
    pub concept_name: String,
    pub confidence: f32,
    pub is_nil: bool,
    pub is_review: bool,
    pub node_type: Option<String>,
    pub evidence: LinkEvidence,
}

/// A concept-concept triple found inline, pending governance.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedTriple {
    pub subject: String,
    pub predicate_text: String,
    pub object: String,
    pub confidence: f32,
}

/// Stage 2 output for one chunk.
#[derive(Debug, Clone, Default)]
pub struct LinkerOutput {
    pub links: Vec<LinkOutcome>,
    pub triples: Vec<ProposedTriple>,
}

struct Candidate {
    concept_id: ConceptId,
    name: String,
    description: Option<String>,
    node_type: Option<String>,
    embedding: Option<Vec<f32>>,
    match_type: &'static str,
    vector_score: Option<f32>,
    score: f32,
    features: LinkFeatures,
}

/// Stage 2 entity linker.
pub struct EntityLinker<'a> {
    ctx: &'a PipelineContext,
    aliases: Arc<AliasSnapshot>,
    proper_noun: Regex,
}

impl<'a> EntityLinker<'a> {
    pub fn new(ctx: &'a PipelineContext, aliases: Arc<AliasSnapshot>) -> Self {
        Self {
            ctx,
            aliases,
            proper_noun: Regex::new(r"\b[A-Z][A-Za-z0-9]{2,}\b").expect("proper noun regex"),
        }
    }

    /// Link one chunk. Mentions that normalize to the same string share one
    /// decision.
    pub async fn link_chunk(
        &self,
        chunk: &Chunk,
        coref: &CorefOutcome,
    ) -> Result<LinkerOutput, PipelineError> {
        let span = info_span!("evigraph.link", chunk_id = %chunk.id);
        let _guard = span.enter();

        let text = if coref.mode == CorefMode::Rewrite {
            coref.resolved_text.as_str()
        } else {
            chunk.text.as_str()
        };

        let mentions = self.detect_mentions(text, coref);
        if mentions.is_empty() {
            debug!(chunk_id = %chunk.id, "no mentions detected");
            return Ok(LinkerOutput::default());
        }

        let sentence_spans = sentence_spans(text, &chunk.sentence_ids);

        let mut links: Vec<LinkOutcome> = Vec::new();
        let mut linked_ids: Vec<ConceptId> = Vec::new();
        for mention in &mentions {
            self.ctx.checkpoint()?;
            let mut outcome = self
                .link_mention(mention, text, chunk, coref, &linked_ids)
                .await?;
            locate_mention(&mut outcome, text, &sentence_spans);
            if let Some(id) = &outcome.concept_id {
                linked_ids.push(id.clone());
            }
            links.push(outcome);
        }

        let triples = self.extract_triples(text, &sentence_spans, &links);
        debug!(
            chunk_id = %chunk.id,
            mentions = mentions.len(),
            links = links.len(),
            nil = links.iter().filter(|l| l.is_nil).count(),
            triples = triples.len(),
            "linking complete"
        );
        Ok(LinkerOutput { links, triples })
    }

    /// Proper-noun and CJK noun-phrase mention detection, stage-1 aliases as
    /// guaranteed mentions, deduplicated by normalized form.
    fn detect_mentions(&self, text: &str, coref: &CorefOutcome) -> Vec<String> {
        const STOPWORDS: &[&str] = &[
            "这个", "那个", "这些", "那些", "它们", "他们", "我们", "你们", "The", "This",
            "That", "These", "Those", "There", "However", "Therefore", "Because",
        ];

        let mappings = &self.ctx.governance.predicates.mappings;
        let mut seen: HashSet<String> = HashSet::new();
        let mut mentions: Vec<String> = Vec::new();
        let mut push = |m: &str| {
            let m = m.trim();
            if m.is_empty() || STOPWORDS.contains(&m) {
                return;
            }
            // Predicate surfaces are connectives, not entities.
            if mappings.keys().any(|s| s.eq_ignore_ascii_case(m) || s == m) {
                return;
            }
            if seen.insert(m.to_lowercase()) {
                mentions.push(m.to_string());
            }
        };

        for surface in coref.alias_map.keys() {
            push(surface);
        }
        for canonical in coref.alias_map.values() {
            push(canonical);
        }
        for m in self.proper_noun.find_iter(text) {
            push(m.as_str());
        }
        for term in entity_terms(text) {
            push(&term);
        }
        mentions
    }

    async fn link_mention(
        &self,
        mention: &str,
        text: &str,
        chunk: &Chunk,
        coref: &CorefOutcome,
        linked_ids: &[ConceptId],
    ) -> Result<LinkOutcome, PipelineError> {
        let thresholds = &self.ctx.governance.thresholds;

        let mut candidates = self.multi_retrieval(mention, chunk, coref).await?;
        if candidates.is_empty() {
            return Ok(self.nil_outcome(mention, coref, 0.5, "no_candidates"));
        }

        // Rerank.
        let mention_embedding = self.mention_embedding(mention, chunk).await;
        for candidate in candidates.iter_mut() {
            self.score_candidate(candidate, mention, text, chunk, mention_embedding.as_deref(), linked_ids)?;
        }
        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let top = &candidates[0];
        let top_score = top.score;

        // NIL detection: low top score with a flat top-2 gap means none of
        // the candidates really fits.
        if candidates.len() > 1 {
            let gap = top_score - candidates[1].score;
            if top_score < thresholds.linker_nil_top_score && gap < thresholds.linker_nil_gap {
                return Ok(self.nil_outcome(mention, coref, top_score, "flat_candidates"));
            }
        }
        // A lone weak candidate that only vector recall surfaced is noise.
        if top_score < thresholds.linker_nil_top_score && top.match_type == "vector" {
            return Ok(self.nil_outcome(mention, coref, top_score, "weak_vector_only"));
        }
        if top_score < thresholds.entity_link_reject_threshold {
            return Ok(self.nil_outcome(mention, coref, top_score, "below_reject"));
        }

        let node_type = top.node_type.clone().unwrap_or_else(|| "Concept".into());
        let type_threshold = thresholds.type_threshold(&node_type);
        let is_review = top_score < type_threshold.accept;

        Ok(LinkOutcome {
            mention: mention.to_string(),
            concept_id: Some(top.concept_id.clone()),
            concept_name: top.name.clone(),
            confidence: top_score,
            is_nil: false,
            is_review,
            node_type: Some(node_type),
            evidence: LinkEvidence {
                sentence_id: None,
                start: 0,
                end: 0,
                match_type: top.match_type.to_string(),
                features: top.features.clone(),
            },
        })
    }

    fn nil_outcome(
        &self,
        mention: &str,
        coref: &CorefOutcome,
        confidence: f32,
        reason: &str,
    ) -> LinkOutcome {
        // Canonical form for the proposed concept: stage-1 alias first, then
        // the dictionary, then the surface itself.
        let canonical = coref
            .alias_map
            .get(mention)
            .cloned()
            .or_else(|| self.aliases.resolve(mention, None))
            .unwrap_or_else(|| mention.to_string());
        LinkOutcome {
            mention: mention.to_string(),
            concept_id: None,
            concept_name: canonical,
            confidence,
            is_nil: true,
            is_review: false,
            node_type: None,
            evidence: LinkEvidence {
                sentence_id: None,
                start: 0,
                end: 0,
                match_type: reason.to_string(),
                features: LinkFeatures::default(),
            },
        }
    }

    /// Union of the three recall routes, deduplicated, capped.
    async fn multi_retrieval(
        &self,
        mention: &str,
        chunk: &Chunk,
        coref: &CorefOutcome,
    ) -> Result<Vec<Candidate>, PipelineError> {
        let thresholds = &self.ctx.governance.thresholds;
        let store = &self.ctx.store;
        let doc_id = Some(chunk.doc_id.as_str());

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut seen: HashSet<ConceptId> = HashSet::new();

        let mut admit =
            |concept: evigraph_core::Concept, match_type: &'static str, vector_score: Option<f32>,
             candidates: &mut Vec<Candidate>, seen: &mut HashSet<ConceptId>| {
                if !seen.insert(concept.id.clone()) {
                    return;
                }
                // Unlink feedback: this surface must not resolve to this
                // concept in this document's context.
                if self.aliases.is_blocked(mention, &concept.name, doc_id) {
                    debug!(mention, concept = %concept.name, "candidate blocked by negative alias");
                    return;
                }
                candidates.push(Candidate {
                    concept_id: concept.id,
                    name: concept.name,
                    description: concept.description,
                    node_type: concept.category,
                    embedding: concept.embedding,
                    match_type,
                    vector_score,
                    score: 0.0,
                    features: LinkFeatures::default(),
                });
            };

        // Route 1: alias dictionary (stage-1 map first, then the global one).
        let alias_canonical = coref
            .alias_map
            .get(mention)
            .cloned()
            .or_else(|| self.aliases.resolve(mention, doc_id));
        if let Some(canonical) = alias_canonical {
            if let Some(concept) = store.concept_by_name(&canonical).map_err(PipelineError::store)? {
                admit(concept, "alias", None, &mut candidates, &mut seen);
            }
        }

        // Route 1b: exact name.
        if let Some(concept) = store.concept_by_name(mention).map_err(PipelineError::store)? {
            admit(concept, "exact", None, &mut candidates, &mut seen);
        }

        // Route 2: lexical recall over names and descriptions.
        for concept in store
            .concepts_matching(mention, thresholds.linker_lexical_top_k)
            .map_err(PipelineError::store)?
        {
            admit(concept, "lexical", None, &mut candidates, &mut seen);
        }

        // Route 3: vector recall over concept embeddings.
        if self.ctx.config.features.enable_vector_search {
            if let Some(embedding) = self.mention_embedding(mention, chunk).await {
                for (id, score) in store
                    .vector_search(
                        evigraph_core::NodeLabel::Concept,
                        &embedding,
                        thresholds.linker_vector_top_k,
                    )
                    .map_err(PipelineError::store)?
                {
                    if let Some(evigraph_core::NodeBody::Concept(concept)) =
                        store.get_node(&id).map_err(PipelineError::store)?
                    {
                        admit(concept, "vector", Some(score), &mut candidates, &mut seen);
                    }
                }
            }
        }

        // Ontology gate: a candidate typed outside the ontology is a hard
        // violation.
        candidates.retain(|c| match &c.node_type {
            Some(t) => self.ctx.governance.ontology.is_known_type(t),
            None => true,
        });

        candidates.truncate(thresholds.linker_combined_top_k);
        Ok(candidates)
    }

    /// Mention embedding with chunk-embedding fallback.
    async fn mention_embedding(&self, mention: &str, chunk: &Chunk) -> Option<Vec<f32>> {
        if !self.ctx.config.features.enable_vector_search {
            return chunk.embedding.clone();
        }
        match self.ctx.embedder.embed(&[mention.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => {
                let v = vectors.remove(0);
                if v.iter().any(|x| *x != 0.0) {
                    Some(v)
                } else {
                    chunk.embedding.clone()
                }
            }
            _ => chunk.embedding.clone(),
        }
    }

    fn score_candidate(
        &self,
        candidate: &mut Candidate,
        mention: &str,
        text: &str,
        chunk: &Chunk,
        mention_embedding: Option<&[f32]>,
        linked_ids: &[ConceptId],
    ) -> Result<(), PipelineError> {
        let weights = &self.ctx.governance.thresholds.linker_weights;

        let features = LinkFeatures {
            lexical: lexical_similarity(mention, &candidate.name),
            semantic: self.semantic_similarity(candidate, mention_embedding),
            context: self.context_fit(candidate, text, chunk),
            type_consistency: if candidate.node_type.is_some() { 0.9 } else { 0.5 },
            frequency: self.prior_frequency(candidate)?,
            graph: self.graph_consistency(candidate, linked_ids)?,
        };

        candidate.score = features.lexical * weights.lexical
            + features.semantic * weights.semantic
            + features.context * weights.context
            + features.type_consistency * weights.type_consistency
            + features.frequency * weights.frequency
            + features.graph * weights.graph;
        candidate.features = features;
        Ok(())
    }

    fn semantic_similarity(&self, candidate: &Candidate, mention_embedding: Option<&[f32]>) -> f32 {
        if let (Some(m), Some(c)) = (mention_embedding, candidate.embedding.as_deref()) {
            if m.len() == c.len() {
                // Cosine is in [-1, 1]; normalize to [0, 1].
                return (cosine(m, c) + 1.0) / 2.0;
            }
        }
        if let Some(score) = candidate.vector_score {
            return score.clamp(0.0, 1.0);
        }
        0.3
    }

    fn context_fit(&self, candidate: &Candidate, text: &str, chunk: &Chunk) -> f32 {
        if let (Some(chunk_emb), Some(c)) = (chunk.embedding.as_deref(), candidate.embedding.as_deref())
        {
            if chunk_emb.len() == c.len() {
                return ((cosine(chunk_emb, c) + 1.0) / 2.0).clamp(0.0, 1.0);
            }
        }
        // Fallback: description-token overlap with the chunk text.
        if let Some(description) = &candidate.description {
            let desc_tokens: HashSet<String> = description
                .to_lowercase()
                .split_whitespace()
                .map(String::from)
                .collect();
            if !desc_tokens.is_empty() {
                let text_lower = text.to_lowercase();
                let overlap = desc_tokens
                    .iter()
                    .filter(|t| text_lower.contains(t.as_str()))
                    .count();
                return (overlap as f32 / desc_tokens.len() as f32).min(0.7);
            }
        }
        0.5
    }

    fn prior_frequency(&self, candidate: &Candidate) -> Result<f32, PipelineError> {
        let degree = self
            .ctx
            .store
            .node_degree(&candidate.concept_id)
            .map_err(PipelineError::store)?;
        Ok((degree as f32 / 100.0).min(1.0))
    }

    /// Theme-community and co-occurrence consistency with the concepts
    /// already linked in this chunk.
    fn graph_consistency(
        &self,
        candidate: &Candidate,
        linked_ids: &[ConceptId],
    ) -> Result<f32, PipelineError> {
        if linked_ids.is_empty() {
            return Ok(0.5);
        }
        let store = &self.ctx.store;
        let themes_of = |id: &str| -> Result<HashSet<String>, PipelineError> {
            Ok(store
                .edges_from(id)
                .map_err(PipelineError::store)?
                .into_iter()
                .filter(|e| e.kind == EdgeKind::BelongsToTheme)
                .map(|e| e.dst)
                .collect())
        };
        let neighbors_of = |id: &str| -> Result<HashSet<String>, PipelineError> {
            Ok(store
                .edges_of(id)
                .map_err(PipelineError::store)?
                .into_iter()
                .flat_map(|e| [e.src, e.dst])
                .collect())
        };

        let candidate_themes = themes_of(&candidate.concept_id)?;
        let mut linked_themes: HashSet<String> = HashSet::new();
        for id in linked_ids {
            linked_themes.extend(themes_of(id)?);
        }
        if !candidate_themes.is_empty() && !linked_themes.is_empty() {
            let overlap = candidate_themes.intersection(&linked_themes).count();
            let total = candidate_themes.union(&linked_themes).count();
            if overlap > 0 && total > 0 {
                return Ok(0.7 + 0.3 * (overlap as f32 / total as f32));
            }
        }

        // No theme signal: fall back to direct co-occurrence in the graph.
        let candidate_neighbors = neighbors_of(&candidate.concept_id)?;
        let shared = linked_ids
            .iter()
            .filter(|id| candidate_neighbors.contains(*id))
            .count();
        if shared > 0 {
            return Ok(0.6 + 0.1 * (shared.min(4) as f32));
        }
        Ok(0.5)
    }

    /// Inline triple detection: two linked mentions in one sentence with a
    /// short connective that the predicate table knows. Anything else is the
    /// claim extractor's business.
    fn extract_triples(
        &self,
        text: &str,
        sentence_spans: &[(usize, usize, String)],
        links: &[LinkOutcome],
    ) -> Vec<ProposedTriple> {
        let mappings = &self.ctx.governance.predicates.mappings;
        let mut triples = Vec::new();

        for (start, end, _) in sentence_spans {
            let sentence = &text[*start..*end];
            let mut located: Vec<(usize, &LinkOutcome)> = links
                .iter()
                .filter_map(|l| sentence.find(l.mention.as_str()).map(|p| (p, l)))
                .collect();
            located.sort_by_key(|(p, _)| *p);

            for window in located.windows(2) {
                let (pos_a, link_a) = &window[0];
                let (pos_b, link_b) = &window[1];
                let between_start = pos_a + link_a.mention.len();
                if between_start >= *pos_b {
                    continue;
                }
                let between = sentence[between_start..*pos_b].trim();
                if between.is_empty() || between.chars().count() > 16 {
                    continue;
                }
                let between_lower = between.to_lowercase();
                if let Some(surface) = mappings
                    .keys()
                    .find(|s| between_lower.contains(&s.to_lowercase()))
                {
                    triples.push(ProposedTriple {
                        subject: link_a.concept_name.clone(),
                        predicate_text: surface.clone(),
                        object: link_b.concept_name.clone(),
                        confidence: (link_a.confidence.min(link_b.confidence)).max(0.5),
                    });
                }
            }
        }
        triples
    }
}

/// Byte spans of each sentence in the chunk text, paired with its sentence
/// id.
fn sentence_spans(text: &str, sentence_ids: &[String]) -> Vec<(usize, usize, String)> {
    let sentences = crate::chunker::split_sentences(text);
    let mut spans = Vec::new();
    let mut cursor = 0usize;
    for (i, sentence) in sentences.iter().enumerate() {
        if let Some(pos) = text[cursor..].find(sentence.as_str()) {
            let start = cursor + pos;
            let end = start + sentence.len();
            let id = sentence_ids.get(i).cloned().unwrap_or_default();
            spans.push((start, end, id));
            cursor = end;
        }
    }
    spans
}

/// Attach the first occurrence's span and sentence id to a link.
fn locate_mention(link: &mut LinkOutcome, text: &str, spans: &[(usize, usize, String)]) {
    if let Some(pos) = text.find(link.mention.as_str()) {
        link.evidence.start = pos;
        link.evidence.end = pos + link.mention.len();
        link.evidence.sentence_id = spans
            .iter()
            .find(|(s, e, _)| *s <= pos && pos < *e)
            .map(|(_, _, id)| id.clone())
            .filter(|id| !id.is_empty());
    }
}

/// Lexical similarity: exact 1.0, containment 0.8, else scaled character
/// Jaccard.
fn lexical_similarity(mention: &str, name: &str) -> f32 {
    let m = mention.to_lowercase();
    let n = name.to_lowercase();
    if m == n {
        return 1.0;
    }
    if m.contains(&n) || n.contains(&m) {
        return 0.8;
    }
    let m_chars: HashSet<char> = m.chars().collect();
    let n_chars: HashSet<char> = n.chars().collect();
    if m_chars.is_empty() || n_chars.is_empty() {
        return 0.0;
    }
    let overlap = m_chars.intersection(&n_chars).count() as f32;
    let union = m_chars.union(&n_chars).count() as f32;
    (overlap / union) * 0.6
}

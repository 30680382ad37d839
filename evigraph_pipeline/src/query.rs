//! Stage 7: theme-first hybrid retrieval.
//!
//! Recall runs three ways — themes by summary-embedding similarity, chunks
//! and claims by vector similarity — then expands ≤ N hops along argument
//! chains and whitelisted concept predicates. Surviving nodes resolve their
//! `EVIDENCE_FROM` locators into anchored snippets, and generation is scoped
//! to exactly that context: every answer sentence must cite an `[En]`
//! anchor or the answer is rejected, retried once, and finally degraded to
//! "insufficient evidence" with the partial reasoning chain.
//!
//! `local` skips theme recall; `global` answers from theme summaries alone.
//! A dead store degrades to the cached last-known-good themes; an LLM
//! timeout returns the structured retrieval result without prose.

use std::collections::HashMap;
use std::sync::Mutex;

use regex::Regex;
use tracing::{debug, info_span, warn};

use evigraph_core::GraphStore;
use evigraph_core::traversal::expand_scored;
use evigraph_core::types::{Chunk, EdgeKind, NodeBody, NodeLabel};

use evigraph_config::prompts::fill;

use crate::chunker::split_sentences;
use crate::error::PipelineError;
use crate::{ChatMessage, PipelineContext};

/// Retrieval mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    Local,
    Global,
    Hybrid,
}

impl Default for QueryMode {
    fn default() -> Self {
        QueryMode::Hybrid
    }
}

/// A recalled theme.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ThemeHit {
    pub theme_id: String,
    pub label: String,
    pub summary: String,
    pub score: f32,
}

/// One anchored evidence tuple: the four-level locator plus the snippet.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EvidenceItem {
    /// Inline anchor name, e.g. `E1`.
    pub anchor: String,
    pub doc_id: String,
    pub chunk_id: String,
    pub section_path: Vec<String>,
    pub sentence_ids: Vec<String>,
    pub snippet: String,
}

/// One step of the reasoning chain.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReasoningStep {
    pub claim_id: String,
    pub text: String,
    /// Relation type that connected this claim to its parent in the chain.
    pub relation_to_parent: Option<String>,
}

/// Stage 7 response.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResponse {
    /// `None` when generation failed or was skipped; the retrieval fields
    /// are still populated.
    pub answer: Option<String>,
    pub themes: Vec<ThemeHit>,
    pub evidence: Vec<EvidenceItem>,
    pub reasoning_chain: Vec<ReasoningStep>,
    pub insufficient_evidence: bool,
}

/// Stage 7 service. Keeps the last successful theme recall as a fallback
/// for store outages.
pub struct QueryService {
    ctx: PipelineContext,
    last_good_themes: Mutex<Vec<ThemeHit>>,
    anchor: Regex,
}

impl QueryService {
    pub fn new(ctx: PipelineContext) -> Self {
        Self {
            ctx,
            last_good_themes: Mutex::new(Vec::new()),
            anchor: Regex::new(r"\[E(\d+)\]").expect("anchor regex"),
        }
    }

    /// Answer a question. Never fails on insufficient evidence; only
    /// infrastructure problems the fallbacks cannot absorb become errors.
    pub async fn answer(
        &self,
        question: &str,
        mode: QueryMode,
        top_k: usize,
    ) -> Result<QueryResponse, PipelineError> {
        let span = info_span!("evigraph.query", mode = ?mode, top_k);
        let _guard = span.enter();

        let question = question.trim();
        if question.is_empty() {
            return Err(PipelineError::Input("question is empty".into()));
        }
        let top_k = top_k.max(1);
        let thresholds = &self.ctx.governance.thresholds;

        self.ctx.checkpoint()?;
        let question_embedding = self
            .ctx
            .embedder
            .embed(&[question.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Embedding("empty embedding batch".into()))?;

        // ── Theme-first recall ──────────────────────────────────────────
        let themes = if mode == QueryMode::Local {
            Vec::new()
        } else {
            match self.recall_themes(&question_embedding, thresholds.retrieval_theme_top_n) {
                Ok(hits) => {
                    if !hits.is_empty() {
                        *self.last_good_themes.lock().unwrap() = hits.clone();
                    }
                    hits
                }
                Err(e) => {
                    warn!(error = %e, "theme recall failed, serving last-known-good themes");
                    self.last_good_themes.lock().unwrap().clone()
                }
            }
        };

        // ── Seeds: theme members + vector recall ────────────────────────
        let mut seeds: Vec<(String, f32)> = Vec::new();
        let mut chunk_hits: Vec<(String, f32)> = Vec::new();
        if mode != QueryMode::Global {
            for hit in &themes {
                if let Ok(Some(NodeBody::Theme(theme))) = self.ctx.store.get_node(&hit.theme_id) {
                    for member in theme.concept_ids.iter().chain(theme.claim_ids.iter()) {
                        seeds.push((member.clone(), hit.score * 0.8));
                    }
                }
            }
            let m = thresholds.retrieval_vector_top_m;
            if self.ctx.config.features.enable_vector_search {
                for (id, score) in self
                    .ctx
                    .store
                    .vector_search(NodeLabel::Claim, &question_embedding, m)
                    .map_err(PipelineError::store)?
                {
                    seeds.push((id, score));
                }
                chunk_hits = self
                    .ctx
                    .store
                    .vector_search(NodeLabel::Chunk, &question_embedding, m)
                    .map_err(PipelineError::store)?;
            }
        }

        // ── Graph expansion ─────────────────────────────────────────────
        let traversed = if seeds.is_empty() {
            Vec::new()
        } else {
            expand_scored(
                self.ctx.store.as_ref(),
                &seeds,
                thresholds.retrieval_max_hops,
                thresholds.retrieval_hop_decay,
                |kind| matches!(kind, EdgeKind::Claim(_) | EdgeKind::Concept(_)),
            )
            .map_err(PipelineError::store)?
        };

        // ── Reasoning chain & evidence assembly ─────────────────────────
        let mut reasoning_chain: Vec<ReasoningStep> = Vec::new();
        let mut evidence: Vec<EvidenceItem> = Vec::new();
        let mut seen_snippets: HashMap<String, usize> = HashMap::new();

        let mut claim_nodes = Vec::new();
        for node in &traversed {
            if let Ok(Some(NodeBody::Claim(claim))) = self.ctx.store.get_node(&node.node_id) {
                if claim.canonical_id.is_some() {
                    continue; // redirect shells never surface
                }
                claim_nodes.push((node.clone(), claim));
            }
            if claim_nodes.len() >= top_k {
                break;
            }
        }

        match mode {
            QueryMode::Global => {
                // Theme summaries alone; evidence comes from each theme's
                // strongest member claims so anchors stay resolvable.
                for hit in &themes {
                    if let Ok(Some(NodeBody::Theme(theme))) = self.ctx.store.get_node(&hit.theme_id)
                    {
                        for claim_id in theme.claim_ids.iter().take(2) {
                            if let Ok(Some(NodeBody::Claim(claim))) =
                                self.ctx.store.get_node(claim_id)
                            {
                                self.push_claim_evidence(
                                    &claim,
                                    &mut evidence,
                                    &mut seen_snippets,
                                    top_k,
                                )?;
                                reasoning_chain.push(ReasoningStep {
                                    claim_id: claim.id.clone(),
                                    text: claim.text.clone(),
                                    relation_to_parent: None,
                                });
                            }
                        }
                    }
                }
            }
            _ => {
                for (node, claim) in &claim_nodes {
                    self.push_claim_evidence(claim, &mut evidence, &mut seen_snippets, top_k)?;
                    reasoning_chain.push(ReasoningStep {
                        claim_id: claim.id.clone(),
                        text: claim.text.clone(),
                        relation_to_parent: node
                            .via
                            .as_ref()
                            .map(|(_, kind)| kind.as_str().to_string()),
                    });
                }
                // Vector-recalled chunks round out the evidence.
                for (chunk_id, _) in &chunk_hits {
                    if evidence.len() >= top_k {
                        break;
                    }
                    if let Ok(Some(NodeBody::Chunk(chunk))) = self.ctx.store.get_node(chunk_id) {
                        self.push_chunk_evidence(&chunk, None, &mut evidence, &mut seen_snippets);
                    }
                }
            }
        }

        if evidence.is_empty() {
            debug!("no evidence assembled, returning structured empty answer");
            return Ok(QueryResponse {
                answer: None,
                themes,
                evidence,
                reasoning_chain,
                insufficient_evidence: true,
            });
        }

        // ── Scoped generation with anchor validation ────────────────────
        let (answer, insufficient) = self
            .generate(question, &themes, &reasoning_chain, &evidence)
            .await;

        Ok(QueryResponse {
            answer,
            themes,
            evidence,
            reasoning_chain,
            insufficient_evidence: insufficient,
        })
    }

    fn recall_themes(
        &self,
        question_embedding: &[f32],
        top_n: usize,
    ) -> Result<Vec<ThemeHit>, PipelineError> {
        let hits = self
            .ctx
            .store
            .vector_search(NodeLabel::Theme, question_embedding, top_n)
            .map_err(PipelineError::store)?;
        let mut themes = Vec::new();
        for (id, score) in hits {
            if let Some(NodeBody::Theme(theme)) =
                self.ctx.store.get_node(&id).map_err(PipelineError::store)?
            {
                themes.push(ThemeHit {
                    theme_id: theme.id,
                    label: theme.label,
                    summary: theme.summary,
                    score,
                });
            }
        }
        Ok(themes)
    }

    /// Resolve a claim's `EVIDENCE_FROM` to its chunk and extract the
    /// minimal sentence window covering the claim's sentences.
    fn push_claim_evidence(
        &self,
        claim: &evigraph_core::Claim,
        evidence: &mut Vec<EvidenceItem>,
        seen: &mut HashMap<String, usize>,
        cap: usize,
    ) -> Result<(), PipelineError> {
        if evidence.len() >= cap.max(1) * 2 {
            return Ok(());
        }
        let edges = self
            .ctx
            .store
            .edges_from(&claim.id)
            .map_err(PipelineError::store)?;
        let Some(edge) = edges.iter().find(|e| e.kind == EdgeKind::EvidenceFrom) else {
            return Ok(());
        };
        if let Some(NodeBody::Chunk(chunk)) = self
            .ctx
            .store
            .get_node(&edge.dst)
            .map_err(PipelineError::store)?
        {
            self.push_chunk_evidence(&chunk, Some(&claim.sentence_ids), evidence, seen);
        }
        Ok(())
    }

    fn push_chunk_evidence(
        &self,
        chunk: &Chunk,
        sentence_ids: Option<&[String]>,
        evidence: &mut Vec<EvidenceItem>,
        seen: &mut HashMap<String, usize>,
    ) {
        let (snippet, covered) = minimal_sentence_window(chunk, sentence_ids);
        let max_chars = self.ctx.governance.thresholds.retrieval_max_context_chars;
        let snippet: String = snippet.chars().take(max_chars / 4).collect();

        let key = format!("{}|{}", chunk.id, covered.join(","));
        if seen.contains_key(&key) {
            return;
        }
        let anchor = format!("E{}", evidence.len() + 1);
        seen.insert(key, evidence.len());
        evidence.push(EvidenceItem {
            anchor,
            doc_id: chunk.doc_id.clone(),
            chunk_id: chunk.id.clone(),
            section_path: chunk.section_path.clone(),
            sentence_ids: covered,
            snippet,
        });
    }

    /// Generation with mandatory anchors: one strict retry, then the
    /// degraded structured answer.
    async fn generate(
        &self,
        question: &str,
        themes: &[ThemeHit],
        chain: &[ReasoningStep],
        evidence: &[EvidenceItem],
    ) -> (Option<String>, bool) {
        let theme_lines = themes
            .iter()
            .map(|t| format!("- {}: {}", t.label, t.summary))
            .collect::<Vec<_>>()
            .join("\n");
        let claim_lines = chain
            .iter()
            .map(|s| match &s.relation_to_parent {
                Some(rel) => format!("- ({rel}) {}", s.text),
                None => format!("- {}", s.text),
            })
            .collect::<Vec<_>>()
            .join("\n");
        let mut evidence_lines = String::new();
        for item in evidence {
            evidence_lines.push_str(&format!("[{}] {}\n", item.anchor, item.snippet));
            if evidence_lines.len() > self.ctx.governance.thresholds.retrieval_max_context_chars {
                break;
            }
        }

        let prompt = fill(
            &self.ctx.governance.prompts.answer,
            &[
                ("question", question),
                ("themes", theme_lines.as_str()),
                ("claims", claim_lines.as_str()),
                ("evidence", evidence_lines.as_str()),
            ],
        );

        for attempt in 0..2 {
            let mut messages = vec![
                ChatMessage::system("You answer strictly from the provided evidence."),
                ChatMessage::user(prompt.clone()),
            ];
            if attempt == 1 {
                messages.push(ChatMessage::user(
                    "Your previous answer was rejected: every sentence must end with a valid \
                     [En] anchor from the evidence list. Rewrite it."
                        .to_string(),
                ));
            }
            match self.ctx.llm.chat_completion(self.ctx.chat(messages)).await {
                Ok(response) => {
                    let text = response.text.trim().to_string();
                    if text == "INSUFFICIENT_EVIDENCE" || text.is_empty() {
                        return (None, true);
                    }
                    if self.anchors_valid(&text, evidence.len()) {
                        return (Some(text), false);
                    }
                    debug!(attempt, "answer rejected: missing or invalid anchors");
                }
                Err(PipelineError::Timeout(_)) | Err(PipelineError::Llm(_)) => {
                    // Structured retrieval result without prose.
                    return (None, false);
                }
                Err(_) => return (None, false),
            }
        }
        (None, true)
    }

    /// Every sentence must carry at least one anchor that references a
    /// returned evidence item.
    fn anchors_valid(&self, answer: &str, evidence_count: usize) -> bool {
        let sentences = split_sentences(answer);
        if sentences.is_empty() {
            return false;
        }
        sentences.iter().all(|sentence| {
            self.anchor.captures_iter(sentence).any(|caps| {
                caps[1]
                    .parse::<usize>()
                    .map(|n| n >= 1 && n <= evidence_count)
                    .unwrap_or(false)
            })
        })
    }
}

/// The smallest run of chunk sentences covering the given sentence ids.
/// Without ids, the whole chunk text is the snippet.
fn minimal_sentence_window(
    chunk: &Chunk,
    sentence_ids: Option<&[String]>,
) -> (String, Vec<String>) {
    let Some(wanted) = sentence_ids.filter(|ids| !ids.is_empty()) else {
        return (chunk.text.clone(), chunk.sentence_ids.clone());
    };
    let positions: Vec<usize> = wanted
        .iter()
        .filter_map(|sid| chunk.sentence_ids.iter().position(|c| c == sid))
        .collect();
    if positions.is_empty() {
        return (chunk.text.clone(), chunk.sentence_ids.clone());
    }
    let first = *positions.iter().min().unwrap();
    let last = *positions.iter().max().unwrap();

    let sentences = split_sentences(&chunk.text);
    if last < sentences.len() {
        let snippet = sentences[first..=last].join(" ");
        let covered = chunk.sentence_ids[first..=last].to_vec();
        (snippet, covered)
    } else {
        (chunk.text.clone(), chunk.sentence_ids.clone())
    }
}

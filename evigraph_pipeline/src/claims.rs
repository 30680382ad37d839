//! Stage 3: claim extraction.
//!
//! Slides a sentence window (wider than the chunker's) over each chunk and
//! asks the LLM for atomic claims plus inter-claim relations, schema-checked
//! through serde. A parse failure earns one repair retry; a second failure
//! drops the window, never the chunk. Modality is detected lexically before
//! the call and sent as a hint. CONTRADICTS/CAUSES relations pass the NLI
//! check or are dropped; relation types outside the closed set never
//! survive.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info_span, warn};

use evigraph_core::ids;
use evigraph_core::types::{
    Chunk, Claim, ClaimId, ClaimRelationKind, ClaimType, Modality, Polarity,
};

use evigraph_config::prompts::fill;

use crate::align::align_evidence;
use crate::chunker::split_sentences;
use crate::error::PipelineError;
use crate::nli::NliVerifier;
use crate::{ChatMessage, PipelineContext};

/// A verified inter-claim relation.
#[derive(Debug, Clone)]
pub struct ClaimRelation {
    pub source_id: ClaimId,
    pub target_id: ClaimId,
    pub kind: ClaimRelationKind,
    pub confidence: f32,
}

/// Stage 3 output for one chunk.
#[derive(Debug, Default)]
pub struct ClaimExtraction {
    pub claims: Vec<Claim>,
    pub relations: Vec<ClaimRelation>,
    /// Windows dropped after the repair retry also failed.
    pub dropped_windows: usize,
    /// Relations dropped by NLI or an out-of-vocabulary type.
    pub dropped_relations: usize,
}

// -- LLM schema -------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawExtraction {
    #[serde(default)]
    claims: Vec<RawClaim>,
    #[serde(default)]
    relations: Vec<RawRelation>,
}

#[derive(Debug, Deserialize)]
struct RawClaim {
    text: String,
    #[serde(default)]
    claim_type: Option<String>,
    #[serde(default)]
    modality: Option<String>,
    #[serde(default)]
    polarity: Option<String>,
    #[serde(default = "default_certainty")]
    certainty: f32,
    #[serde(default)]
    sentence_indices: Vec<usize>,
    #[serde(default)]
    evidence_quote: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRelation {
    source: usize,
    target: usize,
    relation_type: String,
    #[serde(default = "default_certainty")]
    confidence: f32,
}

fn default_certainty() -> f32 {
    0.5
}

/// Stage 3 extractor.
pub struct ClaimExtractor<'a> {
    ctx: &'a PipelineContext,
}

impl<'a> ClaimExtractor<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx }
    }

    /// Extract claims and relations from one chunk.
    pub async fn extract(&self, chunk: &Chunk) -> Result<ClaimExtraction, PipelineError> {
        let span = info_span!("evigraph.claims", chunk_id = %chunk.id);
        let _guard = span.enter();

        let thresholds = &self.ctx.governance.thresholds;
        let sentences = split_sentences(&chunk.text);
        if sentences.is_empty() {
            return Ok(ClaimExtraction::default());
        }

        let window = thresholds.claim_window_sentences.max(1);
        let stride = thresholds.claim_stride.max(1);

        let mut out = ClaimExtraction::default();
        // Claim id → index into out.claims, for cross-window dedup and
        // relation wiring.
        let mut by_id: HashMap<ClaimId, usize> = HashMap::new();

        let mut start = 0usize;
        loop {
            let end = (start + window).min(sentences.len());
            self.ctx.checkpoint()?;
            self.extract_window(chunk, &sentences[start..end], start, &mut out, &mut by_id)
                .await?;
            if end == sentences.len() {
                break;
            }
            start += stride;
        }

        debug!(
            chunk_id = %chunk.id,
            claims = out.claims.len(),
            relations = out.relations.len(),
            dropped_windows = out.dropped_windows,
            "claim extraction complete"
        );
        Ok(out)
    }

    async fn extract_window(
        &self,
        chunk: &Chunk,
        window: &[String],
        window_offset: usize,
        out: &mut ClaimExtraction,
        by_id: &mut HashMap<ClaimId, usize>,
    ) -> Result<(), PipelineError> {
        let passage = window
            .iter()
            .enumerate()
            .map(|(i, s)| format!("[{i}] {s}"))
            .collect::<Vec<_>>()
            .join("\n");
        let window_text = window.join(" ");
        let modality_hint = detect_modality(&window_text);

        let prompt = fill(
            &self.ctx.governance.prompts.claim_extraction,
            &[
                ("passage", passage.as_str()),
                ("modality_hint", modality_hint.as_wire_str()),
            ],
        );

        let raw = match self.call_with_repair(&prompt).await? {
            Some(raw) => raw,
            None => {
                out.dropped_windows += 1;
                return Ok(());
            }
        };

        // Window-relative index → claim id, for relation wiring.
        let mut index_to_id: HashMap<usize, ClaimId> = HashMap::new();

        for (idx, raw_claim) in raw.claims.into_iter().enumerate() {
            let text = raw_claim.text.trim().to_string();
            if text.chars().count() < 8 {
                debug!("skipping degenerate claim: {text:?}");
                continue;
            }
            let hash = ids::claim_text_hash(&text);
            let id = ids::claim_id(&chunk.doc_id, &hash);
            index_to_id.insert(idx, id.clone());

            let sentence_ids = if raw_claim.sentence_indices.is_empty() {
                window_sentence_ids(chunk, window_offset, window.len())
            } else {
                raw_claim
                    .sentence_indices
                    .iter()
                    .filter_map(|i| chunk.sentence_ids.get(window_offset + i))
                    .cloned()
                    .collect()
            };

            if let Some(&existing) = by_id.get(&id) {
                // Same normalized text seen in an earlier window: union the
                // evidence, keep one claim.
                let claim = &mut out.claims[existing];
                for sid in sentence_ids {
                    if !claim.sentence_ids.contains(&sid) {
                        claim.sentence_ids.push(sid);
                    }
                }
                continue;
            }

            let evidence_span = align_evidence(
                &text,
                &chunk.text,
                raw_claim.evidence_quote.as_deref(),
                self.ctx.governance.thresholds.claim_evidence_min_match,
            )
            .map(|(span, _)| span);

            let claim = Claim {
                id: id.clone(),
                text: text.clone(),
                normalized_text_hash: hash,
                canonical_id: None,
                doc_id: chunk.doc_id.clone(),
                chunk_id: chunk.id.clone(),
                sentence_ids,
                section_path: chunk.section_path.clone(),
                claim_type: parse_claim_type(raw_claim.claim_type.as_deref()),
                modality: raw_claim
                    .modality
                    .as_deref()
                    .and_then(parse_modality)
                    .unwrap_or(modality_hint),
                polarity: raw_claim
                    .polarity
                    .as_deref()
                    .and_then(parse_polarity)
                    .unwrap_or_else(|| detect_polarity(&text)),
                certainty: raw_claim.certainty.clamp(0.0, 1.0),
                confidence: raw_claim.certainty.clamp(0.0, 1.0).max(0.5),
                evidence_span,
                embedding: None,
                build_version: chunk.build_version.clone(),
            };
            by_id.insert(id, out.claims.len());
            out.claims.push(claim);
        }

        // Relations: indices → ids, closed vocabulary, NLI gate.
        let verifier = NliVerifier::new(self.ctx);
        for raw_relation in raw.relations {
            let (Some(source_id), Some(target_id)) = (
                index_to_id.get(&raw_relation.source),
                index_to_id.get(&raw_relation.target),
            ) else {
                debug!("relation references unknown claim index, dropped");
                out.dropped_relations += 1;
                continue;
            };
            if source_id == target_id {
                out.dropped_relations += 1;
                continue;
            }
            let Some(kind) = ClaimRelationKind::parse(raw_relation.relation_type.trim()) else {
                debug!(
                    relation_type = %raw_relation.relation_type,
                    "relation type outside the closed set, dropped"
                );
                out.dropped_relations += 1;
                continue;
            };

            if matches!(
                kind,
                ClaimRelationKind::Contradicts | ClaimRelationKind::Causes
            ) {
                let source_text = &out.claims[by_id[source_id]].text;
                let target_text = &out.claims[by_id[target_id]].text;
                let keep = verifier
                    .verify_relation(source_text, target_text, kind, Some(&window_text))
                    .await?;
                if !keep {
                    out.dropped_relations += 1;
                    continue;
                }
            }

            // One relation per (source, kind, target).
            if out.relations.iter().any(|r| {
                r.source_id == *source_id && r.target_id == *target_id && r.kind == kind
            }) {
                continue;
            }
            out.relations.push(ClaimRelation {
                source_id: source_id.clone(),
                target_id: target_id.clone(),
                kind,
                confidence: raw_relation.confidence.clamp(0.0, 1.0),
            });
        }
        Ok(())
    }

    /// One extraction call plus one repair retry. `None` means the window is
    /// dropped.
    async fn call_with_repair(&self, prompt: &str) -> Result<Option<RawExtraction>, PipelineError> {
        let request = self.ctx.chat(vec![
            ChatMessage::system(
                "You extract claims from documents. Respond with strict JSON only.",
            ),
            ChatMessage::user(prompt.to_string()),
        ]);
        let first = self.ctx.llm.chat_completion(request).await?;
        let first_error = match parse_extraction(&first.text) {
            Ok(raw) => return Ok(Some(raw)),
            Err(e) => e,
        };

        self.ctx.checkpoint()?;
        let repair_prompt = fill(
            &self.ctx.governance.prompts.claim_repair,
            &[
                ("error", first_error.as_str()),
                ("previous", first.text.as_str()),
            ],
        );
        let request = self.ctx.chat(vec![
            ChatMessage::system("Fix the JSON. Respond with strict JSON only."),
            ChatMessage::user(repair_prompt),
        ]);
        let second = self.ctx.llm.chat_completion(request).await?;
        match parse_extraction(&second.text) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) => {
                warn!(error = %e, "claim window dropped after repair retry");
                Ok(None)
            }
        }
    }
}

fn window_sentence_ids(chunk: &Chunk, offset: usize, len: usize) -> Vec<String> {
    (offset..offset + len)
        .filter_map(|i| chunk.sentence_ids.get(i))
        .cloned()
        .collect()
}

fn parse_extraction(text: &str) -> Result<RawExtraction, String> {
    let json = extract_json_object(text).ok_or_else(|| "no JSON object in response".to_string())?;
    serde_json::from_str(&json).map_err(|e| e.to_string())
}

/// Pull the outermost JSON object out of a response that may carry fences or
/// prose around it.
pub(crate) fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(text[start..=end].to_string())
}

fn parse_claim_type(raw: Option<&str>) -> ClaimType {
    match raw.map(|s| s.trim().to_lowercase()).as_deref() {
        Some("hypothesis") => ClaimType::Hypothesis,
        Some("conclusion") => ClaimType::Conclusion,
        _ => ClaimType::Fact,
    }
}

fn parse_modality(raw: &str) -> Option<Modality> {
    match raw.trim().to_lowercase().as_str() {
        "assertive" => Some(Modality::Assertive),
        "hedged" => Some(Modality::Hedged),
        "speculative" => Some(Modality::Speculative),
        _ => None,
    }
}

fn parse_polarity(raw: &str) -> Option<Polarity> {
    match raw.trim().to_lowercase().as_str() {
        "positive" => Some(Polarity::Positive),
        "negative" => Some(Polarity::Negative),
        _ => None,
    }
}

const SPECULATIVE_CUES: &[&str] = &[
    "可能", "或许", "也许", "推测", "猜测", "might", "may ", "could ", "perhaps", "possibly",
];
const HEDGED_CUES: &[&str] = &[
    "似乎", "好像", "据说", "倾向", "大概", "appears", "seems", "suggests", "likely", "arguably",
];
const NEGATIVE_CUES: &[&str] = &[
    "不", "没有", "并非", "无法", "not ", "no ", "never", "cannot", "fails to",
];

/// Lexical modality pre-detection; sent to the LLM as a hint and used as the
/// fallback when the model omits the field.
pub fn detect_modality(text: &str) -> Modality {
    let lower = text.to_lowercase();
    if SPECULATIVE_CUES.iter().any(|c| lower.contains(c)) {
        Modality::Speculative
    } else if HEDGED_CUES.iter().any(|c| lower.contains(c)) {
        Modality::Hedged
    } else {
        Modality::Assertive
    }
}

fn detect_polarity(text: &str) -> Polarity {
    let lower = text.to_lowercase();
    if NEGATIVE_CUES.iter().any(|c| lower.contains(c)) {
        Polarity::Negative
    } else {
        Polarity::Positive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChatRequest, ChatResponse, EmbeddingClient, LlmClient, TokenUsage};
    use async_trait::async_trait;
    use evigraph_config::{EvigraphConfig, GovernanceConfig};
    use evigraph_core::{AliasDictionary, MemoryGraph};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct SequencedLlm {
        replies: Vec<String>,
        cursor: AtomicUsize,
    }

    impl SequencedLlm {
        fn new(replies: Vec<&str>) -> Self {
            Self {
                replies: replies.into_iter().map(String::from).collect(),
                cursor: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LlmClient for SequencedLlm {
        async fn chat_completion(&self, _: ChatRequest) -> Result<ChatResponse, PipelineError> {
            let i = self.cursor.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .get(i)
                .cloned()
                .unwrap_or_else(|| self.replies.last().cloned().unwrap_or_default());
            Ok(ChatResponse {
                text: reply,
                usage: TokenUsage::default(),
            })
        }
    }

    struct NullEmbedder;

    #[async_trait]
    impl EmbeddingClient for NullEmbedder {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
        fn dim(&self) -> usize {
            4
        }
    }

    fn ctx(llm: SequencedLlm) -> PipelineContext {
        PipelineContext {
            config: Arc::new(EvigraphConfig::default()),
            governance: Arc::new(GovernanceConfig::default()),
            llm: Arc::new(llm),
            embedder: Arc::new(NullEmbedder),
            store: Arc::new(MemoryGraph::new()),
            aliases: AliasDictionary::new(),
            cancel: CancellationToken::new(),
        }
    }

    fn chunk(text: &str) -> Chunk {
        let n = split_sentences(text).len();
        Chunk {
            id: "chunk_1".into(),
            doc_id: "doc_1".into(),
            chunk_index: 0,
            text: text.into(),
            resolved_text: None,
            section_path: vec!["Intro".into()],
            page_num: None,
            sentence_ids: (0..n).map(|i| format!("doc_1:s{i}")).collect(),
            window_start: 0,
            window_end: n.saturating_sub(1),
            embedding: None,
            build_version: "v1".into(),
        }
    }

    const GOOD_REPLY: &str = r#"{
        "claims": [
            {
                "text": "Transformer is a neural-network architecture based on self-attention",
                "claim_type": "fact",
                "modality": "assertive",
                "polarity": "positive",
                "certainty": 0.95,
                "sentence_indices": [0],
                "evidence_quote": "Transformer is a neural-network architecture based on self-attention"
            },
            {
                "text": "Self-attention enables parallel training because recurrence is removed",
                "claim_type": "conclusion",
                "certainty": 0.8,
                "sentence_indices": [1]
            }
        ],
        "relations": [
            {"source": 1, "target": 0, "relation_type": "SUPPORTS", "confidence": 0.85}
        ]
    }"#;

    const SOURCE_TEXT: &str = "Transformer is a neural-network architecture based on self-attention. \
         Because recurrence is removed, self-attention enables parallel training.";

    #[tokio::test]
    async fn extracts_claims_and_relations() {
        let ctx = ctx(SequencedLlm::new(vec![GOOD_REPLY]));
        let extraction = ClaimExtractor::new(&ctx).extract(&chunk(SOURCE_TEXT)).await.unwrap();

        assert_eq!(extraction.claims.len(), 2);
        assert_eq!(extraction.relations.len(), 1);
        let first = &extraction.claims[0];
        assert_eq!(first.claim_type, ClaimType::Fact);
        assert_eq!(first.sentence_ids, vec!["doc_1:s0"]);
        assert!(first.evidence_span.is_some());
        assert_eq!(first.section_path, vec!["Intro"]);
        assert_eq!(extraction.relations[0].kind, ClaimRelationKind::Supports);
    }

    #[tokio::test]
    async fn repair_retry_recovers_bad_json() {
        let ctx = ctx(SequencedLlm::new(vec!["sorry, here is prose", GOOD_REPLY]));
        let extraction = ClaimExtractor::new(&ctx).extract(&chunk(SOURCE_TEXT)).await.unwrap();
        assert_eq!(extraction.claims.len(), 2);
        assert_eq!(extraction.dropped_windows, 0);
    }

    #[tokio::test]
    async fn second_failure_drops_window_without_failing_chunk() {
        let ctx = ctx(SequencedLlm::new(vec!["prose", "more prose"]));
        let extraction = ClaimExtractor::new(&ctx).extract(&chunk(SOURCE_TEXT)).await.unwrap();
        assert!(extraction.claims.is_empty());
        assert_eq!(extraction.dropped_windows, 1);
    }

    #[tokio::test]
    async fn out_of_vocabulary_relation_is_dropped() {
        let reply = r#"{
            "claims": [
                {"text": "Claim number one is stated here", "certainty": 0.9, "sentence_indices": [0]},
                {"text": "Claim number two is stated here", "certainty": 0.9, "sentence_indices": [1]}
            ],
            "relations": [
                {"source": 0, "target": 1, "relation_type": "PURPOSE", "confidence": 0.9}
            ]
        }"#;
        let ctx = ctx(SequencedLlm::new(vec![reply]));
        let extraction = ClaimExtractor::new(&ctx).extract(&chunk(SOURCE_TEXT)).await.unwrap();
        assert_eq!(extraction.claims.len(), 2);
        assert!(extraction.relations.is_empty());
        assert_eq!(extraction.dropped_relations, 1);
    }

    #[tokio::test]
    async fn causes_without_marker_is_dropped_by_nli_gate() {
        let reply = r#"{
            "claims": [
                {"text": "Attention mechanisms are popular today", "certainty": 0.9, "sentence_indices": [0]},
                {"text": "Models score well on benchmarks", "certainty": 0.9, "sentence_indices": [1]}
            ],
            "relations": [
                {"source": 0, "target": 1, "relation_type": "CAUSES", "confidence": 0.9}
            ]
        }"#;
        let ctx = ctx(SequencedLlm::new(vec![reply]));
        let text = "Attention mechanisms are popular today. Models score well on benchmarks.";
        let extraction = ClaimExtractor::new(&ctx).extract(&chunk(text)).await.unwrap();
        assert!(extraction.relations.is_empty());
        assert_eq!(extraction.dropped_relations, 1);
    }

    #[tokio::test]
    async fn duplicate_claim_text_shares_one_id() {
        let reply = r#"{
            "claims": [
                {"text": "Graphs store relational facts", "certainty": 0.7, "sentence_indices": [0]},
                {"text": "graphs store relational facts.", "certainty": 0.9, "sentence_indices": [1]}
            ],
            "relations": []
        }"#;
        let ctx = ctx(SequencedLlm::new(vec![reply]));
        let extraction = ClaimExtractor::new(&ctx).extract(&chunk(SOURCE_TEXT)).await.unwrap();
        assert_eq!(extraction.claims.len(), 1);
        // Evidence from both raw claims was unioned.
        assert_eq!(extraction.claims[0].sentence_ids.len(), 2);
    }

    #[test]
    fn modality_detection_ladder() {
        assert_eq!(detect_modality("结果可能有偏差"), Modality::Speculative);
        assert_eq!(detect_modality("The data suggests a trend"), Modality::Hedged);
        assert_eq!(detect_modality("The sky is blue."), Modality::Assertive);
    }

    #[test]
    fn json_extraction_tolerates_fences_and_prose() {
        let text = "Here you go:\n```json\n{\"claims\": []}\n```\nHope that helps.";
        assert_eq!(extract_json_object(text).unwrap(), "{\"claims\": []}");
        assert!(extract_json_object("no json at all").is_none());
    }

    #[test]
    fn empty_chunk_text_yields_nothing() {
        // split_sentences of empty text is empty; extract() short-circuits
        // before any LLM call.
        assert!(split_sentences("   ").is_empty());
    }
}

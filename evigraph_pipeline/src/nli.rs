//! Lightweight natural-language-inference checks for proposed claim
//! relations.
//!
//! CAUSES must show an explicit causal/temporal signal before we even ask
//! the model; CONTRADICTS is rejected when the premise plainly entails the
//! hypothesis (the two claims agree). Verdicts aggregate up to two judge
//! calls; a judge that fails to answer is neutral, not fatal.

use serde::Deserialize;
use tracing::debug;

use evigraph_core::types::ClaimRelationKind;

use crate::error::PipelineError;
use crate::{ChatMessage, PipelineContext};
use evigraph_config::prompts::fill;

/// NLI label space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NliLabel {
    Entailment,
    Contradiction,
    Neutral,
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    label: NliLabel,
    #[serde(default = "default_confidence")]
    confidence: f32,
}

fn default_confidence() -> f32 {
    0.5
}

/// Judge verdict after aggregation.
#[derive(Debug, Clone, Copy)]
pub struct NliVerdict {
    pub label: NliLabel,
    pub confidence: f32,
}

const CAUSAL_MARKERS: &[&str] = &[
    "因为", "由于", "导致", "因此", "所以", "使得", "引起", "造成", "从而",
    "because", "therefore", "leads to", "lead to", "causes", "caused", "results in",
    "resulting in", "due to", "consequently", "as a result",
];

/// Relation verifier over the configured judge prompt.
pub struct NliVerifier<'a> {
    ctx: &'a PipelineContext,
    judge_calls: usize,
}

impl<'a> NliVerifier<'a> {
    pub fn new(ctx: &'a PipelineContext) -> Self {
        Self { ctx, judge_calls: 2 }
    }

    /// Whether a proposed relation survives verification.
    ///
    /// Returns `Ok(false)` for relations that should be dropped; only
    /// infrastructure failures become errors (and callers treat those as a
    /// keep-with-lower-confidence signal, never a chunk failure).
    pub async fn verify_relation(
        &self,
        source_text: &str,
        target_text: &str,
        kind: ClaimRelationKind,
        context: Option<&str>,
    ) -> Result<bool, PipelineError> {
        // CAUSES needs an explicit signal phrase somewhere in the evidence.
        if kind == ClaimRelationKind::Causes {
            let haystack = format!(
                "{} {} {}",
                source_text,
                target_text,
                context.unwrap_or_default()
            )
            .to_lowercase();
            if !CAUSAL_MARKERS.iter().any(|m| haystack.contains(m)) {
                debug!("CAUSES relation without causal marker dropped");
                return Ok(false);
            }
        }

        let premise = match context {
            Some(c) => format!("{c}\n\n{source_text}"),
            None => source_text.to_string(),
        };
        let hypothesis = match kind {
            // For CONTRADICTS the judge scores agreement with the target;
            // entailment means the claims agree, so the contradiction fails.
            ClaimRelationKind::Contradicts => target_text.to_string(),
            ClaimRelationKind::Supports => format!("{source_text} supports: {target_text}"),
            ClaimRelationKind::Causes => format!("{source_text} causes: {target_text}"),
            ClaimRelationKind::ComparesWith => {
                format!("{source_text} is being compared with: {target_text}")
            }
            ClaimRelationKind::Conditions => format!("if {source_text}, then {target_text}"),
        };

        let verdict = self.judge(&premise, &hypothesis).await?;
        let ok = match kind {
            ClaimRelationKind::Contradicts => {
                !(verdict.label == NliLabel::Entailment && verdict.confidence >= 0.6)
            }
            _ => verdict.label == NliLabel::Entailment,
        };
        Ok(ok)
    }

    /// Aggregate up to `judge_calls` verdicts: majority label, averaged
    /// confidence. All-failed yields neutral.
    async fn judge(&self, premise: &str, hypothesis: &str) -> Result<NliVerdict, PipelineError> {
        let prompt = fill(
            &self.ctx.governance.prompts.nli_verify,
            &[("premise", premise), ("hypothesis", hypothesis)],
        );

        let mut verdicts: Vec<RawVerdict> = Vec::new();
        for _ in 0..self.judge_calls {
            self.ctx.checkpoint()?;
            let request = self.ctx.chat(vec![
                ChatMessage::system("You are a strict NLI judge. Answer with JSON only."),
                ChatMessage::user(prompt.clone()),
            ]);
            match self.ctx.llm.chat_completion(request).await {
                Ok(response) => match parse_verdict(&response.text) {
                    Some(v) => verdicts.push(v),
                    None => debug!("unparseable NLI verdict ignored"),
                },
                Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                Err(e) => debug!(error = %e, "NLI judge call failed"),
            }
        }

        if verdicts.is_empty() {
            return Ok(NliVerdict {
                label: NliLabel::Neutral,
                confidence: 0.5,
            });
        }

        let count = |label: NliLabel| verdicts.iter().filter(|v| v.label == label).count();
        let winner = [NliLabel::Entailment, NliLabel::Contradiction, NliLabel::Neutral]
            .into_iter()
            .max_by_key(|l| count(*l))
            .unwrap_or(NliLabel::Neutral);
        let confidence =
            verdicts.iter().map(|v| v.confidence).sum::<f32>() / verdicts.len() as f32;
        Ok(NliVerdict {
            label: winner,
            confidence: confidence.clamp(0.0, 1.0),
        })
    }
}

/// Parse a verdict, tolerating fenced or prefixed JSON.
fn parse_verdict(text: &str) -> Option<RawVerdict> {
    crate::claims::extract_json_object(text)
        .and_then(|json| serde_json::from_str::<RawVerdict>(&json).ok())
        .map(|mut v| {
            v.confidence = v.confidence.clamp(0.0, 1.0);
            v
        })
}

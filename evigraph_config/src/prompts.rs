//! LLM prompt templates.
//!
//! Templates live in `prompts.yaml` so they can evolve without a rebuild;
//! the defaults here keep the pipeline functional out of the box. Rendering
//! is plain `{name}` substitution, no templating engine.

use serde::{Deserialize, Serialize};

/// All prompt templates used by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplates {
    /// Stage 3: claim extraction over a sentence window.
    #[serde(default = "default_claim_extraction")]
    pub claim_extraction: String,
    /// Stage 3: repair prompt after a JSON parse failure.
    #[serde(default = "default_claim_repair")]
    pub claim_repair: String,
    /// Stage 3: NLI verification of a proposed relation.
    #[serde(default = "default_nli_verify")]
    pub nli_verify: String,
    /// Stage 4: theme label and summary generation.
    #[serde(default = "default_theme_summary")]
    pub theme_summary: String,
    /// Stage 7: scoped answer generation with inline anchors.
    #[serde(default = "default_answer")]
    pub answer: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            claim_extraction: default_claim_extraction(),
            claim_repair: default_claim_repair(),
            nli_verify: default_nli_verify(),
            theme_summary: default_theme_summary(),
            answer: default_answer(),
        }
    }
}

/// Substitute `{name}` placeholders. Unknown placeholders are left intact.
pub fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

fn default_claim_extraction() -> String {
    r#"Extract the author's atomic claims from the passage below.

Passage (sentences are numbered from 0):
{passage}

Modality hint from lexical analysis: {modality_hint}

Return strict JSON:
{
  "claims": [
    {
      "text": "one atomic proposition",
      "claim_type": "fact" | "hypothesis" | "conclusion",
      "modality": "assertive" | "hedged" | "speculative",
      "polarity": "positive" | "negative",
      "certainty": 0.0-1.0,
      "sentence_indices": [0, 1],
      "evidence_quote": "minimal verbatim span the claim rests on"
    }
  ],
  "relations": [
    {
      "source": 0,
      "target": 1,
      "relation_type": "SUPPORTS" | "CONTRADICTS" | "CAUSES" | "COMPARES_WITH" | "CONDITIONS",
      "confidence": 0.0-1.0
    }
  ]
}
Indices in "relations" refer to positions in "claims". Output JSON only."#
        .to_string()
}

fn default_claim_repair() -> String {
    r#"The previous response was not valid JSON for the requested schema.
Error: {error}

Previous response:
{previous}

Re-emit the same content as strict JSON matching the schema exactly. Output JSON only."#
        .to_string()
}

fn default_nli_verify() -> String {
    r#"You are a natural-language-inference judge. Decide whether the premise entails the hypothesis.

Premise:
{premise}

Hypothesis:
{hypothesis}

Return strict JSON: {"label": "entailment" | "contradiction" | "neutral", "confidence": 0.0-1.0}"#
        .to_string()
}

fn default_theme_summary() -> String {
    r#"The following concepts and claims form one topical community in a knowledge graph.

Top concepts:
{concepts}

Sample claims:
{claims}

Return strict JSON: {"label": "2-5 word topic label", "summary": "3-5 sentence summary of what unites these members"}"#
        .to_string()
}

fn default_answer() -> String {
    r#"Answer the question using ONLY the evidence below.

Question: {question}

Themes:
{themes}

Reasoning-chain claims:
{claims}

Evidence snippets (cite by anchor):
{evidence}

Rules:
- Every sentence of the answer MUST end with at least one anchor like [E1] referring to an evidence snippet.
- Do not introduce facts that are not in the evidence.
- If the evidence is insufficient, answer exactly: INSUFFICIENT_EVIDENCE"#
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_substitutes_known_placeholders() {
        let out = fill("ask {question} about {topic}", &[("question", "what"), ("topic", "x")]);
        assert_eq!(out, "ask what about x");
    }

    #[test]
    fn fill_leaves_unknown_placeholders() {
        let out = fill("{a} {b}", &[("a", "1")]);
        assert_eq!(out, "1 {b}");
    }

    #[test]
    fn defaults_mention_their_contract() {
        let prompts = PromptTemplates::default();
        assert!(prompts.claim_extraction.contains("sentence_indices"));
        assert!(prompts.answer.contains("INSUFFICIENT_EVIDENCE"));
        assert!(prompts.nli_verify.contains("entailment"));
    }

    #[test]
    fn yaml_overrides_single_template() {
        let prompts: PromptTemplates =
            serde_yaml::from_str("answer: \"custom {question}\"").unwrap();
        assert_eq!(prompts.answer, "custom {question}");
        assert!(prompts.claim_extraction.contains("claims"));
    }
}

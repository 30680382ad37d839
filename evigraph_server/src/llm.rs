//! Provider clients: OpenAI-compatible chat completions and embeddings over
//! reqwest, plus the deterministic mock providers used in development and
//! tests.
//!
//! The pipeline sees only the `LlmClient` / `EmbeddingClient` traits; which
//! implementation backs them is a deployment decision.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::debug;

use evigraph_config::EvigraphConfig;
use evigraph_pipeline::{
    ChatRequest, ChatResponse, EmbeddingClient, LlmClient, PipelineError, TokenUsage,
};

// ---------------------------------------------------------------------------
// OpenAI-compatible chat client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct WireChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct WireChoiceMessage {
    content: String,
}

#[derive(Debug, Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatLlm {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiCompatLlm {
    pub fn from_config(config: &EvigraphConfig) -> Self {
        let api_key = std::env::var(&config.llm.api_key_env).unwrap_or_default();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm.request_timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: config.llm.base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", self.api_key)) {
            headers.insert(AUTHORIZATION, value);
        }
        headers
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatLlm {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        let wire = WireChatRequest {
            model: &request.model,
            messages: request
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .headers(self.headers())
            .json(&wire)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Timeout("llm request".into())
                } else {
                    PipelineError::Llm(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(PipelineError::Llm(format!(
                "provider returned {}",
                response.status()
            )));
        }
        let parsed: WireChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Llm(format!("malformed provider response: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| PipelineError::Llm("provider returned no choices".into()))?;
        let usage = parsed.usage.unwrap_or_default();
        debug!(
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            "chat completion"
        );
        Ok(ChatResponse {
            text,
            usage: TokenUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        })
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible embeddings client
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct WireEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingResponse {
    data: Vec<WireEmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingRow {
    embedding: Vec<f32>,
    index: usize,
}

/// Embeddings client for any OpenAI-compatible endpoint.
pub struct OpenAiCompatEmbedder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dim: usize,
}

impl OpenAiCompatEmbedder {
    pub fn from_config(config: &EvigraphConfig) -> Self {
        let api_key = std::env::var(&config.embedding.api_key_env).unwrap_or_default();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.llm.request_timeout_secs))
            .build()
            .expect("reqwest client");
        Self {
            client,
            base_url: config.embedding.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.embedding.model.clone(),
            dim: config.embedding.dim,
        }
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiCompatEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header(CONTENT_TYPE, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
            .json(&WireEmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|e| PipelineError::Embedding(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PipelineError::Embedding(format!(
                "provider returned {}",
                response.status()
            )));
        }
        let mut parsed: WireEmbeddingResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Embedding(format!("malformed response: {e}")))?;
        parsed.data.sort_by_key(|row| row.index);
        if parsed.data.len() != texts.len() {
            return Err(PipelineError::Embedding(format!(
                "provider returned {} vectors for {} inputs",
                parsed.data.len(),
                texts.len()
            )));
        }
        Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

// ---------------------------------------------------------------------------
// Deterministic mock providers
// ---------------------------------------------------------------------------

/// Offline LLM: recognizes the pipeline's prompt families and answers each
/// with minimal well-formed output. Deterministic, no network.
pub struct MockLlm;

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat_completion(&self, request: ChatRequest) -> Result<ChatResponse, PipelineError> {
        let prompt = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let text = if prompt.contains("atomic claims") {
            // First numbered sentence of the passage becomes one fact claim.
            let first_sentence = prompt
                .lines()
                .find(|l| l.trim_start().starts_with("[0]"))
                .map(|l| l.trim_start().trim_start_matches("[0]").trim())
                .unwrap_or("")
                .trim_end_matches(['。', '.', '!', '?', '！', '？'])
                .to_string();
            if first_sentence.chars().count() < 8 {
                r#"{"claims": [], "relations": []}"#.to_string()
            } else {
                serde_json::json!({
                    "claims": [{
                        "text": first_sentence,
                        "claim_type": "fact",
                        "modality": "assertive",
                        "polarity": "positive",
                        "certainty": 0.8,
                        "sentence_indices": [0],
                        "evidence_quote": first_sentence
                    }],
                    "relations": []
                })
                .to_string()
            }
        } else if prompt.contains("topical community") {
            let label = prompt
                .lines()
                .find(|l| l.trim_start().starts_with("- "))
                .and_then(|l| l.trim_start()[2..].split(':').next())
                .unwrap_or("Topic")
                .trim()
                .to_string();
            serde_json::json!({
                "label": label,
                "summary": format!("A community of related material around {label}.")
            })
            .to_string()
        } else if prompt.contains("natural-language-inference") {
            r#"{"label": "entailment", "confidence": 0.7}"#.to_string()
        } else if prompt.contains("cite by anchor") {
            // Echo the first evidence snippet with its anchor.
            prompt
                .lines()
                .find(|l| l.trim_start().starts_with("[E1]"))
                .map(|l| {
                    let snippet = l.trim_start().trim_start_matches("[E1]").trim();
                    format!("{snippet} [E1].")
                })
                .unwrap_or_else(|| "INSUFFICIENT_EVIDENCE".to_string())
        } else {
            "{}".to_string()
        };

        Ok(ChatResponse {
            text,
            usage: TokenUsage::default(),
        })
    }
}

/// Offline embedder: hash-seeded unit vectors of the configured dimension.
/// Equal texts always map to equal vectors.
pub struct MockEmbedder {
    dim: usize,
}

impl MockEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(2) }
    }
}

#[async_trait]
impl EmbeddingClient for MockEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        Ok(texts
            .iter()
            .map(|text| {
                let seed = text
                    .bytes()
                    .fold(7u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
                let mut v: Vec<f32> = (0..self.dim as u32)
                    .map(|i| ((seed.wrapping_add(i.wrapping_mul(2_654_435_761))) as f32).sin())
                    .collect();
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
                v.iter_mut().for_each(|x| *x /= norm);
                v
            })
            .collect())
    }

    fn dim(&self) -> usize {
        self.dim
    }
}

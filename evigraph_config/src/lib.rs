//! # Evigraph Config
//!
//! Configuration for the Evigraph server and pipeline, in two layers:
//!
//! - **Server configuration** (`evigraph.toml`) — HTTP settings, LLM and
//!   embedding provider endpoints, build versioning, feature flags. Every
//!   field can be overridden via environment variables with the `EVIGRAPH_`
//!   prefix and `_` as section separator (`EVIGRAPH_SERVER_PORT` →
//!   `server.port`).
//! - **Governance configuration** (YAML files under a config directory) —
//!   the predicate whitelist and surface mappings (`predicates.yaml`), the
//!   ontology with node types and type constraints (`ontology.yaml`), the
//!   per-stage thresholds (`thresholds.yaml`), and the LLM prompt templates
//!   (`prompts.yaml`). Governance files are version-controlled; a missing or
//!   invalid file fails startup.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use evigraph_core::Predicate;

pub mod governance;
pub mod prompts;

pub use governance::{GovernanceConfig, Ontology, PredicateTable, Thresholds, TypeConstraint};
pub use prompts::PromptTemplates;

// ---------------------------------------------------------------------------
// Server configuration
// ---------------------------------------------------------------------------

/// Top-level server configuration, parsed from `evigraph.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvigraphConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub features: FeatureFlags,
    /// Directory holding the governance YAML files.
    #[serde(default = "default_governance_dir")]
    pub governance_dir: String,
}

fn default_governance_dir() -> String {
    "config".to_string()
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Log level filter (default: "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log format: "text" (default) or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8640
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

/// LLM provider settings. The provider speaks the OpenAI-compatible chat
/// completions protocol; "mock" selects the deterministic offline provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "openai-compatible" or "mock".
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_llm_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_llm_temperature")]
    pub temperature: f32,
    /// Per-request timeout.
    #[serde(default = "default_llm_request_timeout")]
    pub request_timeout_secs: u64,
    /// Per-stage budget; chunks past it are skipped, the document survives.
    #[serde(default = "default_llm_stage_budget")]
    pub stage_budget_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            base_url: default_llm_base_url(),
            api_key_env: default_llm_api_key_env(),
            max_tokens: default_llm_max_tokens(),
            temperature: default_llm_temperature(),
            request_timeout_secs: default_llm_request_timeout(),
            stage_budget_secs: default_llm_stage_budget(),
        }
    }
}

fn default_llm_provider() -> String {
    "mock".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_api_key_env() -> String {
    "EVIGRAPH_LLM_API_KEY".to_string()
}
fn default_llm_max_tokens() -> u32 {
    2048
}
fn default_llm_temperature() -> f32 {
    0.2
}
fn default_llm_request_timeout() -> u64 {
    60
}
fn default_llm_stage_budget() -> u64 {
    600
}

/// Embedding provider settings. Dimensionality is fixed per deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_embedding_dim")]
    pub dim: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    /// Process-local cache of embeddings by text hash.
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            base_url: default_llm_base_url(),
            api_key_env: default_llm_api_key_env(),
            dim: default_embedding_dim(),
            batch_size: default_embedding_batch_size(),
            cache_enabled: default_true(),
        }
    }
}

fn default_embedding_provider() -> String {
    "mock".to_string()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_embedding_dim() -> usize {
    1536
}
fn default_embedding_batch_size() -> usize {
    32
}
fn default_true() -> bool {
    true
}

/// Build version stamping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Prefix for generated build versions; the full tag stays opaque but
    /// unique per run.
    #[serde(default = "default_build_prefix")]
    pub version_prefix: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            version_prefix: default_build_prefix(),
        }
    }
}

fn default_build_prefix() -> String {
    "build".to_string()
}

/// Feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "default_true")]
    pub enable_vector_search: bool,
    #[serde(default = "default_true")]
    pub enable_community_detection: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            enable_vector_search: true,
            enable_community_detection: true,
        }
    }
}

impl EvigraphConfig {
    /// Load from a TOML file, then apply `EVIGRAPH_` environment overrides.
    /// A missing file yields the defaults (still overridable by env).
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("invalid TOML in {}", path.display()))?
        } else {
            tracing::warn!("config file {} not found, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `EVIGRAPH_<SECTION>_<FIELD>` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        let get = |name: &str| std::env::var(name).ok();
        if let Some(v) = get("EVIGRAPH_SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("EVIGRAPH_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.server.port = v;
        }
        if let Some(v) = get("EVIGRAPH_SERVER_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Some(v) = get("EVIGRAPH_SERVER_LOG_FORMAT") {
            self.server.log_format = v;
        }
        if let Some(v) = get("EVIGRAPH_LLM_PROVIDER") {
            self.llm.provider = v;
        }
        if let Some(v) = get("EVIGRAPH_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("EVIGRAPH_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("EVIGRAPH_EMBEDDING_PROVIDER") {
            self.embedding.provider = v;
        }
        if let Some(v) = get("EVIGRAPH_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Some(v) = get("EVIGRAPH_EMBEDDING_DIM").and_then(|v| v.parse().ok()) {
            self.embedding.dim = v;
        }
        if let Some(v) = get("EVIGRAPH_GOVERNANCE_DIR") {
            self.governance_dir = v;
        }
        if let Some(v) = get("EVIGRAPH_BUILD_VERSION_PREFIX") {
            self.build.version_prefix = v;
        }
    }

    /// Fail fast on configuration that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dim == 0 {
            bail!("embedding.dim must be positive");
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be positive");
        }
        match self.llm.provider.as_str() {
            "mock" | "openai-compatible" => {}
            other => bail!("unknown llm.provider '{}'", other),
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature out of range: {}", self.llm.temperature);
        }
        Ok(())
    }
}

/// Validate that every mapping target in a predicate table is whitelisted.
/// Shared by governance loading and feedback promotion.
pub fn validate_mapping_targets(mappings: &HashMap<String, String>) -> Result<()> {
    for (surface, target) in mappings {
        if Predicate::parse(target).is_none() {
            bail!(
                "predicate mapping '{}' targets '{}' which is not in the whitelist",
                surface,
                target
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = EvigraphConfig::default();
        config.validate().unwrap();
        assert_eq!(config.embedding.dim, 1536);
        assert_eq!(config.server.port, 8640);
        assert!(config.features.enable_vector_search);
    }

    #[test]
    fn parses_partial_toml() {
        let config: EvigraphConfig = toml::from_str(
            r#"
            [server]
            port = 9000

            [embedding]
            dim = 384
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.embedding.dim, 384);
        assert_eq!(config.llm.provider, "mock");
    }

    #[test]
    fn rejects_bad_provider() {
        let mut config = EvigraphConfig::default();
        config.llm.provider = "carrier-pigeon".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_dim() {
        let mut config = EvigraphConfig::default();
        config.embedding.dim = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mapping_targets_must_be_whitelisted() {
        let mut ok = HashMap::new();
        ok.insert("基于".to_string(), "USES".to_string());
        validate_mapping_targets(&ok).unwrap();

        let mut bad = HashMap::new();
        bad.insert("随机词".to_string(), "FRIENDS_WITH".to_string());
        assert!(validate_mapping_targets(&bad).is_err());
    }
}

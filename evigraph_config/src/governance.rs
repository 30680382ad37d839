//! Governance configuration: predicate whitelist and mappings, ontology type
//! constraints, per-stage thresholds.
//!
//! Loaded from version-controlled YAML at startup; an unreadable or invalid
//! file is a fatal error. Defaults exist for every threshold so that config
//! files only need to state what they change.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use evigraph_core::Predicate;

use crate::prompts::PromptTemplates;
use crate::validate_mapping_targets;

/// The full governance configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub predicates: PredicateTable,
    #[serde(default)]
    pub ontology: Ontology,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub prompts: PromptTemplates,
}

impl GovernanceConfig {
    /// Load `predicates.yaml`, `ontology.yaml`, `thresholds.yaml` and
    /// `prompts.yaml` from a directory. Each file is optional only in the
    /// sense that its defaults apply when absent; present-but-invalid files
    /// fail fast.
    pub fn load(dir: &Path) -> Result<Self> {
        fn read_yaml<T: serde::de::DeserializeOwned + Default>(path: &Path) -> Result<T> {
            if !path.exists() {
                return Ok(T::default());
            }
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("invalid YAML in {}", path.display()))
        }

        let config = Self {
            predicates: read_yaml(&dir.join("predicates.yaml"))?,
            ontology: read_yaml(&dir.join("ontology.yaml"))?,
            thresholds: read_yaml(&dir.join("thresholds.yaml"))?,
            prompts: read_yaml(&dir.join("prompts.yaml"))?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_mapping_targets(&self.predicates.mappings)?;
        self.ontology.validate()?;
        self.thresholds.validate()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Surface → canonical predicate mapping table.
///
/// The whitelist itself is the closed [`Predicate`] enum; the table only
/// configures which natural-language surfaces map into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateTable {
    /// Surface form (as extracted) → canonical predicate name.
    #[serde(default = "default_mappings")]
    pub mappings: HashMap<String, String>,
}

impl Default for PredicateTable {
    fn default() -> Self {
        Self {
            mappings: default_mappings(),
        }
    }
}

fn default_mappings() -> HashMap<String, String> {
    let rows: [(&str, &str); 22] = [
        ("基于", "USES"),
        ("采用", "USES"),
        ("利用", "USES"),
        ("使用", "USES"),
        ("uses", "USES"),
        ("based on", "USES"),
        ("是一种", "IS_A"),
        ("属于", "IS_A"),
        ("is a", "IS_A"),
        ("is a kind of", "IS_A"),
        ("包含", "PART_OF"),
        ("组成部分", "PART_OF"),
        ("part of", "PART_OF"),
        ("创建", "CREATES"),
        ("提出", "CREATES"),
        ("creates", "CREATES"),
        ("源自", "DERIVES_FROM"),
        ("派生自", "DERIVES_FROM"),
        ("derives from", "DERIVES_FROM"),
        ("相关", "RELATED_TO"),
        ("related to", "RELATED_TO"),
        ("类似于", "SIMILAR_TO"),
    ];
    rows.iter()
        .map(|(s, c)| (s.to_string(), c.to_string()))
        .collect()
}

impl PredicateTable {
    /// Map a surface form to its canonical predicate, if configured.
    /// Matching is case-insensitive on the trimmed surface.
    pub fn normalize(&self, surface: &str) -> Option<Predicate> {
        let needle = surface.trim();
        // Exact entry first, then case-insensitive scan.
        if let Some(target) = self.mappings.get(needle) {
            return Predicate::parse(target);
        }
        let lower = needle.to_lowercase();
        self.mappings
            .iter()
            .find(|(k, _)| k.to_lowercase() == lower)
            .and_then(|(_, v)| Predicate::parse(v))
    }

    /// Add a mapping row (feedback-driven growth). Rejects non-whitelisted
    /// targets.
    pub fn insert(&mut self, surface: String, canonical: Predicate) {
        self.mappings.insert(surface, canonical.as_str().to_string());
    }
}

// ---------------------------------------------------------------------------
// Ontology
// ---------------------------------------------------------------------------

/// One allowed `(subject_type, predicate, object_types)` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeConstraint {
    pub subject: String,
    pub predicate: String,
    pub objects: Vec<String>,
}

/// Allowed node types and per-predicate type constraints.
///
/// A predicate with no constraint rows is unconstrained (the permissive
/// default); a predicate with rows only allows the listed pairs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ontology {
    #[serde(default = "default_node_types")]
    pub node_types: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<TypeConstraint>,
}

impl Default for Ontology {
    fn default() -> Self {
        Self {
            node_types: default_node_types(),
            constraints: vec![
                TypeConstraint {
                    subject: "Concept".into(),
                    predicate: "USES".into(),
                    objects: vec!["Concept".into(), "Method".into(), "Tool".into()],
                },
                TypeConstraint {
                    subject: "Method".into(),
                    predicate: "USES".into(),
                    objects: vec!["Method".into(), "Tool".into(), "Concept".into()],
                },
                TypeConstraint {
                    subject: "Tool".into(),
                    predicate: "USES".into(),
                    objects: vec!["Method".into(), "Tool".into(), "Concept".into()],
                },
                TypeConstraint {
                    subject: "Person".into(),
                    predicate: "CREATES".into(),
                    objects: vec![
                        "Method".into(),
                        "Tool".into(),
                        "Concept".into(),
                        "Organization".into(),
                    ],
                },
            ],
        }
    }
}

fn default_node_types() -> Vec<String> {
    ["Concept", "Person", "Organization", "Method", "Tool", "Metric"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Ontology {
    pub fn is_known_type(&self, node_type: &str) -> bool {
        self.node_types.iter().any(|t| t == node_type)
    }

    /// Whether the ontology permits `subject_type -[predicate]-> object_type`.
    /// Unconstrained predicates are allowed for any known pair.
    pub fn allows(&self, subject_type: &str, predicate: Predicate, object_type: &str) -> bool {
        let rows: Vec<&TypeConstraint> = self
            .constraints
            .iter()
            .filter(|c| c.predicate == predicate.as_str())
            .collect();
        if rows.is_empty() {
            return true;
        }
        rows.iter()
            .any(|c| c.subject == subject_type && c.objects.iter().any(|o| o == object_type))
    }

    /// Feedback operation: forbid a predicate for a subject/object pair by
    /// narrowing its constraint rows.
    pub fn forbid(&mut self, subject_type: &str, predicate: Predicate, object_type: &str) {
        // Ensure the predicate is constrained at all, seeding with the
        // currently-permitted universe minus the forbidden pair.
        let has_rows = self
            .constraints
            .iter()
            .any(|c| c.predicate == predicate.as_str());
        if !has_rows {
            for subject in self.node_types.clone() {
                let objects: Vec<String> = self
                    .node_types
                    .iter()
                    .filter(|o| !(subject == subject_type && o.as_str() == object_type))
                    .cloned()
                    .collect();
                self.constraints.push(TypeConstraint {
                    subject,
                    predicate: predicate.as_str().to_string(),
                    objects,
                });
            }
            return;
        }
        for row in self
            .constraints
            .iter_mut()
            .filter(|c| c.predicate == predicate.as_str() && c.subject == subject_type)
        {
            row.objects.retain(|o| o != object_type);
        }
    }

    fn validate(&self) -> Result<()> {
        for c in &self.constraints {
            if Predicate::parse(&c.predicate).is_none() {
                anyhow::bail!("ontology constraint uses unknown predicate '{}'", c.predicate);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Per-node-type linker acceptance thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeThreshold {
    pub accept: f32,
    pub review: f32,
}

/// Rerank feature weights for the entity linker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkerWeights {
    #[serde(default = "d_w_lexical")]
    pub lexical: f32,
    #[serde(default = "d_w_semantic")]
    pub semantic: f32,
    #[serde(default = "d_w_context")]
    pub context: f32,
    #[serde(default = "d_w_type")]
    pub type_consistency: f32,
    #[serde(default = "d_w_frequency")]
    pub frequency: f32,
    #[serde(default = "d_w_graph")]
    pub graph: f32,
}

impl Default for LinkerWeights {
    fn default() -> Self {
        Self {
            lexical: d_w_lexical(),
            semantic: d_w_semantic(),
            context: d_w_context(),
            type_consistency: d_w_type(),
            frequency: d_w_frequency(),
            graph: d_w_graph(),
        }
    }
}

fn d_w_lexical() -> f32 {
    0.15
}
fn d_w_semantic() -> f32 {
    0.35
}
fn d_w_context() -> f32 {
    0.15
}
fn d_w_type() -> f32 {
    0.10
}
fn d_w_frequency() -> f32 {
    0.10
}
fn d_w_graph() -> f32 {
    0.15
}

/// All tunable thresholds, grouped per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    // -- Stage 0 --
    #[serde(default = "d_chunk_window")]
    pub chunk_window_sentences: usize,
    #[serde(default = "d_chunk_stride")]
    pub chunk_stride: usize,
    #[serde(default = "d_chunk_max_chars")]
    pub chunk_max_chars: usize,
    #[serde(default = "d_chunk_min_chars")]
    pub chunk_min_chars: usize,

    // -- Stage 1 --
    #[serde(default = "d_coref_rewrite_coverage")]
    pub coref_rewrite_coverage: f32,
    #[serde(default = "d_coref_rewrite_conflict")]
    pub coref_rewrite_conflict: f32,
    #[serde(default = "d_coref_local_coverage")]
    pub coref_local_coverage: f32,
    /// Antecedent search window, in sentences.
    #[serde(default = "d_coref_window")]
    pub coref_antecedent_window: usize,
    /// Chunks shorter than this are skipped as noise.
    #[serde(default = "d_coref_min_chars")]
    pub coref_min_chunk_chars: usize,

    // -- Stage 2 --
    #[serde(default = "d_link_high")]
    pub entity_link_high_threshold: f32,
    #[serde(default = "d_link_low")]
    pub entity_link_low_threshold: f32,
    #[serde(default = "d_link_reject")]
    pub entity_link_reject_threshold: f32,
    #[serde(default = "d_link_lexical_top_k")]
    pub linker_lexical_top_k: usize,
    #[serde(default = "d_link_vector_top_k")]
    pub linker_vector_top_k: usize,
    #[serde(default = "d_link_combined_top_k")]
    pub linker_combined_top_k: usize,
    /// NIL when the top score is below this and the top-2 gap below the gap.
    #[serde(default = "d_link_nil_top")]
    pub linker_nil_top_score: f32,
    #[serde(default = "d_link_nil_gap")]
    pub linker_nil_gap: f32,
    #[serde(default)]
    pub linker_weights: LinkerWeights,
    /// Per-node-type accept/review overrides layered over the defaults.
    #[serde(default = "d_type_thresholds")]
    pub linker_type_thresholds: HashMap<String, TypeThreshold>,

    // -- Stage 3 --
    #[serde(default = "d_claim_window")]
    pub claim_window_sentences: usize,
    #[serde(default = "d_claim_stride")]
    pub claim_stride: usize,
    #[serde(default = "d_claim_soft_cluster")]
    pub claim_soft_cluster_threshold: f32,
    #[serde(default = "d_claim_evidence_min")]
    pub claim_evidence_min_match: f32,

    // -- Stage 4 --
    #[serde(default = "d_theme_min_size")]
    pub theme_min_community_size: usize,
    /// How many top-degree members feed the label/summary prompt.
    #[serde(default = "d_theme_label_members")]
    pub theme_label_members: usize,

    // -- Stage 5 --
    #[serde(default = "d_gov_synonym")]
    pub governor_synonym_threshold: f32,
    #[serde(default = "d_gov_other_ratio")]
    pub governor_other_warning_ratio: f32,
    /// A recurring correction is promoted into the mapping table at this
    /// count.
    #[serde(default = "d_gov_promote")]
    pub governor_correction_promote_count: usize,

    // -- Stage 7 --
    #[serde(default = "d_retrieval_top_k")]
    pub retrieval_top_k: usize,
    #[serde(default = "d_retrieval_max_hops")]
    pub retrieval_max_hops: u8,
    #[serde(default = "d_retrieval_theme_top_n")]
    pub retrieval_theme_top_n: usize,
    #[serde(default = "d_retrieval_vector_top_m")]
    pub retrieval_vector_top_m: usize,
    #[serde(default = "d_retrieval_hop_decay")]
    pub retrieval_hop_decay: f32,
    #[serde(default = "d_retrieval_context_chars")]
    pub retrieval_max_context_chars: usize,
}

impl Default for Thresholds {
    fn default() -> Self {
        // Round-trips through serde so the field defaults stay the single
        // source of truth.
        serde_yaml::from_str("{}").expect("empty thresholds deserialize")
    }
}

fn d_chunk_window() -> usize {
    4
}
fn d_chunk_stride() -> usize {
    2
}
fn d_chunk_max_chars() -> usize {
    1200
}
fn d_chunk_min_chars() -> usize {
    50
}
fn d_coref_rewrite_coverage() -> f32 {
    0.8
}
fn d_coref_rewrite_conflict() -> f32 {
    0.15
}
fn d_coref_local_coverage() -> f32 {
    0.5
}
fn d_coref_window() -> usize {
    3
}
fn d_coref_min_chars() -> usize {
    20
}
fn d_link_high() -> f32 {
    0.85
}
fn d_link_low() -> f32 {
    0.65
}
fn d_link_reject() -> f32 {
    0.40
}
fn d_link_lexical_top_k() -> usize {
    20
}
fn d_link_vector_top_k() -> usize {
    20
}
fn d_link_combined_top_k() -> usize {
    10
}
fn d_link_nil_top() -> f32 {
    0.6
}
fn d_link_nil_gap() -> f32 {
    0.15
}
fn d_type_thresholds() -> HashMap<String, TypeThreshold> {
    let rows = [
        ("Person", 0.88, 0.70),
        ("Organization", 0.88, 0.70),
        ("Concept", 0.85, 0.65),
        ("Method", 0.80, 0.60),
        ("Tool", 0.80, 0.60),
        ("Metric", 0.82, 0.63),
    ];
    rows.iter()
        .map(|(t, accept, review)| {
            (
                t.to_string(),
                TypeThreshold {
                    accept: *accept,
                    review: *review,
                },
            )
        })
        .collect()
}
fn d_claim_window() -> usize {
    6
}
fn d_claim_stride() -> usize {
    3
}
fn d_claim_soft_cluster() -> f32 {
    0.92
}
fn d_claim_evidence_min() -> f32 {
    0.6
}
fn d_theme_min_size() -> usize {
    3
}
fn d_theme_label_members() -> usize {
    8
}
fn d_gov_synonym() -> f32 {
    0.75
}
fn d_gov_other_ratio() -> f32 {
    0.10
}
fn d_gov_promote() -> usize {
    3
}
fn d_retrieval_top_k() -> usize {
    5
}
fn d_retrieval_max_hops() -> u8 {
    2
}
fn d_retrieval_theme_top_n() -> usize {
    3
}
fn d_retrieval_vector_top_m() -> usize {
    8
}
fn d_retrieval_hop_decay() -> f32 {
    0.5
}
fn d_retrieval_context_chars() -> usize {
    6000
}

impl Thresholds {
    /// Accept/review thresholds for a node type, falling back to the global
    /// defaults.
    pub fn type_threshold(&self, node_type: &str) -> TypeThreshold {
        self.linker_type_thresholds
            .get(node_type)
            .cloned()
            .unwrap_or(TypeThreshold {
                accept: self.entity_link_high_threshold,
                review: self.entity_link_low_threshold,
            })
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_window_sentences == 0 || self.chunk_stride == 0 {
            anyhow::bail!("chunk window and stride must be positive");
        }
        if self.entity_link_low_threshold >= self.entity_link_high_threshold {
            anyhow::bail!(
                "entity_link_low_threshold ({}) must be below high ({})",
                self.entity_link_low_threshold,
                self.entity_link_high_threshold
            );
        }
        if self.retrieval_max_hops > 4 {
            anyhow::bail!("retrieval_max_hops above 4 is not supported");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_mappings_cover_the_canonical_surfaces() {
        let table = PredicateTable::default();
        assert_eq!(table.normalize("基于"), Some(Predicate::Uses));
        assert_eq!(table.normalize("采用"), Some(Predicate::Uses));
        assert_eq!(table.normalize("随机词"), None);
        assert_eq!(table.normalize("Based On"), Some(Predicate::Uses));
    }

    #[test]
    fn ontology_unconstrained_predicate_allows_anything() {
        let ontology = Ontology::default();
        assert!(ontology.allows("Tool", Predicate::SimilarTo, "Metric"));
    }

    #[test]
    fn ontology_constrained_predicate_rejects_unlisted_pairs() {
        let ontology = Ontology::default();
        assert!(ontology.allows("Method", Predicate::Uses, "Tool"));
        assert!(!ontology.allows("Metric", Predicate::Uses, "Person"));
    }

    #[test]
    fn forbid_narrows_constraints() {
        let mut ontology = Ontology::default();
        assert!(ontology.allows("Method", Predicate::Uses, "Tool"));
        ontology.forbid("Method", Predicate::Uses, "Tool");
        assert!(!ontology.allows("Method", Predicate::Uses, "Tool"));
        assert!(ontology.allows("Method", Predicate::Uses, "Concept"));
    }

    #[test]
    fn forbid_on_unconstrained_predicate_seeds_rows() {
        let mut ontology = Ontology::default();
        assert!(ontology.allows("Tool", Predicate::SimilarTo, "Person"));
        ontology.forbid("Tool", Predicate::SimilarTo, "Person");
        assert!(!ontology.allows("Tool", Predicate::SimilarTo, "Person"));
        assert!(ontology.allows("Tool", Predicate::SimilarTo, "Metric"));
    }

    #[test]
    fn thresholds_defaults_match_the_documented_values() {
        let t = Thresholds::default();
        assert_eq!(t.chunk_window_sentences, 4);
        assert_eq!(t.chunk_stride, 2);
        assert!((t.entity_link_high_threshold - 0.85).abs() < 1e-6);
        assert!((t.entity_link_low_threshold - 0.65).abs() < 1e-6);
        assert_eq!(t.retrieval_max_hops, 2);
        t.validate().unwrap();
    }

    #[test]
    fn type_threshold_falls_back_to_global() {
        let t = Thresholds::default();
        let person = t.type_threshold("Person");
        assert!((person.accept - 0.88).abs() < 1e-6);
        let unknown = t.type_threshold("Galaxy");
        assert!((unknown.accept - 0.85).abs() < 1e-6);
    }

    #[test]
    fn invalid_thresholds_fail_validation() {
        let mut t = Thresholds::default();
        t.entity_link_low_threshold = 0.9;
        assert!(t.validate().is_err());
    }

    #[test]
    fn governance_yaml_round_trip() {
        let yaml = r#"
mappings:
  "基于": USES
  "等价于": SIMILAR_TO
"#;
        let table: PredicateTable = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(table.normalize("等价于"), Some(Predicate::SimilarTo));
        // The explicit file replaces the defaults entirely.
        assert_eq!(table.normalize("採用"), None);
    }

    #[test]
    fn load_from_missing_dir_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = GovernanceConfig::load(dir.path()).unwrap();
        assert_eq!(config.predicates.normalize("采用"), Some(Predicate::Uses));
    }

    #[test]
    fn load_rejects_bad_mapping_target() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("predicates.yaml"),
            "mappings:\n  \"foo\": NOT_A_PREDICATE\n",
        )
        .unwrap();
        assert!(GovernanceConfig::load(dir.path()).is_err());
    }
}

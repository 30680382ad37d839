//! Core data types for the Evigraph property graph.
//!
//! Defines the node payloads (Document, Chunk, Concept, Claim, Theme), the
//! closed relation vocabulary, the four-level provenance locator, and the
//! generic node/edge wrappers the store operates on. Every node and edge
//! carries a `build_version` so one ingestion run can be rolled back as a
//! unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a document (content hash).
pub type DocId = String;
/// Deterministic chunk identifier (hash of doc, window and build version).
pub type ChunkId = String;
/// Concept identifier. Concepts are additionally unique by `name`.
pub type ConceptId = String;
/// Claim identifier.
pub type ClaimId = String;
/// Deterministic theme identifier (hash of sorted members and level).
pub type ThemeId = String;

/// Opaque tag stamped on every node and edge produced by one ingestion run.
pub type BuildVersion = String;

// ---------------------------------------------------------------------------
// Relation vocabulary
// ---------------------------------------------------------------------------

/// The closed set of concept-to-concept relation types.
///
/// Free-text predicates never reach the store; the predicate governor maps
/// surface forms into this set or rejects them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Predicate {
    Uses,
    IsA,
    PartOf,
    Creates,
    DerivesFrom,
    RelatedTo,
    SimilarTo,
}

impl Predicate {
    /// Every whitelisted predicate, in declaration order.
    pub const ALL: [Predicate; 7] = [
        Predicate::Uses,
        Predicate::IsA,
        Predicate::PartOf,
        Predicate::Creates,
        Predicate::DerivesFrom,
        Predicate::RelatedTo,
        Predicate::SimilarTo,
    ];

    /// Canonical wire name (`USES`, `IS_A`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Predicate::Uses => "USES",
            Predicate::IsA => "IS_A",
            Predicate::PartOf => "PART_OF",
            Predicate::Creates => "CREATES",
            Predicate::DerivesFrom => "DERIVES_FROM",
            Predicate::RelatedTo => "RELATED_TO",
            Predicate::SimilarTo => "SIMILAR_TO",
        }
    }

    /// Parse a canonical wire name. Returns `None` for anything outside the
    /// whitelist — callers must treat that as an OTHER predicate.
    pub fn parse(s: &str) -> Option<Predicate> {
        Predicate::ALL.iter().copied().find(|p| p.as_str() == s)
    }
}

/// The closed set of claim-to-claim relation types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimRelationKind {
    Supports,
    Contradicts,
    Causes,
    ComparesWith,
    Conditions,
}

impl ClaimRelationKind {
    pub const ALL: [ClaimRelationKind; 5] = [
        ClaimRelationKind::Supports,
        ClaimRelationKind::Contradicts,
        ClaimRelationKind::Causes,
        ClaimRelationKind::ComparesWith,
        ClaimRelationKind::Conditions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimRelationKind::Supports => "SUPPORTS",
            ClaimRelationKind::Contradicts => "CONTRADICTS",
            ClaimRelationKind::Causes => "CAUSES",
            ClaimRelationKind::ComparesWith => "COMPARES_WITH",
            ClaimRelationKind::Conditions => "CONDITIONS",
        }
    }

    pub fn parse(s: &str) -> Option<ClaimRelationKind> {
        ClaimRelationKind::ALL.iter().copied().find(|k| k.as_str() == s)
    }
}

// ---------------------------------------------------------------------------
// Provenance
// ---------------------------------------------------------------------------

/// Four-level evidence locator: document, chunk, section, sentences.
///
/// Every non-Theme node must reach at least one chunk through an
/// `EVIDENCE_FROM` edge carrying this locator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub doc_id: DocId,
    pub chunk_id: ChunkId,
    /// Ordered heading labels from the document root to the chunk's section.
    pub section_path: Vec<String>,
    /// Sentence ids (`"{doc_id}:s{n}"`) the statement rests on.
    pub sentence_ids: Vec<String>,
}

/// Character-offset span of a mention inside its chunk, attached to
/// `MENTIONS` edges.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MentionSpan {
    pub sentence_id: String,
    pub start: usize,
    pub end: usize,
}

// ---------------------------------------------------------------------------
// Node payloads
// ---------------------------------------------------------------------------

/// Supported document kinds. Parsers for these live outside the core; the
/// pipeline only consumes their extracted text and heading tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Pdf,
    Markdown,
    PlainText,
    Html,
}

/// Ingestion lifecycle of a document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Ingesting,
    Ready,
    Failed,
}

/// An ingested document. Created once per ingest, immutable thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable hash of the document content.
    pub id: DocId,
    /// Full content checksum (sha256, hex).
    pub checksum: String,
    pub kind: DocumentKind,
    /// Content size in bytes.
    pub size: usize,
    pub status: DocumentStatus,
    pub created_at: DateTime<Utc>,
    pub build_version: BuildVersion,
}

/// A sentence-windowed unit of a document; the smallest unit of evidence a
/// claim can resolve to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub doc_id: DocId,
    /// Ordinal of this chunk within its document.
    pub chunk_index: usize,
    pub text: String,
    /// Coreference-resolved text, present when stage 1 ran in rewrite mode.
    #[serde(default)]
    pub resolved_text: Option<String>,
    /// Ordered heading labels from root to this chunk's section. Empty for
    /// documents without headings.
    pub section_path: Vec<String>,
    #[serde(default)]
    pub page_num: Option<u32>,
    /// Ordered sentence ids covered by this window.
    pub sentence_ids: Vec<String>,
    /// Document-wide index of the first sentence in the window.
    pub window_start: usize,
    /// Document-wide index of the last sentence in the window (inclusive).
    pub window_end: usize,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub build_version: BuildVersion,
}

/// How a concept entered the graph.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConceptSource {
    /// Linked to an existing concept by the entity linker.
    Linked,
    /// Proposed as a new concept after a NIL linking outcome.
    NilProposal,
    /// Created or redirected through feedback operations.
    Feedback,
}

/// A canonical named entity; the atom of linking. Globally unique by `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Concept {
    pub id: ConceptId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    /// Ontology node type (e.g. "Concept", "Person", "Method", "Tool").
    #[serde(default)]
    pub category: Option<String>,
    pub importance: f32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub source: ConceptSource,
    /// When the concept redirects to another after a feedback merge, the
    /// surviving concept's id. Readers follow at most one hop.
    #[serde(default)]
    pub redirect_to: Option<ConceptId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub build_version: BuildVersion,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClaimType {
    Fact,
    Hypothesis,
    Conclusion,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Assertive,
    Hedged,
    Speculative,
}

impl Modality {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            Modality::Assertive => "assertive",
            Modality::Hedged => "hedged",
            Modality::Speculative => "speculative",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    Positive,
    Negative,
}

/// An extracted atomic proposition with type, modality, polarity, certainty
/// and evidence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub text: String,
    /// Hash of the normalized text, used for hard deduplication.
    pub normalized_text_hash: String,
    /// When set, this claim is a redirect shell; the target claim is the live
    /// one and must itself have no `canonical_id` (chains are rewritten
    /// eagerly to length one).
    #[serde(default)]
    pub canonical_id: Option<ClaimId>,
    pub doc_id: DocId,
    pub chunk_id: ChunkId,
    pub sentence_ids: Vec<String>,
    pub section_path: Vec<String>,
    pub claim_type: ClaimType,
    pub modality: Modality,
    pub polarity: Polarity,
    /// Author-asserted certainty in [0, 1].
    pub certainty: f32,
    /// Extraction confidence in [0, 1].
    pub confidence: f32,
    /// Character span inside the chunk text the claim rests on, when the
    /// evidence aligner found one.
    #[serde(default)]
    pub evidence_span: Option<(usize, usize)>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub build_version: BuildVersion,
}

/// Granularity of a theme.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThemeLevel {
    /// Communities detected over the full concept graph.
    Coarse,
    /// Communities detected within one coarse theme.
    Fine,
}

/// A community in the concept/claim graph plus its generated label and
/// summary; the unit of global retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Theme {
    pub id: ThemeId,
    pub label: String,
    pub summary: String,
    pub level: ThemeLevel,
    pub keywords: Vec<String>,
    pub community_id: u64,
    pub member_count: usize,
    pub concept_ids: Vec<ConceptId>,
    pub claim_ids: Vec<ClaimId>,
    /// For fine themes, the coarse theme they refine.
    #[serde(default)]
    pub parent_theme_id: Option<ThemeId>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    pub build_version: BuildVersion,
}

// ---------------------------------------------------------------------------
// Generic node / edge wrappers
// ---------------------------------------------------------------------------

/// Node label, mirroring the store's label set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeLabel {
    Document,
    Chunk,
    Concept,
    Claim,
    Theme,
}

/// A typed node payload as the store sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeBody {
    Document(Document),
    Chunk(Chunk),
    Concept(Concept),
    Claim(Claim),
    Theme(Theme),
}

impl NodeBody {
    pub fn id(&self) -> &str {
        match self {
            NodeBody::Document(d) => &d.id,
            NodeBody::Chunk(c) => &c.id,
            NodeBody::Concept(c) => &c.id,
            NodeBody::Claim(c) => &c.id,
            NodeBody::Theme(t) => &t.id,
        }
    }

    pub fn label(&self) -> NodeLabel {
        match self {
            NodeBody::Document(_) => NodeLabel::Document,
            NodeBody::Chunk(_) => NodeLabel::Chunk,
            NodeBody::Concept(_) => NodeLabel::Concept,
            NodeBody::Claim(_) => NodeLabel::Claim,
            NodeBody::Theme(_) => NodeLabel::Theme,
        }
    }

    pub fn build_version(&self) -> &str {
        match self {
            NodeBody::Document(d) => &d.build_version,
            NodeBody::Chunk(c) => &c.build_version,
            NodeBody::Concept(c) => &c.build_version,
            NodeBody::Claim(c) => &c.build_version,
            NodeBody::Theme(t) => &t.build_version,
        }
    }

    /// The embedding the vector index holds for this node, if any.
    pub fn embedding(&self) -> Option<&[f32]> {
        match self {
            NodeBody::Document(_) => None,
            NodeBody::Chunk(c) => c.embedding.as_deref(),
            NodeBody::Concept(c) => c.embedding.as_deref(),
            NodeBody::Claim(c) => c.embedding.as_deref(),
            NodeBody::Theme(t) => t.embedding.as_deref(),
        }
    }
}

/// Edge type, covering structural containment, mentions, provenance, theme
/// membership and the two closed relation vocabularies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    /// `Document -> Chunk`
    Contains,
    /// `Chunk -> Claim`
    ContainsClaim,
    /// `Document|Chunk -> Concept`, carries a [`MentionSpan`].
    Mentions,
    /// `Concept|Claim -> Chunk`, carries a [`Provenance`] locator.
    EvidenceFrom,
    /// `Concept|Claim -> Theme`
    BelongsToTheme,
    /// `Concept -> Concept`, whitelisted predicate only.
    Concept(Predicate),
    /// `Claim -> Claim`, closed relation set only.
    Claim(ClaimRelationKind),
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Contains => "CONTAINS",
            EdgeKind::ContainsClaim => "CONTAINS_CLAIM",
            EdgeKind::Mentions => "MENTIONS",
            EdgeKind::EvidenceFrom => "EVIDENCE_FROM",
            EdgeKind::BelongsToTheme => "BELONGS_TO_THEME",
            EdgeKind::Concept(p) => p.as_str(),
            EdgeKind::Claim(k) => k.as_str(),
        }
    }
}

/// A directed, typed edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub src: String,
    pub kind: EdgeKind,
    pub dst: String,
    pub confidence: f32,
    /// Set when the link landed in the review band: committed, but flagged
    /// for a human pass.
    #[serde(default)]
    pub review: bool,
    /// Mention offsets; present on `MENTIONS` edges.
    #[serde(default)]
    pub mention: Option<MentionSpan>,
    /// Four-level locator; present on `EVIDENCE_FROM` edges.
    #[serde(default)]
    pub provenance: Option<Provenance>,
    pub build_version: BuildVersion,
}

impl Edge {
    /// Upsert identity: `(src, kind, dst)` plus the mention sentence range.
    /// Two `MENTIONS` edges between the same chunk and concept are distinct
    /// only when their sentence ranges differ.
    pub fn identity(&self) -> String {
        let disc = match &self.mention {
            Some(m) => format!("{}:{}-{}", m.sentence_id, m.start, m.end),
            None => String::new(),
        };
        format!("{}|{}|{}|{}", self.src, self.kind.as_str(), self.dst, disc)
    }
}

/// Node and edge totals, used by rollback tests and the metrics stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GraphCounts {
    pub documents: usize,
    pub chunks: usize,
    pub concepts: usize,
    pub claims: usize,
    pub themes: usize,
    pub edges: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_round_trip() {
        for p in Predicate::ALL {
            assert_eq!(Predicate::parse(p.as_str()), Some(p));
        }
        assert_eq!(Predicate::parse("基于"), None);
        assert_eq!(Predicate::parse("OTHER"), None);
    }

    #[test]
    fn claim_relation_round_trip() {
        for k in ClaimRelationKind::ALL {
            assert_eq!(ClaimRelationKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(ClaimRelationKind::parse("PURPOSE"), None);
    }

    #[test]
    fn mentions_identity_distinguishes_sentence_ranges() {
        let base = Edge {
            src: "chunk1".into(),
            kind: EdgeKind::Mentions,
            dst: "concept1".into(),
            confidence: 0.9,
            review: false,
            mention: Some(MentionSpan {
                sentence_id: "doc:s0".into(),
                start: 0,
                end: 11,
            }),
            provenance: None,
            build_version: "v1".into(),
        };
        let mut other = base.clone();
        other.mention = Some(MentionSpan {
            sentence_id: "doc:s2".into(),
            start: 40,
            end: 51,
        });
        assert_ne!(base.identity(), other.identity());

        let same = base.clone();
        assert_eq!(base.identity(), same.identity());
    }

    #[test]
    fn edge_kind_wire_names() {
        assert_eq!(EdgeKind::Concept(Predicate::Uses).as_str(), "USES");
        assert_eq!(
            EdgeKind::Claim(ClaimRelationKind::Contradicts).as_str(),
            "CONTRADICTS"
        );
        assert_eq!(EdgeKind::EvidenceFrom.as_str(), "EVIDENCE_FROM");
    }

    #[test]
    fn node_body_accessors() {
        let concept = Concept {
            id: "c1".into(),
            name: "Transformer".into(),
            description: None,
            domain: None,
            category: Some("Method".into()),
            importance: 0.5,
            tags: vec![],
            embedding: Some(vec![0.1, 0.2]),
            source: ConceptSource::Linked,
            redirect_to: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            build_version: "v1".into(),
        };
        let body = NodeBody::Concept(concept);
        assert_eq!(body.id(), "c1");
        assert_eq!(body.label(), NodeLabel::Concept);
        assert_eq!(body.build_version(), "v1");
        assert_eq!(body.embedding(), Some(&[0.1f32, 0.2][..]));
    }

    #[test]
    fn serde_snake_case_enums() {
        let json = serde_json::to_string(&ClaimType::Fact).unwrap();
        assert_eq!(json, "\"fact\"");
        let m: Modality = serde_json::from_str("\"hedged\"").unwrap();
        assert_eq!(m, Modality::Hedged);
        let p: Predicate = serde_json::from_str("\"DERIVES_FROM\"").unwrap();
        assert_eq!(p, Predicate::DerivesFrom);
    }
}

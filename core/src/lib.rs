//! # Evigraph Core
//!
//! Graph data model and storage primitives for the Evigraph GraphRAG engine:
//!
//! - **Data model** — documents, chunks, concepts, claims, themes, the closed
//!   relation vocabularies, and the four-level provenance locator — [`types`]
//! - **Store contract** — labeled nodes, typed edges, uniqueness constraints,
//!   vector index, delete-by-build-version rollback — [`store::GraphStore`],
//!   with the embedded [`store::MemoryGraph`] backend
//! - **Alias dictionary** — copy-on-write surface→canonical side index with
//!   negative entries — [`alias`]
//! - **Community detection** — Leiden over projected concept/claim edges —
//!   [`community`]
//! - **Traversal** — scored multi-hop expansion for hybrid retrieval —
//!   [`traversal`]
//!
//! The pipeline stages live in `evigraph_pipeline`; this crate has no
//! knowledge of LLMs or embeddings beyond storing vectors.

pub mod alias;
pub mod community;
pub mod ids;
pub mod store;
pub mod traversal;
pub mod types;

pub use alias::{AliasDictionary, AliasEntry, AliasSnapshot};
pub use store::{cosine, GraphStore, MemoryGraph, PurgeStats};
pub use traversal::{expand_scored, TraversedNode, DEFAULT_HOP_DECAY};
pub use types::{
    BuildVersion, Chunk, ChunkId, Claim, ClaimId, ClaimRelationKind, ClaimType, Concept,
    ConceptId, ConceptSource, DocId, Document, DocumentKind, DocumentStatus, Edge, EdgeKind,
    GraphCounts, MentionSpan, Modality, NodeBody, NodeLabel, Polarity, Predicate, Provenance,
    Theme, ThemeId, ThemeLevel,
};

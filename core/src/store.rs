//! The graph store contract and the embedded in-memory implementation.
//!
//! [`GraphStore`] is the Cypher-like surface the pipeline writes through:
//! labeled nodes, typed edges, a uniqueness constraint on `Concept.name`, a
//! vector similarity index over node embeddings, and delete-by-build-version
//! rollback. [`MemoryGraph`] is the embedded reference backend; external
//! property-graph backends implement the same trait.
//!
//! All mutation goes through the graph service (single writer per document);
//! the store arbitrates concurrent writers via its uniqueness constraint.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{bail, Result};

use crate::types::{
    Chunk, Claim, Concept, Document, Edge, GraphCounts, NodeBody, NodeLabel, Theme,
};

/// Outcome of a delete-by-build-version purge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub nodes_removed: usize,
    pub edges_removed: usize,
    /// Concepts (from any build) left with zero degree after the purge. They
    /// are not deleted here; orphan cleanup is a separate maintenance pass.
    pub orphan_concepts: usize,
}

/// Storage contract for the property graph.
///
/// Implementations must uphold:
/// - node upserts are keyed by id, concept upserts additionally by unique
///   (case-insensitive) name;
/// - edge upserts are keyed by [`Edge::identity`];
/// - `delete_build_version` removes every node and edge stamped with the
///   version, except concepts still referenced by other builds.
pub trait GraphStore: Send + Sync {
    fn upsert_node(&self, node: NodeBody) -> Result<()>;
    fn get_node(&self, id: &str) -> Result<Option<NodeBody>>;
    fn nodes_with_label(&self, label: NodeLabel) -> Result<Vec<NodeBody>>;

    /// Case-insensitive lookup by the concept uniqueness key.
    fn concept_by_name(&self, name: &str) -> Result<Option<Concept>>;
    /// Lexical recall over concept names and descriptions, exact-name matches
    /// ranked first.
    fn concepts_matching(&self, needle: &str, limit: usize) -> Result<Vec<Concept>>;
    /// Claim upsert key lookup: `(doc_id, normalized_text_hash)`.
    fn claim_by_hash(&self, doc_id: &str, text_hash: &str) -> Result<Option<Claim>>;

    fn upsert_edge(&self, edge: Edge) -> Result<()>;
    /// Remove one edge by its [`Edge::identity`]. Returns whether it existed.
    fn remove_edge(&self, identity: &str) -> Result<bool>;
    /// Rewrite every edge endpoint equal to `from` so it points at `to`.
    /// Used by feedback merges. Returns the number of rewritten edges.
    fn reassign_edges(&self, from: &str, to: &str) -> Result<usize>;
    /// Edges touching the node, both directions.
    fn edges_of(&self, id: &str) -> Result<Vec<Edge>>;
    fn edges_from(&self, id: &str) -> Result<Vec<Edge>>;
    fn all_edges(&self) -> Result<Vec<Edge>>;
    fn node_degree(&self, id: &str) -> Result<usize>;

    /// Cosine top-k over embeddings of nodes with the given label.
    fn vector_search(
        &self,
        label: NodeLabel,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>>;

    fn delete_build_version(&self, build_version: &str) -> Result<PurgeStats>;
    /// Maintenance pass removing concepts with zero degree. Returns how many
    /// were removed.
    fn cleanup_orphan_concepts(&self) -> Result<usize>;

    fn counts(&self) -> Result<GraphCounts>;
}

/// Cosine similarity. Returns 0.0 for mismatched or zero-norm inputs.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

// ---------------------------------------------------------------------------
// Embedded in-memory backend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryInner {
    nodes: HashMap<String, NodeBody>,
    /// Edge identity -> edge.
    edges: HashMap<String, Edge>,
    /// Lowercased concept name -> concept id (uniqueness constraint).
    concept_names: HashMap<String, String>,
    /// (doc_id, normalized_text_hash) -> claim id.
    claim_hashes: HashMap<(String, String), String>,
}

/// In-memory graph store with the same constraint semantics as the external
/// backends. Used as the embedded backend and by every pipeline test.
#[derive(Default)]
pub struct MemoryGraph {
    inner: RwLock<MemoryInner>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GraphStore for MemoryGraph {
    fn upsert_node(&self, node: NodeBody) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if let NodeBody::Concept(concept) = &node {
            let key = concept.name.to_lowercase();
            match inner.concept_names.get(&key) {
                Some(existing) if existing != &concept.id => {
                    bail!(
                        "uniqueness constraint violated: concept name '{}' already owned by {}",
                        concept.name,
                        existing
                    );
                }
                _ => {
                    inner.concept_names.insert(key, concept.id.clone());
                }
            }
        }
        if let NodeBody::Claim(claim) = &node {
            inner.claim_hashes.insert(
                (claim.doc_id.clone(), claim.normalized_text_hash.clone()),
                claim.id.clone(),
            );
        }
        inner.nodes.insert(node.id().to_string(), node);
        Ok(())
    }

    fn get_node(&self, id: &str) -> Result<Option<NodeBody>> {
        Ok(self.inner.read().unwrap().nodes.get(id).cloned())
    }

    fn nodes_with_label(&self, label: NodeLabel) -> Result<Vec<NodeBody>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .nodes
            .values()
            .filter(|n| n.label() == label)
            .cloned()
            .collect())
    }

    fn concept_by_name(&self, name: &str) -> Result<Option<Concept>> {
        let inner = self.inner.read().unwrap();
        let id = match inner.concept_names.get(&name.to_lowercase()) {
            Some(id) => id,
            None => return Ok(None),
        };
        match inner.nodes.get(id) {
            Some(NodeBody::Concept(c)) => Ok(Some(c.clone())),
            _ => Ok(None),
        }
    }

    fn concepts_matching(&self, needle: &str, limit: usize) -> Result<Vec<Concept>> {
        let inner = self.inner.read().unwrap();
        let needle_lower = needle.to_lowercase();
        let mut scored: Vec<(u8, Concept)> = Vec::new();
        for node in inner.nodes.values() {
            if let NodeBody::Concept(c) = node {
                let name_lower = c.name.to_lowercase();
                let rank = if name_lower == needle_lower {
                    0
                } else if name_lower.contains(&needle_lower) || needle_lower.contains(&name_lower) {
                    1
                } else if c
                    .description
                    .as_deref()
                    .map(|d| d.to_lowercase().contains(&needle_lower))
                    .unwrap_or(false)
                {
                    2
                } else {
                    continue;
                };
                scored.push((rank, c.clone()));
            }
        }
        scored.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
        Ok(scored.into_iter().map(|(_, c)| c).take(limit).collect())
    }

    fn claim_by_hash(&self, doc_id: &str, text_hash: &str) -> Result<Option<Claim>> {
        let inner = self.inner.read().unwrap();
        let id = match inner
            .claim_hashes
            .get(&(doc_id.to_string(), text_hash.to_string()))
        {
            Some(id) => id,
            None => return Ok(None),
        };
        match inner.nodes.get(id) {
            Some(NodeBody::Claim(c)) => Ok(Some(c.clone())),
            _ => Ok(None),
        }
    }

    fn upsert_edge(&self, edge: Edge) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if !inner.nodes.contains_key(&edge.src) {
            bail!("edge source node not found: {}", edge.src);
        }
        if !inner.nodes.contains_key(&edge.dst) {
            bail!("edge target node not found: {}", edge.dst);
        }
        inner.edges.insert(edge.identity(), edge);
        Ok(())
    }

    fn remove_edge(&self, identity: &str) -> Result<bool> {
        Ok(self.inner.write().unwrap().edges.remove(identity).is_some())
    }

    fn reassign_edges(&self, from: &str, to: &str) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        if !inner.nodes.contains_key(to) {
            bail!("reassignment target node not found: {}", to);
        }
        let doomed: Vec<String> = inner
            .edges
            .values()
            .filter(|e| e.src == from || e.dst == from)
            .map(|e| e.identity())
            .collect();
        let mut moved = 0;
        for identity in doomed {
            if let Some(mut edge) = inner.edges.remove(&identity) {
                if edge.src == from {
                    edge.src = to.to_string();
                }
                if edge.dst == from {
                    edge.dst = to.to_string();
                }
                // Self-loops produced by the rewrite are dropped.
                if edge.src != edge.dst {
                    inner.edges.insert(edge.identity(), edge);
                }
                moved += 1;
            }
        }
        Ok(moved)
    }

    fn edges_of(&self, id: &str) -> Result<Vec<Edge>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .edges
            .values()
            .filter(|e| e.src == id || e.dst == id)
            .cloned()
            .collect())
    }

    fn edges_from(&self, id: &str) -> Result<Vec<Edge>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .edges
            .values()
            .filter(|e| e.src == id)
            .cloned()
            .collect())
    }

    fn all_edges(&self) -> Result<Vec<Edge>> {
        Ok(self.inner.read().unwrap().edges.values().cloned().collect())
    }

    fn node_degree(&self, id: &str) -> Result<usize> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .edges
            .values()
            .filter(|e| e.src == id || e.dst == id)
            .count())
    }

    fn vector_search(
        &self,
        label: NodeLabel,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(String, f32)>> {
        let inner = self.inner.read().unwrap();
        let mut scored: Vec<(String, f32)> = inner
            .nodes
            .values()
            .filter(|n| n.label() == label)
            .filter_map(|n| {
                n.embedding()
                    .map(|emb| (n.id().to_string(), cosine(query, emb)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }

    fn delete_build_version(&self, build_version: &str) -> Result<PurgeStats> {
        let mut inner = self.inner.write().unwrap();
        let mut stats = PurgeStats::default();

        let before_edges = inner.edges.len();
        inner.edges.retain(|_, e| e.build_version != build_version);
        stats.edges_removed = before_edges - inner.edges.len();

        // Degrees after the edge purge, to spare concepts other builds still
        // reference.
        let mut degrees: HashMap<String, usize> = HashMap::new();
        for e in inner.edges.values() {
            *degrees.entry(e.src.clone()).or_default() += 1;
            *degrees.entry(e.dst.clone()).or_default() += 1;
        }

        let doomed: Vec<String> = inner
            .nodes
            .values()
            .filter(|n| n.build_version() == build_version)
            .filter(|n| {
                !matches!(n, NodeBody::Concept(_))
                    || degrees.get(n.id()).copied().unwrap_or(0) == 0
            })
            .map(|n| n.id().to_string())
            .collect();

        for id in &doomed {
            if let Some(node) = inner.nodes.remove(id) {
                stats.nodes_removed += 1;
                match &node {
                    NodeBody::Concept(c) => {
                        inner.concept_names.remove(&c.name.to_lowercase());
                    }
                    NodeBody::Claim(c) => {
                        inner
                            .claim_hashes
                            .remove(&(c.doc_id.clone(), c.normalized_text_hash.clone()));
                    }
                    _ => {}
                }
            }
        }

        // Edges referencing removed nodes are gone by construction (they
        // carried the same build version); count surviving orphans.
        let removed: HashSet<&String> = doomed.iter().collect();
        stats.orphan_concepts = inner
            .nodes
            .values()
            .filter(|n| matches!(n, NodeBody::Concept(_)))
            .filter(|n| !removed.contains(&n.id().to_string()))
            .filter(|n| degrees.get(n.id()).copied().unwrap_or(0) == 0)
            .count();

        Ok(stats)
    }

    fn cleanup_orphan_concepts(&self) -> Result<usize> {
        let mut inner = self.inner.write().unwrap();
        let mut degrees: HashMap<String, usize> = HashMap::new();
        for e in inner.edges.values() {
            *degrees.entry(e.src.clone()).or_default() += 1;
            *degrees.entry(e.dst.clone()).or_default() += 1;
        }
        let orphans: Vec<(String, String)> = inner
            .nodes
            .values()
            .filter_map(|n| match n {
                NodeBody::Concept(c) if degrees.get(&c.id).copied().unwrap_or(0) == 0 => {
                    Some((c.id.clone(), c.name.to_lowercase()))
                }
                _ => None,
            })
            .collect();
        for (id, name_key) in &orphans {
            inner.nodes.remove(id);
            inner.concept_names.remove(name_key);
        }
        Ok(orphans.len())
    }

    fn counts(&self) -> Result<GraphCounts> {
        let inner = self.inner.read().unwrap();
        let mut counts = GraphCounts {
            edges: inner.edges.len(),
            ..Default::default()
        };
        for node in inner.nodes.values() {
            match node {
                NodeBody::Document(_) => counts.documents += 1,
                NodeBody::Chunk(_) => counts.chunks += 1,
                NodeBody::Concept(_) => counts.concepts += 1,
                NodeBody::Claim(_) => counts.claims += 1,
                NodeBody::Theme(_) => counts.themes += 1,
            }
        }
        Ok(counts)
    }
}

//! Scored graph expansion from recall seeds.
//!
//! The query service seeds a breadth-first walk with vector/theme recall
//! hits and expands along a restricted edge-kind set (argument chains between
//! claims, whitelisted predicates between concepts). Discovered nodes are
//! scored `seed_score × hop_decay^depth × edge_confidence`, keeping the best
//! score when a node is reachable over multiple paths, and the best-scoring
//! incoming hop is remembered so callers can rebuild reasoning chains.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::Result;

use crate::store::GraphStore;
use crate::types::EdgeKind;

/// Default per-hop score decay.
pub const DEFAULT_HOP_DECAY: f32 = 0.5;

/// A node reached during expansion.
#[derive(Debug, Clone)]
pub struct TraversedNode {
    pub node_id: String,
    pub score: f32,
    /// Depth 0 marks a recall seed.
    pub depth: u8,
    /// The hop that produced the best score: `(parent_id, edge_kind)`.
    /// `None` for seeds.
    pub via: Option<(String, EdgeKind)>,
}

/// Expand from scored seeds along edges accepted by `follow`, up to
/// `max_hops`, and return all discovered nodes sorted by descending score.
///
/// Edges are walked in both directions; `follow` decides per edge kind.
pub fn expand_scored(
    store: &dyn GraphStore,
    seeds: &[(String, f32)],
    max_hops: u8,
    hop_decay: f32,
    follow: impl Fn(&EdgeKind) -> bool,
) -> Result<Vec<TraversedNode>> {
    let mut best: HashMap<String, TraversedNode> = HashMap::new();

    for (seed_id, seed_score) in seeds {
        let entry = best.entry(seed_id.clone()).or_insert(TraversedNode {
            node_id: seed_id.clone(),
            score: *seed_score,
            depth: 0,
            via: None,
        });
        if *seed_score > entry.score {
            entry.score = *seed_score;
            entry.depth = 0;
            entry.via = None;
        }

        if max_hops == 0 {
            continue;
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(seed_id.clone());
        let mut queue: VecDeque<(String, u8, f32)> = VecDeque::new();
        queue.push_back((seed_id.clone(), 0, *seed_score));

        while let Some((current, depth, path_score)) = queue.pop_front() {
            if depth >= max_hops {
                continue;
            }
            let next_depth = depth + 1;
            for edge in store.edges_of(&current)? {
                if !follow(&edge.kind) {
                    continue;
                }
                let neighbor = if edge.src == current {
                    edge.dst.clone()
                } else {
                    edge.src.clone()
                };
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let score = path_score * hop_decay * edge.confidence.clamp(0.0, 1.0);
                let candidate = TraversedNode {
                    node_id: neighbor.clone(),
                    score,
                    depth: next_depth,
                    via: Some((current.clone(), edge.kind)),
                };
                match best.get(&neighbor) {
                    Some(existing) if existing.score >= score => {}
                    _ => {
                        best.insert(neighbor.clone(), candidate);
                    }
                }
                queue.push_back((neighbor, next_depth, score));
            }
        }
    }

    let mut out: Vec<TraversedNode> = best.into_values().collect();
    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });
    Ok(out)
}

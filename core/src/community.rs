//! Community detection over the concept/claim projection.
//!
//! Wraps the `graphrs` Leiden implementation. The store works with string
//! node ids, while graphrs wants integers, so the projection maps ids to a
//! dense index deterministically (sorted order) before detection and back
//! after.

use std::collections::{HashMap, HashSet};

use crate::types::ConceptId;

/// Identifier of a detected community, local to one detection run.
pub type CommunityId = u64;

/// Quality function used by the Leiden algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QualityFunctionType {
    Modularity,
    /// Constant Potts Model.
    CPM,
}

/// Parameters for community detection.
#[derive(Debug, Clone)]
pub struct CommunityConfig {
    pub quality_function: QualityFunctionType,
    /// Larger values produce smaller communities.
    pub resolution: f64,
    /// Randomness in the refinement phase.
    pub theta: f64,
    /// Granularity parameter.
    pub gamma: f64,
    pub weighted: bool,
}

impl Default for CommunityConfig {
    fn default() -> Self {
        Self {
            quality_function: QualityFunctionType::Modularity,
            resolution: 1.0,
            theta: 0.3,
            gamma: 0.05,
            weighted: true,
        }
    }
}

/// Result of one detection run.
#[derive(Debug, Clone, Default)]
pub struct CommunityResult {
    /// Community id -> member node ids (sorted for determinism).
    pub communities: HashMap<CommunityId, Vec<ConceptId>>,
    pub node_to_community: HashMap<ConceptId, CommunityId>,
}

impl CommunityResult {
    pub fn num_communities(&self) -> usize {
        self.communities.len()
    }

    pub fn num_nodes(&self) -> usize {
        self.node_to_community.len()
    }

    pub fn community_of(&self, node_id: &str) -> Option<CommunityId> {
        self.node_to_community.get(node_id).copied()
    }

    pub fn members(&self, community_id: CommunityId) -> &[ConceptId] {
        self.communities
            .get(&community_id)
            .map(|m| m.as_slice())
            .unwrap_or(&[])
    }
}

/// Detect communities on a weighted undirected edge list.
///
/// Self-loops are excluded. Duplicate edges keep the latest weight.
pub fn detect_communities(
    edges: &[(String, String, f32)],
    config: &CommunityConfig,
) -> anyhow::Result<CommunityResult> {
    use graphrs::algorithms::community::leiden::{leiden, QualityFunction};
    use graphrs::{Edge as GEdge, EdgeDedupeStrategy, Graph, GraphSpecs};

    let filtered: Vec<&(String, String, f32)> =
        edges.iter().filter(|(s, t, _)| s != t).collect();
    if filtered.is_empty() {
        return Ok(CommunityResult::default());
    }

    // Deterministic string -> u64 mapping via sorted unique ids.
    let mut ids: Vec<&str> = filtered
        .iter()
        .flat_map(|(s, t, _)| [s.as_str(), t.as_str()])
        .collect();
    ids.sort_unstable();
    ids.dedup();
    let index: HashMap<&str, u64> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i as u64))
        .collect();

    let graphrs_edges: Vec<_> = filtered
        .iter()
        .map(|(s, t, w)| GEdge::with_weight(index[s.as_str()], index[t.as_str()], *w as f64))
        .collect();

    let mut specs = GraphSpecs::undirected_create_missing();
    specs.edge_dedupe_strategy = EdgeDedupeStrategy::KeepLast;

    let graph = Graph::<u64, ()>::new_from_nodes_and_edges(vec![], graphrs_edges, specs)
        .map_err(|e| anyhow::anyhow!("failed to build projection graph: {}", e.message))?;

    let quality_fn = match config.quality_function {
        QualityFunctionType::Modularity => QualityFunction::Modularity,
        QualityFunctionType::CPM => QualityFunction::CPM,
    };

    let raw: Vec<HashSet<u64>> = leiden(
        &graph,
        config.weighted,
        quality_fn,
        Some(config.resolution),
        Some(config.theta),
        Some(config.gamma),
    )
    .map_err(|e| anyhow::anyhow!("leiden failed: {}", e.message))?;

    let mut result = CommunityResult::default();
    for (idx, members) in raw.into_iter().enumerate() {
        let community_id = idx as CommunityId;
        let mut member_ids: Vec<ConceptId> = members
            .into_iter()
            .map(|m| ids[m as usize].to_string())
            .collect();
        member_ids.sort_unstable();
        for id in &member_ids {
            result.node_to_community.insert(id.clone(), community_id);
        }
        result.communities.insert(community_id, member_ids);
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Two dense clusters joined by a weak bridge.
    fn two_cluster_edges() -> Vec<(String, String, f32)> {
        let e = |a: &str, b: &str, w: f32| (a.to_string(), b.to_string(), w);
        vec![
            e("a1", "a2", 1.0),
            e("a1", "a3", 1.0),
            e("a1", "a4", 1.0),
            e("a2", "a3", 1.0),
            e("a2", "a4", 1.0),
            e("a3", "a4", 1.0),
            e("b1", "b2", 1.0),
            e("b1", "b3", 1.0),
            e("b1", "b4", 1.0),
            e("b2", "b3", 1.0),
            e("b2", "b4", 1.0),
            e("b3", "b4", 1.0),
            e("a4", "b1", 0.1),
        ]
    }

    #[test]
    fn detects_two_clusters() {
        let result = detect_communities(&two_cluster_edges(), &CommunityConfig::default()).unwrap();
        assert!(result.num_communities() >= 2);
        assert_eq!(result.num_nodes(), 8);

        let ca = result.community_of("a1").unwrap();
        for n in ["a2", "a3", "a4"] {
            assert_eq!(result.community_of(n), Some(ca), "{n} should join a1");
        }
        let cb = result.community_of("b1").unwrap();
        for n in ["b2", "b3", "b4"] {
            assert_eq!(result.community_of(n), Some(cb), "{n} should join b1");
        }
        assert_ne!(ca, cb);
    }

    #[test]
    fn empty_edge_list_yields_empty_result() {
        let result = detect_communities(&[], &CommunityConfig::default()).unwrap();
        assert_eq!(result.num_communities(), 0);
        assert_eq!(result.num_nodes(), 0);
    }

    #[test]
    fn self_loops_are_excluded() {
        let edges = vec![
            ("x".to_string(), "x".to_string(), 1.0),
            ("y".to_string(), "y".to_string(), 1.0),
        ];
        let result = detect_communities(&edges, &CommunityConfig::default()).unwrap();
        assert_eq!(result.num_nodes(), 0);
    }

    #[test]
    fn members_are_sorted() {
        let result = detect_communities(&two_cluster_edges(), &CommunityConfig::default()).unwrap();
        for members in result.communities.values() {
            let mut sorted = members.clone();
            sorted.sort_unstable();
            assert_eq!(&sorted, members);
        }
    }

    #[test]
    fn cpm_quality_function_also_runs() {
        let config = CommunityConfig {
            quality_function: QualityFunctionType::CPM,
            ..Default::default()
        };
        let result = detect_communities(&two_cluster_edges(), &config).unwrap();
        assert_eq!(result.num_nodes(), 8);
    }
}

//! Graph extraction over the store: bounded bidirectional traversal.

use crate::store::StoreInner;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use tracing::debug;

/// How an edge arose: from a relationship object or a traffic tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgeKind {
    /// A relationship object (`source_ref -> target_ref`).
    Relationship,
    /// A network-traffic object (`src_ref -> dst_ref`).
    NetworkTraffic,
}

/// A node of an extracted graph: an object id plus its merged view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    /// Object id.
    pub id: String,
    /// Merged content-plus-metadata view.
    pub object: Value,
}

impl GraphNode {
    /// Risk score from the merged view; absent or malformed reads as zero.
    pub fn risk(&self) -> u8 {
        self.object
            .get("risk")
            .and_then(Value::as_u64)
            .map(|r| r.min(100) as u8)
            .unwrap_or(0)
    }
}

/// An edge of an extracted graph, in its stored direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    /// Id of the edge object itself.
    pub id: String,
    /// Source endpoint id.
    pub source: String,
    /// Target endpoint id.
    pub target: String,
    /// Which object family produced the edge.
    #[serde(rename = "type")]
    pub kind: EdgeKind,
    /// Merged view of the edge object.
    pub relation: Value,
}

/// Result of a traversal: deduplicated nodes and edges.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectGraph {
    /// Nodes in discovery order, each id appearing once.
    pub nodes: Vec<GraphNode>,
    /// Edges, each id appearing once; both endpoints are always in `nodes`.
    pub edges: Vec<GraphEdge>,
}

impl ObjectGraph {
    /// Looks up a node by id.
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Breadth-first traversal from `root`, at most `depth` hops out.
///
/// Edges are followed in both directions irrespective of which end the
/// current node is. A visited set prevents re-expansion on cycles; an edge
/// is only emitted when both endpoints resolve, so dangling feed refs are
/// skipped (and logged) rather than surfaced as half-edges.
pub(crate) fn collect(inner: &StoreInner, root: &str, depth: u32) -> ObjectGraph {
    let mut graph = ObjectGraph::default();
    let Some(root_view) = inner.merged(root) else {
        return graph;
    };

    let mut visited: HashSet<String> = HashSet::new();
    let mut seen_edges: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, u32)> = VecDeque::new();

    visited.insert(root.to_string());
    graph.nodes.push(GraphNode {
        id: root.to_string(),
        object: root_view,
    });
    queue.push_back((root.to_string(), depth));

    while let Some((current, budget)) = queue.pop_front() {
        if budget == 0 {
            continue;
        }
        for edge_id in inner.incident_edges(&current) {
            let Some(edge_obj) = inner.object(edge_id) else {
                continue;
            };
            let Some((source, target)) = edge_obj.edge_refs() else {
                continue;
            };
            let far = if source == current { target } else { source };

            let Some(far_view) = inner.merged(far) else {
                debug!(edge = %edge_id, endpoint = %far, "dangling reference, edge skipped");
                continue;
            };

            if seen_edges.insert(edge_id.clone()) {
                let kind = match edge_obj.object_type() {
                    "network-traffic" => EdgeKind::NetworkTraffic,
                    _ => EdgeKind::Relationship,
                };
                graph.edges.push(GraphEdge {
                    id: edge_id.clone(),
                    source: source.to_string(),
                    target: target.to_string(),
                    kind,
                    relation: inner.merged(edge_id).unwrap_or(Value::Null),
                });
            }

            if visited.insert(far.to_string()) {
                graph.nodes.push(GraphNode {
                    id: far.to_string(),
                    object: far_view,
                });
                queue.push_back((far.to_string(), budget - 1));
            }
        }
    }

    graph
}

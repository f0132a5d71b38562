//! One shared topological sort used by both the schema propagation engine
//! and the workflow compiler. The two must agree on traversal order, so
//! there is exactly one implementation.
//!
//! Kahn's algorithm, ties broken by node id so the order — and therefore
//! every fingerprint derived from it — is stable across repeated compiles
//! of the same graph.

use std::collections::{BTreeSet, HashMap};

use vizql_types::{Edge, Graph, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleDetected(pub Vec<NodeId>);

/// Returns the full graph's nodes in topological order, or the ids of the
/// nodes that remain unvisited (i.e. participate in a cycle) on failure.
pub fn topological_order(graph: &Graph) -> Result<Vec<NodeId>, CycleDetected> {
    topological_order_subset(&graph.nodes.iter().map(|n| n.id.clone()).collect::<Vec<_>>(), &graph.edges)
}

/// Same algorithm restricted to an explicit node subset (used by the
/// compiler after ancestor isolation). Edges whose endpoints fall outside
/// `nodes` are ignored.
pub fn topological_order_subset(
    nodes: &[NodeId],
    edges: &[Edge],
) -> Result<Vec<NodeId>, CycleDetected> {
    let node_set: std::collections::HashSet<&NodeId> = nodes.iter().collect();
    let mut in_degree: HashMap<NodeId, usize> = nodes.iter().map(|n| (n.clone(), 0)).collect();
    let mut adjacency: HashMap<NodeId, Vec<NodeId>> = nodes.iter().map(|n| (n.clone(), Vec::new())).collect();

    for edge in edges {
        if !node_set.contains(&edge.source) || !node_set.contains(&edge.target) {
            continue;
        }
        adjacency.get_mut(&edge.source).unwrap().push(edge.target.clone());
        *in_degree.get_mut(&edge.target).unwrap() += 1;
    }

    let mut ready: BTreeSet<NodeId> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| id.clone())
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(next) = ready.iter().next().cloned() {
        ready.remove(&next);
        order.push(next.clone());
        for neighbor in adjacency.get(&next).into_iter().flatten() {
            let deg = in_degree.get_mut(neighbor).unwrap();
            *deg -= 1;
            if *deg == 0 {
                ready.insert(neighbor.clone());
            }
        }
    }

    if order.len() < nodes.len() {
        let visited: std::collections::HashSet<&NodeId> = order.iter().collect();
        let remaining: Vec<NodeId> = nodes
            .iter()
            .filter(|n| !visited.contains(n))
            .cloned()
            .collect();
        return Err(CycleDetected(remaining));
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vizql_types::{Node, NodeKind};

    fn node(id: &str) -> Node {
        Node {
            id: NodeId(id.to_string()),
            kind: NodeKind::DataSource,
            config: serde_json::Value::Null,
        }
    }

    fn edge(a: &str, b: &str) -> Edge {
        Edge {
            source: NodeId(a.to_string()),
            target: NodeId(b.to_string()),
        }
    }

    #[test]
    fn linear_chain_sorts_in_order() {
        let graph = Graph {
            nodes: vec![node("c"), node("a"), node("b")],
            edges: vec![edge("a", "b"), edge("b", "c")],
        };
        let order = topological_order(&graph).unwrap();
        assert_eq!(
            order,
            vec![NodeId("a".into()), NodeId("b".into()), NodeId("c".into())]
        );
    }

    #[test]
    fn ties_break_by_node_id() {
        let graph = Graph {
            nodes: vec![node("z"), node("a"), node("m")],
            edges: vec![],
        };
        let order = topological_order(&graph).unwrap();
        assert_eq!(
            order,
            vec![NodeId("a".into()), NodeId("m".into()), NodeId("z".into())]
        );
    }

    #[test]
    fn cycle_is_detected() {
        let graph = Graph {
            nodes: vec![node("a"), node("b")],
            edges: vec![edge("a", "b"), edge("b", "a")],
        };
        let err = topological_order(&graph).unwrap_err();
        let mut ids: Vec<String> = err.0.iter().map(|n| n.0.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}

use std::collections::HashSet;

use crate::ir::{Connection, Node, NodeId, NodeMap};

/// Nodes that should be rendered, in traversal order (roots in order, then
/// children in `children` order, depth first).
///
/// Collapsed nodes are shown but not descended into. A child listed in its
/// parent's `hidden_children` is skipped together with its subtree.
pub fn visible_nodes<'a>(nodes: &'a NodeMap, roots: &[NodeId]) -> Vec<&'a Node> {
    let mut out = Vec::new();
    let mut seen: HashSet<&NodeId> = HashSet::new();
    let mut stack: Vec<&NodeId> = roots.iter().rev().collect();
    while let Some(id) = stack.pop() {
        let Some(node) = nodes.get(id) else {
            continue;
        };
        if !seen.insert(&node.id) {
            continue;
        }
        out.push(node);
        if node.is_collapsed {
            continue;
        }
        for child in node.children.iter().rev() {
            if !node.hidden_children.contains(child) {
                stack.push(child);
            }
        }
    }
    out
}

pub fn visible_node_ids(nodes: &NodeMap, roots: &[NodeId]) -> HashSet<NodeId> {
    visible_nodes(nodes, roots)
        .into_iter()
        .map(|node| node.id.clone())
        .collect()
}

/// Connections whose endpoints are both visible.
pub fn visible_connections<'a>(
    nodes: &NodeMap,
    roots: &[NodeId],
    connections: &'a [Connection],
) -> Vec<&'a Connection> {
    let visible = visible_node_ids(nodes, roots);
    connections
        .iter()
        .filter(|conn| visible.contains(&conn.from_node_id) && visible.contains(&conn.to_node_id))
        .collect()
}

use plan_canvas::ir::{Node, NodeId, NodeKind, Orientation, Position};
use plan_canvas::layout::{compute_layout, node_rect, rects_intersect};
use plan_canvas::visibility::{visible_connections, visible_nodes};
use plan_canvas::{EngineConfig, TreeModel};
use proptest::prelude::*;

/// Each entry picks a parent among the earlier nodes, or none for a new root.
fn forest_shape() -> impl Strategy<Value = Vec<Option<prop::sample::Index>>> {
    prop::collection::vec(prop::option::weighted(0.85, any::<prop::sample::Index>()), 1..40)
}

fn build_forest(shape: &[Option<prop::sample::Index>]) -> TreeModel {
    let mut tree = TreeModel::new();
    for (idx, parent) in shape.iter().enumerate() {
        let mut node = Node::new(
            NodeId::new(format!("n{idx:02}")),
            NodeKind::ALL[idx % NodeKind::ALL.len()],
            Position::new(idx as f32 * 13.0, idx as f32 * -7.0),
        );
        if idx > 0
            && let Some(pick) = parent
        {
            node.parent_id = Some(NodeId::new(format!("n{:02}", pick.index(idx))));
        }
        tree.insert(node).unwrap();
    }
    tree
}

fn orientation() -> impl Strategy<Value = Orientation> {
    prop_oneof![Just(Orientation::Horizontal), Just(Orientation::Vertical)]
}

proptest! {
    #[test]
    fn layout_is_deterministic_and_ignores_prior_positions(
        shape in forest_shape(),
        orientation in orientation(),
    ) {
        let config = EngineConfig::default();
        let mut tree = build_forest(&shape);
        let first = compute_layout(tree.nodes(), tree.roots(), orientation, &config);
        tree.apply_positions(&first);
        let second = compute_layout(tree.nodes(), tree.roots(), orientation, &config);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn laid_out_boxes_never_overlap(shape in forest_shape(), orientation in orientation()) {
        let config = EngineConfig::default();
        let tree = build_forest(&shape);
        let positions = compute_layout(tree.nodes(), tree.roots(), orientation, &config);
        prop_assert_eq!(positions.len(), tree.len());
        let rects: Vec<_> = positions
            .values()
            .map(|p| node_rect(*p, config.layout.node_width, config.layout.node_height))
            .collect();
        for (i, a) in rects.iter().enumerate() {
            for b in rects.iter().skip(i + 1) {
                prop_assert!(!rects_intersect(a, b));
            }
        }
    }

    #[test]
    fn collapsing_hides_exactly_the_descendants(
        shape in forest_shape(),
        pick in any::<prop::sample::Index>(),
    ) {
        let mut tree = build_forest(&shape);
        let ids: Vec<NodeId> = tree.nodes().keys().cloned().collect();
        let target = pick.get(&ids).clone();
        tree.toggle_collapse(&target).unwrap();

        let visible: Vec<NodeId> = visible_nodes(tree.nodes(), tree.roots())
            .into_iter()
            .map(|n| n.id.clone())
            .collect();
        let hidden = tree.descendants(&target);
        prop_assert_eq!(visible.len(), tree.len() - hidden.len());
        prop_assert!(hidden.iter().all(|id| !visible.contains(id)));
        let edges = visible_connections(tree.nodes(), tree.roots(), tree.connections());
        prop_assert!(edges.iter().all(|c| visible.contains(&c.from_node_id) && visible.contains(&c.to_node_id)));
    }
}

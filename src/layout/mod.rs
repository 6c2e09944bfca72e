mod collision;
pub(crate) mod types;
pub use collision::*;
pub use types::*;

use std::collections::{HashMap, HashSet};

use crate::config::{EngineConfig, LayoutConfig};
use crate::ir::{NodeId, NodeMap, Orientation, Position};

/// Step sizes along the depth and cross axes. Spacing is treated as a
/// centre-to-centre distance and widened when a box would not fit.
#[derive(Debug, Clone, Copy)]
struct AxisSteps {
    depth: f32,
    cross: f32,
}

fn axis_steps(config: &EngineConfig, orientation: Orientation) -> AxisSteps {
    let layout = &config.layout;
    let pad = config.grid.padding.max(0.0);
    let (depth_size, cross_size) = match orientation {
        Orientation::Horizontal => (layout.node_width, layout.node_height),
        Orientation::Vertical => (layout.node_height, layout.node_width),
    };
    AxisSteps {
        depth: layout.level_spacing.max(depth_size + pad),
        cross: layout.sibling_spacing.max(cross_size + pad),
    }
}

/// Number of leaf slots each subtree needs on the cross axis. Leaves count as 1,
/// inner nodes as the sum of their children, never less than 1.
fn subtree_extents(nodes: &NodeMap, root: &NodeId, extents: &mut HashMap<NodeId, usize>) {
    // Explicit stack so deep plans cannot overflow; post-order via a visited flag.
    let mut stack: Vec<(NodeId, bool)> = vec![(root.clone(), false)];
    let mut entered: HashSet<NodeId> = HashSet::new();
    while let Some((id, children_done)) = stack.pop() {
        let Some(node) = nodes.get(&id) else {
            continue;
        };
        if children_done {
            let total: usize = node
                .children
                .iter()
                .filter_map(|child| extents.get(child))
                .sum();
            extents.insert(id, total.max(1));
            continue;
        }
        if extents.contains_key(&id) || !entered.insert(id.clone()) {
            continue;
        }
        stack.push((id.clone(), true));
        for child in node.children.iter().rev() {
            if nodes.contains_key(child) && !entered.contains(child) {
                stack.push((child.clone(), false));
            }
        }
    }
}

/// Places `root` with its depth coordinate at `depth` and its cross band starting
/// at `band_start`; descendants follow in pre-order.
fn place_subtree(
    nodes: &NodeMap,
    root: &NodeId,
    depth: f32,
    band_start: f32,
    steps: AxisSteps,
    orientation: Orientation,
    extents: &HashMap<NodeId, usize>,
    out: &mut Positions,
) {
    let mut stack: Vec<(NodeId, f32, f32)> = vec![(root.clone(), depth, band_start)];
    while let Some((id, depth, band_start)) = stack.pop() {
        if out.contains_key(&id) {
            continue;
        }
        let Some(node) = nodes.get(&id) else {
            continue;
        };
        let extent = extents.get(&id).copied().unwrap_or(1) as f32;
        let across = band_start + (extent - 1.0) * steps.cross / 2.0;
        out.insert(id.clone(), orientation.to_canvas(depth, across));

        let mut cursor = band_start;
        let mut queued = Vec::with_capacity(node.children.len());
        for child in &node.children {
            if !nodes.contains_key(child) || out.contains_key(child) {
                continue;
            }
            let child_extent = extents.get(child).copied().unwrap_or(1) as f32;
            queued.push((child.clone(), depth + steps.depth, cursor));
            cursor += child_extent * steps.cross;
        }
        stack.extend(queued.into_iter().rev());
    }
}

fn band_width(extent: usize, steps: AxisSteps) -> f32 {
    extent as f32 * steps.cross
}

fn snap_all(positions: &mut Positions, unit: f32) {
    for position in positions.values_mut() {
        *position = snap_to_grid(*position, unit);
    }
}

/// Lays out the whole forest from the configured origin. Roots are stacked along
/// the cross axis in the given order, separated by `tree_gap`.
///
/// The result depends only on tree shape, root order, orientation and config;
/// current node positions are ignored.
pub fn compute_layout(
    nodes: &NodeMap,
    roots: &[NodeId],
    orientation: Orientation,
    config: &EngineConfig,
) -> Positions {
    let steps = axis_steps(config, orientation);
    let LayoutConfig {
        origin, tree_gap, ..
    } = config.layout;
    let (origin_depth, origin_cross) = orientation.to_axes(origin);

    let mut extents = HashMap::new();
    let mut out = Positions::new();
    let mut cursor = origin_cross;
    for root in roots {
        if !nodes.contains_key(root) || out.contains_key(root) {
            continue;
        }
        subtree_extents(nodes, root, &mut extents);
        let extent = extents.get(root).copied().unwrap_or(1);
        place_subtree(
            nodes,
            root,
            origin_depth,
            cursor,
            steps,
            orientation,
            &extents,
            &mut out,
        );
        cursor += band_width(extent, steps) + tree_gap.max(0.0);
    }
    snap_all(&mut out, config.grid.unit);
    out
}

/// Same algorithm scoped to one subtree, pinned at the subtree root's current
/// position. Nothing outside the subtree is touched.
pub fn reorganize_subtree(
    nodes: &NodeMap,
    root: &NodeId,
    orientation: Orientation,
    config: &EngineConfig,
) -> Positions {
    let Some(anchor) = nodes.get(root).map(|node| node.position) else {
        return Positions::new();
    };
    let steps = axis_steps(config, orientation);
    let mut extents = HashMap::new();
    subtree_extents(nodes, root, &mut extents);
    let extent = extents.get(root).copied().unwrap_or(1) as f32;
    let (depth, across) = orientation.to_axes(anchor);
    let band_start = across - (extent - 1.0) * steps.cross / 2.0;

    let mut out = Positions::new();
    place_subtree(
        nodes,
        root,
        depth,
        band_start,
        steps,
        orientation,
        &extents,
        &mut out,
    );
    snap_all(&mut out, config.grid.unit);
    // The pinned root keeps its exact position even if it is off-grid.
    out.insert(root.clone(), anchor);
    out
}

/// Bounding box of the given positions, as `(x, y, width, height)`.
pub fn layout_bounds(positions: &Positions, config: &LayoutConfig) -> Option<Rect> {
    let mut iter = positions.values();
    let first = iter.next()?;
    let (mut min_x, mut min_y) = (first.x, first.y);
    let (mut max_x, mut max_y) = (first.x, first.y);
    for pos in iter {
        min_x = min_x.min(pos.x);
        min_y = min_y.min(pos.y);
        max_x = max_x.max(pos.x);
        max_y = max_y.max(pos.y);
    }
    Some((
        min_x,
        min_y,
        max_x - min_x + config.node_width,
        max_y - min_y + config.node_height,
    ))
}

pub(crate) fn default_origin(config: &EngineConfig) -> Position {
    snap_to_grid(config.layout.origin, config.grid.unit)
}

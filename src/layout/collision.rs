// Grid snapping and single-node overlap avoidance. Used where a full relayout
// would move unrelated parts of the plan: new nodes, drops onto the canvas.

use std::collections::HashSet;

use super::types::{Placement, Rect, inflate_rect, node_rect, overlap_extents, rect_center};
use crate::config::EngineConfig;
use crate::ir::{Node, NodeId, NodeMap, Orientation, Position};

pub fn snap_to_grid(pos: Position, unit: f32) -> Position {
    if unit <= 0.0 || !unit.is_finite() {
        return pos;
    }
    Position::new((pos.x / unit).round() * unit, (pos.y / unit).round() * unit)
}

fn snap_up(distance: f32, unit: f32) -> f32 {
    if unit <= 0.0 {
        return distance;
    }
    (distance / unit).ceil() * unit
}

fn padded_rect(pos: Position, config: &EngineConfig) -> Rect {
    inflate_rect(
        node_rect(pos, config.layout.node_width, config.layout.node_height),
        config.grid.padding,
    )
}

/// Nearest node (by centre distance) whose padded box intersects the candidate.
fn nearest_conflict(
    nodes: &NodeMap,
    target: Option<&NodeId>,
    candidate: &Rect,
    config: &EngineConfig,
) -> Option<Rect> {
    let (cx, cy) = rect_center(candidate);
    let mut best: Option<(f32, Rect)> = None;
    for node in nodes.values() {
        if Some(&node.id) == target {
            continue;
        }
        let other = padded_rect(node.position, config);
        let (ox, oy) = overlap_extents(candidate, &other);
        if ox <= 0.0 || oy <= 0.0 {
            continue;
        }
        let (nx, ny) = rect_center(&other);
        let dist = (nx - cx).powi(2) + (ny - cy).powi(2);
        // Ties resolve to the first node in id order.
        if best.map(|(d, _)| dist < d).unwrap_or(true) {
            best = Some((dist, other));
        }
    }
    best.map(|(_, rect)| rect)
}

fn cell_key(pos: Position, unit: f32) -> (i64, i64) {
    let unit = if unit > 0.0 { unit } else { 1.0 };
    ((pos.x / unit).round() as i64, (pos.y / unit).round() as i64)
}

/// Moves `candidate` until its padded box is clear of every other node.
///
/// Each step pushes away from the nearest conflicting node along the axis with
/// the larger overlap, by the overlap rounded up to the grid. If a position
/// repeats, or half the attempt budget is spent, the search switches to sweeping
/// down the y axis, which always terminates because y only grows. When the
/// budget runs out the last attempt is returned with `exhausted` set.
pub fn prevent_overlap(
    nodes: &NodeMap,
    target: Option<&NodeId>,
    candidate: Position,
    config: &EngineConfig,
) -> Placement {
    let unit = config.grid.unit;
    let max_attempts = config.grid.max_attempts.max(1);
    let mut pos = snap_to_grid(candidate, unit);
    let mut visited = HashSet::new();
    let mut sweeping = false;

    for attempt in 0..max_attempts {
        let rect = padded_rect(pos, config);
        let Some(other) = nearest_conflict(nodes, target, &rect, config) else {
            return Placement {
                position: pos,
                attempts: attempt,
                exhausted: false,
            };
        };
        visited.insert(cell_key(pos, unit));
        if attempt * 2 >= max_attempts {
            sweeping = true;
        }

        let (ox, oy) = overlap_extents(&rect, &other);
        let (cx, cy) = rect_center(&rect);
        let (nx, ny) = rect_center(&other);
        // Distance that puts the candidate's top edge at the conflict's bottom edge.
        let below = snap_up((other.1 + other.3) - rect.1, unit);
        let mut next = if sweeping {
            Position::new(pos.x, pos.y + below)
        } else if ox >= oy {
            let dir = if cx >= nx { 1.0 } else { -1.0 };
            Position::new(pos.x + dir * snap_up(ox, unit), pos.y)
        } else {
            let dir = if cy >= ny { 1.0 } else { -1.0 };
            Position::new(pos.x, pos.y + dir * snap_up(oy, unit))
        };
        next = snap_to_grid(next, unit);
        if !sweeping && visited.contains(&cell_key(next, unit)) {
            sweeping = true;
            next = snap_to_grid(Position::new(pos.x, pos.y + below), unit);
        }
        pos = next;
    }

    let exhausted = nearest_conflict(nodes, target, &padded_rect(pos, config), config).is_some();
    if exhausted {
        tracing::warn!(
            attempts = max_attempts,
            x = pos.x,
            y = pos.y,
            "overlap search exhausted; using best-effort position"
        );
    }
    Placement {
        position: pos,
        attempts: max_attempts,
        exhausted,
    }
}

/// Suggested position for a new (or re-parented) node.
///
/// Without a parent the node goes right of the rightmost root, or to the origin
/// on an empty canvas. With a parent it is offset along the orientation axis and
/// shifted across by the number of siblings already present.
pub fn smart_position(
    nodes: &NodeMap,
    roots: &[NodeId],
    parent: Option<&Node>,
    target: Option<&NodeId>,
    orientation: Orientation,
    config: &EngineConfig,
) -> Placement {
    let grid = &config.grid;
    let candidate = match parent {
        None => {
            let rightmost = roots
                .iter()
                .filter(|id| Some(*id) != target)
                .filter_map(|id| nodes.get(id))
                .max_by(|a, b| a.position.x.total_cmp(&b.position.x));
            match rightmost {
                Some(root) => Position::new(
                    root.position.x + config.layout.node_width + grid.root_gap,
                    root.position.y,
                ),
                None => super::default_origin(config),
            }
        }
        Some(parent) => {
            let siblings = parent
                .children
                .iter()
                .filter(|id| Some(*id) != target)
                .count() as f32;
            let offset = orientation.to_canvas(grid.child_offset, siblings * grid.sibling_offset);
            parent.position.offset(offset.x, offset.y)
        }
    };
    prevent_overlap(nodes, target, candidate, config)
}

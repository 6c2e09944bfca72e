use std::collections::BTreeMap;

use crate::ir::{NodeId, Position};

/// Computed positions keyed by node id.
pub type Positions = BTreeMap<NodeId, Position>;

/// Axis-aligned box as `(x, y, width, height)`.
pub type Rect = (f32, f32, f32, f32);

pub fn node_rect(position: Position, width: f32, height: f32) -> Rect {
    (position.x, position.y, width, height)
}

pub fn inflate_rect(rect: Rect, pad: f32) -> Rect {
    if pad <= 0.0 {
        return rect;
    }
    (
        rect.0 - pad / 2.0,
        rect.1 - pad / 2.0,
        rect.2 + pad,
        rect.3 + pad,
    )
}

/// Overlap of two rects along each axis; both positive means they intersect.
pub fn overlap_extents(a: &Rect, b: &Rect) -> (f32, f32) {
    let x = (a.0 + a.2).min(b.0 + b.2) - a.0.max(b.0);
    let y = (a.1 + a.3).min(b.1 + b.3) - a.1.max(b.1);
    (x, y)
}

pub fn rects_intersect(a: &Rect, b: &Rect) -> bool {
    let (x, y) = overlap_extents(a, b);
    x > 0.0 && y > 0.0
}

pub fn rect_center(rect: &Rect) -> (f32, f32) {
    (rect.0 + rect.2 / 2.0, rect.1 + rect.3 / 2.0)
}

/// Result of a single-node placement search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub position: Position,
    pub attempts: usize,
    /// The attempt bound was hit before a free spot was found.
    pub exhausted: bool,
}

impl Placement {
    /// The position, or `PlacementExhausted` when no free spot was found.
    pub fn clear_position(&self) -> crate::error::Result<Position> {
        if self.exhausted {
            return Err(crate::error::CanvasError::PlacementExhausted {
                attempts: self.attempts,
            });
        }
        Ok(self.position)
    }
}

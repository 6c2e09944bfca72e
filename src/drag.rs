//! Pointer-driven drag state machine.
//!
//! ```text
//! Idle --start--> Dragging --end--> Settling --ack | deadline--> Idle
//!                    |
//!                    +--cancel--> Idle
//! ```
//!
//! Only the dragged node moves while the pointer is down, at most once per frame
//! interval. Nothing here talks to persistence: `end` hands back the ids whose
//! position changed and the caller enqueues them in one pass.
//!
//! All methods take the current instant so the machine can be driven
//! deterministically.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::config::{DragConfig, EngineConfig};
use crate::error::{Result, ValidationError};
use crate::ir::{NodeId, Orientation, Position};
use crate::layout::{reorganize_subtree, snap_to_grid};
use crate::tree::TreeModel;

#[derive(Debug, Clone, PartialEq)]
pub struct ActiveDrag {
    pub node_id: NodeId,
    pointer_origin: Position,
    node_origin: Position,
    /// Pre-drag positions of the dragged subtree, used for cancel and change detection.
    snapshot: BTreeMap<NodeId, Position>,
    last_frame: Option<Instant>,
    pending_pointer: Option<Position>,
}

impl ActiveDrag {
    fn target_for(&self, pointer: Position) -> Position {
        let (dx, dy) = self.pointer_origin.delta_to(pointer);
        self.node_origin.offset(dx, dy)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum DragPhase {
    #[default]
    Idle,
    Dragging(ActiveDrag),
    Settling {
        node_id: NodeId,
        changed: Vec<NodeId>,
        deadline: Instant,
    },
}

#[derive(Debug, Clone, Default)]
pub struct DragCoordinator {
    config: DragConfig,
    phase: DragPhase,
}

impl DragCoordinator {
    pub fn new(config: DragConfig) -> Self {
        Self {
            config,
            phase: DragPhase::Idle,
        }
    }

    pub fn phase(&self) -> &DragPhase {
        &self.phase
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, DragPhase::Idle)
    }

    pub fn is_dragging(&self) -> bool {
        matches!(self.phase, DragPhase::Dragging(_))
    }

    pub fn active_node(&self) -> Option<&NodeId> {
        match &self.phase {
            DragPhase::Idle => None,
            DragPhase::Dragging(drag) => Some(&drag.node_id),
            DragPhase::Settling { node_id, .. } => Some(node_id),
        }
    }

    /// True when remote position updates for `id` must not be applied: the node is
    /// part of the dragged subtree, or its new position has not been accepted yet.
    pub fn blocks(&self, id: &NodeId) -> bool {
        match &self.phase {
            DragPhase::Idle => false,
            DragPhase::Dragging(drag) => drag.snapshot.contains_key(id),
            DragPhase::Settling { changed, .. } => changed.contains(id),
        }
    }

    pub fn start(
        &mut self,
        tree: &mut TreeModel,
        id: &NodeId,
        pointer: Position,
        now: Instant,
    ) -> Result<()> {
        self.tick(now);
        if let Some(active) = self.active_node() {
            return Err(ValidationError::DragInProgress(active.clone()).into());
        }
        let node_origin = tree.require(id)?.position;
        let subtree = tree.subtree(id);
        let snapshot = subtree
            .iter()
            .filter_map(|member| tree.node(member).map(|n| (member.clone(), n.position)))
            .collect();
        tree.set_dragging(&subtree, true);
        tracing::debug!(node = %id, "drag started");
        self.phase = DragPhase::Dragging(ActiveDrag {
            node_id: id.clone(),
            pointer_origin: pointer,
            node_origin,
            snapshot,
            last_frame: None,
            pending_pointer: None,
        });
        Ok(())
    }

    /// Moves the dragged node to follow the pointer. Frames closer together than the
    /// frame interval are held back; the latest held pointer is applied on the next
    /// accepted frame or at release. Returns the applied position, if any.
    pub fn update(
        &mut self,
        tree: &mut TreeModel,
        pointer: Position,
        now: Instant,
    ) -> Result<Option<Position>> {
        let DragPhase::Dragging(drag) = &mut self.phase else {
            return Err(ValidationError::NoActiveDrag.into());
        };
        if let Some(last) = drag.last_frame
            && now.saturating_duration_since(last) < self.config.frame_interval()
        {
            drag.pending_pointer = Some(pointer);
            return Ok(None);
        }
        let position = drag.target_for(pointer);
        tree.set_position(&drag.node_id, position)?;
        drag.last_frame = Some(now);
        drag.pending_pointer = None;
        Ok(Some(position))
    }

    /// Releases the drag: snaps the node, re-flows its subtree around the new
    /// position and returns every node whose position differs from before the drag.
    pub fn end(
        &mut self,
        tree: &mut TreeModel,
        pointer: Option<Position>,
        orientation: Orientation,
        config: &EngineConfig,
        now: Instant,
    ) -> Result<Vec<NodeId>> {
        let drag = self.take_active()?;
        let root = drag.node_id.clone();
        let final_pointer = pointer.or(drag.pending_pointer);
        let raw = match final_pointer {
            Some(pointer) => drag.target_for(pointer),
            None => tree.require(&root)?.position,
        };
        tree.set_position(&root, snap_to_grid(raw, config.grid.unit))?;
        if tree.has_descendants(&root) {
            let positions = reorganize_subtree(tree.nodes(), &root, orientation, config);
            tree.apply_positions(&positions);
        }
        tree.clear_dragging();

        let changed: Vec<NodeId> = drag
            .snapshot
            .iter()
            .filter(|(id, before)| tree.node(id).is_some_and(|n| n.position != **before))
            .map(|(id, _)| id.clone())
            .collect();
        tracing::debug!(node = %root, changed = changed.len(), "drag released");
        if !changed.is_empty() {
            self.phase = DragPhase::Settling {
                node_id: root,
                changed: changed.clone(),
                deadline: now + self.config.settle_delay(),
            };
        }
        Ok(changed)
    }

    /// Abandons the drag and puts the subtree back where it started.
    pub fn cancel(&mut self, tree: &mut TreeModel) -> Result<()> {
        let drag = self.take_active()?;
        tree.apply_positions(&drag.snapshot);
        tree.clear_dragging();
        tracing::debug!(node = %drag.node_id, "drag cancelled");
        Ok(())
    }

    fn take_active(&mut self) -> Result<ActiveDrag> {
        match std::mem::take(&mut self.phase) {
            DragPhase::Dragging(drag) => Ok(drag),
            other => {
                self.phase = other;
                Err(ValidationError::NoActiveDrag.into())
            }
        }
    }

    /// Ends settling once its deadline has passed. Returns true on that transition.
    pub fn tick(&mut self, now: Instant) -> bool {
        if let DragPhase::Settling { deadline, .. } = &self.phase
            && now >= *deadline
        {
            self.phase = DragPhase::Idle;
            return true;
        }
        false
    }

    /// Ends settling early when every changed node has been saved.
    pub fn acknowledge(&mut self, saved: &[NodeId]) -> bool {
        if let DragPhase::Settling { changed, .. } = &self.phase
            && changed.iter().all(|id| saved.contains(id))
        {
            self.phase = DragPhase::Idle;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::{id, sample};
    use std::time::Duration;

    fn laid_out() -> TreeModel {
        let mut tree = sample();
        let positions = crate::layout::compute_layout(
            tree.nodes(),
            tree.roots(),
            Orientation::Horizontal,
            &EngineConfig::default(),
        );
        tree.apply_positions(&positions);
        tree
    }

    #[test]
    fn update_moves_only_the_dragged_node() {
        let mut tree = laid_out();
        let before = tree.positions();
        let mut drag = DragCoordinator::default();
        let t0 = Instant::now();
        drag.start(&mut tree, &id("B"), Position::new(10.0, 10.0), t0).unwrap();
        assert!(tree.node(&id("B")).unwrap().is_dragging);
        assert!(tree.node(&id("D")).unwrap().is_dragging);

        let applied = drag
            .update(&mut tree, Position::new(40.0, 25.0), t0)
            .unwrap();
        assert_eq!(applied, Some(before[&id("B")].offset(30.0, 15.0)));
        assert_eq!(tree.node(&id("D")).unwrap().position, before[&id("D")]);
        assert_eq!(tree.node(&id("A")).unwrap().position, before[&id("A")]);
    }

    #[test]
    fn frames_inside_interval_are_held_back() {
        let mut tree = laid_out();
        let mut drag = DragCoordinator::default();
        let t0 = Instant::now();
        drag.start(&mut tree, &id("A"), Position::default(), t0).unwrap();
        assert!(drag.update(&mut tree, Position::new(5.0, 0.0), t0).unwrap().is_some());
        let held = drag
            .update(&mut tree, Position::new(9.0, 0.0), t0 + Duration::from_millis(4))
            .unwrap();
        assert!(held.is_none());
        let next = drag
            .update(&mut tree, Position::new(12.0, 0.0), t0 + Duration::from_millis(16))
            .unwrap();
        assert!(next.is_some());
    }

    #[test]
    fn release_snaps_and_reflows_subtree() {
        let mut tree = laid_out();
        let config = EngineConfig::default();
        let mut drag = DragCoordinator::default();
        let t0 = Instant::now();
        let a = tree.node(&id("A")).unwrap().position;
        drag.start(&mut tree, &id("A"), Position::default(), t0).unwrap();
        let changed = drag
            .end(
                &mut tree,
                Some(Position::new(53.0, 31.0)),
                Orientation::Horizontal,
                &config,
                t0,
            )
            .unwrap();
        let moved = tree.node(&id("A")).unwrap().position;
        assert_eq!(moved, snap_to_grid(a.offset(53.0, 31.0), 20.0));
        assert_eq!(changed, vec![id("A"), id("B"), id("C"), id("D")]);
        assert!(tree.nodes().values().all(|n| !n.is_dragging));
        let b = tree.node(&id("B")).unwrap().position;
        assert_eq!(b.x, moved.x + config.layout.level_spacing);
        assert!(matches!(drag.phase(), DragPhase::Settling { .. }));
    }

    #[test]
    fn start_is_rejected_until_settled() {
        let mut tree = laid_out();
        let config = EngineConfig::default();
        let mut drag = DragCoordinator::default();
        let t0 = Instant::now();
        drag.start(&mut tree, &id("C"), Position::default(), t0).unwrap();
        assert!(drag.start(&mut tree, &id("B"), Position::default(), t0).is_err());
        drag.end(
            &mut tree,
            Some(Position::new(0.0, 400.0)),
            Orientation::Horizontal,
            &config,
            t0,
        )
        .unwrap();
        assert!(drag.blocks(&id("C")));
        assert!(drag.start(&mut tree, &id("B"), Position::default(), t0).is_err());

        let later = t0 + Duration::from_millis(150);
        drag.start(&mut tree, &id("B"), Position::default(), later).unwrap();
        assert!(drag.is_dragging());
    }

    #[test]
    fn acknowledge_requires_every_changed_node() {
        let mut tree = laid_out();
        let config = EngineConfig::default();
        let mut drag = DragCoordinator::default();
        let t0 = Instant::now();
        drag.start(&mut tree, &id("B"), Position::default(), t0).unwrap();
        let changed = drag
            .end(
                &mut tree,
                Some(Position::new(0.0, 600.0)),
                Orientation::Horizontal,
                &config,
                t0,
            )
            .unwrap();
        assert_eq!(changed, vec![id("B"), id("D")]);
        assert!(!drag.acknowledge(&[id("B")]));
        assert!(drag.acknowledge(&[id("B"), id("D")]));
        assert!(drag.is_idle());
    }

    #[test]
    fn cancel_restores_original_positions() {
        let mut tree = laid_out();
        let before = tree.positions();
        let mut drag = DragCoordinator::default();
        let t0 = Instant::now();
        drag.start(&mut tree, &id("B"), Position::default(), t0).unwrap();
        drag.update(&mut tree, Position::new(300.0, 300.0), t0).unwrap();
        drag.cancel(&mut tree).unwrap();
        assert_eq!(tree.positions(), before);
        assert!(drag.is_idle());
        assert!(drag.cancel(&mut tree).is_err());
    }

    #[test]
    fn release_without_movement_goes_straight_to_idle() {
        let mut tree = laid_out();
        let mut drag = DragCoordinator::default();
        let t0 = Instant::now();
        drag.start(&mut tree, &id("D"), Position::default(), t0).unwrap();
        let changed = drag
            .end(&mut tree, None, Orientation::Horizontal, &EngineConfig::default(), t0)
            .unwrap();
        assert!(changed.is_empty());
        assert!(drag.is_idle());
    }
}

//! Command surface for one plan canvas.
//!
//! `Canvas` owns the tree, the view state, the drag machine and the write-back
//! queue. Every command applies locally first; persistence follows and never
//! rolls a local change back.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::drag::{DragCoordinator, DragPhase};
use crate::error::{CanvasError, Result, ValidationError};
use crate::ir::{
    CanvasState, Connection, ContentUpdate, Node, NodeId, NodeKind, NodeMap, NodePatch, NodeSpec,
    Orientation, PlanDocument, Position,
};
use crate::layout::{compute_layout, prevent_overlap, reorganize_subtree, smart_position, snap_to_grid};
use crate::persistence::{
    FlushReport, PersistenceCollaborator, PersistenceQueue, QueueEvent, QueueStatus, StructuralOp,
};
use crate::tree::TreeModel;
use crate::visibility::{visible_connections, visible_nodes};

pub struct Canvas<S: PersistenceCollaborator> {
    tree: TreeModel,
    state: CanvasState,
    config: EngineConfig,
    drag: DragCoordinator,
    queue: PersistenceQueue<S>,
}

impl<S: PersistenceCollaborator> Canvas<S> {
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        let state = CanvasState {
            orientation: config.orientation,
            ..CanvasState::default()
        };
        Self::with_tree(TreeModel::new(), state, store, config)
    }

    /// Loads a saved plan. The document's canvas state wins over the configured
    /// orientation.
    pub fn from_document(doc: &PlanDocument, store: Arc<S>, config: EngineConfig) -> Result<Self> {
        let tree = TreeModel::from_document(doc)?;
        let mut state = CanvasState::default();
        state.orientation = doc.canvas.orientation;
        state.pan_zoom(doc.canvas.pan, doc.canvas.zoom);
        Ok(Self::with_tree(tree, state, store, config))
    }

    fn with_tree(tree: TreeModel, state: CanvasState, store: Arc<S>, config: EngineConfig) -> Self {
        let queue = PersistenceQueue::new(store, config.persistence.clone());
        Self {
            tree,
            state,
            drag: DragCoordinator::new(config.drag.clone()),
            config,
            queue,
        }
    }

    pub fn to_document(&self) -> PlanDocument {
        PlanDocument {
            nodes: self.tree.to_document(),
            canvas: self.state,
        }
    }

    pub fn tree(&self) -> &TreeModel {
        &self.tree
    }

    pub fn nodes(&self) -> &NodeMap {
        self.tree.nodes()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.tree.node(id)
    }

    pub fn connections(&self) -> &[Connection] {
        self.tree.connections()
    }

    pub fn canvas_state(&self) -> &CanvasState {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &PersistenceQueue<S> {
        &self.queue
    }

    pub fn drag_phase(&self) -> &DragPhase {
        self.drag.phase()
    }

    pub fn visible_nodes(&self) -> Vec<&Node> {
        visible_nodes(self.tree.nodes(), self.tree.roots())
    }

    pub fn visible_connections(&self) -> Vec<&Connection> {
        visible_connections(self.tree.nodes(), self.tree.roots(), self.tree.connections())
    }

    pub fn status(&self) -> QueueStatus {
        self.queue.status()
    }

    pub fn pending_count(&self) -> usize {
        self.status().pending_count
    }

    pub fn is_flushing(&self) -> bool {
        self.queue.is_flushing()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.queue.subscribe()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<QueueStatus> {
        self.queue.subscribe_status()
    }

    fn ensure_not_dragging(&self) -> Result<()> {
        match self.drag.phase() {
            DragPhase::Dragging(active) => {
                Err(ValidationError::DragInProgress(active.node_id.clone()).into())
            }
            _ => Ok(()),
        }
    }

    fn enqueue_positions(&self, ids: &[NodeId]) {
        for id in ids {
            if let Some(node) = self.tree.node(id) {
                self.queue.enqueue(id.clone(), NodePatch::position(node.position));
            }
        }
    }

    /// Adds a node of `kind`, under `parent` when given. Without a position the node
    /// gets a smart position; a given position is snapped and moved clear of
    /// other nodes.
    ///
    /// The node exists once this returns. If the store rejects the create, the
    /// failure is reported on the event channel and the node shows as unsaved
    /// until the call is replayed by a later flush.
    pub async fn create_node(
        &mut self,
        kind: NodeKind,
        parent: Option<&NodeId>,
        position: Option<Position>,
    ) -> Result<NodeId> {
        let parent_node = match parent {
            Some(parent) => Some(self.tree.require(parent)?.clone()),
            None => None,
        };
        let placement = match position {
            Some(position) => prevent_overlap(self.tree.nodes(), None, position, &self.config),
            None => smart_position(
                self.tree.nodes(),
                self.tree.roots(),
                parent_node.as_ref(),
                None,
                self.state.orientation,
                &self.config,
            ),
        };
        let mut node = Node::new(NodeId::generate(), kind, placement.position);
        node.parent_id = parent.cloned();
        let spec = NodeSpec::from(&node);
        let mut id = node.id.clone();
        self.tree.insert(node)?;
        tracing::debug!(node = %id, ?kind, "node created");

        match self.queue.submit_structural(StructuralOp::Create(spec)).await {
            Ok(Some(assigned)) if assigned != id => {
                self.tree.rename_leaf(&id, assigned.clone())?;
                id = assigned;
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(node = %id, error = %err, "create not saved; kept locally"),
        }
        Ok(id)
    }

    pub fn update_content(&mut self, id: &NodeId, update: ContentUpdate) -> Result<()> {
        let patch = self.tree.update_content(id, update)?;
        self.queue.enqueue(id.clone(), patch);
        Ok(())
    }

    /// Moves a single node, snapped to the grid. Returns the applied position.
    pub fn update_position(&mut self, id: &NodeId, position: Position) -> Result<Position> {
        if self.drag.blocks(id) && self.drag.is_dragging() {
            return Err(ValidationError::DragInProgress(id.clone()).into());
        }
        let snapped = snap_to_grid(position, self.config.grid.unit);
        if self.tree.set_position(id, snapped)? {
            self.queue.enqueue(id.clone(), NodePatch::position(snapped));
        }
        Ok(snapped)
    }

    pub fn toggle_collapse(&mut self, id: &NodeId) -> Result<bool> {
        let collapsed = self.tree.toggle_collapse(id)?;
        self.queue.enqueue(
            id.clone(),
            NodePatch {
                is_collapsed: Some(collapsed),
                ..Default::default()
            },
        );
        Ok(collapsed)
    }

    pub fn toggle_child_visibility(&mut self, parent: &NodeId, child: &NodeId) -> Result<bool> {
        let hidden = self.tree.toggle_child_visibility(parent, child)?;
        let set = self.tree.require(parent)?.hidden_children.clone();
        self.queue.enqueue(
            parent.clone(),
            NodePatch {
                hidden_children: Some(set),
                ..Default::default()
            },
        );
        Ok(hidden)
    }

    /// Deletes `id` and its descendants. Returns the removed ids in pre-order.
    pub async fn delete_node(&mut self, id: &NodeId) -> Result<Vec<NodeId>> {
        self.tree.require(id)?;
        let doomed = self.tree.subtree(id);
        if let Some(active) = self.drag.active_node()
            && self.drag.is_dragging()
            && doomed.iter().any(|member| self.drag.blocks(member))
        {
            return Err(ValidationError::DragInProgress(active.clone()).into());
        }
        self.queue.forget(&doomed);
        self.flush().await;

        let parent = self.tree.require(id)?.parent_id.clone();
        let removed: Vec<NodeId> = self
            .tree
            .remove_subtree(id)?
            .into_iter()
            .map(|node| node.id)
            .collect();
        if let Some(parent) = parent
            && let Some(parent_node) = self.tree.node(&parent)
        {
            let hidden = parent_node.hidden_children.clone();
            self.queue.enqueue(
                parent,
                NodePatch {
                    hidden_children: Some(hidden),
                    ..Default::default()
                },
            );
        }
        tracing::debug!(node = %id, removed = removed.len(), "subtree deleted");

        // Leaves first so the store never sees an orphan.
        let mut first_error = None;
        for removed_id in removed.iter().rev() {
            let op = StructuralOp::Delete(removed_id.clone());
            if let Err(err) = self.queue.submit_structural(op).await {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(CanvasError::Persistence(err)),
            None => Ok(removed),
        }
    }

    /// Moves `id` under `target`, or to the root level when `target` is `None`.
    /// Returns every node whose position changed.
    pub async fn reattach_node(&mut self, id: &NodeId, target: Option<&NodeId>) -> Result<Vec<NodeId>> {
        self.tree.validate_reattach(id, target)?;
        self.ensure_not_dragging()?;
        self.flush().await;

        let before = self.tree.positions();
        self.tree.reattach(id, target)?;
        let parent = target.and_then(|target| self.tree.node(target)).cloned();
        let placement = smart_position(
            self.tree.nodes(),
            self.tree.roots(),
            parent.as_ref(),
            Some(id),
            self.state.orientation,
            &self.config,
        );
        let origin = self.tree.require(id)?.position;
        let (dx, dy) = origin.delta_to(placement.position);
        self.tree.set_position(id, placement.position)?;
        if self.tree.has_descendants(id) {
            let descendants = self.tree.descendants(id);
            self.tree.translate(&descendants, dx, dy);
            let positions = reorganize_subtree(self.tree.nodes(), id, self.state.orientation, &self.config);
            self.tree.apply_positions(&positions);
        }
        if self.config.layout.reflow_after_reattach {
            let positions = compute_layout(
                self.tree.nodes(),
                self.tree.roots(),
                self.state.orientation,
                &self.config,
            );
            self.tree.apply_positions(&positions);
        }

        let moved: Vec<NodeId> = self
            .tree
            .nodes()
            .iter()
            .filter(|(node_id, node)| before.get(*node_id) != Some(&node.position))
            .map(|(node_id, _)| node_id.clone())
            .collect();
        self.enqueue_positions(&moved);
        self.queue.enqueue(
            id.clone(),
            NodePatch {
                parent_id: Some(target.cloned()),
                ..Default::default()
            },
        );
        tracing::debug!(node = %id, parent = ?target, moved = moved.len(), "node reattached");

        let op = StructuralOp::Reattach {
            id: id.clone(),
            parent: target.cloned(),
        };
        self.queue.submit_structural(op).await?;
        Ok(moved)
    }

    /// Switches the layout axis and re-lays the whole plan.
    pub fn set_orientation(&mut self, orientation: Orientation) -> Result<Vec<NodeId>> {
        if self.state.orientation == orientation {
            return Ok(Vec::new());
        }
        self.ensure_not_dragging()?;
        self.state.orientation = orientation;
        self.relayout()
    }

    /// Full layout of every tree. Returns the ids that moved; each is queued for write.
    pub fn relayout(&mut self) -> Result<Vec<NodeId>> {
        self.ensure_not_dragging()?;
        let positions = compute_layout(
            self.tree.nodes(),
            self.tree.roots(),
            self.state.orientation,
            &self.config,
        );
        let moved = self.tree.apply_positions(&positions);
        self.enqueue_positions(&moved);
        Ok(moved)
    }

    pub fn pan_zoom(&mut self, pan: Position, zoom: f32) {
        self.state.pan_zoom(pan, zoom);
    }

    /// Begins a drag. No store call is made until the drag is released.
    pub fn start_drag(&mut self, id: &NodeId, pointer: Position) -> Result<()> {
        self.drag.start(&mut self.tree, id, pointer, Instant::now())?;
        self.queue.hold();
        Ok(())
    }

    pub fn drag_to(&mut self, pointer: Position) -> Result<Option<Position>> {
        self.drag.update(&mut self.tree, pointer, Instant::now())
    }

    /// Releases the drag and queues every moved node in one pass.
    pub fn end_drag(&mut self, pointer: Option<Position>) -> Result<Vec<NodeId>> {
        let changed = self.drag.end(
            &mut self.tree,
            pointer,
            self.state.orientation,
            &self.config,
            Instant::now(),
        )?;
        self.enqueue_positions(&changed);
        self.queue.release();
        Ok(changed)
    }

    pub fn cancel_drag(&mut self) -> Result<()> {
        self.drag.cancel(&mut self.tree)?;
        self.queue.release();
        Ok(())
    }

    /// Advances time-based drag state. Returns true when settling finished.
    pub fn tick(&mut self) -> bool {
        self.drag.tick(Instant::now())
    }

    /// Writes everything pending now, replaying rejected structural calls first.
    pub async fn flush(&mut self) -> FlushReport {
        let report = self.queue.flush().await;
        self.drag.acknowledge(&report.saved);
        self.drag.tick(Instant::now());
        report
    }

    pub async fn retry_failed(&mut self) -> FlushReport {
        tracing::info!(unsaved = self.status().unsaved.len(), "retrying failed writes");
        self.flush().await
    }

    /// Applies a change made elsewhere. Skipped entirely while the node has a local
    /// write outstanding, and its position is skipped while a drag holds it, so a
    /// stale server value never bounces a local edit. Returns true if applied;
    /// unknown nodes are ignored.
    pub fn apply_remote_update(&mut self, id: &NodeId, patch: &NodePatch) -> Result<bool> {
        if !self.tree.contains(id) {
            return Ok(false);
        }
        if self.queue.has_local_write(id) {
            tracing::debug!(node = %id, "remote update skipped; local write outstanding");
            return Ok(false);
        }
        let mut patch = patch.clone();
        if self.drag.blocks(id) {
            patch.position = None;
        }
        self.tree.apply_patch(id, &patch)
    }
}

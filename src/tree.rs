//! In-memory plan forest.
//!
//! `TreeModel` is the only owner of nodes. Every structural change goes through
//! it so that the parent/child links, the derived connections and the root order
//! stay consistent:
//!
//! - `parent.children` contains `id` iff `node.parent_id == parent.id`
//! - `hidden_children ⊆ children`
//! - parent chains never revisit a node
//! - exactly one connection per non-root node
//!
//! Validation happens before mutation, so a rejected command leaves the model
//! untouched.

use std::collections::{BTreeMap, HashSet};

use crate::error::{Result, ValidationError};
use crate::ir::{
    Connection, ContentUpdate, Node, NodeId, NodeMap, NodePatch, PlanDocument, Position,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreeModel {
    nodes: NodeMap,
    roots: Vec<NodeId>,
    connections: Vec<Connection>,
}

impl TreeModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a model from a loaded document, checking every structural invariant.
    pub fn from_document(doc: &PlanDocument) -> Result<Self> {
        Self::from_nodes(doc.nodes.clone())
    }

    pub fn from_nodes(list: Vec<Node>) -> Result<Self> {
        let mut nodes = NodeMap::new();
        let mut roots = Vec::new();
        for mut node in list {
            node.is_dragging = false;
            if node.parent_id.is_none() {
                roots.push(node.id.clone());
            }
            let id = node.id.clone();
            if nodes.insert(id.clone(), node).is_some() {
                return Err(malformed(format!("duplicate node id '{id}'")).into());
            }
        }

        for node in nodes.values() {
            if let Some(parent_id) = &node.parent_id {
                let parent = nodes.get(parent_id).ok_or_else(|| {
                    malformed(format!("'{}' references missing parent '{parent_id}'", node.id))
                })?;
                if !parent.children.contains(&node.id) {
                    return Err(malformed(format!(
                        "'{parent_id}' does not list child '{}'",
                        node.id
                    ))
                    .into());
                }
            }
            let mut seen = HashSet::new();
            for child_id in &node.children {
                if !seen.insert(child_id) {
                    return Err(malformed(format!(
                        "'{}' lists child '{child_id}' twice",
                        node.id
                    ))
                    .into());
                }
                let child = nodes.get(child_id).ok_or_else(|| {
                    malformed(format!("'{}' lists missing child '{child_id}'", node.id))
                })?;
                if child.parent_id.as_ref() != Some(&node.id) {
                    return Err(malformed(format!(
                        "'{child_id}' is listed under '{}' but has another parent",
                        node.id
                    ))
                    .into());
                }
            }
            if let Some(stray) = node
                .hidden_children
                .iter()
                .find(|id| !node.children.contains(id))
            {
                return Err(malformed(format!(
                    "'{}' hides '{stray}' which is not its child",
                    node.id
                ))
                .into());
            }
        }

        let mut model = Self {
            nodes,
            roots,
            connections: Vec::new(),
        };
        let reachable = model.traverse_all().len();
        if reachable != model.nodes.len() {
            return Err(malformed("parent links form a cycle".to_string()).into());
        }
        model.rebuild_connections();
        Ok(model)
    }

    pub fn to_document(&self) -> Vec<Node> {
        self.traverse_all()
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).cloned())
            .collect()
    }

    pub fn nodes(&self) -> &NodeMap {
        &self.nodes
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    pub fn require(&self, id: &NodeId) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| ValidationError::UnknownNode(id.clone()).into())
    }

    /// Inserts a fresh node, linking it under `node.parent_id` when set.
    pub fn insert(&mut self, mut node: Node) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(malformed(format!("duplicate node id '{}'", node.id)).into());
        }
        if let Some(parent_id) = &node.parent_id {
            self.require(parent_id)?;
        }
        node.children.clear();
        node.hidden_children.clear();
        node.is_dragging = false;
        let id = node.id.clone();
        match node.parent_id.clone() {
            Some(parent_id) => {
                if let Some(parent) = self.nodes.get_mut(&parent_id) {
                    parent.children.push(id.clone());
                }
                self.connections.push(Connection::between(&parent_id, &id));
            }
            None => self.roots.push(id.clone()),
        }
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Pre-order list of `id` and everything below it.
    pub fn subtree(&self, id: &NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![id.clone()];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            if !seen.insert(current.clone()) {
                continue;
            }
            out.push(current);
            for child in node.children.iter().rev() {
                stack.push(child.clone());
            }
        }
        out
    }

    pub fn descendants(&self, id: &NodeId) -> Vec<NodeId> {
        let mut all = self.subtree(id);
        if !all.is_empty() {
            all.remove(0);
        }
        all
    }

    pub fn has_descendants(&self, id: &NodeId) -> bool {
        self.nodes
            .get(id)
            .map(|node| !node.children.is_empty())
            .unwrap_or(false)
    }

    pub fn is_descendant(&self, ancestor: &NodeId, candidate: &NodeId) -> bool {
        let mut seen = HashSet::new();
        let mut current = self.nodes.get(candidate).and_then(|n| n.parent_id.as_ref());
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            if !seen.insert(id) {
                return false;
            }
            current = self.nodes.get(id).and_then(|n| n.parent_id.as_ref());
        }
        false
    }

    pub fn positions(&self) -> BTreeMap<NodeId, Position> {
        self.nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.position))
            .collect()
    }

    pub fn set_position(&mut self, id: &NodeId, position: Position) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ValidationError::UnknownNode(id.clone()))?;
        let changed = node.position != position;
        node.position = position;
        Ok(changed)
    }

    /// Writes every position in `positions`; returns ids whose position actually moved.
    pub fn apply_positions(&mut self, positions: &BTreeMap<NodeId, Position>) -> Vec<NodeId> {
        let mut moved = Vec::new();
        for (id, position) in positions {
            if let Some(node) = self.nodes.get_mut(id)
                && node.position != *position
            {
                node.position = *position;
                moved.push(id.clone());
            }
        }
        moved
    }

    pub fn translate(&mut self, ids: &[NodeId], dx: f32, dy: f32) {
        for id in ids {
            if let Some(node) = self.nodes.get_mut(id) {
                node.position = node.position.offset(dx, dy);
            }
        }
    }

    /// Applies a content edit and returns the patch describing it.
    pub fn update_content(&mut self, id: &NodeId, update: ContentUpdate) -> Result<NodePatch> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ValidationError::UnknownNode(id.clone()))?;
        let mut patch = NodePatch::default();
        if let Some(title) = update.title {
            node.title = title.clone();
            patch.title = Some(title);
        }
        if let Some(description) = update.description {
            node.description = description.clone();
            patch.description = Some(description);
        }
        if let Some(data) = update.type_specific_data {
            node.type_specific_data = data.clone();
            patch.type_specific_data = Some(data);
        }
        Ok(patch)
    }

    pub fn set_dragging(&mut self, ids: &[NodeId], dragging: bool) {
        for id in ids {
            if let Some(node) = self.nodes.get_mut(id) {
                node.is_dragging = dragging;
            }
        }
    }

    pub fn clear_dragging(&mut self) {
        for node in self.nodes.values_mut() {
            node.is_dragging = false;
        }
    }

    pub fn toggle_collapse(&mut self, id: &NodeId) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ValidationError::UnknownNode(id.clone()))?;
        node.is_collapsed = !node.is_collapsed;
        Ok(node.is_collapsed)
    }

    /// Flips membership of `child` in `parent.hidden_children`. Returns true when
    /// the child is now hidden.
    pub fn toggle_child_visibility(&mut self, parent: &NodeId, child: &NodeId) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(parent)
            .ok_or_else(|| ValidationError::UnknownNode(parent.clone()))?;
        if !node.children.contains(child) {
            return Err(ValidationError::NotAChild {
                parent: parent.clone(),
                child: child.clone(),
            }
            .into());
        }
        if node.hidden_children.remove(child) {
            Ok(false)
        } else {
            node.hidden_children.insert(child.clone());
            Ok(true)
        }
    }

    /// Checks whether `id` may move under `target` without mutating anything.
    pub fn validate_reattach(&self, id: &NodeId, target: Option<&NodeId>) -> Result<()> {
        self.require(id)?;
        let Some(target) = target else {
            return Ok(());
        };
        self.require(target)?;
        if id == target {
            return Err(ValidationError::SelfAttachment(id.clone()).into());
        }
        if self.is_descendant(id, target) {
            return Err(ValidationError::Cycle {
                node: id.clone(),
                target: target.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Moves `id` under `target` (or to the root level). Positions are untouched.
    pub fn reattach(&mut self, id: &NodeId, target: Option<&NodeId>) -> Result<()> {
        self.validate_reattach(id, target)?;
        self.detach(id);
        let Some(node) = self.nodes.get_mut(id) else {
            return Ok(());
        };
        node.parent_id = target.cloned();
        match target {
            Some(target) => {
                if let Some(parent) = self.nodes.get_mut(target) {
                    parent.children.push(id.clone());
                }
                self.connections.push(Connection::between(target, id));
            }
            None => self.roots.push(id.clone()),
        }
        Ok(())
    }

    /// Removes `id` and its whole subtree, together with every touching connection.
    pub fn remove_subtree(&mut self, id: &NodeId) -> Result<Vec<Node>> {
        self.require(id)?;
        self.detach(id);
        let doomed = self.subtree(id);
        let doomed_set: HashSet<&NodeId> = doomed.iter().collect();
        self.connections
            .retain(|conn| !doomed_set.contains(&conn.from_node_id) && !doomed_set.contains(&conn.to_node_id));
        let removed = doomed
            .iter()
            .filter_map(|doomed_id| self.nodes.remove(doomed_id))
            .collect();
        Ok(removed)
    }

    /// Re-keys a childless node, e.g. when the store assigns its own id on create.
    pub fn rename_leaf(&mut self, from: &NodeId, to: NodeId) -> Result<()> {
        if from == &to {
            return Ok(());
        }
        if self.nodes.contains_key(&to) {
            return Err(malformed(format!("duplicate node id '{to}'")).into());
        }
        if self.has_descendants(from) {
            return Err(malformed(format!("'{from}' has children and cannot be re-keyed")).into());
        }
        let mut node = self
            .nodes
            .remove(from)
            .ok_or_else(|| ValidationError::UnknownNode(from.clone()))?;
        node.id = to.clone();
        match &node.parent_id {
            Some(parent_id) => {
                if let Some(parent) = self.nodes.get_mut(parent_id) {
                    for child in parent.children.iter_mut().filter(|child| *child == from) {
                        *child = to.clone();
                    }
                    if parent.hidden_children.remove(from) {
                        parent.hidden_children.insert(to.clone());
                    }
                }
                for conn in self.connections.iter_mut().filter(|conn| &conn.to_node_id == from) {
                    *conn = Connection::between(parent_id, &to);
                }
            }
            None => {
                for root in self.roots.iter_mut().filter(|root| *root == from) {
                    *root = to.clone();
                }
            }
        }
        self.nodes.insert(to, node);
        Ok(())
    }

    /// Applies a patch that came from outside the local edit path. Structural
    /// fields are ignored; hidden children are filtered to actual children.
    /// Returns true when anything changed.
    pub fn apply_patch(&mut self, id: &NodeId, patch: &NodePatch) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| ValidationError::UnknownNode(id.clone()))?;
        let before = node.clone();
        if let Some(title) = &patch.title {
            node.title = title.clone();
        }
        if let Some(description) = &patch.description {
            node.description = description.clone();
        }
        if let Some(position) = patch.position {
            node.position = position;
        }
        if let Some(collapsed) = patch.is_collapsed {
            node.is_collapsed = collapsed;
        }
        if let Some(hidden) = &patch.hidden_children {
            node.hidden_children = hidden
                .iter()
                .filter(|child| node.children.contains(child))
                .cloned()
                .collect();
        }
        if let Some(data) = &patch.type_specific_data {
            node.type_specific_data = data.clone();
        }
        Ok(*node != before)
    }

    fn detach(&mut self, id: &NodeId) {
        let parent_id = self.nodes.get(id).and_then(|n| n.parent_id.clone());
        match parent_id {
            Some(parent_id) => {
                if let Some(parent) = self.nodes.get_mut(&parent_id) {
                    parent.children.retain(|child| child != id);
                    parent.hidden_children.remove(id);
                }
                self.connections
                    .retain(|conn| !(conn.from_node_id == parent_id && &conn.to_node_id == id));
            }
            None => self.roots.retain(|root| root != id),
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent_id = None;
        }
    }

    fn traverse_all(&self) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for root in &self.roots {
            out.extend(self.subtree(root));
        }
        out
    }

    fn rebuild_connections(&mut self) {
        let mut connections = Vec::new();
        for id in self.traverse_all() {
            if let Some(node) = self.nodes.get(&id) {
                for child in &node.children {
                    connections.push(Connection::between(&id, child));
                }
            }
        }
        self.connections = connections;
    }
}

fn malformed(message: String) -> ValidationError {
    ValidationError::Malformed(message)
}

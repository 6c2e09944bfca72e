use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Objective,
    Outcome,
    Opportunity,
    Solution,
    Assumption,
    Metric,
    Research,
}

impl NodeKind {
    pub const ALL: [NodeKind; 7] = [
        NodeKind::Objective,
        NodeKind::Outcome,
        NodeKind::Opportunity,
        NodeKind::Solution,
        NodeKind::Assumption,
        NodeKind::Metric,
        NodeKind::Research,
    ];

    pub fn from_token(token: &str) -> Option<Self> {
        match token.trim().to_ascii_lowercase().as_str() {
            "objective" => Some(Self::Objective),
            "outcome" => Some(Self::Outcome),
            "opportunity" => Some(Self::Opportunity),
            "solution" => Some(Self::Solution),
            "assumption" => Some(Self::Assumption),
            "metric" => Some(Self::Metric),
            "research" => Some(Self::Research),
            _ => None,
        }
    }

    pub fn default_title(self) -> &'static str {
        match self {
            Self::Objective => "New Objective",
            Self::Outcome => "New Outcome",
            Self::Opportunity => "New Opportunity",
            Self::Solution => "New Solution",
            Self::Assumption => "New Assumption",
            Self::Metric => "New Metric",
            Self::Research => "New Research",
        }
    }

    pub fn default_description(self) -> &'static str {
        match self {
            Self::Objective => "Describe the objective",
            Self::Outcome => "Describe the desired outcome",
            Self::Opportunity => "Describe the customer opportunity",
            Self::Solution => "Describe the proposed solution",
            Self::Assumption => "Describe the assumption to test",
            Self::Metric => "Describe how this is measured",
            Self::Research => "Describe the research activity",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Horizontal,
    Vertical,
}

impl Orientation {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "horizontal" | "LR" => Some(Self::Horizontal),
            "vertical" | "TD" | "TB" => Some(Self::Vertical),
            _ => None,
        }
    }

    /// Converts (depth, cross) axis offsets into canvas (x, y).
    pub fn to_canvas(self, along: f32, across: f32) -> Position {
        match self {
            Self::Horizontal => Position::new(along, across),
            Self::Vertical => Position::new(across, along),
        }
    }

    /// Splits a canvas position into (depth, cross) axis components.
    pub fn to_axes(self, pos: Position) -> (f32, f32) {
        match self {
            Self::Horizontal => (pos.x, pos.y),
            Self::Vertical => (pos.y, pos.x),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }

    pub fn delta_to(self, other: Position) -> (f32, f32) {
        (other.x - self.x, other.y - self.y)
    }
}

pub type TypeData = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub title: String,
    pub description: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub children: Vec<NodeId>,
    #[serde(default)]
    pub is_collapsed: bool,
    #[serde(default)]
    pub hidden_children: BTreeSet<NodeId>,
    #[serde(skip)]
    pub is_dragging: bool,
    #[serde(default)]
    pub type_specific_data: TypeData,
}

impl Node {
    pub fn new(id: NodeId, kind: NodeKind, position: Position) -> Self {
        Self {
            id,
            kind,
            title: kind.default_title().to_string(),
            description: kind.default_description().to_string(),
            position,
            parent_id: None,
            children: Vec::new(),
            is_collapsed: false,
            hidden_children: BTreeSet::new(),
            is_dragging: false,
            type_specific_data: TypeData::new(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub id: String,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
}

impl Connection {
    pub fn between(from: &NodeId, to: &NodeId) -> Self {
        Self {
            id: format!("{from}->{to}"),
            from_node_id: from.clone(),
            to_node_id: to.clone(),
        }
    }

    pub fn touches(&self, id: &NodeId) -> bool {
        &self.from_node_id == id || &self.to_node_id == id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasState {
    pub zoom: f32,
    pub pan: Position,
    pub orientation: Orientation,
}

impl CanvasState {
    pub const MIN_ZOOM: f32 = 0.1;
    pub const MAX_ZOOM: f32 = 3.0;

    pub fn pan_zoom(&mut self, pan: Position, zoom: f32) {
        if pan.x.is_finite() && pan.y.is_finite() {
            self.pan = pan;
        }
        if zoom.is_finite() {
            self.zoom = zoom.clamp(Self::MIN_ZOOM, Self::MAX_ZOOM);
        }
    }
}

impl Default for CanvasState {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan: Position::default(),
            orientation: Orientation::Horizontal,
        }
    }
}

/// Sparse update for a single node. Unset fields are left untouched when applied
/// and when merged into another patch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// `Some(None)` detaches the node to the root level.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    pub parent_id: Option<Option<NodeId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_collapsed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden_children: Option<BTreeSet<NodeId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_specific_data: Option<TypeData>,
}

impl NodePatch {
    pub fn position(position: Position) -> Self {
        Self {
            position: Some(position),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn merge(&mut self, newer: NodePatch) {
        if newer.title.is_some() {
            self.title = newer.title;
        }
        if newer.description.is_some() {
            self.description = newer.description;
        }
        if newer.position.is_some() {
            self.position = newer.position;
        }
        if newer.parent_id.is_some() {
            self.parent_id = newer.parent_id;
        }
        if newer.is_collapsed.is_some() {
            self.is_collapsed = newer.is_collapsed;
        }
        if newer.hidden_children.is_some() {
            self.hidden_children = newer.hidden_children;
        }
        if newer.type_specific_data.is_some() {
            self.type_specific_data = newer.type_specific_data;
        }
    }
}

// Distinguishes an explicit `null` from an absent field.
fn deserialize_present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Content fields a caller may edit directly.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub type_specific_data: Option<TypeData>,
}

/// What the store receives when a node is created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub title: String,
    pub description: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<NodeId>,
    #[serde(default)]
    pub type_specific_data: TypeData,
}

impl From<&Node> for NodeSpec {
    fn from(node: &Node) -> Self {
        Self {
            id: node.id.clone(),
            kind: node.kind,
            title: node.title.clone(),
            description: node.description.clone(),
            position: node.position,
            parent_id: node.parent_id.clone(),
            type_specific_data: node.type_specific_data.clone(),
        }
    }
}

/// Serialized form of a whole plan: nodes in a stable order plus the canvas view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanDocument {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub canvas: CanvasState,
}

impl PlanDocument {
    /// Parses a saved plan. Strict JSON first, then JSON5 for hand-written files.
    pub fn parse(input: &str) -> anyhow::Result<Self> {
        match serde_json::from_str(input) {
            Ok(doc) => Ok(doc),
            Err(json_err) => json5::from_str(input)
                .map_err(|_| anyhow::anyhow!("invalid plan document: {json_err}")),
        }
    }
}

pub type NodeMap = BTreeMap<NodeId, Node>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_patch_fields_win_and_unset_fields_survive() {
        let mut patch = NodePatch {
            title: Some("first".to_string()),
            description: Some("keep".to_string()),
            ..Default::default()
        };
        patch.merge(NodePatch {
            title: Some("second".to_string()),
            position: Some(Position::new(20.0, 40.0)),
            ..Default::default()
        });
        assert_eq!(patch.title.as_deref(), Some("second"));
        assert_eq!(patch.description.as_deref(), Some("keep"));
        assert_eq!(patch.position, Some(Position::new(20.0, 40.0)));
    }

    #[test]
    fn detach_patch_serializes_explicit_null_parent() {
        let patch = NodePatch {
            parent_id: Some(None),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        assert_eq!(json, serde_json::json!({ "parentId": null }));
        let back: NodePatch = serde_json::from_value(json).unwrap();
        assert_eq!(back.parent_id, Some(None));
    }

    #[test]
    fn pan_zoom_clamps_and_ignores_non_finite() {
        let mut state = CanvasState::default();
        state.pan_zoom(Position::new(10.0, 5.0), 12.0);
        assert_eq!(state.zoom, CanvasState::MAX_ZOOM);
        state.pan_zoom(Position::new(f32::NAN, 0.0), 0.01);
        assert_eq!(state.zoom, CanvasState::MIN_ZOOM);
        assert_eq!(state.pan, Position::new(10.0, 5.0));
    }

    #[test]
    fn node_kinds_round_trip_tokens() {
        for kind in NodeKind::ALL {
            let token = serde_json::to_value(kind).unwrap();
            let parsed = NodeKind::from_token(token.as_str().unwrap());
            assert_eq!(parsed, Some(kind));
        }
    }
}

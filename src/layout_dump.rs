use crate::config::EngineConfig;
use crate::ir::{Orientation, PlanDocument};
use crate::layout::{Positions, compute_layout, layout_bounds};
use crate::tree::TreeModel;
use crate::visibility::{visible_connections, visible_node_ids};
use serde::Serialize;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutDump {
    pub orientation: Orientation,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub nodes: Vec<NodeDump>,
    pub connections: Vec<ConnectionDump>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDump {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub parent_id: Option<String>,
    pub collapsed: bool,
    pub hidden: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDump {
    pub id: String,
    pub from: String,
    pub to: String,
}

impl LayoutDump {
    /// Dumps `tree` at `positions`, in pre-order. With `visible_only` set, nodes
    /// hidden by collapse or hide flags and their connections are left out;
    /// otherwise they are included and marked `hidden`.
    pub fn from_positions(
        tree: &TreeModel,
        positions: &Positions,
        orientation: Orientation,
        config: &EngineConfig,
        visible_only: bool,
    ) -> Self {
        let visible = visible_node_ids(tree.nodes(), tree.roots());
        let mut nodes = Vec::new();
        let mut placed = Positions::new();
        for node in tree.to_document() {
            let hidden = !visible.contains(&node.id);
            if hidden && visible_only {
                continue;
            }
            let position = positions.get(&node.id).copied().unwrap_or(node.position);
            placed.insert(node.id.clone(), position);
            nodes.push(NodeDump {
                id: node.id.to_string(),
                kind: serde_json::to_value(node.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                title: node.title,
                x: position.x,
                y: position.y,
                width: config.layout.node_width,
                height: config.layout.node_height,
                parent_id: node.parent_id.map(|p| p.to_string()),
                collapsed: node.is_collapsed,
                hidden,
            });
        }

        let connections = if visible_only {
            visible_connections(tree.nodes(), tree.roots(), tree.connections())
        } else {
            tree.connections().iter().collect()
        };
        let connections = connections
            .into_iter()
            .map(|conn| ConnectionDump {
                id: conn.id.clone(),
                from: conn.from_node_id.to_string(),
                to: conn.to_node_id.to_string(),
            })
            .collect();

        let (x, y, width, height) =
            layout_bounds(&placed, &config.layout).unwrap_or((0.0, 0.0, 0.0, 0.0));
        LayoutDump {
            orientation,
            x,
            y,
            width,
            height,
            nodes,
            connections,
        }
    }

    /// Lays out a loaded document from scratch and dumps the result.
    pub fn from_document(
        doc: &PlanDocument,
        orientation: Orientation,
        config: &EngineConfig,
        visible_only: bool,
    ) -> anyhow::Result<Self> {
        let tree = TreeModel::from_document(doc)?;
        let positions = compute_layout(tree.nodes(), tree.roots(), orientation, config);
        Ok(Self::from_positions(
            &tree,
            &positions,
            orientation,
            config,
            visible_only,
        ))
    }
}

/// Writes the dump as pretty JSON to `path`, or stdout when `None`.
pub fn write_layout_dump(path: Option<&Path>, dump: &LayoutDump) -> anyhow::Result<()> {
    match path {
        Some(path) => {
            let file = File::create(path)?;
            let writer = BufWriter::new(file);
            serde_json::to_writer_pretty(writer, dump)?;
        }
        None => {
            let stdout = io::stdout();
            let mut writer = BufWriter::new(stdout.lock());
            serde_json::to_writer_pretty(&mut writer, dump)?;
            writeln!(writer)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::{id, sample};

    #[test]
    fn dump_marks_hidden_nodes_or_drops_them() {
        let mut tree = sample();
        tree.toggle_collapse(&id("B")).unwrap();
        let doc = PlanDocument {
            nodes: tree.to_document(),
            ..Default::default()
        };
        let config = EngineConfig::default();

        let full = LayoutDump::from_document(&doc, Orientation::Horizontal, &config, false).unwrap();
        assert_eq!(full.nodes.len(), 4);
        assert_eq!(full.connections.len(), 3);
        assert!(full.nodes.iter().any(|n| n.id == "D" && n.hidden));
        assert_eq!(full.nodes[0].kind, "opportunity");

        let visible = LayoutDump::from_document(&doc, Orientation::Horizontal, &config, true).unwrap();
        let ids: Vec<&str> = visible.nodes.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C"]);
        assert_eq!(visible.connections.len(), 2);
        assert_eq!((visible.x, visible.y), (100.0, 100.0));
    }

    #[test]
    fn dump_serializes_camel_case() {
        let tree = sample();
        let positions = tree.positions();
        let dump = LayoutDump::from_positions(
            &tree,
            &positions,
            Orientation::Vertical,
            &EngineConfig::default(),
            false,
        );
        let value = serde_json::to_value(&dump).unwrap();
        assert_eq!(value["orientation"], "vertical");
        assert_eq!(value["nodes"][1]["parentId"], "A");
        assert_eq!(value["connections"][0]["id"], "A->B");
    }
}

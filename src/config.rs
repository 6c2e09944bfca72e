use crate::ir::{Orientation, Position};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    pub node_width: f32,
    pub node_height: f32,
    pub level_spacing: f32,
    pub sibling_spacing: f32,
    pub tree_gap: f32,
    pub origin: Position,
    /// Run a full relayout after a reattach instead of only re-flowing the moved subtree.
    pub reflow_after_reattach: bool,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            node_width: 300.0,
            node_height: 144.0,
            level_spacing: 400.0,
            sibling_spacing: 200.0,
            tree_gap: 200.0,
            origin: Position::new(100.0, 100.0),
            reflow_after_reattach: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub unit: f32,
    pub padding: f32,
    pub max_attempts: usize,
    pub child_offset: f32,
    pub sibling_offset: f32,
    pub root_gap: f32,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            unit: 20.0,
            padding: 20.0,
            max_attempts: 50,
            child_offset: 400.0,
            sibling_offset: 200.0,
            root_gap: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DragConfig {
    pub frame_interval_ms: u64,
    pub settle_delay_ms: u64,
}

impl DragConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl Default for DragConfig {
    fn default() -> Self {
        Self {
            frame_interval_ms: 16,
            settle_delay_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub debounce_ms: u64,
    pub batch_size: usize,
    pub inter_batch_pause_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
}

impl PersistenceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn inter_batch_pause(&self) -> Duration {
        Duration::from_millis(self.inter_batch_pause_ms)
    }

    /// Delay before retry number `attempt` (1-based): base, 2×base, 4×base, ...
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_backoff_ms.saturating_mul(factor))
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 400,
            batch_size: 20,
            inter_batch_pause_ms: 50,
            max_retries: 3,
            base_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub orientation: Orientation,
    pub layout: LayoutConfig,
    pub grid: GridConfig,
    pub drag: DragConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutConfigFile {
    node_width: Option<f32>,
    node_height: Option<f32>,
    level_spacing: Option<f32>,
    sibling_spacing: Option<f32>,
    tree_gap: Option<f32>,
    origin: Option<Position>,
    reflow_after_reattach: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GridConfigFile {
    unit: Option<f32>,
    padding: Option<f32>,
    max_attempts: Option<usize>,
    child_offset: Option<f32>,
    sibling_offset: Option<f32>,
    root_gap: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DragConfigFile {
    frame_interval_ms: Option<u64>,
    settle_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistenceConfigFile {
    debounce_ms: Option<u64>,
    batch_size: Option<usize>,
    inter_batch_pause_ms: Option<u64>,
    max_retries: Option<u32>,
    base_backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    orientation: Option<String>,
    layout: Option<LayoutConfigFile>,
    grid: Option<GridConfigFile>,
    drag: Option<DragConfigFile>,
    persistence: Option<PersistenceConfigFile>,
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> anyhow::Result<EngineConfig> {
    let parsed: ConfigFile = match serde_json::from_str(contents) {
        Ok(parsed) => parsed,
        Err(json_err) => json5::from_str(contents)
            .map_err(|_| anyhow::anyhow!("invalid config file: {json_err}"))?,
    };
    let mut config = EngineConfig::default();

    if let Some(token) = parsed.orientation.as_deref() {
        config.orientation = Orientation::from_token(token)
            .ok_or_else(|| anyhow::anyhow!("unknown orientation '{token}'"))?;
    }

    if let Some(layout) = parsed.layout {
        if let Some(v) = layout.node_width {
            config.layout.node_width = v;
        }
        if let Some(v) = layout.node_height {
            config.layout.node_height = v;
        }
        if let Some(v) = layout.level_spacing {
            config.layout.level_spacing = v;
        }
        if let Some(v) = layout.sibling_spacing {
            config.layout.sibling_spacing = v;
        }
        if let Some(v) = layout.tree_gap {
            config.layout.tree_gap = v;
        }
        if let Some(v) = layout.origin {
            config.layout.origin = v;
        }
        if let Some(v) = layout.reflow_after_reattach {
            config.layout.reflow_after_reattach = v;
        }
    }

    if let Some(grid) = parsed.grid {
        if let Some(v) = grid.unit {
            config.grid.unit = v;
        }
        if let Some(v) = grid.padding {
            config.grid.padding = v;
        }
        if let Some(v) = grid.max_attempts {
            config.grid.max_attempts = v;
        }
        if let Some(v) = grid.child_offset {
            config.grid.child_offset = v;
        }
        if let Some(v) = grid.sibling_offset {
            config.grid.sibling_offset = v;
        }
        if let Some(v) = grid.root_gap {
            config.grid.root_gap = v;
        }
    }

    if let Some(drag) = parsed.drag {
        if let Some(v) = drag.frame_interval_ms {
            config.drag.frame_interval_ms = v;
        }
        if let Some(v) = drag.settle_delay_ms {
            config.drag.settle_delay_ms = v;
        }
    }

    if let Some(persistence) = parsed.persistence {
        if let Some(v) = persistence.debounce_ms {
            config.persistence.debounce_ms = v;
        }
        if let Some(v) = persistence.batch_size {
            config.persistence.batch_size = v.max(1);
        }
        if let Some(v) = persistence.inter_batch_pause_ms {
            config.persistence.inter_batch_pause_ms = v;
        }
        if let Some(v) = persistence.max_retries {
            config.persistence.max_retries = v;
        }
        if let Some(v) = persistence.base_backoff_ms {
            config.persistence.base_backoff_ms = v;
        }
    }

    if config.grid.unit <= 0.0 || !config.grid.unit.is_finite() {
        return Err(anyhow::anyhow!("grid unit must be a positive number"));
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_yields_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.layout.node_width, 300.0);
        assert_eq!(config.grid.unit, 20.0);
        assert_eq!(config.grid.max_attempts, 50);
        assert_eq!(config.persistence.batch_size, 20);
    }

    #[test]
    fn overlays_only_present_fields() {
        let config = parse_config(
            r#"{ "orientation": "vertical", "layout": { "levelSpacing": 300 }, "persistence": { "debounceMs": 500 } }"#,
        )
        .unwrap();
        assert_eq!(config.orientation, Orientation::Vertical);
        assert_eq!(config.layout.level_spacing, 300.0);
        assert_eq!(config.layout.sibling_spacing, 200.0);
        assert_eq!(config.persistence.debounce_ms, 500);
        assert_eq!(config.persistence.max_retries, 3);
    }

    #[test]
    fn accepts_json5_comments_and_trailing_commas() {
        let config = parse_config(
            r#"{
                // coarser grid for presentations
                grid: { unit: 40, },
            }"#,
        )
        .unwrap();
        assert_eq!(config.grid.unit, 40.0);
    }

    #[test]
    fn rejects_unknown_orientation_and_bad_grid() {
        assert!(parse_config(r#"{ "orientation": "diagonal" }"#).is_err());
        assert!(parse_config(r#"{ "grid": { "unit": 0 } }"#).is_err());
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = PersistenceConfig::default();
        assert_eq!(config.backoff(1), Duration::from_millis(200));
        assert_eq!(config.backoff(2), Duration::from_millis(400));
        assert_eq!(config.backoff(3), Duration::from_millis(800));
    }
}

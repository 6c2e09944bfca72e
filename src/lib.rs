pub mod canvas;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod drag;
pub mod error;
pub mod ir;
pub mod layout;
pub mod layout_dump;
pub mod persistence;
pub mod tree;
pub mod visibility;

pub use canvas::Canvas;
#[cfg(feature = "cli")]
pub use cli::run;
pub use config::{EngineConfig, load_config};
pub use error::{CanvasError, Result, StoreError, ValidationError};
pub use ir::{Node, NodeId, NodeKind, NodePatch, Orientation, PlanDocument, Position};
pub use persistence::{MemoryStore, PersistenceCollaborator, PersistenceQueue};
pub use tree::TreeModel;

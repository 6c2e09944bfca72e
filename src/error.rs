use crate::ir::NodeId;

pub type Result<T> = std::result::Result<T, CanvasError>;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CanvasError {
    #[error("invalid operation: {0}")]
    Validation(#[from] ValidationError),
    #[error("no free position found after {attempts} attempts")]
    PlacementExhausted { attempts: usize },
    #[error("store rejected write: {0}")]
    Persistence(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("unknown node '{0}'")]
    UnknownNode(NodeId),
    #[error("node '{0}' cannot be attached to itself")]
    SelfAttachment(NodeId),
    #[error("attaching '{node}' under '{target}' would create a cycle")]
    Cycle { node: NodeId, target: NodeId },
    #[error("'{child}' is not a child of '{parent}'")]
    NotAChild { parent: NodeId, child: NodeId },
    #[error("a drag is already in progress for '{0}'")]
    DragInProgress(NodeId),
    #[error("no drag in progress")]
    NoActiveDrag,
    #[error("malformed document: {0}")]
    Malformed(String),
}

/// Failure reported by a persistence collaborator. Always treated as retryable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

use std::path::PathBuf;

use qnet_core::engine::EngineError;

/// Errors that can occur while loading or running a scene.
#[derive(Debug, thiserror::Error)]
pub enum SceneError {
    /// A link or script entry names a node the scene does not define.
    #[error("scene node '{id}' not found")]
    NodeNotFound { id: String },

    /// Two scene nodes share an id.
    #[error("scene node '{id}' defined twice")]
    DuplicateNode { id: String },

    /// A probability or fraction is not a finite number.
    #[error("{field} must be a finite number, got {value}")]
    InvalidNumber { field: String, value: f64 },

    /// `suppress` names an event type that does not exist.
    #[error("unknown event type '{name}'")]
    UnknownEventKind { name: String },

    /// Only `.ron` and `.json` scene files are understood.
    #[error("unsupported scene format: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Failed to parse a scene file.
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The engine rejected part of the scene.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

use thiserror::Error;

/// Errors raised while talking to the computation engine.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to start engine process `{command}`: {reason}")]
    Spawn { command: String, reason: String },
    #[error("engine connection lost: {0}")]
    Disconnected(String),
    #[error("engine evaluation failed: {0}")]
    Evaluation(String),
    #[error("library `{library}` could not be loaded (required by {required_by})")]
    LibraryNotLoaded {
        library: String,
        required_by: String,
    },
    #[error("engine session was interrupted")]
    Interrupted,
    #[error("the computation engine is disabled")]
    Disabled,
}

impl EngineError {
    /// Whether retrying on a fresh session may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Disconnected(_))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Disconnected(err.to_string())
    }
}

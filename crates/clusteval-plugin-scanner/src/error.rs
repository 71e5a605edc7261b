use std::path::PathBuf;

use clusteval_plugin_host::LoadError;
use thiserror::Error;

/// Why a discovery candidate could not be installed.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{}: {message}", .path.display())]
    Invalid { path: PathBuf, message: String },
}

impl ScanError {
    /// The candidate waits for something else to be discovered first.
    pub fn is_postponed(&self) -> bool {
        matches!(self, ScanError::Load(err) if err.is_postponed())
    }
}

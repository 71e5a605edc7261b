use std::path::PathBuf;

use clusteval_plugin_sdk::{CapabilityId, CapabilityKind};
use thiserror::Error;

/// Errors that can occur while loading a plugin archive.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("`{}` does not follow the `<Name>{suffix}` naming convention", .path.display())]
    NameConvention { path: PathBuf, suffix: &'static str },
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid manifest {}: {source}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid requirement `{0}`")]
    InvalidRequirement(String),
    #[error("no built-in {kind} named `{name}`")]
    UnknownFactory { kind: CapabilityKind, name: String },
    #[error("archive declares a {found} but lives in the {expected} directory")]
    WrongKind {
        expected: CapabilityKind,
        found: CapabilityKind,
    },
    #[error("archive provides `{found}` instead of `{expected}`")]
    NameMismatch { expected: String, found: String },
    #[error("failed to load plugin library: {0}")]
    Library(#[from] libloading::Error),
    #[error("plugin library {} does not export `clusteval_plugin_entrypoint`", .path.display())]
    MissingEntrypoint { path: PathBuf },
    #[error("plugin panicked during construction: {0}")]
    Panicked(String),
    #[error("waiting for {}", format_missing(.missing))]
    Unsatisfied { missing: Vec<CapabilityId> },
}

impl LoadError {
    /// Postponed archives are retried on the next cycle regardless of their
    /// timestamp.
    pub fn is_postponed(&self) -> bool {
        matches!(self, LoadError::Unsatisfied { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LoadError::Io {
            path: path.into(),
            source,
        }
    }
}

fn format_missing(missing: &[CapabilityId]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

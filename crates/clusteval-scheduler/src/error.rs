use clusteval_plugin_sdk::CapabilityError;
use clusteval_registry::RegistryError;
use clusteval_rengine::EngineError;
use clusteval_run::{ResultStoreError, RunError};
use thiserror::Error;

use crate::JobId;

/// Why the scheduler refused a request.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Results(#[from] ResultStoreError),
    #[error("run `{run}` is already being executed as job {job}")]
    AlreadyActive { run: String, job: JobId },
    #[error("the scheduler is shutting down")]
    ShuttingDown,
}

/// Failure while executing one runnable.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Lookup(#[from] RegistryError),
    #[error("executor panicked: {0}")]
    Panicked(String),
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    /// A fresh attempt on a new engine session may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutionError::Capability(err) => err.is_transient(),
            ExecutionError::Engine(err) => err.is_transient(),
            _ => false,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        match self {
            ExecutionError::Cancelled => true,
            ExecutionError::Capability(err) => err.is_cancellation(),
            ExecutionError::Engine(err) => *err == EngineError::Interrupted,
            _ => false,
        }
    }
}

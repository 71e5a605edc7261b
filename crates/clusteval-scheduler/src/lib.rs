//! Run scheduler: a bounded pool of worker threads executing the runnables
//! of submitted runs, each worker with its own engine session.

mod config;
mod error;
mod executor;
mod job;
mod scheduler;

pub use config::{default_workers, SchedulerConfig, DEFAULT_MAX_RETRIES, DEFAULT_SHUTDOWN_GRACE};
pub use error::{ExecutionError, SchedulerError};
pub use executor::{invoke, ExecutionContext, ExecutionOutput, ProgramExecutor, RunnableExecutor};
pub use job::{ActiveRunnable, Job, JobId, JobStatus, OptimizationStatus, PairOptimization};
pub use scheduler::Scheduler;

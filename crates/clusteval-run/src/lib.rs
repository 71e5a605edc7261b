//! Runs and runnables: run definitions, their validation against the
//! capability registry, decomposition into runnables with a forward-only
//! status, parameter optimization, and the on-disk layout of run results.

mod definition;
mod finder;
mod optimization;
mod resolve;
mod results;
mod runnable;
mod status;

pub use definition::{
    DataConfig, ParameterPoint, ProgramConfig, ProgramParameter, RunDefinition, RunMode,
};
pub use finder::{RunCatalog, RunFinder, RUN_FILE_SUFFIX, RUN_FINDER_NAME};
pub use optimization::{
    best_points, BestPoint, CompletedRunnables, Grid, LayeredSearch, OptimizationPlan,
    OptimizationStrategy, Optimum, ParameterSpace, Samples,
};
pub use resolve::{ResolvedRun, RunError};
pub use results::{ResultId, ResultStore, ResultStoreError, ResultSummary, RunnableArtifact};
pub use runnable::{
    decompose, decompose_resuming, Decomposition, Runnable, RunnableIdentity, RunnableSnapshot,
    RunnableTask,
};
pub use status::{RunProgress, RunStatus, StatusCell};

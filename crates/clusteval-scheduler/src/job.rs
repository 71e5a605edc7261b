use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clusteval_plugin_sdk::CancelFlag;
use clusteval_run::{
    best_points, BestPoint, CompletedRunnables, Decomposition, LayeredSearch, ResolvedRun,
    ResultId, RunProgress, RunStatus, Runnable, RunnableSnapshot,
};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One submission of a run: its runnables and who asked for it.
///
/// Layered optimization runs grow while they execute: once every runnable
/// of a search's layer is terminal, [`Job::advance`] appends the next layer.
pub struct Job {
    id: JobId,
    client: String,
    run: Arc<ResolvedRun>,
    result: ResultId,
    submitted_at: DateTime<Utc>,
    searches: Mutex<Vec<LayeredSearch>>,
    runnables: RwLock<Vec<Arc<Runnable>>>,
    completed: CompletedRunnables,
    cancel: CancelFlag,
    reported: AtomicBool,
}

impl Job {
    pub(crate) fn new(
        client: &str,
        run: Arc<ResolvedRun>,
        result: ResultId,
        decomposition: Decomposition,
        completed: CompletedRunnables,
    ) -> Self {
        let job = Self {
            id: JobId::new(),
            client: client.to_string(),
            run,
            result,
            submitted_at: Utc::now(),
            searches: Mutex::new(decomposition.searches),
            runnables: RwLock::new(decomposition.runnables),
            completed,
            cancel: CancelFlag::new(),
            reported: AtomicBool::new(false),
        };
        // A resumed search may have finished whole layers already.
        job.advance();
        job
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn client(&self) -> &str {
        &self.client
    }

    pub fn run(&self) -> &str {
        &self.run.definition.name
    }

    pub fn resolved(&self) -> &Arc<ResolvedRun> {
        &self.run
    }

    pub fn result(&self) -> &ResultId {
        &self.result
    }

    /// The runnables that exist so far.
    pub fn runnables(&self) -> Vec<Arc<Runnable>> {
        self.runnables.read().clone()
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn progress(&self) -> RunProgress {
        let searches = self.searches.lock();
        let pending = searches.iter().map(LayeredSearch::remaining).sum();
        let statuses: Vec<RunStatus> = self.runnables.read().iter().map(|r| r.status()).collect();
        RunProgress::with_pending(&statuses, pending)
    }

    pub fn is_terminal(&self) -> bool {
        let searches = self.searches.lock();
        searches.iter().all(LayeredSearch::is_exhausted)
            && self.runnables.read().iter().all(|r| r.status().is_terminal())
    }

    /// Generates the next layer of every search whose current layer has
    /// settled and returns the new runnables. Nothing is added once the job
    /// was cancelled.
    pub(crate) fn advance(&self) -> Vec<Arc<Runnable>> {
        let mut searches = self.searches.lock();
        if self.cancel.is_cancelled() {
            return Vec::new();
        }
        let mut added = Vec::new();
        for search in searches.iter_mut() {
            while !search.is_exhausted() && search.layer_settled() {
                let layer = search.advance(&self.completed);
                if layer.is_empty() {
                    break;
                }
                if let Some(best) = search.best() {
                    debug!(
                        job = %self.id,
                        program = search.program(),
                        data = search.data(),
                        best = %best.parameters,
                        quality = best.quality,
                        size = layer.len(),
                        "next optimization layer"
                    );
                }
                added.extend(layer);
            }
        }
        if !added.is_empty() {
            self.runnables.write().extend(added.iter().cloned());
        }
        added
    }

    /// Asks running runnables to stop: cancels external processes and
    /// interrupts the engine sessions the runnables are bound to.
    pub(crate) fn signal_cancel(&self) {
        self.cancel.cancel();
        for runnable in self.runnables.read().iter() {
            if runnable.status() == RunStatus::Running {
                runnable.interrupt();
            }
        }
    }

    /// Cancels, closes the searches, then marks every non-terminal runnable
    /// TERMINATED. Returns how many runnables were terminated.
    pub(crate) fn terminate(&self) -> usize {
        self.cancel.cancel();
        let mut searches = self.searches.lock();
        searches.iter_mut().for_each(LayeredSearch::close);
        let mut terminated = 0;
        for runnable in self.runnables.read().iter() {
            if runnable.terminate() {
                debug!(job = %self.id, runnable = %runnable.identity(), "runnable terminated");
                terminated += 1;
            }
        }
        terminated
    }

    pub(crate) fn mark_reported(&self) {
        self.reported.store(true, Ordering::SeqCst);
    }

    /// Whether a terminal status of this job has been handed to its client.
    pub(crate) fn is_reported(&self) -> bool {
        self.reported.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            id: self.id,
            client: self.client.clone(),
            run: self.run().to_string(),
            result: self.result.clone(),
            submitted_at: self.submitted_at,
            progress: self.progress(),
            runnables: self.runnables.read().iter().map(|r| r.snapshot()).collect(),
        }
    }

    /// Progress and best points per program × data pair; `None` unless the
    /// run optimizes parameters.
    pub fn optimization_status(&self) -> Option<OptimizationStatus> {
        let plan = self.run.optimization.as_ref()?;
        let progress = self.progress();
        let pending: HashMap<(String, String), usize> = self
            .searches
            .lock()
            .iter()
            .map(|search| {
                let pair = (search.program().to_string(), search.data().to_string());
                (pair, search.remaining())
            })
            .collect();

        let mut groups: IndexMap<(String, String), Vec<Arc<Runnable>>> = IndexMap::new();
        for runnable in self.runnables() {
            let identity = runnable.identity();
            groups
                .entry((identity.program.clone(), identity.data.clone()))
                .or_default()
                .push(runnable);
        }
        let pairs = groups
            .into_iter()
            .map(|(pair, runnables)| {
                let finished = runnables
                    .iter()
                    .filter(|r| r.status() == RunStatus::Finished)
                    .count();
                let total = runnables.len() + pending.get(&pair).copied().unwrap_or(0);
                PairOptimization {
                    percent_complete: finished as f32 * 100.0 / total.max(1) as f32,
                    best: best_points(&runnables, &self.run.optima),
                    program: pair.0,
                    data: pair.1,
                }
            })
            .collect();
        Some(OptimizationStatus {
            job: self.id,
            run: self.run().to_string(),
            method: plan.method.clone(),
            progress,
            pairs,
        })
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("run", &self.run())
            .field("result", &self.result)
            .field("runnables", &self.runnables.read().len())
            .finish()
    }
}

/// Per-runnable status of a job, plus the aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub client: String,
    pub run: String,
    pub result: ResultId,
    pub submitted_at: DateTime<Utc>,
    pub progress: RunProgress,
    pub runnables: Vec<RunnableSnapshot>,
}

impl JobStatus {
    pub fn status_of(&self, key: &str) -> Option<RunStatus> {
        self.runnables
            .iter()
            .find(|runnable| runnable.key == key)
            .map(|runnable| runnable.status)
    }

    pub fn count(&self, status: RunStatus) -> usize {
        self.runnables
            .iter()
            .filter(|runnable| runnable.status == status)
            .count()
    }
}

/// A runnable currently bound to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRunnable {
    pub job: JobId,
    pub run: String,
    pub runnable: RunnableSnapshot,
}

/// Where a parameter optimization run stands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationStatus {
    pub job: JobId,
    pub run: String,
    pub method: String,
    pub progress: RunProgress,
    pub pairs: Vec<PairOptimization>,
}

/// Optimization state of one program × data pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairOptimization {
    pub program: String,
    pub data: String,
    pub percent_complete: f32,
    /// Best point found so far, per quality measure.
    pub best: BTreeMap<String, BestPoint>,
}

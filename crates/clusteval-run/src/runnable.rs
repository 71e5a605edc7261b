use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use clusteval_rengine::{InterruptHandle, WorkerId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    CompletedRunnables, DataConfig, LayeredSearch, OptimizationPlan, OptimizationStrategy,
    ParameterPoint, ProgramConfig, ResolvedRun, RunMode, RunStatus, StatusCell,
};

/// What makes two runnables the same piece of work, across runs.
///
/// `program` names the program or statistic, `data` the data configuration
/// or, for run statistics, the analyzed result. A statistic over a result
/// and a data configuration carries the result in `result`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnableIdentity {
    pub program: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub parameters: ParameterPoint,
}

impl RunnableIdentity {
    /// Stable, file-name-safe key used for result artifacts.
    ///
    /// Segments are joined with `__`, parameters written as `name-value`
    /// joined with `_`, and the analyzed result prefixed with `@`. Every
    /// other character outside `[A-Za-z0-9.]` is percent-encoded, so two
    /// different identities never share a key.
    pub fn key(&self) -> String {
        let mut key = format!("{}__{}", escape(&self.program), escape(&self.data));
        if let Some(result) = &self.result {
            key.push_str("__@");
            key.push_str(&escape(result));
        }
        if !self.parameters.is_empty() {
            let pairs: Vec<String> = self
                .parameters
                .iter()
                .map(|(name, value)| format!("{}-{}", escape(name), escape(value)))
                .collect();
            key.push_str("__");
            key.push_str(&pairs.join("_"));
        }
        key
    }
}

fn escape(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for byte in part.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' => escaped.push(byte as char),
            _ => escaped.push_str(&format!("%{byte:02X}")),
        }
    }
    escaped
}

impl fmt::Display for RunnableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on {}", self.program, self.data)?;
        if let Some(result) = &self.result {
            write!(f, " of {result}")?;
        }
        if !self.parameters.is_empty() {
            write!(f, " [{}]", self.parameters)?;
        }
        Ok(())
    }
}

/// The work a runnable performs.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnableTask {
    /// Cluster a data set with a program at one parameter point.
    Clustering {
        program: ProgramConfig,
        data: DataConfig,
    },
    DataStatistic {
        statistic: String,
        data: DataConfig,
    },
    /// A statistic over an earlier result directory.
    RunStatistic {
        statistic: String,
        result: String,
        path: PathBuf,
    },
    RunDataStatistic {
        statistic: String,
        result: String,
        path: PathBuf,
        data: DataConfig,
    },
}

/// One unit of a run: a program × data × parameter point, or one statistic
/// over its subject.
///
/// The status is written by the worker that owns the runnable and read from
/// anywhere; everything else that changes during execution sits behind its
/// own small lock.
#[derive(Debug)]
pub struct Runnable {
    run: Arc<ResolvedRun>,
    task: RunnableTask,
    identity: RunnableIdentity,
    status: StatusCell,
    started_at: Mutex<Option<DateTime<Utc>>>,
    finished_at: Mutex<Option<DateTime<Utc>>>,
    exceptions: Mutex<Vec<String>>,
    quality: Mutex<BTreeMap<String, String>>,
    worker: Mutex<Option<WorkerId>>,
    session: Mutex<Option<InterruptHandle>>,
}

impl Runnable {
    fn new(
        run: &Arc<ResolvedRun>,
        task: RunnableTask,
        parameters: ParameterPoint,
        completed: &CompletedRunnables,
    ) -> Arc<Self> {
        let identity = match &task {
            RunnableTask::Clustering { program, data } => RunnableIdentity {
                program: program.name.clone(),
                data: data.name.clone(),
                result: None,
                parameters,
            },
            RunnableTask::DataStatistic { statistic, data } => RunnableIdentity {
                program: statistic.clone(),
                data: data.name.clone(),
                result: None,
                parameters,
            },
            RunnableTask::RunStatistic {
                statistic, result, ..
            } => RunnableIdentity {
                program: statistic.clone(),
                data: result.clone(),
                result: None,
                parameters,
            },
            RunnableTask::RunDataStatistic {
                statistic,
                result,
                data,
                ..
            } => RunnableIdentity {
                program: statistic.clone(),
                data: data.name.clone(),
                result: Some(result.clone()),
                parameters,
            },
        };
        let earlier = completed.get(&identity.key());
        let status = if earlier.is_some() {
            RunStatus::Finished
        } else {
            RunStatus::Inactive
        };
        Arc::new(Self {
            run: Arc::clone(run),
            task,
            identity,
            status: StatusCell::new(status),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            exceptions: Mutex::new(Vec::new()),
            quality: Mutex::new(earlier.cloned().unwrap_or_default()),
            worker: Mutex::new(None),
            session: Mutex::new(None),
        })
    }

    pub(crate) fn clustering(
        run: &Arc<ResolvedRun>,
        program: &ProgramConfig,
        data: &DataConfig,
        parameters: ParameterPoint,
        completed: &CompletedRunnables,
    ) -> Arc<Self> {
        let task = RunnableTask::Clustering {
            program: program.clone(),
            data: data.clone(),
        };
        Self::new(run, task, parameters, completed)
    }

    pub fn run(&self) -> &Arc<ResolvedRun> {
        &self.run
    }

    pub fn run_name(&self) -> &str {
        &self.run.definition.name
    }

    pub fn task(&self) -> &RunnableTask {
        &self.task
    }

    pub fn parameters(&self) -> &ParameterPoint {
        &self.identity.parameters
    }

    pub fn identity(&self) -> &RunnableIdentity {
        &self.identity
    }

    pub fn status(&self) -> RunStatus {
        self.status.get()
    }

    /// INACTIVE → SCHEDULED.
    pub fn schedule(&self) -> bool {
        self.status
            .transition(RunStatus::Inactive, RunStatus::Scheduled)
            .is_ok()
    }

    /// SCHEDULED → RUNNING on `worker`.
    pub fn start(&self, worker: WorkerId) -> bool {
        *self.worker.lock() = Some(worker);
        if self
            .status
            .transition(RunStatus::Scheduled, RunStatus::Running)
            .is_err()
        {
            *self.worker.lock() = None;
            return false;
        }
        *self.started_at.lock() = Some(Utc::now());
        true
    }

    /// RUNNING → FINISHED. Fails if the runnable was terminated meanwhile.
    pub fn finish(&self) -> bool {
        let finished = self
            .status
            .transition(RunStatus::Running, RunStatus::Finished)
            .is_ok();
        if finished {
            self.stamp_finished();
        }
        finished
    }

    /// Any non-terminal status → TERMINATED, interrupting the engine
    /// session the runnable is bound to.
    pub fn terminate(&self) -> bool {
        let terminated = self.status.force_terminate();
        if terminated {
            self.stamp_finished();
            self.interrupt();
        }
        terminated
    }

    fn stamp_finished(&self) {
        *self.finished_at.lock() = Some(Utc::now());
        *self.worker.lock() = None;
    }

    /// Binds the engine session this runnable is evaluated in. A runnable
    /// terminated before the bind interrupts the session right away.
    pub fn bind_session(&self, handle: InterruptHandle) {
        let mut session = self.session.lock();
        if self.status() == RunStatus::Terminated {
            handle.interrupt();
        }
        *session = Some(handle);
    }

    /// Unbinds the engine session. Once released, terminating the runnable
    /// no longer reaches the session, which may already serve the worker's
    /// next runnable.
    pub fn release_session(&self) {
        self.session.lock().take();
    }

    /// Interrupts the bound engine session, if any. Returns whether one was
    /// bound.
    pub fn interrupt(&self) -> bool {
        let session = self.session.lock();
        match &*session {
            Some(handle) => {
                debug!(runnable = %self.identity, "interrupting engine session");
                handle.interrupt();
                true
            }
            None => false,
        }
    }

    /// Records a failure that belongs to the runnable's result.
    pub fn record_exception(&self, error: impl fmt::Display) {
        let message = error.to_string();
        debug!(runnable = %self.identity, %message, "recorded exception");
        self.exceptions.lock().push(message);
    }

    pub fn exceptions(&self) -> Vec<String> {
        self.exceptions.lock().clone()
    }

    /// Records the values of the run's quality measures.
    pub fn record_quality(&self, quality: BTreeMap<String, String>) {
        *self.quality.lock() = quality;
    }

    pub fn quality(&self) -> BTreeMap<String, String> {
        self.quality.lock().clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.lock()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        *self.finished_at.lock()
    }

    /// Worker the runnable is bound to while RUNNING.
    pub fn worker(&self) -> Option<WorkerId> {
        *self.worker.lock()
    }

    pub fn snapshot(&self) -> RunnableSnapshot {
        RunnableSnapshot {
            key: self.identity.key(),
            identity: self.identity.clone(),
            status: self.status(),
            started_at: self.started_at(),
            finished_at: self.finished_at(),
            worker: self.worker().map(|worker| worker.to_string()),
            exceptions: self.exceptions(),
        }
    }
}

/// Point-in-time view of a runnable for status reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnableSnapshot {
    pub key: String,
    pub identity: RunnableIdentity,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub worker: Option<String>,
    pub exceptions: Vec<String>,
}

/// The runnables a run starts with, plus the layered searches that add
/// more as their layers settle.
#[derive(Debug, Default)]
pub struct Decomposition {
    pub runnables: Vec<Arc<Runnable>>,
    pub searches: Vec<LayeredSearch>,
}

/// Splits a resolved run into INACTIVE runnables.
pub fn decompose(run: &Arc<ResolvedRun>) -> Decomposition {
    decompose_resuming(run, &CompletedRunnables::new())
}

/// Like [`decompose`], but runnables whose key is in `completed` start out
/// FINISHED with their recorded quality, so they are never executed again.
pub fn decompose_resuming(run: &Arc<ResolvedRun>, completed: &CompletedRunnables) -> Decomposition {
    let definition = &run.definition;
    let mut seen = HashSet::new();
    let mut decomposition = Decomposition::default();
    let mut push = |runnable: Arc<Runnable>, runnables: &mut Vec<Arc<Runnable>>| {
        if seen.insert(runnable.identity().clone()) {
            runnables.push(runnable);
        } else {
            debug!(
                run = %definition.name,
                runnable = %runnable.identity(),
                "duplicate runnable skipped"
            );
        }
    };

    match &definition.mode {
        RunMode::Clustering => {
            for program in &definition.programs {
                let point = program.default_point();
                for data in &definition.data {
                    let point = point.clone();
                    let runnable = Runnable::clustering(run, program, data, point, completed);
                    push(runnable, &mut decomposition.runnables);
                }
            }
        }
        RunMode::ParameterOptimization {
            method, iterations, ..
        } => {
            let plan = run.optimization.clone().unwrap_or_else(|| OptimizationPlan {
                method: method.clone(),
                strategy: OptimizationStrategy::Divisive,
                iterations: *iterations,
                criterion: None,
            });
            match (plan.strategy, &plan.criterion) {
                (OptimizationStrategy::Layered, Some(criterion)) => {
                    let mut pairs = HashSet::new();
                    for program in &definition.programs {
                        for data in &definition.data {
                            if !pairs.insert((program.name.as_str(), data.name.as_str())) {
                                continue;
                            }
                            let mut search =
                                LayeredSearch::new(run, program, data, criterion, plan.iterations);
                            for runnable in search.advance(completed) {
                                push(runnable, &mut decomposition.runnables);
                            }
                            decomposition.searches.push(search);
                        }
                    }
                }
                _ => {
                    for program in &definition.programs {
                        for point in plan.initial_points(program) {
                            for data in &definition.data {
                                let point = point.clone();
                                let runnable =
                                    Runnable::clustering(run, program, data, point, completed);
                                push(runnable, &mut decomposition.runnables);
                            }
                        }
                    }
                }
            }
        }
        RunMode::DataAnalysis { statistics } => {
            for data in &definition.data {
                for statistic in statistics {
                    let task = RunnableTask::DataStatistic {
                        statistic: statistic.clone(),
                        data: data.clone(),
                    };
                    let runnable = Runnable::new(run, task, ParameterPoint::default(), completed);
                    push(runnable, &mut decomposition.runnables);
                }
            }
        }
        RunMode::RunAnalysis {
            statistics,
            results,
        } => {
            for result in results {
                for statistic in statistics {
                    let task = RunnableTask::RunStatistic {
                        statistic: statistic.clone(),
                        result: result.clone(),
                        path: run.result_path(result),
                    };
                    let runnable = Runnable::new(run, task, ParameterPoint::default(), completed);
                    push(runnable, &mut decomposition.runnables);
                }
            }
        }
        RunMode::RunDataAnalysis {
            statistics,
            results,
        } => {
            for result in results {
                for data in &definition.data {
                    for statistic in statistics {
                        let task = RunnableTask::RunDataStatistic {
                            statistic: statistic.clone(),
                            result: result.clone(),
                            path: run.result_path(result),
                            data: data.clone(),
                        };
                        let runnable =
                            Runnable::new(run, task, ParameterPoint::default(), completed);
                        push(runnable, &mut decomposition.runnables);
                    }
                }
            }
        }
    }
    decomposition
}

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use clusteval_registry::CapabilityRegistry;
use clusteval_rengine::{SessionPool, WorkerId};
use clusteval_run::{
    decompose_resuming, CompletedRunnables, ResolvedRun, ResultId, ResultStore, RunCatalog,
    RunDefinition, RunError, RunStatus, Runnable, RunnableArtifact, RunnableIdentity,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::{
    ActiveRunnable, ExecutionContext, ExecutionError, ExecutionOutput, Job, JobId, JobStatus,
    OptimizationStatus, RunnableExecutor, SchedulerConfig, SchedulerError,
};

/// Directory below a result where programs write their output files.
const OUTPUT_DIR: &str = "clusters";
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

enum Dispatch {
    Run { job: Arc<Job>, runnable: Arc<Runnable> },
    Exit,
}

struct WorkerThread {
    id: WorkerId,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    jobs: IndexMap<JobId, Arc<Job>>,
    /// INACTIVE runnables in submission order, including parked ones.
    pending: VecDeque<(Arc<Job>, Arc<Runnable>)>,
    /// Identities that are SCHEDULED or RUNNING somewhere.
    busy: HashSet<RunnableIdentity>,
}

struct Inner {
    registry: Arc<CapabilityRegistry>,
    runs: Arc<RunCatalog>,
    results: ResultStore,
    pool: Arc<SessionPool>,
    executor: Arc<dyn RunnableExecutor>,
    max_retries: u32,
    shutdown_grace: Duration,
    state: Mutex<State>,
    dispatch: Sender<Dispatch>,
    queue: Receiver<Dispatch>,
    workers: Mutex<Vec<WorkerThread>>,
    target_workers: AtomicUsize,
    next_worker: AtomicUsize,
    accepting: AtomicBool,
}

/// Bounded worker pool executing the runnables of submitted runs.
///
/// Runnables are dispatched in submission order. A runnable whose identity
/// is already scheduled or running (in any job) stays INACTIVE until that
/// identity frees up, so the same program/data/parameter combination never
/// executes twice at once.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn start(
        config: SchedulerConfig,
        registry: Arc<CapabilityRegistry>,
        runs: Arc<RunCatalog>,
        results: ResultStore,
        pool: Arc<SessionPool>,
        executor: Arc<dyn RunnableExecutor>,
    ) -> Self {
        let (dispatch, queue) = unbounded();
        let inner = Arc::new(Inner {
            registry,
            runs,
            results,
            pool,
            executor,
            max_retries: config.max_retries,
            shutdown_grace: config.shutdown_grace,
            state: Mutex::new(State::default()),
            dispatch,
            queue,
            workers: Mutex::new(Vec::new()),
            target_workers: AtomicUsize::new(0),
            next_worker: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
        });
        let scheduler = Self { inner };
        scheduler.set_worker_count(config.workers);
        info!(workers = config.workers, "scheduler started");
        scheduler
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.inner.registry
    }

    pub fn run_catalog(&self) -> &Arc<RunCatalog> {
        &self.inner.runs
    }

    pub fn result_store(&self) -> &ResultStore {
        &self.inner.results
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Submits the catalogued run named `run`.
    pub fn submit(&self, client: &str, run: &str) -> Result<JobId, SchedulerError> {
        let definition = self
            .inner
            .runs
            .by_name(run)
            .map(|object| object.value().clone())
            .ok_or_else(|| RunError::UnknownRun(run.to_string()))?;
        self.submit_definition(client, definition)
    }

    /// Validates `definition`, creates a fresh result directory and queues
    /// every runnable.
    ///
    /// Validation and decomposition happen before the scheduler state is
    /// locked; only the duplicate check and the hand-over hold the lock.
    pub fn submit_definition(
        &self,
        client: &str,
        definition: RunDefinition,
    ) -> Result<JobId, SchedulerError> {
        self.ensure_accepting()?;
        let resolved = self.resolve(&definition)?;
        let decomposition = decompose_resuming(&resolved, &CompletedRunnables::new());

        let mut state = self.inner.state.lock();
        ensure_not_active(&state, &definition.name)?;
        let result = self.inner.results.create(&definition)?;
        let job = Arc::new(Job::new(
            client,
            resolved,
            result,
            decomposition,
            CompletedRunnables::new(),
        ));
        info!(
            job = %job.id(),
            client,
            run = %definition.name,
            runnables = job.runnables().len(),
            "run submitted"
        );
        let id = job.id();
        self.inner.insert_job(&mut state, job);
        Ok(id)
    }

    /// Continues a persisted result: runnables with a completion marker stay
    /// FINISHED, everything else is queued again.
    ///
    /// Resuming a result that already has a running or fully finished job
    /// returns that job.
    pub fn resume(&self, client: &str, result: &str) -> Result<JobId, SchedulerError> {
        self.ensure_accepting()?;
        let result = ResultId::parse(result)?;
        if let Some(job) = resumed_job(&self.inner.state.lock(), &result) {
            return Ok(job);
        }

        let definition = self.inner.results.load_definition(&result)?;
        let resolved = self.resolve(&definition)?;
        let completed = self.inner.results.completed(&result)?;
        let decomposition = decompose_resuming(&resolved, &completed);

        let mut state = self.inner.state.lock();
        if let Some(job) = resumed_job(&state, &result) {
            return Ok(job);
        }
        ensure_not_active(&state, &definition.name)?;
        let job = Arc::new(Job::new(client, resolved, result, decomposition, completed));
        let runnables = job.runnables();
        let skipped = runnables
            .iter()
            .filter(|r| r.status() == RunStatus::Finished)
            .count();
        info!(
            job = %job.id(),
            client,
            run = %definition.name,
            result = %job.result(),
            skipped,
            resubmitted = runnables.len() - skipped,
            "run resumed"
        );
        let id = job.id();
        self.inner.insert_job(&mut state, job);
        Ok(id)
    }

    fn resolve(&self, definition: &RunDefinition) -> Result<Arc<ResolvedRun>, SchedulerError> {
        let mut resolved = definition.resolve(&self.inner.registry)?;
        resolved.locate_results(&self.inner.results)?;
        Ok(Arc::new(resolved))
    }

    /// Terminates every runnable of the job that has not finished yet.
    /// Returns `false` if the job is unknown or already complete.
    pub fn terminate(&self, job: JobId) -> bool {
        let Some(job) = self.inner.state.lock().jobs.get(&job).cloned() else {
            return false;
        };
        let terminated = job.terminate();
        self.inner
            .state
            .lock()
            .pending
            .retain(|(_, runnable)| runnable.status() == RunStatus::Inactive);
        if terminated > 0 {
            info!(job = %job.id(), run = job.run(), terminated, "run terminated");
        }
        terminated > 0
    }

    pub fn status(&self, job: JobId) -> Option<JobStatus> {
        self.inner.state.lock().jobs.get(&job).map(|job| job.status())
    }

    pub fn jobs(&self) -> Vec<JobStatus> {
        self.inner
            .state
            .lock()
            .jobs
            .values()
            .map(|job| job.status())
            .collect()
    }

    /// Most recent job of the run named `run`.
    pub fn latest_job(&self, run: &str) -> Option<JobStatus> {
        self.inner
            .state
            .lock()
            .jobs
            .values()
            .rev()
            .find(|job| job.run() == run)
            .map(|job| job.status())
    }

    /// Status of every job `client` submitted.
    ///
    /// A job is forgotten once it has been reported in a terminal state, on
    /// the report after that one.
    pub fn jobs_for_client(&self, client: &str) -> Vec<JobStatus> {
        let mut state = self.inner.state.lock();
        state
            .jobs
            .retain(|_, job| !(job.client() == client && job.is_terminal() && job.is_reported()));
        state
            .jobs
            .values()
            .filter(|job| job.client() == client)
            .map(|job| {
                let status = job.status();
                if status.progress.status.is_terminal() {
                    job.mark_reported();
                }
                status
            })
            .collect()
    }

    /// Optimization progress and best points of every parameter
    /// optimization job `client` submitted. Unlike
    /// [`Scheduler::jobs_for_client`], reading this never retires a job.
    pub fn optimization_status_for_client(&self, client: &str) -> Vec<OptimizationStatus> {
        let jobs: Vec<Arc<Job>> = self
            .inner
            .state
            .lock()
            .jobs
            .values()
            .filter(|job| job.client() == client)
            .cloned()
            .collect();
        jobs.iter().filter_map(|job| job.optimization_status()).collect()
    }

    /// Names of runs with unfinished work, in submission order.
    pub fn queue(&self) -> Vec<String> {
        let state = self.inner.state.lock();
        let mut names: Vec<String> = Vec::new();
        for job in state.jobs.values().filter(|job| !job.is_terminal()) {
            if !names.iter().any(|name| name == job.run()) {
                names.push(job.run().to_string());
            }
        }
        names
    }

    pub fn active_runnables(&self) -> Vec<ActiveRunnable> {
        let state = self.inner.state.lock();
        state
            .jobs
            .values()
            .flat_map(|job| {
                job.runnables()
                    .into_iter()
                    .filter(|runnable| runnable.status() == RunStatus::Running)
                    .map(move |runnable| ActiveRunnable {
                        job: job.id(),
                        run: job.run().to_string(),
                        runnable: runnable.snapshot(),
                    })
            })
            .collect()
    }

    pub fn worker_count(&self) -> usize {
        self.inner.target_workers.load(Ordering::SeqCst)
    }

    /// Grows or shrinks the pool. Surplus workers exit after their current
    /// runnable.
    pub fn set_worker_count(&self, workers: usize) {
        if !self.is_accepting() {
            return;
        }
        let workers = workers.max(1);
        let mut threads = self.inner.workers.lock();
        threads.retain(|worker| !worker.handle.is_finished());
        let current = self.inner.target_workers.swap(workers, Ordering::SeqCst);
        if workers > current {
            for _ in current..workers {
                if let Some(worker) = spawn_worker(&self.inner) {
                    threads.push(worker);
                }
            }
        } else {
            for _ in workers..current {
                let _ = self.inner.dispatch.send(Dispatch::Exit);
            }
        }
        if workers != current {
            info!(from = current, to = workers, "worker count changed");
        }
    }

    /// Stops accepting work, cancels everything and waits up to `timeout`
    /// for the workers. Runnables still not terminal after the timeout are
    /// marked TERMINATED and their workers detached. Returns how many
    /// runnables had to be forced.
    pub fn shutdown(&self, timeout: Duration) -> usize {
        if !self.inner.accepting.swap(false, Ordering::SeqCst) {
            return 0;
        }
        info!(?timeout, "scheduler shutting down");

        let jobs: Vec<Arc<Job>> = {
            let mut state = self.inner.state.lock();
            for (_, runnable) in state.pending.drain(..) {
                runnable.terminate();
            }
            state.jobs.values().cloned().collect()
        };
        for job in &jobs {
            job.signal_cancel();
            for runnable in job.runnables() {
                if runnable.status() != RunStatus::Running {
                    runnable.terminate();
                }
            }
        }

        self.inner.target_workers.store(0, Ordering::SeqCst);
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for _ in &workers {
            let _ = self.inner.dispatch.send(Dispatch::Exit);
        }
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline && workers.iter().any(|w| !w.handle.is_finished()) {
            thread::sleep(SHUTDOWN_POLL);
        }

        let forced: usize = jobs.iter().map(|job| job.terminate()).sum();
        if forced > 0 {
            warn!(forced, "runnables force-terminated at shutdown");
        }
        for worker in workers {
            if worker.handle.is_finished() {
                let _ = worker.handle.join();
            } else {
                warn!(worker = %worker.id, "worker did not stop in time, detaching");
            }
        }
        info!("scheduler stopped");
        forced
    }

    fn ensure_accepting(&self) -> Result<(), SchedulerError> {
        if self.is_accepting() {
            Ok(())
        } else {
            Err(SchedulerError::ShuttingDown)
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown(self.inner.shutdown_grace);
    }
}

fn ensure_not_active(state: &State, run: &str) -> Result<(), SchedulerError> {
    match state
        .jobs
        .values()
        .find(|job| job.run() == run && !job.is_terminal())
    {
        Some(job) => Err(SchedulerError::AlreadyActive {
            run: run.to_string(),
            job: job.id(),
        }),
        None => Ok(()),
    }
}

/// The job that already continues `result`, if it is still running or
/// finished everything.
fn resumed_job(state: &State, result: &ResultId) -> Option<JobId> {
    let job = state
        .jobs
        .values()
        .rev()
        .find(|job| job.result() == result)?;
    if !job.is_terminal() || job.progress().status == RunStatus::Finished {
        debug!(job = %job.id(), %result, "result already resumed");
        Some(job.id())
    } else {
        None
    }
}

fn spawn_worker(inner: &Arc<Inner>) -> Option<WorkerThread> {
    let id = WorkerId(inner.next_worker.fetch_add(1, Ordering::SeqCst));
    let worker_inner = Arc::clone(inner);
    let spawned = thread::Builder::new()
        .name(format!("clusteval-{id}"))
        .spawn(move || worker_loop(worker_inner, id));
    match spawned {
        Ok(handle) => Some(WorkerThread { id, handle }),
        Err(err) => {
            warn!(worker = %id, %err, "failed to spawn worker thread");
            None
        }
    }
}

fn worker_loop(inner: Arc<Inner>, worker: WorkerId) {
    debug!(%worker, "worker started");
    while let Ok(message) = inner.queue.recv() {
        match message {
            Dispatch::Run { job, runnable } => {
                inner.execute(worker, &job, &runnable);
                inner.release(&job, &runnable);
            }
            Dispatch::Exit => break,
        }
    }
    inner.pool.destroy(worker);
    debug!(%worker, "worker stopped");
}

impl Inner {
    fn insert_job(&self, state: &mut State, job: Arc<Job>) {
        for runnable in job.runnables() {
            if runnable.status() == RunStatus::Inactive {
                state.pending.push_back((Arc::clone(&job), runnable));
            }
        }
        state.jobs.insert(job.id(), job);
        self.pump(state);
    }

    /// Dispatches every pending runnable whose identity is free.
    fn pump(&self, state: &mut State) {
        let mut parked = VecDeque::new();
        while let Some((job, runnable)) = state.pending.pop_front() {
            if runnable.status() != RunStatus::Inactive {
                continue;
            }
            if state.busy.contains(runnable.identity()) {
                parked.push_back((job, runnable));
                continue;
            }
            if !runnable.schedule() {
                continue;
            }
            state.busy.insert(runnable.identity().clone());
            let _ = self.dispatch.send(Dispatch::Run { job, runnable });
        }
        state.pending = parked;
    }

    /// Frees the runnable's identity, queues whatever layers the job can
    /// add now, and dispatches what became runnable.
    fn release(&self, job: &Arc<Job>, runnable: &Runnable) {
        let added = job.advance();
        let mut state = self.state.lock();
        state.busy.remove(runnable.identity());
        for next in added {
            if next.status() == RunStatus::Inactive {
                state.pending.push_back((Arc::clone(job), next));
            }
        }
        self.pump(&mut state);
        drop(state);
        if job.is_terminal() {
            let progress = job.progress();
            info!(
                job = %job.id(),
                run = job.run(),
                status = %progress.status,
                percent = progress.percent_complete,
                "run complete"
            );
        }
    }

    fn execute(&self, worker: WorkerId, job: &Job, runnable: &Runnable) {
        if !runnable.start(worker) {
            debug!(%worker, runnable = %runnable.identity(), "runnable no longer scheduled");
            return;
        }
        info!(%worker, run = job.run(), runnable = %runnable.identity(), "runnable started");

        let output_dir = self.results.path(job.result()).join(OUTPUT_DIR);
        if let Err(err) = fs::create_dir_all(&output_dir) {
            warn!(path = %output_dir.display(), %err, "cannot create output directory");
        }
        let mut ctx = ExecutionContext::new(
            runnable,
            &self.registry,
            &self.pool,
            worker,
            job.cancel_flag(),
            output_dir,
        );
        let outcome = loop {
            let attempt = panic::catch_unwind(AssertUnwindSafe(|| self.executor.execute(&mut ctx)))
                .unwrap_or_else(|payload| Err(ExecutionError::Panicked(panic_message(&*payload))));
            match attempt {
                Err(err)
                    if err.is_transient()
                        && ctx.attempt() < self.max_retries
                        && !job.cancel_flag().is_cancelled() =>
                {
                    warn!(
                        %worker,
                        runnable = %runnable.identity(),
                        attempt = ctx.attempt(),
                        %err,
                        "transient failure, retrying"
                    );
                    ctx.retry();
                }
                other => break other,
            }
        };
        let session = ctx.into_session();
        runnable.release_session();
        self.complete(job, runnable, outcome);
        if let Some(session) = session {
            self.pool.clear(&session);
        }
    }

    fn complete(
        &self,
        job: &Job,
        runnable: &Runnable,
        outcome: Result<ExecutionOutput, ExecutionError>,
    ) {
        let (output, failed) = match outcome {
            Ok(output) => {
                runnable.record_quality(output.quality.clone());
                (Some(output), false)
            }
            Err(err) if err.is_cancellation() => {
                runnable.terminate();
                (None, false)
            }
            Err(err) => {
                warn!(run = job.run(), runnable = %runnable.identity(), %err, "runnable failed");
                runnable.record_exception(&err);
                (None, true)
            }
        };
        let finished = runnable.finish();

        let mut artifact = RunnableArtifact::from_runnable(runnable);
        if let (true, Some(output)) = (finished, output) {
            artifact.output = output.output;
            artifact.postprocessed = output.postprocessed;
        }
        if let Err(err) = self.results.write_artifact(job.result(), &artifact) {
            warn!(result = %job.result(), key = %artifact.key, %err, "failed to write artifact");
            return;
        }
        if finished && !failed {
            if let Err(err) = self.results.mark_complete(job.result(), &artifact.key) {
                warn!(
                    result = %job.result(),
                    key = %artifact.key,
                    %err,
                    "failed to mark runnable complete"
                );
            }
        }
        info!(
            run = job.run(),
            runnable = %runnable.identity(),
            status = %runnable.status(),
            exceptions = artifact.exceptions.len(),
            "runnable done"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".into()
    }
}

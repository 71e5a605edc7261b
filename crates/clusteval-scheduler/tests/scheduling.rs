use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clusteval_plugin_sdk::{
    CapabilityDescriptor, CapabilityFactory, CapabilityKind, DeclaredFactory, Invocation,
};
use clusteval_registry::CapabilityRegistry;
use clusteval_rengine::{EngineError, ScriptedEngineFactory, SessionPool};
use clusteval_run::{
    DataConfig, ProgramConfig, ProgramParameter, ResultId, ResultStore, RunCatalog, RunDefinition,
    RunMode, RunStatus,
};
use clusteval_scheduler::{
    ExecutionContext, ExecutionError, ExecutionOutput, JobId, JobStatus, ProgramExecutor,
    RunnableExecutor, Scheduler, SchedulerConfig, SchedulerError,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tempfile::{tempdir, TempDir};

const WAIT: Duration = Duration::from_secs(10);

type Behaviour =
    dyn Fn(&mut ExecutionContext<'_>) -> Result<ExecutionOutput, ExecutionError> + Send + Sync;

/// Executor that runs a closure and records what ran and how often an
/// identity ran in parallel.
struct TestExecutor {
    behaviour: Box<Behaviour>,
    running: Mutex<HashMap<String, usize>>,
    max_parallel: AtomicUsize,
    executed: Mutex<Vec<String>>,
}

impl TestExecutor {
    fn new(
        behaviour: impl Fn(&mut ExecutionContext<'_>) -> Result<ExecutionOutput, ExecutionError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            behaviour: Box::new(behaviour),
            running: Mutex::new(HashMap::new()),
            max_parallel: AtomicUsize::new(0),
            executed: Mutex::new(Vec::new()),
        })
    }

    fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

impl RunnableExecutor for TestExecutor {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<ExecutionOutput, ExecutionError> {
        let key = ctx.runnable().identity().key();
        self.executed.lock().push(key.clone());
        {
            let mut running = self.running.lock();
            let count = running.entry(key.clone()).or_default();
            *count += 1;
            self.max_parallel.fetch_max(*count, Ordering::SeqCst);
        }
        let result = (self.behaviour)(ctx);
        if let Some(count) = self.running.lock().get_mut(&key) {
            *count -= 1;
        }
        result
    }
}

/// Blocks until `gate` opens (success) or the runnable is cancelled.
fn gated(ctx: &ExecutionContext<'_>, gate: &AtomicBool) -> Result<ExecutionOutput, ExecutionError> {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if gate.load(Ordering::SeqCst) {
            return Ok(ExecutionOutput::default());
        }
        ctx.check_cancelled()?;
        thread::sleep(Duration::from_millis(5));
    }
    Ok(ExecutionOutput::default())
}

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn register(registry: &CapabilityRegistry, descriptor: CapabilityDescriptor) {
    let name = descriptor.name.clone();
    let kind = descriptor.kind;
    let factory: Arc<dyn CapabilityFactory> = Arc::new(DeclaredFactory::new(descriptor));
    registry.register(kind, &name, factory);
}

fn registry() -> Arc<CapabilityRegistry> {
    use CapabilityKind::*;
    let registry = CapabilityRegistry::new();
    register(
        &registry,
        CapabilityDescriptor::new(Context, "Clustering")
            .accepting(["SimMatrix"])
            .producing("TabSeparated"),
    );
    register(&registry, CapabilityDescriptor::new(DataSetFormat, "SimMatrix"));
    register(&registry, CapabilityDescriptor::new(DistanceMeasure, "Euclidian"));
    register(
        &registry,
        CapabilityDescriptor::new(RunResultFormat, "TabSeparated").producing("TabSeparated"),
    );
    register(
        &registry,
        CapabilityDescriptor::new(Program, "TransClust")
            .accepting(["SimMatrix"])
            .with_invocation(Invocation::RScript {
                script: "transclust('{{dataset}}')".into(),
            }),
    );
    register(&registry, CapabilityDescriptor::new(ClusteringQualityMeasure, "Silhouette"));
    register(
        &registry,
        CapabilityDescriptor::new(ParameterOptimizationMethod, "LayeredDivisive")
            .with_property("strategy", "layered"),
    );
    Arc::new(registry)
}

fn definition(name: &str, data: &[&str]) -> RunDefinition {
    RunDefinition {
        name: name.into(),
        mode: RunMode::Clustering,
        context: "Clustering".into(),
        programs: vec![ProgramConfig {
            name: "tc".into(),
            program: "TransClust".into(),
            input_formats: Vec::new(),
            output_format: "TabSeparated".into(),
            parameters: Vec::new(),
        }],
        data: data
            .iter()
            .map(|name| DataConfig {
                name: name.to_string(),
                dataset: PathBuf::from(format!("data/{name}.sim")),
                format: "SimMatrix".into(),
                distance_measure: "Euclidian".into(),
                goldstandard: None,
                data_type: None,
                preprocessors: Vec::new(),
            })
            .collect(),
        quality_measures: Vec::new(),
        postprocessors: Vec::new(),
    }
}

struct Harness {
    _dir: TempDir,
    scheduler: Scheduler,
    results: ResultStore,
    engine: Arc<ScriptedEngineFactory>,
}

fn harness(workers: usize, executor: Arc<dyn RunnableExecutor>) -> Harness {
    harness_with_engine(workers, executor, ScriptedEngineFactory::new())
}

fn harness_with_engine(
    workers: usize,
    executor: Arc<dyn RunnableExecutor>,
    engine: ScriptedEngineFactory,
) -> Harness {
    let dir = tempdir().unwrap();
    let results = ResultStore::new(dir.path().join("results"));
    let engine = Arc::new(engine);
    let scheduler = Scheduler::start(
        SchedulerConfig::default().with_workers(workers),
        registry(),
        Arc::new(RunCatalog::new()),
        results.clone(),
        Arc::new(SessionPool::new(engine.clone())),
        executor,
    );
    Harness {
        _dir: dir,
        scheduler,
        results,
        engine,
    }
}

impl Harness {
    fn status(&self, job: JobId) -> JobStatus {
        self.scheduler.status(job).unwrap()
    }

    fn wait_terminal(&self, job: JobId) -> JobStatus {
        wait_until("job to finish", || {
            self.status(job).progress.status.is_terminal()
        });
        self.status(job)
    }
}

#[test]
fn terminate_after_first_completion_stops_the_rest() {
    let gate = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicUsize::new(0));
    let executor = {
        let gate = Arc::clone(&gate);
        let calls = Arc::clone(&calls);
        TestExecutor::new(move |ctx| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(ExecutionOutput::default())
            } else {
                gated(ctx, &gate)
            }
        })
    };
    let harness = harness(1, executor);
    let job = harness
        .scheduler
        .submit_definition("client", definition("three", &["a", "b", "c"]))
        .unwrap();

    wait_until("first runnable", || {
        harness.status(job).count(RunStatus::Finished) == 1
            && harness.status(job).count(RunStatus::Running) == 1
    });
    assert!(harness.scheduler.terminate(job));

    let status = harness.status(job);
    assert_eq!(status.count(RunStatus::Running), 0);
    assert_eq!(status.count(RunStatus::Finished), 1);
    assert_eq!(status.count(RunStatus::Terminated), 2);
    assert_eq!(status.progress.status, RunStatus::Terminated);
    assert_eq!(status.progress.percent_complete, 100.0 / 3.0);
    assert!(!harness.scheduler.terminate(job));

    wait_until("worker to release", || {
        harness.scheduler.active_runnables().is_empty()
    });
    let completed = harness.results.completed_keys(&status.result).unwrap();
    assert_eq!(completed.len(), 1);
    assert!(completed.contains("tc__a"));
}

#[test]
fn identical_identities_never_run_concurrently() {
    let gate = Arc::new(AtomicBool::new(false));
    let executor = {
        let gate = Arc::clone(&gate);
        TestExecutor::new(move |ctx| gated(ctx, &gate))
    };
    let harness = harness(2, executor.clone());
    let first = harness
        .scheduler
        .submit_definition("client", definition("first", &["iris"]))
        .unwrap();
    wait_until("first to run", || {
        harness.status(first).count(RunStatus::Running) == 1
    });

    let second = harness
        .scheduler
        .submit_definition("client", definition("second", &["iris"]))
        .unwrap();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        harness.status(second).status_of("tc__iris"),
        Some(RunStatus::Inactive)
    );
    assert_eq!(harness.scheduler.active_runnables().len(), 1);
    assert_eq!(harness.scheduler.queue(), vec!["first", "second"]);

    gate.store(true, Ordering::SeqCst);
    assert_eq!(harness.wait_terminal(first).progress.status, RunStatus::Finished);
    assert_eq!(harness.wait_terminal(second).progress.status, RunStatus::Finished);
    assert_eq!(executor.executed().len(), 2);
    assert_eq!(executor.max_parallel.load(Ordering::SeqCst), 1);
}

#[test]
fn resume_resubmits_only_unfinished_runnables() {
    let gate = Arc::new(AtomicBool::new(false));
    let executor = {
        let gate = Arc::clone(&gate);
        TestExecutor::new(move |ctx| {
            if ctx.runnable().identity().data == "a" {
                Ok(ExecutionOutput {
                    output: Some("1\t1".into()),
                    ..ExecutionOutput::default()
                })
            } else {
                gated(ctx, &gate)
            }
        })
    };
    let harness = harness(1, executor.clone());
    let job = harness
        .scheduler
        .submit_definition("client", definition("resumable", &["a", "b"]))
        .unwrap();
    wait_until("b to run", || {
        harness.status(job).status_of("tc__b") == Some(RunStatus::Running)
    });
    harness.scheduler.terminate(job);
    let result: ResultId = harness.status(job).result;
    wait_until("worker to release", || {
        harness.scheduler.active_runnables().is_empty() && executor.executed().len() == 2
    });
    let finished_a = harness.results.read_artifact(&result, "tc__a").unwrap();
    assert_eq!(
        finished_a.as_ref().map(|artifact| artifact.status),
        Some(RunStatus::Finished)
    );

    gate.store(true, Ordering::SeqCst);
    let resumed = harness.scheduler.resume("client", result.as_str()).unwrap();
    assert_ne!(resumed, job);
    let status = harness.wait_terminal(resumed);
    assert_eq!(status.progress.status, RunStatus::Finished);
    assert_eq!(status.result, result);
    assert_eq!(executor.executed(), vec!["tc__a", "tc__b", "tc__b"]);
    assert_eq!(
        harness.results.read_artifact(&result, "tc__a").unwrap(),
        finished_a
    );
    wait_until("completion markers", || {
        harness.results.completed_keys(&result).unwrap().len() == 2
    });

    // A finished result resumes to the same job without executing anything.
    assert_eq!(
        harness.scheduler.resume("client", result.as_str()).unwrap(),
        resumed
    );
    assert_eq!(executor.executed().len(), 3);
}

#[test]
fn shutdown_without_grace_terminates_long_runnable() {
    let executor = TestExecutor::new(|_ctx| {
        // Ignores cancellation entirely.
        thread::sleep(Duration::from_millis(500));
        Ok(ExecutionOutput::default())
    });
    let harness = harness(1, executor);
    let job = harness
        .scheduler
        .submit_definition("client", definition("long", &["iris"]))
        .unwrap();
    wait_until("runnable to start", || {
        harness.status(job).count(RunStatus::Running) == 1
    });

    assert_eq!(harness.scheduler.shutdown(Duration::ZERO), 1);
    let status = harness.status(job);
    assert_eq!(status.status_of("tc__iris"), Some(RunStatus::Terminated));
    assert!(matches!(
        harness
            .scheduler
            .submit_definition("client", definition("late", &["iris"])),
        Err(SchedulerError::ShuttingDown)
    ));

    // The worker finishing later must not resurrect the runnable.
    thread::sleep(Duration::from_millis(600));
    assert_eq!(
        harness.status(job).status_of("tc__iris"),
        Some(RunStatus::Terminated)
    );
    assert!(harness.results.completed_keys(&status.result).unwrap().is_empty());
}

#[test]
fn active_run_cannot_be_submitted_twice() {
    let gate = Arc::new(AtomicBool::new(false));
    let executor = {
        let gate = Arc::clone(&gate);
        TestExecutor::new(move |ctx| gated(ctx, &gate))
    };
    let harness = harness(1, executor);
    let job = harness
        .scheduler
        .submit_definition("client", definition("once", &["iris"]))
        .unwrap();
    match harness
        .scheduler
        .submit_definition("other", definition("once", &["iris"]))
    {
        Err(SchedulerError::AlreadyActive { run, job: active }) => {
            assert_eq!(run, "once");
            assert_eq!(active, job);
        }
        other => panic!("expected AlreadyActive, got {other:?}"),
    }
    gate.store(true, Ordering::SeqCst);
    harness.wait_terminal(job);
    assert!(harness
        .scheduler
        .submit_definition("other", definition("once", &["iris"]))
        .is_ok());
}

#[test]
fn transient_engine_failure_is_retried_on_a_fresh_session() {
    let executor = TestExecutor::new(|ctx| {
        let session = ctx.session()?;
        if ctx.attempt() == 0 {
            return Err(EngineError::Disconnected("broken pipe".into()).into());
        }
        session.lock().eval("ok")?;
        Ok(ExecutionOutput::default())
    });
    let harness = harness(1, executor.clone());
    let job = harness
        .scheduler
        .submit_definition("client", definition("flaky", &["iris"]))
        .unwrap();
    let status = harness.wait_terminal(job);
    assert_eq!(status.progress.status, RunStatus::Finished);
    assert!(status.runnables[0].exceptions.is_empty());
    assert_eq!(executor.executed().len(), 2);
    assert_eq!(harness.engine.connections(), 2);
    assert_eq!(harness.engine.shutdowns(), 1);
}

#[test]
fn exhausted_retries_finish_with_exception() {
    let executor = TestExecutor::new(|_ctx| {
        Err(EngineError::Disconnected("engine crashed".into()).into())
    });
    let harness = harness(1, executor.clone());
    let job = harness
        .scheduler
        .submit_definition("client", definition("doomed", &["iris"]))
        .unwrap();
    let status = harness.wait_terminal(job);
    assert_eq!(status.progress.status, RunStatus::Finished);
    assert_eq!(status.runnables[0].exceptions.len(), 1);
    assert_eq!(executor.executed().len(), 3);
    wait_until("artifact", || {
        harness
            .results
            .read_artifact(&status.result, "tc__iris")
            .unwrap()
            .is_some()
    });
    assert!(!harness.results.is_complete(&status.result, "tc__iris"));
}

#[test]
fn unavailable_engine_finishes_runnable_with_exception() {
    let harness = harness_with_engine(
        1,
        Arc::new(ProgramExecutor),
        ScriptedEngineFactory::new().failing(),
    );
    let job = harness
        .scheduler
        .submit_definition("client", definition("no_engine", &["iris"]))
        .unwrap();
    let status = harness.wait_terminal(job);
    assert_eq!(status.progress.status, RunStatus::Finished);
    assert!(status.runnables[0].exceptions[0].contains("failed to start engine"));
}

#[test]
fn worker_session_is_reused_and_cleared_between_runnables() {
    let harness = harness(1, Arc::new(ProgramExecutor));
    let job = harness
        .scheduler
        .submit_definition("client", definition("program", &["iris", "wine"]))
        .unwrap();
    let status = harness.wait_terminal(job);
    assert_eq!(status.progress.status, RunStatus::Finished);
    wait_until("session cleared", || {
        harness
            .engine
            .commands()
            .iter()
            .filter(|(_, command)| command.starts_with("rm("))
            .count()
            == 2
    });
    assert_eq!(harness.engine.connections(), 1);
    let commands: Vec<String> = harness
        .engine
        .commands()
        .into_iter()
        .map(|(_, command)| command)
        .collect();
    assert_eq!(
        commands,
        vec![
            "transclust('data/iris.sim')",
            "rm(list = ls(all.names = TRUE))",
            "transclust('data/wine.sim')",
            "rm(list = ls(all.names = TRUE))",
        ]
    );
    assert_eq!(harness.results.completed_keys(&status.result).unwrap().len(), 2);
}

#[test]
fn client_reports_forget_terminal_jobs_after_delivery() {
    let harness = harness(1, TestExecutor::new(|_ctx| Ok(ExecutionOutput::default())));
    let job = harness
        .scheduler
        .submit_definition("alice", definition("quick", &["iris"]))
        .unwrap();
    harness.wait_terminal(job);
    assert!(harness.scheduler.jobs_for_client("bob").is_empty());
    let report = harness.scheduler.jobs_for_client("alice");
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].progress.status, RunStatus::Finished);
    assert_eq!(harness.scheduler.jobs_for_client("alice").len(), 0);
    assert!(harness.scheduler.status(job).is_none());
}

/// Layered optimization of `threshold` in `0..=1`, scored by Silhouette.
fn layered(name: &str, iterations: usize) -> RunDefinition {
    let mut definition = definition(name, &["iris"]);
    definition.mode = RunMode::ParameterOptimization {
        method: "LayeredDivisive".into(),
        iterations,
        criterion: None,
    };
    definition.programs[0].parameters = vec![ProgramParameter {
        name: "threshold".into(),
        default: "0.5".into(),
        values: Vec::new(),
        min: Some(0.0),
        max: Some(1.0),
        integer: false,
    }];
    definition.quality_measures = vec!["Silhouette".into()];
    definition
}

#[test]
fn layered_optimization_refines_around_the_best_point() {
    // Quality grows with the threshold, so every layer narrows towards 1.
    let executor = TestExecutor::new(|ctx| {
        let threshold = ctx.runnable().parameters().get("threshold").unwrap_or("0");
        Ok(ExecutionOutput {
            quality: [("Silhouette".to_string(), threshold.to_string())].into(),
            ..ExecutionOutput::default()
        })
    });
    let harness = harness(2, executor.clone());
    let job = harness
        .scheduler
        .submit_definition("alice", layered("layers", 9))
        .unwrap();

    let status = harness.wait_terminal(job);
    assert_eq!(status.progress.status, RunStatus::Finished);
    let executed = executor.executed();
    assert!(executed.len() > 4, "only the first layer ran: {executed:?}");
    assert!(executed.len() <= 9);
    assert_eq!(executor.max_parallel.load(Ordering::SeqCst), 1);

    let reports = harness.scheduler.optimization_status_for_client("alice");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].method, "LayeredDivisive");
    let pair = &reports[0].pairs[0];
    assert_eq!((pair.program.as_str(), pair.data.as_str()), ("tc", "iris"));
    assert_eq!(pair.percent_complete, 100.0);
    let best = &pair.best["Silhouette"];
    assert_eq!(best.parameters.get("threshold"), Some("1"));
    assert_eq!(best.quality, 1.0);

    // Reading optimization status leaves the job for the regular report.
    assert!(harness.scheduler.optimization_status_for_client("bob").is_empty());
    assert_eq!(harness.scheduler.jobs_for_client("alice").len(), 1);
}

#[test]
fn submitting_a_huge_parameter_space_stays_responsive() {
    let gate = Arc::new(AtomicBool::new(false));
    let executor = {
        let gate = Arc::clone(&gate);
        TestExecutor::new(move |ctx| gated(ctx, &gate))
    };
    let harness = harness(1, executor);
    let mut definition = layered("wide", 50);
    let template = definition.programs[0].parameters[0].clone();
    definition.programs[0].parameters = (0..60)
        .map(|i| ProgramParameter {
            name: format!("p{i}"),
            ..template.clone()
        })
        .collect();

    let started = Instant::now();
    let job = harness
        .scheduler
        .submit_definition("client", definition)
        .unwrap();
    assert!(started.elapsed() < WAIT);
    // Status queries are served while the run is queued.
    assert!(harness.status(job).runnables.len() <= 50);
    assert_eq!(harness.scheduler.queue(), vec!["wide"]);
    assert!(harness.scheduler.terminate(job));
    gate.store(true, Ordering::SeqCst);
}

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use clusteval_plugin_sdk::{
    CancelFlag, Capability, CapabilityKind, Invocation, InvocationOutput, InvocationRequest,
};
use clusteval_registry::CapabilityRegistry;
use clusteval_rengine::{EngineError, SessionPool, SharedSession, WorkerId};
use clusteval_run::{DataConfig, ProgramConfig, Runnable, RunnableTask};
use tracing::debug;

use crate::ExecutionError;

/// What a runnable produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub output: Option<String>,
    pub quality: BTreeMap<String, String>,
    pub postprocessed: BTreeMap<String, String>,
}

/// Everything an executor may use while running one runnable on one worker.
pub struct ExecutionContext<'a> {
    runnable: &'a Runnable,
    registry: &'a CapabilityRegistry,
    pool: &'a SessionPool,
    worker: WorkerId,
    cancel: &'a CancelFlag,
    output_dir: PathBuf,
    session: Option<SharedSession>,
    attempt: u32,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        runnable: &'a Runnable,
        registry: &'a CapabilityRegistry,
        pool: &'a SessionPool,
        worker: WorkerId,
        cancel: &'a CancelFlag,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            runnable,
            registry,
            pool,
            worker,
            cancel,
            output_dir,
            session: None,
            attempt: 0,
        }
    }

    pub fn runnable(&self) -> &'a Runnable {
        self.runnable
    }

    pub fn registry(&self) -> &'a CapabilityRegistry {
        self.registry
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn cancel(&self) -> &'a CancelFlag {
        self.cancel
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Zero on the first attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn check_cancelled(&self) -> Result<(), ExecutionError> {
        if self.cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The worker's engine session, created on first use and bound to the
    /// runnable so that terminating it interrupts this session.
    pub fn session(&mut self) -> Result<SharedSession, EngineError> {
        if let Some(session) = &self.session {
            if !session.interrupt_handle().is_interrupted() {
                return Ok(session.clone());
            }
        }
        let session = self.pool.session_for(self.worker)?;
        self.runnable.bind_session(session.interrupt_handle());
        self.session = Some(session.clone());
        Ok(session)
    }

    /// Discards the session so the next attempt starts on a fresh one.
    pub(crate) fn retry(&mut self) {
        self.attempt += 1;
        if self.session.take().is_some() {
            self.pool.destroy(self.worker);
        }
    }

    pub(crate) fn into_session(self) -> Option<SharedSession> {
        self.session
    }
}

/// Runs one runnable. Implementations must check the cancel flag at safe
/// points and return [`ExecutionError::Cancelled`] when it is set.
pub trait RunnableExecutor: Send + Sync {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<ExecutionOutput, ExecutionError>;
}

/// Default executor.
///
/// A clustering runnable runs the data's preprocessors, then the program,
/// then every quality measure and post-processor of the run on the
/// program's result. A failing quality measure or post-processor is
/// recorded on the runnable and does not fail it; a failing preprocessor or
/// program does. Analysis runnables invoke their statistic once.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProgramExecutor;

impl RunnableExecutor for ProgramExecutor {
    fn execute(&self, ctx: &mut ExecutionContext<'_>) -> Result<ExecutionOutput, ExecutionError> {
        ctx.check_cancelled()?;
        let runnable = ctx.runnable();
        let base = InvocationRequest::new()
            .with_value("run", runnable.run_name())
            .in_dir(ctx.output_dir());
        match runnable.task() {
            RunnableTask::Clustering { program, data } => cluster(ctx, program, data, base),
            RunnableTask::DataStatistic { statistic, data } => {
                let request = with_data(base, data, &data.dataset);
                compute(ctx, CapabilityKind::DataStatistic, statistic, &request)
            }
            RunnableTask::RunStatistic {
                statistic,
                result,
                path,
            } => {
                let request = base
                    .with_value("result_id", result.as_str())
                    .with_value("result_dir", path.display().to_string());
                compute(ctx, CapabilityKind::RunStatistic, statistic, &request)
            }
            RunnableTask::RunDataStatistic {
                statistic,
                result,
                path,
                data,
            } => {
                let request = with_data(base, data, &data.dataset)
                    .with_value("result_id", result.as_str())
                    .with_value("result_dir", path.display().to_string());
                compute(ctx, CapabilityKind::RunDataStatistic, statistic, &request)
            }
        }
    }
}

fn with_data(request: InvocationRequest, data: &DataConfig, dataset: &Path) -> InvocationRequest {
    let request = request
        .with_value("data", data.name.as_str())
        .with_value("dataset", dataset.display().to_string())
        .with_value("data_format", data.format.as_str())
        .with_value("distance_measure", data.distance_measure.as_str());
    match &data.goldstandard {
        Some(goldstandard) => {
            request.with_value("goldstandard", goldstandard.display().to_string())
        }
        None => request,
    }
}

fn compute(
    ctx: &mut ExecutionContext<'_>,
    kind: CapabilityKind,
    name: &str,
    request: &InvocationRequest,
) -> Result<ExecutionOutput, ExecutionError> {
    let statistic = ctx.registry().lookup(kind, name)?.create();
    let produced = invoke(ctx, statistic.as_ref(), request)?;
    Ok(ExecutionOutput {
        output: Some(produced.output.trim().to_string()),
        ..ExecutionOutput::default()
    })
}

fn cluster(
    ctx: &mut ExecutionContext<'_>,
    config: &ProgramConfig,
    data: &DataConfig,
    base: InvocationRequest,
) -> Result<ExecutionOutput, ExecutionError> {
    let runnable = ctx.runnable();
    let definition = &runnable.run().definition;
    let key = runnable.identity().key();

    let mut dataset = data.dataset.clone();
    for preprocessor in &data.preprocessors {
        ctx.check_cancelled()?;
        let output = ctx.output_dir().join(format!("{key}.{preprocessor}.data"));
        let request = with_data(base.clone(), data, &dataset)
            .with_value("output", output.display().to_string());
        let capability = ctx
            .registry()
            .lookup(CapabilityKind::DataPreprocessor, preprocessor)?
            .create();
        invoke(ctx, capability.as_ref(), &request)?;
        dataset = output;
    }

    let result_file = ctx.output_dir().join(format!("{key}.results"));
    let mut request = with_data(base, data, &dataset)
        .with_value("program", config.name.as_str())
        .with_value("output_format", config.output_format.as_str())
        .with_value("output", result_file.display().to_string());
    for (name, value) in runnable.parameters().iter() {
        request = request.with_value(name.as_str(), value.as_str());
    }

    let program = ctx
        .registry()
        .lookup(CapabilityKind::Program, &config.program)?
        .create();
    let produced = invoke(ctx, program.as_ref(), &request)?;
    let mut output = ExecutionOutput {
        output: Some(produced.output.clone()),
        ..ExecutionOutput::default()
    };

    let request = request.with_value("result", produced.output.trim());
    for measure in &definition.quality_measures {
        if let Some(value) = follow_up(
            ctx,
            CapabilityKind::ClusteringQualityMeasure,
            measure,
            &request,
        )? {
            output.quality.insert(measure.clone(), value);
        }
    }
    for postprocessor in &definition.postprocessors {
        if let Some(value) = follow_up(
            ctx,
            CapabilityKind::RunResultPostprocessor,
            postprocessor,
            &request,
        )? {
            output.postprocessed.insert(postprocessor.clone(), value);
        }
    }
    Ok(output)
}

/// Runs a quality measure or post-processor. Ordinary failures become part
/// of the runnable's result; cancellation and transient failures propagate.
fn follow_up(
    ctx: &mut ExecutionContext<'_>,
    kind: CapabilityKind,
    name: &str,
    request: &InvocationRequest,
) -> Result<Option<String>, ExecutionError> {
    ctx.check_cancelled()?;
    let attempt = ctx
        .registry()
        .lookup(kind, name)
        .map_err(ExecutionError::from)
        .and_then(|factory| invoke(ctx, factory.create().as_ref(), request));
    match attempt {
        Ok(produced) => Ok(Some(produced.output.trim().to_string())),
        Err(err) if err.is_cancellation() || err.is_transient() => Err(err),
        Err(err) => {
            ctx.runnable().record_exception(format!("{kind} `{name}`: {err}"));
            Ok(None)
        }
    }
}

/// Invokes a capability, handing it the worker's engine session if it
/// evaluates R code or needs R libraries.
pub fn invoke(
    ctx: &mut ExecutionContext<'_>,
    capability: &dyn Capability,
    request: &InvocationRequest,
) -> Result<InvocationOutput, ExecutionError> {
    let descriptor = capability.descriptor();
    let needs_session = matches!(descriptor.invocation, Invocation::RScript { .. })
        || !descriptor.required_libraries.is_empty();
    if !needs_session {
        return Ok(capability.invoke(request, None, ctx.cancel())?);
    }

    let session = ctx.session()?;
    let mut guard = session.lock();
    for library in &descriptor.required_libraries {
        guard.load_library(library, &descriptor.name)?;
    }
    debug!(worker = %ctx.worker(), capability = %descriptor.id(), "invoking with engine session");
    Ok(capability.invoke(request, Some(&mut *guard), ctx.cancel())?)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clusteval_plugin_sdk::{CapabilityDescriptor, CapabilityFactory, DeclaredFactory};
    use clusteval_rengine::ScriptedEngineFactory;
    use clusteval_run::{decompose, ResolvedRun, RunDefinition, RunMode};
    use pretty_assertions::assert_eq;

    use super::*;

    fn register(registry: &CapabilityRegistry, descriptor: CapabilityDescriptor) {
        let name = descriptor.name.clone();
        let kind = descriptor.kind;
        let factory: Arc<dyn CapabilityFactory> = Arc::new(DeclaredFactory::new(descriptor));
        registry.register(kind, &name, factory);
    }

    fn runnable(quality_measures: Vec<String>) -> Arc<Runnable> {
        runnable_with(RunMode::Clustering, Vec::new(), quality_measures)
    }

    fn runnable_with(
        mode: RunMode,
        preprocessors: Vec<String>,
        quality_measures: Vec<String>,
    ) -> Arc<Runnable> {
        let run = Arc::new(ResolvedRun {
            definition: Arc::new(RunDefinition {
                name: "test".into(),
                mode,
                context: "Clustering".into(),
                programs: vec![ProgramConfig {
                    name: "kmeans".into(),
                    program: "KMeans".into(),
                    input_formats: Vec::new(),
                    output_format: "TabSeparated".into(),
                    parameters: Vec::new(),
                }],
                data: vec![DataConfig {
                    name: "iris".into(),
                    dataset: "data/iris".into(),
                    format: "Matrix".into(),
                    distance_measure: "Euclidian".into(),
                    goldstandard: None,
                    data_type: None,
                    preprocessors,
                }],
                quality_measures,
                postprocessors: Vec::new(),
            }),
            standard_input: None,
            standard_output: "TabSeparated".into(),
            optimization: None,
            optima: BTreeMap::new(),
            results: BTreeMap::new(),
        });
        decompose(&run).runnables.remove(0)
    }

    fn registry() -> CapabilityRegistry {
        let registry = CapabilityRegistry::new();
        register(
            &registry,
            CapabilityDescriptor::new(CapabilityKind::Program, "KMeans")
                .with_libraries(["stats"])
                .with_invocation(Invocation::RScript {
                    script: "kmeans('{{dataset}}')".into(),
                }),
        );
        register(
            &registry,
            CapabilityDescriptor::new(CapabilityKind::ClusteringQualityMeasure, "Silhouette")
                .with_invocation(Invocation::RScript {
                    script: "silhouette('{{result}}')".into(),
                }),
        );
        register(
            &registry,
            CapabilityDescriptor::new(CapabilityKind::ClusteringQualityMeasure, "Broken")
                .with_invocation(Invocation::RScript {
                    script: "broken({{missing}})".into(),
                }),
        );
        register(
            &registry,
            CapabilityDescriptor::new(CapabilityKind::DataPreprocessor, "RemoveEmptyRows")
                .with_invocation(Invocation::RScript {
                    script: "strip('{{dataset}}', '{{output}}')".into(),
                }),
        );
        register(
            &registry,
            CapabilityDescriptor::new(CapabilityKind::DataStatistic, "NumberOfSamples")
                .with_invocation(Invocation::RScript {
                    script: "nrow('{{dataset}}')".into(),
                }),
        );
        registry
    }

    #[test]
    fn program_then_quality_measures_share_the_worker_session() {
        let engine = Arc::new(ScriptedEngineFactory::new().with_responder(|command| {
            Ok(if command.starts_with("kmeans") {
                "1 1 2".to_string()
            } else {
                " 0.42 ".to_string()
            })
        }));
        let pool = SessionPool::new(engine.clone());
        let registry = registry();
        let cancel = CancelFlag::new();
        let runnable = runnable(vec!["Silhouette".into(), "Broken".into()]);
        let mut ctx = ExecutionContext::new(
            &runnable,
            &registry,
            &pool,
            WorkerId(2),
            &cancel,
            PathBuf::from("/tmp/out"),
        );

        let output = ProgramExecutor.execute(&mut ctx).unwrap();
        assert_eq!(output.output.as_deref(), Some("1 1 2"));
        assert_eq!(
            output.quality,
            BTreeMap::from([("Silhouette".to_string(), "0.42".to_string())])
        );
        assert_eq!(runnable.exceptions().len(), 1);
        assert_eq!(engine.connections(), 1);
        let commands: Vec<String> = engine.commands().into_iter().map(|(_, c)| c).collect();
        assert_eq!(commands[1], "kmeans('data/iris')");
        assert_eq!(commands[2], "silhouette('1 1 2')");
        assert!(ctx.into_session().is_some());
    }

    #[test]
    fn cancelled_context_does_not_invoke() {
        let engine = Arc::new(ScriptedEngineFactory::new());
        let pool = SessionPool::new(engine.clone());
        let registry = registry();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let runnable = runnable(Vec::new());
        let mut ctx = ExecutionContext::new(
            &runnable,
            &registry,
            &pool,
            WorkerId(0),
            &cancel,
            PathBuf::from("/tmp/out"),
        );
        let err = ProgramExecutor.execute(&mut ctx).unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(engine.connections(), 0);
    }

    #[test]
    fn missing_program_is_a_lookup_error() {
        let pool = SessionPool::new(Arc::new(ScriptedEngineFactory::new()));
        let registry = CapabilityRegistry::new();
        let cancel = CancelFlag::new();
        let runnable = runnable(Vec::new());
        let mut ctx = ExecutionContext::new(
            &runnable,
            &registry,
            &pool,
            WorkerId(0),
            &cancel,
            PathBuf::from("/tmp/out"),
        );
        assert!(matches!(
            ProgramExecutor.execute(&mut ctx),
            Err(ExecutionError::Lookup(_))
        ));
    }

    #[test]
    fn preprocessed_data_replaces_the_data_set() {
        let engine = Arc::new(ScriptedEngineFactory::new());
        let pool = SessionPool::new(engine.clone());
        let registry = registry();
        let cancel = CancelFlag::new();
        let runnable = runnable_with(
            RunMode::Clustering,
            vec!["RemoveEmptyRows".into()],
            Vec::new(),
        );
        let mut ctx = ExecutionContext::new(
            &runnable,
            &registry,
            &pool,
            WorkerId(0),
            &cancel,
            PathBuf::from("/tmp/out"),
        );
        ProgramExecutor.execute(&mut ctx).unwrap();
        let commands: Vec<String> = engine.commands().into_iter().map(|(_, c)| c).collect();
        let cleaned = "/tmp/out/kmeans__iris.RemoveEmptyRows.data";
        assert!(commands.contains(&format!("strip('data/iris', '{cleaned}')")));
        assert!(commands.contains(&format!("kmeans('{cleaned}')")));
    }

    #[test]
    fn data_statistics_report_their_value() {
        let engine = Arc::new(
            ScriptedEngineFactory::new().with_responder(|_| Ok("150\n".to_string())),
        );
        let pool = SessionPool::new(engine);
        let registry = registry();
        let cancel = CancelFlag::new();
        let runnable = runnable_with(
            RunMode::DataAnalysis {
                statistics: vec!["NumberOfSamples".into()],
            },
            Vec::new(),
            Vec::new(),
        );
        let mut ctx = ExecutionContext::new(
            &runnable,
            &registry,
            &pool,
            WorkerId(0),
            &cancel,
            PathBuf::from("/tmp/out"),
        );
        let output = ProgramExecutor.execute(&mut ctx).unwrap();
        assert_eq!(output.output.as_deref(), Some("150"));
        assert!(output.quality.is_empty());
    }

    #[test]
    fn terminating_reaches_the_session_in_use() {
        let pool = SessionPool::new(Arc::new(ScriptedEngineFactory::new()));
        let registry = registry();
        let cancel = CancelFlag::new();
        let runnable = runnable(Vec::new());
        runnable.schedule();
        runnable.start(WorkerId(0));
        let mut ctx = ExecutionContext::new(
            &runnable,
            &registry,
            &pool,
            WorkerId(0),
            &cancel,
            PathBuf::from("/tmp/out"),
        );
        let session = ctx.session().unwrap();
        assert!(runnable.terminate());
        assert!(session.interrupt_handle().is_interrupted());
    }
}

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use clusteval_plugin_sdk::{CapabilityDescriptor, CapabilityKind};
use clusteval_registry::{CapabilityRegistry, RegistryError};
use thiserror::Error;

use crate::{
    OptimizationPlan, OptimizationStrategy, Optimum, ResultId, ResultStore, RunDefinition,
    RunMode,
};

/// Configuration errors; fatal to a run before any runnable exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("run `{0}` does not exist")]
    UnknownRun(String),
    #[error("run `{run}` references unknown {kind} `{name}`")]
    UnknownCapability {
        run: String,
        kind: CapabilityKind,
        name: String,
    },
    #[error("run `{0}` has nothing to evaluate")]
    Empty(String),
    #[error("run `{run}` configures {what} `{name}` more than once")]
    DuplicateName {
        run: String,
        what: &'static str,
        name: String,
    },
    #[error(
        "program `{program}` accepts none of {expected:?}, but data `{data}` is `{format}`"
    )]
    IncompatibleInput {
        program: String,
        data: String,
        format: String,
        expected: Vec<String>,
    },
    #[error("program `{program}` writes `{format}`, which cannot be converted to `{expected}`")]
    IncompatibleOutput {
        program: String,
        format: String,
        expected: String,
    },
    #[error("context `{0}` declares no standard output format")]
    IncompleteContext(String),
    #[error("optimization method `{method}` declares unknown strategy `{strategy}`")]
    UnknownStrategy { method: String, strategy: String },
    #[error("run `{run}` optimizes on `{criterion}`, which is not one of its quality measures")]
    UnmeasuredCriterion { run: String, criterion: String },
    #[error("run `{0}` refines layer by layer but measures no quality")]
    MissingCriterion(String),
    #[error("run `{run}` analyzes result `{result}`, which does not exist")]
    UnknownResult { run: String, result: String },
}

/// A run definition whose references were checked against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedRun {
    pub definition: Arc<RunDefinition>,
    pub standard_input: Option<String>,
    pub standard_output: String,
    pub optimization: Option<OptimizationPlan>,
    /// Better direction of each quality measure of the run.
    pub optima: BTreeMap<String, Optimum>,
    /// Directories of the results an analysis run reads.
    pub results: BTreeMap<String, PathBuf>,
}

impl ResolvedRun {
    /// Checks that every result the run analyzes exists in `store` and
    /// records where it lives.
    pub fn locate_results(&mut self, store: &ResultStore) -> Result<(), RunError> {
        for result in self.definition.mode.results() {
            let unknown = || RunError::UnknownResult {
                run: self.definition.name.clone(),
                result: result.clone(),
            };
            let id = ResultId::parse(result).map_err(|_| unknown())?;
            if !store.exists(&id) {
                return Err(unknown());
            }
            self.results.insert(result.clone(), store.path(&id));
        }
        Ok(())
    }

    /// Directory of an analyzed result; the bare id if it was never located.
    pub fn result_path(&self, result: &str) -> PathBuf {
        self.results
            .get(result)
            .cloned()
            .unwrap_or_else(|| PathBuf::from(result))
    }
}

impl RunDefinition {
    /// Checks that every referenced capability exists and that the program and
    /// data formats fit the context.
    ///
    /// A program accepts a data configuration if it accepts either the
    /// context's standard input format or the data's own format (an empty
    /// accept list means any format). Its output format must be the
    /// context's standard output, or a run-result format that converts into it.
    pub fn resolve(&self, registry: &CapabilityRegistry) -> Result<ResolvedRun, RunError> {
        let lookup = |kind: CapabilityKind, name: &str| -> Result<CapabilityDescriptor, RunError> {
            registry
                .descriptor(kind, name)
                .map_err(|RegistryError::NotFound { kind, name }| RunError::UnknownCapability {
                    run: self.name.clone(),
                    kind,
                    name,
                })
        };

        self.check_subjects()?;

        let context = lookup(CapabilityKind::Context, &self.context)?;
        let standard_input = context.accepted_formats.first().cloned();
        let standard_output = context
            .produced_format
            .clone()
            .ok_or_else(|| RunError::IncompleteContext(self.context.clone()))?;

        let mut optima = BTreeMap::new();
        for measure in &self.quality_measures {
            let descriptor = lookup(CapabilityKind::ClusteringQualityMeasure, measure)?;
            optima.insert(measure.clone(), Optimum::from_descriptor(&descriptor));
        }
        let optimization = match &self.mode {
            RunMode::ParameterOptimization {
                method,
                iterations,
                criterion,
            } => {
                let method = lookup(CapabilityKind::ParameterOptimizationMethod, method)?;
                Some(self.plan(&method, *iterations, criterion)?)
            }
            _ => None,
        };
        let statistic_kind = match &self.mode {
            RunMode::DataAnalysis { .. } => Some(CapabilityKind::DataStatistic),
            RunMode::RunAnalysis { .. } => Some(CapabilityKind::RunStatistic),
            RunMode::RunDataAnalysis { .. } => Some(CapabilityKind::RunDataStatistic),
            _ => None,
        };
        if let Some(kind) = statistic_kind {
            for statistic in self.mode.statistics() {
                lookup(kind, statistic)?;
            }
        }
        for postprocessor in &self.postprocessors {
            lookup(CapabilityKind::RunResultPostprocessor, postprocessor)?;
        }
        for data in &self.data {
            lookup(CapabilityKind::DataSetFormat, &data.format)?;
            lookup(CapabilityKind::DistanceMeasure, &data.distance_measure)?;
            if let Some(data_type) = &data.data_type {
                lookup(CapabilityKind::DataSetType, data_type)?;
            }
            for preprocessor in &data.preprocessors {
                lookup(CapabilityKind::DataPreprocessor, preprocessor)?;
            }
        }

        for program in &self.programs {
            let descriptor = lookup(CapabilityKind::Program, &program.program)?;
            let accepted = if program.input_formats.is_empty() {
                descriptor.accepted_formats
            } else {
                program.input_formats.clone()
            };
            for data in &self.data {
                let fits = accepted.is_empty()
                    || accepted.contains(&data.format)
                    || standard_input
                        .as_ref()
                        .is_some_and(|input| accepted.contains(input));
                if !fits {
                    return Err(RunError::IncompatibleInput {
                        program: program.name.clone(),
                        data: data.name.clone(),
                        format: data.format.clone(),
                        expected: accepted,
                    });
                }
            }

            let output = lookup(CapabilityKind::RunResultFormat, &program.output_format)?;
            let converts = program.output_format == standard_output
                || output.produced_format.as_deref() == Some(standard_output.as_str());
            if !converts {
                return Err(RunError::IncompatibleOutput {
                    program: program.name.clone(),
                    format: program.output_format.clone(),
                    expected: standard_output,
                });
            }
        }

        Ok(ResolvedRun {
            definition: Arc::new(self.clone()),
            standard_input,
            standard_output,
            optimization,
            optima,
            results: BTreeMap::new(),
        })
    }

    /// Every mode needs something to work on, and configuration names must
    /// be unique so each runnable has exactly one configuration.
    fn check_subjects(&self) -> Result<(), RunError> {
        let empty = match &self.mode {
            RunMode::Clustering | RunMode::ParameterOptimization { .. } => {
                self.programs.is_empty() || self.data.is_empty()
            }
            RunMode::DataAnalysis { statistics } => statistics.is_empty() || self.data.is_empty(),
            RunMode::RunAnalysis {
                statistics,
                results,
            } => statistics.is_empty() || results.is_empty(),
            RunMode::RunDataAnalysis {
                statistics,
                results,
            } => statistics.is_empty() || results.is_empty() || self.data.is_empty(),
        };
        if empty {
            return Err(RunError::Empty(self.name.clone()));
        }

        let duplicate = |what: &'static str, names: Vec<&String>| {
            let mut seen = HashSet::new();
            match names.into_iter().find(|name| !seen.insert(*name)) {
                Some(name) => Err(RunError::DuplicateName {
                    run: self.name.clone(),
                    what,
                    name: name.clone(),
                }),
                None => Ok(()),
            }
        };
        duplicate("program", self.programs.iter().map(|p| &p.name).collect())?;
        duplicate("data", self.data.iter().map(|d| &d.name).collect())
    }

    fn plan(
        &self,
        method: &CapabilityDescriptor,
        iterations: usize,
        criterion: &Option<String>,
    ) -> Result<OptimizationPlan, RunError> {
        let strategy = OptimizationStrategy::from_descriptor(method).ok_or_else(|| {
            RunError::UnknownStrategy {
                method: method.name.clone(),
                strategy: method.property("strategy").unwrap_or_default().to_string(),
            }
        })?;
        let criterion = criterion
            .clone()
            .or_else(|| self.quality_measures.first().cloned());
        if let Some(criterion) = &criterion {
            if !self.quality_measures.contains(criterion) {
                return Err(RunError::UnmeasuredCriterion {
                    run: self.name.clone(),
                    criterion: criterion.clone(),
                });
            }
        }
        if strategy == OptimizationStrategy::Layered && criterion.is_none() {
            return Err(RunError::MissingCriterion(self.name.clone()));
        }
        Ok(OptimizationPlan {
            method: method.name.clone(),
            strategy,
            iterations,
            criterion,
        })
    }
}

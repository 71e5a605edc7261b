use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A configured unit of evaluation work, as read from `runs/*.run.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDefinition {
    pub name: String,
    #[serde(default)]
    pub mode: RunMode,
    pub context: String,
    #[serde(default)]
    pub programs: Vec<ProgramConfig>,
    #[serde(default)]
    pub data: Vec<DataConfig>,
    #[serde(default)]
    pub quality_measures: Vec<String>,
    #[serde(default)]
    pub postprocessors: Vec<String>,
}

/// What a run evaluates.
///
/// Clustering and optimization runs pair programs with data; the analysis
/// modes compute statistics of data sets, of earlier run results, or of both.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Clustering,
    ParameterOptimization {
        method: String,
        iterations: usize,
        /// Quality measure a layered search refines on; the run's first
        /// quality measure when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        criterion: Option<String>,
    },
    DataAnalysis {
        statistics: Vec<String>,
    },
    /// Statistics over the results of earlier runs, named by result id.
    RunAnalysis {
        statistics: Vec<String>,
        results: Vec<String>,
    },
    RunDataAnalysis {
        statistics: Vec<String>,
        results: Vec<String>,
    },
}

impl RunMode {
    pub fn is_optimization(&self) -> bool {
        matches!(self, RunMode::ParameterOptimization { .. })
    }

    /// Statistics computed by the analysis modes; empty otherwise.
    pub fn statistics(&self) -> &[String] {
        match self {
            RunMode::DataAnalysis { statistics }
            | RunMode::RunAnalysis { statistics, .. }
            | RunMode::RunDataAnalysis { statistics, .. } => statistics,
            _ => &[],
        }
    }

    /// Earlier results analyzed by this run.
    pub fn results(&self) -> &[String] {
        match self {
            RunMode::RunAnalysis { results, .. } | RunMode::RunDataAnalysis { results, .. } => {
                results
            }
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramConfig {
    pub name: String,
    /// Registered program capability.
    pub program: String,
    /// Overrides the formats the program capability accepts.
    #[serde(default)]
    pub input_formats: Vec<String>,
    pub output_format: String,
    #[serde(default)]
    pub parameters: Vec<ProgramParameter>,
}

impl ProgramConfig {
    /// Every parameter at its default value.
    pub fn default_point(&self) -> ParameterPoint {
        ParameterPoint(
            self.parameters
                .iter()
                .map(|p| (p.name.clone(), p.default.clone()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataConfig {
    pub name: String,
    pub dataset: PathBuf,
    pub format: String,
    pub distance_measure: String,
    #[serde(default)]
    pub goldstandard: Option<PathBuf>,
    /// Registered data set type, e.g. `GeneExpression`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    /// Applied in order before clustering; each one's output replaces the
    /// data set for the next.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preprocessors: Vec<String>,
}

/// A program parameter and the values an optimization run may try.
///
/// A parameter either lists its `values` or spans `min..=max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramParameter {
    pub name: String,
    pub default: String,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Only whole numbers of the range are tried.
    #[serde(default)]
    pub integer: bool,
}

pub(crate) fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        let rounded = (value * 1e6).round() / 1e6;
        format!("{rounded}")
    }
}

/// One assignment of values to a program's parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterPoint(pub BTreeMap<String, String>);

impl ParameterPoint {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl fmt::Display for ParameterPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self.0.iter().map(|(k, v)| format!("{k}={v}")).collect();
        f.write_str(&pairs.join(","))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_point_takes_every_default() {
        let program = ProgramConfig {
            name: "kmeans_iris".into(),
            program: "KMeans".into(),
            input_formats: Vec::new(),
            output_format: "TabSeparated".into(),
            parameters: vec![ProgramParameter {
                name: "k".into(),
                default: "3".into(),
                values: Vec::new(),
                min: Some(2.0),
                max: Some(10.0),
                integer: true,
            }],
        };
        assert_eq!(program.default_point().to_string(), "k=3");
    }

    #[test]
    fn format_number_drops_integral_fractions() {
        assert_eq!(format_number(4.0), "4");
        assert_eq!(format_number(-0.25), "-0.25");
        assert_eq!(format_number(1.0 / 3.0), "0.333333");
    }

    #[test]
    fn definition_parses_from_json() {
        let definition: RunDefinition = serde_json::from_str(
            r#"{
                "name": "tc_vs_kmeans",
                "context": "Clustering",
                "programs": [
                    { "name": "kmeans", "program": "KMeans", "output_format": "TabSeparated" }
                ],
                "data": [{
                    "name": "iris",
                    "dataset": "data/iris.sim",
                    "format": "SimMatrix",
                    "distance_measure": "Euclidian",
                    "preprocessors": ["RemoveEmptyRows"]
                }],
                "quality_measures": ["SilhouetteValue"]
            }"#,
        )
        .unwrap();
        assert_eq!(definition.mode, RunMode::Clustering);
        assert_eq!(definition.data[0].goldstandard, None);
        assert_eq!(definition.data[0].preprocessors, vec!["RemoveEmptyRows"]);
        assert_eq!(definition.quality_measures, vec!["SilhouetteValue"]);
    }

    #[test]
    fn analysis_modes_parse_with_their_subjects() {
        let mode: RunMode = serde_json::from_str(
            r#"{ "type": "run_data_analysis",
                 "statistics": ["LinearModelLasso"],
                 "results": ["03_14_2024-09_26_53_tc_vs_kmeans"] }"#,
        )
        .unwrap();
        assert_eq!(mode.statistics(), ["LinearModelLasso"]);
        assert_eq!(mode.results(), ["03_14_2024-09_26_53_tc_vs_kmeans"]);
        assert!(!mode.is_optimization());

        let mode: RunMode = serde_json::from_str(
            r#"{ "type": "parameter_optimization", "method": "Divisive", "iterations": 9 }"#,
        )
        .unwrap();
        assert_eq!(
            mode,
            RunMode::ParameterOptimization {
                method: "Divisive".into(),
                iterations: 9,
                criterion: None,
            }
        );
    }
}

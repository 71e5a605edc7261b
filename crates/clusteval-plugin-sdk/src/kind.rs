use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Extension points that plugins can provide implementations for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CapabilityKind {
    DataSetFormat,
    DataSetType,
    DistanceMeasure,
    ClusteringQualityMeasure,
    Program,
    RunResultFormat,
    RunResultPostprocessor,
    Context,
    ParameterOptimizationMethod,
    DataStatistic,
    RunStatistic,
    RunDataStatistic,
    DataPreprocessor,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 13] = [
        CapabilityKind::DataSetFormat,
        CapabilityKind::DataSetType,
        CapabilityKind::DistanceMeasure,
        CapabilityKind::ClusteringQualityMeasure,
        CapabilityKind::Program,
        CapabilityKind::RunResultFormat,
        CapabilityKind::RunResultPostprocessor,
        CapabilityKind::Context,
        CapabilityKind::ParameterOptimizationMethod,
        CapabilityKind::DataStatistic,
        CapabilityKind::RunStatistic,
        CapabilityKind::RunDataStatistic,
        CapabilityKind::DataPreprocessor,
    ];

    /// Suffix every implementation name of this kind ends with.
    pub fn suffix(self) -> &'static str {
        match self {
            CapabilityKind::DataSetFormat => "DataSetFormat",
            CapabilityKind::DataSetType => "DataSetType",
            CapabilityKind::DistanceMeasure => "DistanceMeasure",
            CapabilityKind::ClusteringQualityMeasure => "ClusteringQualityMeasure",
            CapabilityKind::Program => "RProgram",
            CapabilityKind::RunResultFormat => "RunResultFormat",
            CapabilityKind::RunResultPostprocessor => "RunResultPostprocessor",
            CapabilityKind::Context => "Context",
            CapabilityKind::ParameterOptimizationMethod => "ParameterOptimizationMethod",
            CapabilityKind::DataStatistic => "DataStatistic",
            CapabilityKind::RunStatistic => "RunStatistic",
            CapabilityKind::RunDataStatistic => "RunDataStatistic",
            CapabilityKind::DataPreprocessor => "DataPreprocessor",
        }
    }

    /// Plugin directory of this kind, relative to the plugin root.
    pub fn directory(self) -> &'static str {
        match self {
            CapabilityKind::DataSetFormat => "formats/dataset",
            CapabilityKind::DataSetType => "types/dataset",
            CapabilityKind::DistanceMeasure => "distanceMeasures",
            CapabilityKind::ClusteringQualityMeasure => "clustering/qualityMeasures",
            CapabilityKind::Program => "programs",
            CapabilityKind::RunResultFormat => "formats/runresult",
            CapabilityKind::RunResultPostprocessor => "postprocessing",
            CapabilityKind::Context => "contexts",
            CapabilityKind::ParameterOptimizationMethod => "clustering/paramOptimization",
            CapabilityKind::DataStatistic => "statistics/data",
            CapabilityKind::RunStatistic => "statistics/run",
            CapabilityKind::RunDataStatistic => "statistics/rundata",
            CapabilityKind::DataPreprocessor => "preprocessing",
        }
    }

    /// Name of the discovery loop for this kind, also used for its
    /// `<name>SleepTime` configuration key.
    pub fn loop_name(self) -> String {
        format!("{}FinderThread", self.suffix())
    }

    /// Derives the implementation name from an archive path: `FooDistanceMeasure.jar`
    /// yields `Foo`. Returns `None` if the file does not follow the convention.
    pub fn name_from_file(self, path: &Path) -> Option<String> {
        let stem = path.file_stem()?.to_str()?;
        let name = stem.strip_suffix(self.suffix())?;
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown capability kind `{0}`")]
pub struct UnknownKind(pub String);

impl FromStr for CapabilityKind {
    type Err = UnknownKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized: String = value
            .chars()
            .filter(|ch| *ch != '_' && *ch != '-' && !ch.is_whitespace())
            .collect();
        CapabilityKind::ALL
            .into_iter()
            .find(|kind| {
                kind.suffix().eq_ignore_ascii_case(&normalized)
                    || format!("{kind:?}").eq_ignore_ascii_case(&normalized)
            })
            .ok_or_else(|| UnknownKind(value.to_string()))
    }
}

/// Fully qualified capability name, written `<Kind>/<Name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityId {
    pub kind: CapabilityKind,
    pub name: String,
}

impl CapabilityId {
    pub fn new(kind: CapabilityKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for CapabilityId {
    type Err = UnknownKind;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, name) = value
            .split_once('/')
            .ok_or_else(|| UnknownKind(value.to_string()))?;
        if name.is_empty() {
            return Err(UnknownKind(value.to_string()));
        }
        Ok(Self::new(kind.parse()?, name))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn derives_name_from_archive_file() {
        let kind = CapabilityKind::DistanceMeasure;
        assert_eq!(
            kind.name_from_file(&PathBuf::from("/plugins/FooDistanceMeasure.jar")),
            Some("Foo".to_string())
        );
        assert_eq!(kind.name_from_file(Path::new("DistanceMeasure.jar")), None);
        assert_eq!(kind.name_from_file(Path::new("FooContext.jar")), None);
        assert_eq!(
            CapabilityKind::Program.name_from_file(Path::new("KMeansRProgram.json")),
            Some("KMeans".to_string())
        );
    }

    #[test]
    fn parses_kinds_loosely() {
        assert_eq!(
            "distance-measure".parse::<CapabilityKind>(),
            Ok(CapabilityKind::DistanceMeasure)
        );
        assert_eq!("RProgram".parse::<CapabilityKind>(), Ok(CapabilityKind::Program));
        assert_eq!("program".parse::<CapabilityKind>(), Ok(CapabilityKind::Program));
        assert!("planet".parse::<CapabilityKind>().is_err());
    }

    #[test]
    fn qualified_ids_round_trip_through_display() {
        let id: CapabilityId = "DistanceMeasure/Foo".parse().unwrap();
        assert_eq!(id, CapabilityId::new(CapabilityKind::DistanceMeasure, "Foo"));
        assert_eq!(id.to_string(), "DistanceMeasure/Foo");
        assert!("DistanceMeasure/".parse::<CapabilityId>().is_err());
    }

    #[test]
    fn every_kind_has_its_own_directory() {
        let mut directories: Vec<_> = CapabilityKind::ALL.iter().map(|k| k.directory()).collect();
        directories.sort();
        directories.dedup();
        assert_eq!(directories.len(), CapabilityKind::ALL.len());
        assert_eq!(
            CapabilityKind::DistanceMeasure.loop_name(),
            "DistanceMeasureFinderThread"
        );
    }
}

use std::sync::Arc;

use clusteval_plugin_sdk::{
    CapabilityDescriptor, CapabilityFactory, CapabilityId, CapabilityKind, DeclaredFactory,
    Invocation,
};
use indexmap::IndexMap;

/// Factories compiled into the binary, looked up by kind and name.
///
/// An empty archive file named after one of these entries activates it, the
/// same way a dropped-in archive activates a dynamically loaded one.
#[derive(Default)]
pub struct BuiltinCatalog {
    factories: IndexMap<CapabilityId, Arc<dyn CapabilityFactory>>,
}

impl BuiltinCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, factory: Arc<dyn CapabilityFactory>) -> &mut Self {
        let id = factory.descriptor().id();
        self.factories.insert(id, factory);
        self
    }

    pub fn with(mut self, descriptor: CapabilityDescriptor) -> Self {
        self.insert(Arc::new(DeclaredFactory::new(descriptor)));
        self
    }

    pub fn get(&self, kind: CapabilityKind, name: &str) -> Option<Arc<dyn CapabilityFactory>> {
        self.factories
            .get(&CapabilityId::new(kind, name))
            .cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &CapabilityId> {
        self.factories.keys()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Formats, contexts and measures every installation ships with.
    pub fn standard() -> Self {
        use CapabilityKind::*;

        Self::new()
            .with(CapabilityDescriptor::new(DataSetFormat, "SimMatrix"))
            .with(CapabilityDescriptor::new(DataSetFormat, "Matrix"))
            .with(CapabilityDescriptor::new(DataSetFormat, "RowSim"))
            .with(CapabilityDescriptor::new(DataSetType, "Synthetic"))
            .with(CapabilityDescriptor::new(DataSetType, "GeneExpression"))
            .with(
                CapabilityDescriptor::new(Context, "Clustering")
                    .accepting(["SimMatrix"])
                    .producing("TabSeparated"),
            )
            .with(
                CapabilityDescriptor::new(RunResultFormat, "TabSeparated")
                    .producing("TabSeparated"),
            )
            .with(CapabilityDescriptor::new(DistanceMeasure, "Euclidian"))
            .with(CapabilityDescriptor::new(DistanceMeasure, "PearsonCorrelation"))
            .with(
                CapabilityDescriptor::new(ClusteringQualityMeasure, "SilhouetteValue")
                    .with_libraries(["cluster"])
                    .with_invocation(Invocation::RScript {
                        script: "summary(silhouette(clustering, dist(data)))$avg.width".into(),
                    })
                    .with_property("optimum", "max"),
            )
            .with(
                CapabilityDescriptor::new(ClusteringQualityMeasure, "FMeasure")
                    .with_property("optimum", "max"),
            )
            .with(
                CapabilityDescriptor::new(ClusteringQualityMeasure, "DaviesBouldinIndex")
                    .with_libraries(["clusterSim"])
                    .with_invocation(Invocation::RScript {
                        script: "index.DB(data, clustering)$DB".into(),
                    })
                    .with_property("optimum", "min"),
            )
            .with(
                CapabilityDescriptor::new(ParameterOptimizationMethod, "LayeredDivisive")
                    .with_property("strategy", "layered"),
            )
            .with(
                CapabilityDescriptor::new(ParameterOptimizationMethod, "Divisive")
                    .with_property("strategy", "divisive"),
            )
            .with(
                CapabilityDescriptor::new(ParameterOptimizationMethod, "Random")
                    .with_property("strategy", "random"),
            )
            .with(CapabilityDescriptor::new(RunResultPostprocessor, "ClusterSize"))
            .with(
                CapabilityDescriptor::new(DataStatistic, "NumberOfSamples").with_invocation(
                    Invocation::RScript {
                        script: "nrow(read.table('{{dataset}}'))".into(),
                    },
                ),
            )
            .with(
                CapabilityDescriptor::new(RunStatistic, "ParameterImportance")
                    .with_libraries(["randomForest"])
                    .with_invocation(Invocation::RScript {
                        script: "parameterImportance('{{result_dir}}')".into(),
                    }),
            )
            .with(
                CapabilityDescriptor::new(RunDataStatistic, "LinearModelLasso")
                    .with_libraries(["glmnet"])
                    .with_invocation(Invocation::RScript {
                        script: "lassoModel('{{result_dir}}', '{{dataset}}')".into(),
                    }),
            )
            .with(
                CapabilityDescriptor::new(DataPreprocessor, "RemoveEmptyRows").with_invocation(
                    Invocation::RScript {
                        script: concat!(
                            "x <- read.table('{{dataset}}'); ",
                            "write.table(x[rowSums(x != 0) > 0, ], '{{output}}')"
                        )
                        .into(),
                    },
                ),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_catalog_has_clustering_context() {
        let catalog = BuiltinCatalog::standard();
        let context = catalog.get(CapabilityKind::Context, "Clustering").unwrap();
        let descriptor = context.descriptor();
        assert!(descriptor.accepts("SimMatrix"));
        assert_eq!(descriptor.produced_format.as_deref(), Some("TabSeparated"));
        assert!(catalog.get(CapabilityKind::Context, "Missing").is_none());
    }

    #[test]
    fn optimization_methods_declare_their_strategy() {
        let catalog = BuiltinCatalog::standard();
        let strategies: Vec<String> = catalog
            .ids()
            .filter(|id| id.kind == CapabilityKind::ParameterOptimizationMethod)
            .filter_map(|id| catalog.get(id.kind, &id.name))
            .filter_map(|factory| factory.descriptor().property("strategy").map(str::to_string))
            .collect();
        assert_eq!(strategies, vec!["layered", "divisive", "random"]);
    }
}

//! Clusteval Plugin SDK
//! ====================
//!
//! Types shared by everything that provides or consumes capability
//! implementations: the [`CapabilityKind`] extension points, the static
//! [`CapabilityDescriptor`] of an implementation, the [`Capability`] and
//! [`CapabilityFactory`] traits, and the entry point used by dynamically
//! loaded plugin modules.

mod capability;
mod descriptor;
mod kind;

pub use capability::{
    CancelFlag, Capability, CapabilityError, CapabilityFactory, DeclaredCapability,
    DeclaredFactory, InvocationOutput, InvocationRequest, PluginExport, PluginModule,
};
pub use descriptor::{render_template, CapabilityDescriptor, Invocation};
pub use kind::{CapabilityId, CapabilityKind, UnknownKind};

/// Symbol exported by dynamic plugin modules.
pub const PLUGIN_ENTRYPOINT: &[u8] = b"clusteval_plugin_entrypoint";

/// Signature of [`PLUGIN_ENTRYPOINT`].
pub type PluginEntrypoint = unsafe extern "C" fn() -> PluginExport;

/// Common imports for plugin authors.
pub mod prelude {
    pub use crate::{
        CancelFlag, Capability, CapabilityDescriptor, CapabilityError, CapabilityFactory,
        CapabilityKind, DeclaredCapability, Invocation, InvocationOutput, InvocationRequest,
        PluginExport, PluginModule,
    };
}

/// Declare the plugin entry point for a dynamic clusteval plugin module.
///
/// The macro expects one or more expressions that evaluate to types
/// implementing [`CapabilityFactory`]. Each factory will be registered within
/// the exported [`PluginModule`].
///
/// # Example
///
/// ```ignore
/// use clusteval_plugin_sdk::{declare_clusteval_plugins, CapabilityFactory};
///
/// struct EuclideanFactory;
///
/// impl CapabilityFactory for EuclideanFactory { /* ... */ }
///
/// declare_clusteval_plugins!(EuclideanFactory);
/// ```
#[macro_export]
macro_rules! declare_clusteval_plugins {
    ($($factory:expr),+ $(,)?) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn clusteval_plugin_entrypoint() -> $crate::PluginExport {
            let mut module = $crate::PluginModule::new();
            $(module.register_factory(Box::new($factory));)+
            $crate::PluginExport::new(module)
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Euclidean;

    impl CapabilityFactory for Euclidean {
        fn descriptor(&self) -> CapabilityDescriptor {
            CapabilityDescriptor::new(CapabilityKind::DistanceMeasure, "Euclidean")
        }

        fn create(&self) -> std::sync::Arc<dyn Capability> {
            std::sync::Arc::new(DeclaredCapability::new(self.descriptor()))
        }
    }

    declare_clusteval_plugins!(Euclidean);

    #[test]
    fn macro_exports_registered_factories() {
        let export = clusteval_plugin_entrypoint();
        let names: Vec<String> = export
            .module()
            .iter()
            .map(|factory| factory.descriptor().name)
            .collect();
        assert_eq!(names, vec!["Euclidean".to_string()]);
    }
}

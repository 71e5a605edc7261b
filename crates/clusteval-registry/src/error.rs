use clusteval_plugin_sdk::CapabilityKind;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no {kind} named `{name}` is registered")]
    NotFound { kind: CapabilityKind, name: String },
}

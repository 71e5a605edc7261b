//! Shared state of a running clusteval instance: the capability registry
//! that plugin discovery feeds and run resolution reads, and stores for
//! registered domain objects such as run definitions.

mod capabilities;
mod error;
mod objects;

pub use capabilities::{Binding, BindingSummary, CapabilityRegistry};
pub use error::RegistryError;
pub use objects::{ObjectStore, Registered};

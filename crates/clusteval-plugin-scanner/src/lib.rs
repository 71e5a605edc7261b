//! Plugin discovery: polling loops that keep the capability registry (and
//! other file-backed catalogs) in sync with their directories while the
//! system runs.

mod discovery;
mod error;
mod finder;
mod supervisor;

pub use discovery::{CycleReport, DiscoveryHandle, DiscoveryLoop, RemovalPolicy};
pub use error::ScanError;
pub use finder::{CapabilityFinder, Finder};
pub use supervisor::{
    SleepTimes, Supervisor, DEFAULT_LOOP_SLEEP, DEFAULT_SUPERVISOR_SLEEP, SUPERVISOR_NAME,
};

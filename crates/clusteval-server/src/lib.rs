//! Control server: repository configuration, logging, the control facade
//! and its JSON-RPC transport, plus the blocking client used by the CLI.

mod backend;
mod client;
mod config;
mod facade;
mod logging;
pub mod rpc;

pub use backend::{
    discovery_loops, engine_factory, scan_until_settled, Backend, RepositoryLayout, ScanSummary,
};
pub use client::RemoteClient;
pub use config::{
    ConfigError, DatabaseBackend, DatabaseConfig, EngineConfig, ListenConfig, ServerConfig,
    CONFIG_FILE_NAME, DEFAULT_BIND,
};
pub use facade::{ControlError, ControlFacade};
pub use logging::{parse_level, LogControl, LogLevelError};
pub use rpc::{RpcError, RpcServer};

//! Sessions with the external statistical computation engine (R).
//!
//! Every scheduler worker owns at most one [`EngineSession`]. Sessions are
//! created lazily by the [`SessionPool`] the first time a worker asks for one,
//! cleared between runnables and shut down when the worker exits. A session is
//! never handed to a different worker: the engine speaks a single-threaded
//! command protocol and leftover variables must not leak between tasks of
//! different workers.

mod error;
mod pool;
mod process;
mod scripted;
mod session;

pub use error::EngineError;
pub use pool::{SessionPool, SharedSession};
pub use process::{RProcessBackend, RProcessFactory};
pub use scripted::{ScriptedBackend, ScriptedEngineFactory, ScriptedResponder};
pub use session::{
    DisabledEngineFactory, EngineBackend, EngineFactory, EngineSession, InterruptHandle,
    SessionId, WorkerId,
};

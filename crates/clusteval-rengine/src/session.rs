use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::EngineError;

/// Identifier of a scheduler worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Identifier of one engine session; unique for the lifetime of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Cross-thread handle that aborts whatever the session is currently doing.
///
/// Interrupting is one-way: once interrupted, every further call on the
/// session fails with [`EngineError::Interrupted`] and the pool replaces the
/// session on the next request.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
    kill: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            kill: None,
        }
    }

    /// Attach a hook that destroys the underlying process.
    pub fn with_kill(mut self, kill: impl Fn() + Send + Sync + 'static) -> Self {
        self.kill = Some(Arc::new(kill));
        self
    }

    pub fn interrupt(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            if let Some(kill) = &self.kill {
                kill();
            }
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Raw connection to one engine process.
pub trait EngineBackend: Send {
    /// Evaluates a command and returns its printed output.
    fn eval(&mut self, command: &str) -> Result<String, EngineError>;
    fn interrupt_handle(&self) -> InterruptHandle;
    /// Terminates the engine process.
    fn shutdown(&mut self) -> Result<(), EngineError>;
}

/// Creates engine backends for workers.
pub trait EngineFactory: Send + Sync {
    fn connect(&self, worker: WorkerId) -> Result<Box<dyn EngineBackend>, EngineError>;
}

/// Factory used when the engine is switched off in the configuration.
#[derive(Debug, Default)]
pub struct DisabledEngineFactory;

impl EngineFactory for DisabledEngineFactory {
    fn connect(&self, _worker: WorkerId) -> Result<Box<dyn EngineBackend>, EngineError> {
        Err(EngineError::Disabled)
    }
}

/// A stateful engine session owned by one worker.
pub struct EngineSession {
    id: SessionId,
    worker: WorkerId,
    backend: Box<dyn EngineBackend>,
    interrupt: InterruptHandle,
    loaded_libraries: HashSet<String>,
}

impl EngineSession {
    pub(crate) fn new(id: SessionId, worker: WorkerId, backend: Box<dyn EngineBackend>) -> Self {
        let interrupt = backend.interrupt_handle();
        Self {
            id,
            worker,
            backend,
            interrupt,
            loaded_libraries: HashSet::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_interrupted()
    }

    pub fn eval(&mut self, command: &str) -> Result<String, EngineError> {
        if self.is_interrupted() {
            return Err(EngineError::Interrupted);
        }
        self.backend.eval(command)
    }

    /// Assigns a numeric vector to a variable in the session.
    pub fn assign(&mut self, name: &str, values: &[f64]) -> Result<(), EngineError> {
        let rendered: Vec<String> = values.iter().map(|value| format!("{value:?}")).collect();
        self.eval(&format!("{name} <- c({})", rendered.join(",")))
            .map(|_| ())
    }

    /// Loads a library once per session; later calls are free.
    pub fn load_library(&mut self, library: &str, required_by: &str) -> Result<(), EngineError> {
        if self.loaded_libraries.contains(library) {
            return Ok(());
        }
        debug!(session = %self.id, library, "loading engine library");
        match self.eval(&format!("library({library})")) {
            Ok(_) => {
                self.loaded_libraries.insert(library.to_string());
                Ok(())
            }
            Err(EngineError::Evaluation(_)) => Err(EngineError::LibraryNotLoaded {
                library: library.to_string(),
                required_by: required_by.to_string(),
            }),
            Err(err) => Err(err),
        }
    }

    pub fn loaded_libraries(&self) -> impl Iterator<Item = &str> {
        self.loaded_libraries.iter().map(String::as_str)
    }

    /// Wipes all variables; loaded libraries stay attached.
    pub fn clear(&mut self) -> Result<(), EngineError> {
        self.eval("rm(list = ls(all.names = TRUE))").map(|_| ())
    }

    pub(crate) fn shutdown(&mut self) -> Result<(), EngineError> {
        self.backend.shutdown()
    }
}

impl fmt::Debug for EngineSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSession")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .field("loaded_libraries", &self.loaded_libraries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScriptedBackend;

    #[test]
    fn load_library_is_cached_per_session() {
        let backend = ScriptedBackend::new();
        let log = backend.command_log();
        let mut session = EngineSession::new(SessionId(1), WorkerId(0), Box::new(backend));
        session.load_library("cluster", "KMeans").unwrap();
        session.load_library("cluster", "PAM").unwrap();
        let loads = log
            .lock()
            .iter()
            .filter(|command| command.starts_with("library("))
            .count();
        assert_eq!(loads, 1);
    }

    #[test]
    fn interrupted_session_rejects_commands() {
        let mut session = EngineSession::new(
            SessionId(1),
            WorkerId(0),
            Box::new(ScriptedBackend::new()),
        );
        session.interrupt_handle().interrupt();
        assert_eq!(session.eval("1 + 1"), Err(EngineError::Interrupted));
    }

    #[test]
    fn failed_library_maps_to_library_error() {
        let backend = ScriptedBackend::with_responder(|command| {
            if command.starts_with("library(") {
                Err(EngineError::Evaluation("there is no package".into()))
            } else {
                Ok(String::new())
            }
        });
        let mut session = EngineSession::new(SessionId(1), WorkerId(0), Box::new(backend));
        let err = session.load_library("missing", "Foo").unwrap_err();
        assert!(matches!(err, EngineError::LibraryNotLoaded { .. }));
        assert_eq!(session.loaded_libraries().count(), 0);
    }
}

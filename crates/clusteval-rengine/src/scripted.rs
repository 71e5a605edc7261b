use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::{EngineBackend, EngineError, EngineFactory, InterruptHandle, WorkerId};

/// Computes the reply to one evaluated command.
pub type ScriptedResponder = Arc<dyn Fn(&str) -> Result<String, EngineError> + Send + Sync>;

/// In-process engine that answers commands from a closure.
///
/// Used by tests and by deployments without an R installation.
pub struct ScriptedBackend {
    log: Arc<Mutex<Vec<String>>>,
    responder: ScriptedResponder,
    delay: Option<Duration>,
    interrupt: InterruptHandle,
    shutdowns: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::with_responder(|_| Ok(String::new()))
    }

    pub fn with_responder(
        responder: impl Fn(&str) -> Result<String, EngineError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(responder),
            delay: None,
            interrupt: InterruptHandle::new(),
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn command_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.log)
    }

    fn wait(&self) -> Result<(), EngineError> {
        let Some(delay) = self.delay else {
            return Ok(());
        };
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if self.interrupt.is_interrupted() {
                return Err(EngineError::Interrupted);
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBackend for ScriptedBackend {
    fn eval(&mut self, command: &str) -> Result<String, EngineError> {
        self.log.lock().push(command.to_string());
        self.wait()?;
        if self.interrupt.is_interrupted() {
            return Err(EngineError::Interrupted);
        }
        (self.responder)(command)
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    fn shutdown(&mut self) -> Result<(), EngineError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory for [`ScriptedBackend`]s that keeps counters for assertions.
pub struct ScriptedEngineFactory {
    responder: ScriptedResponder,
    delay: Option<Duration>,
    connections: AtomicUsize,
    shutdowns: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<(WorkerId, String)>>>,
    fail_connect: bool,
}

impl ScriptedEngineFactory {
    pub fn new() -> Self {
        Self {
            responder: Arc::new(|_| Ok(String::new())),
            delay: None,
            connections: AtomicUsize::new(0),
            shutdowns: Arc::new(AtomicUsize::new(0)),
            commands: Arc::new(Mutex::new(Vec::new())),
            fail_connect: false,
        }
    }

    pub fn with_responder(
        mut self,
        responder: impl Fn(&str) -> Result<String, EngineError> + Send + Sync + 'static,
    ) -> Self {
        self.responder = Arc::new(responder);
        self
    }

    /// Every evaluation blocks for `delay` (interruptible).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every connection attempt fails, as when no engine can be started.
    pub fn failing(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<(WorkerId, String)> {
        self.commands.lock().clone()
    }
}

impl Default for ScriptedEngineFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineFactory for ScriptedEngineFactory {
    fn connect(&self, worker: WorkerId) -> Result<Box<dyn EngineBackend>, EngineError> {
        if self.fail_connect {
            return Err(EngineError::Spawn {
                command: "scripted".into(),
                reason: "connections disabled".into(),
            });
        }
        self.connections.fetch_add(1, Ordering::SeqCst);
        let responder = Arc::clone(&self.responder);
        let commands = Arc::clone(&self.commands);
        let mut backend = ScriptedBackend::with_responder(move |command| {
            commands.lock().push((worker, command.to_string()));
            responder(command)
        });
        backend.delay = self.delay;
        backend.shutdowns = Arc::clone(&self.shutdowns);
        Ok(Box::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delayed_eval_stops_on_interrupt() {
        let factory = ScriptedEngineFactory::new().with_delay(Duration::from_secs(5));
        let mut backend = factory.connect(WorkerId(3)).unwrap();
        let handle = backend.interrupt_handle();
        let interrupter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            handle.interrupt();
        });
        let started = Instant::now();
        assert_eq!(backend.eval("Sys.sleep(5)"), Err(EngineError::Interrupted));
        assert!(started.elapsed() < Duration::from_secs(2));
        interrupter.join().unwrap();
    }

    #[test]
    fn factory_records_commands_per_worker() {
        let factory = ScriptedEngineFactory::new();
        let mut first = factory.connect(WorkerId(0)).unwrap();
        let mut second = factory.connect(WorkerId(1)).unwrap();
        first.eval("x <- 1").unwrap();
        second.eval("y <- 2").unwrap();
        assert_eq!(
            factory.commands(),
            vec![
                (WorkerId(0), "x <- 1".to_string()),
                (WorkerId(1), "y <- 2".to_string())
            ]
        );
        assert_eq!(factory.connections(), 2);
    }
}

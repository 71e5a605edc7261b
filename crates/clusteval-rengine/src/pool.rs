use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::{EngineError, EngineFactory, EngineSession, InterruptHandle, SessionId, WorkerId};

/// Handle to the session bound to one worker.
///
/// The mutex is only ever taken by the owning worker; other threads interact
/// with the session exclusively through its [`InterruptHandle`].
#[derive(Clone)]
pub struct SharedSession {
    id: SessionId,
    worker: WorkerId,
    interrupt: InterruptHandle,
    inner: Arc<Mutex<EngineSession>>,
}

impl SharedSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn lock(&self) -> MutexGuard<'_, EngineSession> {
        self.inner.lock()
    }
}

impl std::fmt::Debug for SharedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSession")
            .field("id", &self.id)
            .field("worker", &self.worker)
            .finish()
    }
}

/// Per-worker engine sessions with lazy creation.
pub struct SessionPool {
    factory: Arc<dyn EngineFactory>,
    sessions: Mutex<HashMap<WorkerId, SharedSession>>,
    next_id: AtomicU64,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Returns the worker's session, creating it on first use.
    ///
    /// An interrupted session is discarded and replaced, since its engine
    /// process has been destroyed.
    pub fn session_for(&self, worker: WorkerId) -> Result<SharedSession, EngineError> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&worker) {
            if !existing.interrupt.is_interrupted() {
                return Ok(existing.clone());
            }
            debug!(%worker, session = %existing.id, "replacing interrupted engine session");
            sessions.remove(&worker);
        }
        let backend = self.factory.connect(worker)?;
        let id = SessionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let session = EngineSession::new(id, worker, backend);
        let shared = SharedSession {
            id,
            worker,
            interrupt: session.interrupt_handle(),
            inner: Arc::new(Mutex::new(session)),
        };
        sessions.insert(worker, shared.clone());
        info!(%worker, session = %id, "engine session created");
        Ok(shared)
    }

    /// Wipes session state between runnables. Failures are logged only.
    pub fn clear(&self, session: &SharedSession) {
        let mut guard = session.lock();
        if guard.is_interrupted() {
            return;
        }
        if let Err(err) = guard.clear() {
            warn!(session = %session.id, ?err, "failed to clear engine session");
        }
    }

    /// Kills whatever the worker's session is running. Returns false if the
    /// worker has no session.
    pub fn interrupt(&self, worker: WorkerId) -> bool {
        let sessions = self.sessions.lock();
        match sessions.get(&worker) {
            Some(session) => {
                session.interrupt.interrupt();
                true
            }
            None => false,
        }
    }

    /// Terminates the worker's session; called once when the worker exits.
    pub fn destroy(&self, worker: WorkerId) {
        let removed = self.sessions.lock().remove(&worker);
        if let Some(session) = removed {
            let mut guard = session.lock();
            if let Err(err) = guard.shutdown() {
                warn!(session = %session.id, ?err, "engine session did not shut down cleanly");
            } else {
                debug!(%worker, session = %session.id, "engine session destroyed");
            }
        }
    }

    /// Interrupts every session without waiting for their workers.
    pub fn interrupt_all(&self) {
        for session in self.sessions.lock().values() {
            session.interrupt.interrupt();
        }
    }

    pub fn active_sessions(&self) -> Vec<(WorkerId, SessionId)> {
        let mut active: Vec<_> = self
            .sessions
            .lock()
            .values()
            .map(|session| (session.worker, session.id))
            .collect();
        active.sort();
        active
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ScriptedEngineFactory;

    fn pool() -> (Arc<ScriptedEngineFactory>, SessionPool) {
        let factory = Arc::new(ScriptedEngineFactory::new());
        let pool = SessionPool::new(factory.clone());
        (factory, pool)
    }

    #[test]
    fn sessions_are_bound_to_their_worker() {
        let (factory, pool) = pool();
        let first = pool.session_for(WorkerId(1)).unwrap();
        let second = pool.session_for(WorkerId(2)).unwrap();
        let again = pool.session_for(WorkerId(1)).unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(first.id(), again.id());
        assert_eq!(second.worker(), WorkerId(2));
        assert_eq!(factory.connections(), 2);
    }

    #[test]
    fn clear_keeps_session_alive() {
        let (factory, pool) = pool();
        let session = pool.session_for(WorkerId(0)).unwrap();
        pool.clear(&session);
        assert_eq!(pool.session_for(WorkerId(0)).unwrap().id(), session.id());
        assert!(factory
            .commands()
            .iter()
            .any(|(_, command)| command.starts_with("rm(list")));
        assert_eq!(factory.shutdowns(), 0);
    }

    #[test]
    fn clear_failure_is_not_fatal() {
        let factory = Arc::new(ScriptedEngineFactory::new().with_responder(|command| {
            if command.starts_with("rm(") {
                Err(EngineError::Evaluation("locked binding".into()))
            } else {
                Ok(String::new())
            }
        }));
        let pool = SessionPool::new(factory);
        let session = pool.session_for(WorkerId(0)).unwrap();
        pool.clear(&session);
        assert!(session.lock().eval("1").is_ok());
    }

    #[test]
    fn interrupted_session_is_replaced() {
        let (factory, pool) = pool();
        let session = pool.session_for(WorkerId(0)).unwrap();
        assert!(pool.interrupt(WorkerId(0)));
        let replacement = pool.session_for(WorkerId(0)).unwrap();
        assert_ne!(session.id(), replacement.id());
        assert_eq!(factory.connections(), 2);
    }

    #[test]
    fn destroy_shuts_down_once() {
        let (factory, pool) = pool();
        pool.session_for(WorkerId(4)).unwrap();
        pool.destroy(WorkerId(4));
        pool.destroy(WorkerId(4));
        assert_eq!(factory.shutdowns(), 1);
        assert!(pool.active_sessions().is_empty());
    }

    #[test]
    fn connect_failure_surfaces_to_caller() {
        let pool = SessionPool::new(Arc::new(ScriptedEngineFactory::new().failing()));
        assert!(matches!(
            pool.session_for(WorkerId(0)),
            Err(EngineError::Spawn { .. })
        ));
    }
}

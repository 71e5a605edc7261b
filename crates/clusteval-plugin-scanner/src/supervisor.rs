use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::{DiscoveryHandle, DiscoveryLoop};

pub const DEFAULT_LOOP_SLEEP: Duration = Duration::from_millis(30_000);
pub const DEFAULT_SUPERVISOR_SLEEP: Duration = Duration::from_millis(5_000);
/// Key under which the supervisor's own interval is configured.
pub const SUPERVISOR_NAME: &str = "SupervisorThread";

/// Per-loop sleep intervals, keyed by loop name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SleepTimes {
    times: HashMap<String, Duration>,
}

impl SleepTimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, interval: Duration) -> &mut Self {
        self.times.insert(name.into(), interval);
        self
    }

    pub fn get(&self, name: &str) -> Duration {
        self.times.get(name).copied().unwrap_or(DEFAULT_LOOP_SLEEP)
    }

    pub fn supervisor(&self) -> Duration {
        self.times
            .get(SUPERVISOR_NAME)
            .copied()
            .unwrap_or(DEFAULT_SUPERVISOR_SLEEP)
    }
}

struct Supervised {
    discovery: DiscoveryLoop,
    interval: Duration,
    handle: Option<DiscoveryHandle>,
    restarts: usize,
}

/// Keeps one thread per discovery loop alive, restarting any that exits.
pub struct Supervisor {
    loops: Arc<Mutex<Vec<Supervised>>>,
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Supervisor {
    pub fn start(loops: Vec<DiscoveryLoop>, sleep_times: &SleepTimes) -> Self {
        let supervised = loops
            .into_iter()
            .map(|discovery| {
                let interval = sleep_times.get(&discovery.name());
                let handle = discovery.spawn(interval);
                Supervised {
                    discovery,
                    interval,
                    handle: Some(handle),
                    restarts: 0,
                }
            })
            .collect();
        let loops = Arc::new(Mutex::new(supervised));
        let check_every = sleep_times.supervisor();
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let watched = Arc::clone(&loops);
        let thread = thread::Builder::new()
            .name(SUPERVISOR_NAME.into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(check_every) {
                    Err(RecvTimeoutError::Timeout) => restart_dead(&watched),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            });
        let thread = match thread {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(%err, "failed to start supervisor thread");
                None
            }
        };
        info!(loops = loops.lock().len(), "discovery supervisor started");
        Self {
            loops,
            stop: Some(stop_tx),
            thread,
        }
    }

    /// Restart count per loop name.
    pub fn restarts(&self) -> Vec<(String, usize)> {
        self.loops
            .lock()
            .iter()
            .map(|entry| (entry.discovery.name(), entry.restarts))
            .collect()
    }

    pub fn loop_names(&self) -> Vec<String> {
        self.loops
            .lock()
            .iter()
            .map(|entry| entry.discovery.name())
            .collect()
    }

    /// Stops the supervisor and every loop, waiting for their threads.
    pub fn shutdown(mut self) {
        self.stop_threads();
    }

    fn stop_threads(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.try_send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let handles: Vec<DiscoveryHandle> = self
            .loops
            .lock()
            .iter_mut()
            .filter_map(|entry| entry.handle.take())
            .collect();
        for handle in handles {
            handle.join();
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

fn restart_dead(loops: &Mutex<Vec<Supervised>>) {
    for entry in loops.lock().iter_mut() {
        let dead = entry.handle.as_ref().map_or(true, DiscoveryHandle::is_finished);
        if dead {
            warn!(name = %entry.discovery.name(), "restarting discovery loop");
            if let Some(old) = entry.handle.take() {
                old.join();
            }
            entry.handle = Some(entry.discovery.spawn(entry.interval));
            entry.restarts += 1;
        }
    }
}

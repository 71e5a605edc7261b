use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clusteval_plugin_sdk::CapabilityKind;
use clusteval_registry::BindingSummary;
use clusteval_run::{ResultStoreError, RunProgress};
use clusteval_scheduler::{ActiveRunnable, OptimizationStatus, Scheduler};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::logging::{LogControl, LogLevelError};

/// Failures that are reported to the caller as errors rather than as a
/// `false` result.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown client id `{0}`")]
    UnknownClient(String),

    #[error("client `{client}` may not {action}")]
    Unauthorized { client: String, action: String },

    #[error(transparent)]
    LogLevel(#[from] LogLevelError),

    #[error(transparent)]
    Results(#[from] ResultStoreError),
}

/// Operations offered to remote clients.
///
/// Every client first asks for a client id; runs are owned by the id that
/// submitted them. Submitting, resuming and terminating answer `false` for
/// domain failures such as an unknown or invalid run.
pub struct ControlFacade {
    scheduler: Arc<Scheduler>,
    log: Option<LogControl>,
    admin: Option<String>,
    clients: Mutex<HashSet<String>>,
    stopped: AtomicBool,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

impl ControlFacade {
    pub fn new(scheduler: Arc<Scheduler>, log: Option<LogControl>, admin: Option<String>) -> Self {
        let (stop_tx, stop_rx) = bounded(1);
        Self {
            scheduler,
            log,
            admin,
            clients: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
            stop_tx,
            stop_rx,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn get_client_id(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.clients.lock().insert(id.clone());
        info!(client = %id, "client id issued");
        id
    }

    pub fn get_runs(&self) -> Vec<String> {
        self.scheduler.run_catalog().names()
    }

    /// Identifiers of persisted results that can be resumed.
    pub fn get_run_resumes(&self) -> Result<Vec<String>, ControlError> {
        Ok(self
            .scheduler
            .result_store()
            .list()?
            .into_iter()
            .map(|summary| summary.id.to_string())
            .collect())
    }

    pub fn get_queue(&self) -> Vec<String> {
        self.scheduler.queue()
    }

    pub fn get_capabilities(&self, kind: Option<CapabilityKind>) -> Vec<BindingSummary> {
        let registry = self.scheduler.registry();
        match kind {
            Some(kind) => registry
                .list_by_kind(kind)
                .iter()
                .map(|binding| BindingSummary::from(binding.as_ref()))
                .collect(),
            None => registry.snapshot(),
        }
    }

    pub fn get_active_runnables(&self) -> Vec<ActiveRunnable> {
        self.scheduler.active_runnables()
    }

    pub fn perform_run(&self, client: &str, run: &str) -> Result<bool, ControlError> {
        self.ensure_known(client)?;
        match self.scheduler.submit(client, run) {
            Ok(_) => Ok(true),
            Err(err) => {
                warn!(client, run, %err, "run not submitted");
                Ok(false)
            }
        }
    }

    pub fn resume_run(&self, client: &str, result: &str) -> Result<bool, ControlError> {
        self.ensure_known(client)?;
        match self.scheduler.resume(client, result) {
            Ok(_) => Ok(true),
            Err(err) => {
                warn!(client, result, %err, "run not resumed");
                Ok(false)
            }
        }
    }

    /// Terminates the latest job of `run`. Only the client that submitted
    /// it (or the admin) may do so.
    pub fn terminate_run(&self, client: &str, run: &str) -> Result<bool, ControlError> {
        self.ensure_known(client)?;
        let Some(job) = self.scheduler.latest_job(run) else {
            return Ok(false);
        };
        if job.client != client && !self.is_admin(client) {
            return Err(ControlError::Unauthorized {
                client: client.to_string(),
                action: format!("terminate run `{run}`"),
            });
        }
        Ok(self.scheduler.terminate(job.id))
    }

    /// Latest status of every run `client` submitted, keyed by run name.
    pub fn get_run_status_for_client_id(
        &self,
        client: &str,
    ) -> Result<BTreeMap<String, RunProgress>, ControlError> {
        self.ensure_known(client)?;
        Ok(self
            .scheduler
            .jobs_for_client(client)
            .into_iter()
            .map(|job| (job.run, job.progress))
            .collect())
    }

    /// Per-pair progress and best parameters of every optimization run
    /// `client` submitted, keyed by run name. Does not count as the run's
    /// final report.
    pub fn get_optimization_run_status_for_client_id(
        &self,
        client: &str,
    ) -> Result<BTreeMap<String, OptimizationStatus>, ControlError> {
        self.ensure_known(client)?;
        Ok(self
            .scheduler
            .optimization_status_for_client(client)
            .into_iter()
            .map(|status| (status.run.clone(), status))
            .collect())
    }

    /// Resizes the worker pool and returns the new size.
    pub fn set_thread_number(&self, threads: usize) -> usize {
        self.scheduler.set_worker_count(threads);
        self.scheduler.worker_count()
    }

    pub fn set_log_level(&self, level: &str) -> Result<(), ControlError> {
        match &self.log {
            Some(log) => Ok(log.set_level(level)?),
            None => Err(LogLevelError::Unavailable("no log control installed".into()).into()),
        }
    }

    /// Stops the scheduler, waiting up to `timeout` for running runnables.
    ///
    /// The admin may always shut down; any other client only while no other
    /// client has unfinished runs. Returns how many runnables had to be
    /// forcibly terminated.
    pub fn shutdown(&self, client: &str, timeout: Duration) -> Result<usize, ControlError> {
        self.ensure_known(client)?;
        if !self.is_admin(client) {
            let foreign = self
                .scheduler
                .jobs()
                .into_iter()
                .find(|job| job.client != client && !job.progress.status.is_terminal());
            if let Some(job) = foreign {
                return Err(ControlError::Unauthorized {
                    client: client.to_string(),
                    action: format!(
                        "shut down while run `{}` of another client is active",
                        job.run
                    ),
                });
            }
        }
        info!(client, ?timeout, "shutdown requested");
        let forced = self.scheduler.shutdown(timeout);
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.stop_tx.try_send(());
        }
        Ok(forced)
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Blocks until [`shutdown`](Self::shutdown) has completed.
    pub fn wait_for_shutdown(&self) {
        if !self.is_shut_down() {
            let _ = self.stop_rx.recv();
        }
    }

    fn is_admin(&self, client: &str) -> bool {
        self.admin.as_deref() == Some(client)
    }

    fn ensure_known(&self, client: &str) -> Result<(), ControlError> {
        if self.is_admin(client) || self.clients.lock().contains(client) {
            Ok(())
        } else {
            Err(ControlError::UnknownClient(client.to_string()))
        }
    }
}

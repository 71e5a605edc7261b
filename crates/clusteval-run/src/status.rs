use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Lifecycle state of a runnable, and in aggregate of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum RunStatus {
    Inactive = 0,
    Scheduled = 1,
    Running = 2,
    Finished = 3,
    Terminated = 4,
}

impl RunStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunStatus::Inactive,
            1 => RunStatus::Scheduled,
            2 => RunStatus::Running,
            3 => RunStatus::Finished,
            _ => RunStatus::Terminated,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Finished | RunStatus::Terminated)
    }

    /// Transitions never go backwards.
    pub fn can_advance_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Inactive, Scheduled)
                | (Inactive, Terminated)
                | (Scheduled, Running)
                | (Scheduled, Terminated)
                | (Running, Finished)
                | (Running, Terminated)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Inactive => "INACTIVE",
            RunStatus::Scheduled => "SCHEDULED",
            RunStatus::Running => "RUNNING",
            RunStatus::Finished => "FINISHED",
            RunStatus::Terminated => "TERMINATED",
        })
    }
}

/// Lock-free status shared between the owning worker and status readers.
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(status: RunStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    pub fn get(&self) -> RunStatus {
        RunStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves from `from` to `to` if the cell still holds `from` and the
    /// transition is allowed. Returns the status observed on failure.
    pub fn transition(&self, from: RunStatus, to: RunStatus) -> Result<(), RunStatus> {
        if !from.can_advance_to(to) {
            return Err(self.get());
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(RunStatus::from_u8)
    }

    /// Marks the runnable TERMINATED unless it already reached a terminal
    /// state. Returns whether the status changed.
    pub fn force_terminate(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            if RunStatus::from_u8(current).is_terminal() {
                return false;
            }
            match self.0.compare_exchange(
                current,
                RunStatus::Terminated as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Aggregate status of a run; never collapsed into a single boolean.
///
/// `percent_complete` counts FINISHED runnables only, so a terminated run
/// reports how much of it actually produced results.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunProgress {
    pub status: RunStatus,
    pub percent_complete: f32,
}

impl RunProgress {
    pub fn from_statuses(statuses: &[RunStatus]) -> Self {
        Self::with_pending(statuses, 0)
    }

    /// Like [`RunProgress::from_statuses`], counting `pending` runnables
    /// that do not exist yet as INACTIVE.
    pub fn with_pending(statuses: &[RunStatus], pending: usize) -> Self {
        let total = statuses.len() + pending;
        if total == 0 {
            return Self {
                status: RunStatus::Finished,
                percent_complete: 100.0,
            };
        }
        let terminal = statuses.iter().filter(|s| s.is_terminal()).count();
        let finished = statuses.iter().filter(|s| **s == RunStatus::Finished).count();
        let status = if terminal == total {
            if statuses.contains(&RunStatus::Terminated) {
                RunStatus::Terminated
            } else {
                RunStatus::Finished
            }
        } else if terminal > 0 || statuses.contains(&RunStatus::Running) {
            RunStatus::Running
        } else if statuses.contains(&RunStatus::Scheduled) {
            RunStatus::Scheduled
        } else {
            RunStatus::Inactive
        };
        Self {
            status,
            percent_complete: finished as f32 * 100.0 / total as f32,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        let cell = StatusCell::new(RunStatus::Inactive);
        assert_eq!(cell.transition(RunStatus::Inactive, RunStatus::Scheduled), Ok(()));
        assert_eq!(cell.transition(RunStatus::Scheduled, RunStatus::Running), Ok(()));
        assert_eq!(
            cell.transition(RunStatus::Running, RunStatus::Scheduled),
            Err(RunStatus::Running)
        );
        assert_eq!(cell.transition(RunStatus::Running, RunStatus::Finished), Ok(()));
        assert!(!cell.force_terminate());
        assert_eq!(cell.get(), RunStatus::Finished);
    }

    #[test]
    fn stale_transition_reports_current_status() {
        let cell = StatusCell::new(RunStatus::Scheduled);
        assert!(cell.force_terminate());
        assert_eq!(
            cell.transition(RunStatus::Scheduled, RunStatus::Running),
            Err(RunStatus::Terminated)
        );
    }

    #[test]
    fn only_one_racer_wins_a_transition() {
        let cell = Arc::new(StatusCell::new(RunStatus::Scheduled));
        let winners: usize = (0..8)
            .map(|_| {
                let cell = Arc::clone(&cell);
                thread::spawn(move || {
                    cell.transition(RunStatus::Scheduled, RunStatus::Running).is_ok() as usize
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn progress_reports_partial_completion() {
        use RunStatus::*;
        let progress = RunProgress::from_statuses(&[Finished, Inactive, Inactive, Terminated]);
        assert_eq!(progress.status, Running);
        assert_eq!(progress.percent_complete, 25.0);
        assert_eq!(RunProgress::from_statuses(&[Scheduled, Inactive]).status, Scheduled);
        assert_eq!(RunProgress::from_statuses(&[Finished, Terminated]).status, Terminated);
        assert_eq!(RunProgress::from_statuses(&[Finished]).percent_complete, 100.0);
    }

    #[test]
    fn pending_runnables_keep_a_run_open() {
        use RunStatus::*;
        let progress = RunProgress::with_pending(&[Finished, Finished], 2);
        assert_eq!(progress.status, Running);
        assert_eq!(progress.percent_complete, 50.0);
    }
}

//! Queue error taxonomy.
//!
//! Entry handlers report failures as [`QueueError`]; the manager classifies
//! each one through [`QueueError::outcome`]:
//!
//! | error | entry status | run |
//! |---|---|---|
//! | `Skip` | Skipped | continues with the next sibling |
//! | `Aborted` | Failed | stops, cleanup runs on the way up |
//! | `Execution` | Failed | stops |
//! | `Fatal` | Failed | stops, logged as an error |

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure reported by an entry handler.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Abandon this entry; siblings still run.
    #[error("entry skipped: {0}")]
    Skip(String),

    /// Stop the whole run.
    #[error("queue aborted: {0}")]
    Aborted(String),

    /// Entry failed.
    #[error("{0}")]
    Execution(String),

    /// Unclassified error from a collaborator or a handler bug.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl QueueError {
    /// Skip the entry for `reason`.
    pub fn skip(reason: impl fmt::Display) -> Self {
        QueueError::Skip(reason.to_string())
    }

    /// Abort the run for `reason`.
    pub fn aborted(reason: impl fmt::Display) -> Self {
        QueueError::Aborted(reason.to_string())
    }

    /// Fail the entry for `reason`.
    pub fn execution(reason: impl fmt::Display) -> Self {
        QueueError::Execution(reason.to_string())
    }

    /// How the scheduler treats this error.
    pub fn outcome(&self) -> EntryOutcome {
        match self {
            QueueError::Skip(_) => EntryOutcome::Skipped,
            QueueError::Aborted(_) => EntryOutcome::Aborted,
            QueueError::Execution(_) | QueueError::Fatal(_) => EntryOutcome::Failed,
        }
    }
}

/// How one entry's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryOutcome {
    /// Ran to completion.
    Success,
    /// Abandoned; the run went on.
    Skipped,
    /// Aborted the run.
    Aborted,
    /// Failed, which also ends the run.
    Failed,
}

impl EntryOutcome {
    /// Status text published with `queue_entry_execute_finished`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryOutcome::Success => "Successful",
            EntryOutcome::Skipped => "Skipped",
            EntryOutcome::Aborted => "Aborted",
            EntryOutcome::Failed => "Failed",
        }
    }
}

impl fmt::Display for EntryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from [`QueueManager`](crate::QueueManager) operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManagerError {
    /// A run is already in progress.
    #[error("queue is already running")]
    AlreadyRunning,

    /// Execution was disabled with `disable(true)`.
    #[error("queue execution is disabled")]
    Disabled,

    /// The tree cannot be edited during a run.
    #[error("queue is running; entries can only be changed while it is idle")]
    Busy,

    /// No entry carries this id.
    #[error("no queue entry with id {0}")]
    NotFound(String),
}

//! Queue notifications.

use mxq_core::events::Signal;

use crate::error::EntryOutcome;

/// Status change published by the queue manager.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// A run started.
    ExecuteStarted,
    /// An entry was reached by the traversal.
    EntryStarted {
        /// Entry id.
        id: String,
        /// Display name.
        name: String,
    },
    /// An entry finished with the given outcome.
    EntryFinished {
        /// Entry id.
        id: String,
        /// Display name.
        name: String,
        /// How it ended.
        outcome: EntryOutcome,
    },
    /// The pause gate was closed (`true`) or opened.
    Paused(bool),
    /// The run was stopped by `stop()`, an abort or a failure.
    Stopped,
    /// The run task has ended, whatever the outcome.
    ExecutionFinished,
}

impl Signal for QueueEvent {
    fn signal_name(&self) -> &'static str {
        match self {
            QueueEvent::ExecuteStarted => "queue_execute_started",
            QueueEvent::EntryStarted { .. } => "queue_entry_execute_started",
            QueueEvent::EntryFinished { .. } => "queue_entry_execute_finished",
            QueueEvent::Paused(_) => "queue_paused",
            QueueEvent::Stopped => "queue_stopped",
            QueueEvent::ExecutionFinished => "queue_execution_finished",
        }
    }
}

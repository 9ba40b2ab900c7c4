//! Experiment queue for mxq.
//!
//! An experiment plan is a tree of [`QueueEntry`] nodes (samples, task
//! groups, centrings, data collections, workflows, delays). The
//! [`QueueManager`] runs it depth first, one entry at a time, and
//! classifies handler errors into skip, abort and failure outcomes.
//!
//! ```rust,ignore
//! let manager = QueueManager::new(beamline, &settings);
//! let group = QueueEntry::task_group("Group 1");
//! group.enqueue(QueueEntry::centring(CentringMethod::Automatic));
//! group.enqueue(QueueEntry::data_collection(params));
//! manager.enqueue(group)?;
//!
//! manager.execute(None)?;
//! manager.wait_until_idle().await;
//! ```

pub mod context;
pub mod entry;
pub mod error;
pub mod events;
pub mod handlers;
pub mod manager;

pub use context::{Beamline, ExecutionContext, QueueControl, RunState};
pub use entry::{
    CentringParameters, EntryKind, EntryKindTag, EntryRef, EntryStatus, QueueEntry,
    SampleParameters, WorkflowParameters,
};
pub use error::{EntryOutcome, ManagerError, QueueError};
pub use events::QueueEvent;
pub use handlers::{EntryHandler, HandlerRegistry};
pub use manager::{QueueManager, QueueState};

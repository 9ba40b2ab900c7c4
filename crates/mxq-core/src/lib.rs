//! `mxq-core`
//!
//! Shared building blocks for the beamline experiment queue and the
//! diffractometer centring state machine.
//!
//! ## Modules
//!
//! - [`capabilities`]: collaborator traits (`Motor`, `PhaseControl`,
//!   `LoopFinder`, `LimsClient`, `DataCollector`, `SampleChanger`,
//!   `WorkflowRunner`)
//! - [`types`]: motor roles, phases, screen points
//! - [`error`]: driver, timeout and task errors
//! - [`events`]: broadcast [`EventBus`](events::EventBus) for notifications
//! - [`task`]: spawned background tasks with kill/join/link
//! - [`config`]: Figment-layered [`Settings`](config::Settings)
//! - [`logging`]: tracing subscriber set-up

pub mod capabilities;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod task;
pub mod types;

pub use capabilities::{
    CollectionParameters, DataCollectionGroup, DataCollectionRecord, DataCollector, ImageRecord,
    LimsClient, LoopDetection, LoopFinder, Motor, MotorSnapshot, PhaseControl, SampleChanger,
    WorkflowOutcome, WorkflowRunner,
};
pub use config::Settings;
pub use error::{DriverError, DriverErrorKind, TaskError, TimeoutError};
pub use events::{EventBus, Signal};
pub use task::{TaskHandle, TaskKiller};
pub use types::{new_uid, MotorPositions, MotorRole, Phase, ScreenPoint};

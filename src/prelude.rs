//! Commonly used types from every mxq crate.
//!
//! ```rust,ignore
//! use mxq::prelude::*;
//! ```

// =============================================================================
// Core
// =============================================================================

pub use mxq_core::capabilities::{
    CollectionParameters, DataCollector, LimsClient, LoopDetection, LoopFinder, Motor,
    PhaseControl, SampleChanger, WorkflowOutcome, WorkflowRunner,
};
pub use mxq_core::config::Settings;
pub use mxq_core::events::{EventBus, Signal};
pub use mxq_core::types::{MotorPositions, MotorRole, Phase, ScreenPoint};

// =============================================================================
// Diffractometer
// =============================================================================

pub use mxq_diffractometer::{
    CentringMethod, CentringStatus, Diffractometer, DiffractometerBuilder, DiffractometerError,
    DiffractometerEvent, DiffractometerState,
};

// =============================================================================
// Queue
// =============================================================================

pub use mxq_queue::{
    Beamline, EntryHandler, EntryStatus, QueueEntry, QueueError, QueueEvent, QueueManager,
    QueueState,
};

// =============================================================================
// Simulated hardware
// =============================================================================

#[cfg(feature = "mock")]
pub use mxq_driver_mock::{standard_motors, MockMode};

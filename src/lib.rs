//! # mxq
//!
//! Experiment queue and diffractometer centring engine for
//! macromolecular-crystallography beamlines.
//!
//! This crate is the integration layer over the workspace crates:
//!
//! - **`core`**: Re-exported from `mxq-core`. Collaborator traits, motor
//!   roles and phases, event buses, background tasks, configuration and
//!   logging.
//! - **`diffractometer`**: Re-exported from `mxq-diffractometer`. Centring
//!   geometry, the centring procedures and the diffractometer state machine.
//! - **`queue`**: Re-exported from `mxq-queue`. Entry tree, handlers and the
//!   queue manager.
//! - **`mock`**: Re-exported from `mxq-driver-mock` (requires the `mock`
//!   feature). Simulated beamline devices.
//!
//! ## Recommended Usage
//!
//! ```rust,ignore
//! use mxq::prelude::*;
//!
//! let settings = Settings::load(None)?;
//! let manager = QueueManager::new(beamline, &settings);
//! manager.enqueue(QueueEntry::centring(CentringMethod::Automatic))?;
//! manager.execute(None)?;
//! ```

pub mod prelude;

pub use mxq_core as core;
pub use mxq_diffractometer as diffractometer;
#[cfg(feature = "mock")]
pub use mxq_driver_mock as mock;
pub use mxq_queue as queue;

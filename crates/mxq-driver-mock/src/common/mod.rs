//! Shared plumbing of the simulated devices: timing modes and fault
//! injection.

pub mod errors;
pub mod mode;

pub use errors::{ErrorConfig, ErrorScenario};
pub use mode::MockMode;

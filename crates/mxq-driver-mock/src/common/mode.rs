//! Operational modes for simulated devices.
//!
//! - **Instant**: Zero delays, deterministic behavior for unit tests
//! - **Realistic**: Hardware-like timing for integration tests and demos
//! - **Chaos**: Realistic timing plus random failures for resilience testing

use serde::{Deserialize, Serialize};

/// Operational modes for simulated devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MockMode {
    /// Zero delays, deterministic - for unit tests
    #[default]
    Instant,
    /// Hardware-like timing - for integration tests
    Realistic,
    /// Hardware-like timing with random failures
    Chaos,
}

impl MockMode {
    /// True when operations should take simulated time.
    pub fn is_timed(&self) -> bool {
        !matches!(self, MockMode::Instant)
    }
}

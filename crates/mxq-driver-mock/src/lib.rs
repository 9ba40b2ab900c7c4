//! Simulated beamline hardware for mxq.
//!
//! Every collaborator trait of `mxq-core` has a simulated implementation
//! here, so the queue engine and the centring state machine can run without
//! a beamline. All devices use async-safe timing (`tokio::time`) and share
//! the [`ErrorConfig`] error-injection framework.
//!
//! # Available Devices
//!
//! - [`MockMotor`] - positioner with linear motion in the timed modes
//! - [`MockPhaseControl`] - phase switching with delayed confirmation
//! - [`MockLoopFinder`] / [`SimulatedSampleLoop`] - loop detection
//! - [`MockLims`] - in-memory LIMS
//! - [`MockCollector`] - detector acquisition
//! - [`MockSampleChanger`] - sample mounting
//! - [`MockWorkflowRunner`] - workflow engine

pub mod common;
mod mock_collector;
mod mock_lims;
mod mock_loop_finder;
mod mock_motor;
mod mock_phase;
mod mock_sample_changer;
mod mock_workflow;

pub use common::{ErrorConfig, ErrorScenario, MockMode};

pub use mock_collector::MockCollector;
pub use mock_lims::MockLims;
pub use mock_loop_finder::{MockLoopFinder, SampleGeometry, SimulatedSampleLoop};
pub use mock_motor::{LimitBehavior, MockMotor, MockMotorBuilder, MotorLimits};
pub use mock_phase::{MockPhaseControl, MockPhaseControlBuilder};
pub use mock_sample_changer::MockSampleChanger;
pub use mock_workflow::MockWorkflowRunner;

use mxq_core::types::MotorRole;
use std::collections::BTreeMap;

/// One simulated motor per diffractometer role.
///
/// Rotation axes move at 90 degrees/s and translations at 1 mm/s in the
/// timed modes; zoom starts at level 1.
pub fn standard_motors(mode: MockMode) -> BTreeMap<MotorRole, MockMotor> {
    MotorRole::ALL
        .iter()
        .map(|&role| {
            let velocity = match role {
                MotorRole::Phi | MotorRole::Kappa | MotorRole::KappaPhi => 90.0,
                MotorRole::Zoom => 5.0,
                _ => 1.0,
            };
            let initial = if role == MotorRole::Zoom { 1.0 } else { 0.0 };
            let motor = MockMotor::builder(role.as_str())
                .mode(mode)
                .velocity(velocity)
                .initial_position(initial)
                .build();
            (role, motor)
        })
        .collect()
}

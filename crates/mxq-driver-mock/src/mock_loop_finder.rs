//! Simulated sample-loop detection.
//!
//! Two flavours:
//! - [`MockLoopFinder`] replays a script of detections
//! - [`SimulatedSampleLoop`] renders a sample sitting on simulated motors,
//!   so automatic centring can actually converge against it

use anyhow::Result;
use async_trait::async_trait;
use mxq_core::capabilities::{LoopDetection, LoopFinder};
use mxq_core::types::{MotorRole, ScreenPoint};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::common::ErrorConfig;
use crate::mock_motor::MockMotor;

const DEVICE: &str = "loop_finder";

/// Loop finder returning scripted detections, then a fallback.
#[derive(Debug)]
pub struct MockLoopFinder {
    script: Mutex<VecDeque<LoopDetection>>,
    fallback: LoopDetection,
    calls: AtomicU32,
    error_config: ErrorConfig,
}

impl MockLoopFinder {
    /// Always finds the loop at `point`.
    pub fn always(point: ScreenPoint) -> Self {
        Self::scripted(Vec::new(), LoopDetection::Found(point))
    }

    /// Never finds a loop.
    pub fn never() -> Self {
        Self::scripted(Vec::new(), LoopDetection::NotFound)
    }

    /// Replays `script` in order, then answers `fallback`.
    pub fn scripted(script: Vec<LoopDetection>, fallback: LoopDetection) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
            error_config: ErrorConfig::none(),
        }
    }

    /// Inject faults into `find_loop`.
    pub fn with_error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Number of detection attempts so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoopFinder for MockLoopFinder {
    async fn find_loop(&self) -> Result<LoopDetection> {
        self.error_config.check_operation(DEVICE, "find_loop")?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.lock().pop_front().unwrap_or(self.fallback))
    }
}

// =============================================================================
// Geometric simulation
// =============================================================================

/// Where the simulated sample sits, in millimetres.
///
/// The screen position of the loop tip is
/// `S = T + R(chi)·(0, p·(sin φ, cos φ))` with `T = (phiy, phiz) + table_offset`
/// and `p = (sampx, sampy) + crystal_offset`. It sits on the beam once `T`
/// equals the beam position and `p` is zero. Motor positions are read as
/// millimetres and degrees (unit calibration, positive direction).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleGeometry {
    /// Camera calibration, horizontal and vertical.
    pub pixels_per_mm: [f64; 2],
    /// Beam on the image, pixels.
    pub beam_position: [f64; 2],
    /// Degrees.
    pub chi_angle: f64,
    /// Alignment table offset of the loop, mm.
    pub table_offset: [f64; 2],
    /// Offset of the loop from the rotation axis, mm, in the frame that rotates with phi.
    pub crystal_offset: [f64; 2],
}

impl SampleGeometry {
    /// Motor positions that put the sample on the beam.
    pub fn centred_positions(&self) -> HashMap<MotorRole, f64> {
        HashMap::from([
            (
                MotorRole::PhiY,
                self.beam_position[0] / self.pixels_per_mm[0] - self.table_offset[0],
            ),
            (
                MotorRole::PhiZ,
                self.beam_position[1] / self.pixels_per_mm[1] - self.table_offset[1],
            ),
            (MotorRole::SampX, -self.crystal_offset[0]),
            (MotorRole::SampY, -self.crystal_offset[1]),
        ])
    }

    /// Screen point of the loop for the given motor positions.
    pub fn project(&self, positions: &HashMap<MotorRole, f64>) -> ScreenPoint {
        let get = |role| positions.get(&role).copied().unwrap_or(0.0);
        let phi = get(MotorRole::Phi).to_radians();
        let chi = self.chi_angle.to_radians();

        let px = get(MotorRole::SampX) + self.crystal_offset[0];
        let py = get(MotorRole::SampY) + self.crystal_offset[1];
        let w = px * phi.sin() + py * phi.cos();

        let h = get(MotorRole::PhiY) + self.table_offset[0] - w * chi.sin();
        let v = get(MotorRole::PhiZ) + self.table_offset[1] + w * chi.cos();
        ScreenPoint::new(h * self.pixels_per_mm[0], v * self.pixels_per_mm[1])
    }
}

/// Loop finder that renders a [`SampleGeometry`] against live motors.
pub struct SimulatedSampleLoop {
    geometry: SampleGeometry,
    motors: HashMap<MotorRole, MockMotor>,
    /// Initial attempts that report no loop.
    hidden_attempts: AtomicU32,
    calls: AtomicU32,
}

impl SimulatedSampleLoop {
    /// Loop described by `geometry`, observed through `motors`.
    pub fn new(geometry: SampleGeometry, motors: HashMap<MotorRole, MockMotor>) -> Self {
        Self {
            geometry,
            motors,
            hidden_attempts: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Report `NotFound` for the first `attempts` detections.
    pub fn hidden_for(self, attempts: u32) -> Self {
        self.hidden_attempts.store(attempts, Ordering::SeqCst);
        self
    }

    /// Where the loop really is.
    pub fn geometry(&self) -> &SampleGeometry {
        &self.geometry
    }

    /// Detection attempts so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoopFinder for SimulatedSampleLoop {
    async fn find_loop(&self) -> Result<LoopDetection> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hidden = self
            .hidden_attempts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hidden {
            return Ok(LoopDetection::NotFound);
        }
        let positions = self
            .motors
            .iter()
            .map(|(role, motor)| (*role, motor.current_position()))
            .collect();
        Ok(LoopDetection::Found(self.geometry.project(&positions)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> SampleGeometry {
        SampleGeometry {
            pixels_per_mm: [500.0, 500.0],
            beam_position: [640.0, 512.0],
            chi_angle: 0.0,
            table_offset: [1.3, 1.0],
            crystal_offset: [0.05, -0.03],
        }
    }

    #[tokio::test]
    async fn scripted_finder_replays_then_falls_back() {
        let finder = MockLoopFinder::scripted(
            vec![LoopDetection::NotFound],
            LoopDetection::Found(ScreenPoint::new(1.0, 2.0)),
        );
        assert_eq!(finder.find_loop().await.unwrap(), LoopDetection::NotFound);
        assert_eq!(
            finder.find_loop().await.unwrap(),
            LoopDetection::Found(ScreenPoint::new(1.0, 2.0))
        );
        assert_eq!(finder.calls(), 2);
    }

    #[test]
    fn centred_sample_projects_onto_beam_at_any_angle() {
        let geometry = SampleGeometry {
            chi_angle: 12.0,
            ..geometry()
        };
        let mut positions = geometry.centred_positions();
        for phi in [0.0, 37.0, 90.0, 211.0] {
            positions.insert(MotorRole::Phi, phi);
            let point = geometry.project(&positions);
            assert!((point.x - 640.0).abs() < 1e-9);
            assert!((point.y - 512.0).abs() < 1e-9);
        }
    }

    #[tokio::test]
    async fn simulated_loop_follows_motors() {
        let phi = MockMotor::new("phi");
        let sampy = MockMotor::new("sampy");
        let motors = HashMap::from([
            (MotorRole::Phi, phi.clone()),
            (MotorRole::SampY, sampy.clone()),
        ]);
        let finder = SimulatedSampleLoop::new(geometry(), motors).hidden_for(1);

        assert_eq!(finder.find_loop().await.unwrap(), LoopDetection::NotFound);

        // phi = 0: vertical offset is sampy + crystal_offset[1]
        let LoopDetection::Found(point) = finder.find_loop().await.unwrap() else {
            panic!("loop should be visible");
        };
        assert!((point.y - (1.0 - 0.03) * 500.0).abs() < 1e-9);

        mxq_core::Motor::move_abs(&sampy, 0.03).await.unwrap();
        let LoopDetection::Found(point) = finder.find_loop().await.unwrap() else {
            panic!("loop should be visible");
        };
        assert!((point.y - 500.0).abs() < 1e-9);

        // phi = 90: vertical offset comes from sampx + crystal_offset[0]
        mxq_core::Motor::move_abs(&phi, 90.0).await.unwrap();
        let LoopDetection::Found(point) = finder.find_loop().await.unwrap() else {
            panic!("loop should be visible");
        };
        assert!((point.y - (1.0 + 0.05) * 500.0).abs() < 1e-9);
    }
}

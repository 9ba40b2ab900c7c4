//! Collaborator capability traits
//!
//! The queue engine and the diffractometer state machine never talk to
//! hardware protocols directly. Everything outside the core is reached
//! through the small traits in this module:
//!
//! - [`Motor`]: a positioner (rotation axis, alignment table, zoom)
//! - [`PhaseControl`]: the device that switches diffractometer phases
//! - [`LoopFinder`]: image-based sample-loop detection
//! - [`LimsClient`]: experiment bookkeeping (ISPyB-like)
//! - [`DataCollector`]: runs an oscillation/detector acquisition
//! - [`SampleChanger`]: mounts and unmounts samples
//! - [`WorkflowRunner`]: external workflow engine
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Simulated implementations live in the `mxq-driver-mock` crate.

use crate::types::{Phase, ScreenPoint};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;

// =============================================================================
// Motion
// =============================================================================

/// Snapshot published by a motor whenever its position or motion state changes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotorSnapshot {
    /// Position in device-native units.
    pub position: f64,
    /// True while the motor is in motion.
    pub moving: bool,
}

/// Capability: Motion Control
///
/// # Contract
/// - Positions are in device-native units (microns, mm or degrees)
/// - `move_abs` initiates motion and may return before completion
/// - `wait_ready` blocks until motion completes, bounded by `timeout`
/// - `subscribe` delivers every position/motion-state change
#[async_trait]
pub trait Motor: Send + Sync {
    /// Device name, used in logs and errors.
    fn name(&self) -> &str;

    /// Current position (may be approximate during motion).
    async fn position(&self) -> Result<f64>;

    /// Start a move to an absolute position.
    async fn move_abs(&self, position: f64) -> Result<()>;

    /// Wait until the motor is not moving.
    ///
    /// `None` waits indefinitely; `Some(t)` fails with a timeout error once
    /// `t` has elapsed.
    async fn wait_ready(&self, timeout: Option<Duration>) -> Result<()>;

    /// True while the motor is moving.
    fn is_moving(&self) -> bool;

    /// Current velocity in device units per second.
    async fn velocity(&self) -> Result<f64>;

    /// Change the velocity.
    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Position/motion-state notifications.
    fn subscribe(&self) -> watch::Receiver<MotorSnapshot>;

    /// Halt motion in progress.
    ///
    /// # Default Implementation
    /// Returns an error indicating stop is not supported.
    async fn stop(&self) -> Result<()> {
        anyhow::bail!("Stop not supported by motor '{}'", self.name())
    }

    /// Move and optionally wait.
    ///
    /// With `timeout == None` the call returns once the move has been
    /// started; otherwise it waits for the motor to settle within `timeout`.
    async fn set_value(&self, position: f64, timeout: Option<Duration>) -> Result<()> {
        self.move_abs(position).await?;
        if let Some(timeout) = timeout {
            self.wait_ready(Some(timeout)).await?;
        }
        Ok(())
    }

    /// Move relative to the current position.
    async fn set_value_relative(&self, delta: f64, timeout: Option<Duration>) -> Result<()> {
        let current = self.position().await?;
        self.set_value(current + delta, timeout).await
    }
}

// =============================================================================
// Phase
// =============================================================================

/// Capability: Diffractometer phase switching.
///
/// `request_phase` only issues the transition; the confirmed phase is
/// published through `subscribe` once the device has reached it.
#[async_trait]
pub trait PhaseControl: Send + Sync {
    /// Phases this device supports.
    fn phases(&self) -> Vec<Phase>;

    /// Issue a transition to `phase`.
    async fn request_phase(&self, phase: Phase) -> Result<()>;

    /// Phase confirmed by the device.
    fn subscribe(&self) -> watch::Receiver<Phase>;
}

// =============================================================================
// Vision
// =============================================================================

/// Result of one loop-detection attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoopDetection {
    /// Loop tip found at the given screen position.
    Found(ScreenPoint),
    /// No loop in the current image.
    NotFound,
}

/// Capability: image-based sample-loop detection.
#[async_trait]
pub trait LoopFinder: Send + Sync {
    /// Grab an image from the sample camera and locate the loop in it.
    async fn find_loop(&self) -> Result<LoopDetection>;
}

// =============================================================================
// LIMS
// =============================================================================

/// A group of related data collections (one per task group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataCollectionGroup {
    /// Session the group belongs to.
    pub session_id: Option<i64>,
    /// Experiment type (e.g. "OSC", "Mesh", "SSX").
    pub experiment_type: String,
    /// Sample identifier, if known.
    pub sample_id: Option<i64>,
    /// Start time (RFC 3339).
    pub start_time: String,
}

/// One data collection record, created and then updated as it progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataCollectionRecord {
    /// Record id returned by the LIMS (None before creation).
    pub collection_id: Option<i64>,
    /// Owning group.
    pub group_id: i64,
    /// Status text ("Running", "Data collection successful", ...).
    pub status: String,
    /// Oscillation start, degrees.
    pub osc_start: f64,
    /// Oscillation range per image, degrees.
    pub osc_range: f64,
    /// Number of images.
    pub num_images: u32,
    /// Exposure per image, seconds.
    pub exposure_time: f64,
    /// Centred position used for the collection.
    pub centred_position: Option<crate::types::MotorPositions>,
}

/// One stored image (snapshot or diffraction image) reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ImageRecord {
    /// Collection the image belongs to.
    pub collection_id: i64,
    /// Image number within the collection (1-based).
    pub image_number: u32,
    /// File name.
    pub file_name: String,
}

/// Capability: laboratory information management system client.
#[async_trait]
pub trait LimsClient: Send + Sync {
    /// Store a data-collection group, returning its id.
    async fn store_data_collection_group(&self, group: &DataCollectionGroup) -> Result<i64>;

    /// Create (when `collection_id` is None) or update a data collection,
    /// returning its id.
    async fn update_data_collection(&self, record: &DataCollectionRecord) -> Result<i64>;

    /// Store an image reference.
    async fn store_image(&self, image: &ImageRecord) -> Result<()>;
}

// =============================================================================
// Data collection
// =============================================================================

/// Acquisition parameters of one oscillation collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionParameters {
    /// Oscillation start angle, degrees.
    pub osc_start: f64,
    /// Oscillation range per image, degrees.
    pub osc_range: f64,
    /// Number of images.
    pub num_images: u32,
    /// Exposure per image, seconds.
    pub exposure_time: f64,
    /// File-name prefix.
    pub prefix: String,
    /// Run number.
    pub run_number: u32,
}

impl Default for CollectionParameters {
    fn default() -> Self {
        Self {
            osc_start: 0.0,
            osc_range: 0.1,
            num_images: 1,
            exposure_time: 0.01,
            prefix: "data".to_string(),
            run_number: 1,
        }
    }
}

impl CollectionParameters {
    /// File name of image `number` (1-based).
    pub fn image_file_name(&self, number: u32) -> String {
        format!("{}_{}_{:05}.cbf", self.prefix, self.run_number, number)
    }
}

/// Capability: runs a detector acquisition synchronised with rotation.
#[async_trait]
pub trait DataCollector: Send + Sync {
    /// Run the acquisition, returning the number of images written.
    async fn collect(&self, params: &CollectionParameters) -> Result<u32>;

    /// Abort the acquisition in progress.
    async fn stop(&self) -> Result<()>;
}

// =============================================================================
// Sample changer
// =============================================================================

/// Capability: sample mounting.
#[async_trait]
pub trait SampleChanger: Send + Sync {
    /// Mount the sample at `location` (e.g. "1:05"), unmounting any other.
    async fn load(&self, location: &str) -> Result<()>;

    /// Unmount the currently mounted sample.
    async fn unload(&self) -> Result<()>;

    /// Location of the mounted sample, if any.
    async fn loaded_sample(&self) -> Result<Option<String>>;
}

// =============================================================================
// Workflows
// =============================================================================

/// How an external workflow ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// Workflow finished.
    Finished,
    /// Workflow is waiting for the user; the queue should pause.
    NeedsUserInput(String),
    /// Workflow gave up.
    Failed(String),
}

/// Capability: external workflow engine.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    /// Run the named workflow with JSON parameters.
    async fn run(&self, name: &str, params: &serde_json::Value) -> Result<WorkflowOutcome>;

    /// Abort the workflow in progress.
    async fn abort(&self) -> Result<()>;
}

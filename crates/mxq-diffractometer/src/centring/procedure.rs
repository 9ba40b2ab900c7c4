//! Centring procedures.
//!
//! Each procedure runs as a background task and either produces the motor
//! positions of the centred sample or fails. Procedures never apply their
//! final result themselves; the diffractometer does that once the task has
//! ended, so a killed procedure leaves the sample where it is.

use mxq_core::capabilities::{LoopDetection, LoopFinder};
use mxq_core::config::CentringSettings;
use mxq_core::events::EventBus;
use mxq_core::types::{MotorPositions, MotorRole, ScreenPoint};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::math::{centre_from_observations, deltas_from_click, CentringDeltas, Observation, ScreenGeometry};
use super::motor::MotorSet;
use crate::error::CentringError;
use crate::events::DiffractometerEvent;

/// Points the manual procedure collects.
pub const MANUAL_CLICKS: u32 = 3;

/// Phi rotation between loop-search attempts, degrees.
const LOOP_SEARCH_STEP: f64 = 90.0;

/// How a centred position is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CentringMethod {
    /// Three user clicks, 90 degrees apart.
    Manual,
    /// Loop detection at several angles, repeated over a few cycles.
    Automatic,
    /// One click, moved onto the beam.
    MoveToBeam,
}

impl CentringMethod {
    /// Name used by user interfaces.
    pub fn as_str(&self) -> &'static str {
        match self {
            CentringMethod::Manual => "Manual 3-click",
            CentringMethod::Automatic => "Computer automatic",
            CentringMethod::MoveToBeam => "Move to beam",
        }
    }

    /// Screen clicks the procedure consumes.
    pub fn clicks_needed(&self) -> u32 {
        match self {
            CentringMethod::Manual => MANUAL_CLICKS,
            CentringMethod::Automatic => 0,
            CentringMethod::MoveToBeam => 1,
        }
    }
}

impl std::fmt::Display for CentringMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a procedure needs, moved into its task.
pub struct ProcedureContext {
    /// Diffractometer motors.
    pub motors: Arc<MotorSet>,
    /// Camera calibration and beam.
    pub geometry: ScreenGeometry,
    /// Image counts, angles and cycles.
    pub settings: CentringSettings,
    /// Bound on each rotation.
    pub motion_timeout: Duration,
    /// User clicks; closing the channel cancels the procedure.
    pub clicks: mpsc::UnboundedReceiver<ScreenPoint>,
    /// Needed by automatic centring only.
    pub loop_finder: Option<Arc<dyn LoopFinder>>,
    /// Progress messages and new automatic points.
    pub events: EventBus<DiffractometerEvent>,
}

impl ProcedureContext {
    fn progress(&self, message: impl Into<String>) {
        self.events
            .emit(DiffractometerEvent::ProgressMessage(message.into()));
    }

    async fn next_click(&mut self) -> Result<ScreenPoint, CentringError> {
        // Sender dropped: the session was torn down
        self.clicks.recv().await.ok_or(CentringError::Aborted)
    }

    async fn phi(&self) -> Result<f64, CentringError> {
        Ok(self.motors.get(MotorRole::Phi)?.get_value().await?)
    }

    async fn rotate_phi(&self, degrees: f64) -> Result<(), CentringError> {
        self.motors
            .get(MotorRole::Phi)?
            .set_value_relative(degrees, Some(self.motion_timeout))
            .await?;
        Ok(())
    }
}

/// Run the procedure for `method`, returning the centred motor positions.
pub async fn run_procedure(
    method: CentringMethod,
    mut ctx: ProcedureContext,
) -> Result<MotorPositions, CentringError> {
    info!(%method, "Centring procedure started");
    let result = match method {
        CentringMethod::Manual => manual(&mut ctx).await,
        CentringMethod::Automatic => automatic(&mut ctx).await,
        CentringMethod::MoveToBeam => move_to_beam(&mut ctx).await,
    };
    match &result {
        Ok(target) => info!(%method, ?target, "Centring procedure finished"),
        Err(e) => info!(%method, error = %e, "Centring procedure failed"),
    }
    result
}

async fn manual(ctx: &mut ProcedureContext) -> Result<MotorPositions, CentringError> {
    let mut observations = Vec::with_capacity(MANUAL_CLICKS as usize);
    for i in 0..MANUAL_CLICKS {
        ctx.progress(format!("Click on the sample ({} of {})", i + 1, MANUAL_CLICKS));
        let click = ctx.next_click().await?;
        let phi = ctx.phi().await?;
        debug!(x = click.x, y = click.y, phi, "Centring click");
        observations.push(Observation::new(click, phi));

        if i + 1 < MANUAL_CLICKS {
            ctx.rotate_phi(ctx.settings.manual_phi_increment).await?;
        }
    }
    fitted_target(ctx, &observations).await
}

async fn automatic(ctx: &mut ProcedureContext) -> Result<MotorPositions, CentringError> {
    let finder = ctx
        .loop_finder
        .clone()
        .ok_or(CentringError::NoLoopDetected { attempts: 0 })?;
    let cycles = ctx.settings.num_auto_centring_cycles.max(1);
    let images = ctx.settings.num_centring_images.max(2);
    let step = ctx.settings.centring_angle_range / f64::from(images - 1);

    let mut target = None;
    for cycle in 0..cycles {
        ctx.progress(format!("Automatic centring cycle {} of {}", cycle + 1, cycles));
        locate_loop(ctx, finder.as_ref()).await?;

        let mut observations = Vec::with_capacity(images as usize);
        for k in 0..images {
            match finder.find_loop().await? {
                LoopDetection::Found(point) => {
                    let phi = ctx.phi().await?;
                    ctx.events
                        .emit(DiffractometerEvent::NewAutomaticCentringPoint(point));
                    observations.push(Observation::new(point, phi));
                }
                LoopDetection::NotFound => debug!(image = k, "Loop not found, point skipped"),
            }
            if k + 1 < images {
                ctx.rotate_phi(step).await?;
            }
        }

        let positions = fitted_target(ctx, &observations).await?;
        if cycle + 1 < cycles {
            ctx.motors
                .move_to(&positions, Some(ctx.motion_timeout))
                .await?;
        }
        target = Some(positions);
    }
    target.ok_or(CentringError::InsufficientData { got: 0, needed: 2 })
}

/// Rotate until the loop is visible, within the attempt budget.
async fn locate_loop(
    ctx: &ProcedureContext,
    finder: &dyn LoopFinder,
) -> Result<ScreenPoint, CentringError> {
    let attempts = ctx.settings.loop_search_attempts.max(1);
    for attempt in 1..=attempts {
        if let LoopDetection::Found(point) = finder.find_loop().await? {
            return Ok(point);
        }
        debug!(attempt, "No loop in view");
        if attempt < attempts {
            ctx.rotate_phi(LOOP_SEARCH_STEP).await?;
        }
    }
    ctx.progress("No loop detected");
    Err(CentringError::NoLoopDetected { attempts })
}

async fn move_to_beam(ctx: &mut ProcedureContext) -> Result<MotorPositions, CentringError> {
    ctx.progress("Click on the point to move to the beam");
    let click = ctx.next_click().await?;
    let phi = ctx.phi().await?;
    let deltas = deltas_from_click(&ctx.geometry, click, phi);
    apply_deltas(&ctx.motors, &deltas, false).await
}

async fn fitted_target(
    ctx: &ProcedureContext,
    observations: &[Observation],
) -> Result<MotorPositions, CentringError> {
    let phi = ctx.phi().await?;
    let (fit, deltas) = centre_from_observations(observations, &ctx.geometry, phi)?;
    debug!(r = fit.r, a = fit.a, offset = fit.offset, ?deltas, "Centring fit");

    let mut target = apply_deltas(&ctx.motors, &deltas, true).await?;
    for role in [MotorRole::Kappa, MotorRole::KappaPhi] {
        if let Ok(motor) = ctx.motors.get(role) {
            target.insert(role, motor.get_value().await?);
        }
    }
    Ok(target)
}

/// Absolute targets for the alignment and centring tables. With
/// `use_reference`, axes with a reference position are held there.
async fn apply_deltas(
    motors: &MotorSet,
    deltas: &CentringDeltas,
    use_reference: bool,
) -> Result<MotorPositions, CentringError> {
    let mut target = MotorPositions::new();
    for (role, delta) in [
        (MotorRole::PhiY, deltas.phiy),
        (MotorRole::PhiZ, deltas.phiz),
        (MotorRole::SampX, deltas.sampx),
        (MotorRole::SampY, deltas.sampy),
    ] {
        let value = motors.get(role)?.centring_target(delta, use_reference).await?;
        target.insert(role, value);
    }
    Ok(target)
}

//! Centring and diffractometer errors.

use mxq_core::error::{TaskError, TimeoutError};
use mxq_core::types::{MotorRole, Phase};
use thiserror::Error;

use crate::centring::CentringMethod;

/// Why a centring attempt produced no centred position.
#[derive(Error, Debug)]
pub enum CentringError {
    /// Fewer observations than the sinusoid fit needs.
    #[error("Insufficient centring data: {got} point(s), at least {needed} required")]
    InsufficientData {
        /// Observations collected.
        got: usize,
        /// Minimum for a fit.
        needed: usize,
    },

    /// The observation angles cannot separate the sin and cos terms, e.g.
    /// all at one angle or all 180 degrees apart.
    #[error("Centring points do not span enough rotation, the fit is undetermined")]
    DegenerateObservations,

    /// The least-squares solver did not converge or produced non-finite values.
    #[error("Centring fit failed: {0}")]
    FitFailed(String),

    /// The procedure was cancelled before it produced a target.
    #[error("Centring aborted")]
    Aborted,

    /// Automatic centring could not find the sample loop.
    #[error("No loop detected after {attempts} attempt(s)")]
    NoLoopDetected {
        /// Detection attempts made.
        attempts: u32,
    },

    /// A motor role the procedure needs has no motor.
    #[error("Motor '{0}' is not configured")]
    MissingMotor(MotorRole),

    /// A motion or confirmation wait expired.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// Collaborator failure (motor, loop finder).
    #[error(transparent)]
    Hardware(#[from] anyhow::Error),
}

/// Errors from the diffractometer state machine.
#[derive(Error, Debug)]
pub enum DiffractometerError {
    /// Another centring is running.
    #[error("A {0} centring is already in progress")]
    CentringInProgress(CentringMethod),

    /// Nothing to accept.
    #[error("No valid centring to accept")]
    NoValidCentring,

    /// Automatic centring was requested without a loop finder.
    #[error("Automatic centring needs a loop finder, none is configured")]
    NoLoopFinder,

    /// The phase controller does not offer this phase.
    #[error("Phase '{0}' is not supported by this diffractometer")]
    UnsupportedPhase(Phase),

    /// The phase controller stopped reporting before it confirmed the phase.
    #[error("Phase '{0}' was never confirmed by the device")]
    PhaseNotConfirmed(Phase),

    /// The builder was given no phase controller.
    #[error("Diffractometer has no phase controller")]
    NoPhaseControl,

    /// A required motor role has no motor.
    #[error("Motor '{0}' is not configured")]
    MissingMotor(MotorRole),

    /// The centring procedure failed.
    #[error(transparent)]
    Centring(#[from] CentringError),

    /// A bounded wait expired.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The centring task was killed or panicked.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Motor or phase controller failure.
    #[error(transparent)]
    Hardware(#[from] anyhow::Error),
}

impl DiffractometerError {
    /// True when the failure was a bounded wait expiring, here or in a
    /// collaborator.
    pub fn is_timeout(&self) -> bool {
        match self {
            DiffractometerError::Timeout(_) => true,
            DiffractometerError::Centring(CentringError::Timeout(_)) => true,
            DiffractometerError::Centring(CentringError::Hardware(e))
            | DiffractometerError::Hardware(e) => mxq_core::error::is_timeout(e),
            _ => false,
        }
    }
}

//! Centring status and diffractometer state.

use chrono::{DateTime, Utc};
use mxq_core::types::MotorPositions;
use serde::{Deserialize, Serialize};

use crate::centring::CentringMethod;

/// Outcome of the most recent centring.
///
/// `valid` is only true between a successful centring and the next start,
/// failure, rejection or invalidating motor motion.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CentringStatus {
    /// A centred position is available in `motors`.
    pub valid: bool,
    /// Set by the user accepting a valid centring.
    pub accepted: bool,
    /// Procedure of the last centring.
    pub method: Option<CentringMethod>,
    /// When it started.
    pub start_time: Option<DateTime<Utc>>,
    /// When it produced its position.
    pub end_time: Option<DateTime<Utc>>,
    /// Motor positions (mm / degrees) of the centred position.
    pub motors: MotorPositions,
}

impl CentringStatus {
    /// Status while a centring is running.
    pub fn started(method: CentringMethod, start_time: DateTime<Utc>) -> Self {
        Self {
            method: Some(method),
            start_time: Some(start_time),
            ..Default::default()
        }
    }

    /// No usable centred position.
    pub fn invalid() -> Self {
        Self::default()
    }
}

/// Coarse diffractometer state, as shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffractometerState {
    /// Idle, nothing moving.
    Ready,
    /// At least one motor is moving.
    Moving,
    /// A centring procedure is running.
    Centring,
    /// A motor reported a fault.
    Fault,
}

impl std::fmt::Display for DiffractometerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiffractometerState::Ready => write!(f, "Ready"),
            DiffractometerState::Moving => write!(f, "Moving"),
            DiffractometerState::Centring => write!(f, "Centring"),
            DiffractometerState::Fault => write!(f, "Fault"),
        }
    }
}

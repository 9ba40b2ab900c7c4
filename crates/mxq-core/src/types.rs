//! Shared vocabulary types: motor roles, diffractometer phases, screen points.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Generate a new unique identifier string.
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Named motor of a diffractometer.
///
/// The role names are the ones beamline configuration files and GUI layers
/// use (`"phi"`, `"phiy"`, `"sampx"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotorRole {
    /// Main rotation axis (omega).
    Phi,
    /// Alignment table, horizontal, along the rotation axis.
    #[serde(rename = "phiy")]
    PhiY,
    /// Alignment table, vertical.
    #[serde(rename = "phiz")]
    PhiZ,
    /// Centring table X (rotates with phi).
    #[serde(rename = "sampx")]
    SampX,
    /// Centring table Y (rotates with phi).
    #[serde(rename = "sampy")]
    SampY,
    /// Mini-kappa kappa axis.
    Kappa,
    /// Mini-kappa phi axis.
    KappaPhi,
    /// Sample-camera zoom.
    Zoom,
    /// Beam position, horizontal.
    BeamX,
    /// Beam position, vertical.
    BeamY,
}

impl MotorRole {
    /// Every role, in a stable order.
    pub const ALL: [MotorRole; 10] = [
        MotorRole::Phi,
        MotorRole::PhiY,
        MotorRole::PhiZ,
        MotorRole::SampX,
        MotorRole::SampY,
        MotorRole::Kappa,
        MotorRole::KappaPhi,
        MotorRole::Zoom,
        MotorRole::BeamX,
        MotorRole::BeamY,
    ];

    /// Roles driven by the sample centring procedures.
    pub const CENTRING: [MotorRole; 5] = [
        MotorRole::Phi,
        MotorRole::PhiY,
        MotorRole::PhiZ,
        MotorRole::SampX,
        MotorRole::SampY,
    ];

    /// Configuration/GUI name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            MotorRole::Phi => "phi",
            MotorRole::PhiY => "phiy",
            MotorRole::PhiZ => "phiz",
            MotorRole::SampX => "sampx",
            MotorRole::SampY => "sampy",
            MotorRole::Kappa => "kappa",
            MotorRole::KappaPhi => "kappa_phi",
            MotorRole::Zoom => "zoom",
            MotorRole::BeamX => "beam_x",
            MotorRole::BeamY => "beam_y",
        }
    }
}

impl fmt::Display for MotorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MotorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MotorRole::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| format!("Unknown motor role '{}'", s))
    }
}

/// Motor positions keyed by role, ordered for stable logging.
pub type MotorPositions = BTreeMap<MotorRole, f64>;

/// Diffractometer configuration state.
///
/// `Other` carries beamline-specific phases not known to the shared state
/// machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Sample exchange position.
    Transfer,
    /// Sample centring (camera in, backlight in).
    Centring,
    /// Data collection (detector cover open, beamstop in).
    DataCollection,
    /// Beam location (scintillator in).
    BeamLocation,
    /// Beamline-specific extension.
    Other(String),
    /// Device has not reported a known phase.
    Unknown,
}

impl Phase {
    /// Name used by phase notifications.
    pub fn name(&self) -> &str {
        match self {
            Phase::Transfer => "Transfer",
            Phase::Centring => "Centring",
            Phase::DataCollection => "DataCollection",
            Phase::BeamLocation => "BeamLocation",
            Phase::Other(name) => name,
            Phase::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Phase {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "Transfer" => Phase::Transfer,
            "Centring" => Phase::Centring,
            "DataCollection" => Phase::DataCollection,
            "BeamLocation" => Phase::BeamLocation,
            "Unknown" | "" => Phase::Unknown,
            other => Phase::Other(other.to_string()),
        })
    }
}

/// A point on the sample-camera image, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ScreenPoint {
    /// Horizontal pixel coordinate.
    pub x: f64,
    /// Vertical pixel coordinate.
    pub y: f64,
}

impl ScreenPoint {
    /// Create a screen point.
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

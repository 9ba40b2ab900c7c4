//! Diffractometer notifications.

use mxq_core::events::Signal;
use mxq_core::types::{Phase, ScreenPoint};

use crate::centring::CentringMethod;
use crate::status::{CentringStatus, DiffractometerState};

/// Published on the diffractometer's event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffractometerEvent {
    /// A centring procedure started.
    CentringStarted {
        /// Procedure that started.
        method: CentringMethod,
    },
    /// The procedure produced a centred position, now in `status`.
    CentringSuccessful {
        /// Procedure that succeeded.
        method: CentringMethod,
        /// Status holding the centred position.
        status: CentringStatus,
    },
    /// The procedure ended without a centred position.
    CentringFailed {
        /// Procedure that failed.
        method: CentringMethod,
        /// Error text.
        reason: String,
    },
    /// A valid centred position was invalidated by motor motion.
    CentringInvalid,
    /// The user accepted (true) or rejected (false) the centring.
    CentringAccepted {
        /// True for accept, false for reject.
        accepted: bool,
        /// Status after the decision.
        status: CentringStatus,
    },
    /// Automatic centring located the loop at a new angle.
    NewAutomaticCentringPoint(ScreenPoint),
    /// The device confirmed a new phase.
    PhaseChanged(Phase),
    /// The coarse hardware state changed.
    StateChanged(DiffractometerState),
    /// Instruction or progress text for the user.
    ProgressMessage(String),
}

impl Signal for DiffractometerEvent {
    fn signal_name(&self) -> &'static str {
        match self {
            DiffractometerEvent::CentringStarted { .. } => "centringStarted",
            DiffractometerEvent::CentringSuccessful { .. } => "centringSuccessful",
            DiffractometerEvent::CentringFailed { .. } => "centringFailed",
            DiffractometerEvent::CentringInvalid => "centringInvalid",
            DiffractometerEvent::CentringAccepted { .. } => "centringAccepted",
            DiffractometerEvent::NewAutomaticCentringPoint(_) => "newAutomaticCentringPoint",
            DiffractometerEvent::PhaseChanged(_) => "minidiffPhaseChanged",
            DiffractometerEvent::StateChanged(_) => "minidiffStateChanged",
            DiffractometerEvent::ProgressMessage(_) => "progressMessage",
        }
    }
}

//! Sample centring: geometry, motor wrapper, procedures, session.

pub mod math;
pub mod motor;
pub mod procedure;
pub mod session;

pub use math::{
    centre_from_observations, deltas_from_click, fit_sinusoid, screen_from_deltas, CentringDeltas,
    Observation, ScreenGeometry, SinusoidFit,
};
pub use motor::{CentringMotor, MotorSet};
pub use procedure::{run_procedure, CentringMethod, ProcedureContext, MANUAL_CLICKS};
pub use session::CentringSession;

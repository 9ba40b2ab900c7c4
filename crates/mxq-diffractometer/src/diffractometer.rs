//! Diffractometer state machine.
//!
//! Owns the current phase, the motors, the centring status and at most one
//! [`CentringSession`]. All state lives behind one short-lived lock that is
//! never held across an await, so every status change and its notification
//! happen together.
//!
//! # Centring lifecycle
//!
//! ```text
//! start_centring_method ──▶ procedure task ──▶ centring_done ──▶ valid / invalid
//!          │                      ▲
//!          │ image_clicked ───────┘
//!          └──────────── cancel_centring_method (kills task, no motion applied)
//! ```
//!
//! After a successful centring, watchers on the alignment and centring
//! motors invalidate the centred position when they move more than the
//! configured grace period later.

use chrono::Utc;
use futures::future::BoxFuture;
use mxq_core::capabilities::{LoopFinder, Motor, MotorSnapshot, PhaseControl};
use mxq_core::config::{CentringSettings, DiffractometerSettings, Settings};
use mxq_core::error::TaskError;
use mxq_core::events::EventBus;
use mxq_core::task::{wait_for, TaskHandle, TaskKiller};
use mxq_core::types::{MotorPositions, MotorRole, Phase, ScreenPoint};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::centring::{
    deltas_from_click, run_procedure, screen_from_deltas, CentringDeltas, CentringMethod,
    CentringMotor, CentringSession, MotorSet, ProcedureContext, ScreenGeometry,
};
use crate::error::{CentringError, DiffractometerError};
use crate::events::DiffractometerEvent;
use crate::status::{CentringStatus, DiffractometerState};

/// Motors whose motion invalidates a centred position.
const INVALIDATING_MOTORS: [MotorRole; 6] = [
    MotorRole::PhiY,
    MotorRole::PhiZ,
    MotorRole::SampX,
    MotorRole::SampY,
    MotorRole::Kappa,
    MotorRole::KappaPhi,
];

struct State {
    current_phase: Phase,
    centring_method: Option<CentringMethod>,
    centring_status: CentringStatus,
    session: Option<CentringSession>,
    /// When the last successful centring finished.
    centring_time: Option<Instant>,
    hw_state: DiffractometerState,
}

struct Inner {
    settings: DiffractometerSettings,
    centring: CentringSettings,
    geometry: ScreenGeometry,
    motors: Arc<MotorSet>,
    phase_control: Arc<dyn PhaseControl>,
    loop_finder: Option<Arc<dyn LoopFinder>>,
    events: EventBus<DiffractometerEvent>,
    state: Mutex<State>,
    watchers: Mutex<Vec<TaskKiller>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for watcher in self.watchers.get_mut().drain(..) {
            watcher.kill();
        }
    }
}

/// Shared handle to the diffractometer. Clones refer to the same device.
///
/// # Example
///
/// ```rust,ignore
/// let diffractometer = Diffractometer::builder(&settings)
///     .motor(MotorRole::Phi, phi)
///     .motor(MotorRole::PhiY, phiy)
///     // ...
///     .phase_control(phase)
///     .init()
///     .await?;
///
/// diffractometer.set_phase(Phase::Centring, Some(Duration::from_secs(40))).await?;
/// diffractometer.start_centring_method(CentringMethod::Manual, false).await?;
/// diffractometer.image_clicked(ScreenPoint::new(610.0, 480.0));
/// ```
#[derive(Clone)]
pub struct Diffractometer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Diffractometer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Diffractometer")
            .field("phase", &state.current_phase)
            .field("centring_method", &state.centring_method)
            .field("state", &state.hw_state)
            .finish()
    }
}

impl Diffractometer {
    /// Start wiring a diffractometer configured by `settings`.
    pub fn builder(settings: &Settings) -> DiffractometerBuilder {
        DiffractometerBuilder::new(settings)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Receive notifications from now on.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<DiffractometerEvent> {
        self.inner.events.subscribe()
    }

    /// The event bus itself, for forwarding.
    pub fn events(&self) -> &EventBus<DiffractometerEvent> {
        &self.inner.events
    }

    /// Last phase confirmed by the device.
    pub fn current_phase(&self) -> Phase {
        self.inner.state.lock().current_phase.clone()
    }

    /// Phases the controller supports.
    pub fn phase_list(&self) -> Vec<Phase> {
        self.inner.phase_control.phases()
    }

    /// Method of the running centring, if any.
    pub fn current_centring_method(&self) -> Option<CentringMethod> {
        self.inner.state.lock().centring_method
    }

    /// Snapshot of the last centring outcome.
    pub fn centring_status(&self) -> CentringStatus {
        self.inner.state.lock().centring_status.clone()
    }

    /// Coarse hardware state.
    pub fn state(&self) -> DiffractometerState {
        self.inner.state.lock().hw_state
    }

    /// Camera calibration.
    pub fn pixels_per_mm(&self) -> [f64; 2] {
        self.inner.geometry.pixels_per_mm
    }

    /// Beam on the image, pixels.
    pub fn beam_position(&self) -> [f64; 2] {
        self.inner.geometry.beam_position
    }

    /// Camera calibration, beam and chi together.
    pub fn geometry(&self) -> ScreenGeometry {
        self.inner.geometry
    }

    /// Motors wrapped with their calibration.
    pub fn motors(&self) -> &MotorSet {
        &self.inner.motors
    }

    /// Centring-unit positions (mm / degrees) of every motor.
    pub async fn get_positions(&self) -> Result<MotorPositions, DiffractometerError> {
        Ok(self.inner.motors.positions().await?)
    }

    /// True when nothing is moving and no centring is running.
    pub fn is_ready(&self) -> bool {
        !self.inner.motors.any_moving() && self.inner.state.lock().session.is_none()
    }

    /// Wait until every motor has settled.
    pub async fn wait_device_ready(&self, timeout: Duration) -> Result<(), DiffractometerError> {
        self.inner.motors.wait_ready(Some(timeout)).await?;
        Ok(())
    }

    // =========================================================================
    // Phase
    // =========================================================================

    /// Request `phase`. With a timeout, wait until the device confirms it.
    ///
    /// [`current_phase`](Self::current_phase) only changes on confirmation.
    pub async fn set_phase(
        &self,
        phase: Phase,
        timeout: Option<Duration>,
    ) -> Result<(), DiffractometerError> {
        if !self.phase_list().contains(&phase) {
            return Err(DiffractometerError::UnsupportedPhase(phase));
        }
        let mut confirmed = self.inner.phase_control.subscribe();
        info!(%phase, ?timeout, "Changing phase");
        self.inner.phase_control.request_phase(phase.clone()).await?;

        if let Some(timeout) = timeout {
            let what = format!("phase {}", phase);
            wait_for(&mut confirmed, &what, Some(timeout), |p| *p == phase).await?;
            // A closed channel also ends the wait
            if *confirmed.borrow() != phase {
                warn!(%phase, "Phase controller went away before confirming");
                return Err(DiffractometerError::PhaseNotConfirmed(phase));
            }
            self.inner.phase_confirmed(phase);
        }
        Ok(())
    }

    // =========================================================================
    // Motion
    // =========================================================================

    /// Move motors (centring units). With `wait`, block until they settle
    /// within the motion timeout; otherwise the move runs in the background.
    pub async fn move_to_motors_positions(
        &self,
        positions: MotorPositions,
        wait: bool,
    ) -> Result<(), DiffractometerError> {
        if let Some(role) = positions.keys().find(|r| !self.inner.motors.contains(**r)) {
            return Err(DiffractometerError::MissingMotor(*role));
        }
        if wait {
            return self.inner.move_to(&positions).await;
        }
        let inner = self.inner.clone();
        TaskHandle::spawn("move_to_motors_positions", async move {
            if let Err(e) = inner.move_to(&positions).await {
                warn!(error = %e, "Background move failed");
            }
        });
        Ok(())
    }

    /// Motor positions that bring the point at `point` onto the beam.
    pub async fn get_centred_point_from_coord(
        &self,
        point: ScreenPoint,
    ) -> Result<MotorPositions, DiffractometerError> {
        let current = self.get_positions().await?;
        let phi = position_of(&current, MotorRole::Phi)?;
        let deltas = deltas_from_click(&self.inner.geometry, point, phi);

        let mut target = current;
        for (role, delta) in [
            (MotorRole::PhiY, deltas.phiy),
            (MotorRole::PhiZ, deltas.phiz),
            (MotorRole::SampX, deltas.sampx),
            (MotorRole::SampY, deltas.sampy),
        ] {
            *target
                .get_mut(&role)
                .ok_or(DiffractometerError::MissingMotor(role))? += delta;
        }
        Ok(target)
    }

    /// Where the point centred by `positions` appears on screen now.
    ///
    /// Inverse of [`get_centred_point_from_coord`](Self::get_centred_point_from_coord).
    /// Roles absent from `positions` are taken at their current value.
    pub async fn motor_positions_to_screen(
        &self,
        positions: &MotorPositions,
    ) -> Result<ScreenPoint, DiffractometerError> {
        let current = self.get_positions().await?;
        let phi = position_of(&current, MotorRole::Phi)?;
        let delta = |role: MotorRole| -> Result<f64, DiffractometerError> {
            let now = position_of(&current, role)?;
            Ok(positions.get(&role).map_or(0.0, |target| target - now))
        };
        let deltas = CentringDeltas {
            phiy: delta(MotorRole::PhiY)?,
            phiz: delta(MotorRole::PhiZ)?,
            sampx: delta(MotorRole::SampX)?,
            sampy: delta(MotorRole::SampY)?,
        };
        Ok(screen_from_deltas(&self.inner.geometry, &deltas, phi))
    }

    /// Bring the point at `point` onto the beam and wait for the motion.
    pub async fn move_to_beam(&self, point: ScreenPoint) -> Result<(), DiffractometerError> {
        let target = self.get_centred_point_from_coord(point).await?;
        info!(x = point.x, y = point.y, "Moving to beam");
        self.inner.move_to(&target).await
    }

    // =========================================================================
    // Centring
    // =========================================================================

    /// Start a centring procedure.
    ///
    /// Fails if one is already running. With `wait`, returns once the
    /// centring has finished and reports its outcome.
    pub async fn start_centring_method(
        &self,
        method: CentringMethod,
        wait: bool,
    ) -> Result<(), DiffractometerError> {
        if method == CentringMethod::Automatic && self.inner.loop_finder.is_none() {
            return Err(DiffractometerError::NoLoopFinder);
        }
        let initial_positions = self.get_positions().await?;
        let (clicks_tx, clicks_rx) = mpsc::unbounded_channel();

        let done = {
            let mut state = self.inner.state.lock();
            if let Some(active) = state.centring_method {
                error!(requested = %method, %active, "Centring already in progress");
                self.inner.events.emit(DiffractometerEvent::CentringFailed {
                    method,
                    reason: format!("{} centring already in progress", active),
                });
                return Err(DiffractometerError::CentringInProgress(active));
            }

            let mut session = CentringSession::new(method, initial_positions, clicks_tx);
            let session_id = session.id().to_string();
            state.centring_method = Some(method);
            state.centring_status = CentringStatus::started(method, session.started());

            let ctx = ProcedureContext {
                motors: self.inner.motors.clone(),
                geometry: self.inner.geometry,
                settings: self.inner.centring,
                motion_timeout: self.inner.settings.motion_timeout(),
                clicks: clicks_rx,
                loop_finder: self.inner.loop_finder.clone(),
                events: self.inner.events.clone(),
            };
            let procedure = TaskHandle::spawn(
                format!("centring:{}", method.as_str()),
                run_procedure(method, ctx),
            );
            session.attach(procedure.killer());
            state.session = Some(session);

            self.inner.events.emit(DiffractometerEvent::CentringStarted { method });
            self.inner.set_hw_state(&mut state, DiffractometerState::Centring);
            info!(%method, session = %session_id, "Centring started");

            let inner = self.inner.clone();
            procedure.link(move |result| inner.centring_done(session_id, method, result))
        };

        if wait {
            done.join().await??;
        }
        Ok(())
    }

    /// Deliver a screen click to the running centring.
    ///
    /// Returns false when no centring is waiting for it (none running, an
    /// automatic centring, or all clicks already given).
    pub fn image_clicked(&self, point: ScreenPoint) -> bool {
        let mut state = self.inner.state.lock();
        match state.session.as_mut() {
            Some(session) => {
                let accepted = session.deliver_click(point);
                debug!(x = point.x, y = point.y, accepted, "Image clicked");
                accepted
            }
            None => false,
        }
    }

    /// Kill the running centring. The sample stays where it is. With
    /// `reject`, also discard the centring result.
    pub fn cancel_centring_method(&self, reject: bool) {
        {
            let mut state = self.inner.state.lock();
            if let Some(session) = state.session.take() {
                let method = session.method();
                session.kill();
                state.centring_method = None;
                state.centring_status = CentringStatus::invalid();
                self.inner.events.emit(DiffractometerEvent::CentringFailed {
                    method,
                    reason: "cancelled".to_string(),
                });
                self.inner.settle_hw_state(&mut state);
                info!(%method, "Centring cancelled");
            }
        }
        if reject {
            self.reject_centring();
        }
    }

    /// Mark the valid centring as accepted by the user.
    pub fn accept_centring(&self) -> Result<CentringStatus, DiffractometerError> {
        let mut state = self.inner.state.lock();
        if !state.centring_status.valid {
            return Err(DiffractometerError::NoValidCentring);
        }
        state.centring_status.accepted = true;
        let status = state.centring_status.clone();
        self.inner.events.emit(DiffractometerEvent::CentringAccepted {
            accepted: true,
            status: status.clone(),
        });
        Ok(status)
    }

    /// Discard the current centring result.
    pub fn reject_centring(&self) {
        let mut state = self.inner.state.lock();
        state.centring_status = CentringStatus::invalid();
        state.centring_time = None;
        self.inner.events.emit(DiffractometerEvent::CentringAccepted {
            accepted: false,
            status: state.centring_status.clone(),
        });
    }
}

fn position_of(positions: &MotorPositions, role: MotorRole) -> Result<f64, DiffractometerError> {
    positions
        .get(&role)
        .copied()
        .ok_or(DiffractometerError::MissingMotor(role))
}

impl Inner {
    async fn move_to(&self, positions: &MotorPositions) -> Result<(), DiffractometerError> {
        match self
            .motors
            .move_to(positions, Some(self.settings.motion_timeout()))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut state = self.state.lock();
                self.set_hw_state(&mut state, DiffractometerState::Fault);
                Err(e.into())
            }
        }
    }

    /// Completion callback of a centring procedure task.
    fn centring_done(
        self: Arc<Self>,
        session_id: String,
        method: CentringMethod,
        result: Result<Result<MotorPositions, CentringError>, TaskError>,
    ) -> BoxFuture<'static, Result<CentringStatus, DiffractometerError>> {
        Box::pin(async move {
            let outcome: Result<MotorPositions, DiffractometerError> = match result {
                Ok(Ok(target)) => Ok(target),
                Ok(Err(e)) => Err(e.into()),
                Err(TaskError::Killed(_)) => Err(CentringError::Aborted.into()),
                Err(e) => Err(e.into()),
            };

            if !self.owns_session(&session_id) {
                // Cancelled: already torn down, nothing may move
                return Err(CentringError::Aborted.into());
            }

            let outcome = match outcome {
                Ok(target) => match self.move_to(&target).await {
                    Ok(()) => self.motors.positions().await.map_err(Into::into),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            let mut state = self.state.lock();
            if !state.session.as_ref().is_some_and(|s| s.id() == session_id) {
                return Err(CentringError::Aborted.into());
            }
            let start_time = state.centring_status.start_time;
            state.session = None;
            state.centring_method = None;

            match outcome {
                Ok(motors) => {
                    state.centring_status = CentringStatus {
                        valid: true,
                        accepted: false,
                        method: Some(method),
                        start_time,
                        end_time: Some(Utc::now()),
                        motors,
                    };
                    state.centring_time = Some(Instant::now());
                    let status = state.centring_status.clone();
                    self.events.emit(DiffractometerEvent::CentringSuccessful {
                        method,
                        status: status.clone(),
                    });
                    self.settle_hw_state(&mut state);
                    info!(%method, "Centring successful");
                    Ok(status)
                }
                Err(e) => {
                    state.centring_status = CentringStatus::invalid();
                    state.centring_time = None;
                    self.events.emit(DiffractometerEvent::CentringFailed {
                        method,
                        reason: e.to_string(),
                    });
                    if state.hw_state == DiffractometerState::Centring {
                        self.settle_hw_state(&mut state);
                    }
                    warn!(%method, error = %e, "Centring failed");
                    Err(e)
                }
            }
        })
    }

    fn owns_session(&self, session_id: &str) -> bool {
        self.state
            .lock()
            .session
            .as_ref()
            .is_some_and(|s| s.id() == session_id)
    }

    fn phase_confirmed(&self, phase: Phase) {
        let mut state = self.state.lock();
        if state.current_phase != phase {
            info!(%phase, "Phase changed");
            state.current_phase = phase.clone();
            self.events.emit(DiffractometerEvent::PhaseChanged(phase));
        }
    }

    fn motor_changed(&self, role: MotorRole, snapshot: MotorSnapshot) {
        let mut state = self.state.lock();

        if snapshot.moving && state.hw_state == DiffractometerState::Ready {
            self.set_hw_state(&mut state, DiffractometerState::Moving);
        } else if !snapshot.moving && state.hw_state == DiffractometerState::Moving {
            self.settle_hw_state(&mut state);
        }

        if !INVALIDATING_MOTORS.contains(&role) || state.session.is_some() {
            return;
        }
        let grace = self.settings.invalidation_grace();
        let past_grace = state
            .centring_time
            .is_some_and(|done| done.elapsed() > grace);
        if state.centring_status.valid && past_grace {
            info!(motor = %role, "Motor moved, centred position invalidated");
            state.centring_status = CentringStatus::invalid();
            state.centring_time = None;
            self.events.emit(DiffractometerEvent::CentringInvalid);
        }
    }

    fn set_hw_state(&self, state: &mut State, new_state: DiffractometerState) {
        if state.hw_state != new_state {
            debug!(from = %state.hw_state, to = %new_state, "Diffractometer state");
            state.hw_state = new_state;
            self.events.emit(DiffractometerEvent::StateChanged(new_state));
        }
    }

    /// Ready or Moving, depending on the motors.
    fn settle_hw_state(&self, state: &mut State) {
        let new_state = if self.motors.any_moving() {
            DiffractometerState::Moving
        } else {
            DiffractometerState::Ready
        };
        self.set_hw_state(state, new_state);
    }
}

// =============================================================================
// Watchers
// =============================================================================

fn spawn_phase_watcher(inner: Weak<Inner>, mut rx: watch::Receiver<Phase>) -> TaskKiller {
    TaskHandle::spawn("phase_watcher", async move {
        while rx.changed().await.is_ok() {
            let phase = rx.borrow_and_update().clone();
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.phase_confirmed(phase);
        }
    })
    .killer()
}

fn spawn_motor_watcher(
    inner: Weak<Inner>,
    role: MotorRole,
    mut rx: watch::Receiver<MotorSnapshot>,
) -> TaskKiller {
    TaskHandle::spawn(format!("motor_watcher:{}", role), async move {
        while rx.changed().await.is_ok() {
            let snapshot = *rx.borrow_and_update();
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.motor_changed(role, snapshot);
        }
    })
    .killer()
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`Diffractometer`].
pub struct DiffractometerBuilder {
    settings: DiffractometerSettings,
    centring: CentringSettings,
    motors: BTreeMap<MotorRole, Arc<dyn Motor>>,
    phase_control: Option<Arc<dyn PhaseControl>>,
    loop_finder: Option<Arc<dyn LoopFinder>>,
    event_capacity: usize,
}

impl DiffractometerBuilder {
    /// Builder with no devices yet.
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.diffractometer.clone(),
            centring: settings.centring,
            motors: BTreeMap::new(),
            phase_control: None,
            loop_finder: None,
            event_capacity: settings.queue.event_capacity,
        }
    }

    /// Motor for `role`.
    pub fn motor(mut self, role: MotorRole, motor: Arc<dyn Motor>) -> Self {
        self.motors.insert(role, motor);
        self
    }

    /// Several motors at once.
    pub fn motors(mut self, motors: impl IntoIterator<Item = (MotorRole, Arc<dyn Motor>)>) -> Self {
        self.motors.extend(motors);
        self
    }

    /// Phase controller; required.
    pub fn phase_control(mut self, phase_control: Arc<dyn PhaseControl>) -> Self {
        self.phase_control = Some(phase_control);
        self
    }

    /// Loop finder; without one, automatic centring is refused.
    pub fn loop_finder(mut self, loop_finder: Arc<dyn LoopFinder>) -> Self {
        self.loop_finder = Some(loop_finder);
        self
    }

    /// Wire the motors and phase controller and start watching them.
    ///
    /// The centring motors (phi, phiy, phiz, sampx, sampy) are mandatory.
    pub async fn init(self) -> Result<Diffractometer, DiffractometerError> {
        for role in MotorRole::CENTRING {
            if !self.motors.contains_key(&role) {
                return Err(DiffractometerError::MissingMotor(role));
            }
        }
        let phase_control = self
            .phase_control
            .ok_or(DiffractometerError::NoPhaseControl)?;

        let mut motors = MotorSet::new();
        for (role, motor) in &self.motors {
            motors.insert(CentringMotor::new(
                *role,
                motor.clone(),
                self.settings.motor(*role),
            ));
        }

        let phase_rx = phase_control.subscribe();
        let current_phase = phase_rx.borrow().clone();
        let geometry = ScreenGeometry::from_settings(&self.settings);
        let hw_state = if motors.any_moving() {
            DiffractometerState::Moving
        } else {
            DiffractometerState::Ready
        };

        let inner = Arc::new(Inner {
            settings: self.settings,
            centring: self.centring,
            geometry,
            motors: Arc::new(motors),
            phase_control,
            loop_finder: self.loop_finder,
            events: EventBus::new(self.event_capacity),
            state: Mutex::new(State {
                current_phase,
                centring_method: None,
                centring_status: CentringStatus::invalid(),
                session: None,
                centring_time: None,
                hw_state,
            }),
            watchers: Mutex::new(Vec::new()),
        });

        let mut watchers = vec![spawn_phase_watcher(Arc::downgrade(&inner), phase_rx)];
        for (role, motor) in &self.motors {
            watchers.push(spawn_motor_watcher(
                Arc::downgrade(&inner),
                *role,
                motor.subscribe(),
            ));
        }
        *inner.watchers.lock() = watchers;

        info!(
            motors = inner.motors.roles().count(),
            phase = %inner.state.lock().current_phase,
            "Diffractometer initialised"
        );
        Ok(Diffractometer { inner })
    }
}

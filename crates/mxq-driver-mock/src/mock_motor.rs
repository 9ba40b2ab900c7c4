//! Simulated motor.

use anyhow::Result;
use async_trait::async_trait;
use mxq_core::capabilities::{Motor, MotorSnapshot};
use mxq_core::error::{DriverError, DriverErrorKind};
use mxq_core::task::wait_for;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::common::{ErrorConfig, MockMode};

/// Position update period while a timed move is in progress.
const MOTION_TICK: Duration = Duration::from_millis(10);

// =============================================================================
// Configuration
// =============================================================================

/// Limit behavior when a target exceeds the travel range
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitBehavior {
    /// Reject the move
    HardStop,
    /// Move to the boundary without error
    Clamp,
}

/// Travel range of a motor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MotorLimits {
    /// Lower bound
    pub min_position: f64,
    /// Upper bound
    pub max_position: f64,
    /// What an out-of-range move does
    pub behavior: LimitBehavior,
}

impl MotorLimits {
    /// Out-of-range moves fail
    pub fn hard_stop(min: f64, max: f64) -> Self {
        Self {
            min_position: min,
            max_position: max,
            behavior: LimitBehavior::HardStop,
        }
    }

    /// Out-of-range moves stop at the boundary
    pub fn clamp(min: f64, max: f64) -> Self {
        Self {
            min_position: min,
            max_position: max,
            behavior: LimitBehavior::Clamp,
        }
    }

    fn enforce(&self, device: &str, target: f64) -> Result<f64, DriverError> {
        match self.behavior {
            LimitBehavior::Clamp => Ok(target.clamp(self.min_position, self.max_position)),
            LimitBehavior::HardStop => {
                if target < self.min_position || target > self.max_position {
                    Err(DriverError::new(
                        device,
                        DriverErrorKind::InvalidParameter,
                        format!(
                            "Position {:.4} exceeds limits [{:.4}, {:.4}]",
                            target, self.min_position, self.max_position
                        ),
                    ))
                } else {
                    Ok(target)
                }
            }
        }
    }
}

// =============================================================================
// MockMotor
// =============================================================================

struct MotorInner {
    name: String,
    snapshot: watch::Sender<MotorSnapshot>,
    velocity: Mutex<f64>,
    limits: Option<MotorLimits>,
    mode: MockMode,
    error_config: ErrorConfig,
    motion: Mutex<Option<AbortHandle>>,
    moves: AtomicU32,
}

/// Simulated positioner.
///
/// In [`MockMode::Instant`] a move completes inside `move_abs`. In the timed
/// modes the position ramps linearly at the configured velocity in a
/// background task, publishing a [`MotorSnapshot`] every tick, so that
/// `wait_ready`, `stop` and position watchers behave like a real axis.
///
/// Clones share the same simulated axis.
///
/// # Example
///
/// ```rust,ignore
/// let phi = MockMotor::builder("phi")
///     .mode(MockMode::Realistic)
///     .velocity(90.0)
///     .build();
///
/// phi.set_value(90.0, Some(Duration::from_secs(5))).await?;
/// assert_eq!(phi.position().await?, 90.0);
/// ```
#[derive(Clone)]
pub struct MockMotor {
    inner: Arc<MotorInner>,
}

impl MockMotor {
    /// Instant-mode motor at position 0.0.
    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    /// Instant-mode motor at `position`.
    pub fn with_position(name: impl Into<String>, position: f64) -> Self {
        Self::builder(name).initial_position(position).build()
    }

    /// Start configuring a motor named `name`.
    pub fn builder(name: impl Into<String>) -> MockMotorBuilder {
        MockMotorBuilder::new(name)
    }

    /// Last published position, without going through the async API.
    pub fn current_position(&self) -> f64 {
        self.inner.snapshot.borrow().position
    }

    /// Number of accepted `move_abs` calls.
    pub fn move_count(&self) -> u32 {
        self.inner.moves.load(Ordering::SeqCst)
    }

    fn abort_motion(&self) {
        if let Some(handle) = self.inner.motion.lock().take() {
            handle.abort();
        }
    }

    fn motion_duration(&self, distance: f64) -> Duration {
        let velocity = *self.inner.velocity.lock();
        if !self.inner.mode.is_timed() || velocity <= 0.0 || distance == 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(distance.abs() / velocity)
        }
    }
}

impl std::fmt::Debug for MockMotor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockMotor")
            .field("name", &self.inner.name)
            .field("snapshot", &*self.inner.snapshot.borrow())
            .field("mode", &self.inner.mode)
            .finish()
    }
}

#[async_trait]
impl Motor for MockMotor {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn position(&self) -> Result<f64> {
        self.inner
            .error_config
            .check_operation(&self.inner.name, "read")?;
        Ok(self.current_position())
    }

    async fn move_abs(&self, target: f64) -> Result<()> {
        let name = self.inner.name.as_str();
        self.inner.error_config.check_operation(name, "move")?;

        let target = match &self.inner.limits {
            Some(limits) => limits.enforce(name, target)?,
            None => target,
        };

        // A new move supersedes the one in progress
        self.abort_motion();
        self.inner.moves.fetch_add(1, Ordering::SeqCst);

        let start = self.current_position();
        let duration = self.motion_duration(target - start);
        tracing::debug!(motor = name, from = start, to = target, ?duration, "Moving");

        if duration.is_zero() {
            self.inner.snapshot.send_replace(MotorSnapshot {
                position: target,
                moving: false,
            });
            return Ok(());
        }

        self.inner.snapshot.send_replace(MotorSnapshot {
            position: start,
            moving: true,
        });

        let inner = self.inner.clone();
        let motion = tokio::spawn(async move {
            let began = Instant::now();
            let mut ticker = interval(MOTION_TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let fraction = began.elapsed().as_secs_f64() / duration.as_secs_f64();
                if fraction >= 1.0 {
                    break;
                }
                inner.snapshot.send_replace(MotorSnapshot {
                    position: start + (target - start) * fraction,
                    moving: true,
                });
            }
            inner.snapshot.send_replace(MotorSnapshot {
                position: target,
                moving: false,
            });
            tracing::debug!(motor = %inner.name, position = target, "Reached target");
        });
        *self.inner.motion.lock() = Some(motion.abort_handle());
        Ok(())
    }

    async fn wait_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let name = self.inner.name.as_str();
        self.inner.error_config.check_operation(name, "wait_ready")?;
        let mut rx = self.inner.snapshot.subscribe();
        wait_for(&mut rx, &format!("motor '{}' ready", name), timeout, |s| !s.moving).await?;
        Ok(())
    }

    fn is_moving(&self) -> bool {
        self.inner.snapshot.borrow().moving
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(*self.inner.velocity.lock())
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        if !velocity.is_finite() || velocity <= 0.0 {
            return Err(DriverError::new(
                &self.inner.name,
                DriverErrorKind::InvalidParameter,
                format!("Velocity must be positive, got {}", velocity),
            )
            .into());
        }
        *self.inner.velocity.lock() = velocity;
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<MotorSnapshot> {
        self.inner.snapshot.subscribe()
    }

    async fn stop(&self) -> Result<()> {
        self.abort_motion();
        let position = self.current_position();
        self.inner.snapshot.send_replace(MotorSnapshot {
            position,
            moving: false,
        });
        tracing::debug!(motor = %self.inner.name, position, "Stopped");
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for MockMotor with fluent API
pub struct MockMotorBuilder {
    name: String,
    initial_position: f64,
    velocity: f64,
    limits: Option<MotorLimits>,
    mode: MockMode,
    error_config: Option<ErrorConfig>,
}

impl MockMotorBuilder {
    /// Instant motor at 0 with velocity 10 and no limits
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            initial_position: 0.0,
            velocity: 10.0,
            limits: None,
            mode: MockMode::Instant,
            error_config: None,
        }
    }

    /// Starting position
    pub fn initial_position(mut self, position: f64) -> Self {
        self.initial_position = position;
        self
    }

    /// Units per second in the timed modes
    pub fn velocity(mut self, velocity: f64) -> Self {
        self.velocity = velocity;
        self
    }

    /// Travel range
    pub fn limits(mut self, limits: MotorLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Timing and fault behaviour
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Overrides the faults implied by the mode.
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = Some(config);
        self
    }

    /// Create the motor
    pub fn build(self) -> MockMotor {
        let error_config = self
            .error_config
            .unwrap_or_else(|| ErrorConfig::for_mode(self.mode));
        let (snapshot, _) = watch::channel(MotorSnapshot {
            position: self.initial_position,
            moving: false,
        });
        MockMotor {
            inner: Arc::new(MotorInner {
                name: self.name,
                snapshot,
                velocity: Mutex::new(self.velocity),
                limits: self.limits,
                mode: self.mode,
                error_config,
                motion: Mutex::new(None),
                moves: AtomicU32::new(0),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;
    use mxq_core::error::is_timeout;

    #[tokio::test]
    async fn test_instant_absolute_and_relative_moves() {
        let motor = MockMotor::new("sampx");
        assert_eq!(motor.position().await.unwrap(), 0.0);

        motor.move_abs(1.5).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 1.5);
        assert!(!motor.is_moving());

        motor.set_value_relative(-0.5, None).await.unwrap();
        assert_eq!(motor.position().await.unwrap(), 1.0);
        assert_eq!(motor.move_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_move_ramps_and_settles() {
        let motor = MockMotor::builder("phi")
            .mode(MockMode::Realistic)
            .velocity(90.0)
            .build();

        motor.move_abs(90.0).await.unwrap();
        assert!(motor.is_moving());

        motor
            .wait_ready(Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(!motor.is_moving());
        assert_eq!(motor.position().await.unwrap(), 90.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_times_out_on_slow_motor() {
        let motor = MockMotor::builder("phiy")
            .mode(MockMode::Realistic)
            .velocity(0.1)
            .build();

        motor.move_abs(10.0).await.unwrap();
        let err = motor
            .wait_ready(Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(is_timeout(&err));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_between_start_and_target() {
        let motor = MockMotor::builder("phiz")
            .mode(MockMode::Realistic)
            .velocity(1.0)
            .build();

        motor.move_abs(10.0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        motor.stop().await.unwrap();

        let position = motor.position().await.unwrap();
        assert!(position > 0.0 && position < 10.0, "stopped at {}", position);
        assert!(!motor.is_moving());
    }

    #[tokio::test]
    async fn test_limits() {
        let motor = MockMotor::builder("kappa")
            .limits(MotorLimits::hard_stop(0.0, 240.0))
            .build();
        assert!(motor.move_abs(300.0).await.is_err());
        assert_eq!(motor.position().await.unwrap(), 0.0);

        let clamped = MockMotor::builder("zoom")
            .limits(MotorLimits::clamp(1.0, 10.0))
            .build();
        clamped.move_abs(12.0).await.unwrap();
        assert_eq!(clamped.position().await.unwrap(), 10.0);
    }

    #[tokio::test]
    async fn test_subscribers_see_moves() {
        let motor = MockMotor::new("sampy");
        let mut rx = motor.subscribe();
        motor.move_abs(0.25).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().position, 0.25);
    }

    #[tokio::test]
    async fn test_error_injection() {
        let motor = MockMotor::builder("phi")
            .error_config(ErrorConfig::scenario(ErrorScenario::Timeout {
                operation: "wait_ready",
            }))
            .build();
        motor.move_abs(10.0).await.unwrap();
        let err = motor.wait_ready(None).await.unwrap_err();
        assert!(is_timeout(&err));
    }

    #[tokio::test]
    async fn test_rejects_non_positive_velocity() {
        let motor = MockMotor::new("phi");
        assert!(motor.set_velocity(0.0).await.is_err());
        motor.set_velocity(45.0).await.unwrap();
        assert_eq!(motor.velocity().await.unwrap(), 45.0);
    }
}

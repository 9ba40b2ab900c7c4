//! Direction- and unit-aware motor wrapper used by centring.

use anyhow::Result;
use futures::future::try_join_all;
use mxq_core::capabilities::Motor;
use mxq_core::config::CentringMotorSettings;
use mxq_core::types::{MotorPositions, MotorRole};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::CentringError;

/// A motor as the centring code sees it.
///
/// Values are `raw * direction / units_per_mm`: millimetres for
/// translations, degrees for rotation axes (which keep `units_per_mm = 1`).
#[derive(Clone)]
pub struct CentringMotor {
    role: MotorRole,
    motor: Arc<dyn Motor>,
    direction: f64,
    units_per_mm: f64,
    reference_position: Option<f64>,
}

impl CentringMotor {
    /// Wrap `motor` with its calibration.
    pub fn new(role: MotorRole, motor: Arc<dyn Motor>, settings: CentringMotorSettings) -> Self {
        Self {
            role,
            motor,
            direction: settings.direction,
            units_per_mm: settings.units_per_mm,
            reference_position: settings.reference_position,
        }
    }

    /// Role this motor plays.
    pub fn role(&self) -> MotorRole {
        self.role
    }

    /// The wrapped actuator.
    pub fn motor(&self) -> &Arc<dyn Motor> {
        &self.motor
    }

    /// Fixed position centring holds this axis at, if any.
    pub fn reference_position(&self) -> Option<f64> {
        self.reference_position
    }

    /// Hardware position to centring units.
    pub fn from_raw(&self, raw: f64) -> f64 {
        raw * self.direction / self.units_per_mm
    }

    /// Centring units to hardware position.
    pub fn to_raw(&self, value: f64) -> f64 {
        value * self.units_per_mm / self.direction
    }

    /// Current position, centring units.
    pub async fn get_value(&self) -> Result<f64> {
        Ok(self.from_raw(self.motor.position().await?))
    }

    /// Move to `value`; waits for the motor when `timeout` is given.
    pub async fn set_value(&self, value: f64, timeout: Option<Duration>) -> Result<()> {
        self.motor.set_value(self.to_raw(value), timeout).await
    }

    /// Move by `delta` from the current position.
    pub async fn set_value_relative(&self, delta: f64, timeout: Option<Duration>) -> Result<()> {
        let current = self.get_value().await?;
        self.set_value(current + delta, timeout).await
    }

    /// Absolute centring target for a correction of `delta`.
    ///
    /// With `use_reference`, an axis that has a reference position is held
    /// there and the correction is dropped. Otherwise the correction is
    /// applied to the live position.
    pub async fn centring_target(&self, delta: f64, use_reference: bool) -> Result<f64> {
        match self.reference_position {
            Some(reference) if use_reference => Ok(reference),
            _ => Ok(self.get_value().await? + delta),
        }
    }

    /// True while the hardware reports motion.
    pub fn is_moving(&self) -> bool {
        self.motor.is_moving()
    }

    /// Wait for the motor to settle.
    pub async fn wait_ready(&self, timeout: Option<Duration>) -> Result<()> {
        self.motor.wait_ready(timeout).await
    }
}

impl std::fmt::Debug for CentringMotor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentringMotor")
            .field("role", &self.role)
            .field("motor", &self.motor.name())
            .field("direction", &self.direction)
            .field("units_per_mm", &self.units_per_mm)
            .field("reference_position", &self.reference_position)
            .finish()
    }
}

/// The diffractometer's motors, by role.
#[derive(Debug, Clone, Default)]
pub struct MotorSet {
    motors: BTreeMap<MotorRole, CentringMotor>,
}

impl MotorSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `motor` under its role, replacing any previous one.
    pub fn insert(&mut self, motor: CentringMotor) {
        self.motors.insert(motor.role(), motor);
    }

    /// Motor for `role`, or `MissingMotor`.
    pub fn get(&self, role: MotorRole) -> Result<&CentringMotor, CentringError> {
        self.motors
            .get(&role)
            .ok_or(CentringError::MissingMotor(role))
    }

    /// True if `role` has a motor.
    pub fn contains(&self, role: MotorRole) -> bool {
        self.motors.contains_key(&role)
    }

    /// Configured roles, in role order.
    pub fn roles(&self) -> impl Iterator<Item = MotorRole> + '_ {
        self.motors.keys().copied()
    }

    /// Configured motors, in role order.
    pub fn iter(&self) -> impl Iterator<Item = &CentringMotor> {
        self.motors.values()
    }

    /// True if any motor is moving.
    pub fn any_moving(&self) -> bool {
        self.motors.values().any(CentringMotor::is_moving)
    }

    /// Positions of every motor.
    pub async fn positions(&self) -> Result<MotorPositions> {
        let mut positions = MotorPositions::new();
        for motor in self.motors.values() {
            positions.insert(motor.role(), motor.get_value().await?);
        }
        Ok(positions)
    }

    /// Start every move, then wait for all of them when `timeout` is given.
    pub async fn move_to(
        &self,
        positions: &MotorPositions,
        timeout: Option<Duration>,
    ) -> Result<(), CentringError> {
        let mut targets = Vec::with_capacity(positions.len());
        for (role, value) in positions {
            targets.push((self.get(*role)?, *value));
        }
        for (motor, value) in &targets {
            tracing::debug!(motor = %motor.role(), target = value, "Moving");
            motor.set_value(*value, None).await?;
        }
        if timeout.is_some() {
            try_join_all(targets.iter().map(|(motor, _)| motor.wait_ready(timeout))).await?;
        }
        Ok(())
    }

    /// Wait until no motor is moving.
    pub async fn wait_ready(&self, timeout: Option<Duration>) -> Result<()> {
        try_join_all(self.motors.values().map(|motor| motor.wait_ready(timeout))).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mxq_driver_mock::MockMotor;

    fn wrapped(direction: f64, units_per_mm: f64) -> (MockMotor, CentringMotor) {
        let raw = MockMotor::new("phiz");
        let motor = CentringMotor::new(
            MotorRole::PhiZ,
            Arc::new(raw.clone()),
            CentringMotorSettings {
                direction,
                units_per_mm,
                reference_position: None,
            },
        );
        (raw, motor)
    }

    #[tokio::test]
    async fn converts_direction_and_units_both_ways() {
        let (raw, motor) = wrapped(-1.0, 1000.0);
        motor.set_value(0.25, None).await.unwrap();
        assert_eq!(raw.current_position(), -250.0);
        assert_eq!(motor.get_value().await.unwrap(), 0.25);

        motor.set_value_relative(0.05, None).await.unwrap();
        assert!((raw.current_position() + 300.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reference_position_holds_the_axis_when_requested() {
        let raw = MockMotor::with_position("phiz", 3.0);
        let motor = CentringMotor::new(
            MotorRole::PhiZ,
            Arc::new(raw),
            CentringMotorSettings {
                reference_position: Some(1.5),
                ..Default::default()
            },
        );
        assert_eq!(motor.get_value().await.unwrap(), 3.0);
        assert_eq!(motor.centring_target(0.2, true).await.unwrap(), 1.5);
        assert!((motor.centring_target(0.2, false).await.unwrap() - 3.2).abs() < 1e-12);
    }

    #[tokio::test]
    async fn move_to_rejects_unknown_roles_before_moving() {
        let (raw, motor) = wrapped(1.0, 1.0);
        let mut set = MotorSet::new();
        set.insert(motor);

        let targets = MotorPositions::from([(MotorRole::PhiZ, 1.0), (MotorRole::Zoom, 2.0)]);
        let err = set.move_to(&targets, None).await.unwrap_err();
        assert!(matches!(err, CentringError::MissingMotor(MotorRole::Zoom)));
        assert_eq!(raw.move_count(), 0);
    }
}

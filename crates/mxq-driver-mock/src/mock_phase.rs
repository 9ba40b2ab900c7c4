//! Simulated diffractometer phase controller.

use anyhow::Result;
use async_trait::async_trait;
use mxq_core::capabilities::PhaseControl;
use mxq_core::error::{DriverError, DriverErrorKind};
use mxq_core::types::Phase;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::common::ErrorConfig;

const DEVICE: &str = "phase_control";

struct PhaseInner {
    phases: Vec<Phase>,
    confirmed: watch::Sender<Phase>,
    transition_time: Duration,
    responsive: AtomicBool,
    requests: Mutex<Vec<Phase>>,
    pending: Mutex<Option<AbortHandle>>,
    error_config: ErrorConfig,
}

/// Phase controller that confirms a requested phase after a fixed
/// transition time.
///
/// An unresponsive controller accepts requests but never confirms them,
/// which is how phase-change timeouts are exercised.
#[derive(Clone)]
pub struct MockPhaseControl {
    inner: Arc<PhaseInner>,
}

impl MockPhaseControl {
    /// Instant controller with the four standard phases, starting in Centring.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Start configuring a controller.
    pub fn builder() -> MockPhaseControlBuilder {
        MockPhaseControlBuilder::default()
    }

    /// Phases requested so far, oldest first.
    pub fn requests(&self) -> Vec<Phase> {
        self.inner.requests.lock().clone()
    }

    /// Stop (or resume) confirming requested phases.
    pub fn set_responsive(&self, responsive: bool) {
        self.inner.responsive.store(responsive, Ordering::SeqCst);
    }

    /// Report a phase change that was not requested through this API
    /// (e.g. triggered from the device's own panel).
    pub fn force_phase(&self, phase: Phase) {
        self.inner.confirmed.send_replace(phase);
    }

    /// Phase currently confirmed by the device.
    pub fn confirmed_phase(&self) -> Phase {
        self.inner.confirmed.borrow().clone()
    }
}

impl Default for MockPhaseControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhaseControl for MockPhaseControl {
    fn phases(&self) -> Vec<Phase> {
        self.inner.phases.clone()
    }

    async fn request_phase(&self, phase: Phase) -> Result<()> {
        self.inner.error_config.check_operation(DEVICE, "request_phase")?;
        if !self.inner.phases.contains(&phase) {
            return Err(DriverError::new(
                DEVICE,
                DriverErrorKind::InvalidParameter,
                format!("Unsupported phase '{}'", phase),
            )
            .into());
        }
        self.inner.requests.lock().push(phase.clone());

        if let Some(previous) = self.inner.pending.lock().take() {
            previous.abort();
        }

        if !self.inner.responsive.load(Ordering::SeqCst) {
            tracing::debug!(%phase, "Phase request accepted, device will not confirm");
            return Ok(());
        }

        if self.inner.transition_time.is_zero() {
            self.inner.confirmed.send_replace(phase);
            return Ok(());
        }

        let inner = self.inner.clone();
        let delay = self.inner.transition_time;
        let transition = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tracing::debug!(%phase, "Phase reached");
            inner.confirmed.send_replace(phase);
        });
        *self.inner.pending.lock() = Some(transition.abort_handle());
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<Phase> {
        self.inner.confirmed.subscribe()
    }
}

/// Builder for MockPhaseControl
pub struct MockPhaseControlBuilder {
    phases: Vec<Phase>,
    initial: Phase,
    transition_time: Duration,
    responsive: bool,
    error_config: ErrorConfig,
}

impl Default for MockPhaseControlBuilder {
    fn default() -> Self {
        Self {
            phases: vec![
                Phase::Centring,
                Phase::DataCollection,
                Phase::BeamLocation,
                Phase::Transfer,
            ],
            initial: Phase::Centring,
            transition_time: Duration::ZERO,
            responsive: true,
            error_config: ErrorConfig::none(),
        }
    }
}

impl MockPhaseControlBuilder {
    /// Supported phases.
    pub fn phases(mut self, phases: Vec<Phase>) -> Self {
        self.phases = phases;
        self
    }

    /// Phase confirmed at start.
    pub fn initial_phase(mut self, phase: Phase) -> Self {
        self.initial = phase;
        self
    }

    /// Delay between a request and its confirmation.
    pub fn transition_time(mut self, delay: Duration) -> Self {
        self.transition_time = delay;
        self
    }

    /// Never confirm requested phases.
    pub fn unresponsive(mut self) -> Self {
        self.responsive = false;
        self
    }

    /// Inject faults into `request_phase`.
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Create the controller.
    pub fn build(self) -> MockPhaseControl {
        let (confirmed, _) = watch::channel(self.initial);
        MockPhaseControl {
            inner: Arc::new(PhaseInner {
                phases: self.phases,
                confirmed,
                transition_time: self.transition_time,
                responsive: AtomicBool::new(self.responsive),
                requests: Mutex::new(Vec::new()),
                pending: Mutex::new(None),
                error_config: self.error_config,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_controller_confirms_immediately() {
        let control = MockPhaseControl::new();
        control.request_phase(Phase::DataCollection).await.unwrap();
        assert_eq!(control.confirmed_phase(), Phase::DataCollection);
        assert_eq!(control.requests(), vec![Phase::DataCollection]);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_controller_confirms_after_transition() {
        let control = MockPhaseControl::builder()
            .transition_time(Duration::from_secs(2))
            .build();
        let mut rx = control.subscribe();

        control.request_phase(Phase::Transfer).await.unwrap();
        assert_eq!(control.confirmed_phase(), Phase::Centring);

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Phase::Transfer);
    }

    #[tokio::test]
    async fn unresponsive_controller_never_confirms() {
        let control = MockPhaseControl::builder().unresponsive().build();
        control.request_phase(Phase::Transfer).await.unwrap();
        assert_eq!(control.confirmed_phase(), Phase::Centring);
    }

    #[tokio::test]
    async fn unsupported_phase_is_rejected() {
        let control = MockPhaseControl::new();
        let result = control.request_phase(Phase::Other("Tomo".into())).await;
        assert!(result.is_err());
        assert!(control.requests().is_empty());
    }
}

//! What entry handlers see while they run.

use mxq_core::capabilities::{DataCollector, LimsClient, SampleChanger, WorkflowRunner};
use mxq_core::events::EventBus;
use mxq_core::task::wait_for;
use mxq_core::types::MotorPositions;
use mxq_diffractometer::Diffractometer;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use crate::events::QueueEvent;

/// Devices available to entry handlers. Absent devices make the entries
/// that need them fail.
#[derive(Clone, Default)]
pub struct Beamline {
    /// Phase and centring.
    pub diffractometer: Option<Diffractometer>,
    /// Experiment records.
    pub lims: Option<Arc<dyn LimsClient>>,
    /// Detector and acquisition.
    pub collector: Option<Arc<dyn DataCollector>>,
    /// Sample mounting robot.
    pub sample_changer: Option<Arc<dyn SampleChanger>>,
    /// External workflow engine.
    pub workflow: Option<Arc<dyn WorkflowRunner>>,
}

impl std::fmt::Debug for Beamline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Beamline")
            .field("diffractometer", &self.diffractometer.is_some())
            .field("lims", &self.lims.is_some())
            .field("collector", &self.collector.is_some())
            .field("sample_changer", &self.sample_changer.is_some())
            .field("workflow", &self.workflow.is_some())
            .finish()
    }
}

/// State carried from one entry to the next within a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunState {
    /// Position found by the last successful centring entry.
    pub centred_position: Option<MotorPositions>,
    /// Sample currently mounted by a sample entry.
    pub loaded_sample: Option<String>,
    /// LIMS group of the task group being run.
    pub group_id: Option<i64>,
}

/// Pause gate shared by the manager and its handlers.
#[derive(Debug, Clone)]
pub struct QueueControl {
    paused: Arc<watch::Sender<bool>>,
    events: EventBus<QueueEvent>,
}

impl QueueControl {
    pub(crate) fn new(events: EventBus<QueueEvent>) -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused: Arc::new(paused),
            events,
        }
    }

    /// True while the gate is closed.
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Close or open the gate without waiting.
    pub fn set_pause(&self, paused: bool) {
        let previous = self.paused.send_replace(paused);
        if previous != paused {
            info!(paused, "Queue pause state changed");
            self.events.emit(QueueEvent::Paused(paused));
        }
    }

    /// Like [`set_pause`](Self::set_pause); pausing also waits until the
    /// queue is resumed (or stopped).
    pub async fn pause(&self, paused: bool) {
        self.set_pause(paused);
        if paused {
            self.wait_resumed().await;
        }
    }

    /// Return once the gate is open.
    pub async fn wait_resumed(&self) {
        let mut rx = self.paused.subscribe();
        // No timeout: only fails if the sender is gone
        let _ = wait_for(&mut rx, "queue resume", None, |paused| !*paused).await;
    }
}

/// Passed to every handler call.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Devices of this run.
    pub beamline: Beamline,
    /// Shared between the entries of one run; never locked across an await.
    pub run_state: Arc<Mutex<RunState>>,
    /// Pause gate; delays and user waits block on it.
    pub control: QueueControl,
    /// Bound on diffractometer phase changes.
    pub phase_timeout: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pause_true_waits_until_resumed() {
        let control = QueueControl::new(EventBus::new(16));
        let mut events = control.events.subscribe();

        let waiter = control.clone();
        let paused = tokio::spawn(async move { waiter.pause(true).await });
        tokio::task::yield_now().await;
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Paused(true));
        assert!(!paused.is_finished());

        control.set_pause(false);
        paused.await.unwrap();
        assert!(!control.is_paused());
        assert_eq!(events.recv().await.unwrap(), QueueEvent::Paused(false));
    }

    #[test]
    fn repeated_pause_emits_once() {
        let control = QueueControl::new(EventBus::new(16));
        let mut events = control.events.subscribe();
        control.set_pause(true);
        control.set_pause(true);
        assert_eq!(events.try_recv().unwrap(), QueueEvent::Paused(true));
        assert!(events.try_recv().is_err());
    }
}

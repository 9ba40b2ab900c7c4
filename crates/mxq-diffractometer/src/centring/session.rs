//! State of one centring run, owned by the diffractometer.

use chrono::{DateTime, Utc};
use mxq_core::task::TaskKiller;
use mxq_core::types::{MotorPositions, ScreenPoint};
use tokio::sync::mpsc;

use super::procedure::CentringMethod;

/// A centring run in progress.
///
/// Created by `start_centring_method`, torn down by the completion callback
/// or by `cancel_centring_method`. Clicks reach the procedure through the
/// session, which forwards at most as many as the method needs.
#[derive(Debug)]
pub struct CentringSession {
    id: String,
    method: CentringMethod,
    started: DateTime<Utc>,
    initial_positions: MotorPositions,
    clicks: mpsc::UnboundedSender<ScreenPoint>,
    clicks_accepted: u32,
    procedure: Option<TaskKiller>,
}

impl CentringSession {
    pub(crate) fn new(
        method: CentringMethod,
        initial_positions: MotorPositions,
        clicks: mpsc::UnboundedSender<ScreenPoint>,
    ) -> Self {
        Self {
            id: mxq_core::new_uid(),
            method,
            started: Utc::now(),
            initial_positions,
            clicks,
            clicks_accepted: 0,
            procedure: None,
        }
    }

    pub(crate) fn attach(&mut self, procedure: TaskKiller) {
        self.procedure = Some(procedure);
    }

    /// Unique id of this run.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Procedure being run.
    pub fn method(&self) -> CentringMethod {
        self.method
    }

    /// Start time.
    pub fn started(&self) -> DateTime<Utc> {
        self.started
    }

    /// Motor positions when the run started.
    pub fn initial_positions(&self) -> &MotorPositions {
        &self.initial_positions
    }

    /// Clicks forwarded to the procedure so far.
    pub fn clicks_accepted(&self) -> u32 {
        self.clicks_accepted
    }

    /// Forward a click to the procedure. Returns false once the method has
    /// all the clicks it needs, or if the procedure has gone.
    pub(crate) fn deliver_click(&mut self, point: ScreenPoint) -> bool {
        if self.clicks_accepted >= self.method.clicks_needed() {
            return false;
        }
        if self.clicks.send(point).is_err() {
            return false;
        }
        self.clicks_accepted += 1;
        true
    }

    /// Kill the procedure task.
    pub(crate) fn kill(&self) {
        if let Some(procedure) = &self.procedure {
            procedure.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_session_takes_exactly_three_clicks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut session = CentringSession::new(CentringMethod::Manual, MotorPositions::new(), tx);
        for i in 0..3 {
            assert!(session.deliver_click(ScreenPoint::new(i as f64, 0.0)));
        }
        assert!(!session.deliver_click(ScreenPoint::new(9.0, 9.0)));
        assert_eq!(session.clicks_accepted(), 3);

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 3);
    }

    #[test]
    fn automatic_session_takes_no_clicks() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session =
            CentringSession::new(CentringMethod::Automatic, MotorPositions::new(), tx);
        assert!(!session.deliver_click(ScreenPoint::new(1.0, 1.0)));
    }
}

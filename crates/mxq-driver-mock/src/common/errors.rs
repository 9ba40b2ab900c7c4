//! Fault injection for simulated devices.
//!
//! Every simulated device calls [`ErrorConfig::check_operation`] at the top of
//! each fallible operation (`"move"`, `"wait_ready"`, `"request_phase"`,
//! `"find_loop"`, `"collect"`, `"load"`, `"store"`, ...). Scenarios turn those
//! calls into [`DriverError`]s so tests can drive the queue and centring
//! error paths without a beamline.
//!
//! Faults are checked in this order:
//! 1. a latched communication loss or hardware fault
//! 2. the configured scenarios, first match wins
//! 3. the random failure rate of the operation (or of `"*"`)

use mxq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::sync::Arc;

use super::MockMode;

/// Failure rate applied to every operation in [`MockMode::Chaos`].
pub const CHAOS_FAILURE_RATE: f64 = 0.02;

/// A scripted device fault.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Every call of the operation fails with a hardware error
    Fail {
        /// Operation name
        operation: &'static str,
    },
    /// The first `count` calls succeed, later ones fail
    FailAfterN {
        /// Operation name
        operation: &'static str,
        /// Successful calls before the first failure
        count: u32,
    },
    /// The operation reports a timeout
    Timeout {
        /// Operation name
        operation: &'static str,
    },
    /// The device stops answering; latches until [`ErrorConfig::reset`]
    CommunicationLoss,
    /// Controller fault with a code; latches like a communication loss
    HardwareFault {
        /// Controller fault code
        code: u32,
    },
}

/// Fault that keeps failing every operation once triggered.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Latch {
    CommunicationLost,
    Fault(u32),
}

impl Latch {
    fn error(self, device: &str) -> DriverError {
        match self {
            Latch::CommunicationLost => {
                DriverError::new(device, DriverErrorKind::Communication, "Communication lost")
            }
            Latch::Fault(code) => DriverError::new(
                device,
                DriverErrorKind::Hardware,
                format!("Hardware fault: {}", code),
            ),
        }
    }
}

#[derive(Debug)]
struct FaultState {
    calls: HashMap<&'static str, u32>,
    latched: Option<Latch>,
    rng: ChaCha8Rng,
}

/// Fault injection shared by the clones of one device.
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure probability; `"*"` applies to every operation.
    failure_rates: Arc<HashMap<&'static str, f64>>,
    scenarios: Arc<Vec<ErrorScenario>>,
    seed: Option<u64>,
    state: Arc<Mutex<FaultState>>,
}

impl ErrorConfig {
    /// No injected faults.
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Every operation fails with probability `rate`, reproducibly when
    /// seeded.
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        Self::build(HashMap::from([("*", rate)]), Vec::new(), seed)
    }

    /// Inject one scripted fault.
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Inject several scripted faults.
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Default faults for devices running in `mode`.
    pub fn for_mode(mode: MockMode) -> Self {
        match mode {
            MockMode::Chaos => Self::random_failures_seeded(CHAOS_FAILURE_RATE, None),
            MockMode::Instant | MockMode::Realistic => Self::none(),
        }
    }

    fn build(
        failure_rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(failure_rates),
            scenarios: Arc::new(scenarios),
            seed,
            state: Arc::new(Mutex::new(FaultState {
                calls: HashMap::new(),
                latched: None,
                rng: new_rng(seed),
            })),
        }
    }

    /// Fail `operation` on `device` if a fault applies to it.
    pub fn check_operation(&self, device: &str, operation: &'static str) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if let Some(latch) = state.latched {
            return Err(latch.error(device));
        }

        for scenario in self.scenarios.iter() {
            if let Some(err) = apply(scenario, &mut state, device, operation) {
                return Err(err);
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        let fails = rate >= 1.0 || (rate > 0.0 && state.rng.gen::<f64>() < rate);
        if fails {
            return Err(DriverError::new(
                device,
                DriverErrorKind::Hardware,
                format!("Random failure on operation '{}'", operation),
            ));
        }
        Ok(())
    }

    /// Clear call counters and latched faults; a seeded generator restarts
    /// from its seed.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.latched = None;
        state.rng = new_rng(self.seed);
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}

fn new_rng(seed: Option<u64>) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    }
}

fn apply(
    scenario: &ErrorScenario,
    state: &mut FaultState,
    device: &str,
    operation: &'static str,
) -> Option<DriverError> {
    match *scenario {
        ErrorScenario::Fail { operation: op } if op == operation => Some(DriverError::new(
            device,
            DriverErrorKind::Hardware,
            format!("Injected failure on '{}'", operation),
        )),
        ErrorScenario::FailAfterN {
            operation: op,
            count,
        } if op == operation => {
            let calls = state.calls.entry(operation).or_insert(0);
            *calls += 1;
            (*calls > count).then(|| {
                DriverError::new(
                    device,
                    DriverErrorKind::Hardware,
                    format!("Injected failure after {} operations", count),
                )
            })
        }
        ErrorScenario::Timeout { operation: op } if op == operation => Some(DriverError::timeout(
            device,
            format!("Operation '{}' timed out", operation),
        )),
        ErrorScenario::CommunicationLoss => {
            state.latched = Some(Latch::CommunicationLost);
            Some(Latch::CommunicationLost.error(device))
        }
        ErrorScenario::HardwareFault { code } => {
            state.latched = Some(Latch::Fault(code));
            Some(Latch::Fault(code).error(device))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_faults_by_default() {
        let config = ErrorConfig::default();
        for _ in 0..100 {
            assert!(config.check_operation("phi", "move").is_ok());
        }
    }

    #[test]
    fn random_failures_follow_the_rate() {
        let config = ErrorConfig::random_failures_seeded(0.5, Some(42));
        let failures = (0..1000)
            .filter(|_| config.check_operation("phi", "move").is_err())
            .count();
        assert!(failures > 400 && failures < 600, "Got {} failures", failures);
    }

    #[test]
    fn seeded_failures_replay_after_reset() {
        let config = ErrorConfig::random_failures_seeded(0.3, Some(7));
        let run = |config: &ErrorConfig| -> Vec<bool> {
            (0..50)
                .map(|_| config.check_operation("detector", "collect").is_ok())
                .collect()
        };
        let first = run(&config);
        config.reset();
        assert_eq!(first, run(&config));
    }

    #[test]
    fn fail_after_n_counts_only_its_operation() {
        let config = ErrorConfig::scenario(ErrorScenario::FailAfterN {
            operation: "move",
            count: 3,
        });
        for _ in 0..3 {
            assert!(config.check_operation("phi", "move").is_ok());
        }
        assert!(config.check_operation("phi", "move").is_err());
        assert!(config.check_operation("phi", "wait_ready").is_ok());
    }

    #[test]
    fn timeout_scenario_is_a_timeout() {
        let config = ErrorConfig::scenario(ErrorScenario::Timeout {
            operation: "wait_ready",
        });
        let err = config.check_operation("phi", "wait_ready").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Timeout);
        assert!(mxq_core::error::is_timeout(&anyhow::Error::new(err)));
    }

    #[test]
    fn hardware_fault_persists_across_operations() {
        let config = ErrorConfig::scenario(ErrorScenario::HardwareFault { code: 17 });
        assert!(config.check_operation("sample_changer", "load").is_err());
        let err = config.check_operation("sample_changer", "unload").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Hardware);
        assert!(err.message.contains("17"));
        config.reset();
        let err = config.check_operation("sample_changer", "load").unwrap_err();
        assert!(err.message.contains("17"));
    }

    #[test]
    fn communication_loss_fails_every_operation() {
        let config = ErrorConfig::scenario(ErrorScenario::CommunicationLoss);
        assert!(config.check_operation("lims", "store").is_err());
        let err = config.check_operation("lims", "other").unwrap_err();
        assert_eq!(err.kind, DriverErrorKind::Communication);
    }

    #[test]
    fn chaos_mode_injects_failures() {
        let config = ErrorConfig::for_mode(MockMode::Chaos);
        let failures = (0..5000)
            .filter(|_| config.check_operation("phi", "move").is_err())
            .count();
        assert!(failures > 0 && failures < 500, "Got {} failures", failures);
        assert!(ErrorConfig::for_mode(MockMode::Realistic)
            .check_operation("phi", "move")
            .is_ok());
    }
}

//! Error types shared by collaborators and runtime plumbing.
//!
//! - [`DriverError`] is what device collaborators (motors, phase controllers,
//!   detectors, LIMS clients) report. The [`DriverErrorKind`] lets callers tell
//!   a timeout apart from a communication or hardware failure without string
//!   matching.
//! - [`TimeoutError`] is raised by every bounded wait (motion settle, phase
//!   change, device ready).
//! - [`TaskError`] describes how a background task ended when it did not
//!   produce a value.
//!
//! Capability traits return `anyhow::Result`, so these types travel inside an
//! `anyhow::Error` and are recovered with `downcast_ref` where the
//! distinction matters (see [`is_timeout`]).

use std::time::Duration;
use thiserror::Error;

/// Category of a device failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorKind {
    /// Device could not be set up.
    Initialization,
    /// Device settings are wrong.
    Configuration,
    /// Link to the device failed.
    Communication,
    /// The device reported a fault.
    Hardware,
    /// The device did not answer in time.
    Timeout,
    /// The request was out of range or unsupported.
    InvalidParameter,
    /// Anything else.
    Unknown,
}

impl std::fmt::Display for DriverErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            DriverErrorKind::Initialization => "initialization",
            DriverErrorKind::Configuration => "configuration",
            DriverErrorKind::Communication => "communication",
            DriverErrorKind::Hardware => "hardware",
            DriverErrorKind::Timeout => "timeout",
            DriverErrorKind::InvalidParameter => "invalid_parameter",
            DriverErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", label)
    }
}

/// Failure reported by a device collaborator.
#[derive(Error, Debug, Clone)]
#[error("Device '{device}' {kind} error: {message}")]
pub struct DriverError {
    /// Device name.
    pub device: String,
    /// Failure category.
    pub kind: DriverErrorKind,
    /// Device-specific detail.
    pub message: String,
}

impl DriverError {
    /// Error from `device`.
    pub fn new(
        device: impl Into<String>,
        kind: DriverErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device: device.into(),
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a timeout on `device`.
    pub fn timeout(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(device, DriverErrorKind::Timeout, message)
    }
}

/// A bounded wait expired before its condition became true.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Timed out after {timeout:?} waiting for {what}")]
pub struct TimeoutError {
    /// Human-readable description of the awaited condition.
    pub what: String,
    /// The bound that expired.
    pub timeout: Duration,
}

impl TimeoutError {
    /// Timeout waiting `timeout` for `what`.
    pub fn new(what: impl Into<String>, timeout: Duration) -> Self {
        Self {
            what: what.into(),
            timeout,
        }
    }
}

/// A background task ended without producing its value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task was killed before it completed.
    #[error("Task '{0}' was killed")]
    Killed(String),
    /// The task panicked.
    #[error("Task '{name}' panicked: {message}")]
    Panicked {
        /// Task name.
        name: String,
        /// Panic payload, when it was a string.
        message: String,
    },
}

/// True when `err` (or anything in its chain) is a timeout.
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<TimeoutError>().is_some()
            || cause
                .downcast_ref::<DriverError>()
                .is_some_and(|e| e.kind == DriverErrorKind::Timeout)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeouts_are_recognised_through_anyhow() {
        let err = anyhow::Error::new(TimeoutError::new("phi ready", Duration::from_secs(3)));
        assert!(is_timeout(&err));

        let err = anyhow::Error::new(DriverError::timeout("phi", "no reply"))
            .context("moving to centred position");
        assert!(is_timeout(&err));

        let err = anyhow::Error::new(DriverError::new(
            "phi",
            DriverErrorKind::Hardware,
            "limit switch",
        ));
        assert!(!is_timeout(&err));
    }

    #[test]
    fn driver_error_display_names_device_and_kind() {
        let err = DriverError::new("sampx", DriverErrorKind::Communication, "socket closed");
        assert_eq!(
            err.to_string(),
            "Device 'sampx' communication error: socket closed"
        );
    }
}

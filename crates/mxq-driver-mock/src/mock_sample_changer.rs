//! Simulated sample changer.

use anyhow::Result;
use async_trait::async_trait;
use mxq_core::capabilities::SampleChanger;
use mxq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::time::Duration;

use crate::common::{ErrorConfig, MockMode};

const DEVICE: &str = "sample_changer";

/// Simulated exchange time in the timed modes.
const EXCHANGE_TIME: Duration = Duration::from_millis(500);

/// Sample changer with `basket:position` locations.
#[derive(Debug, Default)]
pub struct MockSampleChanger {
    mode: MockMode,
    error_config: ErrorConfig,
    loaded: Mutex<Option<String>>,
    history: Mutex<Vec<String>>,
}

impl MockSampleChanger {
    /// Empty changer with the default faults for `mode`.
    pub fn new(mode: MockMode) -> Self {
        Self {
            mode,
            error_config: ErrorConfig::for_mode(mode),
            ..Default::default()
        }
    }

    /// Replace the injected faults.
    pub fn with_error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Every location loaded so far, oldest first.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }

    async fn exchange_delay(&self) {
        if self.mode.is_timed() {
            tokio::time::sleep(EXCHANGE_TIME).await;
        }
    }
}

fn parse_location(location: &str) -> Result<(u32, u32), DriverError> {
    let invalid = || {
        DriverError::new(
            DEVICE,
            DriverErrorKind::InvalidParameter,
            format!("Invalid sample location '{}', expected basket:position", location),
        )
    };
    let (basket, position) = location.split_once(':').ok_or_else(invalid)?;
    let basket = basket.trim().parse().map_err(|_| invalid())?;
    let position = position.trim().parse().map_err(|_| invalid())?;
    Ok((basket, position))
}

#[async_trait]
impl SampleChanger for MockSampleChanger {
    async fn load(&self, location: &str) -> Result<()> {
        self.error_config.check_operation(DEVICE, "load")?;
        let (basket, position) = parse_location(location)?;

        let mounted = self.loaded.lock().clone();
        match mounted.as_deref() {
            Some(current) if current == location => {
                tracing::debug!(location, "Sample already mounted");
                return Ok(());
            }
            Some(_) => self.unload().await?,
            None => {}
        }

        self.exchange_delay().await;
        *self.loaded.lock() = Some(location.to_string());
        self.history.lock().push(location.to_string());
        tracing::info!(basket, position, "Sample mounted");
        Ok(())
    }

    async fn unload(&self) -> Result<()> {
        self.error_config.check_operation(DEVICE, "unload")?;
        self.exchange_delay().await;
        if let Some(location) = self.loaded.lock().take() {
            tracing::info!(%location, "Sample unmounted");
        }
        Ok(())
    }

    async fn loaded_sample(&self) -> Result<Option<String>> {
        Ok(self.loaded.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_replaces_the_mounted_sample() {
        let changer = MockSampleChanger::new(MockMode::Instant);
        changer.load("1:01").await.unwrap();
        changer.load("1:01").await.unwrap();
        changer.load("2:05").await.unwrap();
        assert_eq!(changer.loaded_sample().await.unwrap().as_deref(), Some("2:05"));
        assert_eq!(changer.history(), vec!["1:01", "2:05"]);

        changer.unload().await.unwrap();
        assert_eq!(changer.loaded_sample().await.unwrap(), None);
    }

    #[tokio::test]
    async fn malformed_locations_are_rejected() {
        let changer = MockSampleChanger::new(MockMode::Instant);
        assert!(changer.load("A5").await.is_err());
        assert!(changer.load("1:x").await.is_err());
        assert!(changer.history().is_empty());
    }
}

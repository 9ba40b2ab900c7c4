//! Simulated detector acquisition.

use anyhow::{bail, Result};
use async_trait::async_trait;
use mxq_core::capabilities::{CollectionParameters, DataCollector};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::common::{ErrorConfig, MockMode};

const DEVICE: &str = "detector";

/// Detector that "writes" one image per exposure time.
///
/// In [`MockMode::Instant`] collections finish immediately. `stop` aborts a
/// collection in progress, which then fails with an "aborted" error.
#[derive(Debug, Default)]
pub struct MockCollector {
    mode: MockMode,
    error_config: ErrorConfig,
    abort: Notify,
    images_written: AtomicU32,
    collections: Mutex<Vec<CollectionParameters>>,
}

impl MockCollector {
    /// Collector with the default faults for `mode`.
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

    /// Images written across all collections.
    pub fn images_written(&self) -> u32 {
        self.images_written.load(Ordering::SeqCst)
    }

    /// Parameters of every collection started, oldest first.
    pub fn collections(&self) -> Vec<CollectionParameters> {
        self.collections.lock().clone()
    }
}

#[async_trait]
impl DataCollector for MockCollector {
    async fn collect(&self, params: &CollectionParameters) -> Result<u32> {
        self.error_config.check_operation(DEVICE, "collect")?;
        self.collections.lock().push(params.clone());
        tracing::info!(
            prefix = %params.prefix,
            run = params.run_number,
            images = params.num_images,
            "Collection started"
        );

        let exposure = if self.mode.is_timed() {
            Duration::from_secs_f64(params.exposure_time.max(0.0))
        } else {
            Duration::ZERO
        };

        for image in 1..=params.num_images {
            if !exposure.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(exposure) => {}
                    _ = self.abort.notified() => {
                        bail!("Collection aborted after {} images", image - 1);
                    }
                }
            }
            self.images_written.fetch_add(1, Ordering::SeqCst);
            tracing::trace!(file = %params.image_file_name(image), "Image written");
        }
        Ok(params.num_images)
    }

    async fn stop(&self) -> Result<()> {
        tracing::info!("Collection stop requested");
        self.abort.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;
    use std::sync::Arc;

    #[tokio::test]
    async fn instant_collection_writes_all_images() {
        let collector = MockCollector::new(MockMode::Instant);
        let params = CollectionParameters {
            num_images: 5,
            ..Default::default()
        };
        assert_eq!(collector.collect(&params).await.unwrap(), 5);
        assert_eq!(collector.images_written(), 5);
        assert_eq!(collector.collections(), vec![params]);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_aborts_a_running_collection() {
        let collector = Arc::new(MockCollector::new(MockMode::Realistic));
        let params = CollectionParameters {
            num_images: 100,
            exposure_time: 1.0,
            ..Default::default()
        };
        let running = {
            let collector = collector.clone();
            tokio::spawn(async move { collector.collect(&params).await })
        };
        tokio::time::sleep(Duration::from_millis(2500)).await;
        collector.stop().await.unwrap();

        let result = running.await.unwrap();
        assert!(result.is_err());
        assert_eq!(collector.images_written(), 2);
    }

    #[tokio::test]
    async fn injected_failure_surfaces() {
        let collector = MockCollector::new(MockMode::Instant).with_error_config(
            ErrorConfig::scenario(ErrorScenario::Fail {
                operation: "collect",
            }),
        );
        assert!(collector
            .collect(&CollectionParameters::default())
            .await
            .is_err());
        assert_eq!(collector.images_written(), 0);
    }
}

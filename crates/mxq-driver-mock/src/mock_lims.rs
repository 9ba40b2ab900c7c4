//! In-memory LIMS.

use anyhow::Result;
use async_trait::async_trait;
use mxq_core::capabilities::{
    DataCollectionGroup, DataCollectionRecord, ImageRecord, LimsClient,
};
use mxq_core::error::{DriverError, DriverErrorKind};
use parking_lot::Mutex;
use std::collections::BTreeMap;

use crate::common::ErrorConfig;

const DEVICE: &str = "lims";

#[derive(Debug, Default)]
struct LimsState {
    next_id: i64,
    groups: BTreeMap<i64, DataCollectionGroup>,
    collections: BTreeMap<i64, DataCollectionRecord>,
    images: Vec<ImageRecord>,
}

impl LimsState {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// LIMS client keeping every record in memory.
#[derive(Debug, Default)]
pub struct MockLims {
    state: Mutex<LimsState>,
    error_config: ErrorConfig,
}

impl MockLims {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty store that injects the given faults.
    pub fn with_error_config(error_config: ErrorConfig) -> Self {
        Self {
            state: Mutex::default(),
            error_config,
        }
    }

    /// Stored data collection groups.
    pub fn groups(&self) -> Vec<DataCollectionGroup> {
        self.state.lock().groups.values().cloned().collect()
    }

    /// Collection record `id`.
    pub fn collection(&self, id: i64) -> Option<DataCollectionRecord> {
        self.state.lock().collections.get(&id).cloned()
    }

    /// All collection records, by id.
    pub fn collections(&self) -> Vec<DataCollectionRecord> {
        self.state.lock().collections.values().cloned().collect()
    }

    /// Image records in storage order.
    pub fn images(&self) -> Vec<ImageRecord> {
        self.state.lock().images.clone()
    }
}

#[async_trait]
impl LimsClient for MockLims {
    async fn store_data_collection_group(&self, group: &DataCollectionGroup) -> Result<i64> {
        self.error_config.check_operation(DEVICE, "store")?;
        let mut state = self.state.lock();
        let id = state.allocate();
        state.groups.insert(id, group.clone());
        tracing::debug!(group_id = id, experiment = %group.experiment_type, "Stored collection group");
        Ok(id)
    }

    async fn update_data_collection(&self, record: &DataCollectionRecord) -> Result<i64> {
        self.error_config.check_operation(DEVICE, "store")?;
        let mut state = self.state.lock();
        if !state.groups.contains_key(&record.group_id) {
            return Err(DriverError::new(
                DEVICE,
                DriverErrorKind::InvalidParameter,
                format!("Unknown collection group {}", record.group_id),
            )
            .into());
        }
        let id = match record.collection_id {
            Some(id) if state.collections.contains_key(&id) => id,
            Some(id) => {
                return Err(DriverError::new(
                    DEVICE,
                    DriverErrorKind::InvalidParameter,
                    format!("Unknown data collection {}", id),
                )
                .into())
            }
            None => state.allocate(),
        };
        let mut stored = record.clone();
        stored.collection_id = Some(id);
        state.collections.insert(id, stored);
        tracing::debug!(collection_id = id, status = %record.status, "Stored data collection");
        Ok(id)
    }

    async fn store_image(&self, image: &ImageRecord) -> Result<()> {
        self.error_config.check_operation(DEVICE, "store")?;
        let mut state = self.state.lock();
        if !state.collections.contains_key(&image.collection_id) {
            return Err(DriverError::new(
                DEVICE,
                DriverErrorKind::InvalidParameter,
                format!("Unknown data collection {}", image.collection_id),
            )
            .into());
        }
        state.images.push(image.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_created_then_updated_in_place() {
        let lims = MockLims::new();
        let group_id = lims
            .store_data_collection_group(&DataCollectionGroup {
                experiment_type: "OSC".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut record = DataCollectionRecord {
            group_id,
            status: "Running".into(),
            num_images: 10,
            ..Default::default()
        };
        let id = lims.update_data_collection(&record).await.unwrap();

        record.collection_id = Some(id);
        record.status = "Data collection successful".into();
        assert_eq!(lims.update_data_collection(&record).await.unwrap(), id);

        assert_eq!(lims.collections().len(), 1);
        assert_eq!(
            lims.collection(id).unwrap().status,
            "Data collection successful"
        );
    }

    #[tokio::test]
    async fn dangling_references_are_rejected() {
        let lims = MockLims::new();
        let record = DataCollectionRecord {
            group_id: 99,
            ..Default::default()
        };
        assert!(lims.update_data_collection(&record).await.is_err());
        let image = ImageRecord {
            collection_id: 5,
            image_number: 1,
            file_name: "x.cbf".into(),
        };
        assert!(lims.store_image(&image).await.is_err());
        assert!(lims.images().is_empty());
    }
}

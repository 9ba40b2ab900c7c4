//! Entry handlers.
//!
//! Each [`EntryKindTag`] maps to one [`EntryHandler`] in a
//! [`HandlerRegistry`]. [`HandlerRegistry::standard`] holds the beamline
//! handlers below; any of them can be replaced with
//! [`register`](HandlerRegistry::register).

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use mxq_core::capabilities::{
    CollectionParameters, DataCollectionGroup, DataCollectionRecord, ImageRecord, LimsClient,
    WorkflowOutcome,
};
use mxq_core::types::Phase;
use mxq_diffractometer::Diffractometer;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::ExecutionContext;
use crate::entry::{EntryKind, EntryKindTag, QueueEntry};
use crate::error::QueueError;

/// What running an entry of one kind does.
#[async_trait]
pub trait EntryHandler: Send + Sync {
    /// Body of the entry. Children run after this returns `Ok`.
    async fn execute(&self, entry: &QueueEntry, ctx: &ExecutionContext) -> Result<(), QueueError>;

    /// Interrupt the entry's work in progress. Called when the queue is
    /// stopped while the entry is active.
    async fn stop(&self, _entry: &QueueEntry, _ctx: &ExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Lookup table from entry kind to handler.
#[derive(Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<EntryKindTag, Arc<dyn EntryHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl HandlerRegistry {
    /// Registry with no handlers.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the beamline handler for every kind.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(EntryKindTag::Sample, SampleHandler);
        registry.register(EntryKindTag::Basket, ContainerHandler);
        registry.register(EntryKindTag::TaskGroup, TaskGroupHandler);
        registry.register(EntryKindTag::DataCollection, DataCollectionHandler);
        registry.register(EntryKindTag::Centring, CentringHandler);
        registry.register(EntryKindTag::Workflow, WorkflowHandler);
        registry.register(EntryKindTag::Delay, DelayHandler);
        registry
    }

    /// Install `handler` for `tag`, replacing the previous one.
    pub fn register<H: EntryHandler + 'static>(&mut self, tag: EntryKindTag, handler: H) {
        self.register_arc(tag, Arc::new(handler));
    }

    /// Install an already shared handler for `tag`.
    pub fn register_arc(&mut self, tag: EntryKindTag, handler: Arc<dyn EntryHandler>) {
        self.handlers.insert(tag, handler);
    }

    /// Handler for `tag`, if one is registered.
    pub fn get(&self, tag: EntryKindTag) -> Option<Arc<dyn EntryHandler>> {
        self.handlers.get(&tag).cloned()
    }
}

fn diffractometer(ctx: &ExecutionContext) -> Result<&Diffractometer, QueueError> {
    ctx.beamline
        .diffractometer
        .as_ref()
        .ok_or_else(|| QueueError::execution("no diffractometer configured"))
}

fn wrong_kind(entry: &QueueEntry) -> QueueError {
    QueueError::Fatal(anyhow!(
        "handler called for {:?} entry '{}'",
        entry.tag(),
        entry.name()
    ))
}

// =============================================================================
// Sample and containers
// =============================================================================

/// Mounts the sample and brings the diffractometer to the centring phase.
pub struct SampleHandler;

#[async_trait]
impl EntryHandler for SampleHandler {
    async fn execute(
        &self,
        entry: &QueueEntry,
        ctx: &ExecutionContext,
    ) -> Result<(), QueueError> {
        let EntryKind::Sample(sample) = entry.kind() else {
            return Err(wrong_kind(entry));
        };
        match (&sample.location, &ctx.beamline.sample_changer) {
            (Some(location), Some(changer)) => {
                info!(sample = %sample.name, %location, "Mounting sample");
                changer
                    .load(location)
                    .await
                    .map_err(|e| QueueError::execution(format!("sample mount failed: {:#}", e)))?;
            }
            (Some(location), None) => {
                return Err(QueueError::skip(format!(
                    "no sample changer to mount {}",
                    location
                )));
            }
            (None, _) => debug!(sample = %sample.name, "Manually mounted sample"),
        }
        ctx.run_state.lock().loaded_sample = Some(sample.name.clone());

        if let Some(diffractometer) = &ctx.beamline.diffractometer {
            diffractometer
                .set_phase(Phase::Centring, Some(ctx.phase_timeout))
                .await
                .map_err(QueueError::execution)?;
        }
        Ok(())
    }
}

/// Baskets only group samples.
pub struct ContainerHandler;

#[async_trait]
impl EntryHandler for ContainerHandler {
    async fn execute(
        &self,
        entry: &QueueEntry,
        _ctx: &ExecutionContext,
    ) -> Result<(), QueueError> {
        debug!(entry = %entry.name(), "Container entry");
        Ok(())
    }
}

/// Opens a LIMS data-collection group for the collections below it.
pub struct TaskGroupHandler;

#[async_trait]
impl EntryHandler for TaskGroupHandler {
    async fn execute(
        &self,
        entry: &QueueEntry,
        ctx: &ExecutionContext,
    ) -> Result<(), QueueError> {
        info!(group = %entry.name(), "Task group");
        let group_id = match &ctx.beamline.lims {
            Some(lims) => Some(store_group(lims.as_ref()).await?),
            None => None,
        };
        ctx.run_state.lock().group_id = group_id;
        Ok(())
    }
}

async fn store_group(lims: &dyn LimsClient) -> Result<i64, QueueError> {
    let group = DataCollectionGroup {
        experiment_type: "OSC".to_string(),
        start_time: Utc::now().to_rfc3339(),
        ..Default::default()
    };
    lims.store_data_collection_group(&group)
        .await
        .map_err(|e| QueueError::execution(format!("LIMS group not stored: {:#}", e)))
}

// =============================================================================
// Centring
// =============================================================================

/// Runs a diffractometer centring and records the centred position.
pub struct CentringHandler;

#[async_trait]
impl EntryHandler for CentringHandler {
    async fn execute(
        &self,
        entry: &QueueEntry,
        ctx: &ExecutionContext,
    ) -> Result<(), QueueError> {
        let EntryKind::Centring(params) = entry.kind() else {
            return Err(wrong_kind(entry));
        };
        let diffractometer = diffractometer(ctx)?;
        diffractometer
            .set_phase(Phase::Centring, Some(ctx.phase_timeout))
            .await
            .map_err(QueueError::execution)?;

        if params.wait_for_user {
            diffractometer
                .start_centring_method(params.method, false)
                .await
                .map_err(QueueError::execution)?;
            warn!(method = %params.method, "Waiting for the user to centre the sample");
            ctx.control.pause(true).await;
        } else {
            diffractometer
                .start_centring_method(params.method, true)
                .await
                .map_err(QueueError::execution)?;
        }

        let status = diffractometer.centring_status();
        if !status.valid {
            return Err(QueueError::execution("no valid centred position"));
        }
        diffractometer
            .accept_centring()
            .map_err(QueueError::execution)?;
        info!(method = %params.method, "Centred position recorded");
        ctx.run_state.lock().centred_position = Some(status.motors);
        Ok(())
    }

    async fn stop(&self, _entry: &QueueEntry, ctx: &ExecutionContext) -> anyhow::Result<()> {
        if let Some(diffractometer) = &ctx.beamline.diffractometer {
            diffractometer.cancel_centring_method(false);
        }
        Ok(())
    }
}

// =============================================================================
// Data collection
// =============================================================================

/// Moves to the centred position, collects and records the collection in
/// the LIMS.
pub struct DataCollectionHandler;

impl DataCollectionHandler {
    async fn record(
        lims: &dyn LimsClient,
        record: &DataCollectionRecord,
    ) -> Result<i64, QueueError> {
        lims.update_data_collection(record)
            .await
            .map_err(|e| QueueError::execution(format!("LIMS update failed: {:#}", e)))
    }

    async fn store_images(
        lims: &dyn LimsClient,
        collection_id: i64,
        params: &CollectionParameters,
        images: u32,
    ) -> Result<(), QueueError> {
        for number in 1..=images {
            let image = ImageRecord {
                collection_id,
                image_number: number,
                file_name: params.image_file_name(number),
            };
            lims.store_image(&image)
                .await
                .map_err(|e| QueueError::execution(format!("LIMS image not stored: {:#}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl EntryHandler for DataCollectionHandler {
    async fn execute(
        &self,
        entry: &QueueEntry,
        ctx: &ExecutionContext,
    ) -> Result<(), QueueError> {
        let EntryKind::DataCollection(params) = entry.kind() else {
            return Err(wrong_kind(entry));
        };
        let collector = ctx
            .beamline
            .collector
            .clone()
            .ok_or_else(|| QueueError::execution("no data collector configured"))?;

        let centred_position = ctx.run_state.lock().centred_position.clone();
        if let Some(diffractometer) = &ctx.beamline.diffractometer {
            diffractometer
                .set_phase(Phase::DataCollection, Some(ctx.phase_timeout))
                .await
                .map_err(QueueError::execution)?;
            if let Some(position) = &centred_position {
                diffractometer
                    .move_to_motors_positions(position.clone(), true)
                    .await
                    .map_err(QueueError::execution)?;
            }
        }

        let mut record = None;
        if let Some(lims) = &ctx.beamline.lims {
            let existing = ctx.run_state.lock().group_id;
            let group_id = match existing {
                Some(id) => id,
                None => {
                    let id = store_group(lims.as_ref()).await?;
                    ctx.run_state.lock().group_id = Some(id);
                    id
                }
            };
            let mut created = DataCollectionRecord {
                collection_id: None,
                group_id,
                status: "Running".to_string(),
                osc_start: params.osc_start,
                osc_range: params.osc_range,
                num_images: params.num_images,
                exposure_time: params.exposure_time,
                centred_position: centred_position.clone(),
            };
            created.collection_id = Some(Self::record(lims.as_ref(), &created).await?);
            record = Some(created);
        }

        info!(
            entry = %entry.name(),
            position = ?entry.in_queue(),
            images = params.num_images,
            "Collecting"
        );
        let collected = collector.collect(params).await;

        if let (Some(lims), Some(mut record)) = (&ctx.beamline.lims, record) {
            let collection_id = record.collection_id.unwrap_or_default();
            record.status = match &collected {
                Ok(_) => "Data collection successful".to_string(),
                Err(e) => format!("Data collection failed: {:#}", e),
            };
            Self::record(lims.as_ref(), &record).await?;
            if let Ok(images) = collected.as_ref() {
                Self::store_images(lims.as_ref(), collection_id, params, *images).await?;
            }
        }

        let images = collected
            .map_err(|e| QueueError::execution(format!("collection failed: {:#}", e)))?;
        info!(entry = %entry.name(), images, "Collection finished");
        Ok(())
    }

    async fn stop(&self, _entry: &QueueEntry, ctx: &ExecutionContext) -> anyhow::Result<()> {
        if let Some(collector) = &ctx.beamline.collector {
            collector.stop().await?;
        }
        Ok(())
    }
}

// =============================================================================
// Workflow and delay
// =============================================================================

/// Hands the entry to the workflow engine.
pub struct WorkflowHandler;

#[async_trait]
impl EntryHandler for WorkflowHandler {
    async fn execute(
        &self,
        entry: &QueueEntry,
        ctx: &ExecutionContext,
    ) -> Result<(), QueueError> {
        let EntryKind::Workflow(workflow) = entry.kind() else {
            return Err(wrong_kind(entry));
        };
        let runner = ctx
            .beamline
            .workflow
            .clone()
            .ok_or_else(|| QueueError::execution("no workflow engine configured"))?;

        info!(workflow = %workflow.name, "Starting workflow");
        match runner.run(&workflow.name, &workflow.params).await? {
            WorkflowOutcome::Finished => Ok(()),
            WorkflowOutcome::NeedsUserInput(message) => {
                warn!(workflow = %workflow.name, %message, "Workflow waiting for user input");
                ctx.control.pause(true).await;
                Ok(())
            }
            WorkflowOutcome::Failed(reason) => Err(QueueError::execution(format!(
                "workflow {} failed: {}",
                workflow.name, reason
            ))),
        }
    }

    async fn stop(&self, _entry: &QueueEntry, ctx: &ExecutionContext) -> anyhow::Result<()> {
        if let Some(runner) = &ctx.beamline.workflow {
            runner.abort().await?;
        }
        Ok(())
    }
}

/// Waits for the entry's duration.
pub struct DelayHandler;

#[async_trait]
impl EntryHandler for DelayHandler {
    async fn execute(
        &self,
        entry: &QueueEntry,
        _ctx: &ExecutionContext,
    ) -> Result<(), QueueError> {
        let EntryKind::Delay(duration) = entry.kind() else {
            return Err(wrong_kind(entry));
        };
        debug!(?duration, "Delay");
        tokio::time::sleep(*duration).await;
        Ok(())
    }
}

//! Queue manager.
//!
//! Runs the entry tree depth first in one background task. An entry's
//! handler body runs first, then its children in order, then the entry is
//! released (`post_execute`) and its outcome published.
//!
//! # State Machine
//!
//! ```text
//! ┌──────┐  execute()  ┌─────────┐  finished   ┌──────┐
//! │ Idle │────────────▶│ Running │────────────▶│ Idle │
//! └──────┘             └────┬────┘             └──────┘
//!                           │ stop() / abort / failure
//!                           ▼
//!                      ┌─────────┐
//!                      │ Stopped │
//!                      └─────────┘
//! ```
//!
//! Pausing closes a gate checked before each entry starts; an entry already
//! running is never interrupted by it.

use anyhow::anyhow;
use futures::future::BoxFuture;
use mxq_core::config::Settings;
use mxq_core::events::EventBus;
use mxq_core::task::{TaskHandle, TaskKiller};
use mxq_core::TaskError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::context::{Beamline, ExecutionContext, QueueControl, RunState};
use crate::entry::{find_in, swap_in, walk, EntryKindTag, EntryRef, EntryStatus};
use crate::error::{EntryOutcome, ManagerError, QueueError};
use crate::events::QueueEvent;
use crate::handlers::HandlerRegistry;

/// Lifecycle of the queue as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Nothing running; the last run (if any) completed.
    Idle,
    /// A run is in progress.
    Running,
    /// The last run was stopped, aborted or failed.
    Stopped,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueState::Idle => write!(f, "idle"),
            QueueState::Running => write!(f, "running"),
            QueueState::Stopped => write!(f, "stopped"),
        }
    }
}

struct RunSlot {
    /// Active chain, outermost first.
    current: Vec<EntryRef>,
    run: Option<TaskKiller>,
    disabled: bool,
}

struct ManagerInner {
    root: Mutex<Vec<EntryRef>>,
    slot: Mutex<RunSlot>,
    state: watch::Sender<QueueState>,
    stopped: AtomicBool,
    control: QueueControl,
    events: EventBus<QueueEvent>,
    handlers: HandlerRegistry,
    ctx: ExecutionContext,
}

/// Scheduler owning the root entry list. Clones share the same queue.
#[derive(Clone)]
pub struct QueueManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("state", &self.state())
            .field("entries", &self.inner.root.lock().len())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Removes an entry from the active chain when its execution ends,
/// including when the run task is killed.
struct CurrentGuard<'a> {
    inner: &'a ManagerInner,
    id: String,
}

impl Drop for CurrentGuard<'_> {
    fn drop(&mut self) {
        self.inner.slot.lock().current.retain(|e| e.id() != self.id);
    }
}

impl QueueManager {
    /// Manager with the standard handlers.
    pub fn new(beamline: Beamline, settings: &Settings) -> Self {
        Self::with_handlers(beamline, settings, HandlerRegistry::standard())
    }

    /// Manager dispatching entries through `handlers`.
    ///
    /// Tests use this to register recording or failing handlers.
    pub fn with_handlers(
        beamline: Beamline,
        settings: &Settings,
        handlers: HandlerRegistry,
    ) -> Self {
        let events = EventBus::new(settings.queue.event_capacity);
        let control = QueueControl::new(events.clone());
        let (state, _) = watch::channel(QueueState::Idle);
        let ctx = ExecutionContext {
            beamline,
            run_state: Arc::new(Mutex::new(RunState::default())),
            control: control.clone(),
            phase_timeout: settings.diffractometer.phase_timeout(),
        };
        Self {
            inner: Arc::new(ManagerInner {
                root: Mutex::new(Vec::new()),
                slot: Mutex::new(RunSlot {
                    current: Vec::new(),
                    run: None,
                    disabled: false,
                }),
                state,
                stopped: AtomicBool::new(false),
                control,
                events,
                handlers,
                ctx,
            }),
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Receive queue notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> QueueState {
        *self.inner.state.borrow()
    }

    /// Without an id: whether a run is in progress. With one: whether that
    /// entry is on the active chain.
    pub fn is_executing(&self, node_id: Option<&str>) -> bool {
        match node_id {
            None => self.inner.is_running(),
            Some(id) => self.inner.slot.lock().current.iter().any(|e| e.id() == id),
        }
    }

    /// Innermost active entry.
    pub fn current_entry(&self) -> Option<EntryRef> {
        self.inner.slot.lock().current.last().cloned()
    }

    /// Sample and collection bookkeeping of the current run.
    pub fn run_state(&self) -> RunState {
        self.inner.ctx.run_state.lock().clone()
    }

    /// Wait until no run is in progress.
    pub async fn wait_until_idle(&self) -> QueueState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|s| *s != QueueState::Running).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    // =========================================================================
    // Pause and disable
    // =========================================================================

    /// Pause gate shared with the handlers.
    pub fn control(&self) -> &QueueControl {
        &self.inner.control
    }

    /// True while the pause gate is closed.
    pub fn is_paused(&self) -> bool {
        self.inner.control.is_paused()
    }

    /// Close or open the pause gate without waiting.
    pub fn set_pause(&self, paused: bool) {
        self.inner.control.set_pause(paused);
    }

    /// Pausing waits until the queue is resumed or stopped.
    pub async fn pause(&self, paused: bool) {
        self.inner.control.pause(paused).await;
    }

    /// Refuse new runs while disabled. A run in progress continues.
    pub fn disable(&self, disabled: bool) {
        self.inner.slot.lock().disabled = disabled;
    }

    /// True while new runs are refused.
    pub fn is_disabled(&self) -> bool {
        self.inner.slot.lock().disabled
    }

    // =========================================================================
    // Root list
    // =========================================================================

    /// Snapshot of the top-level entries, in execution order.
    pub fn entries(&self) -> Vec<EntryRef> {
        self.inner.root.lock().clone()
    }

    /// Append `entry` to the root list. Refused during a run.
    pub fn enqueue(&self, entry: EntryRef) -> Result<(), ManagerError> {
        self.ensure_idle()?;
        debug!(entry = %entry.name(), id = %entry.id(), "Enqueued");
        self.inner.root.lock().push(entry);
        Ok(())
    }

    /// Remove entry `id` from wherever it sits in the tree.
    pub fn dequeue(&self, id: &str) -> Result<EntryRef, ManagerError> {
        self.ensure_idle()?;
        {
            let mut root = self.inner.root.lock();
            if let Some(index) = root.iter().position(|e| e.id() == id) {
                return Ok(root.remove(index));
            }
        }
        self.find(id)
            .and_then(|entry| entry.parent())
            .and_then(|parent| parent.dequeue(id))
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))
    }

    /// Exchange two siblings.
    pub fn swap(&self, a: &str, b: &str) -> Result<(), ManagerError> {
        self.ensure_idle()?;
        if swap_in(&mut self.inner.root.lock(), a, b) {
            return Ok(());
        }
        let parent = self
            .find(a)
            .and_then(|entry| entry.parent())
            .ok_or_else(|| ManagerError::NotFound(a.to_string()))?;
        if parent.swap(a, b) {
            Ok(())
        } else {
            Err(ManagerError::NotFound(b.to_string()))
        }
    }

    /// Entry `id` anywhere in the tree.
    pub fn find(&self, id: &str) -> Option<EntryRef> {
        find_in(&self.entries(), id)
    }

    /// Empty the root list.
    pub fn clear(&self) -> Result<(), ManagerError> {
        self.ensure_idle()?;
        self.inner.root.lock().clear();
        info!("Queue cleared");
        Ok(())
    }

    /// Make every entry executable again.
    pub fn reset(&self) -> Result<(), ManagerError> {
        self.ensure_idle()?;
        for entry in self.entries() {
            entry.reset();
        }
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), ManagerError> {
        if self.inner.is_running() {
            Err(ManagerError::Busy)
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Start a run in the background: the whole root list, or only the
    /// subtree of `entry`.
    pub fn execute(&self, entry: Option<EntryRef>) -> Result<(), ManagerError> {
        let full_run = entry.is_none();
        let entries = match entry {
            Some(entry) => vec![entry],
            None => self.entries(),
        };

        let mut slot = self.inner.slot.lock();
        if slot.disabled {
            return Err(ManagerError::Disabled);
        }
        if self.inner.is_running() {
            return Err(ManagerError::AlreadyRunning);
        }
        if full_run {
            annotate_in_queue(&entries);
        }
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.inner.state.send_replace(QueueState::Running);
        self.inner.events.emit(QueueEvent::ExecuteStarted);
        info!(entries = entries.len(), full_run, "Queue execution started");

        let inner = self.inner.clone();
        let run = TaskHandle::spawn("queue_run", async move { inner.run(entries).await });
        slot.run = Some(run.killer());
        let inner = self.inner.clone();
        run.link(move |result| async move { inner.run_finished(result) });
        Ok(())
    }

    /// Run a single entry and its children.
    pub fn execute_entry(&self, entry: EntryRef) -> Result<(), ManagerError> {
        self.execute(Some(entry))
    }

    /// Stop the run in progress.
    ///
    /// Every entry on the active chain is marked failed, reported aborted,
    /// asked to stop and released; then the run task is killed.
    pub async fn stop(&self) {
        let (chain, run) = {
            let mut slot = self.inner.slot.lock();
            if !self.inner.is_running() {
                debug!("Stop requested while not running");
                return;
            }
            self.inner.stopped.store(true, Ordering::SeqCst);
            (std::mem::take(&mut slot.current), slot.run.take())
        };
        warn!(active = chain.len(), "Stopping queue");
        if let Some(run) = &run {
            run.kill();
        }

        for entry in chain.iter().rev() {
            entry.set_status(EntryStatus::Failed);
            self.inner.events.emit(QueueEvent::EntryFinished {
                id: entry.id().to_string(),
                name: entry.name(),
                outcome: EntryOutcome::Aborted,
            });
            if let Some(handler) = self.inner.handlers.get(entry.tag()) {
                if let Err(e) = handler.stop(entry, &self.inner.ctx).await {
                    warn!(entry = %entry.name(), error = %e, "Entry stop failed");
                }
            }
            entry.post_execute();
        }

        {
            let _slot = self.inner.slot.lock();
            self.inner.state.send_replace(QueueState::Stopped);
        }
        self.inner.control.set_pause(false);
        self.inner.events.emit(QueueEvent::Stopped);
        info!("Queue stopped");
    }
}

impl ManagerInner {
    fn is_running(&self) -> bool {
        *self.state.borrow() == QueueState::Running
    }

    async fn run(self: Arc<Self>, entries: Vec<EntryRef>) -> Result<(), QueueError> {
        for entry in entries {
            self.run_entry(entry).await?;
        }
        Ok(())
    }

    fn run_finished(&self, result: Result<Result<(), QueueError>, TaskError>) {
        let mut slot = self.slot.lock();
        slot.run = None;
        slot.current.clear();

        let next = match &result {
            Ok(Ok(())) if self.stopped.load(Ordering::SeqCst) => None,
            Ok(Ok(())) => {
                info!("Queue execution finished");
                Some(QueueState::Idle)
            }
            Ok(Err(e)) if e.outcome() == EntryOutcome::Aborted => {
                warn!(reason = %e, "Queue aborted");
                Some(QueueState::Stopped)
            }
            Ok(Err(e)) => {
                error!(error = %e, "Queue execution failed");
                Some(QueueState::Stopped)
            }
            // stop() performs the transition
            Err(TaskError::Killed(_)) => None,
            Err(e) => {
                error!(error = %e, "Queue task failed");
                Some(QueueState::Stopped)
            }
        };

        if let Some(state) = next {
            self.state.send_replace(state);
            if state == QueueState::Stopped {
                self.control.set_pause(false);
                self.events.emit(QueueEvent::Stopped);
            }
        }
        self.events.emit(QueueEvent::ExecutionFinished);
    }

    fn enter<'a>(&'a self, entry: &EntryRef) -> CurrentGuard<'a> {
        self.slot.lock().current.push(entry.clone());
        CurrentGuard {
            inner: self,
            id: entry.id().to_string(),
        }
    }

    /// Depth-first execution of one entry.
    fn run_entry<'a>(
        self: &'a Arc<Self>,
        entry: EntryRef,
    ) -> BoxFuture<'a, Result<(), QueueError>> {
        Box::pin(async move {
            if !entry.is_enabled() || self.stopped.load(Ordering::SeqCst) {
                debug!(entry = %entry.name(), "Entry not executed");
                return Ok(());
            }
            self.events.emit(QueueEvent::EntryStarted {
                id: entry.id().to_string(),
                name: entry.name(),
            });
            let _current = self.enter(&entry);

            if self.control.is_paused() {
                info!(entry = %entry.name(), "Queue paused before entry");
                self.control.wait_resumed().await;
            }

            entry.set_status(EntryStatus::Running);
            entry.pre_execute();
            debug!(entry = %entry.name(), kind = ?entry.tag(), "Executing entry");
            let result = self.execute_body(&entry).await;

            let outcome = match &result {
                Ok(()) => EntryOutcome::Success,
                Err(e) => e.outcome(),
            };
            entry.set_status(match outcome {
                EntryOutcome::Success => EntryStatus::Success,
                EntryOutcome::Skipped => EntryStatus::Skipped,
                EntryOutcome::Aborted | EntryOutcome::Failed => EntryStatus::Failed,
            });
            entry.post_execute();
            self.events.emit(QueueEvent::EntryFinished {
                id: entry.id().to_string(),
                name: entry.name(),
                outcome,
            });

            match result {
                Ok(()) => {
                    info!(entry = %entry.name(), "Entry finished");
                    Ok(())
                }
                Err(e) if outcome == EntryOutcome::Skipped => {
                    warn!(entry = %entry.name(), reason = %e, "Entry skipped");
                    Ok(())
                }
                Err(e) if outcome == EntryOutcome::Aborted => {
                    warn!(entry = %entry.name(), reason = %e, "Entry aborted");
                    Err(e)
                }
                Err(e) => {
                    error!(entry = %entry.name(), error = %e, "Entry failed");
                    Err(e)
                }
            }
        })
    }

    /// Handler body, then the children in order.
    async fn execute_body(self: &Arc<Self>, entry: &EntryRef) -> Result<(), QueueError> {
        let handler = self
            .handlers
            .get(entry.tag())
            .ok_or_else(|| anyhow!("no handler for {:?} entries", entry.tag()))?;
        handler.execute(entry, &self.ctx).await?;
        for child in entry.children() {
            self.run_entry(child).await?;
        }
        Ok(())
    }
}

/// Number the enabled, not yet executed data collections in run order.
fn annotate_in_queue(entries: &[EntryRef]) {
    let mut position = 0;
    for entry in walk(entries) {
        let eligible = entry.tag() == EntryKindTag::DataCollection
            && entry.is_enabled()
            && entry.status() == EntryStatus::NotExecuted;
        entry.set_in_queue(eligible.then(|| {
            position += 1;
            position - 1
        }));
    }
}

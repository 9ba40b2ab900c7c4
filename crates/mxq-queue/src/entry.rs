//! Queue entries.
//!
//! A [`QueueEntry`] is one node of the experiment plan. Entries own their
//! children (insertion order is execution order) and keep a weak link to
//! their parent. The node's parameters are an [`EntryKind`]; what running
//! it does is decided by the handler registered for its [`EntryKindTag`].

use mxq_core::capabilities::CollectionParameters;
use mxq_core::types::new_uid;
use mxq_diffractometer::CentringMethod;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Shared handle to an entry.
pub type EntryRef = Arc<QueueEntry>;

/// Execution status of an entry within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EntryStatus {
    /// Not run yet, or passed over because it is disabled.
    #[default]
    NotExecuted,
    /// Executing now, or one of its children is.
    Running,
    /// Finished normally.
    Success,
    /// Raised an error, or was stopped while running.
    Failed,
    /// Abandoned with a skip; the run went on.
    Skipped,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntryStatus::NotExecuted => "NOT_EXECUTED",
            EntryStatus::Running => "RUNNING",
            EntryStatus::Success => "SUCCESS",
            EntryStatus::Failed => "FAILED",
            EntryStatus::Skipped => "SKIPPED",
        };
        f.write_str(name)
    }
}

/// Sample to mount before its children run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleParameters {
    /// Sample name as shown to the user.
    pub name: String,
    /// Sample changer location (`"basket:position"`); None for a manually
    /// mounted sample.
    pub location: Option<String>,
}

/// Centring to run on the mounted sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CentringParameters {
    /// How to centre.
    pub method: CentringMethod,
    /// Start the centring, then pause the queue until the user has finished
    /// and resumes it.
    pub wait_for_user: bool,
}

/// Named workflow and its free-form parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowParameters {
    /// Workflow name, passed to the workflow runner.
    pub name: String,
    /// Parameters forwarded untouched.
    pub params: serde_json::Value,
}

/// Parameters of an entry, one variant per kind of work.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryKind {
    /// Mount a sample; children run on it.
    Sample(SampleParameters),
    /// Grouping of samples from one basket.
    Basket {
        /// Basket label.
        name: String,
    },
    /// Grouping of tasks on one sample.
    TaskGroup {
        /// Group label.
        name: String,
    },
    /// Collect a dataset.
    DataCollection(CollectionParameters),
    /// Centre the sample on the beam.
    Centring(CentringParameters),
    /// Hand over to an external workflow.
    Workflow(WorkflowParameters),
    /// Wait, honouring pause and stop.
    Delay(Duration),
}

/// Kind discriminant used to look up handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKindTag {
    /// [`EntryKind::Sample`]
    Sample,
    /// [`EntryKind::Basket`]
    Basket,
    /// [`EntryKind::TaskGroup`]
    TaskGroup,
    /// [`EntryKind::DataCollection`]
    DataCollection,
    /// [`EntryKind::Centring`]
    Centring,
    /// [`EntryKind::Workflow`]
    Workflow,
    /// [`EntryKind::Delay`]
    Delay,
}

impl EntryKindTag {
    /// Every tag, in declaration order.
    pub const ALL: [EntryKindTag; 7] = [
        EntryKindTag::Sample,
        EntryKindTag::Basket,
        EntryKindTag::TaskGroup,
        EntryKindTag::DataCollection,
        EntryKindTag::Centring,
        EntryKindTag::Workflow,
        EntryKindTag::Delay,
    ];
}

impl EntryKind {
    /// Discriminant of this kind.
    pub fn tag(&self) -> EntryKindTag {
        match self {
            EntryKind::Sample(_) => EntryKindTag::Sample,
            EntryKind::Basket { .. } => EntryKindTag::Basket,
            EntryKind::TaskGroup { .. } => EntryKindTag::TaskGroup,
            EntryKind::DataCollection(_) => EntryKindTag::DataCollection,
            EntryKind::Centring(_) => EntryKindTag::Centring,
            EntryKind::Workflow(_) => EntryKindTag::Workflow,
            EntryKind::Delay(_) => EntryKindTag::Delay,
        }
    }

    /// Display name.
    pub fn name(&self) -> String {
        match self {
            EntryKind::Sample(sample) => sample.name.clone(),
            EntryKind::Basket { name } | EntryKind::TaskGroup { name } => name.clone(),
            EntryKind::DataCollection(params) => {
                format!("{}_{}", params.prefix, params.run_number)
            }
            EntryKind::Centring(params) => params.method.as_str().to_string(),
            EntryKind::Workflow(workflow) => workflow.name.clone(),
            EntryKind::Delay(delay) => format!("Delay {:?}", delay),
        }
    }
}

/// Data-model bookkeeping toggled by the execution hooks.
#[derive(Debug, Clone, Copy, Default)]
struct ModelFlags {
    running: bool,
    executed: bool,
}

#[derive(Debug)]
struct EntryState {
    status: EntryStatus,
    enabled: bool,
    children: Vec<EntryRef>,
    parent: Weak<QueueEntry>,
    in_queue: Option<usize>,
    model: ModelFlags,
    /// Set by `post_execute`, cleared by `pre_execute`.
    released: bool,
}

/// One node of the experiment plan.
#[derive(Debug)]
pub struct QueueEntry {
    id: String,
    kind: EntryKind,
    state: Mutex<EntryState>,
}

impl QueueEntry {
    /// New detached entry with a fresh id, enabled and not executed.
    pub fn new(kind: EntryKind) -> EntryRef {
        Arc::new(Self {
            id: new_uid(),
            kind,
            state: Mutex::new(EntryState {
                status: EntryStatus::NotExecuted,
                enabled: true,
                children: Vec::new(),
                parent: Weak::new(),
                in_queue: None,
                model: ModelFlags::default(),
                released: false,
            }),
        })
    }

    /// Sample entry; `location` is the sample changer position.
    pub fn sample(name: impl Into<String>, location: Option<&str>) -> EntryRef {
        Self::new(EntryKind::Sample(SampleParameters {
            name: name.into(),
            location: location.map(str::to_string),
        }))
    }

    /// Basket group entry.
    pub fn basket(name: impl Into<String>) -> EntryRef {
        Self::new(EntryKind::Basket { name: name.into() })
    }

    /// Task group entry.
    pub fn task_group(name: impl Into<String>) -> EntryRef {
        Self::new(EntryKind::TaskGroup { name: name.into() })
    }

    /// Data collection entry.
    pub fn data_collection(params: CollectionParameters) -> EntryRef {
        Self::new(EntryKind::DataCollection(params))
    }

    /// Centring entry that does not wait for the user.
    pub fn centring(method: CentringMethod) -> EntryRef {
        Self::new(EntryKind::Centring(CentringParameters {
            method,
            wait_for_user: false,
        }))
    }

    /// Workflow entry.
    pub fn workflow(name: impl Into<String>, params: serde_json::Value) -> EntryRef {
        Self::new(EntryKind::Workflow(WorkflowParameters {
            name: name.into(),
            params,
        }))
    }

    /// Delay entry.
    pub fn delay(duration: Duration) -> EntryRef {
        Self::new(EntryKind::Delay(duration))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Unique id, assigned at creation.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parameters of this entry.
    pub fn kind(&self) -> &EntryKind {
        &self.kind
    }

    /// Handler lookup key.
    pub fn tag(&self) -> EntryKindTag {
        self.kind.tag()
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.kind.name()
    }

    /// Status in the current (or last) run.
    pub fn status(&self) -> EntryStatus {
        self.state.lock().status
    }

    pub(crate) fn set_status(&self, status: EntryStatus) {
        self.state.lock().status = status;
    }

    /// Disabled entries are passed over with their whole subtree.
    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    /// Enable or disable the entry.
    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    /// True between `pre_execute` and `post_execute`.
    pub fn is_running(&self) -> bool {
        self.state.lock().model.running
    }

    /// True once `post_execute` has run.
    pub fn is_executed(&self) -> bool {
        self.state.lock().model.executed
    }

    /// Position among the data collections of the current full run.
    pub fn in_queue(&self) -> Option<usize> {
        self.state.lock().in_queue
    }

    pub(crate) fn set_in_queue(&self, position: Option<usize>) {
        self.state.lock().in_queue = position;
    }

    /// Parent entry, None at the top level or once detached.
    pub fn parent(&self) -> Option<EntryRef> {
        self.state.lock().parent.upgrade()
    }

    /// Snapshot of the children, in execution order.
    pub fn children(&self) -> Vec<EntryRef> {
        self.state.lock().children.clone()
    }

    /// True if `self` is `other` or one of its ancestors.
    pub fn is_ancestor_of(&self, other: &QueueEntry) -> bool {
        if self.id == other.id {
            return true;
        }
        let mut next = other.parent();
        while let Some(entry) = next {
            if entry.id == self.id {
                return true;
            }
            next = entry.parent();
        }
        false
    }

    // =========================================================================
    // Container operations
    // =========================================================================

    /// Append `child`, taking ownership of it.
    pub fn enqueue(self: &Arc<Self>, child: EntryRef) {
        child.state.lock().parent = Arc::downgrade(self);
        self.state.lock().children.push(child);
    }

    /// Remove the direct child `id`.
    pub fn dequeue(&self, id: &str) -> Option<EntryRef> {
        let mut state = self.state.lock();
        let index = state.children.iter().position(|c| c.id == id)?;
        let child = state.children.remove(index);
        drop(state);
        child.state.lock().parent = Weak::new();
        Some(child)
    }

    /// Exchange the positions of two direct children.
    pub fn swap(&self, a: &str, b: &str) -> bool {
        swap_in(&mut self.state.lock().children, a, b)
    }

    /// Depth-first search of the descendants.
    pub fn find(&self, id: &str) -> Option<EntryRef> {
        find_in(&self.children(), id)
    }

    /// Back to NOT_EXECUTED and enabled, recursively.
    pub fn reset(&self) {
        let children = {
            let mut state = self.state.lock();
            state.status = EntryStatus::NotExecuted;
            state.enabled = true;
            state.in_queue = None;
            state.model = ModelFlags::default();
            state.released = false;
            state.children.clone()
        };
        for child in children {
            child.reset();
        }
    }

    // =========================================================================
    // Execution hooks
    // =========================================================================

    /// Mark the data model running.
    pub fn pre_execute(&self) {
        let mut state = self.state.lock();
        state.model.running = true;
        state.released = false;
    }

    /// Mark the data model executed and disable the entry until it is reset.
    ///
    /// Only the first call after `pre_execute` has an effect; returns whether
    /// this call was it.
    pub fn post_execute(&self) -> bool {
        let mut state = self.state.lock();
        if state.released {
            return false;
        }
        state.released = true;
        state.model.running = false;
        state.model.executed = true;
        state.enabled = false;
        true
    }
}

pub(crate) fn swap_in(entries: &mut [EntryRef], a: &str, b: &str) -> bool {
    let ia = entries.iter().position(|e| e.id == a);
    let ib = entries.iter().position(|e| e.id == b);
    match (ia, ib) {
        (Some(ia), Some(ib)) => {
            entries.swap(ia, ib);
            true
        }
        _ => false,
    }
}

pub(crate) fn find_in(entries: &[EntryRef], id: &str) -> Option<EntryRef> {
    for entry in entries {
        if entry.id == id {
            return Some(entry.clone());
        }
        if let Some(found) = entry.find(id) {
            return Some(found);
        }
    }
    None
}

/// Pre-order traversal of `entries` and their descendants.
pub fn walk(entries: &[EntryRef]) -> Vec<EntryRef> {
    let mut out = Vec::new();
    for entry in entries {
        out.push(entry.clone());
        out.extend(walk(&entry.children()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> (EntryRef, EntryRef, EntryRef, EntryRef) {
        let group = QueueEntry::task_group("group");
        let centring = QueueEntry::centring(CentringMethod::Manual);
        let collection = QueueEntry::data_collection(CollectionParameters::default());
        let delay = QueueEntry::delay(Duration::from_millis(5));
        group.enqueue(centring.clone());
        group.enqueue(collection.clone());
        collection.enqueue(delay.clone());
        (group, centring, collection, delay)
    }

    #[test]
    fn enqueue_links_parent_and_keeps_order() {
        let (group, centring, collection, _) = tree();
        let ids: Vec<_> = group.children().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, vec![centring.id(), collection.id()]);
        assert_eq!(centring.parent().unwrap().id(), group.id());
    }

    #[test]
    fn find_searches_depth_first() {
        let (group, _, _, delay) = tree();
        assert_eq!(group.find(delay.id()).unwrap().id(), delay.id());
        assert!(group.find("missing").is_none());
    }

    #[test]
    fn dequeue_and_swap_act_on_direct_children() {
        let (group, centring, collection, delay) = tree();
        assert!(group.swap(centring.id(), collection.id()));
        assert_eq!(group.children()[0].id(), collection.id());
        assert!(!group.swap(centring.id(), delay.id()));

        let removed = group.dequeue(centring.id()).unwrap();
        assert!(removed.parent().is_none());
        assert_eq!(group.children().len(), 1);
        assert!(group.dequeue(delay.id()).is_none());
    }

    #[test]
    fn post_execute_releases_once_and_disables() {
        let (_, centring, _, _) = tree();
        centring.pre_execute();
        assert!(centring.is_running());
        assert!(centring.post_execute());
        assert!(!centring.post_execute());
        assert!(!centring.is_running());
        assert!(centring.is_executed());
        assert!(!centring.is_enabled());
    }

    #[test]
    fn reset_restores_the_whole_subtree() {
        let (group, _, collection, delay) = tree();
        for entry in walk(&[group.clone()]) {
            entry.pre_execute();
            entry.post_execute();
            entry.set_status(EntryStatus::Failed);
        }
        group.reset();
        for entry in [group, collection, delay] {
            assert_eq!(entry.status(), EntryStatus::NotExecuted);
            assert!(entry.is_enabled());
            assert!(!entry.is_executed());
        }
    }

    #[test]
    fn ancestry() {
        let (group, centring, collection, delay) = tree();
        assert!(group.is_ancestor_of(&delay));
        assert!(collection.is_ancestor_of(&delay));
        assert!(!centring.is_ancestor_of(&delay));
        assert!(delay.is_ancestor_of(&delay));
    }

    #[test]
    fn walk_is_pre_order() {
        let (group, centring, collection, delay) = tree();
        let order: Vec<_> = walk(&[group.clone()])
            .iter()
            .map(|e| e.id().to_string())
            .collect();
        assert_eq!(
            order,
            vec![group.id(), centring.id(), collection.id(), delay.id()]
        );
    }
}

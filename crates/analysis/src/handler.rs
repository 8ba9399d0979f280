use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use shopfloor_core::{AnalysisError, AnalysisStatus, ItemId, NewWorkItem, ResourceId, WorkItem};
use shopfloor_storage::{Store, Transaction};

use crate::cancel::CancellationToken;

/// What a business step did to its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Fully applied.
    Completed,
    /// Applied, but sub-items must complete before the item is done.
    CompletedWithSubItems,
    /// Partial progress was committed; the item is attempted again.
    InProgress,
    /// Deferred to a later pass.
    Pending,
    /// The item is obsolete and can be removed.
    Delete,
    /// End the item without applying it, with one of the statuses for which
    /// [`AnalysisStatus::is_abandoned`] holds. Open sub-items are waited for first.
    Terminal(AnalysisStatus),
}

/// Everything a business step may touch during one attempt.
pub struct ApplyContext<'a> {
    tx: &'a Transaction<'a>,
    cancel: &'a CancellationToken,
    step_deadline: Instant,
    spawned: Vec<ItemId>,
}

impl<'a> ApplyContext<'a> {
    pub fn new(tx: &'a Transaction<'a>, cancel: &'a CancellationToken, step_deadline: Instant) -> Self {
        Self {
            tx,
            cancel,
            step_deadline,
            spawned: Vec::new(),
        }
    }

    /// Call between units of work. Fails once the attempt is cancelled or
    /// the step budget is spent.
    pub fn checkpoint(&self) -> Result<(), AnalysisError> {
        if self.cancel.is_aborted() {
            return Err(AnalysisError::Aborted);
        }
        if self.cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        if Instant::now() >= self.step_deadline {
            return Err(AnalysisError::StepTimeout(format!(
                "step budget spent in {}",
                self.tx.name()
            )));
        }
        Ok(())
    }

    /// Insert a sub-item of `parent` in the current transaction.
    pub fn spawn_sub_item(
        &mut self,
        parent: &mut WorkItem,
        child: NewWorkItem,
    ) -> Result<ItemId, AnalysisError> {
        let child = child.child_of(parent);
        if child.partition.kind() != parent.partition.kind() {
            parent.has_cross_partition_children = true;
        }
        let id = self.tx.insert(child)?;
        debug!(item_id = parent.id, sub_item = id, "sub-item spawned");
        self.spawned.push(id);
        Ok(id)
    }

    pub fn spawned(&self) -> &[ItemId] {
        &self.spawned
    }

    pub fn store(&self) -> &'a dyn Store {
        self.tx.store()
    }

    pub fn transaction(&self) -> &'a Transaction<'a> {
        self.tx
    }

    pub fn cancellation(&self) -> &CancellationToken {
        self.cancel
    }
}

/// Business logic of one kind of modification.
pub trait ModificationHandler: Send + Sync {
    /// Matches [`WorkItem::kind`].
    fn kind(&self) -> &str;

    /// Apply the modification inside the attempt's transaction.
    ///
    /// A step may also complete the item itself through the `WorkItem::mark_*`
    /// transitions; a completed status set that way is kept as is.
    fn apply(
        &self,
        ctx: &mut ApplyContext<'_>,
        item: &mut WorkItem,
    ) -> Result<StepOutcome, AnalysisError>;

    /// Resources to pause while the item is applied.
    fn impacted_resources(&self, item: &WorkItem) -> Vec<ResourceId> {
        item.partition.resource().into_iter().collect()
    }
}

/// Handlers keyed by item kind.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ModificationHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ModificationHandler>) {
        debug!(kind = handler.kind(), "handler registered");
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn with(mut self, handler: Arc<dyn ModificationHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn ModificationHandler>, AnalysisError> {
        self.handlers
            .get(kind)
            .cloned()
            .ok_or_else(|| AnalysisError::UnknownKind(kind.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

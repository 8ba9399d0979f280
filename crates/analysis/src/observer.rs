use shopfloor_core::{Partition, WorkItem};

use crate::error::SchedulerError;

/// Extension hooks of a [`PendingQueueProcessor`](crate::PendingQueueProcessor).
///
/// All hooks default to no-ops. They run on the processor thread, outside
/// item transactions.
pub trait ProcessorObserver: Send + Sync {
    /// Called once, before the first pass.
    fn initialize(&self, _partition: Partition) {}

    fn before_analysis(&self, _item: &WorkItem) {}

    /// `completed` is false when the item is left for a later attempt.
    fn after_analysis(&self, _item: &WorkItem, _completed: bool) {}

    fn analysis_failed(&self, _item: &WorkItem, _error: &SchedulerError) {}

    /// The parent moved from `PendingSubModifications` to done.
    /// Fired once per parent.
    fn all_sub_items_completed(&self, _item: &WorkItem) {}
}

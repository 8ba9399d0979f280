use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use shopfloor_core::{
    AnalysisError, AnalysisStatus, ErrorClass, IsolationLevel, ItemId, PartitionKind, WorkItem,
};
use shopfloor_storage::{Transaction, TransactionOptions};

use crate::error::SchedulerError;
use crate::executor::{AttemptState, Outcome};
use crate::partition::PartitionOps;
use crate::supervisor::Supervised;

use super::core::Progress;
use super::PendingQueueProcessor;

/// How far the processing of one sub-item got.
enum SubProgress {
    /// Reached a completed status.
    Terminal,
    /// Still open, with its status priority.
    Open(i32),
    Stopped,
}

enum ParentCompletion {
    Completed,
    /// Sub-items appeared that the resolution did not see.
    MoreSubItems,
    /// Someone else moved the parent out of `PendingSubModifications`.
    Unchanged,
}

impl<P: PartitionOps> PendingQueueProcessor<P> {
    /// Process the open sub-items of `parent`, then complete it once every
    /// sub-item, in both partition kinds, is terminal.
    pub(super) fn resolve_sub_items(
        &mut self,
        parent: &mut WorkItem,
        deadline: Instant,
    ) -> Result<Progress, SchedulerError> {
        let mut both_kinds = false;
        loop {
            if self.should_stop(deadline) {
                return Ok(Progress::Stopped);
            }
            match self.reload(parent.id)? {
                Some(fresh) => *parent = fresh,
                None => return Ok(Progress::Resolved),
            }
            if parent.status != AnalysisStatus::PendingSubModifications {
                if parent.status.is_not_completed() {
                    error!(
                        item_id = parent.id,
                        status = %parent.status,
                        "sub-item resolution of an item not waiting for sub-items"
                    );
                }
                return Ok(Progress::Resolved);
            }

            let mut kinds = vec![parent.partition.kind()];
            if both_kinds || parent.has_cross_partition_children {
                kinds.push(parent.partition.kind().opposite());
            }
            let sub_items = self.open_sub_items(parent.id, &kinds)?;
            debug!(item_id = parent.id, open = sub_items.len(), "resolving sub-items");

            let mut open_priority: Option<i32> = None;
            for sub_item in sub_items {
                match self.process_sub_item(parent.id, sub_item, deadline)? {
                    SubProgress::Terminal => {}
                    SubProgress::Open(priority) => open_priority = open_priority.max(Some(priority)),
                    SubProgress::Stopped => return Ok(Progress::Stopped),
                }
            }
            if let Some(priority) = open_priority {
                self.propagate_priority(parent, priority)?;
                return Ok(Progress::Resolved);
            }

            match self.complete_parent(parent) {
                Ok(ParentCompletion::Completed | ParentCompletion::Unchanged) => {
                    return Ok(Progress::Resolved)
                }
                Ok(ParentCompletion::MoreSubItems) => {
                    debug!(item_id = parent.id, "new sub-items found, resolving again");
                    both_kinds = true;
                }
                Err(e)
                    if self.ops.classify(&e, &self.config.transient_integrity)
                        == ErrorClass::TransientRetryable =>
                {
                    debug!(item_id = parent.id, error = %e, "parent completion rolled back, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Materialize, then fetch, the not completed sub-items of `parent`,
    /// ordered like the queue.
    fn open_sub_items(&self, parent: ItemId, kinds: &[PartitionKind]) -> Result<Vec<WorkItem>, SchedulerError> {
        let mut sub_items = self.retry_conflicts("sub_items", || {
            let options = TransactionOptions::new(
                format!("sub_items.{parent}"),
                IsolationLevel::ReadCommitted,
            );
            let tx = Transaction::begin(self.store.as_ref(), options)?;
            let mut sub_items = Vec::new();
            for &kind in kinds {
                tx.materialize_sub_items(parent, kind)?;
                sub_items.extend(tx.find_not_completed_sub_items(parent, kind)?);
            }
            tx.commit()?;
            Ok(sub_items)
        })?;

        sub_items.sort_by(|a, b| {
            let (pa, ia) = a.queue_key();
            let (pb, ib) = b.queue_key();
            pb.cmp(&pa).then(ia.cmp(&ib))
        });
        Ok(sub_items)
    }

    fn process_sub_item(
        &mut self,
        parent: ItemId,
        mut sub_item: WorkItem,
        deadline: Instant,
    ) -> Result<SubProgress, SchedulerError> {
        let state = Arc::new(AttemptState::new(sub_item.id));
        let progress = self.drive_sub_item(parent, &mut sub_item, &state, deadline);
        self.executor.release_held_pauses(&state);
        progress
    }

    fn drive_sub_item(
        &mut self,
        parent: ItemId,
        sub_item: &mut WorkItem,
        state: &Arc<AttemptState>,
        deadline: Instant,
    ) -> Result<SubProgress, SchedulerError> {
        let mut attempts: u32 = 0;
        loop {
            if self.should_stop(deadline) {
                return Ok(SubProgress::Stopped);
            }
            if sub_item.status.is_completed() {
                return Ok(SubProgress::Terminal);
            }
            if sub_item.status == AnalysisStatus::PendingSubModifications {
                return Ok(match self.resolve_sub_items(sub_item, deadline)? {
                    Progress::Stopped => SubProgress::Stopped,
                    Progress::Resolved if sub_item.status.is_completed() => SubProgress::Terminal,
                    Progress::Resolved => SubProgress::Open(sub_item.queue_key().0),
                });
            }

            let report = match self.analyze(sub_item, state)? {
                Supervised::Attempt(report) => report,
                Supervised::TimedOut(_) => return Ok(SubProgress::Stopped),
            };
            match report.outcome {
                Outcome::FatalAbort => return Err(self.fatal_abort(sub_item.id)),
                Outcome::Completed if report.status.is_completed() => {
                    return Ok(SubProgress::Terminal)
                }
                Outcome::Completed if report.status == AnalysisStatus::PendingSubModifications => {
                    continue
                }
                Outcome::Completed => {
                    if report.status == AnalysisStatus::Pending {
                        self.pending = true;
                    }
                    return Ok(SubProgress::Open(sub_item.queue_key().0));
                }
                Outcome::Retry => {
                    attempts += 1;
                    self.check_livelock(parent, sub_item.id, attempts)?;
                    match self.reload(sub_item.id)? {
                        Some(fresh) if fresh.status.is_not_completed() => *sub_item = fresh,
                        _ => return Ok(SubProgress::Terminal),
                    }
                }
            }
        }
    }

    fn check_livelock(&self, parent: ItemId, item: ItemId, attempts: u32) -> Result<(), SchedulerError> {
        let warning = self.config.sub_item_attempt_warning;
        if warning > 0 && attempts % warning == 0 {
            warn!(parent, item_id = item, attempts, "sub-item still not resolved");
        }
        if attempts >= self.config.sub_item_attempt_fatal {
            let reason = format!("sub-item {item} of {parent} not resolved after {attempts} attempts");
            error!(parent, item_id = item, attempts, "sub-item livelock");
            self.exit.request(reason);
            return Err(SchedulerError::SubItemLivelock {
                parent,
                item,
                attempts,
            });
        }
        Ok(())
    }

    /// Give the parent the highest priority of its open sub-items.
    fn propagate_priority(&self, parent: &mut WorkItem, priority: i32) -> Result<(), SchedulerError> {
        if parent.status_priority == Some(priority) {
            return Ok(());
        }
        let (id, kind) = (parent.id, parent.kind.clone());
        let current = self.retry_conflicts("priority", || {
            let options = TransactionOptions::new(
                format!("analysis.{kind}.{id}.priority"),
                IsolationLevel::ReadCommitted,
            );
            let tx = Transaction::begin(self.store.as_ref(), options)?;
            let Some(mut current) = tx.find(id)? else {
                return Ok(None);
            };
            if current.status == AnalysisStatus::PendingSubModifications
                && current.status_priority != Some(priority)
            {
                debug!(
                    item_id = id,
                    from = ?current.status_priority,
                    to = priority,
                    "sub-item priority propagated"
                );
                current.status_priority = Some(priority);
                tx.persist(&current)?;
            }
            tx.commit()?;
            Ok(Some(current))
        })?;
        if let Some(current) = current {
            *parent = current;
        }
        Ok(())
    }

    /// Flip the parent to done in one transaction, if no sub-item is open.
    fn complete_parent(&mut self, parent: &mut WorkItem) -> Result<ParentCompletion, AnalysisError> {
        let isolation = self.ops.isolation();
        let options = TransactionOptions::new(
            format!("analysis.{}.{}.sub_items", parent.kind, parent.id),
            isolation,
        );
        let tx = Transaction::begin(self.store.as_ref(), options)?;
        for kind in [PartitionKind::Global, PartitionKind::Resource] {
            tx.materialize_sub_items(parent.id, kind)?;
        }
        if tx.has_not_completed_sub_items(parent.id)? {
            tx.commit()?;
            return Ok(ParentCompletion::MoreSubItems);
        }

        let mut current = if isolation == IsolationLevel::Serializable {
            tx.lock(parent.id)?
        } else {
            tx.upgrade_lock(parent.id)?
        };
        if current.status != AnalysisStatus::PendingSubModifications {
            tx.commit()?;
            *parent = current;
            return Ok(ParentCompletion::Unchanged);
        }
        current.mark_all_sub_items_completed()?;
        current.completion_order = Some(tx.next_completion_order()?);
        current.analysis_end = Some(Utc::now());
        tx.persist(&current)?;
        tx.commit()?;

        info!(item_id = current.id, status = %current.status, "all sub-items completed");
        *parent = current;
        self.with_metrics(|m| {
            m.sub_items_completed += 1;
            m.items_completed += 1;
        });
        if parent.status.is_purgeable() {
            self.clean_required = true;
        }
        let parent: &WorkItem = parent;
        self.notify(|o| o.all_sub_items_completed(parent));
        Ok(ParentCompletion::Completed)
    }
}

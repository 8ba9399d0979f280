use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use shopfloor_core::{AnalysisStatus, ErrorClass, IsolationLevel, ItemId, WorkItem};
use shopfloor_storage::{StoreResult, Transaction, TransactionOptions};

use crate::error::SchedulerError;
use crate::executor::{AttemptState, Outcome};
use crate::partition::PartitionOps;
use crate::supervisor::Supervised;

use super::core::Progress;
use super::PendingQueueProcessor;

impl<P: PartitionOps> PendingQueueProcessor<P> {
    /// Run `f` again while it fails on a transient conflict, at most
    /// `store_retry_attempts` times.
    pub(super) fn retry_conflicts<T>(
        &self,
        name: &str,
        mut f: impl FnMut() -> StoreResult<T>,
    ) -> Result<T, SchedulerError> {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(value) => return Ok(value),
                Err(e)
                    if attempt < self.config.store_retry_attempts
                        && self.ops.classify(&e, &self.config.transient_integrity)
                            == ErrorClass::TransientRetryable =>
                {
                    debug!(partition = %self.partition(), name, attempt, error = %e, "store conflict, retrying");
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run `f` in a short read-only transaction.
    pub(super) fn read<T>(
        &self,
        name: &str,
        f: impl Fn(&Transaction<'_>) -> StoreResult<T>,
    ) -> Result<T, SchedulerError> {
        self.retry_conflicts(name, || {
            let options = TransactionOptions::read_only(format!("{name}.{}", self.ops.label()));
            let tx = Transaction::begin(self.store.as_ref(), options)?;
            let value = f(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    pub(super) fn reload(&self, id: ItemId) -> Result<Option<WorkItem>, SchedulerError> {
        self.read("reload", |tx| tx.find(id))
    }

    /// Create the missing status rows of new items.
    ///
    /// Skipped while the partition's max item id is the one of the last
    /// materialization that completed. Returns `false` when the per-call
    /// limit was hit.
    pub(super) fn materialize(&mut self, max_id: Option<ItemId>) -> Result<bool, SchedulerError> {
        if max_id.is_some() && max_id == self.materialized_max {
            return Ok(true);
        }
        let report = self.retry_conflicts("materialize", || {
            let options = TransactionOptions::new(
                format!("materialize.{}", self.ops.label()),
                IsolationLevel::ReadCommitted,
            );
            let tx = Transaction::begin(self.store.as_ref(), options)?;
            let report =
                tx.materialize_index_rows(self.ops.partition(), self.ops.materialize_limit())?;
            tx.commit()?;
            Ok(report)
        })?;

        if report.count > 0 {
            debug!(
                partition = %self.partition(),
                count = report.count,
                last_id = ?report.last_id,
                limit_reached = report.limit_reached,
                "status rows materialized"
            );
        }
        if !report.limit_reached {
            self.materialized_max = max_id;
        }
        Ok(!report.limit_reached)
    }

    // ── Scans ───────────────────────────────────────────────────────

    /// Past phase: batches of items older than the age threshold.
    pub(super) fn run_past(&mut self, deadline: Instant, min_priority: i32) -> Result<bool, SchedulerError> {
        let mut cursor = self.past_cursor.get(min_priority);
        let batch_size = self.config.past_batch_size;
        let partition = self.ops.partition();
        loop {
            if self.should_stop(deadline) {
                self.past_cursor.store(cursor);
                return Ok(false);
            }
            let created_before = Utc::now() - chrono::Duration::seconds(self.config.past_age_secs as i64);
            let batch = self.read("past_batch", |tx| {
                tx.find_past_pending(partition, &cursor, created_before, batch_size)
            })?;
            let fetched = batch.len();
            debug!(%partition, fetched, ?cursor, "past batch");

            for item in batch {
                let (priority, id) = item.queue_key();
                match self.process_item(item, deadline)? {
                    Progress::Resolved => cursor.advance_to(priority, id),
                    Progress::Stopped => {
                        self.past_cursor.store(cursor);
                        return Ok(false);
                    }
                }
            }

            if fetched < batch_size {
                self.past_cursor.reset();
                return Ok(true);
            }
        }
    }

    /// Present phase: the earliest eligible item, one at a time.
    pub(super) fn run_present(&mut self, deadline: Instant, min_priority: i32) -> Result<bool, SchedulerError> {
        let mut cursor = self.present_cursor.get(min_priority);
        let partition = self.ops.partition();
        loop {
            if self.should_stop(deadline) {
                self.present_cursor.store(cursor);
                return Ok(false);
            }
            let next = self.read("present", |tx| tx.find_first_pending(partition, &cursor))?;
            let Some(item) = next else {
                self.present_cursor.reset();
                return Ok(true);
            };
            let (priority, id) = item.queue_key();
            match self.process_item(item, deadline)? {
                Progress::Resolved => cursor.advance_to(priority, id),
                Progress::Stopped => {
                    self.present_cursor.store(cursor);
                    return Ok(false);
                }
            }
        }
    }

    // ── Items ───────────────────────────────────────────────────────

    /// Attempt a top-level item until it resolves or the pass must stop.
    pub(super) fn process_item(&mut self, mut item: WorkItem, deadline: Instant) -> Result<Progress, SchedulerError> {
        let state = Arc::new(AttemptState::new(item.id));
        let progress = self.drive_item(&mut item, &state, deadline);
        self.executor.release_held_pauses(&state);
        progress
    }

    fn drive_item(
        &mut self,
        item: &mut WorkItem,
        state: &Arc<AttemptState>,
        deadline: Instant,
    ) -> Result<Progress, SchedulerError> {
        loop {
            if self.should_stop(deadline) {
                return Ok(Progress::Stopped);
            }
            if item.status == AnalysisStatus::PendingSubModifications {
                return self.resolve_sub_items(item, deadline);
            }

            let report = match self.analyze(item, state)? {
                Supervised::Attempt(report) => report,
                Supervised::TimedOut(_) => return Ok(Progress::Stopped),
            };
            match report.outcome {
                Outcome::FatalAbort => return Err(self.fatal_abort(item.id)),
                Outcome::Completed => match report.status {
                    status if status.is_completed() => return Ok(Progress::Resolved),
                    AnalysisStatus::PendingSubModifications => continue,
                    AnalysisStatus::Pending => {
                        self.pending = true;
                        return Ok(Progress::Resolved);
                    }
                    status => {
                        warn!(item_id = item.id, %status, "attempt completed without a final status");
                        return Ok(Progress::Resolved);
                    }
                },
                Outcome::Retry => match self.reload(item.id)? {
                    Some(fresh) if fresh.status.is_not_completed() => *item = fresh,
                    _ => return Ok(Progress::Resolved),
                },
            }
        }
    }

    /// One supervised attempt, with observer hooks and metrics.
    ///
    /// The in-memory item takes the status last committed for it.
    pub(super) fn analyze(
        &mut self,
        item: &mut WorkItem,
        state: &Arc<AttemptState>,
    ) -> Result<Supervised, SchedulerError> {
        self.notify(|o| o.before_analysis(&*item));
        let started = Instant::now();
        let result = self.supervisor.run(item, state, &self.cancel);
        let elapsed = started.elapsed();

        let (report, timed_out) = match &result {
            Ok(Supervised::Attempt(report)) => (*report, false),
            Ok(Supervised::TimedOut(report)) => (*report, true),
            Err(e) => {
                self.with_metrics(|m| m.record_attempt(elapsed));
                let item: &WorkItem = item;
                self.notify(|o| o.analysis_failed(item, e));
                return result;
            }
        };

        item.restore_status(report.status, report.status_priority);
        let completed =
            !timed_out && report.outcome == Outcome::Completed && report.status.is_completed();
        self.with_metrics(|m| {
            m.record_attempt(elapsed);
            if completed {
                m.items_completed += 1;
            }
            if timed_out {
                m.timeouts += 1;
            } else if report.outcome == Outcome::Retry {
                m.retries += 1;
            }
        });
        if completed && report.status.is_purgeable() {
            self.clean_required = true;
        }
        let item: &WorkItem = item;
        self.notify(|o| o.after_analysis(item, completed));
        result
    }

    pub(super) fn fatal_abort(&self, id: ItemId) -> SchedulerError {
        let reason = self
            .exit
            .reason()
            .unwrap_or_else(|| format!("item {id} aborted"));
        SchedulerError::ExitRequested(reason)
    }
}

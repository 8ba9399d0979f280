use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};

use shopfloor_core::{AnalysisStatus, IsolationLevel};
use shopfloor_storage::{DeleteRequest, Transaction, TransactionOptions};

use crate::error::SchedulerError;
use crate::partition::PartitionOps;

use super::PendingQueueProcessor;

impl<P: PartitionOps> PendingQueueProcessor<P> {
    /// Remove `Delete` items, then `DonePurge` items past the purge delay.
    ///
    /// Both share one item budget and one time budget. Returns `false` when
    /// a budget ran out with items left; the clean-required flag then stays set.
    pub(super) fn cleanup(&mut self, deadline: Instant) -> Result<bool, SchedulerError> {
        let limit = deadline.min(Instant::now() + self.config.cleanup_max_duration());
        let purge_before = Utc::now() - chrono::Duration::seconds(self.config.purge_delay_secs as i64);
        let mut budget = self.config.cleanup_max_items;
        let mut deleted = 0;
        let mut completed = true;

        for (status, completed_before) in [
            (AnalysisStatus::Delete, None),
            (AnalysisStatus::DonePurge, Some(purge_before)),
        ] {
            if budget == 0 || Instant::now() >= limit {
                completed = false;
                break;
            }
            let request = DeleteRequest {
                partition: self.ops.partition(),
                status,
                completed_before,
                batch_size: self.config.cleanup_batch_size,
                max_items: budget,
                deadline: limit,
            };
            let report = self.retry_conflicts("cleanup", || {
                let options = TransactionOptions::new(
                    format!("cleanup.{}", self.ops.label()),
                    IsolationLevel::ReadCommitted,
                );
                let tx = Transaction::begin(self.store.as_ref(), options)?;
                let report = tx.delete_by_status(&request)?;
                tx.commit()?;
                Ok(report)
            })?;

            budget -= report.deleted.min(budget);
            deleted += report.deleted;
            completed &= report.completed;
        }

        self.with_metrics(|m| m.cleanup_deleted += deleted as u64);
        if completed {
            self.clean_required = false;
            debug!(partition = %self.partition(), deleted, "cleanup completed");
        } else {
            warn!(partition = %self.partition(), deleted, "cleanup interrupted, resuming next pass");
        }
        Ok(completed)
    }
}

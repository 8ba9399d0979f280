use std::fmt;

use serde::{Deserialize, Serialize};

/// Analysis state of a work item.
///
/// ```text
/// New → Pending → InProgress → {Done, PendingSubModifications, StepTimeout,
///                               Timeout, DatabaseTimeout, ConstraintIntegrityViolation,
///                               Error, Cancel, Obsolete}
/// StepTimeout | Timeout | DatabaseTimeout → Pending (retried)
/// PendingSubModifications → Done, or the deferred next status, once all
///                           sub-items are terminal
/// Done → Delete | DonePurge → physically removed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStatus {
    /// Created by a producer; its status row may not exist yet.
    New,
    /// Waiting to be (re)processed.
    Pending,
    /// Partially applied; the business step asked to be called again.
    InProgress,
    Done,
    /// Applied, waiting on sub-items.
    PendingSubModifications,
    /// The business step ran out of its internal budget.
    StepTimeout,
    /// The scheduler's wall-clock budget was exceeded.
    Timeout,
    /// A database command timed out.
    DatabaseTimeout,
    /// Non-transient integrity violation. Terminal.
    ConstraintIntegrityViolation,
    /// The business step failed with an error the scheduler cannot retry.
    Error,
    /// Cancelled by its business step.
    Cancel,
    /// Superseded before it could be applied.
    Obsolete,
    /// Flagged for deletion at the next cleanup.
    Delete,
    /// Done, deleted once older than the purge delay.
    DonePurge,
}

impl AnalysisStatus {
    /// All statuses the queue still has to work on.
    pub const NOT_COMPLETED: [AnalysisStatus; 7] = [
        AnalysisStatus::New,
        AnalysisStatus::Pending,
        AnalysisStatus::InProgress,
        AnalysisStatus::PendingSubModifications,
        AnalysisStatus::StepTimeout,
        AnalysisStatus::Timeout,
        AnalysisStatus::DatabaseTimeout,
    ];

    pub fn is_completed(self) -> bool {
        !self.is_not_completed()
    }

    pub fn is_not_completed(self) -> bool {
        Self::NOT_COMPLETED.contains(&self)
    }

    /// Statuses after which the executor attempts the item again in the same pass.
    pub fn requires_retry(self) -> bool {
        matches!(
            self,
            AnalysisStatus::InProgress
                | AnalysisStatus::StepTimeout
                | AnalysisStatus::Timeout
                | AnalysisStatus::DatabaseTimeout
        )
    }

    /// Completed without the modification being applied.
    pub fn is_abandoned(self) -> bool {
        matches!(
            self,
            AnalysisStatus::ConstraintIntegrityViolation
                | AnalysisStatus::Error
                | AnalysisStatus::Cancel
                | AnalysisStatus::Obsolete
        )
    }

    /// Statuses handled by the cleanup step.
    pub fn is_purgeable(self) -> bool {
        matches!(self, AnalysisStatus::Delete | AnalysisStatus::DonePurge)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AnalysisStatus::New => "new",
            AnalysisStatus::Pending => "pending",
            AnalysisStatus::InProgress => "in_progress",
            AnalysisStatus::Done => "done",
            AnalysisStatus::PendingSubModifications => "pending_sub_modifications",
            AnalysisStatus::StepTimeout => "step_timeout",
            AnalysisStatus::Timeout => "timeout",
            AnalysisStatus::DatabaseTimeout => "database_timeout",
            AnalysisStatus::ConstraintIntegrityViolation => "constraint_integrity_violation",
            AnalysisStatus::Error => "error",
            AnalysisStatus::Cancel => "cancel",
            AnalysisStatus::Obsolete => "obsolete",
            AnalysisStatus::Delete => "delete",
            AnalysisStatus::DonePurge => "done_purge",
        }
    }
}

impl fmt::Display for AnalysisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

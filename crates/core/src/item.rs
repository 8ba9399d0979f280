use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AnalysisError;
use crate::status::AnalysisStatus;

/// Work item id, assigned by the store. Unique across partitions.
pub type ItemId = i64;

/// Addressable resource (machine) id.
pub type ResourceId = i64;

/// Physical connection id of a store session. Negative means unknown.
pub type ConnectionId = i64;

/// Queue a work item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Global,
    Resource(ResourceId),
}

impl Partition {
    pub fn kind(self) -> PartitionKind {
        match self {
            Partition::Global => PartitionKind::Global,
            Partition::Resource(_) => PartitionKind::Resource,
        }
    }

    pub fn resource(self) -> Option<ResourceId> {
        match self {
            Partition::Global => None,
            Partition::Resource(id) => Some(id),
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Partition::Global => f.write_str("global"),
            Partition::Resource(id) => write!(f, "resource-{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionKind {
    Global,
    Resource,
}

impl PartitionKind {
    pub fn opposite(self) -> Self {
        match self {
            PartitionKind::Global => PartitionKind::Resource,
            PartitionKind::Resource => PartitionKind::Global,
        }
    }
}

/// Edge from a sub-item to its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: ItemId,
    pub kind: PartitionKind,
}

/// A unit of pending change tracked by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub partition: Partition,
    /// Handler key, e.g. `"reason_machine_association"`.
    pub kind: String,
    /// Handler-specific data.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Producer priority. Higher is more urgent.
    pub priority: i32,
    pub status: AnalysisStatus,
    /// Ordering value of the status row. `None` until the row is materialized.
    pub status_priority: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub analysis_begin: Option<DateTime<Utc>>,
    pub analysis_end: Option<DateTime<Utc>>,
    pub iteration_count: u32,
    /// Sum of all committed attempt durations, in milliseconds.
    pub total_duration_ms: u64,
    pub last_duration_ms: Option<u64>,
    /// Sequence number stamped when the item reaches a completed status.
    pub completion_order: Option<i64>,
    pub parent: Option<ParentRef>,
    /// Sub-items may exist in the opposite partition kind.
    pub has_cross_partition_children: bool,
    /// Created by the system rather than a user; purged once done.
    pub auto: bool,
    /// Status taken instead of done once the sub-items complete.
    #[serde(default)]
    pub next_status: Option<AnalysisStatus>,
}

/// Producer-side description of an item to insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub partition: Partition,
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub priority: i32,
    #[serde(default)]
    pub auto: bool,
    #[serde(default)]
    pub parent: Option<ParentRef>,
}

impl NewWorkItem {
    pub fn new(partition: Partition, kind: impl Into<String>, priority: i32) -> Self {
        Self {
            partition,
            kind: kind.into(),
            payload: serde_json::Value::Null,
            priority,
            auto: false,
            parent: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn auto(mut self) -> Self {
        self.auto = true;
        self
    }

    pub fn child_of(mut self, parent: &WorkItem) -> Self {
        self.parent = Some(ParentRef {
            id: parent.id,
            kind: parent.partition.kind(),
        });
        self
    }

    /// Build the stored row. Items always start `New` without a status row.
    pub fn into_item(self, id: ItemId, created_at: DateTime<Utc>) -> WorkItem {
        WorkItem {
            id,
            partition: self.partition,
            kind: self.kind,
            payload: self.payload,
            priority: self.priority,
            status: AnalysisStatus::New,
            status_priority: None,
            created_at,
            analysis_begin: None,
            analysis_end: None,
            iteration_count: 0,
            total_duration_ms: 0,
            last_duration_ms: None,
            completion_order: None,
            parent: self.parent,
            has_cross_partition_children: false,
            auto: self.auto,
            next_status: None,
        }
    }
}

impl WorkItem {
    /// Top-level items are fetched by the queue; sub-items only through their parent.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Ordering key of the pending queue: status priority descending, id ascending.
    pub fn queue_key(&self) -> (i32, ItemId) {
        (self.status_priority.unwrap_or(self.priority), self.id)
    }

    /// Create the status row if it does not exist yet.
    pub fn materialize_status(&mut self) {
        if self.status_priority.is_none() {
            self.status_priority = Some(self.priority);
        }
    }

    // ── Attempt bookkeeping ─────────────────────────────────────────

    /// Start an attempt. `carried` counts earlier attempts that rolled back.
    pub fn begin_attempt(&mut self, now: DateTime<Utc>, carried: u32) {
        self.carry_attempts(now, 1 + carried);
    }

    /// Count attempts whose own transaction rolled back.
    pub fn carry_attempts(&mut self, now: DateTime<Utc>, attempts: u32) {
        if self.analysis_begin.is_none() {
            self.analysis_begin = Some(now);
        }
        self.iteration_count += attempts;
    }

    pub fn end_attempt(&mut self, now: DateTime<Utc>, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.last_duration_ms = Some(ms);
        self.total_duration_ms += ms;
        self.analysis_end = Some(now);
    }

    // ── Status transitions ──────────────────────────────────────────

    fn transition(&mut self, to: AnalysisStatus) -> Result<(), AnalysisError> {
        if self.status.is_completed() {
            tracing::error!(
                item_id = self.id,
                from = %self.status,
                to = %to,
                "status update of a completed item"
            );
            return Err(AnalysisError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.materialize_status();
        self.status = to;
        Ok(())
    }

    fn done_status(&self) -> AnalysisStatus {
        if self.auto {
            AnalysisStatus::DonePurge
        } else {
            AnalysisStatus::Done
        }
    }

    pub fn mark_pending(&mut self) -> Result<(), AnalysisError> {
        self.transition(AnalysisStatus::Pending)
    }

    pub fn mark_in_progress(&mut self) -> Result<(), AnalysisError> {
        self.transition(AnalysisStatus::InProgress)
    }

    /// `Done`, or `DonePurge` for auto items.
    pub fn mark_completed(&mut self) -> Result<(), AnalysisError> {
        let to = self.done_status();
        self.transition(to)
    }

    pub fn mark_pending_sub_items(&mut self) -> Result<(), AnalysisError> {
        self.transition(AnalysisStatus::PendingSubModifications)
    }

    pub fn mark_delete(&mut self) -> Result<(), AnalysisError> {
        self.transition(AnalysisStatus::Delete)
    }

    pub fn mark_step_timeout(&mut self) -> Result<(), AnalysisError> {
        self.transition(AnalysisStatus::StepTimeout)
    }

    pub fn mark_timeout(&mut self) -> Result<(), AnalysisError> {
        self.transition(AnalysisStatus::Timeout)
    }

    pub fn mark_database_timeout(&mut self) -> Result<(), AnalysisError> {
        self.transition(AnalysisStatus::DatabaseTimeout)
    }

    pub fn mark_constraint_integrity_violation(&mut self) -> Result<(), AnalysisError> {
        self.transition(AnalysisStatus::ConstraintIntegrityViolation)
    }

    /// End the item without applying it: `Error`, `Cancel`, `Obsolete` or
    /// `ConstraintIntegrityViolation`.
    pub fn mark_terminal(&mut self, status: AnalysisStatus) -> Result<(), AnalysisError> {
        if !status.is_abandoned() {
            return Err(AnalysisError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: status,
            });
        }
        self.transition(status)
    }

    pub fn mark_error(&mut self) -> Result<(), AnalysisError> {
        self.mark_terminal(AnalysisStatus::Error)
    }

    /// Wait for the open sub-items, then end with `status`.
    pub fn defer_until_sub_items(&mut self, status: AnalysisStatus) -> Result<(), AnalysisError> {
        if !status.is_abandoned() {
            return Err(AnalysisError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: status,
            });
        }
        self.transition(AnalysisStatus::PendingSubModifications)?;
        self.next_status = Some(status);
        Ok(())
    }

    /// Flip a parent whose sub-items are all terminal, to its deferred
    /// status if one was recorded.
    pub fn mark_all_sub_items_completed(&mut self) -> Result<(), AnalysisError> {
        let to = self.next_status.unwrap_or_else(|| self.done_status());
        if self.status != AnalysisStatus::PendingSubModifications {
            return Err(AnalysisError::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.transition(to)?;
        self.next_status = None;
        Ok(())
    }

    /// Put back the status of an attempt that did not commit.
    pub fn restore_status(&mut self, status: AnalysisStatus, status_priority: Option<i32>) {
        self.status = status;
        self.status_priority = status_priority;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(auto: bool) -> WorkItem {
        let mut new = NewWorkItem::new(Partition::Resource(3), "reason", 5);
        if auto {
            new = new.auto();
        }
        new.into_item(42, Utc::now())
    }

    #[test]
    fn new_items_have_no_status_row() {
        let it = item(false);
        assert_eq!(it.status, AnalysisStatus::New);
        assert_eq!(it.status_priority, None);
        assert!(it.is_root());
    }

    #[test]
    fn leaving_new_materializes_status_priority() {
        let mut it = item(false);
        it.mark_in_progress().unwrap();
        assert_eq!(it.status_priority, Some(5));
    }

    #[test]
    fn auto_items_complete_to_done_purge() {
        let mut it = item(true);
        it.mark_completed().unwrap();
        assert_eq!(it.status, AnalysisStatus::DonePurge);

        let mut it = item(false);
        it.mark_completed().unwrap();
        assert_eq!(it.status, AnalysisStatus::Done);
    }

    #[test]
    fn completed_items_reject_transitions() {
        let mut it = item(false);
        it.mark_constraint_integrity_violation().unwrap();
        let err = it.mark_timeout().unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidTransition { id: 42, .. }));
        assert_eq!(it.status, AnalysisStatus::ConstraintIntegrityViolation);
    }

    #[test]
    fn all_sub_items_completed_requires_pending_sub_items() {
        let mut it = item(false);
        assert!(it.mark_all_sub_items_completed().is_err());
        it.mark_pending_sub_items().unwrap();
        it.mark_all_sub_items_completed().unwrap();
        assert_eq!(it.status, AnalysisStatus::Done);
    }

    #[test]
    fn terminal_statuses_are_limited_to_abandon_statuses() {
        let mut it = item(false);
        let err = it.mark_terminal(AnalysisStatus::Done).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidTransition { .. }));
        assert_eq!(it.status, AnalysisStatus::New);

        it.mark_terminal(AnalysisStatus::Obsolete).unwrap();
        assert_eq!(it.status, AnalysisStatus::Obsolete);
        assert_eq!(it.status_priority, Some(5));
        assert!(it.mark_error().is_err());
    }

    #[test]
    fn deferred_status_is_taken_after_sub_items() {
        let mut it = item(true);
        it.defer_until_sub_items(AnalysisStatus::Error).unwrap();
        assert_eq!(it.status, AnalysisStatus::PendingSubModifications);
        assert_eq!(it.next_status, Some(AnalysisStatus::Error));

        it.mark_all_sub_items_completed().unwrap();
        assert_eq!(it.status, AnalysisStatus::Error);
        assert_eq!(it.next_status, None);
    }

    #[test]
    fn attempt_bookkeeping() {
        let mut it = item(false);
        let first = Utc::now();
        it.begin_attempt(first, 0);
        it.end_attempt(Utc::now(), Duration::from_millis(30));
        it.begin_attempt(Utc::now(), 2);
        it.end_attempt(Utc::now(), Duration::from_millis(20));

        assert_eq!(it.analysis_begin, Some(first));
        assert_eq!(it.iteration_count, 4);
        assert_eq!(it.total_duration_ms, 50);
        assert_eq!(it.last_duration_ms, Some(20));
        assert!(it.analysis_end.is_some());
    }

    #[test]
    fn child_of_records_parent_kind() {
        let parent = NewWorkItem::new(Partition::Global, "parent", 1).into_item(7, Utc::now());
        let child = NewWorkItem::new(Partition::Resource(1), "child", 1).child_of(&parent);
        assert_eq!(
            child.parent,
            Some(ParentRef { id: 7, kind: PartitionKind::Global })
        );
        assert_eq!(Partition::Resource(1).to_string(), "resource-1");
    }
}

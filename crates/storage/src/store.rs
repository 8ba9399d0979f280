use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use shopfloor_core::{
    AnalysisError, AnalysisStatus, ConnectionId, IsolationLevel, ItemId, NewWorkItem, Partition,
    PartitionKind, ProgressCursor, ResourceId, WorkItem,
};

/// Store-side transaction handle.
pub type TxnId = u64;

pub type StoreResult<T> = Result<T, AnalysisError>;

/// How to open a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    /// Shows up in store diagnostics.
    pub name: String,
    pub isolation: IsolationLevel,
    /// Resources whose data the transaction is expected to lock.
    pub locked_resources: Vec<ResourceId>,
    pub read_only: bool,
}

impl TransactionOptions {
    pub fn new(name: impl Into<String>, isolation: IsolationLevel) -> Self {
        Self {
            name: name.into(),
            isolation,
            locked_resources: Vec::new(),
            read_only: false,
        }
    }

    pub fn read_only(name: impl Into<String>) -> Self {
        Self {
            read_only: true,
            ..Self::new(name, IsolationLevel::ReadCommitted)
        }
    }

    pub fn locking(mut self, resources: impl IntoIterator<Item = ResourceId>) -> Self {
        self.locked_resources.extend(resources);
        self
    }
}

/// Bounded deletion of items in one status.
#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub partition: Partition,
    pub status: AnalysisStatus,
    /// Only delete items whose analysis ended before this instant.
    pub completed_before: Option<DateTime<Utc>>,
    /// Items deleted per step.
    pub batch_size: usize,
    /// Stop once this many items are deleted.
    pub max_items: usize,
    /// Stop once this instant is reached.
    pub deadline: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeleteReport {
    pub deleted: usize,
    /// Nothing matching is left.
    pub completed: bool,
}

/// Outcome of a status-row materialization call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Materialized {
    pub last_id: Option<ItemId>,
    pub count: usize,
    pub limit_reached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Critical,
}

/// Persisted diagnostic attached to an item, consumed by operator reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisLogEntry {
    pub item_id: ItemId,
    pub level: LogLevel,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl AnalysisLogEntry {
    pub fn new(item_id: ItemId, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            item_id,
            level,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Transactional persistence consumed by the scheduler.
///
/// Every data operation runs inside a transaction opened with [`Store::begin`].
/// Pending queries only return top-level items whose status row exists and
/// whose status is not completed, ordered by status priority descending,
/// then id ascending.
pub trait Store: Send + Sync {
    // ── Transactions ────────────────────────────────────────────────

    fn begin(&self, options: &TransactionOptions) -> StoreResult<TxnId>;

    fn commit(&self, tx: TxnId) -> StoreResult<()>;

    fn rollback(&self, tx: TxnId) -> StoreResult<()>;

    /// Physical connection of the transaction, if the backend exposes one.
    fn connection_id(&self, tx: TxnId) -> Option<ConnectionId>;

    /// Terminate a connection, rolling back its work and releasing its locks.
    fn kill_connection(&self, connection: ConnectionId) -> StoreResult<()>;

    // ── Rows ────────────────────────────────────────────────────────

    fn find(&self, tx: TxnId, id: ItemId) -> StoreResult<Option<WorkItem>>;

    /// Exclusive row lock, used under serializable isolation.
    fn lock(&self, tx: TxnId, id: ItemId) -> StoreResult<WorkItem>;

    /// Upgrade to an exclusive lock, used under weaker isolation levels.
    fn upgrade_lock(&self, tx: TxnId, id: ItemId) -> StoreResult<WorkItem>;

    fn persist(&self, tx: TxnId, item: &WorkItem) -> StoreResult<()>;

    fn insert(&self, tx: TxnId, item: NewWorkItem) -> StoreResult<ItemId>;

    // ── Queue queries ───────────────────────────────────────────────

    /// Up to `batch_size` items created before `created_before`, after the cursor.
    fn find_past_pending(
        &self,
        tx: TxnId,
        partition: Partition,
        cursor: &ProgressCursor,
        created_before: DateTime<Utc>,
        batch_size: usize,
    ) -> StoreResult<Vec<WorkItem>>;

    fn find_first_pending(
        &self,
        tx: TxnId,
        partition: Partition,
        cursor: &ProgressCursor,
    ) -> StoreResult<Option<WorkItem>>;

    fn max_item_id(&self, tx: TxnId, partition: Partition) -> StoreResult<Option<ItemId>>;

    /// Create missing status rows of `New` items, oldest first.
    fn materialize_index_rows(
        &self,
        tx: TxnId,
        partition: Partition,
        limit: Option<usize>,
    ) -> StoreResult<Materialized>;

    // ── Sub-items ───────────────────────────────────────────────────

    /// Not completed sub-items of `parent` in one partition kind, with a status row.
    fn find_not_completed_sub_items(
        &self,
        tx: TxnId,
        parent: ItemId,
        kind: PartitionKind,
    ) -> StoreResult<Vec<WorkItem>>;

    /// Create missing status rows of the sub-items of `parent`, without limit.
    fn materialize_sub_items(
        &self,
        tx: TxnId,
        parent: ItemId,
        kind: PartitionKind,
    ) -> StoreResult<usize>;

    /// Whether any sub-item of `parent` is not completed, status row or not.
    fn has_not_completed_sub_items(&self, tx: TxnId, parent: ItemId) -> StoreResult<bool>;

    // ── Cleanup & bookkeeping ───────────────────────────────────────

    fn delete_by_status(&self, tx: TxnId, request: &DeleteRequest) -> StoreResult<DeleteReport>;

    fn next_completion_order(&self, tx: TxnId) -> StoreResult<i64>;

    fn add_analysis_log(&self, tx: TxnId, entry: AnalysisLogEntry) -> StoreResult<()>;
}

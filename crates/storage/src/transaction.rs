use chrono::{DateTime, Utc};
use tracing::warn;

use shopfloor_core::{
    ConnectionId, ItemId, NewWorkItem, Partition, PartitionKind, ProgressCursor, WorkItem,
};

use crate::store::{
    AnalysisLogEntry, DeleteReport, DeleteRequest, Materialized, Store, StoreResult,
    TransactionOptions, TxnId,
};

/// An open transaction. Rolled back on drop unless committed.
pub struct Transaction<'s> {
    store: &'s dyn Store,
    id: TxnId,
    name: String,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub fn begin(store: &'s dyn Store, options: TransactionOptions) -> StoreResult<Self> {
        let id = store.begin(&options)?;
        Ok(Self {
            store,
            id,
            name: options.name,
            finished: false,
        })
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &'s dyn Store {
        self.store
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.store.connection_id(self.id)
    }

    pub fn commit(mut self) -> StoreResult<()> {
        self.finished = true;
        self.store.commit(self.id)
    }

    pub fn rollback(mut self) -> StoreResult<()> {
        self.finished = true;
        self.store.rollback(self.id)
    }

    pub fn find(&self, id: ItemId) -> StoreResult<Option<WorkItem>> {
        self.store.find(self.id, id)
    }

    pub fn lock(&self, id: ItemId) -> StoreResult<WorkItem> {
        self.store.lock(self.id, id)
    }

    pub fn upgrade_lock(&self, id: ItemId) -> StoreResult<WorkItem> {
        self.store.upgrade_lock(self.id, id)
    }

    pub fn persist(&self, item: &WorkItem) -> StoreResult<()> {
        self.store.persist(self.id, item)
    }

    pub fn insert(&self, item: NewWorkItem) -> StoreResult<ItemId> {
        self.store.insert(self.id, item)
    }

    pub fn find_past_pending(
        &self,
        partition: Partition,
        cursor: &ProgressCursor,
        created_before: DateTime<Utc>,
        batch_size: usize,
    ) -> StoreResult<Vec<WorkItem>> {
        self.store
            .find_past_pending(self.id, partition, cursor, created_before, batch_size)
    }

    pub fn find_first_pending(
        &self,
        partition: Partition,
        cursor: &ProgressCursor,
    ) -> StoreResult<Option<WorkItem>> {
        self.store.find_first_pending(self.id, partition, cursor)
    }

    pub fn max_item_id(&self, partition: Partition) -> StoreResult<Option<ItemId>> {
        self.store.max_item_id(self.id, partition)
    }

    pub fn materialize_index_rows(
        &self,
        partition: Partition,
        limit: Option<usize>,
    ) -> StoreResult<Materialized> {
        self.store.materialize_index_rows(self.id, partition, limit)
    }

    pub fn find_not_completed_sub_items(
        &self,
        parent: ItemId,
        kind: PartitionKind,
    ) -> StoreResult<Vec<WorkItem>> {
        self.store.find_not_completed_sub_items(self.id, parent, kind)
    }

    pub fn materialize_sub_items(&self, parent: ItemId, kind: PartitionKind) -> StoreResult<usize> {
        self.store.materialize_sub_items(self.id, parent, kind)
    }

    pub fn has_not_completed_sub_items(&self, parent: ItemId) -> StoreResult<bool> {
        self.store.has_not_completed_sub_items(self.id, parent)
    }

    pub fn delete_by_status(&self, request: &DeleteRequest) -> StoreResult<DeleteReport> {
        self.store.delete_by_status(self.id, request)
    }

    pub fn next_completion_order(&self) -> StoreResult<i64> {
        self.store.next_completion_order(self.id)
    }

    pub fn add_analysis_log(&self, entry: AnalysisLogEntry) -> StoreResult<()> {
        self.store.add_analysis_log(self.id, entry)
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            if let Err(e) = self.store.rollback(self.id) {
                warn!(transaction = %self.name, error = %e, "rollback failed");
            }
        }
    }
}

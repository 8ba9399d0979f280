//! In-process [`Store`] backend.
//!
//! Rows carry a version bumped on every committed write. Commit validates the
//! versions of written rows (`Stale` on mismatch), or of every row read under
//! serializable isolation (`SerializationFailure`). Row locks are exclusive
//! and fail fast with `LockNotAvailable`. Each transaction gets its own
//! connection id; killing it discards the transaction's work.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use shopfloor_core::{
    AnalysisError, AnalysisStatus, ConnectionId, IsolationLevel, ItemId, NewWorkItem, Partition,
    PartitionKind, ProgressCursor, WorkItem,
};

use crate::store::{
    AnalysisLogEntry, DeleteReport, DeleteRequest, Materialized, Store, StoreResult,
    TransactionOptions, TxnId,
};

const FIRST_CONNECTION_ID: ConnectionId = 1000;

struct Row {
    item: WorkItem,
    version: u64,
}

enum Write {
    Put(WorkItem),
    Delete,
}

struct TxnState {
    options: TransactionOptions,
    connection: ConnectionId,
    /// Row versions observed by this transaction.
    reads: HashMap<ItemId, u64>,
    writes: BTreeMap<ItemId, Write>,
    inserted: HashSet<ItemId>,
    locks: HashSet<ItemId>,
    log: Vec<AnalysisLogEntry>,
    killed: bool,
}

#[derive(Default)]
struct State {
    rows: BTreeMap<ItemId, Row>,
    last_item_id: ItemId,
    last_txn: TxnId,
    last_connection: ConnectionId,
    completion_seq: i64,
    txns: HashMap<TxnId, TxnState>,
    killed: Vec<ConnectionId>,
    log: Vec<AnalysisLogEntry>,
    deleted: usize,
    kill_fails: bool,
    /// Transaction-name prefixes whose next commits fail, with the count left.
    conflicts: Vec<(String, usize)>,
}

impl State {
    fn txn(&self, tx: TxnId) -> StoreResult<&TxnState> {
        let txn = self
            .txns
            .get(&tx)
            .ok_or_else(|| AnalysisError::Unrecoverable(format!("unknown transaction {tx}")))?;
        if txn.killed {
            return Err(AnalysisError::ConnectionKilled(txn.connection));
        }
        Ok(txn)
    }

    fn txn_mut(&mut self, tx: TxnId) -> StoreResult<&mut TxnState> {
        let txn = self
            .txns
            .get_mut(&tx)
            .ok_or_else(|| AnalysisError::Unrecoverable(format!("unknown transaction {tx}")))?;
        if txn.killed {
            return Err(AnalysisError::ConnectionKilled(txn.connection));
        }
        Ok(txn)
    }

    /// Row as seen by the transaction: its own writes first.
    fn visible(&self, txn: &TxnState, id: ItemId) -> Option<WorkItem> {
        match txn.writes.get(&id) {
            Some(Write::Put(item)) => Some(item.clone()),
            Some(Write::Delete) => None,
            None => self.rows.get(&id).map(|r| r.item.clone()),
        }
    }

    fn visible_all(&self, txn: &TxnState) -> Vec<WorkItem> {
        let mut all: BTreeMap<ItemId, WorkItem> = self
            .rows
            .iter()
            .map(|(id, row)| (*id, row.item.clone()))
            .collect();
        for (id, write) in &txn.writes {
            match write {
                Write::Put(item) => {
                    all.insert(*id, item.clone());
                }
                Write::Delete => {
                    all.remove(id);
                }
            }
        }
        all.into_values().collect()
    }

    fn note_read(&mut self, tx: TxnId, id: ItemId) {
        let version = self.rows.get(&id).map(|r| r.version);
        if let (Some(version), Some(txn)) = (version, self.txns.get_mut(&tx)) {
            txn.reads.entry(id).or_insert(version);
        }
    }

    fn lock_holder(&self, tx: TxnId, id: ItemId) -> Option<TxnId> {
        self.txns
            .iter()
            .find(|(other, t)| **other != tx && !t.killed && t.locks.contains(&id))
            .map(|(other, _)| *other)
    }

    fn pending(&self, txn: &TxnState, partition: Partition, cursor: &ProgressCursor) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self
            .visible_all(txn)
            .into_iter()
            .filter(|i| i.partition == partition && i.is_root() && i.status.is_not_completed())
            .filter(|i| i.status_priority.is_some_and(|p| cursor.admits(p, i.id)))
            .collect();
        items.sort_by(|a, b| {
            let (pa, ia) = a.queue_key();
            let (pb, ib) = b.queue_key();
            pb.cmp(&pa).then(ia.cmp(&ib))
        });
        items
    }

    fn put_all(&mut self, tx: TxnId, items: Vec<WorkItem>) -> StoreResult<()> {
        for item in items {
            self.note_read(tx, item.id);
            self.txn_mut(tx)?.writes.insert(item.id, Write::Put(item));
        }
        Ok(())
    }
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Producer side ───────────────────────────────────────────────

    /// Insert and commit a new item.
    pub fn add(&self, item: NewWorkItem) -> ItemId {
        self.add_at(item, Utc::now())
    }

    /// Insert and commit a new item with an explicit creation time.
    pub fn add_at(&self, item: NewWorkItem, created_at: DateTime<Utc>) -> ItemId {
        let mut state = self.state();
        state.last_item_id += 1;
        let id = state.last_item_id;
        state.rows.insert(
            id,
            Row {
                item: item.into_item(id, created_at),
                version: 1,
            },
        );
        id
    }

    /// Apply a committed change outside any scheduler transaction, as a
    /// concurrent writer would.
    pub fn update(&self, id: ItemId, f: impl FnOnce(&mut WorkItem)) -> bool {
        let mut state = self.state();
        match state.rows.get_mut(&id) {
            Some(row) => {
                f(&mut row.item);
                row.version += 1;
                true
            }
            None => false,
        }
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn get(&self, id: ItemId) -> Option<WorkItem> {
        self.state().rows.get(&id).map(|r| r.item.clone())
    }

    pub fn items(&self) -> Vec<WorkItem> {
        self.state().rows.values().map(|r| r.item.clone()).collect()
    }

    pub fn analysis_log(&self) -> Vec<AnalysisLogEntry> {
        self.state().log.clone()
    }

    pub fn killed_connections(&self) -> Vec<ConnectionId> {
        self.state().killed.clone()
    }

    pub fn active_transactions(&self) -> usize {
        self.state().txns.values().filter(|t| !t.killed).count()
    }

    /// Rows physically removed so far.
    pub fn deleted_count(&self) -> usize {
        self.state().deleted
    }

    /// Make [`Store::kill_connection`] fail, as when the session is unreachable.
    pub fn set_kill_fails(&self, fails: bool) {
        self.state().kill_fails = fails;
    }

    /// Make the next `count` commits of transactions whose name starts with
    /// `prefix` fail with a serialization failure.
    pub fn fail_commits(&self, prefix: impl Into<String>, count: usize) {
        self.state().conflicts.push((prefix.into(), count));
    }
}

impl Store for MemoryStore {
    fn begin(&self, options: &TransactionOptions) -> StoreResult<TxnId> {
        let mut state = self.state();
        state.last_txn += 1;
        let tx = state.last_txn;
        let connection = FIRST_CONNECTION_ID.max(state.last_connection + 1);
        state.last_connection = connection;
        state.txns.insert(
            tx,
            TxnState {
                options: options.clone(),
                connection,
                reads: HashMap::new(),
                writes: BTreeMap::new(),
                inserted: HashSet::new(),
                locks: HashSet::new(),
                log: Vec::new(),
                killed: false,
            },
        );
        debug!(tx, connection, name = %options.name, "transaction opened");
        Ok(tx)
    }

    fn commit(&self, tx: TxnId) -> StoreResult<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        let txn = state
            .txns
            .remove(&tx)
            .ok_or_else(|| AnalysisError::Unrecoverable(format!("unknown transaction {tx}")))?;
        if txn.killed {
            return Err(AnalysisError::ConnectionKilled(txn.connection));
        }
        if let Some((_, left)) = state
            .conflicts
            .iter_mut()
            .find(|(prefix, left)| *left > 0 && txn.options.name.starts_with(prefix.as_str()))
        {
            *left -= 1;
            return Err(AnalysisError::SerializationFailure(format!(
                "conflict on commit of {}",
                txn.options.name
            )));
        }
        if txn.options.read_only && !txn.writes.is_empty() {
            return Err(AnalysisError::Unrecoverable(format!(
                "write in read-only transaction {}",
                txn.options.name
            )));
        }

        let serializable = txn.options.isolation == IsolationLevel::Serializable;
        for (id, seen) in &txn.reads {
            if !serializable && !txn.writes.contains_key(id) {
                continue;
            }
            let current = state.rows.get(id).map(|r| r.version);
            if current != Some(*seen) {
                return Err(if serializable {
                    AnalysisError::SerializationFailure(format!(
                        "item {id} changed during transaction {}",
                        txn.options.name
                    ))
                } else {
                    AnalysisError::Stale(*id)
                });
            }
        }

        for (id, write) in txn.writes {
            match write {
                Write::Put(item) => match state.rows.get_mut(&id) {
                    Some(row) => {
                        row.item = item;
                        row.version += 1;
                    }
                    None if txn.inserted.contains(&id) => {
                        state.rows.insert(id, Row { item, version: 1 });
                    }
                    None => return Err(AnalysisError::Stale(id)),
                },
                Write::Delete => {
                    if state.rows.remove(&id).is_some() {
                        state.deleted += 1;
                    }
                }
            }
        }
        state.log.extend(txn.log);
        Ok(())
    }

    fn rollback(&self, tx: TxnId) -> StoreResult<()> {
        self.state().txns.remove(&tx);
        Ok(())
    }

    fn connection_id(&self, tx: TxnId) -> Option<ConnectionId> {
        self.state().txns.get(&tx).map(|t| t.connection)
    }

    fn kill_connection(&self, connection: ConnectionId) -> StoreResult<()> {
        let mut state = self.state();
        if state.kill_fails {
            return Err(AnalysisError::Unrecoverable(format!(
                "kill of connection {connection} refused"
            )));
        }
        if let Some(txn) = state.txns.values_mut().find(|t| t.connection == connection) {
            txn.killed = true;
            txn.reads.clear();
            txn.writes.clear();
            txn.locks.clear();
            txn.log.clear();
        }
        state.killed.push(connection);
        info!(connection, "connection killed");
        Ok(())
    }

    fn find(&self, tx: TxnId, id: ItemId) -> StoreResult<Option<WorkItem>> {
        let mut state = self.state();
        let item = {
            let txn = state.txn(tx)?;
            state.visible(txn, id)
        };
        if item.is_some() {
            state.note_read(tx, id);
        }
        Ok(item)
    }

    fn lock(&self, tx: TxnId, id: ItemId) -> StoreResult<WorkItem> {
        let mut state = self.state();
        let item = {
            let txn = state.txn(tx)?;
            if state.lock_holder(tx, id).is_some() {
                return Err(AnalysisError::LockNotAvailable(id));
            }
            state.visible(txn, id).ok_or(AnalysisError::NotFound(id))?
        };
        state.note_read(tx, id);
        state.txn_mut(tx)?.locks.insert(id);
        Ok(item)
    }

    fn upgrade_lock(&self, tx: TxnId, id: ItemId) -> StoreResult<WorkItem> {
        self.lock(tx, id)
    }

    fn persist(&self, tx: TxnId, item: &WorkItem) -> StoreResult<()> {
        let mut state = self.state();
        {
            let txn = state.txn(tx)?;
            if state.visible(txn, item.id).is_none() {
                return Err(AnalysisError::NotFound(item.id));
            }
        }
        state.put_all(tx, vec![item.clone()])
    }

    fn insert(&self, tx: TxnId, item: NewWorkItem) -> StoreResult<ItemId> {
        let mut state = self.state();
        state.txn(tx)?;
        state.last_item_id += 1;
        let id = state.last_item_id;
        let txn = state.txn_mut(tx)?;
        txn.writes.insert(id, Write::Put(item.into_item(id, Utc::now())));
        txn.inserted.insert(id);
        Ok(id)
    }

    fn find_past_pending(
        &self,
        tx: TxnId,
        partition: Partition,
        cursor: &ProgressCursor,
        created_before: DateTime<Utc>,
        batch_size: usize,
    ) -> StoreResult<Vec<WorkItem>> {
        let mut state = self.state();
        let items: Vec<WorkItem> = {
            let txn = state.txn(tx)?;
            state
                .pending(txn, partition, cursor)
                .into_iter()
                .filter(|i| i.created_at < created_before)
                .take(batch_size)
                .collect()
        };
        for item in &items {
            state.note_read(tx, item.id);
        }
        Ok(items)
    }

    fn find_first_pending(
        &self,
        tx: TxnId,
        partition: Partition,
        cursor: &ProgressCursor,
    ) -> StoreResult<Option<WorkItem>> {
        let mut state = self.state();
        let first = {
            let txn = state.txn(tx)?;
            state.pending(txn, partition, cursor).into_iter().next()
        };
        if let Some(item) = &first {
            state.note_read(tx, item.id);
        }
        Ok(first)
    }

    fn max_item_id(&self, tx: TxnId, partition: Partition) -> StoreResult<Option<ItemId>> {
        let state = self.state();
        let txn = state.txn(tx)?;
        Ok(state
            .visible_all(txn)
            .iter()
            .filter(|i| i.partition == partition)
            .map(|i| i.id)
            .max())
    }

    fn materialize_index_rows(
        &self,
        tx: TxnId,
        partition: Partition,
        limit: Option<usize>,
    ) -> StoreResult<Materialized> {
        let mut state = self.state();
        let candidates: Vec<WorkItem> = {
            let txn = state.txn(tx)?;
            state
                .visible_all(txn)
                .into_iter()
                .filter(|i| {
                    i.partition == partition
                        && i.status == AnalysisStatus::New
                        && i.status_priority.is_none()
                })
                .collect()
        };
        let limit_reached = limit.is_some_and(|l| candidates.len() > l);
        let rows: Vec<WorkItem> = candidates
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .map(|mut item| {
                item.materialize_status();
                item
            })
            .collect();
        let report = Materialized {
            last_id: rows.last().map(|i| i.id),
            count: rows.len(),
            limit_reached,
        };
        state.put_all(tx, rows)?;
        Ok(report)
    }

    fn find_not_completed_sub_items(
        &self,
        tx: TxnId,
        parent: ItemId,
        kind: PartitionKind,
    ) -> StoreResult<Vec<WorkItem>> {
        let mut state = self.state();
        let items: Vec<WorkItem> = {
            let txn = state.txn(tx)?;
            state
                .visible_all(txn)
                .into_iter()
                .filter(|i| {
                    i.parent.is_some_and(|p| p.id == parent)
                        && i.partition.kind() == kind
                        && i.status.is_not_completed()
                        && i.status_priority.is_some()
                })
                .collect()
        };
        for item in &items {
            state.note_read(tx, item.id);
        }
        Ok(items)
    }

    fn materialize_sub_items(
        &self,
        tx: TxnId,
        parent: ItemId,
        kind: PartitionKind,
    ) -> StoreResult<usize> {
        let mut state = self.state();
        let rows: Vec<WorkItem> = {
            let txn = state.txn(tx)?;
            state
                .visible_all(txn)
                .into_iter()
                .filter(|i| {
                    i.parent.is_some_and(|p| p.id == parent)
                        && i.partition.kind() == kind
                        && i.status == AnalysisStatus::New
                        && i.status_priority.is_none()
                })
                .map(|mut i| {
                    i.materialize_status();
                    i
                })
                .collect()
        };
        let count = rows.len();
        state.put_all(tx, rows)?;
        Ok(count)
    }

    fn has_not_completed_sub_items(&self, tx: TxnId, parent: ItemId) -> StoreResult<bool> {
        let state = self.state();
        let txn = state.txn(tx)?;
        Ok(state
            .visible_all(txn)
            .iter()
            .any(|i| i.parent.is_some_and(|p| p.id == parent) && i.status.is_not_completed()))
    }

    fn delete_by_status(&self, tx: TxnId, request: &DeleteRequest) -> StoreResult<DeleteReport> {
        let mut state = self.state();
        let matching = |item: &WorkItem| {
            item.partition == request.partition
                && item.status == request.status
                && request
                    .completed_before
                    .map_or(true, |before| item.analysis_end.unwrap_or(item.created_at) <= before)
        };

        let mut report = DeleteReport::default();
        loop {
            let remaining: Vec<ItemId> = {
                let txn = state.txn(tx)?;
                state
                    .visible_all(txn)
                    .into_iter()
                    .filter(|i| matching(i))
                    .map(|i| i.id)
                    .collect()
            };
            if remaining.is_empty() {
                report.completed = true;
                break;
            }
            if report.deleted >= request.max_items || Instant::now() >= request.deadline {
                break;
            }
            let step = request.batch_size.min(request.max_items - report.deleted);
            let txn = state.txn_mut(tx)?;
            for id in remaining.into_iter().take(step) {
                txn.writes.insert(id, Write::Delete);
                report.deleted += 1;
            }
        }
        debug!(
            partition = %request.partition,
            status = %request.status,
            deleted = report.deleted,
            completed = report.completed,
            "delete by status"
        );
        Ok(report)
    }

    fn next_completion_order(&self, tx: TxnId) -> StoreResult<i64> {
        let mut state = self.state();
        state.txn(tx)?;
        state.completion_seq += 1;
        Ok(state.completion_seq)
    }

    fn add_analysis_log(&self, tx: TxnId, entry: AnalysisLogEntry) -> StoreResult<()> {
        self.state().txn_mut(tx)?.log.push(entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::store::LogLevel;
    use crate::transaction::Transaction;

    fn opts(isolation: IsolationLevel) -> TransactionOptions {
        TransactionOptions::new("test", isolation)
    }

    fn materialized(store: &MemoryStore, partition: Partition) {
        let tx = Transaction::begin(store, opts(IsolationLevel::ReadCommitted)).unwrap();
        tx.materialize_index_rows(partition, None).unwrap();
        tx.commit().unwrap();
    }

    #[test]
    fn unmaterialized_items_are_not_pending() {
        let store = MemoryStore::new();
        store.add(NewWorkItem::new(Partition::Global, "k", 1));

        let tx = Transaction::begin(&store, TransactionOptions::read_only("q")).unwrap();
        let cursor = ProgressCursor::default();
        assert!(tx.find_first_pending(Partition::Global, &cursor).unwrap().is_none());
        drop(tx);

        materialized(&store, Partition::Global);
        let tx = Transaction::begin(&store, TransactionOptions::read_only("q")).unwrap();
        assert!(tx.find_first_pending(Partition::Global, &cursor).unwrap().is_some());
    }

    #[test]
    fn pending_order_is_priority_desc_then_id() {
        let store = MemoryStore::new();
        let low = store.add(NewWorkItem::new(Partition::Global, "k", 1));
        let high_a = store.add(NewWorkItem::new(Partition::Global, "k", 5));
        let high_b = store.add(NewWorkItem::new(Partition::Global, "k", 5));
        store.add(NewWorkItem::new(Partition::Resource(1), "k", 9));
        materialized(&store, Partition::Global);

        let tx = Transaction::begin(&store, TransactionOptions::read_only("q")).unwrap();
        let future = Utc::now() + chrono::Duration::seconds(1);
        let batch = tx
            .find_past_pending(Partition::Global, &ProgressCursor::default(), future, 10)
            .unwrap();
        let ids: Vec<_> = batch.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![high_a, high_b, low]);

        let mut cursor = ProgressCursor::default();
        cursor.advance_to(5, high_a);
        let next = tx.find_first_pending(Partition::Global, &cursor).unwrap().unwrap();
        assert_eq!(next.id, high_b);
    }

    #[test]
    fn materialization_limit() {
        let store = MemoryStore::new();
        for _ in 0..5 {
            store.add(NewWorkItem::new(Partition::Global, "k", 1));
        }
        let tx = Transaction::begin(&store, opts(IsolationLevel::ReadCommitted)).unwrap();
        let m = tx.materialize_index_rows(Partition::Global, Some(3)).unwrap();
        assert_eq!(m.count, 3);
        assert!(m.limit_reached);
        assert_eq!(m.last_id, Some(3));
        tx.commit().unwrap();
        assert_eq!(store.get(3).unwrap().status_priority, Some(1));
        assert_eq!(store.get(4).unwrap().status_priority, None);
    }

    #[test]
    fn concurrent_write_makes_commit_stale() {
        let store = MemoryStore::new();
        let id = store.add(NewWorkItem::new(Partition::Global, "k", 1));

        let tx = Transaction::begin(&store, opts(IsolationLevel::ReadCommitted)).unwrap();
        let mut item = tx.upgrade_lock(id).unwrap();
        store.update(id, |i| i.priority = 7);
        item.mark_pending().unwrap();
        tx.persist(&item).unwrap();
        assert!(matches!(tx.commit(), Err(AnalysisError::Stale(x)) if x == id));
        assert_eq!(store.get(id).unwrap().status, AnalysisStatus::New);
    }

    #[test]
    fn serializable_validates_reads() {
        let store = MemoryStore::new();
        let a = store.add(NewWorkItem::new(Partition::Global, "k", 1));
        let b = store.add(NewWorkItem::new(Partition::Global, "k", 1));

        let tx = Transaction::begin(&store, opts(IsolationLevel::Serializable)).unwrap();
        tx.find(a).unwrap();
        let mut item = tx.lock(b).unwrap();
        store.update(a, |i| i.priority = 3);
        item.mark_pending().unwrap();
        tx.persist(&item).unwrap();
        assert!(matches!(tx.commit(), Err(AnalysisError::SerializationFailure(_))));
    }

    #[test]
    fn locks_are_exclusive_until_rollback() {
        let store = MemoryStore::new();
        let id = store.add(NewWorkItem::new(Partition::Global, "k", 1));

        let first = Transaction::begin(&store, opts(IsolationLevel::Serializable)).unwrap();
        first.lock(id).unwrap();
        let second = Transaction::begin(&store, opts(IsolationLevel::Serializable)).unwrap();
        assert!(matches!(second.lock(id), Err(AnalysisError::LockNotAvailable(_))));
        drop(first);
        second.lock(id).unwrap();
    }

    #[test]
    fn killed_connection_loses_its_work() {
        let store = MemoryStore::new();
        let id = store.add(NewWorkItem::new(Partition::Global, "k", 1));

        let tx = Transaction::begin(&store, opts(IsolationLevel::ReadCommitted)).unwrap();
        let mut item = tx.upgrade_lock(id).unwrap();
        let connection = tx.connection_id().unwrap();
        store.kill_connection(connection).unwrap();

        item.mark_pending().unwrap();
        assert!(matches!(tx.persist(&item), Err(AnalysisError::ConnectionKilled(c)) if c == connection));
        assert!(matches!(tx.commit(), Err(AnalysisError::ConnectionKilled(_))));
        assert_eq!(store.killed_connections(), vec![connection]);
        assert_eq!(store.active_transactions(), 0);
    }

    #[test]
    fn kill_can_fail() {
        let store = MemoryStore::new();
        store.set_kill_fails(true);
        assert!(store.kill_connection(1000).is_err());
    }

    #[test]
    fn scheduled_conflicts_fail_matching_commits_only() {
        let store = MemoryStore::new();
        store.fail_commits("reload.", 1);

        let other = Transaction::begin(&store, TransactionOptions::read_only("present.global")).unwrap();
        other.commit().unwrap();

        let first = Transaction::begin(&store, TransactionOptions::read_only("reload.global")).unwrap();
        assert!(matches!(first.commit(), Err(AnalysisError::SerializationFailure(_))));
        let second = Transaction::begin(&store, TransactionOptions::read_only("reload.global")).unwrap();
        second.commit().unwrap();
        assert_eq!(store.active_transactions(), 0);
    }

    #[test]
    fn delete_by_status_respects_max_items() {
        let store = MemoryStore::new();
        for _ in 0..7 {
            let id = store.add(NewWorkItem::new(Partition::Global, "k", 1));
            store.update(id, |i| i.status = AnalysisStatus::Delete);
        }
        let request = DeleteRequest {
            partition: Partition::Global,
            status: AnalysisStatus::Delete,
            completed_before: None,
            batch_size: 2,
            max_items: 5,
            deadline: Instant::now() + Duration::from_secs(5),
        };

        let tx = Transaction::begin(&store, opts(IsolationLevel::ReadCommitted)).unwrap();
        let report = tx.delete_by_status(&request).unwrap();
        tx.commit().unwrap();
        assert_eq!(report, DeleteReport { deleted: 5, completed: false });
        assert_eq!(store.items().len(), 2);

        let tx = Transaction::begin(&store, opts(IsolationLevel::ReadCommitted)).unwrap();
        let report = tx.delete_by_status(&request).unwrap();
        tx.commit().unwrap();
        assert_eq!(report, DeleteReport { deleted: 2, completed: true });
        assert_eq!(store.deleted_count(), 7);
    }

    #[test]
    fn delete_by_status_honours_age() {
        let store = MemoryStore::new();
        let old = store.add(NewWorkItem::new(Partition::Global, "k", 1));
        let recent = store.add(NewWorkItem::new(Partition::Global, "k", 1));
        let now = Utc::now();
        store.update(old, |i| {
            i.status = AnalysisStatus::DonePurge;
            i.analysis_end = Some(now - chrono::Duration::hours(2));
        });
        store.update(recent, |i| {
            i.status = AnalysisStatus::DonePurge;
            i.analysis_end = Some(now);
        });

        let tx = Transaction::begin(&store, opts(IsolationLevel::ReadCommitted)).unwrap();
        let report = tx
            .delete_by_status(&DeleteRequest {
                partition: Partition::Global,
                status: AnalysisStatus::DonePurge,
                completed_before: Some(now - chrono::Duration::hours(1)),
                batch_size: 10,
                max_items: 10,
                deadline: Instant::now() + Duration::from_secs(5),
            })
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(report.deleted, 1);
        assert!(store.get(old).is_none());
        assert!(store.get(recent).is_some());
    }

    #[test]
    fn inserted_sub_items_and_log_appear_on_commit() {
        let store = MemoryStore::new();
        let parent = store.add(NewWorkItem::new(Partition::Global, "p", 1));
        let parent_item = store.get(parent).unwrap();

        let tx = Transaction::begin(&store, opts(IsolationLevel::ReadCommitted)).unwrap();
        let child = tx
            .insert(NewWorkItem::new(Partition::Resource(2), "c", 1).child_of(&parent_item))
            .unwrap();
        tx.add_analysis_log(AnalysisLogEntry::new(parent, LogLevel::Info, "spawned"))
            .unwrap();
        assert!(tx.has_not_completed_sub_items(parent).unwrap());
        assert!(tx
            .find_not_completed_sub_items(parent, PartitionKind::Resource)
            .unwrap()
            .is_empty());
        assert_eq!(tx.materialize_sub_items(parent, PartitionKind::Resource).unwrap(), 1);
        tx.commit().unwrap();

        assert_eq!(store.get(child).unwrap().status_priority, Some(1));
        assert_eq!(store.analysis_log().len(), 1);
    }
}

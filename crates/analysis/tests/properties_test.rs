//! Invariants of the scheduler that hold across items and passes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use shopfloor_analysis::scripted::SCRIPTED_KIND;
use shopfloor_analysis::{
    AttemptState, CancellationToken, GlobalPartition, HandlerRegistry, ModificationExecutor,
    Outcome, PartitionOps, PauseCoordinator, PendingQueueProcessor, ProcessorObserver, Script,
    ScriptedHandler, Step,
};
use shopfloor_core::{
    AnalysisStatus, ExecutionMode, ItemId, NewWorkItem, Partition, SchedulerConfig, WorkItem,
};
use shopfloor_storage::{MemoryStore, Store};

fn scripted(partition: Partition, priority: i32, script: Script) -> NewWorkItem {
    NewWorkItem::new(partition, SCRIPTED_KIND, priority).with_payload(script.to_payload())
}

fn registry() -> Arc<HandlerRegistry> {
    Arc::new(HandlerRegistry::new().with(Arc::new(ScriptedHandler::default())))
}

fn inline_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.execution_mode = ExecutionMode::Inline;
    config
}

fn global(
    store: &Arc<MemoryStore>,
    config: SchedulerConfig,
    observer: Option<Arc<dyn ProcessorObserver>>,
) -> PendingQueueProcessor<GlobalPartition> {
    let ops = GlobalPartition::new(&config);
    let store: Arc<dyn Store> = store.clone();
    let mut builder = PendingQueueProcessor::builder(ops, store, registry(), Arc::new(config));
    if let Some(observer) = observer {
        builder = builder.observer(observer);
    }
    builder.build()
}

fn far() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

fn status(store: &MemoryStore, id: ItemId) -> Option<AnalysisStatus> {
    store.get(id).map(|i| i.status)
}

// ── Status priority ─────────────────────────────────────────────────

/// Counts analyses that left `New` without a status row.
#[derive(Default)]
struct RowCheck {
    missing: AtomicUsize,
    checked: AtomicUsize,
}

impl ProcessorObserver for RowCheck {
    fn after_analysis(&self, item: &WorkItem, _completed: bool) {
        self.checked.fetch_add(1, Ordering::SeqCst);
        if item.status != AnalysisStatus::New && item.status_priority.is_none() {
            self.missing.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn status_priority_exists_before_leaving_new() {
    let store = Arc::new(MemoryStore::new());
    for (priority, steps) in [
        (3, vec![Step::Ok]),
        (1, vec![Step::Pending]),
        (2, vec![Step::InProgress, Step::Ok]),
        (5, vec![Step::Integrity]),
        (4, vec![Step::DbTimeout, Step::Ok]),
        (2, vec![Step::Delete]),
    ] {
        store.add(scripted(Partition::Global, priority, Script::steps(steps)));
    }
    store.add(scripted(
        Partition::Global,
        1,
        Script::default().with_sub_items([scripted(Partition::Resource(9), 6, Script::default())]),
    ));
    let check = Arc::new(RowCheck::default());
    let mut processor = global(&store, inline_config(), Some(check.clone()));

    processor.run_once(far(), 0, 0).unwrap();

    assert!(check.checked.load(Ordering::SeqCst) >= 7);
    assert_eq!(check.missing.load(Ordering::SeqCst), 0);
    for item in store.items() {
        if item.status != AnalysisStatus::New {
            assert!(item.status_priority.is_some(), "item {} left new without a row", item.id);
        }
    }
}

// ── Idempotence ─────────────────────────────────────────────────────

#[test]
fn executing_a_done_item_changes_nothing() {
    let store = Arc::new(MemoryStore::new());
    let id = store.add(scripted(Partition::Global, 1, Script::default()));
    let config = Arc::new(inline_config());
    let ops: Arc<dyn PartitionOps> = Arc::new(GlobalPartition::new(&config));
    let dyn_store: Arc<dyn Store> = store.clone();
    let executor = ModificationExecutor::new(dyn_store, registry(), Arc::clone(&config), ops);
    let cancel = CancellationToken::new();

    let item = store.get(id).unwrap();
    let first = executor
        .execute(&item, &AttemptState::new(id), &cancel)
        .unwrap();
    assert_eq!(first.outcome, Outcome::Completed);
    let done = store.get(id).unwrap();
    assert_eq!(done.status, AnalysisStatus::Done);

    for _ in 0..3 {
        let again = executor
            .execute(&done, &AttemptState::new(id), &cancel)
            .unwrap();
        assert_eq!(again.outcome, Outcome::Completed);
        assert_eq!(again.status, AnalysisStatus::Done);
    }
    assert_eq!(store.get(id).unwrap(), done);
}

// ── Pause ownership ─────────────────────────────────────────────────

#[test]
fn concurrent_pause_requests_have_a_single_winner() {
    const CONTENDERS: usize = 8;
    let pause = Arc::new(PauseCoordinator::default());

    for round in 0..50 {
        let barrier = Arc::new(Barrier::new(CONTENDERS));
        let handles: Vec<_> = (1..=CONTENDERS as ItemId)
            .map(|id| {
                let pause = Arc::clone(&pause);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (id, pause.request_pause(7, id))
                })
            })
            .collect();
        let winners: Vec<ItemId> = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|(_, won)| *won)
            .map(|(id, _)| id)
            .collect();

        assert_eq!(winners.len(), 1, "round {round}: winners {winners:?}");
        assert_eq!(pause.pause_owner(7), Some(winners[0]));
        for loser in (1..=CONTENDERS as ItemId).filter(|id| *id != winners[0]) {
            assert!(pause.release_pause(7, loser).is_err());
            assert_eq!(pause.pause_owner(7), Some(winners[0]));
        }
        pause.release_pause(7, winners[0]).unwrap();
        assert_eq!(pause.pause_owner(7), None);
    }
}

// ── Cursor ──────────────────────────────────────────────────────────

#[test]
fn cursor_moves_forward_and_restarts_on_a_lower_bound() {
    let store = Arc::new(MemoryStore::new());
    let hang = Script::steps([Step::Hang]).with_hang(Duration::from_millis(60));
    let ids: Vec<ItemId> = (0..3)
        .map(|_| store.add(scripted(Partition::Global, 2, hang.clone())))
        .collect();
    let low = store.add(scripted(Partition::Global, 1, Script::default()));
    let mut processor = global(&store, inline_config(), None);

    let mut last = 0;
    for expected in &ids[..2] {
        let deadline = Instant::now() + Duration::from_millis(15);
        assert!(!processor.run_once(deadline, 2, 2).unwrap());
        let cursor = processor.present_cursor().unwrap();
        assert!(cursor.last_item_id >= last);
        assert_eq!(cursor.last_item_id, *expected);
        assert_eq!(cursor.min_priority, 2);
        last = cursor.last_item_id;
    }
    assert_eq!(status(&store, low), Some(AnalysisStatus::New));

    let deadline = Instant::now() + Duration::from_millis(15);
    assert!(!processor.run_once(deadline, 0, 0).unwrap());
    let cursor = processor.present_cursor().unwrap();
    assert_eq!(cursor.min_priority, 0);
    assert_eq!(cursor.last_item_id, ids[2]);

    assert!(processor.run_once(far(), 0, 0).unwrap());
    assert_eq!(status(&store, low), Some(AnalysisStatus::Done));
    assert!(processor.present_cursor().is_none());
}

// ── Parent completion ───────────────────────────────────────────────

#[test]
fn parent_waits_for_every_child_in_both_partition_kinds() {
    let store = Arc::new(MemoryStore::new());
    let script = Script::default().with_sub_items([
        scripted(Partition::Global, 1, Script::default()),
        scripted(Partition::Resource(3), 4, Script::steps([Step::Pending])),
    ]);
    let parent = store.add(scripted(Partition::Global, 1, script));
    let mut processor = global(&store, inline_config(), None);

    for _ in 0..3 {
        processor.run_once(far(), 0, 0).unwrap();
        assert_eq!(
            status(&store, parent),
            Some(AnalysisStatus::PendingSubModifications)
        );
    }
    let open: Vec<WorkItem> = store
        .items()
        .into_iter()
        .filter(|i| i.parent.is_some_and(|p| p.id == parent) && i.status.is_not_completed())
        .collect();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].partition, Partition::Resource(3));
    assert_eq!(store.get(parent).unwrap().status_priority, Some(4));

    store.update(open[0].id, |child| child.status = AnalysisStatus::Done);
    processor.run_once(far(), 0, 0).unwrap();
    assert_eq!(status(&store, parent), Some(AnalysisStatus::Done));
}

// ── Cleanup bounds ──────────────────────────────────────────────────

#[test]
fn cleanup_stays_within_its_item_budget() {
    let store = Arc::new(MemoryStore::new());
    for _ in 0..10 {
        store.add(scripted(Partition::Global, 1, Script::steps([Step::Delete])));
    }
    let mut config = inline_config();
    config.cleanup_batch_size = 2;
    config.cleanup_max_items = 3;
    let mut processor = global(&store, config, None);

    processor.run_once(far(), 0, 0).unwrap();
    assert_eq!(store.deleted_count(), 3);
    processor.run_once(far(), 0, 0).unwrap();
    assert_eq!(store.deleted_count(), 6);
}

#[test]
fn cleanup_stays_within_its_time_budget() {
    let store = Arc::new(MemoryStore::new());
    for _ in 0..4 {
        store.add(scripted(Partition::Global, 1, Script::steps([Step::Delete])));
    }
    let mut config = inline_config();
    config.cleanup_max_duration_ms = 0;
    let mut processor = global(&store, config, None);

    assert!(!processor.run_once(far(), 0, 0).unwrap());
    assert_eq!(store.deleted_count(), 0);
    assert!(processor.clean_required());
}

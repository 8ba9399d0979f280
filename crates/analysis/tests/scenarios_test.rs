//! End-to-end scenarios of the modification scheduler.
//!
//! Each test seeds a `MemoryStore` with scripted work items and drives one
//! partition's processor, checking the persisted statuses, bookkeeping and
//! log entries the way an operator report would read them.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shopfloor_analysis::{
    GlobalPartition, HandlerRegistry, PartitionOps, PassPermit, PauseCoordinator,
    PendingQueueProcessor, ResourcePartition, Script, ScriptedHandler, Step,
};
use shopfloor_analysis::scripted::SCRIPTED_KIND;
use shopfloor_core::{
    AnalysisStatus, IsolationLevel, ItemId, NewWorkItem, Partition, SchedulerConfig, WorkItem,
};
use shopfloor_storage::{LogLevel, MemoryStore, Store};

// ── Helpers ─────────────────────────────────────────────────────────

fn scripted(partition: Partition, priority: i32, script: Script) -> NewWorkItem {
    NewWorkItem::new(partition, SCRIPTED_KIND, priority).with_payload(script.to_payload())
}

fn processor<P: PartitionOps>(
    ops: P,
    store: &Arc<MemoryStore>,
    config: SchedulerConfig,
    pause: Option<&Arc<PauseCoordinator>>,
) -> PendingQueueProcessor<P> {
    let registry = Arc::new(HandlerRegistry::new().with(Arc::new(ScriptedHandler::default())));
    let store: Arc<dyn Store> = store.clone();
    let mut builder = PendingQueueProcessor::builder(ops, store, registry, Arc::new(config));
    if let Some(pause) = pause {
        builder = builder.pause(Arc::clone(pause));
    }
    builder.build()
}

fn far() -> Instant {
    Instant::now() + Duration::from_secs(30)
}

fn get(store: &MemoryStore, id: ItemId) -> WorkItem {
    store.get(id).expect("item exists")
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let until = Instant::now() + Duration::from_secs(5);
    while Instant::now() < until {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

// ── A: first-attempt success ────────────────────────────────────────

#[test]
fn item_succeeding_first_time_is_done_after_one_iteration() {
    let store = Arc::new(MemoryStore::new());
    let a = store.add(scripted(Partition::Global, 1, Script::steps([Step::Ok])));
    let config = SchedulerConfig::default();
    let mut global = processor(GlobalPartition::new(&config), &store, config, None);

    assert!(global.run_once(far(), 0, 0).unwrap());

    let a = get(&store, a);
    assert_eq!(a.status, AnalysisStatus::Done);
    assert!(a.analysis_begin.is_some());
    assert!(a.analysis_end.is_some());
    assert_eq!(a.iteration_count, 1);
    assert!(a.completion_order.is_some());
    assert_eq!(a.status_priority, Some(1));
}

// ── B: retried serialization failures ───────────────────────────────

#[test]
fn rolled_back_attempts_count_as_iterations() {
    let store = Arc::new(MemoryStore::new());
    let b = store.add(scripted(
        Partition::Global,
        1,
        Script::steps([
            Step::SerializationFailure,
            Step::SerializationFailure,
            Step::Ok,
        ]),
    ));
    let config = SchedulerConfig::default();
    let mut global = processor(GlobalPartition::new(&config), &store, config, None);

    assert!(global.run_once(far(), 0, 0).unwrap());

    let b = get(&store, b);
    assert_eq!(b.status, AnalysisStatus::Done);
    assert_eq!(b.iteration_count, 3);
    assert_eq!(global.metrics().retries, 2);
}

// ── C: cross-partition children ─────────────────────────────────────

#[test]
fn parent_is_done_once_children_are_terminal_even_when_one_failed() {
    let store = Arc::new(MemoryStore::new());
    let pause = Arc::new(PauseCoordinator::default());
    let script = Script::steps([Step::Ok]).with_sub_items([
        scripted(Partition::Resource(1), 1, Script::steps([Step::Ok])),
        scripted(Partition::Resource(2), 1, Script::steps([Step::Integrity])),
    ]);
    let c = store.add(scripted(Partition::Global, 1, script));
    let config = SchedulerConfig::default();
    let mut global = processor(GlobalPartition::new(&config), &store, config, Some(&pause));

    assert!(global.run_once(far(), 0, 0).unwrap());

    let parent = get(&store, c);
    assert_eq!(parent.status, AnalysisStatus::Done);
    assert!(parent.has_cross_partition_children);

    let children: Vec<WorkItem> = store
        .items()
        .into_iter()
        .filter(|i| i.parent.is_some_and(|p| p.id == c))
        .collect();
    let on = |resource| {
        children
            .iter()
            .find(|i| i.partition == Partition::Resource(resource))
            .map(|i| i.status)
    };
    assert_eq!(on(1), Some(AnalysisStatus::Done));
    assert_eq!(on(2), Some(AnalysisStatus::ConstraintIntegrityViolation));
    assert!(children
        .iter()
        .all(|child| child.completion_order < parent.completion_order));

    let failed = children
        .iter()
        .find(|i| i.partition == Partition::Resource(2))
        .map(|i| i.id);
    assert!(store
        .analysis_log()
        .iter()
        .any(|e| Some(e.item_id) == failed && e.level == LogLevel::Critical));
    assert_eq!(pause.pause_owner(1), None);
    assert_eq!(pause.pause_owner(2), None);
}

// ── D: hung attempt ─────────────────────────────────────────────────

#[test]
fn hung_attempt_is_timed_out_and_retried_next_pass() {
    let store = Arc::new(MemoryStore::new());
    let d = store.add(scripted(
        Partition::Global,
        1,
        Script::steps([Step::Hang, Step::Ok]).with_hang(Duration::from_millis(400)),
    ));
    let mut config = SchedulerConfig::default();
    config.item_timeout_ms = 40;
    config.step_timeout_margin_ms = 0;
    config.timeout_grace_ms = 20;
    let mut global = processor(GlobalPartition::new(&config), &store, config, None);

    assert!(!global.run_once(far(), 0, 0).unwrap());

    let timed_out = get(&store, d);
    assert_eq!(timed_out.status, AnalysisStatus::Timeout);
    assert_eq!(timed_out.iteration_count, 1);
    assert_eq!(store.killed_connections().len(), 1);
    assert!(store
        .analysis_log()
        .iter()
        .any(|e| e.item_id == d && e.level == LogLevel::Warn));
    assert_eq!(global.metrics().timeouts, 1);

    assert!(global.run_once(far(), 0, 0).unwrap());
    let retried = get(&store, d);
    assert_eq!(retried.status, AnalysisStatus::Done);
    assert_eq!(retried.iteration_count, 2);
}

// ── E: item against the resource's continuous loop ──────────────────

fn resource_config() -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.resource_isolation = IsolationLevel::ReadCommitted;
    config.pause_poll_interval_ms = 5;
    config
}

#[test]
fn item_pausing_first_keeps_the_loop_out() {
    let store = Arc::new(MemoryStore::new());
    let pause = Arc::new(PauseCoordinator::new(
        Duration::from_millis(5),
        Duration::from_secs(1),
    ));
    let gate = pause.register_loop(1);
    let id = store.add(scripted(
        Partition::Resource(1),
        1,
        Script::steps([Step::Slow]).with_hang(Duration::from_millis(150)),
    ));
    let config = resource_config();
    let mut resource = processor(ResourcePartition::new(1, &config), &store, config, Some(&pause));

    let worker = thread::spawn(move || resource.run_once(far(), 0, 0));
    assert!(wait_until(|| pause.pause_owner(1) == Some(id)));

    match gate.begin_pass() {
        PassPermit::Paused(owner) => assert_eq!(owner, id),
        PassPermit::Proceed(_) => panic!("loop started a pass while item {id} held the pause"),
    }

    assert!(worker.join().unwrap().unwrap());
    assert_eq!(get(&store, id).status, AnalysisStatus::Done);
    assert_eq!(pause.pause_owner(1), None);
    assert!(matches!(gate.begin_pass(), PassPermit::Proceed(_)));
}

#[test]
fn loop_pass_in_flight_delays_the_item() {
    let store = Arc::new(MemoryStore::new());
    let pause = Arc::new(PauseCoordinator::new(
        Duration::from_millis(5),
        Duration::from_secs(1),
    ));
    let gate = pause.register_loop(1);
    let id = store.add(scripted(Partition::Resource(1), 1, Script::steps([Step::Ok])));
    let config = resource_config();
    let mut resource = processor(ResourcePartition::new(1, &config), &store, config, Some(&pause));

    let guard = match gate.begin_pass() {
        PassPermit::Proceed(guard) => guard,
        PassPermit::Paused(owner) => panic!("resource already paused by {owner}"),
    };
    let worker = thread::spawn(move || resource.run_once(far(), 0, 0));

    // The item owns the token but waits for the pass to end.
    assert!(wait_until(|| pause.pause_owner(1) == Some(id)));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(get(&store, id).analysis_begin, None);

    let pass_ended = chrono::Utc::now();
    drop(guard);

    assert!(worker.join().unwrap().unwrap());
    let item = get(&store, id);
    assert_eq!(item.status, AnalysisStatus::Done);
    assert!(item.analysis_begin.is_some_and(|begin| begin >= pass_ended));
    assert_eq!(pause.pause_owner(1), None);
}

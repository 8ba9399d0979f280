use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use tracing::{debug, error};

use shopfloor_core::{CursorCache, ItemId, Partition, ProgressCursor, SchedulerConfig};
use shopfloor_storage::Store;

use crate::cancel::{CancellationToken, ExitSignal};
use crate::error::SchedulerError;
use crate::executor::ModificationExecutor;
use crate::handler::HandlerRegistry;
use crate::metrics::ProcessorMetrics;
use crate::observer::ProcessorObserver;
use crate::partition::PartitionOps;
use crate::pause::PauseCoordinator;
use crate::supervisor::TimeoutSupervisor;

/// How far the processing of one queued item got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Progress {
    /// The item needs nothing more from this pass.
    Resolved,
    /// Deadline, cancellation, exit request or timeout: the pass ends here.
    Stopped,
}

/// Processes the pending items of one partition.
///
/// One instance owns its partition: calls are sequential and no two items of
/// the partition are ever attempted at the same time.
pub struct PendingQueueProcessor<P: PartitionOps> {
    pub(super) ops: Arc<P>,
    pub(super) store: Arc<dyn Store>,
    pub(super) config: Arc<SchedulerConfig>,
    pub(super) executor: Arc<ModificationExecutor>,
    pub(super) supervisor: TimeoutSupervisor,
    pub(super) observers: Vec<Arc<dyn ProcessorObserver>>,
    pub(super) metrics: Arc<RwLock<ProcessorMetrics>>,
    pub(super) cancel: CancellationToken,
    pub(super) exit: ExitSignal,
    pub(super) past_cursor: CursorCache,
    pub(super) present_cursor: CursorCache,
    /// Max item id seen by the last pass that completed with nothing pending.
    pub(super) max_id_all_completed: Option<ItemId>,
    /// Max item id for which index materialization completed.
    pub(super) materialized_max: Option<ItemId>,
    /// Sticky until a cleanup pass finds nothing left.
    pub(super) clean_required: bool,
    /// An item of the current call was deferred.
    pub(super) pending: bool,
    pub(super) initialized: bool,
}

/// Builder for [`PendingQueueProcessor`].
pub struct ProcessorBuilder<P: PartitionOps> {
    ops: P,
    store: Arc<dyn Store>,
    registry: Arc<HandlerRegistry>,
    config: Arc<SchedulerConfig>,
    pause: Option<Arc<PauseCoordinator>>,
    observers: Vec<Arc<dyn ProcessorObserver>>,
    exit: ExitSignal,
    cancel: CancellationToken,
}

impl<P: PartitionOps> ProcessorBuilder<P> {
    pub fn pause(mut self, pause: Arc<PauseCoordinator>) -> Self {
        self.pause = Some(pause);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn ProcessorObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Share an exit flag with other processors of the process.
    pub fn exit_signal(mut self, exit: ExitSignal) -> Self {
        self.exit = exit;
        self
    }

    pub fn cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> PendingQueueProcessor<P> {
        let ops = Arc::new(self.ops);
        let dyn_ops: Arc<dyn PartitionOps> = ops.clone();
        let mut executor = ModificationExecutor::new(
            Arc::clone(&self.store),
            self.registry,
            Arc::clone(&self.config),
            dyn_ops,
        )
        .with_exit_signal(self.exit.clone());
        if let Some(pause) = self.pause {
            executor = executor.with_pause(pause);
        }
        let executor = Arc::new(executor);
        let supervisor = TimeoutSupervisor::new(Arc::clone(&executor), Arc::clone(&self.config));

        PendingQueueProcessor {
            ops,
            store: self.store,
            config: self.config,
            executor,
            supervisor,
            observers: self.observers,
            metrics: Arc::new(RwLock::new(ProcessorMetrics::default())),
            cancel: self.cancel,
            exit: self.exit,
            past_cursor: CursorCache::default(),
            present_cursor: CursorCache::default(),
            max_id_all_completed: None,
            materialized_max: None,
            clean_required: true,
            pending: false,
            initialized: false,
        }
    }
}

impl<P: PartitionOps> PendingQueueProcessor<P> {
    pub fn builder(
        ops: P,
        store: Arc<dyn Store>,
        registry: Arc<HandlerRegistry>,
        config: Arc<SchedulerConfig>,
    ) -> ProcessorBuilder<P> {
        ProcessorBuilder {
            ops,
            store,
            registry,
            config,
            pause: None,
            observers: Vec::new(),
            exit: ExitSignal::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// One pass over the partition: index materialization, past batches,
    /// present items, then cleanup.
    ///
    /// Returns `true` when every step drained its work before `deadline`.
    pub fn run_once(
        &mut self,
        deadline: Instant,
        mut min_past_priority: i32,
        min_present_priority: i32,
    ) -> Result<bool, SchedulerError> {
        self.initialize();
        if min_present_priority < min_past_priority {
            error!(
                partition = %self.partition(),
                min_past_priority,
                min_present_priority,
                "past priority bound above present bound, lowered"
            );
            min_past_priority = min_present_priority;
        }
        self.pending = false;

        let max_id = self.read("max_item_id", |tx| tx.max_item_id(self.ops.partition()))?;
        let scanned = if max_id.is_some() && max_id == self.max_id_all_completed {
            debug!(partition = %self.partition(), ?max_id, "no new item since the last completed pass");
            true
        } else {
            let materialized = self.materialize(max_id)?;
            let queue_drained = self.run_past(deadline, min_past_priority)?
                && self.run_present(deadline, min_present_priority)?;
            if queue_drained
                && materialized
                && !self.pending
                && min_past_priority == 0
                && min_present_priority == 0
            {
                self.max_id_all_completed = max_id;
            }
            materialized && queue_drained
        };

        let cleaned = if self.config.cleanup_enabled && self.clean_required && !self.should_stop(deadline) {
            self.cleanup(deadline)?
        } else {
            !(self.config.cleanup_enabled && self.clean_required)
        };

        let completed = scanned && cleaned;
        self.with_metrics(|m| m.record_pass(completed));
        debug!(partition = %self.partition(), completed, "pass finished");
        Ok(completed)
    }

    fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        let partition = self.partition();
        for observer in &self.observers {
            observer.initialize(partition);
        }
        self.initialized = true;
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn partition(&self) -> Partition {
        self.ops.partition()
    }

    pub fn ops(&self) -> &P {
        &self.ops
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Get a snapshot of the current metrics.
    pub fn metrics(&self) -> ProcessorMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Get an Arc to the metrics (for external reads without cloning).
    pub fn metrics_handle(&self) -> Arc<RwLock<ProcessorMetrics>> {
        Arc::clone(&self.metrics)
    }

    pub fn exit_signal(&self) -> &ExitSignal {
        &self.exit
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn clean_required(&self) -> bool {
        self.clean_required
    }

    /// Cursor of an interrupted past scan.
    pub fn past_cursor(&self) -> Option<ProgressCursor> {
        self.past_cursor.current()
    }

    /// Cursor of an interrupted present scan.
    pub fn present_cursor(&self) -> Option<ProgressCursor> {
        self.present_cursor.current()
    }

    // ── Shared helpers ──────────────────────────────────────────────

    pub(super) fn should_stop(&self, deadline: Instant) -> bool {
        Instant::now() >= deadline || self.cancel.is_cancelled() || self.exit.is_requested()
    }

    pub(super) fn with_metrics(&self, f: impl FnOnce(&mut ProcessorMetrics)) {
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics);
    }

    pub(super) fn notify(&self, f: impl Fn(&dyn ProcessorObserver)) {
        for observer in &self.observers {
            f(observer.as_ref());
        }
    }
}

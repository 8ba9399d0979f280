//! One transactional attempt of one work item.
//!
//! The executor acquires the pause tokens of the resources the item impacts,
//! opens a transaction at the partition's isolation level, locks the item,
//! runs the business step exactly once, records the attempt bookkeeping and
//! commits. Failures are classified: transient ones ask for a retry, budget
//! and integrity failures are recorded on the item in a short follow-up
//! transaction, fatal ones request process exit. Any other failure ends the
//! item in `Error`, after its open sub-items when it has some.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, warn};

use shopfloor_core::{
    AnalysisError, AnalysisStatus, ConnectionId, ErrorClass, IsolationLevel, ItemId, ResourceId,
    SchedulerConfig, WorkItem,
};
use shopfloor_storage::{AnalysisLogEntry, LogLevel, Store, Transaction, TransactionOptions};

use crate::cancel::{CancellationToken, ExitSignal};
use crate::error::SchedulerError;
use crate::handler::{ApplyContext, HandlerRegistry, ModificationHandler, StepOutcome};
use crate::partition::PartitionOps;
use crate::pause::PauseCoordinator;

const UNKNOWN_CONNECTION: ConnectionId = -1;

/// Result of [`ModificationExecutor::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Retry,
    FatalAbort,
}

/// Outcome plus the item status as last committed.
///
/// When no transaction of the attempt committed, `status` and
/// `status_priority` are the values the item had before the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptReport {
    pub outcome: Outcome,
    pub status: AnalysisStatus,
    pub status_priority: Option<i32>,
}

impl AttemptReport {
    fn before(item: &WorkItem) -> Self {
        Self {
            outcome: Outcome::Retry,
            status: item.status,
            status_priority: item.status_priority,
        }
    }

    fn observe(&mut self, item: &WorkItem) {
        self.status = item.status;
        self.status_priority = item.status_priority;
    }
}

/// Per-item state kept across the attempts of one processing call.
#[derive(Debug)]
pub struct AttemptState {
    item_id: ItemId,
    connection: AtomicI64,
    pause_attempts: AtomicU32,
    carried_iterations: AtomicU32,
    held_pauses: Mutex<Vec<ResourceId>>,
}

impl AttemptState {
    pub fn new(item_id: ItemId) -> Self {
        Self {
            item_id,
            connection: AtomicI64::new(UNKNOWN_CONNECTION),
            pause_attempts: AtomicU32::new(0),
            carried_iterations: AtomicU32::new(0),
            held_pauses: Mutex::new(Vec::new()),
        }
    }

    pub fn item_id(&self) -> ItemId {
        self.item_id
    }

    /// Physical connection of the attempt in flight, if known.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self.connection.load(Ordering::SeqCst) {
            c if c < 0 => None,
            c => Some(c),
        }
    }

    fn set_connection(&self, connection: Option<ConnectionId>) {
        self.connection
            .store(connection.unwrap_or(UNKNOWN_CONNECTION), Ordering::SeqCst);
    }

    pub fn pause_attempts(&self) -> u32 {
        self.pause_attempts.load(Ordering::SeqCst)
    }

    /// Attempts that started but did not commit yet.
    pub fn carried_iterations(&self) -> u32 {
        self.carried_iterations.load(Ordering::SeqCst)
    }

    fn take_carried(&self) -> u32 {
        self.carried_iterations.swap(0, Ordering::SeqCst)
    }

    pub fn held_pauses(&self) -> Vec<ResourceId> {
        self.held_pauses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn hold_pause(&self, resource: ResourceId) {
        let mut held = self.held_pauses.lock().unwrap_or_else(PoisonError::into_inner);
        if !held.contains(&resource) {
            held.push(resource);
        }
    }

    fn take_pauses(&self) -> Vec<ResourceId> {
        std::mem::take(&mut *self.held_pauses.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Runs single attempts of the items of one partition.
pub struct ModificationExecutor {
    store: Arc<dyn Store>,
    registry: Arc<HandlerRegistry>,
    pause: Option<Arc<PauseCoordinator>>,
    config: Arc<SchedulerConfig>,
    ops: Arc<dyn PartitionOps>,
    exit: ExitSignal,
}

impl ModificationExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<HandlerRegistry>,
        config: Arc<SchedulerConfig>,
        ops: Arc<dyn PartitionOps>,
    ) -> Self {
        Self {
            store,
            registry,
            pause: None,
            config,
            ops,
            exit: ExitSignal::new(),
        }
    }

    pub fn with_pause(mut self, pause: Arc<PauseCoordinator>) -> Self {
        self.pause = Some(pause);
        self
    }

    pub fn with_exit_signal(mut self, exit: ExitSignal) -> Self {
        self.exit = exit;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn exit_signal(&self) -> &ExitSignal {
        &self.exit
    }

    /// Run one attempt of `item`.
    pub fn execute(
        &self,
        item: &WorkItem,
        state: &AttemptState,
        cancel: &CancellationToken,
    ) -> Result<AttemptReport, SchedulerError> {
        let mut report = AttemptReport::before(item);
        let handler = match self.registry.get(&item.kind) {
            Ok(handler) => handler,
            Err(e) => {
                let outcome = self.handle_failure(item, state, cancel, e, &mut report)?;
                report.outcome = outcome;
                return Ok(report);
            }
        };
        let resources = handler.impacted_resources(item);

        if !self.acquire_pauses(item, &resources, state, cancel) {
            self.release_pauses(state, true);
            return Ok(report);
        }

        let outcome = match self.attempt(handler.as_ref(), item, state, cancel, &mut report) {
            Ok(outcome) => Ok(outcome),
            Err(e) => self.handle_failure(item, state, cancel, e, &mut report),
        };
        state.set_connection(None);

        let retained = matches!(outcome, Ok(Outcome::Retry));
        self.release_pauses(state, retained);

        report.outcome = outcome?;
        Ok(report)
    }

    /// Release every pause token still held for the item.
    pub fn release_held_pauses(&self, state: &AttemptState) {
        self.release_pauses(state, false);
    }

    // ── Pause tokens ────────────────────────────────────────────────

    fn acquire_pauses(
        &self,
        item: &WorkItem,
        resources: &[ResourceId],
        state: &AttemptState,
        cancel: &CancellationToken,
    ) -> bool {
        let Some(pause) = &self.pause else {
            return true;
        };
        for &resource in resources {
            if cancel.is_cancelled() {
                return false;
            }
            if !pause.request_pause(resource, item.id) {
                let attempts = state.pause_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let owner = pause.pause_owner(resource);
                if attempts >= self.config.max_pause_request_attempts {
                    warn!(item_id = item.id, resource, ?owner, attempts, "pause denied");
                } else {
                    debug!(item_id = item.id, resource, ?owner, attempts, "pause denied");
                }
                cancel.sleep(self.config.pause_retry_sleep());
                return false;
            }
            state.hold_pause(resource);
        }

        if !resources.is_empty() && self.ops.isolation() != IsolationLevel::Serializable {
            let deadline = Instant::now() + self.config.pause_wait_timeout();
            for &resource in resources {
                if !pause.wait_pause(resource, item.id, deadline, cancel) {
                    return false;
                }
            }
        }
        state.pause_attempts.store(0, Ordering::SeqCst);
        true
    }

    /// Release held tokens, unless `retry` and the item is still within its
    /// budget of denied pause requests.
    fn release_pauses(&self, state: &AttemptState, retry: bool) {
        let Some(pause) = &self.pause else {
            return;
        };
        if retry && state.pause_attempts() < self.config.max_pause_request_attempts {
            return;
        }
        for resource in state.take_pauses() {
            if let Err(e) = pause.release_pause(resource, state.item_id) {
                error!(item_id = state.item_id, resource, error = %e, "pause release failed");
            }
        }
    }

    // ── Attempt ─────────────────────────────────────────────────────

    fn transaction_name(item: &WorkItem) -> String {
        format!("analysis.{}.{}", item.kind, item.id)
    }

    fn attempt(
        &self,
        handler: &dyn ModificationHandler,
        item: &WorkItem,
        state: &AttemptState,
        cancel: &CancellationToken,
        report: &mut AttemptReport,
    ) -> Result<Outcome, AnalysisError> {
        let started = Instant::now();
        let isolation = self.ops.isolation();
        let options = TransactionOptions::new(Self::transaction_name(item), isolation)
            .locking(self.ops.lock_hints());
        let tx = Transaction::begin(self.store.as_ref(), options)?;
        state.set_connection(tx.connection_id());

        let mut current = if isolation == IsolationLevel::Serializable {
            tx.lock(item.id)?
        } else {
            tx.upgrade_lock(item.id)?
        };
        if current.status.is_completed() {
            debug!(item_id = item.id, status = %current.status, "item already completed");
            tx.commit()?;
            report.observe(&current);
            return Ok(Outcome::Completed);
        }
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        current.materialize_status();
        current.begin_attempt(Utc::now(), state.carried_iterations());
        state.carried_iterations.fetch_add(1, Ordering::SeqCst);
        debug!(
            item_id = item.id,
            kind = %item.kind,
            iteration = current.iteration_count,
            "attempt started"
        );

        let step = {
            let mut ctx = ApplyContext::new(&tx, cancel, started + self.config.step_timeout());
            handler.apply(&mut ctx, &mut current)?
        };
        if current.status.is_completed() {
            debug!(item_id = item.id, status = %current.status, "status set by the business step");
        } else {
            match step {
                StepOutcome::Completed => current.mark_completed()?,
                StepOutcome::CompletedWithSubItems => current.mark_pending_sub_items()?,
                StepOutcome::InProgress => current.mark_in_progress()?,
                StepOutcome::Pending => current.mark_pending()?,
                StepOutcome::Delete => current.mark_delete()?,
                StepOutcome::Terminal(status) => Self::abandon(&tx, &mut current, status)?,
            }
        }
        if current.status.is_completed() {
            current.completion_order = Some(tx.next_completion_order()?);
        }
        current.end_attempt(Utc::now(), started.elapsed());
        tx.persist(&current)?;
        tx.commit()?;

        state.take_carried();
        report.observe(&current);
        debug!(
            item_id = item.id,
            status = %current.status,
            elapsed = ?started.elapsed(),
            "attempt committed"
        );
        Ok(if current.status.requires_retry() {
            Outcome::Retry
        } else {
            Outcome::Completed
        })
    }

    /// End `item` with `status`, or once its open sub-items complete.
    fn abandon(
        tx: &Transaction<'_>,
        item: &mut WorkItem,
        status: AnalysisStatus,
    ) -> Result<(), AnalysisError> {
        if tx.has_not_completed_sub_items(item.id)? {
            item.defer_until_sub_items(status)
        } else {
            item.mark_terminal(status)
        }
    }

    // ── Failure handling ────────────────────────────────────────────

    fn handle_failure(
        &self,
        item: &WorkItem,
        state: &AttemptState,
        cancel: &CancellationToken,
        err: AnalysisError,
        report: &mut AttemptReport,
    ) -> Result<Outcome, SchedulerError> {
        let class = self.ops.classify(&err, &self.config.transient_integrity);
        match class {
            ErrorClass::TransientRetryable
            | ErrorClass::Interrupted
            | ErrorClass::ResourceBusy
            | ErrorClass::IntegrityViolationTransient => {
                debug!(item_id = item.id, error = %err, ?class, "attempt rolled back, retrying");
                Ok(Outcome::Retry)
            }
            ErrorClass::TransientWithDelay => {
                warn!(item_id = item.id, error = %err, "temporary failure, retrying after a delay");
                cancel.sleep(self.config.temporary_delay());
                Ok(Outcome::Retry)
            }
            ErrorClass::StepBudgetExceeded => {
                warn!(item_id = item.id, error = %err, "step timeout");
                let recorded =
                    self.record_status(item, state, report, None, |_, it| it.mark_step_timeout());
                self.after_record(item, recorded, Outcome::Retry)
            }
            ErrorClass::DatabaseTimeout => {
                warn!(item_id = item.id, error = %err, "database timeout");
                let entry = AnalysisLogEntry::new(
                    item.id,
                    LogLevel::Error,
                    format!("database timeout: {err}"),
                );
                let recorded = self.record_status(item, state, report, Some(entry), |_, it| {
                    it.mark_database_timeout()
                });
                self.after_record(item, recorded, Outcome::Retry)
            }
            ErrorClass::IntegrityViolationFatal => {
                error!(item_id = item.id, error = %err, "constraint integrity violation");
                let entry = AnalysisLogEntry::new(
                    item.id,
                    LogLevel::Critical,
                    format!("constraint integrity violation: {err}"),
                );
                let recorded = self.record_status(item, state, report, Some(entry), |_, it| {
                    it.mark_constraint_integrity_violation()
                });
                self.after_record(item, recorded, Outcome::Completed)
            }
            ErrorClass::Fatal => {
                self.exit
                    .request(format!("item {} failed fatally: {err}", item.id));
                Ok(Outcome::FatalAbort)
            }
            ErrorClass::Unclassified => {
                error!(item_id = item.id, kind = %item.kind, error = %err, "analysis error");
                let entry = AnalysisLogEntry::new(
                    item.id,
                    LogLevel::Critical,
                    format!("analysis error: {err}"),
                );
                let recorded = self.record_status(item, state, report, Some(entry), |tx, it| {
                    Self::abandon(tx, it, AnalysisStatus::Error)
                });
                self.after_record(item, recorded, Outcome::Completed)
            }
        }
    }

    fn after_record(
        &self,
        item: &WorkItem,
        recorded: Result<(), AnalysisError>,
        outcome: Outcome,
    ) -> Result<Outcome, SchedulerError> {
        let Err(e) = recorded else {
            return Ok(outcome);
        };
        match e.class(&self.config.transient_integrity) {
            ErrorClass::Fatal => {
                self.exit
                    .request(format!("status update of item {} failed: {e}", item.id));
                Ok(Outcome::FatalAbort)
            }
            ErrorClass::Unclassified => Err(e.into()),
            _ => {
                debug!(item_id = item.id, error = %e, "status update rolled back, retrying");
                Ok(Outcome::Retry)
            }
        }
    }

    /// Record a status in a short follow-up transaction, with the attempts
    /// that rolled back.
    fn record_status(
        &self,
        item: &WorkItem,
        state: &AttemptState,
        report: &mut AttemptReport,
        entry: Option<AnalysisLogEntry>,
        transition: impl FnOnce(&Transaction<'_>, &mut WorkItem) -> Result<(), AnalysisError>,
    ) -> Result<(), AnalysisError> {
        let options = TransactionOptions::new(
            format!("{}.status", Self::transaction_name(item)),
            IsolationLevel::ReadCommitted,
        );
        let tx = Transaction::begin(self.store.as_ref(), options)?;
        let mut current = tx.find(item.id)?.ok_or(AnalysisError::NotFound(item.id))?;
        if current.status.is_completed() {
            tx.commit()?;
            report.observe(&current);
            return Ok(());
        }

        current.carry_attempts(Utc::now(), state.carried_iterations());
        transition(&tx, &mut current)?;
        if current.status.is_completed() {
            current.completion_order = Some(tx.next_completion_order()?);
        }
        tx.persist(&current)?;
        if let Some(entry) = entry {
            tx.add_analysis_log(entry)?;
        }
        tx.commit()?;

        state.take_carried();
        report.observe(&current);
        Ok(())
    }

    /// Mark an item whose attempt overran its wall-clock budget.
    pub fn mark_timeout(
        &self,
        item: &WorkItem,
        state: &AttemptState,
        elapsed: Duration,
    ) -> Result<AttemptReport, AnalysisError> {
        let mut report = AttemptReport::before(item);
        let connection = state.connection();
        let entry = AnalysisLogEntry::new(
            item.id,
            LogLevel::Warn,
            format!(
                "analysis timeout after {}ms, connection {}",
                elapsed.as_millis(),
                connection.map_or_else(|| "unknown".to_string(), |c| c.to_string())
            ),
        );
        self.record_status(item, state, &mut report, Some(entry), |_, it| {
            it.mark_timeout()?;
            it.end_attempt(Utc::now(), elapsed);
            Ok(())
        })?;
        warn!(item_id = item.id, ?connection, ?elapsed, "analysis timeout");
        Ok(report)
    }
}

use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use shopfloor_core::{ExecutionMode, SchedulerConfig, WorkItem};

use crate::cancel::{CancellationToken, ExitSignal};
use crate::error::SchedulerError;
use crate::executor::{AttemptReport, AttemptState, ModificationExecutor, Outcome};

const RESULT_POLL: Duration = Duration::from_millis(10);

type AttemptResult = Result<AttemptReport, SchedulerError>;

/// Result of a supervised attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervised {
    /// The attempt ended within its budget.
    Attempt(AttemptReport),
    /// The attempt overran its budget and the item was marked `Timeout`.
    TimedOut(AttemptReport),
}

/// Enforces the wall-clock budget of item attempts.
///
/// Escalation on overrun: cooperative cancel, forced abort, then mark the
/// item `Timeout` and kill its store connection. When the connection cannot
/// be killed the process is asked to exit.
pub struct TimeoutSupervisor {
    executor: Arc<ModificationExecutor>,
    config: Arc<SchedulerConfig>,
    exit: ExitSignal,
}

impl TimeoutSupervisor {
    pub fn new(executor: Arc<ModificationExecutor>, config: Arc<SchedulerConfig>) -> Self {
        let exit = executor.exit_signal().clone();
        Self {
            executor,
            config,
            exit,
        }
    }

    pub fn executor(&self) -> &Arc<ModificationExecutor> {
        &self.executor
    }

    pub fn run(
        &self,
        item: &WorkItem,
        state: &Arc<AttemptState>,
        cancel: &CancellationToken,
    ) -> Result<Supervised, SchedulerError> {
        match self.config.execution_mode {
            ExecutionMode::Inline => self
                .executor
                .execute(item, state, cancel)
                .map(Supervised::Attempt),
            ExecutionMode::Worker => self.run_on_worker(item, state, cancel),
        }
    }

    fn run_on_worker(
        &self,
        item: &WorkItem,
        state: &Arc<AttemptState>,
        cancel: &CancellationToken,
    ) -> Result<Supervised, SchedulerError> {
        let token = cancel.child_token();
        let (tx, rx) = mpsc::channel();
        let started = Instant::now();

        let executor = Arc::clone(&self.executor);
        let worker_item = item.clone();
        let worker_state = Arc::clone(state);
        let worker_token = token.clone();
        thread::Builder::new()
            .name(format!("modification-{}", item.id))
            .spawn(move || {
                let result = executor.execute(&worker_item, &worker_state, &worker_token);
                let _ = tx.send(result);
            })
            .map_err(|e| SchedulerError::Worker(format!("failed to spawn worker: {e}")))?;

        let budget = self.config.supervised_timeout();
        if let Some(result) = wait_result(&rx, started + budget)? {
            return result.map(Supervised::Attempt);
        }

        let grace = self.config.timeout_grace();
        warn!(item_id = item.id, ?budget, "item timeout, cancelling attempt");
        token.cancel();
        if let Some(result) = wait_result(&rx, Instant::now() + grace)? {
            return self.stopped(item, state, started, result);
        }

        warn!(item_id = item.id, ?grace, "cancellation ignored, aborting attempt");
        token.abort();
        if let Some(result) = wait_result(&rx, Instant::now() + grace)? {
            return self.stopped(item, state, started, result);
        }

        error!(item_id = item.id, elapsed = ?started.elapsed(), "abort failed");
        let report = self.timeout_report(item, state, started);
        if self.config.exit_on_failed_abort {
            return Err(self.request_exit(format!("abort of item {} failed", item.id)));
        }

        match state.connection() {
            Some(connection) => match self.executor.store().kill_connection(connection) {
                Ok(()) => {
                    info!(item_id = item.id, connection, "connection of timed out item killed");
                    Ok(Supervised::TimedOut(report))
                }
                Err(e) => Err(self.request_exit(format!(
                    "kill of connection {connection} of item {} failed: {e}",
                    item.id
                ))),
            },
            None => Err(self.request_exit(format!(
                "abort of item {} failed and its connection is unknown",
                item.id
            ))),
        }
    }

    /// The worker returned after cancel or abort.
    fn stopped(
        &self,
        item: &WorkItem,
        state: &AttemptState,
        started: Instant,
        result: AttemptResult,
    ) -> Result<Supervised, SchedulerError> {
        let report = result?;
        if report.outcome != Outcome::Retry {
            return Ok(Supervised::Attempt(report));
        }
        Ok(Supervised::TimedOut(self.timeout_report(item, state, started)))
    }

    fn timeout_report(&self, item: &WorkItem, state: &AttemptState, started: Instant) -> AttemptReport {
        match self.executor.mark_timeout(item, state, started.elapsed()) {
            Ok(report) => report,
            Err(e) => {
                error!(item_id = item.id, error = %e, "failed to mark item timeout");
                AttemptReport {
                    outcome: Outcome::Retry,
                    status: item.status,
                    status_priority: item.status_priority,
                }
            }
        }
    }

    fn request_exit(&self, reason: String) -> SchedulerError {
        self.exit.request(reason.clone());
        SchedulerError::ExitRequested(reason)
    }
}

/// Wait for the worker result until `until`. `None` on timeout.
fn wait_result(
    rx: &Receiver<AttemptResult>,
    until: Instant,
) -> Result<Option<AttemptResult>, SchedulerError> {
    loop {
        let now = Instant::now();
        if now >= until {
            return Ok(None);
        }
        match rx.recv_timeout(RESULT_POLL.min(until - now)) {
            Ok(result) => return Ok(Some(result)),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                return Err(SchedulerError::Worker(
                    "worker exited without a result".to_string(),
                ))
            }
        }
    }
}

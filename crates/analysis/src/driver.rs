use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use shopfloor_core::ErrorClass;

use crate::cancel::{CancellationToken, ExitSignal};
use crate::error::SchedulerError;
use crate::partition::PartitionOps;
use crate::processor::PendingQueueProcessor;

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Runs one partition's processor until shutdown or a fatal error.
pub struct SchedulerDriver<P: PartitionOps> {
    processor: PendingQueueProcessor<P>,
    shutdown: Arc<AtomicBool>,
    exit: ExitSignal,
    min_past_priority: i32,
    min_present_priority: i32,
}

impl<P: PartitionOps> SchedulerDriver<P> {
    pub fn new(processor: PendingQueueProcessor<P>) -> Self {
        let exit = processor.exit_signal().clone();
        Self {
            processor,
            shutdown: Arc::new(AtomicBool::new(false)),
            exit,
            min_past_priority: 0,
            min_present_priority: 0,
        }
    }

    /// Only process items at or above these status priorities.
    pub fn with_min_priorities(mut self, past: i32, present: i32) -> Self {
        self.min_past_priority = past;
        self.min_present_priority = present;
        self
    }

    pub fn processor(&self) -> &PendingQueueProcessor<P> {
        &self.processor
    }

    /// Signal the driver to stop after the current pass.
    pub fn shutdown(&self) {
        info!(partition = %self.processor.partition(), "driver shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Get an Arc to the shutdown flag (for external shutdown signaling).
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed) || self.exit.is_requested()
    }

    /// Run passes until shutdown. Returns an error when a fatal condition
    /// ends the loop; the exit signal is then set.
    pub fn run(&mut self) -> Result<(), SchedulerError> {
        let partition = self.processor.partition();
        info!(%partition, "driver started");

        while !self.stopping() {
            let deadline = Instant::now() + self.processor.config().run_budget();
            match self.processor.run_once(
                deadline,
                self.min_past_priority,
                self.min_present_priority,
            ) {
                Ok(completed) => debug!(%partition, completed, "pass done"),
                Err(e) => match e.class(&self.processor.config().transient_integrity) {
                    ErrorClass::TransientRetryable | ErrorClass::Interrupted => {
                        debug!(%partition, error = %e, "transient pass failure");
                    }
                    ErrorClass::TransientWithDelay => {
                        warn!(%partition, error = %e, "temporary pass failure, cooling down");
                        self.sleep(self.processor.config().temporary_delay());
                    }
                    ErrorClass::Fatal => {
                        error!(%partition, error = %e, "fatal pass failure, driver stopping");
                        self.exit.request(e.to_string());
                        return Err(e);
                    }
                    _ => {
                        error!(%partition, error = %e, "pass failed");
                    }
                },
            }
            self.sleep(self.processor.config().driver_sleep());
        }

        if self.exit.is_requested() {
            let reason = self.exit.reason().unwrap_or_default();
            warn!(%partition, %reason, "driver stopped on exit request");
            return Err(SchedulerError::ExitRequested(reason));
        }
        info!(%partition, "driver stopped");
        Ok(())
    }

    fn sleep(&self, duration: Duration) {
        let until = Instant::now() + duration;
        while !self.stopping() {
            let now = Instant::now();
            if now >= until {
                break;
            }
            thread::sleep(SLEEP_SLICE.min(until - now));
        }
    }
}

impl<P: PartitionOps> SchedulerDriver<P> {
    /// Run the driver on a dedicated named thread.
    pub fn spawn(mut self) -> std::io::Result<DriverHandle> {
        let shutdown = self.shutdown_signal();
        let exit = self.exit.clone();
        let cancel = self.processor.cancellation().clone();
        let join = thread::Builder::new()
            .name(format!("driver-{}", self.processor.ops().label()))
            .spawn(move || self.run())?;
        Ok(DriverHandle {
            shutdown,
            exit,
            cancel,
            join,
        })
    }
}

/// Handle of a driver running on its own thread.
pub struct DriverHandle {
    shutdown: Arc<AtomicBool>,
    exit: ExitSignal,
    cancel: CancellationToken,
    join: JoinHandle<Result<(), SchedulerError>>,
}

impl DriverHandle {
    /// Stop after the current pass.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Stop as soon as possible, cancelling the item in flight.
    pub fn cancel(&self) {
        self.shutdown();
        self.cancel.cancel();
    }

    pub fn exit_signal(&self) -> &ExitSignal {
        &self.exit
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub fn join(self) -> Result<(), SchedulerError> {
        self.join
            .join()
            .map_err(|_| SchedulerError::Worker("driver thread panicked".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use shopfloor_core::{AnalysisStatus, NewWorkItem, Partition, SchedulerConfig};
    use shopfloor_storage::{MemoryStore, Store};

    use crate::handler::HandlerRegistry;
    use crate::partition::GlobalPartition;
    use crate::scripted::{Script, ScriptedHandler, Step, SCRIPTED_KIND};

    fn driver(store: &Arc<MemoryStore>) -> SchedulerDriver<GlobalPartition> {
        let mut config = SchedulerConfig::default();
        config.driver_sleep_ms = 10;
        let config = Arc::new(config);
        let registry = Arc::new(HandlerRegistry::new().with(Arc::new(ScriptedHandler::default())));
        let store: Arc<dyn Store> = store.clone();
        let processor = PendingQueueProcessor::builder(
            GlobalPartition::new(&config),
            store,
            registry,
            Arc::clone(&config),
        )
        .build();
        SchedulerDriver::new(processor)
    }

    fn scripted(steps: impl IntoIterator<Item = Step>) -> NewWorkItem {
        NewWorkItem::new(Partition::Global, SCRIPTED_KIND, 1)
            .with_payload(Script::steps(steps).to_payload())
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let until = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < until {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn shutdown_before_run_returns_immediately() {
        let store = Arc::new(MemoryStore::new());
        let mut driver = driver(&store);
        driver.shutdown();
        driver.run().unwrap();
        assert_eq!(driver.processor().metrics().passes, 0);
    }

    #[test]
    fn processes_items_until_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let id = store.add(scripted([Step::Stale, Step::Ok]));

        let handle = driver(&store).spawn().unwrap();
        wait_for(|| store.get(id).is_some_and(|i| i.status == AnalysisStatus::Done));
        handle.shutdown();
        handle.join().unwrap();

        let item = store.get(id).unwrap();
        assert_eq!(item.status, AnalysisStatus::Done);
        assert_eq!(item.iteration_count, 2);
    }

    #[test]
    fn fatal_error_stops_the_driver() {
        let store = Arc::new(MemoryStore::new());
        store.add(scripted([Step::OutOfMemory]));

        let handle = driver(&store).spawn().unwrap();
        let exit = handle.exit_signal().clone();
        let err = handle.join().unwrap_err();
        assert!(err.is_fatal());
        assert!(exit.is_requested());
    }

    #[test]
    fn transient_pass_errors_keep_the_loop_running() {
        let store = Arc::new(MemoryStore::new());
        let id = store.add(scripted([Step::Ok]));
        // More conflicts than one pass retries.
        store.fail_commits("max_item_id.", 25);

        let handle = driver(&store).spawn().unwrap();
        wait_for(|| store.get(id).is_some_and(|i| i.status == AnalysisStatus::Done));
        assert!(!handle.is_finished());
        handle.cancel();
        handle.join().unwrap();
        assert_eq!(store.get(id).unwrap().status, AnalysisStatus::Done);
    }

    #[test]
    fn failing_item_does_not_stop_the_driver() {
        let store = Arc::new(MemoryStore::new());
        let bad = store.add(scripted([Step::Business]));
        let good = store.add(scripted([Step::Ok]));

        let handle = driver(&store).spawn().unwrap();
        wait_for(|| store.get(good).is_some_and(|i| i.status == AnalysisStatus::Done));
        assert!(!handle.is_finished());
        handle.shutdown();
        handle.join().unwrap();
        assert_eq!(store.get(bad).unwrap().status, AnalysisStatus::Error);
    }
}

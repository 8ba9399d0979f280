//! Transactional modification scheduler.
//!
//! Work items are queued per partition (the global partition and one per
//! resource). A [`PendingQueueProcessor`] drains a partition's queue, handing
//! each item to the [`ModificationExecutor`] under a [`TimeoutSupervisor`].
//! The [`PauseCoordinator`] arbitrates exclusive access to resources between
//! item attempts and continuous per-resource loops. A [`SchedulerDriver`]
//! calls a processor repeatedly until shutdown.

pub mod cancel;
pub mod driver;
pub mod error;
pub mod executor;
pub mod handler;
pub mod metrics;
pub mod observer;
pub mod partition;
pub mod pause;
pub mod processor;
pub mod scripted;
pub mod supervisor;

pub use cancel::{CancellationToken, ExitSignal};
pub use driver::{DriverHandle, SchedulerDriver};
pub use error::{PauseError, SchedulerError};
pub use executor::{AttemptReport, AttemptState, ModificationExecutor, Outcome};
pub use handler::{ApplyContext, HandlerRegistry, ModificationHandler, StepOutcome};
pub use metrics::ProcessorMetrics;
pub use observer::ProcessorObserver;
pub use partition::{GlobalPartition, PartitionOps, ResourcePartition};
pub use pause::{ContinuousLoopGate, PassGuard, PassPermit, PauseCoordinator};
pub use processor::{PendingQueueProcessor, ProcessorBuilder};
pub use scripted::{Script, ScriptedHandler, Step};
pub use supervisor::{Supervised, TimeoutSupervisor};

//! Shared data model for the modification scheduler.
//!
//! Work items, their analysis status machine, the progress cursor used by
//! queue scans, the error taxonomy shared by the store and business steps,
//! and the scheduler configuration.

pub mod config;
pub mod cursor;
pub mod error;
pub mod item;
pub mod status;

pub use config::{ExecutionMode, IntegrityPattern, IsolationLevel, SchedulerConfig};
pub use cursor::{CursorCache, ProgressCursor};
pub use error::{AnalysisError, ConfigError, ErrorClass, IntegrityViolation};
pub use item::{
    ConnectionId, ItemId, NewWorkItem, ParentRef, Partition, PartitionKind, ResourceId, WorkItem,
};
pub use status::AnalysisStatus;

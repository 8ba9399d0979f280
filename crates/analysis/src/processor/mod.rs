//! Pending-queue processor -- drains the work items of one partition.
//!
//! Split into focused submodules:
//! - `core`: processor struct, builder, accessors, and `run_once`
//! - `queue`: index materialization, past-batch and present scans, item retries
//! - `sub_items`: recursive resolution of sub-items and parent completion
//! - `cleanup`: bounded removal of deleted and purgeable items

mod cleanup;
mod core;
mod queue;
mod sub_items;

pub use self::core::{PendingQueueProcessor, ProcessorBuilder};

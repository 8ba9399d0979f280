//! Transactional persistence interface of the scheduler and its in-memory backend.

pub mod memory;
pub mod store;
pub mod transaction;

pub use memory::MemoryStore;
pub use store::{
    AnalysisLogEntry, DeleteReport, DeleteRequest, LogLevel, Materialized, Store, StoreResult,
    TransactionOptions, TxnId,
};
pub use transaction::Transaction;

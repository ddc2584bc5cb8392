//! Batch execution over study records.
//!
//! - the per-record lock protocol (`job`)
//! - the bounded worker pool, lock ledger and run report (`pool`)

pub mod job;
pub mod pool;

pub use job::*;
pub use pool::*;

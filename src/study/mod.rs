//! Studies: which records exist, where their files live, and what is loaded
//! for each of them.
//!
//! - protocol table, covariates and persistence (`protocol`)
//! - per-record iteration with dependency loading (`iterator`)

pub mod iterator;
pub mod protocol;

pub use iterator::*;
pub use protocol::*;

//! `fmri-fields` library crate.
//!
//! The binary (`fmrifit`) is a thin wrapper around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the kernel fit and the batch layer are reusable on their own
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod batch;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod report;
pub mod study;

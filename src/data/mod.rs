//! Data sources for the pipeline.
//!
//! - seeded synthetic subjects and studies (`synthetic`)

pub mod synthetic;

pub use synthetic::*;

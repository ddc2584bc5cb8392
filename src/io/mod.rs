//! On-disk artifacts.
//!
//! - typed JSON persistence with lock recognition (`store`)
//! - advisory per-path locks (`lock`)
//! - templated per-record file naming (`layout`)

pub mod layout;
pub mod lock;
pub mod store;

pub use layout::*;
pub use lock::*;
pub use store::*;

//! Infrastructure shared by the workspace crates: logging setup, bounded
//! parallel mapping and optional shared callbacks.

pub mod log_setup;
pub mod parallel;
pub mod shared_fn;

pub use shared_fn::SharedFn;

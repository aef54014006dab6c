//! Memory subsystem: fixed-block pooling and allocation tracking.
//!
//! Components:
//! - `pool`: Single-threaded fixed-size unit allocator over one arena
//! - `debug`: Memory tracker to record usage by category

pub mod debug;
pub mod pool;

pub use debug::*;
pub use pool::*;

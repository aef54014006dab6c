pub mod config;
pub mod error;
pub mod logging;
pub mod memory;

pub use config::{ConkitConfig, LoggingConfig, PoolConfig};
pub use error::*;
pub use memory::{Block, MemoryPool, PoolStats};

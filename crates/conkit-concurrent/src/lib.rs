//! Concurrent containers for conkit
//!
//! - `queue`: Two-lock blocking multi-producer multi-consumer FIFO
//! - `spsc`: Lock-free single-producer single-consumer linked FIFO
//! - `stack`: Lock-free multi-producer multi-consumer LIFO with split
//!   reference counting for node reclamation

pub mod queue;
pub mod spsc;
pub mod stack;
mod sync;

pub use queue::LockBasedQueue;
pub use spsc::{channel as spsc_channel, Consumer as SpscConsumer, Producer as SpscProducer};
pub use stack::LockFreeStack;

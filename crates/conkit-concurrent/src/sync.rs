// Atomics used by the lock-free containers. Test builds with the `loom`
// feature get loom's model-checked types instead.

#[cfg(all(test, feature = "loom"))]
pub(crate) use loom::sync::atomic::{AtomicIsize, AtomicPtr, AtomicU64, Ordering};

#[cfg(not(all(test, feature = "loom")))]
pub(crate) use std::sync::atomic::{AtomicIsize, AtomicPtr, AtomicU64, Ordering};

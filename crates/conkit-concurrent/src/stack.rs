//! Lock-free Treiber stack with split reference counting.
//!
//! A popper must dereference the head node to read its successor, while a
//! concurrent popper may already have unlinked that node. Nodes are therefore
//! reclaimed only once nobody can still be reading them:
//!
//! - The head is a counted pointer `(external_count, node)`. Every pop first
//!   "checks out" the head by bumping `external_count` with a CAS, so the
//!   node cannot be freed under it. The count also changes the head word on
//!   every checkout, which defeats ABA on the later CAS.
//! - Each node carries an `internal_count` that collects retired checkouts.
//! - The popper whose CAS unlinks the node adds `external_count - 2` (its own
//!   checkout plus the list's reference). A popper that loses the race
//!   subtracts one. Whoever moves `internal_count` to zero frees the node.
//!
//! The counted pointer is packed into a single `u64`: the node address minus
//! its alignment bits in the low bits and the external count above it
//! (19 count bits on 64-bit targets, 35 on 32-bit). Popping an empty stack
//! does not touch the count. A checkout that would push the count past its
//! field waits for the head to change instead, so the count is exact.

use crate::sync::{AtomicIsize, AtomicU64, Ordering};
use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ptr;
use tracing::trace;

#[cfg(target_pointer_width = "64")]
const ADDRESS_BITS: u32 = 48;
#[cfg(not(target_pointer_width = "64"))]
const ADDRESS_BITS: u32 = 32;

// Matches the `repr(align(8))` on `Node`.
const ALIGN_BITS: u32 = 3;
const POINTER_BITS: u32 = ADDRESS_BITS - ALIGN_BITS;
const POINTER_MASK: u64 = (1 << POINTER_BITS) - 1;
const MAX_EXTERNAL_COUNT: u64 = u64::MAX >> POINTER_BITS;

#[repr(align(8))]
struct Node<T> {
    data: ManuallyDrop<T>,
    internal_count: AtomicIsize,
    // Written before the node is published, read-only afterwards.
    next: CountedPtr<T>,
}

struct CountedPtr<T> {
    external_count: u64,
    ptr: *mut Node<T>,
}

impl<T> Clone for CountedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CountedPtr<T> {}

impl<T> CountedPtr<T> {
    const NULL: Self = Self {
        external_count: 0,
        ptr: ptr::null_mut(),
    };

    #[inline]
    fn pack(self) -> u64 {
        let addr = self.ptr as usize as u64;
        debug_assert_eq!(addr & ((1 << ALIGN_BITS) - 1), 0, "node is under-aligned");
        debug_assert_eq!(addr >> ADDRESS_BITS, 0, "node address exceeds {ADDRESS_BITS} bits");
        debug_assert!(self.external_count <= MAX_EXTERNAL_COUNT, "external count overflow");
        (self.external_count << POINTER_BITS) | (addr >> ALIGN_BITS)
    }

    #[inline]
    fn unpack(word: u64) -> Self {
        Self {
            external_count: word >> POINTER_BITS,
            ptr: ((word & POINTER_MASK) << ALIGN_BITS) as usize as *mut Node<T>,
        }
    }
}

/// Lock-free MPMC stack.
pub struct LockFreeStack<T> {
    head: AtomicU64,
    _marker: PhantomData<Box<Node<T>>>,
}

unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> LockFreeStack<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicU64::new(CountedPtr::<T>::NULL.pack()),
            _marker: PhantomData,
        }
    }

    /// Push `value` on top of the stack.
    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            data: ManuallyDrop::new(value),
            internal_count: AtomicIsize::new(0),
            next: CountedPtr::NULL,
        }));
        // Only the head refers to a freshly pushed node.
        let new_head = CountedPtr {
            external_count: 1,
            ptr: node,
        }
        .pack();

        let mut observed = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is unpublished until the CAS succeeds.
            unsafe { (*node).next = CountedPtr::unpack(observed) };
            match self.head.compare_exchange_weak(
                observed,
                new_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => observed = actual,
            }
        }
    }

    /// Pop the top element, or `None` if the stack is empty.
    pub fn pop(&self) -> Option<T> {
        let mut observed = self.head.load(Ordering::Relaxed);
        loop {
            let head = self.check_out_head(&mut observed);
            let node = head.ptr;
            if node.is_null() {
                return None;
            }

            // SAFETY: the checkout keeps `node` alive until we retire it below.
            let next = unsafe { (*node).next }.pack();
            match self
                .head
                .compare_exchange(observed, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    // SAFETY: our CAS unlinked the node, so no other popper
                    // can win it; the payload is ours to move out.
                    let value = unsafe { ManuallyDrop::take(&mut (*node).data) };

                    // one for the list's reference, one for our checkout
                    let count_increase = head.external_count as isize - 2;
                    let previous = unsafe {
                        (*node)
                            .internal_count
                            .fetch_add(count_increase, Ordering::Release)
                    };
                    if previous == -count_increase {
                        trace!("reclaiming node after unlinking it");
                        // SAFETY: no checkouts remain.
                        unsafe { drop(Box::from_raw(node)) };
                    }
                    return Some(value);
                }
                Err(actual) => {
                    observed = actual;
                    let previous = unsafe {
                        (*node)
                            .internal_count
                            .fetch_sub(1, Ordering::Relaxed)
                    };
                    if previous == 1 {
                        // Synchronize with the unlinking thread's release.
                        let _ = unsafe { (*node).internal_count.load(Ordering::Acquire) };
                        trace!("reclaiming node as its last reader");
                        // SAFETY: the node is unlinked and ours was the last checkout.
                        unsafe { drop(Box::from_raw(node)) };
                    }
                }
            }
        }
    }

    /// Snapshot; may be stale by the time the caller looks at it.
    pub fn is_empty(&self) -> bool {
        CountedPtr::<T>::unpack(self.head.load(Ordering::Acquire))
            .ptr
            .is_null()
    }

    /// Bump the external count of the current head, retrying until the head
    /// we bump is the head we observed. On return `observed` holds the
    /// installed word. An empty head is returned as-is, uncounted.
    fn check_out_head(&self, observed: &mut u64) -> CountedPtr<T> {
        loop {
            let mut counted = CountedPtr::<T>::unpack(*observed);
            if counted.ptr.is_null() {
                return counted;
            }
            if counted.external_count == MAX_EXTERNAL_COUNT {
                // The count never wraps. The holder of the last checkout
                // either unlinks the node or sees the head move; wait for that.
                std::hint::spin_loop();
                *observed = self.head.load(Ordering::Relaxed);
                continue;
            }
            counted.external_count += 1;
            let desired = counted.pack();
            match self.head.compare_exchange(
                *observed,
                desired,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    *observed = desired;
                    return counted;
                }
                Err(actual) => *observed = actual,
            }
        }
    }
}

impl<T> Default for LockFreeStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockFreeStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFreeStack")
            .field("empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn pop_on_fresh_stack_is_none() {
        let stack: LockFreeStack<u32> = LockFreeStack::new();
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), None);
        // checking out an empty head must not make it look non-empty
        assert!(stack.is_empty());
    }

    #[test]
    fn empty_pops_leave_head_untouched() {
        let stack: LockFreeStack<u32> = LockFreeStack::new();
        let empty_word = stack.head.load(Ordering::Relaxed);
        for _ in 0..=(MAX_EXTERNAL_COUNT as usize + 1) {
            assert_eq!(stack.pop(), None);
        }
        assert_eq!(stack.head.load(Ordering::Relaxed), empty_word);

        stack.push(7);
        assert_eq!(stack.pop(), Some(7));
        assert!(stack.is_empty());
    }

    #[test]
    fn saturated_count_waits_for_head_to_move() {
        let stack = Arc::new(LockFreeStack::new());
        stack.push(1);
        let bottom = CountedPtr::<i32>::unpack(stack.head.load(Ordering::Relaxed)).ptr;
        let saturated = CountedPtr {
            external_count: MAX_EXTERNAL_COUNT,
            ptr: bottom,
        };
        stack.head.store(saturated.pack(), Ordering::Relaxed);

        let popper = {
            let stack = stack.clone();
            thread::spawn(move || stack.pop())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        assert!(!popper.is_finished());

        // a fresh head gives the waiting popper something to check out
        stack.push(2);
        assert_eq!(popper.join().unwrap(), Some(2));

        // hand the bottom node back with a count that matches its checkouts
        let restored = CountedPtr {
            external_count: 1,
            ptr: bottom,
        };
        stack.head.store(restored.pack(), Ordering::Relaxed);
        assert_eq!(stack.pop(), Some(1));
        assert!(stack.is_empty());
    }

    #[test]
    fn push_then_pop() {
        let stack = LockFreeStack::new();
        stack.push("x".to_string());
        assert!(!stack.is_empty());
        assert_eq!(stack.pop().as_deref(), Some("x"));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn lifo_order() {
        let stack = LockFreeStack::new();
        for i in 0..10 {
            stack.push(i);
        }
        for i in (0..10).rev() {
            assert_eq!(stack.pop(), Some(i));
        }
        assert!(stack.is_empty());
    }

    #[test]
    fn counted_pointer_keeps_count_and_address() {
        let node = Box::into_raw(Box::new(Node {
            data: ManuallyDrop::new(7u8),
            internal_count: AtomicIsize::new(0),
            next: CountedPtr::NULL,
        }));
        let word = CountedPtr {
            external_count: MAX_EXTERNAL_COUNT,
            ptr: node,
        }
        .pack();
        let back = CountedPtr::<u8>::unpack(word);
        assert_eq!(back.ptr, node);
        assert_eq!(back.external_count, MAX_EXTERNAL_COUNT);
        unsafe {
            let mut boxed = Box::from_raw(node);
            ManuallyDrop::drop(&mut boxed.data);
        }
    }

    #[test]
    fn drop_releases_remaining_payloads() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let stack = LockFreeStack::new();
            for _ in 0..5 {
                stack.push(Tracked(drops.clone()));
            }
            drop(stack.pop());
            assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(std::sync::atomic::Ordering::SeqCst), 5);
    }

    #[test]
    fn concurrent_push_pop_no_duplicates() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 2_000;

        let stack = Arc::new(LockFreeStack::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let stack = stack.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut popped = Vec::new();
                    for i in 0..PER_THREAD {
                        stack.push(t * PER_THREAD + i);
                        if i % 2 == 1 {
                            if let Some(v) = stack.pop() {
                                popped.push(v);
                            }
                        }
                    }
                    popped
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "value {v} popped twice");
            }
        }
        while let Some(v) = stack.pop() {
            assert!(seen.insert(v), "value {v} popped twice");
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }
}

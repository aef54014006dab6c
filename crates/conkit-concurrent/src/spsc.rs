use crate::sync::{AtomicPtr, Ordering};
use crossbeam_utils::CachePadded;
use std::ptr;
use std::sync::Arc;

struct Node<T> {
    data: Option<T>,
    next: *mut Node<T>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            data: None,
            next: ptr::null_mut(),
        }))
    }
}

/// Unbounded lock-free SPSC linked queue.
///
/// - `head` is written only by the consumer, `tail` only by the producer
/// - The tail node is always an empty sentinel; `head == tail` means empty
/// - No CAS: a release store of `tail` publishes each push
struct Shared<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
}

// Safety: each end is driven by exactly one handle; nodes only change hands
// through the release/acquire pair on `tail`.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let mut node = self.head.load(Ordering::Relaxed);
        while !node.is_null() {
            // SAFETY: both handles are gone; every node from head to the
            // sentinel is exclusively ours.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

/// Create a queue and split it into its two ends.
pub fn channel<T>() -> (Producer<T>, Consumer<T>) {
    let sentinel = Node::sentinel();
    let shared = Arc::new(Shared {
        head: CachePadded::new(AtomicPtr::new(sentinel)),
        tail: CachePadded::new(AtomicPtr::new(sentinel)),
    });
    (
        Producer {
            shared: shared.clone(),
        },
        Consumer { shared },
    )
}

/// Producer side of the SPSC queue.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

/// Consumer side of the SPSC queue.
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Producer<T> {
    /// Append `value`. Never blocks, never fails.
    pub fn push(&mut self, value: T) {
        let new_tail = Node::sentinel();
        let tail = self.shared.tail.load(Ordering::Relaxed);
        // SAFETY: the consumer never touches the sentinel until the store
        // below moves `tail` past it.
        unsafe {
            (*tail).data = Some(value);
            (*tail).next = new_tail;
        }
        self.shared.tail.store(new_tail, Ordering::Release);
    }
}

impl<T> Consumer<T> {
    /// Pop the oldest element, or `None` if the producer has not published
    /// anything new.
    pub fn pop(&mut self) -> Option<T> {
        let head = self.shared.head.load(Ordering::Relaxed);
        if head == self.shared.tail.load(Ordering::Acquire) {
            return None;
        }
        // SAFETY: head != tail, so the acquire load above observed the push
        // that filled `head` and linked its successor.
        let mut node = unsafe { Box::from_raw(head) };
        self.shared.head.store(node.next, Ordering::Relaxed);
        node.data.take()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.head.load(Ordering::Relaxed) == self.shared.tail.load(Ordering::Acquire)
    }
}

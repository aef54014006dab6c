use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ptr;
use tracing::trace;

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

/// Unbounded MPMC FIFO guarded by two locks, one per end.
///
/// - Producers only take the tail lock, consumers the head lock, so a push
///   and a pop do not contend unless the queue is empty.
/// - The queue always holds one payload-less sentinel node at the tail;
///   `head == tail` means empty.
/// - Lock order is head, then tail (when peeking the tail pointer). Nothing
///   takes them the other way round.
pub struct LockBasedQueue<T> {
    // Nodes from head to tail are owned by the queue; each is freed by the
    // pop that retires it, or by `Drop`.
    head: Mutex<*mut Node<T>>,
    tail: Mutex<*mut Node<T>>,
    available: Condvar,
}

// Safety: the tail node is only written under the tail lock, and the head
// side only reads a node after the tail lock showed the tail moved past it.
unsafe impl<T: Send> Send for LockBasedQueue<T> {}
unsafe impl<T: Send> Sync for LockBasedQueue<T> {}

impl<T> LockBasedQueue<T> {
    pub fn new() -> Self {
        let sentinel = Node::sentinel();
        Self {
            head: Mutex::new(sentinel),
            tail: Mutex::new(sentinel),
            available: Condvar::new(),
        }
    }

    /// Append `value` and wake one waiting consumer.
    pub fn push(&self, value: T) {
        let new_tail = Node::sentinel();
        {
            let mut tail = self.tail.lock();
            // SAFETY: `*tail` is the live sentinel; only tail-lock holders write it.
            unsafe {
                (**tail).data = Some(value);
                (**tail).next = new_tail;
            }
            *tail = new_tail;
        }
        // A consumer that saw the queue empty holds the head lock until it is
        // parked, so passing through it here means the notify cannot be missed.
        drop(self.head.lock());
        self.available.notify_one();
    }

    /// Pop the front element without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut head = self.head.lock();
        self.pop_head(&mut head)
    }

    /// Pop the front element, blocking until one is available.
    pub fn wait_and_pop(&self) -> T {
        let mut head = self.head.lock();
        loop {
            if let Some(value) = self.pop_head(&mut head) {
                return value;
            }
            trace!("queue empty, waiting for push");
            self.available.wait(&mut head);
        }
    }

    /// Snapshot; may be stale by the time the caller looks at it.
    pub fn is_empty(&self) -> bool {
        let head = self.head.lock();
        *head == self.tail_ptr()
    }

    fn tail_ptr(&self) -> *mut Node<T> {
        *self.tail.lock()
    }

    // Caller holds the head lock.
    fn pop_head(&self, head: &mut *mut Node<T>) -> Option<T> {
        if *head == self.tail_ptr() {
            return None;
        }
        // SAFETY: head != tail, so the push that filled this node and linked
        // its successor finished under the tail lock we just went through.
        // Only head-lock holders retire nodes.
        let old_head = unsafe { Box::from_raw(*head) };
        *head = old_head.next;
        old_head.data
    }
}

impl<T> Default for LockBasedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for LockBasedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockBasedQueue")
            .field("empty", &self.is_empty())
            .finish_non_exhaustive()
    }
}

impl<T> Drop for LockBasedQueue<T> {
    fn drop(&mut self) {
        let mut node = *self.head.get_mut();
        while !node.is_null() {
            // SAFETY: `&mut self` means no other handle; every node from head
            // to the sentinel is still owned by the queue.
            let boxed = unsafe { Box::from_raw(node) };
            node = boxed.next;
        }
    }
}

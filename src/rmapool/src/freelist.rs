//! Lock-free LIFO of recycled regions.
//!
//! A Treiber stack with epoch-based node reclamation. LIFO is load
//! bearing: the most recently pushed chunk is the one most likely to
//! still be cache- and TLB-warm, so it is handed out first.

use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};

pub(crate) struct FreeStack<T> {
    head: Atomic<Node<T>>,
}

struct Node<T> {
    value: ManuallyDrop<T>,
    next: Atomic<Node<T>>,
}

unsafe impl<T: Send> Send for FreeStack<T> {}
unsafe impl<T: Send> Sync for FreeStack<T> {}

impl<T> FreeStack<T> {
    pub(crate) fn new() -> Self {
        FreeStack {
            head: Atomic::null(),
        }
    }

    pub(crate) fn push(&self, value: T) {
        let mut node = Owned::new(Node {
            value: ManuallyDrop::new(value),
            next: Atomic::null(),
        });
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Relaxed, &guard);
            node.next.store(head, Ordering::Relaxed);
            match self
                .head
                .compare_exchange(head, node, Ordering::Release, Ordering::Relaxed, &guard)
            {
                Ok(_) => return,
                Err(e) => node = e.new,
            }
        }
    }

    pub(crate) fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Ordering::Acquire, &guard);
            match unsafe { head.as_ref() } {
                Some(node) => {
                    let next = node.next.load(Ordering::Relaxed, &guard);
                    if self
                        .head
                        .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed, &guard)
                        .is_ok()
                    {
                        unsafe {
                            guard.defer_destroy(head);
                            return Some(ManuallyDrop::into_inner(ptr::read(&node.value)));
                        }
                    }
                }
                None => return None,
            }
        }
    }

    /// Advisory; concurrent pushes and pops may invalidate the answer
    /// before it is returned.
    pub(crate) fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Ordering::Acquire, &guard).is_null()
    }
}

impl<T> Drop for FreeStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

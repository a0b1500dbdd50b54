// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Work queues drained at communicator barriers.
//!
//! A [`WorkQueue`] holds work items on the rank that inserted them. Inserting
//! never runs the work; instead the first insert of a batch arms a pre-barrier
//! callback, and the next [`Comm::barrier`] drains the queue through the work
//! lambda. The lambda may insert further items, locally through the
//! [`WorkQueueRef`] it receives, or on any rank through
//! [`Comm::async_call`] and a queue [`Handle`]; insertions arriving while the
//! barrier is still quiescing are processed within that same barrier, so a
//! returned barrier always leaves every queue empty.
//!
//! Ordering within a rank is the [`QueuePolicy`]'s: FIFO, LIFO, or priority
//! under a comparator. There is deliberately no global `size` and no `swap`:
//! a global count is racy under drain-at-barrier, and swapping queues would
//! detach them from their registered callback identity.

pub mod policy;

pub use policy::{Comparator, Fifo, Lifo, NaturalOrder, Priority, QueuePolicy, ReverseOrder};

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::debug;

use crate::comm::{Comm, Handle};

type WorkFn<I, P> = Box<dyn for<'x> Fn(WorkQueueRef<'x, I, P>, I)>;

/// The per-rank queue state addressed by handles and callbacks.
///
/// Opaque to users; exposed so queue handles have a nameable target type.
pub struct QueueCell<I, P: QueuePolicy<I>> {
    queue: RefCell<P>,
    work_fn: WorkFn<I, P>,
    callback_registered: Cell<bool>,
    draining: Cell<bool>,
}

/// Per-rank work queue with drain-at-barrier semantics.
///
/// Constructed collectively with the work lambda; items are inserted locally
/// and processed when the communicator reaches a barrier. Dropping a queue
/// asserts that no work was abandoned; call [`WorkQueue::local_clear`] first
/// to discard items deliberately.
pub struct WorkQueue<'a, I, P: QueuePolicy<I>> {
    inner: WorkQueueRef<'a, I, P>,
}

/// Borrowed surface of a work queue.
///
/// This is what the work lambda receives, enabling re-entrant insertion
/// during a drain, and what [`WorkQueueRef::from_handle`] yields inside
/// `async_call` closures targeting the queue on a peer rank.
pub struct WorkQueueRef<'a, I, P: QueuePolicy<I>> {
    comm: &'a Comm,
    cell: Rc<QueueCell<I, P>>,
    handle: Handle<QueueCell<I, P>>,
}

impl<I, P: QueuePolicy<I>> Clone for WorkQueueRef<'_, I, P> {
    fn clone(&self) -> Self {
        Self {
            comm: self.comm,
            cell: Rc::clone(&self.cell),
            handle: self.handle,
        }
    }
}

pub type FifoWorkQueue<'a, I> = WorkQueue<'a, I, Fifo<I>>;
pub type LifoWorkQueue<'a, I> = WorkQueue<'a, I, Lifo<I>>;
pub type PriorityWorkQueue<'a, I, C> = WorkQueue<'a, I, Priority<I, C>>;

impl<'a, I: 'static, P: QueuePolicy<I> + 'static> WorkQueue<'a, I, P> {
    /// Creates the queue with its work lambda. Collective.
    ///
    /// The lambda runs once per drained item, receiving the queue surface for
    /// re-entrant insertion and the item itself.
    pub fn new<F>(comm: &'a Comm, work_fn: F) -> Self
    where
        F: for<'x> Fn(WorkQueueRef<'x, I, P>, I) + 'static,
    {
        debug!("rank {}: creating work queue", comm.rank());
        let cell = Rc::new(QueueCell {
            queue: RefCell::new(P::default()),
            work_fn: Box::new(work_fn),
            callback_registered: Cell::new(false),
            draining: Cell::new(false),
        });
        let handle = comm.register(Rc::clone(&cell));
        Self {
            inner: WorkQueueRef { comm, cell, handle },
        }
    }

    /// Cross-rank handle to this queue, for remote insertion via
    /// [`WorkQueueRef::from_handle`].
    pub fn handle(&self) -> Handle<QueueCell<I, P>> {
        self.inner.handle
    }

    /// Borrows the queue surface, the same view the work lambda receives.
    pub fn as_ref(&self) -> WorkQueueRef<'a, I, P> {
        self.inner.clone()
    }

    /// Inserts a work item into the local queue.
    ///
    /// The first insert of a batch arms the drain callback for the next
    /// barrier. No work runs here.
    pub fn local_insert(&self, item: I) {
        self.inner.local_insert(item);
    }

    /// Drains the local queue through the work lambda, including items the
    /// lambda re-inserts. Does not synchronize with other ranks.
    pub fn local_process_all(&self) {
        self.inner.local_process_all();
    }

    /// Number of items pending in the local queue.
    pub fn local_size(&self) -> usize {
        self.inner.local_size()
    }

    /// True if the local queue holds pending items.
    pub fn local_has_work(&self) -> bool {
        self.inner.local_has_work()
    }

    /// Discards all pending local items without running the work lambda.
    pub fn local_clear(&self) {
        self.inner.local_clear();
    }

    /// Discards pending items on every rank. Collective.
    pub fn clear(&self) {
        self.local_clear();
        self.inner.comm.barrier();
    }
}

impl<I, P: QueuePolicy<I>> Drop for WorkQueue<'_, I, P> {
    fn drop(&mut self) {
        debug!("rank {}: dropping work queue", self.inner.comm.rank());
        assert!(
            self.inner.cell.queue.borrow().is_empty(),
            "work queue dropped with pending items; call local_clear() to discard them"
        );
    }
}

impl<'a, I: 'static, P: QueuePolicy<I> + 'static> WorkQueueRef<'a, I, P> {
    /// Rebuilds the queue surface from a handle on the rank where the closure
    /// executes, addressing that rank's local queue.
    pub fn from_handle(comm: &'a Comm, handle: Handle<QueueCell<I, P>>) -> Self {
        Self {
            comm,
            cell: comm.resolve(handle),
            handle,
        }
    }

    /// The communicator of the rank owning this queue surface.
    pub fn comm(&self) -> &'a Comm {
        self.comm
    }

    /// Cross-rank handle to this queue, same as [`WorkQueue::handle`].
    pub fn handle(&self) -> Handle<QueueCell<I, P>> {
        self.handle
    }

    /// See [`WorkQueue::local_insert`].
    pub fn local_insert(&self, item: I) {
        self.cell.queue.borrow_mut().push(item);
        // One armed callback per batch; the drain re-arms on later inserts.
        if !self.cell.callback_registered.get() {
            self.register_processing_callback();
        }
    }

    fn register_processing_callback(&self) {
        let handle = self.handle;
        self.comm.register_pre_barrier_callback(move |comm| {
            let queue = WorkQueueRef::from_handle(comm, handle);
            queue.local_process_all();
            queue.cell.callback_registered.set(false);
        });
        self.cell.callback_registered.set(true);
    }

    /// See [`WorkQueue::local_process_all`].
    ///
    /// # Panics
    ///
    /// Panics if called from within the work lambda; at most one drain may be
    /// active on a queue.
    pub fn local_process_all(&self) {
        assert!(
            !self.cell.draining.get(),
            "re-entrant drain on a work queue"
        );
        self.cell.draining.set(true);
        loop {
            // The borrow must end before the work lambda runs so it can
            // insert into the same queue.
            let item = self.cell.queue.borrow_mut().pop();
            match item {
                Some(item) => (self.cell.work_fn)(self.clone(), item),
                None => break,
            }
        }
        self.cell.draining.set(false);
    }

    /// See [`WorkQueue::local_size`].
    pub fn local_size(&self) -> usize {
        self.cell.queue.borrow().len()
    }

    /// See [`WorkQueue::local_has_work`].
    pub fn local_has_work(&self) -> bool {
        !self.cell.queue.borrow().is_empty()
    }

    /// See [`WorkQueue::local_clear`].
    pub fn local_clear(&self) {
        *self.cell.queue.borrow_mut() = P::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run;

    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn barrier_drains_in_policy_order() {
        run(1, |comm| {
            let seen = Rc::new(RefCell::new(Vec::new()));
            let seen_in_fn = Rc::clone(&seen);
            let wq: FifoWorkQueue<u32> = WorkQueue::new(comm, move |_, item| {
                seen_in_fn.borrow_mut().push(item);
            });

            for item in [5u32, 3, 8] {
                wq.local_insert(item);
            }
            assert!(wq.local_has_work());
            assert_eq!(wq.local_size(), 3);

            comm.barrier();
            assert_eq!(*seen.borrow(), vec![5, 3, 8]);
            assert_eq!(wq.local_size(), 0);
            assert!(!wq.local_has_work());
        });
    }

    #[test]
    fn insert_during_drain_is_processed_in_the_same_drain() {
        run(1, |comm| {
            let seen = Rc::new(RefCell::new(Vec::new()));
            let seen_in_fn = Rc::clone(&seen);
            let wq: LifoWorkQueue<u32> = WorkQueue::new(comm, move |queue, item| {
                seen_in_fn.borrow_mut().push(item);
                if item < 3 {
                    queue.local_insert(item + 1);
                }
            });

            wq.local_insert(0);
            comm.barrier();
            assert_eq!(*seen.borrow(), vec![0, 1, 2, 3]);
            assert_eq!(wq.local_size(), 0);
        });
    }

    #[test]
    fn local_clear_discards_without_processing() {
        run(1, |comm| {
            let processed = Rc::new(Cell::new(0u32));
            let processed_in_fn = Rc::clone(&processed);
            let wq: FifoWorkQueue<u32> = WorkQueue::new(comm, move |_, _| {
                processed_in_fn.set(processed_in_fn.get() + 1);
            });

            for item in 0..8 {
                wq.local_insert(item);
            }
            wq.local_clear();
            assert_eq!(wq.local_size(), 0);

            comm.barrier();
            assert_eq!(processed.get(), 0);
        });
    }

    #[test]
    #[should_panic(expected = "re-entrant drain")]
    fn nested_drain_is_rejected() {
        run(1, |comm| {
            let wq: FifoWorkQueue<u32> = WorkQueue::new(comm, move |queue, _| {
                queue.local_process_all();
            });
            wq.local_insert(0);
            wq.local_process_all();
            wq.local_clear();
        });
    }

    #[test]
    #[should_panic(expected = "pending items")]
    fn dropping_a_loaded_queue_asserts() {
        run(1, |comm| {
            let wq: FifoWorkQueue<u32> = WorkQueue::new(comm, |_, _| {});
            wq.local_insert(1);
            drop(wq);
        });
    }

    #[test]
    fn collective_clear_empties_every_rank() {
        run(4, |comm| {
            let wq: FifoWorkQueue<u32> = WorkQueue::new(comm, |_, _| {
                panic!("cleared items must not be processed");
            });
            for item in 0..10 {
                wq.local_insert(item);
            }
            wq.clear();
            assert_eq!(wq.local_size(), 0);
        });
    }
}

// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! The asynchronous messaging communicator.
//!
//! A job consists of a fixed set of ranks, each running on its own thread and
//! owning a [`Comm`]. Ranks interact through three primitives:
//!
//! - [`Comm::async_call`]: one-sided, fire-and-forget invocation of a closure
//!   on a destination rank. Closures from the same sender to the same receiver
//!   execute in send order; no other ordering is guaranteed.
//! - [`Comm::barrier`]: collective synchronization that first fires this
//!   rank's pre-barrier callbacks, then processes incoming invocations until
//!   no message is in flight anywhere in the job.
//! - Collective reductions in [`collective`], all built on an all-gather.
//!
//! Cross-rank object identity is provided by [`Handle`]: ranks register their
//! local instance of a logically shared object in construction order, and a
//! handle shipped inside an `async_call` closure dereferences to the peer
//! instance on the executing rank.
//!
//! The execution model is single-threaded and cooperative per rank. Incoming
//! invocations are only executed while the owning rank sits in a barrier, so
//! user code never observes concurrent mutation of rank-local state.

pub mod collective;
mod registry;

pub use registry::Handle;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use log::{debug, trace};

use self::registry::Registry;

/// Index of a rank within the job, in `0..size`.
pub type Rank = usize;

/// A one-sided invocation shipped to another rank's mailbox.
type Envelope = Box<dyn FnOnce(&Comm) + Send + 'static>;

/// A callback fired on the registering rank when it enters a barrier.
type PreBarrierCallback = Box<dyn FnOnce(&Comm) + 'static>;

/// Payload used when unwinding ranks that lost a peer.
const PEER_FAILURE: &str = "aborting: a peer rank failed";

/// Sends between opportunistic progress runs; bounds mailbox growth when a
/// rank fires long bursts of `async_call` without reaching a barrier.
const SENDS_PER_PROGRESS: u32 = 1024;

/// State of the quiescence rounds run inside [`Comm::barrier`].
struct QuiesceRound {
    /// Ranks currently parked in the round.
    parked: usize,
    /// Completed rounds, successful or not.
    epoch: u64,
    /// Outcome of the most recently completed round.
    last_quiet: bool,
}

/// State shared by all ranks of a job.
pub(crate) struct Shared {
    nranks: usize,
    /// Mailbox senders for every rank, indexed by destination.
    mailboxes: Vec<Sender<Envelope>>,
    /// Invocations handed to `async_call`, bumped before the enqueue.
    sent: AtomicU64,
    /// Invocations fully executed by their destination rank.
    delivered: AtomicU64,
    /// Pre-barrier callbacks registered but not yet fired, summed over ranks.
    armed: AtomicUsize,
    /// Set once any rank panics; peers unwind instead of waiting forever.
    aborted: AtomicBool,
    quiesce: Mutex<QuiesceRound>,
    quiesce_cv: Condvar,
    pub(crate) gather: Mutex<collective::GatherRound>,
    pub(crate) gather_cv: Condvar,
}

impl Shared {
    fn new(nranks: usize, mailboxes: Vec<Sender<Envelope>>) -> Self {
        Self {
            nranks,
            mailboxes,
            sent: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            armed: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            quiesce: Mutex::new(QuiesceRound {
                parked: 0,
                epoch: 0,
                last_quiet: false,
            }),
            quiesce_cv: Condvar::new(),
            gather: Mutex::new(collective::GatherRound::new(nranks)),
            gather_cv: Condvar::new(),
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.quiesce_cv.notify_all();
        self.gather_cv.notify_all();
    }

    /// Unwinds the calling rank if a peer already failed.
    pub(crate) fn check_abort(&self) {
        if self.aborted.load(Ordering::SeqCst) {
            panic!("{PEER_FAILURE}");
        }
    }
}

/// Locks a job-shared mutex, ignoring poison left behind by an aborting peer.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-rank endpoint of the communicator.
///
/// Owned by exactly one rank thread; not `Send`. The registry and the
/// pre-barrier callbacks are rank-local, everything cross-rank goes through
/// the job-shared state.
pub struct Comm {
    rank: Rank,
    shared: Arc<Shared>,
    inbox: Receiver<Envelope>,
    registry: Registry,
    pre_barrier: RefCell<VecDeque<PreBarrierCallback>>,
    /// Sends since the last opportunistic progress run.
    send_credit: Cell<u32>,
    /// True while this rank executes incoming invocations; progress never
    /// nests, so handlers run one at a time.
    progressing: Cell<bool>,
}

/// Runs `f` on `nranks` ranks, one thread each, and returns the per-rank
/// results in rank order.
///
/// Blocks until every rank finishes. If any rank panics, the panic is
/// propagated to the caller after the remaining ranks have been unwound; a
/// single rank failure aborts the whole job.
pub fn run<F, T>(nranks: usize, f: F) -> Vec<T>
where
    F: Fn(&Comm) -> T + Send + Sync,
    T: Send,
{
    assert!(nranks > 0, "a job needs at least one rank");

    let mut mailboxes = Vec::with_capacity(nranks);
    let mut inboxes = Vec::with_capacity(nranks);
    for _ in 0..nranks {
        let (tx, rx) = channel();
        mailboxes.push(tx);
        inboxes.push(rx);
    }
    let shared = Arc::new(Shared::new(nranks, mailboxes));
    debug!("starting job with {nranks} ranks");

    let mut outcomes: Vec<Result<T, Box<dyn std::any::Any + Send>>> =
        std::thread::scope(|scope| {
            let handles: Vec<_> = inboxes
                .into_iter()
                .enumerate()
                .map(|(rank, inbox)| {
                    let shared = Arc::clone(&shared);
                    let f = &f;
                    scope.spawn(move || {
                        let comm = Comm {
                            rank,
                            shared,
                            inbox,
                            registry: Registry::default(),
                            pre_barrier: RefCell::new(VecDeque::new()),
                            send_credit: Cell::new(0),
                            progressing: Cell::new(false),
                        };
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&comm)));
                        if outcome.is_err() {
                            comm.shared.abort();
                        }
                        outcome
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("rank thread cannot outlive its panic hook"))
                .collect()
        });

    // Prefer the original panic over the peer-failure cascades it triggered.
    if outcomes.iter().any(Result::is_err) {
        let mut first_cascade = None;
        for outcome in &mut outcomes {
            if let Err(payload) = outcome {
                let blank: Box<dyn std::any::Any + Send> = Box::new(());
                if payload.downcast_ref::<String>().map(String::as_str) == Some(PEER_FAILURE)
                    || payload.downcast_ref::<&str>() == Some(&PEER_FAILURE)
                {
                    if first_cascade.is_none() {
                        first_cascade = Some(std::mem::replace(payload, blank));
                    }
                } else {
                    panic::resume_unwind(std::mem::replace(payload, blank));
                }
            }
        }
        panic::resume_unwind(first_cascade.expect("at least one rank failed"));
    }
    outcomes
        .into_iter()
        .map(|outcome| match outcome {
            Ok(value) => value,
            Err(_) => unreachable!("failures were propagated above"),
        })
        .collect()
}

impl Comm {
    /// Returns this rank's index, fixed for the lifetime of the job.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Returns the number of ranks in the job.
    pub fn size(&self) -> usize {
        self.shared.nranks
    }

    /// Returns true on rank 0, the conventional place for singular work.
    pub fn rank0(&self) -> bool {
        self.rank == 0
    }

    /// Enqueues a one-sided invocation of `f` on rank `dest`.
    ///
    /// Fire-and-forget: the call returns immediately and `f` executes inside
    /// one of `dest`'s future barriers. Self-sends are allowed. After the next
    /// [`Comm::barrier`] returns, `f` is guaranteed to have run.
    ///
    /// # Panics
    ///
    /// Panics if `dest` is not a valid rank.
    pub fn async_call<F>(&self, dest: Rank, f: F)
    where
        F: FnOnce(&Comm) + Send + 'static,
    {
        assert!(dest < self.size(), "destination rank {dest} out of range");
        // The sent counter must lead the enqueue so that `sent == delivered`
        // proves there is no invocation in flight.
        self.shared.sent.fetch_add(1, Ordering::SeqCst);
        self.shared.mailboxes[dest]
            .send(Box::new(f))
            .expect("mailboxes live as long as the job");

        // Long send bursts drain the local mailbox now and then, the
        // backpressure analogue for unbounded channels. Skipped while already
        // inside a handler so progress never nests.
        let credit = self.send_credit.get() + 1;
        if credit < SENDS_PER_PROGRESS {
            self.send_credit.set(credit);
        } else {
            self.send_credit.set(0);
            self.process_incoming();
        }
    }

    /// Registers a one-shot callback fired on this rank at the start of its
    /// next barrier, before quiescence is checked.
    ///
    /// Callbacks are consumed by the barrier that fires them; components that
    /// need to run at every barrier re-register themselves.
    pub fn register_pre_barrier_callback<F>(&self, f: F)
    where
        F: FnOnce(&Comm) + 'static,
    {
        self.shared.armed.fetch_add(1, Ordering::SeqCst);
        self.pre_barrier.borrow_mut().push_back(Box::new(f));
    }

    /// Collective barrier.
    ///
    /// Fires pending pre-barrier callbacks, executes incoming invocations,
    /// and returns only once no invocation is in flight anywhere in the job
    /// and no rank holds an unfired callback. Callbacks may send messages and
    /// message handlers may register callbacks; the barrier keeps cycling
    /// until the job is globally quiet.
    pub fn barrier(&self) {
        trace!("rank {} entered barrier", self.rank);
        loop {
            self.fire_pre_barrier_callbacks();
            self.process_incoming();
            if !self.pre_barrier.borrow().is_empty() {
                // A handler armed a new callback; give it its pre-barrier run.
                continue;
            }
            if self.try_commit_quiescence() {
                break;
            }
            std::thread::yield_now();
        }
        trace!("rank {} left barrier", self.rank);
    }

    /// Executes everything currently in this rank's mailbox. No-op when
    /// called from within a handler.
    fn process_incoming(&self) -> usize {
        if self.progressing.replace(true) {
            return 0;
        }
        let mut executed = 0;
        loop {
            match self.inbox.try_recv() {
                Ok(envelope) => {
                    envelope(self);
                    self.shared.delivered.fetch_add(1, Ordering::SeqCst);
                    executed += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break,
            }
        }
        self.progressing.set(false);
        executed
    }

    fn fire_pre_barrier_callbacks(&self) {
        loop {
            // The borrow must end before the callback runs; callbacks are
            // allowed to register further callbacks.
            let callback = self.pre_barrier.borrow_mut().pop_front();
            match callback {
                Some(callback) => {
                    self.shared.armed.fetch_sub(1, Ordering::SeqCst);
                    callback(self);
                }
                None => break,
            }
        }
    }

    /// Parks this rank in the current quiescence round and reports whether the
    /// round found the job globally quiet.
    ///
    /// The round commits once every rank is parked. At that instant no user
    /// code is running anywhere, so the message and callback counters are
    /// frozen and `sent == delivered && armed == 0` is exactly the global
    /// quiescence condition. A failed round means some rank still has work;
    /// the caller re-drains its mailbox and retries.
    fn try_commit_quiescence(&self) -> bool {
        let shared = &self.shared;
        let mut round = lock(&shared.quiesce);
        round.parked += 1;
        if round.parked == shared.nranks {
            let quiet = shared.sent.load(Ordering::SeqCst)
                == shared.delivered.load(Ordering::SeqCst)
                && shared.armed.load(Ordering::SeqCst) == 0;
            round.last_quiet = quiet;
            round.epoch += 1;
            round.parked = 0;
            shared.quiesce_cv.notify_all();
            quiet
        } else {
            let epoch = round.epoch;
            while round.epoch == epoch {
                shared.check_abort();
                round = shared
                    .quiesce_cv
                    .wait(round)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            round.last_quiet
        }
    }

    /// Registers `obj` in this rank's object registry and returns its handle.
    ///
    /// Registration is collective by convention: every rank registers its
    /// local instance of each logically shared object in the same order, and
    /// the resulting handle names the peer instance on every rank. In builds
    /// with debug assertions the registration order is verified collectively.
    pub fn register<T: 'static>(&self, obj: Rc<T>) -> Handle<T> {
        let handle = self.registry.register(obj);
        debug_assert!(
            collective::is_same(handle.index(), self, |a, b| a == b),
            "ranks registered shared objects in different orders"
        );
        handle
    }

    /// Dereferences `handle` to the local instance registered on this rank.
    ///
    /// # Panics
    ///
    /// Panics if the handle was never registered here or if the registered
    /// object has a different type, both of which indicate that registration
    /// was not performed collectively.
    pub fn resolve<T: 'static>(&self, handle: Handle<T>) -> Rc<T> {
        self.registry.resolve(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;

    #[test]
    fn single_rank_job() {
        let results = run(1, |comm| {
            assert_eq!(comm.rank(), 0);
            assert_eq!(comm.size(), 1);
            assert!(comm.rank0());
            comm.barrier();
            7u32
        });
        assert_eq!(results, vec![7]);
    }

    #[test]
    fn messages_execute_before_barrier_returns() {
        run(4, |comm| {
            let counter = Rc::new(Cell::new(0u64));
            let handle = comm.register(Rc::clone(&counter));
            comm.barrier();

            for dest in 0..comm.size() {
                comm.async_call(dest, move |comm| {
                    let counter = comm.resolve(handle);
                    counter.set(counter.get() + 1);
                });
            }
            comm.barrier();
            // One message from every rank, including the self-send.
            assert_eq!(counter.get(), comm.size() as u64);
        });
    }

    #[test]
    fn point_to_point_order_is_fifo() {
        run(2, |comm| {
            let seen = Rc::new(RefCell::new(Vec::new()));
            let handle = comm.register(Rc::clone(&seen));
            comm.barrier();

            if comm.rank() == 0 {
                for i in 0..100u32 {
                    comm.async_call(1, move |comm| {
                        comm.resolve(handle).borrow_mut().push(i);
                    });
                }
            }
            comm.barrier();
            if comm.rank() == 1 {
                let seen = seen.borrow();
                assert_eq!(*seen, (0..100).collect::<Vec<_>>());
            }
        });
    }

    #[test]
    fn handlers_may_send_follow_ups() {
        run(3, |comm| {
            let hits = Rc::new(Cell::new(0u64));
            let handle = comm.register(Rc::clone(&hits));
            comm.barrier();

            // Each message forwards to the next rank until it has hopped
            // through every rank once.
            if comm.rank0() {
                fn hop(comm: &Comm, handle: Handle<Cell<u64>>, remaining: usize) {
                    let hits = comm.resolve(handle);
                    hits.set(hits.get() + 1);
                    if remaining > 0 {
                        let next = (comm.rank() + 1) % comm.size();
                        comm.async_call(next, move |comm| hop(comm, handle, remaining - 1));
                    }
                }
                comm.async_call(1, move |comm| hop(comm, handle, 5));
            }
            comm.barrier();
            let total = collective::sum(hits.get(), comm);
            assert_eq!(total, 6);
        });
    }

    #[test]
    fn pre_barrier_callbacks_are_consumed() {
        run(2, |comm| {
            let fired = Rc::new(Cell::new(0u32));
            let fired_in_cb = Rc::clone(&fired);
            comm.register_pre_barrier_callback(move |_| {
                fired_in_cb.set(fired_in_cb.get() + 1);
            });
            comm.barrier();
            assert_eq!(fired.get(), 1);
            // Consumed: the next barrier does not fire it again.
            comm.barrier();
            assert_eq!(fired.get(), 1);
        });
    }

    #[test]
    fn callbacks_may_send_messages() {
        run(2, |comm| {
            let received = Rc::new(Cell::new(false));
            let handle = comm.register(Rc::clone(&received));
            comm.barrier();

            let peer = (comm.rank() + 1) % comm.size();
            comm.register_pre_barrier_callback(move |comm| {
                comm.async_call(peer, move |comm| {
                    comm.resolve(handle).set(true);
                });
            });
            comm.barrier();
            assert!(received.get());
        });
    }

    #[test]
    #[should_panic(expected = "boom on rank 1")]
    fn rank_panic_propagates() {
        run(3, |comm| {
            comm.barrier();
            if comm.rank() == 1 {
                panic!("boom on rank 1");
            }
            // The surviving ranks park here until the abort wakes them.
            comm.barrier();
        });
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn destination_must_be_valid() {
        run(1, |comm| {
            comm.async_call(3, |_| {});
        });
    }
}

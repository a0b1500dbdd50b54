// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Collective reductions over all ranks of a job.
//!
//! Everything here is built on [`all_gather`], the one synchronizing
//! primitive: each rank deposits its value, the full vector becomes visible to
//! every rank, and the derived reductions fold it locally. All collectives
//! must be called by every rank of the job in the same program order, the
//! usual SPMD contract.

use std::any::Any;
use std::ops::Add;
use std::sync::PoisonError;

use crate::comm::{Comm, Rank, lock};

/// Slot state for one all-gather round.
///
/// Rounds move through two phases under a single mutex: every rank deposits
/// its boxed value, then every rank clones the full vector out. The last rank
/// to take resets the round for the next collective. The epoch counter keeps a
/// fast rank from depositing into a round its peers have not finished taking.
pub(crate) struct GatherRound {
    epoch: u64,
    deposited: usize,
    taken: usize,
    slots: Vec<Option<Box<dyn Any + Send>>>,
}

impl GatherRound {
    pub(crate) fn new(nranks: usize) -> Self {
        let mut slots = Vec::with_capacity(nranks);
        slots.resize_with(nranks, || None);
        Self {
            epoch: 0,
            deposited: 0,
            taken: 0,
            slots,
        }
    }
}

/// Gathers one value from every rank and returns the vector, indexed by rank,
/// on every rank.
///
/// # Panics
///
/// Panics if the ranks disagree on `T` for the same collective call site,
/// which means the job violated the SPMD contract.
pub fn all_gather<T>(value: T, comm: &Comm) -> Vec<T>
where
    T: Clone + Send + 'static,
{
    let shared = &*comm.shared;
    let nranks = comm.size();
    let mut round = lock(&shared.gather);

    // Wait out the take phase of the previous round.
    while round.deposited == nranks {
        shared.check_abort();
        round = shared
            .gather_cv
            .wait(round)
            .unwrap_or_else(PoisonError::into_inner);
    }

    round.slots[comm.rank()] = Some(Box::new(value));
    round.deposited += 1;
    let epoch = round.epoch;
    if round.deposited == nranks {
        shared.gather_cv.notify_all();
    }
    while round.epoch == epoch && round.deposited < nranks {
        shared.check_abort();
        round = shared
            .gather_cv
            .wait(round)
            .unwrap_or_else(PoisonError::into_inner);
    }

    let gathered: Vec<T> = round
        .slots
        .iter()
        .map(|slot| {
            slot.as_ref()
                .expect("every rank deposited")
                .downcast_ref::<T>()
                .expect("ranks disagree on the collective value type")
                .clone()
        })
        .collect();

    round.taken += 1;
    if round.taken == nranks {
        for slot in &mut round.slots {
            *slot = None;
        }
        round.deposited = 0;
        round.taken = 0;
        round.epoch += 1;
        shared.gather_cv.notify_all();
    }
    gathered
}

/// Global sum of `value` over all ranks.
pub fn sum<T>(value: T, comm: &Comm) -> T
where
    T: Clone + Send + 'static + std::iter::Sum<T>,
{
    all_gather(value, comm).into_iter().sum()
}

/// Exclusive prefix sum: the sum of `value` over all ranks below this one.
///
/// Rank 0 receives `T::default()`.
pub fn prefix_sum<T>(value: T, comm: &Comm) -> T
where
    T: Clone + Send + 'static + Add<Output = T> + Default,
{
    all_gather(value, comm)
        .into_iter()
        .take(comm.rank())
        .fold(T::default(), |acc, v| acc + v)
}

/// True on every rank if `value` is true on any rank.
pub fn logical_or(value: bool, comm: &Comm) -> bool {
    all_gather(value, comm).into_iter().any(|v| v)
}

/// True on every rank if every rank's `value` matches rank 0's under `eq`.
pub fn is_same<T, F>(value: T, comm: &Comm, eq: F) -> bool
where
    T: Clone + Send + 'static,
    F: Fn(&T, &T) -> bool,
{
    let gathered = all_gather(value, comm);
    gathered.iter().all(|v| eq(v, &gathered[0]))
}

/// Every rank receives `root`'s `value`; the other ranks' arguments are
/// ignored.
pub fn broadcast<T>(value: T, root: Rank, comm: &Comm) -> T
where
    T: Clone + Send + 'static,
{
    assert!(root < comm.size(), "broadcast root {root} out of range");
    let mut gathered = all_gather(value, comm);
    gathered.swap_remove(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::run;

    #[test]
    fn gather_is_indexed_by_rank() {
        run(4, |comm| {
            let gathered = all_gather(comm.rank() * 10, comm);
            assert_eq!(gathered, vec![0, 10, 20, 30]);
        });
    }

    #[test]
    fn sum_and_prefix_sum() {
        run(4, |comm| {
            let value = (comm.rank() + 1) as u64;
            assert_eq!(sum(value, comm), 10);
            // Exclusive: rank r sees 1 + 2 + ... + r.
            let expected: u64 = (1..=comm.rank() as u64).sum();
            assert_eq!(prefix_sum(value, comm), expected);
        });
    }

    #[test]
    fn prefix_sum_of_floats() {
        run(3, |comm| {
            let value = 0.5;
            let prefix = prefix_sum(value, comm);
            assert!((prefix - 0.5 * comm.rank() as f64).abs() < 1e-12);
        });
    }

    #[test]
    fn logical_or_sees_single_dissenter() {
        run(4, |comm| {
            assert!(!logical_or(false, comm));
            assert!(logical_or(comm.rank() == 2, comm));
        });
    }

    #[test]
    fn is_same_with_tolerance() {
        run(4, |comm| {
            let wobbly = 1.0 + comm.rank() as f64 * 1e-9;
            assert!(is_same(wobbly, comm, |a, b| (a - b).abs() < 1e-6));
            assert!(!is_same(comm.rank() as f64, comm, |a, b| {
                (a - b).abs() < 1e-6
            }));
        });
    }

    #[test]
    fn broadcast_takes_the_root_value() {
        run(4, |comm| {
            let value = if comm.rank() == 2 { 99u32 } else { comm.rank() as u32 };
            assert_eq!(broadcast(value, 2, comm), 99);
        });
    }

    #[test]
    fn back_to_back_rounds_do_not_bleed() {
        run(4, |comm| {
            for i in 0..100u64 {
                let gathered = all_gather(i + comm.rank() as u64, comm);
                for (rank, value) in gathered.into_iter().enumerate() {
                    assert_eq!(value, i + rank as u64);
                }
            }
        });
    }
}

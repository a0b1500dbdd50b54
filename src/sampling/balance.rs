// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Weight balancing across ranks.
//!
//! Lays the job's weighted items end to end on a global weight axis, in rank
//! order and insertion order within a rank. Rank `r` owns the axis region
//! `[r * T, (r + 1) * T)` where `T = W_total / nranks`; every item slice
//! falling into a region is shipped to its owner. Items are cut at region
//! boundaries, so after the exchange every rank holds exactly `T` weight (up
//! to floating point drift) and at least one item, which is what the alias
//! table construction requires. Item identity is preserved across slices:
//! the same id, with the weight divided.

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;

use crate::comm::{Comm, Handle, collective};
use crate::sampling::WeightedItem;

/// Tolerated deviation from the target weight per rank after balancing.
pub(crate) const BALANCE_EPSILON: f64 = 1e-6;

/// Redistributes `local_items` so every rank ends up with `W_total / nranks`
/// of the global weight. Collective.
///
/// Zero-weight items produce empty slices and are dropped. The caller
/// guarantees a positive global weight.
///
/// # Panics
///
/// Panics if the post-exchange weight deviates from the target by more than
/// [`BALANCE_EPSILON`] on any rank, or if any rank ends up without items;
/// both indicate an algorithmic bug rather than bad input.
pub(crate) fn balance_weight<I>(
    comm: &Comm,
    mut local_items: Vec<WeightedItem<I>>,
) -> Vec<WeightedItem<I>>
where
    I: Clone + Send + 'static,
{
    let local_weight: f64 = local_items.iter().map(|item| item.weight).sum();
    let global_weight = collective::sum(local_weight, comm);
    let prefix_weight = collective::prefix_sum(local_weight, comm);

    let target_weight = global_weight / comm.size() as f64;
    // This rank's items start at axis offset `prefix_weight`, which pins down
    // the first destination region and how much of it is already spoken for.
    let mut dest_rank = (prefix_weight / target_weight) as usize;
    let mut curr_weight = prefix_weight % target_weight;

    let incoming: Rc<RefCell<Vec<WeightedItem<I>>>> = Rc::new(RefCell::new(Vec::new()));
    let incoming_handle = comm.register(Rc::clone(&incoming));
    comm.barrier();

    let mut outgoing: Vec<WeightedItem<I>> = Vec::new();
    // `local_items` grows while we walk it: an item spanning several regions
    // re-appends its residual. Index, never iterate.
    let mut i = 0;
    while i < local_items.len() {
        let item = local_items[i].clone();
        i += 1;
        if item.weight == 0.0 {
            continue;
        }
        if curr_weight + item.weight >= target_weight {
            // The item crosses the region boundary: cut it, flush the batch
            // to the current owner, and carry the rest forward.
            let remaining = curr_weight + item.weight - target_weight;
            let slice = item.weight - remaining;
            outgoing.push(WeightedItem {
                id: item.id.clone(),
                weight: slice,
            });
            send_batch(comm, dest_rank, &mut outgoing, incoming_handle);

            if remaining >= target_weight {
                local_items.push(WeightedItem {
                    id: item.id.clone(),
                    weight: remaining,
                });
                curr_weight = 0.0;
            } else {
                curr_weight = remaining;
            }
            if curr_weight > 0.0 {
                outgoing.push(WeightedItem {
                    id: item.id,
                    weight: curr_weight,
                });
            }
            dest_rank += 1;
        } else {
            curr_weight += item.weight;
            outgoing.push(item);
        }
    }
    if !outgoing.is_empty() {
        send_batch(comm, dest_rank, &mut outgoing, incoming_handle);
    }

    comm.barrier();
    let balanced = incoming.take();

    let new_weight: f64 = balanced.iter().map(|item| item.weight).sum();
    debug!(
        "rank {}: balanced {} items, weight {new_weight:.6} (target {target_weight:.6})",
        comm.rank(),
        balanced.len(),
    );
    assert!(
        !balanced.is_empty(),
        "rank {} holds no items after balancing",
        comm.rank()
    );
    assert!(
        (new_weight - target_weight).abs() < BALANCE_EPSILON,
        "rank {} drifted from the target weight: {new_weight} vs {target_weight}",
        comm.rank()
    );
    assert!(
        collective::is_same(new_weight, comm, |a, b| (a - b).abs() < BALANCE_EPSILON),
        "ranks disagree on the balanced weight"
    );
    balanced
}

/// Ships the batched slices to `dest_rank`'s incoming list and empties the
/// batch. Slices past the last rank can only arise from floating point drift
/// on the final region boundary; they are absorbed silently.
fn send_batch<I>(
    comm: &Comm,
    dest_rank: usize,
    outgoing: &mut Vec<WeightedItem<I>>,
    incoming: Handle<RefCell<Vec<WeightedItem<I>>>>,
) where
    I: Clone + Send + 'static,
{
    let batch = std::mem::take(outgoing);
    if dest_rank >= comm.size() {
        return;
    }
    comm.async_call(dest_rank, move |comm| {
        comm.resolve(incoming).borrow_mut().extend(batch);
    });
}

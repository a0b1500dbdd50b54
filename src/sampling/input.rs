// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Adaptors feeding weighted items into table construction.
//!
//! An [`AliasTable`](crate::sampling::AliasTable) does not care how the input
//! is spread over ranks; the balancer evens it out. These adaptors cover the
//! two shapes inputs come in:
//!
//! - [`Local`]: each rank contributes its own private sequence (a distributed
//!   collection, presented as per-rank shares).
//! - [`Replicated`]: every rank holds an identical copy of the full sequence;
//!   ownership round-robins by position so the collection is contributed
//!   exactly once.
//!
//! [`Counts`] adapts occurrence counts, such as a word histogram, by using
//! the count as the weight.

use crate::comm::Comm;
use crate::sampling::WeightedItem;

/// Source of this rank's share of the weighted input.
pub trait WeightedInput<I> {
    fn into_weighted_items(self, comm: &Comm) -> Vec<WeightedItem<I>>;
}

/// Plain `(id, weight)` pairs are a per-rank contribution.
impl<I> WeightedInput<I> for Vec<(I, f64)> {
    fn into_weighted_items(self, _comm: &Comm) -> Vec<WeightedItem<I>> {
        self.into_iter()
            .map(|(id, weight)| WeightedItem { id, weight })
            .collect()
    }
}

impl<I> WeightedInput<I> for Vec<WeightedItem<I>> {
    fn into_weighted_items(self, _comm: &Comm) -> Vec<WeightedItem<I>> {
        self
    }
}

/// A sequence contributed by this rank alone.
pub struct Local<It>(pub It);

impl<I, It> WeightedInput<I> for Local<It>
where
    It: IntoIterator<Item = (I, f64)>,
{
    fn into_weighted_items(self, _comm: &Comm) -> Vec<WeightedItem<I>> {
        self.0
            .into_iter()
            .map(|(id, weight)| WeightedItem { id, weight })
            .collect()
    }
}

/// A sequence replicated identically on every rank.
///
/// Each rank keeps the items at positions congruent to its rank index, so the
/// global collection enters the job exactly once regardless of rank count.
pub struct Replicated<It>(pub It);

impl<I, It> WeightedInput<I> for Replicated<It>
where
    It: IntoIterator<Item = (I, f64)>,
{
    fn into_weighted_items(self, comm: &Comm) -> Vec<WeightedItem<I>> {
        let size = comm.size();
        let rank = comm.rank();
        self.0
            .into_iter()
            .enumerate()
            .filter(|(position, _)| position % size == rank)
            .map(|(_, (id, weight))| WeightedItem { id, weight })
            .collect()
    }
}

/// Occurrence counts contributed by this rank; the count becomes the weight.
pub struct Counts<It>(pub It);

impl<I, It> WeightedInput<I> for Counts<It>
where
    It: IntoIterator<Item = (I, u64)>,
{
    fn into_weighted_items(self, _comm: &Comm) -> Vec<WeightedItem<I>> {
        self.0
            .into_iter()
            .map(|(id, count)| WeightedItem {
                id,
                weight: count as f64,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{collective, run};

    #[test]
    fn replicated_input_is_contributed_once() {
        run(3, |comm| {
            let full: Vec<(u32, f64)> = (0..10).map(|i| (i, 1.0)).collect();
            let mine = Replicated(full).into_weighted_items(comm);
            let counts = collective::sum(mine.len() as u64, comm);
            assert_eq!(counts, 10);
            // Disjoint shares: ids across ranks cover 0..10 exactly once.
            let mut all: Vec<u32> = collective::all_gather(
                mine.iter().map(|item| item.id).collect::<Vec<_>>(),
                comm,
            )
            .into_iter()
            .flatten()
            .collect();
            all.sort_unstable();
            assert_eq!(all, (0..10).collect::<Vec<_>>());
        });
    }

    #[test]
    fn counts_become_weights() {
        run(1, |comm| {
            let counts = vec![("a", 3u64), ("b", 1)];
            let items = Counts(counts).into_weighted_items(comm);
            assert_eq!(items[0].weight, 3.0);
            assert_eq!(items[1].weight, 1.0);
        });
    }
}

// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Distributed weighted random sampling.
//!
//! An [`AliasTable`] takes weighted items scattered arbitrarily across the
//! ranks of a job and turns them into a structure that samples any item, with
//! probability proportional to its global weight, in constant time per draw:
//!
//! 1. The weight balancer redistributes weight so every rank holds exactly
//!    `W_total / nranks`, slicing items across region boundaries as needed.
//! 2. Each rank compiles its balanced share into a [`LocalAliasTable`] per
//!    Vose's method.
//! 3. [`AliasTable::async_sample`] picks a uniformly random rank, ships the
//!    request there, samples from that rank's local table, and hands the item
//!    to the caller's visitor on the destination rank.
//!
//! Because every rank carries equal weight and rank selection is uniform, the
//! two-stage draw reproduces each item's global relative weight exactly.

mod balance;
mod input;
mod vose;

pub use input::{Counts, Local, Replicated, WeightedInput};
pub use vose::{AliasEntry, LocalAliasTable};

use std::cell::RefCell;
use std::rc::Rc;

use log::debug;
use thiserror::Error;

use crate::comm::{Comm, Handle, Rank, collective};
use crate::random::RankRng;

/// An item paired with its sampling weight.
///
/// Weights are non-negative and finite. Ids may repeat; sampling probability
/// then accrues over all occurrences.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedItem<I> {
    pub id: I,
    pub weight: f64,
}

/// Why an alias table could not be constructed.
///
/// All variants are detected collectively: every rank of the job returns the
/// same error, so construction failure never strands a rank in a barrier.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum BuildError {
    /// Some item carries a negative, NaN, or infinite weight.
    #[error("item {index} on rank {rank} has invalid weight {weight}")]
    InvalidWeight {
        rank: Rank,
        index: usize,
        weight: f64,
    },
    /// No item anywhere in the job has positive weight.
    #[error("total weight across all ranks is zero")]
    ZeroTotalWeight,
}

/// The per-rank table state addressed by cross-rank sampling requests.
///
/// Visitors that captured the table's [`Handle`] can resolve it on the rank
/// where they run and draw further samples from that rank's local table.
pub struct TableCell<I> {
    table: LocalAliasTable<I>,
    rng: RefCell<RankRng>,
}

impl<I: Clone + Default> TableCell<I> {
    /// Draws one item from this rank's local table.
    pub fn sample(&self) -> I {
        let mut rng = self.rng.borrow_mut();
        self.table.sample(&mut rng).clone()
    }

    /// Number of buckets in this rank's local table.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Bucket width of this rank's local table.
    pub fn avg_weight(&self) -> f64 {
        self.table.avg_weight()
    }
}

/// Distributed alias table supporting O(1) weighted sampling of the global
/// item collection.
///
/// Constructed and dropped collectively; immutable once built. Each rank
/// exclusively owns its local table, and cross-rank sampling requests reach it
/// through the communicator.
pub struct AliasTable<'a, I> {
    comm: &'a Comm,
    cell: Rc<TableCell<I>>,
    handle: Handle<TableCell<I>>,
}

impl<'a, I> std::fmt::Debug for AliasTable<'a, I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AliasTable")
            .field("handle", &self.handle.index())
            .finish()
    }
}

impl<'a, I> AliasTable<'a, I>
where
    I: Clone + Default + Send + 'static,
{
    /// Builds the table from this rank's share of the weighted input.
    /// Collective.
    ///
    /// With `Some(seed)`, the table's random streams depend only on
    /// `(seed, rank)`; with `None`, rank 0 broadcasts entropy.
    pub fn new<In>(comm: &'a Comm, input: In, seed: Option<u64>) -> Result<Self, BuildError>
    where
        In: WeightedInput<I>,
    {
        let local_items = input.into_weighted_items(comm);

        // Agree on input validity before anyone starts the exchange.
        let offender = local_items
            .iter()
            .enumerate()
            .find(|(_, item)| !item.weight.is_finite() || item.weight < 0.0)
            .map(|(index, item)| (comm.rank(), index, item.weight));
        if let Some((rank, index, weight)) = collective::all_gather(offender, comm)
            .into_iter()
            .flatten()
            .next()
        {
            return Err(BuildError::InvalidWeight {
                rank,
                index,
                weight,
            });
        }
        let local_weight: f64 = local_items.iter().map(|item| item.weight).sum();
        let global_weight = collective::sum(local_weight, comm);
        if global_weight <= 0.0 {
            return Err(BuildError::ZeroTotalWeight);
        }

        let rng = RankRng::new(comm, seed);
        let balanced = balance::balance_weight(comm, local_items);
        let table = LocalAliasTable::build(&balanced);
        debug!(
            "rank {}: alias table ready with {} buckets of width {:.6}",
            comm.rank(),
            table.len(),
            table.avg_weight()
        );

        let cell = Rc::new(TableCell {
            table,
            rng: RefCell::new(rng),
        });
        let handle = comm.register(Rc::clone(&cell));
        comm.barrier();
        Ok(Self { comm, cell, handle })
    }

    /// Samples one item from the global collection and delivers it to
    /// `visitor` on the rank that holds it.
    ///
    /// Fire-and-forget: the draw happens on a uniformly random destination
    /// rank when the request arrives there, and `visitor` runs on that rank
    /// with the destination's communicator. At-most-once per call; ordering
    /// between calls is not guaranteed. All outstanding requests have been
    /// delivered once a subsequent [`Comm::barrier`] returns.
    pub fn async_sample<V>(&self, visitor: V)
    where
        V: FnOnce(&Comm, &I) + Send + 'static,
    {
        let handle = self.handle;
        let dest = self
            .cell
            .rng
            .borrow_mut()
            .uniform_int(0, self.comm.size() as u64 - 1) as Rank;
        self.comm.async_call(dest, move |comm| {
            let cell = comm.resolve(handle);
            let item = cell.sample();
            visitor(comm, &item);
        });
    }

    /// Cross-rank handle to the per-rank table state, for visitors that need
    /// to address the table on the rank where they run.
    pub fn handle(&self) -> Handle<TableCell<I>> {
        self.handle
    }

    /// Number of buckets in this rank's local table. Always at least one.
    pub fn local_table_len(&self) -> usize {
        self.cell.table.len()
    }

    /// Bucket width of this rank's local table.
    pub fn avg_weight(&self) -> f64 {
        self.cell.table.avg_weight()
    }

    /// Weight held by this rank after balancing, `avg_weight * len`.
    pub fn local_weight(&self) -> f64 {
        self.cell.table.avg_weight() * self.cell.table.len() as f64
    }

    /// This rank's buckets, for inspection and invariant checks.
    pub fn local_entries(&self) -> &[AliasEntry<I>] {
        self.cell.table.entries()
    }
}

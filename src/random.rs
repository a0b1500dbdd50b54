// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-rank deterministic random streams.
//!
//! Every rank of a job gets its own PRNG stream derived from a single job
//! seed, so a given `(seed, rank)` pair always replays the same sequence while
//! distinct ranks draw from distinct streams. When no seed is given, rank 0
//! draws entropy and broadcasts it, so the job is still internally consistent.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::comm::{Comm, Rank, collective};

/// splitmix64 increment, also used to separate rank streams.
const GOLDEN_GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

/// splitmix64 finalizer; avalanches the seed/rank mix into a stream seed.
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Deterministic per-rank random engine.
///
/// Not thread-safe and not meant to be: each rank owns one engine and the
/// execution model is single-threaded per rank.
pub struct RankRng {
    rng: StdRng,
}

impl RankRng {
    /// Creates the engine for this rank.
    ///
    /// With `Some(seed)` the stream depends only on `(seed, rank)`. With
    /// `None` this is a collective call: rank 0 draws nondeterministic entropy
    /// and broadcasts it as the job seed.
    pub fn new(comm: &Comm, seed: Option<u64>) -> Self {
        let seed = match seed {
            Some(seed) => seed,
            None => collective::broadcast(rand::rng().random::<u64>(), 0, comm),
        };
        Self::for_rank(seed, comm.rank())
    }

    /// Builds the stream for `(seed, rank)` without touching a communicator.
    pub fn for_rank(seed: u64, rank: Rank) -> Self {
        let stream = mix64(seed.wrapping_add((rank as u64 + 1).wrapping_mul(GOLDEN_GAMMA)));
        Self {
            rng: StdRng::seed_from_u64(stream),
        }
    }

    /// Uniform integer in the inclusive range `[lo, hi]`.
    pub fn uniform_int(&mut self, lo: u64, hi: u64) -> u64 {
        self.rng.random_range(lo..=hi)
    }

    /// Uniform double in the half-open range `[lo, hi)`.
    pub fn uniform_real(&mut self, lo: f64, hi: f64) -> f64 {
        self.rng.random_range(lo..hi)
    }
}

// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Alias table construction per Vose's method.
//!
//! Builds, from `n` weighted items, `n` equal-width buckets such that drawing
//! a uniform bucket and then a uniform point inside it reproduces the weighted
//! distribution exactly, giving O(1) sampling. This is the numerically stable
//! variant from Keith Schwarz's "Darts, Dice, and Coins" writeup: the heavy
//! item's residual is updated as `(h + l) - avg`, which keeps the subtrahend
//! small, never as `h - (avg - l)`.

use crate::random::RankRng;
use crate::sampling::WeightedItem;

/// One bucket of an alias table.
///
/// The bucket has width `avg_weight`; a point below `p` selects `a`, a point
/// above selects `b`. Buckets holding a single residual item use the full
/// width (`p == avg_weight`) and carry a default-constructed `b` that is never
/// returned.
#[derive(Clone, Debug)]
pub struct AliasEntry<I> {
    pub p: f64,
    pub a: I,
    pub b: I,
}

/// An alias table over one rank's share of the items.
#[derive(Clone, Debug)]
pub struct LocalAliasTable<I> {
    entries: Vec<AliasEntry<I>>,
    avg_weight: f64,
}

impl<I: Clone + Default> LocalAliasTable<I> {
    /// Compiles `items` into an alias table.
    ///
    /// Weights must be positive and finite.
    ///
    /// # Panics
    ///
    /// Panics if `items` is empty or its total weight is not positive.
    pub fn build(items: &[WeightedItem<I>]) -> Self {
        assert!(!items.is_empty(), "an alias table needs at least one item");
        let total: f64 = items.iter().map(|item| item.weight).sum();
        let avg_weight = total / items.len() as f64;
        assert!(avg_weight > 0.0, "total item weight must be positive");

        let mut light = Vec::new();
        let mut heavy = Vec::new();
        for item in items {
            if item.weight < avg_weight {
                light.push(item.clone());
            } else {
                heavy.push(item.clone());
            }
        }

        let mut entries = Vec::with_capacity(items.len());
        while !light.is_empty() && !heavy.is_empty() {
            let l = light.pop().expect("checked non-empty");
            let h = heavy.last_mut().expect("checked non-empty");
            entries.push(AliasEntry {
                p: l.weight,
                a: l.id,
                b: h.id.clone(),
            });
            h.weight = (h.weight + l.weight) - avg_weight;
            if h.weight < avg_weight {
                let demoted = heavy.pop().expect("checked non-empty");
                light.push(demoted);
            }
        }

        // One side is now empty; the leftovers fill whole buckets on their
        // own. Residual light items can only appear through floating point
        // drift.
        for residual in heavy.into_iter().chain(light) {
            entries.push(AliasEntry {
                p: avg_weight,
                a: residual.id,
                b: I::default(),
            });
        }

        debug_assert!(entries.iter().all(|e| e.p > 0.0 && e.p <= avg_weight));
        Self {
            entries,
            avg_weight,
        }
    }

    /// Draws one item in O(1): a uniform bucket, then a uniform point within
    /// the bucket against its split `p`.
    pub fn sample(&self, rng: &mut RankRng) -> &I {
        let i = rng.uniform_int(0, self.entries.len() as u64 - 1) as usize;
        let entry = &self.entries[i];
        if entry.p >= self.avg_weight {
            return &entry.a;
        }
        let f = rng.uniform_real(0.0, self.avg_weight);
        if f <= entry.p { &entry.a } else { &entry.b }
    }

    /// Number of buckets, equal to the number of items the table was built
    /// from.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bucket width; the table's total weight is `avg_weight() * len()`.
    pub fn avg_weight(&self) -> f64 {
        self.avg_weight
    }

    pub fn entries(&self) -> &[AliasEntry<I>] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(weights: &[f64]) -> Vec<WeightedItem<usize>> {
        weights
            .iter()
            .enumerate()
            .map(|(id, &weight)| WeightedItem { id, weight })
            .collect()
    }

    #[test]
    fn buckets_cover_the_total_weight() {
        let table = LocalAliasTable::build(&items(&[1.0, 2.0, 3.0, 4.0]));
        assert_eq!(table.len(), 4);
        assert!((table.avg_weight() - 2.5).abs() < 1e-12);
        for entry in table.entries() {
            assert!(entry.p > 0.0);
            assert!(entry.p <= table.avg_weight());
        }
    }

    #[test]
    fn singleton_always_returns_its_item() {
        let table = LocalAliasTable::build(&items(&[5.0]));
        let mut rng = RankRng::for_rank(0, 0);
        for _ in 0..1000 {
            assert_eq!(*table.sample(&mut rng), 0);
        }
    }

    #[test]
    fn frequencies_follow_the_weights() {
        let weights = [1.0, 2.0, 3.0, 4.0];
        let table = LocalAliasTable::build(&items(&weights));
        let mut rng = RankRng::for_rank(42, 0);

        let draws = 200_000;
        let mut counts = [0u64; 4];
        for _ in 0..draws {
            counts[*table.sample(&mut rng)] += 1;
        }

        let total: f64 = weights.iter().sum();
        for (id, &count) in counts.iter().enumerate() {
            let expected = weights[id] / total;
            let observed = count as f64 / draws as f64;
            assert!(
                (observed - expected).abs() < 5e-3,
                "item {id}: observed {observed}, expected {expected}"
            );
        }
    }

    #[test]
    fn heavy_dominant_item_is_stable() {
        // One item carries almost all the weight; the update form
        // (h + l) - avg must not let the residual drift negative.
        let mut weights = vec![1e-9; 99];
        weights.push(1e9);
        let table = LocalAliasTable::build(&items(&weights));
        assert_eq!(table.len(), 100);
        for entry in table.entries() {
            assert!(entry.p > 0.0);
            assert!(entry.p <= table.avg_weight() + 1e-12);
        }
    }

    #[test]
    #[should_panic(expected = "at least one item")]
    fn empty_input_is_rejected() {
        let _ = LocalAliasTable::build(&items(&[]));
    }
}

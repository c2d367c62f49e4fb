//! Batching Optimizer
//!
//! Groups queued requests that target the same model into one batch. The scan
//! is bounded per band so a long queue of unrelated work is never walked in
//! full, and every item that is not taken goes back where it was.

use std::sync::Arc;

use super::priority::{BandQueues, PriorityBand};

/// Something that can be grouped with others sharing the same key
pub trait BatchItem {
    type Key: PartialEq;

    fn batch_key(&self) -> &Self::Key;
}

/// Decides whether a candidate may join the batch seeded by `seed`.
/// Only consulted for candidates with the same batch key.
pub trait BatchPredicate<T>: Send + Sync {
    fn compatible(&self, seed: &T, candidate: &T) -> bool;
}

impl<T, F> BatchPredicate<T> for F
where
    F: Fn(&T, &T) -> bool + Send + Sync,
{
    fn compatible(&self, seed: &T, candidate: &T) -> bool {
        self(seed, candidate)
    }
}

/// Default predicate: any same-model request may join
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysCompatible;

impl<T> BatchPredicate<T> for AlwaysCompatible {
    fn compatible(&self, _seed: &T, _candidate: &T) -> bool {
        true
    }
}

pub struct BatchingOptimizer<T> {
    predicate: Arc<dyn BatchPredicate<T>>,
}

impl<T> Clone for BatchingOptimizer<T> {
    fn clone(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
        }
    }
}

impl<T: BatchItem + 'static> Default for BatchingOptimizer<T> {
    fn default() -> Self {
        Self::new(Arc::new(AlwaysCompatible))
    }
}

impl<T: BatchItem> BatchingOptimizer<T> {
    pub fn new(predicate: Arc<dyn BatchPredicate<T>>) -> Self {
        Self { predicate }
    }

    /// Build a batch around `seed`, pulling compatible items from the high,
    /// medium and low bands in that order. The seed is always the first member.
    pub fn collect(
        &self,
        seed: T,
        queues: &BandQueues<T>,
        max_batch_size: usize,
        scan_factor: usize,
    ) -> Vec<T> {
        let mut batch = Vec::with_capacity(max_batch_size.max(1));

        for band in PriorityBand::ALL {
            let remaining = max_batch_size.saturating_sub(batch.len() + 1);
            if remaining == 0 {
                break;
            }
            let scan_limit = scan_factor.max(1).saturating_mul(remaining);
            let members = queues.band(band).drain_matching(scan_limit, remaining, |candidate| {
                candidate.batch_key() == seed.batch_key()
                    && self.predicate.compatible(&seed, candidate)
            });
            batch.extend(members);
        }

        batch.insert(0, seed);
        batch
    }
}

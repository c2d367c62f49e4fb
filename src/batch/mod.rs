//! Request queuing and batching
//!
//! Provides:
//! - Three priority bands with bounded blocking queues
//! - A batching optimizer that groups same-model requests

mod optimizer;
mod priority;

pub use optimizer::{AlwaysCompatible, BatchItem, BatchPredicate, BatchingOptimizer};
pub use priority::{
    BandQueues, BlockingPriorityQueue, PrioritizedItem, PriorityBand, PriorityQueue, QueueDepths,
};

//! Result caching
//!
//! Inference outputs are cached per (model, input) so repeated requests skip
//! the model entirely.

mod key;
mod result_cache;

pub use key::CacheKey;
pub use result_cache::{CacheEntry, CacheStats, PayloadSizeEstimator, ResultCache, SizeEstimator};

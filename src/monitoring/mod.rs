//! Monitoring Module
//!
//! Provides per-model statistics tracking and the background resource monitor.

mod resource;
mod stats;

pub use resource::{
    LoadSnapshot, PoolSizes, PoolSizingPolicy, QueueDepthPolicy, ResourceMonitor, StaticPoolPolicy,
    SystemSampler,
};
pub use stats::{ExecutorStats, ModelStatistics, ModelStatsSnapshot, StatisticsRegistry};

//! Resource Monitoring
//!
//! A background thread that periodically samples executor load and system
//! resources, asks a [`PoolSizingPolicy`] whether the worker pools should be
//! resized, and emits aggregate statistics.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::{debug, warn};

use crate::batch::QueueDepths;
use crate::error::{ExecutorError, Result};

/// Thread counts of the three stage pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizes {
    pub preprocess: usize,
    pub inference: usize,
    pub postprocess: usize,
}

/// What the monitor saw on one tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSnapshot {
    pub queue_depths: QueueDepths,
    /// Stage tasks spawned but not finished
    pub in_flight_tasks: usize,
    /// Async requests not yet terminal
    pub active_requests: usize,
    /// Sizes the pools currently run with
    pub current: PoolSizes,
    /// Sizes from the active configuration
    pub configured: PoolSizes,
    /// Overall CPU usage percentage (0–100)
    pub cpu_usage_pct: f64,
    /// Memory usage percentage (0–100)
    pub memory_usage_pct: f64,
}

/// Decides the pool sizes for the next interval
pub trait PoolSizingPolicy: Send + Sync {
    /// `Some` to rebuild the pools with new sizes, `None` to keep them
    fn resize(&self, load: &LoadSnapshot) -> Option<PoolSizes>;
}

/// Keeps the configured sizes
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticPoolPolicy;

impl PoolSizingPolicy for StaticPoolPolicy {
    fn resize(&self, load: &LoadSnapshot) -> Option<PoolSizes> {
        (load.current != load.configured).then_some(load.configured)
    }
}

/// Grows the inference pool by one thread while requests back up and
/// shrinks it back towards the configured size when idle
#[derive(Debug, Clone, Copy)]
pub struct QueueDepthPolicy {
    /// Queued requests per inference thread that count as backlog
    pub backlog_per_thread: usize,
    pub max_inference_threads: usize,
}

impl Default for QueueDepthPolicy {
    fn default() -> Self {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            backlog_per_thread: 4,
            max_inference_threads: cores * 2,
        }
    }
}

impl PoolSizingPolicy for QueueDepthPolicy {
    fn resize(&self, load: &LoadSnapshot) -> Option<PoolSizes> {
        let current = load.current;
        let queued = load.queue_depths.total();

        if queued > current.inference * self.backlog_per_thread
            && current.inference < self.max_inference_threads
        {
            return Some(PoolSizes {
                inference: current.inference + 1,
                ..current
            });
        }
        if queued == 0 && load.in_flight_tasks == 0 && current.inference > load.configured.inference {
            return Some(PoolSizes {
                inference: current.inference - 1,
                ..current
            });
        }
        None
    }
}

/// CPU and memory sampler backed by `sysinfo`
pub struct SystemSampler {
    sys: System,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        Self { sys }
    }

    /// (cpu %, memory %)
    pub fn sample(&mut self) -> (f64, f64) {
        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let cpus = self.sys.cpus();
        let cpu = if cpus.is_empty() {
            0.0
        } else {
            cpus.iter().map(|c| c.cpu_usage() as f64).sum::<f64>() / cpus.len() as f64
        };
        let total = self.sys.total_memory() as f64;
        let memory = if total > 0.0 {
            self.sys.used_memory() as f64 / total * 100.0
        } else {
            0.0
        };
        (cpu, memory)
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Signal {
    stopped: bool,
    woken: bool,
}

#[derive(Debug, Default)]
struct MonitorControl {
    signal: Mutex<Signal>,
    cond: Condvar,
}

/// Background thread calling `tick` every interval
pub struct ResourceMonitor {
    control: Arc<MonitorControl>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    /// Start the monitor thread. `interval` is re-read before every wait so
    /// configuration changes apply on the next tick.
    pub fn start<I, F>(interval: I, mut tick: F) -> Result<Self>
    where
        I: Fn() -> Duration + Send + 'static,
        F: FnMut() + Send + 'static,
    {
        let control = Arc::new(MonitorControl::default());
        let thread_control = control.clone();

        let handle = thread::Builder::new()
            .name("model-resource-monitor".to_string())
            .spawn(move || {
                debug!("Resource monitor started");
                loop {
                    {
                        let mut signal = thread_control.signal.lock();
                        if !signal.stopped && !signal.woken {
                            thread_control.cond.wait_for(&mut signal, interval());
                        }
                        if signal.stopped {
                            break;
                        }
                        signal.woken = false;
                    }
                    tick();
                }
                debug!("Resource monitor stopped");
            })
            .map_err(|e| ExecutorError::ThreadPool(format!("failed to spawn monitor: {}", e)))?;

        Ok(Self {
            control,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Run a tick now instead of waiting for the interval
    pub fn wake(&self) {
        self.control.signal.lock().woken = true;
        self.control.cond.notify_all();
    }

    /// Stop and join the thread. Safe to call more than once.
    pub fn stop(&self) {
        self.control.signal.lock().stopped = true;
        self.control.cond.notify_all();
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("Resource monitor thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn load(current: usize, configured: usize, queued: usize, in_flight: usize) -> LoadSnapshot {
        let sizes = |inference| PoolSizes {
            preprocess: 2,
            inference,
            postprocess: 2,
        };
        LoadSnapshot {
            queue_depths: QueueDepths {
                high: 0,
                medium: queued,
                low: 0,
            },
            in_flight_tasks: in_flight,
            active_requests: 0,
            current: sizes(current),
            configured: sizes(configured),
            cpu_usage_pct: 0.0,
            memory_usage_pct: 0.0,
        }
    }

    #[test]
    fn test_static_policy() {
        assert_eq!(StaticPoolPolicy.resize(&load(2, 2, 100, 5)), None);
        // drifts back to the configured sizes
        assert_eq!(StaticPoolPolicy.resize(&load(3, 2, 0, 0)).unwrap().inference, 2);
    }

    #[test]
    fn test_queue_depth_policy() {
        let policy = QueueDepthPolicy {
            backlog_per_thread: 4,
            max_inference_threads: 4,
        };
        assert_eq!(policy.resize(&load(2, 2, 9, 1)).unwrap().inference, 3);
        assert_eq!(policy.resize(&load(2, 2, 8, 1)), None);
        assert_eq!(policy.resize(&load(4, 2, 100, 1)), None);
        assert_eq!(policy.resize(&load(3, 2, 0, 0)).unwrap().inference, 2);
        assert_eq!(policy.resize(&load(3, 2, 0, 1)), None);
    }

    #[test]
    fn test_sampler_ranges() {
        let mut sampler = SystemSampler::new();
        let (cpu, memory) = sampler.sample();
        assert!(cpu >= 0.0);
        assert!((0.0..=100.0).contains(&memory));
    }

    #[test]
    fn test_monitor_ticks_and_stops() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let monitor = ResourceMonitor::start(
            || Duration::from_millis(5),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());

        let after = ticks.load(Ordering::SeqCst);
        assert!(after >= 3);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ticks.load(Ordering::SeqCst), after);
    }

    #[test]
    fn test_wake_runs_tick_early() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let monitor = ResourceMonitor::start(
            || Duration::from_secs(3600),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();

        monitor.wake();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }
}

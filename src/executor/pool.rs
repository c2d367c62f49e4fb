//! Stage worker pools
//!
//! One rayon pool per pipeline stage. Tasks are spawned FIFO so requests leave
//! a stage in the order they entered it. Every spawned task is counted while
//! it runs so shutdown can wait for in-flight work.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::error;

use crate::error::Result;
use crate::monitoring::PoolSizes;

/// Pipeline stage a task belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Preprocess,
    Inference,
    Postprocess,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Stage::Preprocess => "preprocess",
            Stage::Inference => "inference",
            Stage::Postprocess => "postprocess",
        }
    }
}

/// Counts stage tasks that have been spawned but not finished
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    pub(crate) fn current(&self) -> usize {
        *self.count.lock()
    }

    /// Wait until no task is in flight. False if `grace` ran out first.
    pub(crate) fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

/// Decrements the in-flight count when the task ends, including by panic
struct TaskGuard<'a>(&'a InFlight);

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// The three stage pools
pub(crate) struct WorkerPools {
    preprocess: ThreadPool,
    inference: ThreadPool,
    postprocess: ThreadPool,
    sizes: PoolSizes,
}

impl WorkerPools {
    pub(crate) fn new(sizes: PoolSizes) -> Result<Self> {
        Ok(Self {
            preprocess: build_pool(Stage::Preprocess, sizes.preprocess)?,
            inference: build_pool(Stage::Inference, sizes.inference)?,
            postprocess: build_pool(Stage::Postprocess, sizes.postprocess)?,
            sizes,
        })
    }

    pub(crate) fn sizes(&self) -> PoolSizes {
        self.sizes
    }

    /// Run `task` on the pool of `stage`, counted in `in_flight`
    pub(crate) fn spawn<F>(&self, stage: Stage, in_flight: &Arc<InFlight>, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let pool = match stage {
            Stage::Preprocess => &self.preprocess,
            Stage::Inference => &self.inference,
            Stage::Postprocess => &self.postprocess,
        };
        in_flight.begin();
        let in_flight = in_flight.clone();
        pool.spawn_fifo(move || {
            let _guard = TaskGuard(&in_flight);
            task();
        });
    }
}

fn build_pool(stage: Stage, threads: usize) -> Result<ThreadPool> {
    let name = stage.as_str();
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(move |i| format!("model-{}-{}", name, i))
        .panic_handler(move |_| error!(stage = name, "Stage task panicked"))
        .build()?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn sizes(n: usize) -> PoolSizes {
        PoolSizes {
            preprocess: n,
            inference: n,
            postprocess: n,
        }
    }

    #[test]
    fn test_thread_names() {
        let pools = WorkerPools::new(sizes(1)).unwrap();
        let in_flight = Arc::new(InFlight::new());
        let (tx, rx) = mpsc::channel();
        pools.spawn(Stage::Inference, &in_flight, move || {
            let name = std::thread::current().name().map(str::to_string);
            tx.send(name).unwrap();
        });
        assert_eq!(rx.recv().unwrap().as_deref(), Some("model-inference-0"));
    }

    #[test]
    fn test_wait_idle() {
        let pools = WorkerPools::new(sizes(2)).unwrap();
        let in_flight = Arc::new(InFlight::new());
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = done.clone();
            pools.spawn(Stage::Preprocess, &in_flight, move || {
                std::thread::sleep(Duration::from_millis(10));
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(in_flight.wait_idle(Duration::from_secs(5)));
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(in_flight.current(), 0);
    }

    #[test]
    fn test_panicking_task_is_uncounted() {
        let pools = WorkerPools::new(sizes(1)).unwrap();
        let in_flight = Arc::new(InFlight::new());
        pools.spawn(Stage::Postprocess, &in_flight, || panic!("boom"));
        assert!(in_flight.wait_idle(Duration::from_secs(5)));
    }

    #[test]
    fn test_wait_idle_times_out() {
        let pools = WorkerPools::new(sizes(1)).unwrap();
        let in_flight = Arc::new(InFlight::new());
        pools.spawn(Stage::Inference, &in_flight, || {
            std::thread::sleep(Duration::from_millis(300));
        });
        assert!(!in_flight.wait_idle(Duration::from_millis(10)));
        assert!(in_flight.wait_idle(Duration::from_secs(5)));
    }
}

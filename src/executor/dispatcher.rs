//! Dispatcher
//!
//! A single named thread that pulls the most urgent request from the band
//! queues, lets the batching optimizer gather same-model companions and hands
//! the unit to the preprocess pool.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::shared::ExecutorCore;
use super::pipeline::{self, panic_message};
use crate::batch::{BandQueues, PriorityBand};
use crate::error::{ExecutorError, Result};

/// How long `stop` waits for the dispatcher thread before detaching it
pub const DISPATCHER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

struct DispatchControl {
    running: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl DispatchControl {
    /// Block for at most `poll` while paused. True if dispatching is paused.
    fn wait_while_paused(&self, poll: Duration) -> bool {
        let mut paused = self.paused.lock();
        if *paused {
            self.resumed.wait_for(&mut paused, poll);
            true
        } else {
            false
        }
    }
}

pub(crate) struct Dispatcher {
    core: Arc<ExecutorCore>,
    control: Arc<DispatchControl>,
    handle: Mutex<Option<JoinHandle<()>>>,
    done: Mutex<Option<mpsc::Receiver<()>>>,
}

impl Dispatcher {
    pub(crate) fn start(core: Arc<ExecutorCore>) -> Result<Self> {
        let control = Arc::new(DispatchControl {
            running: AtomicBool::new(true),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
        });
        let (done_tx, done_rx) = mpsc::channel();

        let thread_core = core.clone();
        let thread_control = control.clone();
        let handle = thread::Builder::new()
            .name("model-dispatcher".to_string())
            .spawn(move || {
                run(&thread_core, &thread_control);
                let _ = done_tx.send(());
            })
            .map_err(|e| ExecutorError::ThreadPool(format!("failed to spawn dispatcher: {}", e)))?;

        Ok(Self {
            core,
            control,
            handle: Mutex::new(Some(handle)),
            done: Mutex::new(Some(done_rx)),
        })
    }

    pub(crate) fn pause(&self) {
        *self.control.paused.lock() = true;
        debug!("Dispatch paused");
    }

    pub(crate) fn resume(&self) {
        *self.control.paused.lock() = false;
        self.control.resumed.notify_all();
        debug!("Dispatch resumed");
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.control.paused.lock()
    }

    /// Stop the loop. In-flight stage tasks are not affected.
    pub(crate) fn stop(&self) {
        self.control.running.store(false, Ordering::Release);
        {
            // Wake a paused loop without unpausing it, so nothing else is dispatched
            let _paused = self.control.paused.lock();
            self.control.resumed.notify_all();
        }
        self.core.queues.wake_all();

        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let finished = match self.done.lock().take() {
            Some(done) => !matches!(done.recv_timeout(DISPATCHER_JOIN_TIMEOUT), Err(RecvTimeoutError::Timeout)),
            None => true,
        };

        if finished {
            if handle.join().is_err() {
                warn!("Dispatcher thread panicked");
            }
        } else {
            warn!(
                timeout_ms = DISPATCHER_JOIN_TIMEOUT.as_millis() as u64,
                "Dispatcher did not stop in time, detaching"
            );
        }
    }
}

fn run(core: &Arc<ExecutorCore>, control: &DispatchControl) {
    info!("Dispatcher started");
    while control.running.load(Ordering::Acquire) {
        let poll = core.config.read().dispatch_poll();
        if control.wait_while_paused(poll) {
            continue;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| dispatch_once(core, control, poll))) {
            error!(panic = %panic_message(payload.as_ref()), "Dispatch iteration panicked");
        }
    }
    info!("Dispatcher stopped");
}

fn dispatch_once(core: &Arc<ExecutorCore>, control: &DispatchControl, poll: Duration) {
    let Some((band, request)) = next_request(&core.queues, poll) else {
        return;
    };
    if request.is_cancelled() {
        debug!(request_id = %request.id(), "Discarding cancelled request");
        return;
    }

    // Hold the pause lock until the unit is handed off, so `pause` returns only
    // once nothing more can leave the queues
    let paused = control.paused.lock();
    if *paused || !control.running.load(Ordering::Acquire) {
        debug!(request_id = %request.id(), band = %band, "Dispatch paused, requeueing request");
        let (priority, submitted_at) = (request.priority(), request.submitted_at());
        core.queues.band(band).restore(request, priority, submitted_at);
        return;
    }

    let (batching, max_batch_size, scan_factor) = {
        let config = core.config.read();
        (config.enable_batching, config.max_batch_size, config.batch_scan_factor)
    };
    let unit = if batching && max_batch_size > 1 {
        core.optimizer
            .collect(request, &core.queues, max_batch_size, scan_factor)
    } else {
        vec![request]
    };
    pipeline::dispatch(core, unit);
    drop(paused);
}

/// Next request in band order, with the band it came from. Medium and low are
/// polled without blocking; when every band is empty the wait happens on the
/// high band.
pub(crate) fn next_request<T>(queues: &BandQueues<T>, poll: Duration) -> Option<(PriorityBand, T)> {
    let take = |band: PriorityBand| queues.band(band).poll().map(|item| (band, item));

    take(PriorityBand::High)
        .or_else(|| take(PriorityBand::Medium))
        .or_else(|| take(PriorityBand::Low))
        .or_else(|| {
            queues
                .band(PriorityBand::High)
                .poll_timeout(poll)
                .map(|item| (PriorityBand::High, item))
        })
        .or_else(|| take(PriorityBand::Medium))
        .or_else(|| take(PriorityBand::Low))
}

//! Real-time style delivery thread for `Clock::RealTime`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tap_recorder_core::models::error::{HalError, HalOperation};

use crate::simulated_hal::{Shared, STATUS_ILLEGAL_OPERATION};

/// Named thread that runs one delivery cycle per buffer period.
pub(crate) struct IoThread {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl IoThread {
    pub(crate) fn spawn(shared: Arc<Shared>, period: Duration) -> Result<Self, HalError> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("sim-hal-io".into())
            .spawn(move || io_loop(&shared, &flag, period))
            .map_err(|e| {
                log::error!("Failed to spawn I/O thread: {}", e);
                HalError::new(HalOperation::StartDevice, STATUS_ILLEGAL_OPERATION)
            })?;

        log::debug!("I/O thread started ({:?} period)", period);
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Signal the loop and wait for the current cycle to finish.
    pub(crate) fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("I/O thread panicked");
            }
        }
        log::debug!("I/O thread stopped");
    }
}

impl Drop for IoThread {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Paces cycles against a fixed schedule so slow handlers do not accumulate drift.
fn io_loop(shared: &Shared, running: &AtomicBool, period: Duration) {
    let mut next = Instant::now();
    while running.load(Ordering::SeqCst) {
        shared.run_cycle();

        next += period;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            // Overran; resynchronize instead of bursting.
            next = now;
        }
    }
}

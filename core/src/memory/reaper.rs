//! Background reclamation of surplus idle buffers.

use super::pool::BufferPool;

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, tick, Sender};
use crossbeam::select;

const MIN_INTERVAL: Duration = Duration::from_millis(5);
const MAX_INTERVAL: Duration = Duration::from_secs(1);

/// Thread that periodically expires surplus idle buffers, so the pool shrinks back to its core
/// size after a burst even when no further buffers are borrowed or returned.
pub(crate) struct Reaper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Starts a reaper thread named `name` for `pool`. It ticks at the pool's keep-alive interval,
    /// bounded to `[5ms, 1s]`.
    pub(crate) fn spawn(pool: &Arc<BufferPool>, name: String) -> io::Result<Self> {
        let interval = pool.keep_alive().clamp(MIN_INTERVAL, MAX_INTERVAL);
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let pool = Arc::clone(pool);

        let handle = thread::Builder::new().name(name).spawn(move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => {
                        pool.reclaim_idle();
                    }
                    recv(stop_rx) -> _ => break,
                }
            }
            log::debug!("Buffer reaper stopped.");
        })?;

        Ok(Reaper {
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stops the thread and waits for it to exit.
    pub(crate) fn shutdown(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Buffer reaper terminated abnormally.");
            }
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.shutdown();
    }
}

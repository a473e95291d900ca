//! Background write-back of delayed writes.

use crate::writeback::WriteBackEngine;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use fnfs_buf::{BufFlags, GetFlags};
use fnfs_error::Result;
use fnfs_types::Cx;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, trace};

/// Longest the flusher sleeps before rechecking its stop channel.
const POLL: Duration = Duration::from_millis(100);

impl WriteBackEngine {
    /// Start a thread that every `flush_period`, or as soon as the cache
    /// reports pressure, pushes out a batch of delayed writes.
    pub fn start_flusher(&self) -> Result<FlusherHandle> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let cx = Cx::for_request();
        let engine = self.clone();
        let child = cx.create_child();
        let join = std::thread::Builder::new()
            .name("fnfs-flush".to_owned())
            .spawn(move || flusher_loop(&engine, &child, &stop_rx))?;
        Ok(FlusherHandle {
            cx,
            stop: Some(stop_tx),
            join: Some(join),
        })
    }

    /// One flusher round over up to `flush_batch` of the oldest delayed
    /// writes: dirty ones are written asynchronously, ones holding only
    /// unstable data are committed. Busy buffers are skipped. Returns the
    /// number of buffers acted on.
    pub fn flush_delayed(&self, cx: &Cx) -> usize {
        let cache = self.cache();
        let mut started = 0;
        for (file, block) in cache.delayed_candidates(self.config().flush_batch) {
            let Ok(Some(mut handle)) = cache.get_if_cached(cx, file, block, GetFlags::NONBLOCK) else {
                continue;
            };
            let result = if handle.dirty().is_any_set() {
                self.write_async(handle)
            } else if handle.flags().contains(BufFlags::NEEDS_COMMIT) {
                self.commit(cx, &mut handle)
            } else {
                continue;
            };
            match result {
                Ok(()) => started += 1,
                Err(err) => trace!(file = file.0, block = block.0, error = %err, "delayed write not flushed"),
            }
        }
        started
    }
}

fn flusher_loop(engine: &WriteBackEngine, cx: &Cx, stop: &Receiver<()>) {
    let period = engine.config().flush_period;
    let slice = period.min(POLL);
    let mut waited = Duration::ZERO;
    loop {
        match stop.try_recv() {
            Err(TryRecvError::Empty) => {}
            Ok(()) | Err(TryRecvError::Disconnected) => break,
        }
        let pressure = engine.cache().wait_for_pressure(slice);
        waited += slice;
        if pressure || waited >= period {
            waited = Duration::ZERO;
            let started = engine.flush_delayed(cx);
            if started > 0 {
                debug!(started, pressure, "flushed delayed writes");
            }
        }
    }
    trace!("flusher stopped");
}

/// Handle to the delayed-write flusher thread.
#[derive(Debug)]
pub struct FlusherHandle {
    cx: Cx,
    stop: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl FlusherHandle {
    /// Stop the thread, abandoning any commit it is waiting on, and join it.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.cx.cancel();
        drop(self.stop.take());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for FlusherHandle {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

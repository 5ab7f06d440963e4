//! The two-executor substrate.
//!
//! The control executor is a current-thread tokio runtime owning the
//! WebSocket state and every outbound send; the work executor is a
//! multi-thread runtime for the decode-heavy pipeline. Decode must never run
//! on the control thread, where it would starve the send path.

use std::io;
use std::time::Duration;

use tokio::runtime;

/// Owns the control and work runtimes for one server process.
pub struct Executors {
    control: runtime::Runtime,
    work: runtime::Runtime,
}

impl Executors {
    /// Builds the pair. `worker_threads` sizes the work executor; the
    /// control executor is always a single thread.
    pub fn new(worker_threads: usize) -> io::Result<Self> {
        let control = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let work = runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("zasr-work")
            .enable_all()
            .build()?;
        Ok(Self { control, work })
    }

    /// Handle for posting work onto the work executor.
    pub fn work_handle(&self) -> runtime::Handle {
        self.work.handle().clone()
    }

    /// Runs a future to completion on the control executor.
    pub fn block_on_control<F: std::future::Future>(&self, fut: F) -> F::Output {
        self.control.block_on(fut)
    }

    /// Stops both executors, waiting briefly for in-flight decode to finish.
    pub fn shutdown(self) {
        self.work.shutdown_timeout(Duration::from_secs(5));
        self.control.shutdown_timeout(Duration::from_secs(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn work_runs_off_the_control_thread() {
        let executors = Executors::new(2).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let work = executors.work_handle();
        executors.block_on_control(async move {
            let control_thread = std::thread::current().id();
            let handle = work.spawn(async move {
                assert_ne!(std::thread::current().id(), control_thread);
                c.fetch_add(1, Ordering::SeqCst);
            });
            handle.await.unwrap();
        });

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        executors.shutdown();
    }
}

//! Single execution context for every command port.
//!
//! Interpreters hosting a command port are single-threaded: two commands
//! from different sessions must never run at the same time. Sessions hand
//! work to a [`Dispatcher`] and await the reply; exactly one
//! [`DispatchLoop`] runs the queued jobs, strictly one at a time, in the
//! order they were enqueued.
//!
//! ```text
//! session A ──┐
//! session B ──┼── Job ──► mpsc ──► DispatchLoop (host main thread) ──► oneshot reply
//! session C ──┘
//! ```
//!
//! The loop can run on the host's own thread ([`DispatchLoop::run`] or
//! [`DispatchLoop::run_pending`] from an idle callback) or on a dedicated
//! thread via [`Dispatcher::spawn`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread::JoinHandle;

use tokio::sync::oneshot;

use crate::error::{CommandPortError, Result};

type Job = Box<dyn FnOnce() + Send>;

/// Cloneable handle that enqueues work onto the execution context.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<Job>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}

/// The receiving end: runs queued jobs on whichever thread owns it.
pub struct DispatchLoop {
    rx: mpsc::Receiver<Job>,
}

impl std::fmt::Debug for DispatchLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchLoop").finish_non_exhaustive()
    }
}

/// Create a connected dispatcher / loop pair.
pub fn channel() -> (Dispatcher, DispatchLoop) {
    let (tx, rx) = mpsc::channel();
    (Dispatcher { tx }, DispatchLoop { rx })
}

impl Dispatcher {
    /// Spawn the dispatch loop on a dedicated, named thread.
    ///
    /// The thread exits once every `Dispatcher` clone has been dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to create the thread.
    pub fn spawn() -> std::io::Result<(Self, JoinHandle<()>)> {
        let (dispatcher, dispatch_loop) = channel();
        let handle = std::thread::Builder::new()
            .name("command-port-exec".to_string())
            .spawn(move || dispatch_loop.run())?;
        Ok((dispatcher, handle))
    }

    /// Run `job` on the execution context and wait for its result.
    ///
    /// # Errors
    ///
    /// `DispatcherClosed` if the loop is gone or the job panicked.
    pub async fn run<T, F>(&self, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let boxed: Job = Box::new(move || {
            // Receiver gone means the session ended while we ran; nothing to do.
            let _ = reply_tx.send(job());
        });
        self.tx.send(boxed).map_err(|e| {
            log::debug!("[Dispatch] Execution context gone: {e}");
            CommandPortError::DispatcherClosed
        })?;
        reply_rx.await.map_err(|e| {
            log::debug!("[Dispatch] Job dropped without a reply: {e}");
            CommandPortError::DispatcherClosed
        })
    }
}

impl DispatchLoop {
    /// Run jobs until every `Dispatcher` has been dropped.
    ///
    /// Blocks the calling thread, which becomes the execution context.
    pub fn run(self) {
        log::info!("[Dispatch] Execution context started");
        while let Ok(job) = self.rx.recv() {
            run_job(job);
        }
        log::info!("[Dispatch] Execution context stopped");
    }

    /// Run every job queued right now without blocking.
    ///
    /// Returns the number of jobs executed. Intended for hosts that pump the
    /// queue from their own idle loop.
    pub fn run_pending(&self) -> usize {
        let mut count = 0;
        while let Ok(job) = self.rx.try_recv() {
            run_job(job);
            count += 1;
        }
        count
    }

    /// Wait up to `timeout` for one job and run it, then drain the rest.
    ///
    /// Returns the number of jobs executed.
    pub fn run_for(&self, timeout: std::time::Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(job) => {
                run_job(job);
                1 + self.run_pending()
            }
            Err(_) => 0,
        }
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        log::error!("[Dispatch] Command job panicked; execution context continues");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_jobs_never_overlap() {
        let (dispatcher, handle) = Dispatcher::spawn().unwrap();
        let busy = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let dispatcher = dispatcher.clone();
            let busy = Arc::clone(&busy);
            let calls = Arc::clone(&calls);
            tasks.push(tokio::spawn(async move {
                dispatcher
                    .run(move || {
                        assert!(!busy.swap(true, Ordering::SeqCst), "re-entered execution context");
                        std::thread::sleep(Duration::from_millis(5));
                        calls.fetch_add(1, Ordering::SeqCst);
                        busy.store(false, Ordering::SeqCst);
                        i
                    })
                    .await
                    .unwrap()
            }));
        }
        for (i, task) in tasks.into_iter().enumerate() {
            assert_eq!(task.await.unwrap(), i);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 16);

        drop(dispatcher);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_kill_context() {
        let (dispatcher, _handle) = Dispatcher::spawn().unwrap();

        let result = dispatcher.run(|| -> usize { panic!("evaluator blew up") }).await;
        assert!(matches!(result, Err(CommandPortError::DispatcherClosed)));

        assert_eq!(dispatcher.run(|| 41 + 1).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_run_after_loop_dropped_fails() {
        let (dispatcher, dispatch_loop) = channel();
        drop(dispatch_loop);
        let result = dispatcher.run(|| ()).await;
        assert!(matches!(result, Err(CommandPortError::DispatcherClosed)));
    }

    #[test]
    fn test_host_pumped_loop_runs_jobs() {
        let (dispatcher, dispatch_loop) = channel();
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let task = rt.spawn(async move { dispatcher.run(|| 6 * 7).await });

        let mut ran = 0;
        for _ in 0..100 {
            ran += dispatch_loop.run_for(Duration::from_millis(20));
            if ran > 0 {
                break;
            }
        }
        assert_eq!(ran, 1);
        assert_eq!(rt.block_on(task).unwrap().unwrap(), 42);
        assert_eq!(dispatch_loop.run_pending(), 0);
    }
}

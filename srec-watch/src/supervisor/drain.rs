//! Background queue for deferred work that must outlive the scheduler.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use futures::future::LocalBoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::{Error, Result};

type Job = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send>;

struct QueuedJob {
    name: String,
    job: Job,
}

/// A dedicated OS thread with its own single-threaded runtime.
///
/// Jobs run one at a time in submission order. The thread is independent
/// of the main runtime, so queued jobs keep running while the scheduler
/// shuts down; [`drain`](Self::drain) waits for them with a bound.
pub struct DrainWorker {
    tx: Mutex<Option<std_mpsc::Sender<QueuedJob>>>,
    done_rx: Mutex<Option<oneshot::Receiver<()>>>,
    pending: Arc<AtomicUsize>,
}

impl DrainWorker {
    pub fn start() -> Result<Self> {
        let (tx, rx) = std_mpsc::channel::<QueuedJob>();
        let (done_tx, done_rx) = oneshot::channel();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();

        std::thread::Builder::new()
            .name("drain-worker".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(runtime) => {
                        while let Ok(queued) = rx.recv() {
                            debug!(job = %queued.name, "Running deferred job");
                            runtime.block_on((queued.job)());
                            worker_pending.fetch_sub(1, Ordering::SeqCst);
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to build drain worker runtime"),
                }
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            done_rx: Mutex::new(Some(done_rx)),
            pending,
        })
    }

    /// Queue a job. The closure runs on the worker thread.
    pub fn submit<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + 'static,
    {
        let name = name.into();
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(Error::Other(format!("drain worker closed, dropping job {name}")));
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        let job: Job = Box::new(move || -> LocalBoxFuture<'static, ()> { Box::pin(f()) });
        tx.send(QueuedJob { name, job }).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            Error::Other(format!("drain worker stopped, dropping job {}", e.0.name))
        })
    }

    /// Jobs queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs and wait up to `timeout` for the queue to empty.
    ///
    /// Returns `true` if every job finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tx.lock().take();
        let Some(done_rx) = self.done_rx.lock().take() else {
            return true;
        };

        let pending = self.pending();
        if pending > 0 {
            info!(pending, ?timeout, "Waiting for deferred jobs");
        }

        match tokio::time::timeout(timeout, done_rx).await {
            Ok(_) => true,
            Err(_) => {
                warn!(pending = self.pending(), "Deferred jobs still running at shutdown");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let worker = DrainWorker::start().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..3 {
            let log = log.clone();
            worker
                .submit(format!("job-{i}"), move || async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    log.lock().push(i);
                })
                .unwrap();
        }

        assert!(worker.drain(Duration::from_secs(5)).await);
        assert_eq!(*log.lock(), vec![0, 1, 2]);
        assert_eq!(worker.pending(), 0);
    }

    #[tokio::test]
    async fn test_submit_after_drain_fails() {
        let worker = DrainWorker::start().unwrap();
        assert!(worker.drain(Duration::from_secs(1)).await);
        assert!(worker.submit("late", || async {}).is_err());
        assert!(worker.drain(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_drain_times_out_on_slow_job() {
        let worker = DrainWorker::start().unwrap();
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        worker
            .submit("slow", move || async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();

        assert!(!worker.drain(Duration::from_millis(50)).await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(finished.load(Ordering::SeqCst));
    }
}

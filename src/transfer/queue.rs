//! Fixed-size pool of transfer workers.
//!
//! Jobs are taken from a single FIFO channel, so they start in submission
//! order and at most `concurrency` run at once.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

pub struct TransferQueue {
    jobs: mpsc::UnboundedSender<Job>,
    workers: Vec<JoinHandle<()>>,
}

impl TransferQueue {
    pub fn new(concurrency: usize) -> Self {
        let (jobs, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..concurrency.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        // Run on its own task so a panicking job cannot take
                        // the worker down with it.
                        if let Err(e) = tokio::spawn(job).await {
                            warn!(worker, error = %e, "transfer job panicked");
                        }
                    }
                    debug!(worker, "transfer worker stopped");
                })
            })
            .collect();

        Self { jobs, workers }
    }

    /// Enqueue `job`. The returned receiver yields its output once it ran.
    pub fn submit<F, T>(&self, job: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(job.await);
        });
        // A closed queue drops the job, which the caller sees as a closed
        // receiver.
        let _ = self.jobs.send(job);
        rx
    }

    /// Enqueue a fallible job and wait for its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(job)
            .await
            .map_err(|_| SyncError::Io(io::Error::other("transfer queue stopped")))?
    }
}

impl Drop for TransferQueue {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

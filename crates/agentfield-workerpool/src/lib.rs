//! Bounded worker pool (spec.md §4.2): a process-wide singleton sized from
//! configuration (defaults: 32 workers, 1024-slot queue). `submit` is
//! non-blocking — it reports saturation rather than waiting for a slot,
//! the same shape as the teacher's `worker_loop.rs` fair-scheduling loop
//! generalized from a DB poll to an in-process channel.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A unit of work the pool executes. Implementations are expected to
/// report their own outcome (e.g. into storage); the pool itself ignores
/// the return value once the job completes (spec.md §4.2: "status is
/// already in storage").
#[async_trait]
pub trait Job: Send + 'static {
    async fn run(self: Box<Self>);
}

pub struct WorkerPoolConfig {
    pub worker_count: usize,
    pub queue_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 32,
            queue_capacity: 1024,
        }
    }
}

/// Fixed set of long-lived workers pulling from a single bounded channel.
pub struct WorkerPool {
    sender: mpsc::Sender<Box<dyn Job>>,
    cancellation: CancellationToken,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn start(config: WorkerPoolConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<Box<dyn Job>>(config.queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let cancellation = CancellationToken::new();

        let workers = (0..config.worker_count)
            .map(|worker_index| {
                let receiver = receiver.clone();
                let cancellation = cancellation.clone();
                tokio::spawn(async move {
                    run_worker(worker_index, receiver, cancellation).await;
                })
            })
            .collect();

        info!(worker_count = config.worker_count, queue_capacity = config.queue_capacity, "worker pool started");

        Self {
            sender,
            cancellation,
            workers,
        }
    }

    /// Non-blocking: returns `true` if the job was enqueued, `false` if
    /// the queue is full. No job is dequeued to signal saturation —
    /// callers observe it directly from this return value (spec.md §4.2).
    pub fn submit(&self, job: Box<dyn Job>) -> bool {
        match self.sender.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("worker pool queue full, rejecting job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("worker pool channel closed, rejecting job");
                false
            }
        }
    }

    /// Cancels the shared token; each worker finishes its in-flight job
    /// (if any) then exits its loop. Waits for all workers to drain.
    pub async fn shutdown(mut self) {
        self.cancellation.cancel();
        drop(self.sender);
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
    }
}

async fn run_worker(
    worker_index: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Box<dyn Job>>>>,
    cancellation: CancellationToken,
) {
    loop {
        let job = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => None,
                job = receiver.recv() => job,
            }
        };

        match job {
            Some(job) => job.run().await,
            None => {
                info!(worker_index, "worker pool worker draining");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingJob {
        counter: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for CountingJob {
        async fn run(self: Box<Self>) {
            self.counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn submits_and_runs_jobs() {
        let pool = WorkerPool::start(WorkerPoolConfig {
            worker_count: 2,
            queue_capacity: 8,
        });
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let accepted = pool.submit(Box::new(CountingJob {
                counter: counter.clone(),
            }));
            assert!(accepted);
        }

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submit_reports_saturation() {
        let pool = WorkerPool::start(WorkerPoolConfig {
            worker_count: 0,
            queue_capacity: 1,
        });
        let counter = Arc::new(AtomicUsize::new(0));

        let first = pool.submit(Box::new(CountingJob {
            counter: counter.clone(),
        }));
        assert!(first);
        let second = pool.submit(Box::new(CountingJob { counter }));
        assert!(!second);
        pool.shutdown().await;
    }
}

//! Single-lane execution queue.
//!
//! Each cache instance owns one `Lane`. Jobs run one at a time, in submission
//! order, on a dedicated worker task, so a cache's collections are only ever
//! touched by one job at a time. Different lanes run concurrently.

use cirrus_core::SyncError;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Pending result of a submitted job.
#[derive(Debug)]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> JobHandle<T> {
    /// Wait for the job to finish. Fails only if the lane shut down before
    /// the job ran.
    pub async fn join(self) -> Result<T, SyncError> {
        self.rx.await.map_err(|_| SyncError::LaneClosed)
    }
}

/// Serial job queue backed by one worker task.
///
/// Must be created inside a tokio runtime. The worker stops once every clone
/// of the lane has been dropped and the queue is empty.
#[derive(Debug, Clone)]
pub struct Lane {
    name: &'static str,
    queue: mpsc::UnboundedSender<Job>,
    outstanding: Arc<watch::Sender<usize>>,
}

impl Lane {
    pub fn new(name: &'static str) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let (outstanding, _) = watch::channel(0usize);
        let outstanding = Arc::new(outstanding);
        tokio::spawn(work(name, rx, outstanding.clone()));
        Self {
            name,
            queue,
            outstanding,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue `job`. Never blocks, so jobs may submit follow-up work to
    /// their own lane. A job must not wait on a handle from its own lane.
    pub fn submit<F, T>(&self, job: F) -> JobHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.outstanding.send_modify(|n| *n += 1);
        let task: Job = Box::pin(async move {
            let _ = tx.send(job.await);
        });
        if self.queue.send(task).is_err() {
            debug!(lane = self.name, "Lane worker gone; dropping job");
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }
        JobHandle { rx }
    }

    /// Submit `job` and wait for its result.
    pub async fn run<F, T>(&self, job: F) -> Result<T, SyncError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(job).join().await
    }

    /// Jobs submitted but not finished, including the running one.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Resolve once the queue is empty and nothing is running.
    pub async fn wait_idle(&self) {
        self.idle_barrier().await;
    }

    /// An owned future that resolves when the lane next goes idle; handed to
    /// `EventHub::post_when_idle`.
    pub fn idle_barrier(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.outstanding.subscribe();
        async move {
            let _ = rx.wait_for(|n| *n == 0).await;
        }
    }
}

async fn work(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<Job>,
    outstanding: Arc<watch::Sender<usize>>,
) {
    while let Some(job) = rx.recv().await {
        job.await;
        outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
    debug!(lane = name, "Lane worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let lane = Lane::new("test");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let seen = seen.clone();
            handles.push(lane.submit(async move {
                tokio::task::yield_now().await;
                seen.lock().expect("lock should succeed").push(i);
            }));
        }
        for handle in handles {
            handle.join().await.expect("job should run");
        }
        assert_eq!(*seen.lock().expect("lock should succeed"), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_idle_barrier_waits_for_running_job() {
        let lane = Lane::new("test");
        let (release, gate) = oneshot::channel::<()>();
        let handle = lane.submit(async move {
            let _ = gate.await;
            7
        });
        assert_eq!(lane.outstanding(), 1);

        let barrier = tokio::spawn(lane.idle_barrier());
        tokio::task::yield_now().await;
        assert!(!barrier.is_finished());

        release.send(()).expect("job should be waiting");
        assert_eq!(handle.join().await.expect("job should run"), 7);
        barrier.await.expect("barrier should resolve");
        assert!(lane.is_idle());
    }

    #[tokio::test]
    async fn test_run_returns_result() {
        let lane = Lane::new("test");
        let value = lane.run(async { 40 + 2 }).await.expect("job should run");
        assert_eq!(value, 42);
        lane.wait_idle().await;
        assert_eq!(lane.outstanding(), 0);
    }
}

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Exclusive hold on a room's mutation queue. The next task starts only
/// once this is released or dropped, so every exit path of a task,
/// including an unwinding panic, frees the queue.
#[derive(Debug)]
pub struct QueueLock {
    release: Option<oneshot::Sender<()>>,
}

impl QueueLock {
    /// Let the next task start. Equivalent to dropping the lock.
    pub fn release(mut self) {
        self.signal();
    }

    fn signal(&mut self) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        self.signal();
    }
}

type Task = Box<dyn FnOnce(QueueLock) -> BoxFuture<'static, ()> + Send>;

struct Job {
    epoch: u64,
    task: Task,
}

/// Per-room FIFO that serializes playlist mutations. Each task holds the
/// queue across its await points until its [`QueueLock`] goes away.
pub struct MutationQueue {
    tx: mpsc::UnboundedSender<Job>,
    epoch: Arc<AtomicU64>,
    worker: JoinHandle<()>,
}

impl MutationQueue {
    /// Start the queue worker. Must be called inside a tokio runtime.
    pub fn new(room: &str) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let worker = tokio::spawn(run_worker(room.to_string(), rx, epoch.clone()));
        Self { tx, epoch, worker }
    }

    /// Submit a task. Tasks start strictly in submission order.
    pub fn queue<F, Fut>(&self, task: F)
    where
        F: FnOnce(QueueLock) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let job = Job {
            epoch: self.epoch.load(Ordering::SeqCst),
            task: Box::new(move |lock| Box::pin(task(lock)) as BoxFuture<'static, ()>),
        };
        if self.tx.send(job).is_err() {
            debug!("mutation queue closed, task dropped");
        }
    }

    /// Discard every task that has been queued but not started yet.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Stop the worker. Pending tasks never run.
    pub fn close(&self) {
        self.reset();
        self.worker.abort();
    }
}

impl Drop for MutationQueue {
    fn drop(&mut self) {
        self.worker.abort();
    }
}

async fn run_worker(room: String, mut rx: mpsc::UnboundedReceiver<Job>, epoch: Arc<AtomicU64>) {
    while let Some(job) = rx.recv().await {
        if job.epoch < epoch.load(Ordering::SeqCst) {
            debug!(%room, "skipping task queued before reset");
            continue;
        }

        let (tx, released) = oneshot::channel();
        let lock = QueueLock { release: Some(tx) };
        let handle = tokio::spawn((job.task)(lock));

        // Either an explicit release or the lock being dropped wakes us.
        let _ = released.await;

        if handle.is_finished()
            && let Err(e) = handle.await
            && e.is_panic()
        {
            warn!(%room, "mutation task panicked");
        }
    }
}

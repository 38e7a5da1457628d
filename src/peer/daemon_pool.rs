use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, trace};

use crate::config::DaemonPoolConfig;
use crate::error::ExtendError;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A dynamically sized pool of worker tasks that process received messages off the service
///  task.
///
/// The pool starts with `min_workers` workers and adds a worker whenever a task is queued while
///  no worker is idle, up to `max_workers`. Surplus workers retire after being idle for
///  `idle_timeout`.
///
/// [DaemonPool::stop] aborts all workers, including those in the middle of executing a task. This
///  is the last resort for unblocking a connection that cannot be closed because a worker is
///  stuck inside it.
#[derive(Clone)]
pub struct DaemonPool {
    inner: Arc<DaemonPoolInner>,
}

struct DaemonPoolInner {
    name: String,
    config: DaemonPoolConfig,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    queue: tokio::sync::Mutex<mpsc::UnboundedReceiver<Task>>,
    workers: Mutex<JoinSet<()>>,
    worker_count: AtomicUsize,
    idle_count: AtomicUsize,
    tasks_executed: AtomicU64,
    running: AtomicBool,
}

impl DaemonPool {
    pub fn new(name: impl Into<String>, config: DaemonPoolConfig) -> DaemonPool {
        let (sender, receiver) = mpsc::unbounded_channel();
        DaemonPool {
            inner: Arc::new(DaemonPoolInner {
                name: name.into(),
                config,
                sender: Mutex::new(Some(sender)),
                queue: tokio::sync::Mutex::new(receiver),
                workers: Mutex::new(JoinSet::new()),
                worker_count: AtomicUsize::new(0),
                idle_count: AtomicUsize::new(0),
                tasks_executed: AtomicU64::new(0),
                running: AtomicBool::new(false),
            })
        }
    }

    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("starting daemon pool {} with {} workers", self.inner.name, self.inner.config.min_workers);
        for _ in 0..self.inner.config.min_workers {
            self.try_spawn_worker();
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn add<F: Future<Output = ()> + Send + 'static>(&self, task: F) -> Result<(), ExtendError> {
        if !self.is_running() {
            return Err(ExtendError::ServiceNotRunning { service: self.inner.name.clone() });
        }

        {
            let sender = self.inner.sender.lock()
                .unwrap_or_else(|e| e.into_inner());
            match sender.as_ref() {
                Some(sender) => sender.send(Box::pin(task))
                    .map_err(|_| ExtendError::ServiceNotRunning { service: self.inner.name.clone() })?,
                None => return Err(ExtendError::ServiceNotRunning { service: self.inner.name.clone() }),
            }
        }

        if self.inner.idle_count.load(Ordering::Acquire) == 0 {
            self.try_spawn_worker();
        }
        Ok(())
    }

    /// Aborts all workers and rejects further tasks. Tasks that are still queued are dropped
    ///  without being executed.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        debug!("stopping daemon pool {}", self.inner.name);

        self.inner.sender.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.inner.workers.lock()
            .unwrap_or_else(|e| e.into_inner())
            .abort_all();
        self.inner.worker_count.store(0, Ordering::Release);
        self.inner.idle_count.store(0, Ordering::Release);

        // aborted workers release the queue when they are dropped
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut queue = inner.queue.lock().await;
            queue.close();
            while queue.try_recv().is_ok() {}
        });
    }

    pub fn worker_count(&self) -> usize {
        self.inner.worker_count.load(Ordering::Acquire)
    }

    pub fn tasks_executed(&self) -> u64 {
        self.inner.tasks_executed.load(Ordering::Acquire)
    }

    pub fn format_stats(&self) -> String {
        format!("Daemons={}, TasksExecuted={}", self.worker_count(), self.tasks_executed())
    }

    fn try_spawn_worker(&self) {
        let max = self.inner.config.max_workers.unwrap_or(usize::MAX);
        let reserved = self.inner.worker_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            if n < max { Some(n + 1) } else { None }
        });
        if reserved.is_err() {
            trace!("daemon pool {} is at its maximum size of {}", self.inner.name, max);
            return;
        }

        let mut workers = self.inner.workers.lock()
            .unwrap_or_else(|e| e.into_inner());
        while workers.try_join_next().is_some() {}
        workers.spawn(run_worker(self.inner.clone()));
    }
}

async fn run_worker(inner: Arc<DaemonPoolInner>) {
    loop {
        let next = {
            let mut queue = inner.queue.lock().await;
            inner.idle_count.fetch_add(1, Ordering::AcqRel);
            let next = time::timeout(inner.config.idle_timeout, queue.recv()).await;
            inner.idle_count.fetch_sub(1, Ordering::AcqRel);
            next
        };

        match next {
            Ok(Some(task)) => {
                task.await;
                inner.tasks_executed.fetch_add(1, Ordering::AcqRel);
            }
            Ok(None) => break,
            Err(_) => {
                let min = inner.config.min_workers;
                let retired = inner.worker_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                    if n > min { Some(n - 1) } else { None }
                });
                if retired.is_ok() {
                    trace!("retiring idle worker in daemon pool {}", inner.name);
                    return;
                }
            }
        }
    }
    let _ = inner.worker_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::{oneshot, Semaphore};

    fn pool(min: usize, max: Option<usize>) -> DaemonPool {
        DaemonPool::new("test", DaemonPoolConfig {
            min_workers: min,
            max_workers: max,
            idle_timeout: Duration::from_secs(10),
        })
    }

    #[tokio::test]
    async fn test_executes_tasks() {
        let pool = pool(1, None);
        pool.start();
        assert_eq!(pool.worker_count(), 1);

        let (tx, rx) = oneshot::channel();
        pool.add(async move { tx.send(42).unwrap(); }).unwrap();
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_add_before_start_fails() {
        let pool = pool(1, None);
        assert!(pool.add(async {}).is_err());
    }

    #[tokio::test]
    async fn test_grows_while_workers_are_busy() {
        let pool = pool(1, None);
        pool.start();

        let blocker = Arc::new(Semaphore::new(0));
        for _ in 0..3 {
            let blocker = blocker.clone();
            pool.add(async move { let _ = blocker.acquire().await; }).unwrap();
        }
        let (tx, rx) = oneshot::channel();
        pool.add(async move { tx.send(()).unwrap(); }).unwrap();

        rx.await.unwrap();
        assert!(pool.worker_count() > 1);
        blocker.add_permits(3);
    }

    #[tokio::test]
    async fn test_respects_max_workers() {
        let pool = pool(1, Some(2));
        pool.start();

        let blocker = Arc::new(Semaphore::new(0));
        for _ in 0..5 {
            let blocker = blocker.clone();
            pool.add(async move { let _ = blocker.acquire().await; }).unwrap();
        }
        tokio::task::yield_now().await;
        assert!(pool.worker_count() <= 2);
    }

    #[tokio::test]
    async fn test_stop_aborts_running_tasks() {
        let pool = pool(1, None);
        pool.start();

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (dropped_tx, dropped_rx) = oneshot::channel::<()>();
        pool.add(async move {
            let _dropped = dropped_tx;
            started_tx.send(()).unwrap();
            std::future::pending::<()>().await;
        }).unwrap();

        started_rx.await.unwrap();
        pool.stop();

        // the task is aborted, dropping its state and closing the channel
        assert!(dropped_rx.await.is_err());
        assert!(!pool.is_running());
        assert!(pool.add(async {}).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_workers_retire() {
        let pool = pool(1, None);
        pool.start();

        let blocker = Arc::new(Semaphore::new(0));
        for _ in 0..3 {
            let blocker = blocker.clone();
            pool.add(async move { let _ = blocker.acquire().await; }).unwrap();
        }
        assert!(pool.worker_count() > 1);

        blocker.add_permits(3);
        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.tasks_executed(), 3);
    }
}

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::error;

pub const DEFAULT_POOL_SIZE: usize = 10;

pub type Runnable = Box<dyn FnOnce() + Send + 'static>;

/// Where the queue runs job bodies. `submit` must not block the caller.
pub trait WorkerPool: Send + Sync {
    fn submit(&self, task: Runnable);

    /// Maximum number of tasks running at once.
    fn capacity(&self) -> usize;
}

/// Runs tasks on tokio's blocking threads, at most `capacity` at a time.
pub struct BlockingPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl BlockingPool {
    pub fn new(handle: Handle, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Pool bound to the runtime of the calling task.
    pub fn current(capacity: usize) -> Self {
        Self::new(Handle::current(), capacity)
    }
}

impl WorkerPool for BlockingPool {
    fn submit(&self, task: Runnable) {
        let permits = Arc::clone(&self.permits);
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = tokio::task::spawn_blocking(task).await {
                error!("Pipeline worker panicked: {}", e);
            }
        });
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Runs every task on the submitting thread before `submit` returns.
#[derive(Debug, Default)]
pub struct InlinePool;

impl WorkerPool for InlinePool {
    fn submit(&self, task: Runnable) {
        task();
    }

    fn capacity(&self) -> usize {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_inline_pool_runs_before_returning() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        InlinePool.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_pool_respects_capacity() {
        let pool = BlockingPool::current(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = running.clone();
            let peak = peak.clone();
            let finished = finished.clone();
            pool.submit(Box::new(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(20));
                running.fetch_sub(1, Ordering::SeqCst);
                finished.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for _ in 0..200 {
            if finished.load(Ordering::SeqCst) == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(finished.load(Ordering::SeqCst), 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}

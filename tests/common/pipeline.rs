//! A pipeline service over a status database in a temporary directory.

use pipeline_server::pipeline::{BlockingPool, PipelineService, Runnable, TaskRegistry, WorkerPool};
use pipeline_server::status::{SqliteStatusStore, StatusRecord, StatusRef, StatusStore};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestPipeline {
    pub dir: TempDir,
    pub store: Arc<SqliteStatusStore>,
    pub service: PipelineService,
}

impl TestPipeline {
    /// Must be called from inside a tokio runtime.
    pub fn spawn(registry: TaskRegistry, pool_size: usize) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        Self::open(dir, registry, Arc::new(BlockingPool::current(pool_size)))
    }

    pub fn open(dir: TempDir, registry: TaskRegistry, pool: Arc<dyn WorkerPool>) -> Self {
        let store = Arc::new(
            SqliteStatusStore::new(dir.path().join("status.db")).expect("Failed to open store"),
        );
        let service = PipelineService::new(store.clone(), pool, registry);
        Self {
            dir,
            store,
            service,
        }
    }

    /// Simulates a process restart: the in-memory queue is dropped and a
    /// fresh service opens the same database.
    pub fn restart(self, registry: TaskRegistry, pool_size: usize) -> Self {
        let TestPipeline { dir, service, .. } = self;
        service.shutdown();
        drop(service);
        Self::open(dir, registry, Arc::new(BlockingPool::current(pool_size)))
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("status.db")
    }

    pub fn status(&self, guid: &str) -> StatusRecord {
        self.store
            .get(&StatusRef::Guid(guid.to_string()))
            .expect("Failed to read status")
            .unwrap_or_else(|| panic!("No status record for {}", guid))
    }

    pub async fn wait_idle(&self) {
        assert!(
            self.service.wait_idle(TEST_TIMEOUT).await,
            "Queue did not drain within {:?}",
            TEST_TIMEOUT
        );
    }
}

/// Polls `condition` until it holds, panicking after [`TEST_TIMEOUT`].
pub async fn wait_until(mut condition: impl FnMut() -> bool, what: &str) {
    let deadline = Instant::now() + TEST_TIMEOUT;
    while !condition() {
        if Instant::now() >= deadline {
            panic!("Timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Accepts work and never runs it, like a process that died before its
/// workers got to the queue.
#[derive(Default)]
pub struct ParkingPool {
    parked: Mutex<Vec<Runnable>>,
}

impl ParkingPool {
    pub fn parked(&self) -> usize {
        self.parked.lock().unwrap().len()
    }
}

impl WorkerPool for ParkingPool {
    fn submit(&self, task: Runnable) {
        self.parked.lock().unwrap().push(task);
    }

    fn capacity(&self) -> usize {
        1
    }
}

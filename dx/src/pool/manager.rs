//! WorkerPool - autoscaling set of workers over the shared run queue

use std::future::Future;
use std::sync::Arc;
use taskstore::LeaseStore;
use tracing::{debug, info, warn};

use super::PoolConfig;
use super::driver::RunDriver;
use super::worker::{StopMode, Worker, blocking};

/// What one monitor tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up,
    Down,
    Hold,
}

/// Keeps between `min_workers` and `max_workers` workers, sized to the queue
pub struct WorkerPool {
    config: PoolConfig,
    store: LeaseStore,
    driver: Arc<dyn RunDriver>,
    workers: Vec<Worker>,
    /// Workers asked to drain, still finishing their run
    retiring: Vec<Worker>,
    pool_id: String,
    next_worker: u64,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, store: LeaseStore, driver: Arc<dyn RunDriver>) -> eyre::Result<Self> {
        config.validate()?;
        let uuid = uuid::Uuid::now_v7().simple().to_string();
        let pool_id = uuid[uuid.len() - 8..].to_string();
        debug!(%pool_id, ?config, "WorkerPool::new: called");
        Ok(Self {
            config,
            store,
            driver,
            workers: Vec::new(),
            retiring: Vec::new(),
            pool_id,
            next_worker: 0,
        })
    }

    /// Active workers, not counting ones draining after a scale-down
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn spawn_worker(&mut self) {
        self.next_worker += 1;
        let id = format!("{}-w{}", self.pool_id, self.next_worker);
        let worker = Worker::spawn(id, self.config.clone(), self.store.clone(), self.driver.clone());
        self.workers.push(worker);
    }

    /// Start the minimum number of workers
    pub fn start(&mut self) {
        info!(min = self.config.min_workers, max = self.config.max_workers, "Starting worker pool");
        while self.workers.len() < self.config.min_workers {
            self.spawn_worker();
        }
    }

    async fn reap(&mut self) {
        let (done, alive): (Vec<Worker>, Vec<Worker>) = self.workers.drain(..).partition(Worker::is_finished);
        self.workers = alive;
        for worker in done {
            warn!(worker_id = %worker.id(), "Worker exited unexpectedly");
            worker.join().await;
        }

        let (done, still): (Vec<Worker>, Vec<Worker>) = self.retiring.drain(..).partition(Worker::is_finished);
        self.retiring = still;
        for worker in done {
            worker.join().await;
        }
    }

    /// One monitor step: reap, refill to the minimum, then scale by one
    pub async fn tick(&mut self) -> eyre::Result<ScaleDecision> {
        let depth = blocking(&self.store, |s| s.queue_depth()).await?;
        self.reap().await;
        while self.workers.len() < self.config.min_workers {
            self.spawn_worker();
        }
        let count = self.workers.len();
        debug!(depth, workers = count, "WorkerPool::tick: called");

        if depth > self.config.scale_up_threshold && count < self.config.max_workers {
            self.spawn_worker();
            info!(depth, workers = self.workers.len(), "Scaled up");
            return Ok(ScaleDecision::Up);
        }

        if depth == 0 && count > self.config.min_workers {
            let cooldown = self.config.idle_cooldown();
            let idle = self
                .workers
                .iter()
                .position(|w| w.idle_for().is_some_and(|d| d >= cooldown));
            if let Some(idx) = idle {
                let worker = self.workers.remove(idx);
                worker.signal_stop(StopMode::Drain);
                info!(worker_id = %worker.id(), workers = self.workers.len(), "Scaled down");
                self.retiring.push(worker);
                return Ok(ScaleDecision::Down);
            }
        }
        Ok(ScaleDecision::Hold)
    }

    /// Run the monitor until `shutdown` resolves, then drain every worker
    pub async fn run<F: Future<Output = ()>>(&mut self, shutdown: F) -> eyre::Result<()> {
        self.start();
        let mut monitor = tokio::time::interval(self.config.monitor_interval());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = monitor.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Pool monitor tick failed");
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }
        self.stop(true).await;
        Ok(())
    }

    /// Stop every worker; see `Worker::stop` for `drain`
    pub async fn stop(&mut self, drain: bool) {
        info!(workers = self.workers.len(), retiring = self.retiring.len(), drain, "Stopping worker pool");
        let mode = if drain { StopMode::Drain } else { StopMode::Abort };
        let workers: Vec<Worker> = self.workers.drain(..).chain(self.retiring.drain(..)).collect();
        for worker in &workers {
            worker.signal_stop(mode);
        }
        futures::future::join_all(workers.into_iter().map(Worker::join)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::super::driver::mock::MockDriver;
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use taskstore::RunStatus;
    use tempfile::tempdir;

    fn config(min: usize, max: usize, threshold: usize) -> PoolConfig {
        PoolConfig {
            min_workers: min,
            max_workers: max,
            scale_up_threshold: threshold,
            idle_cooldown_ms: 0,
            lease_ttl_ms: 5_000,
            heartbeat_interval_ms: 100,
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scales_up_when_queue_exceeds_threshold() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        for i in 0..6 {
            store.enqueue(&format!("r{}", i), &json!({})).unwrap();
        }

        let mut pool = WorkerPool::new(config(1, 3, 5), store, Arc::new(MockDriver::hanging())).unwrap();
        assert_eq!(pool.tick().await.unwrap(), ScaleDecision::Up);
        assert!(pool.worker_count() >= 2);
        assert!(pool.worker_count() <= 3);
        pool.stop(false).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_never_exceeds_max_workers() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        for i in 0..20 {
            store.enqueue(&format!("r{}", i), &json!({})).unwrap();
        }

        let mut pool = WorkerPool::new(config(1, 2, 1), store, Arc::new(MockDriver::hanging())).unwrap();
        pool.start();
        for _ in 0..4 {
            pool.tick().await.unwrap();
        }
        assert_eq!(pool.worker_count(), 2);
        pool.stop(false).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scales_down_idle_workers_to_minimum() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        store.enqueue("r1", &json!({})).unwrap();
        let mut pool = WorkerPool::new(config(1, 3, 0), store.clone(), Arc::new(MockDriver::failing())).unwrap();
        assert_eq!(pool.tick().await.unwrap(), ScaleDecision::Up);
        assert_eq!(pool.worker_count(), 2);

        for _ in 0..200 {
            if store.queue_depth().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.tick().await.unwrap(), ScaleDecision::Down);
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.tick().await.unwrap(), ScaleDecision::Hold);
        pool.stop(true).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_stop_requeues_in_flight_runs() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        store.enqueue("r1", &json!({})).unwrap();

        let mut pool = WorkerPool::new(config(1, 1, 5), store.clone(), Arc::new(MockDriver::hanging())).unwrap();
        pool.start();
        for _ in 0..200 {
            if store.get_run("r1").unwrap().unwrap().status == RunStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pool.stop(false).await;
        assert_eq!(store.get_run("r1").unwrap().unwrap().status, RunStatus::Queued);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_drains_on_shutdown() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        store.enqueue("r1", &json!({})).unwrap();

        let driver = Arc::new(MockDriver::completing(Duration::from_millis(50)));
        let mut pool = WorkerPool::new(config(1, 2, 5), store.clone(), driver).unwrap();
        pool.run(tokio::time::sleep(Duration::from_millis(30))).await.unwrap();
        assert_eq!(store.get_run("r1").unwrap().unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn test_rejects_invalid_config() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        assert!(WorkerPool::new(config(4, 2, 5), store, Arc::new(MockDriver::failing())).is_err());
    }
}

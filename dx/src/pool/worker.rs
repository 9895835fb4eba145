//! A single pool worker
//!
//! Claims one run at a time from the shared queue. While a run is held, two
//! activities run side by side: the driver future and a lease heartbeat. The
//! worker gives a run up when it finishes, when the lease is lost, or when
//! it is stopped without draining.

use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use taskstore::{Lease, LeaseStore, RunRecord, RunStatus, StoreResult, now_ms};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::PoolConfig;
use super::driver::{RunDriver, RunOutcome};

/// How a stop request treats the run in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Finish the current run, then exit
    Drain,
    /// Drop the current run and put it back in the queue
    Abort,
}

/// Run a lease-store call off the async runtime
pub(crate) async fn blocking<T, F>(store: &LeaseStore, f: F) -> eyre::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&LeaseStore) -> StoreResult<T> + Send + 'static,
{
    let store = store.clone();
    let result = tokio::task::spawn_blocking(move || f(&store)).await?;
    Ok(result?)
}

/// Poll delay with up to 50% random jitter
fn jittered(base: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let jitter = rand::rng().random_range(0..=base_ms / 2);
    Duration::from_millis(base_ms + jitter)
}

/// Activity shared between a worker task and its handle
#[derive(Debug, Default)]
struct Activity {
    /// Epoch ms when the worker last became idle; 0 while busy
    idle_since: AtomicI64,
    runs_finished: AtomicU64,
}

impl Activity {
    fn set_busy(&self) {
        self.idle_since.store(0, Ordering::SeqCst);
    }

    fn set_idle(&self) {
        self.idle_since.store(now_ms(), Ordering::SeqCst);
    }
}

/// Handle to a running worker task
pub struct Worker {
    id: String,
    stop_tx: watch::Sender<Option<StopMode>>,
    activity: Arc<Activity>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn a worker polling `store` and driving runs with `driver`
    pub fn spawn(id: impl Into<String>, config: PoolConfig, store: LeaseStore, driver: Arc<dyn RunDriver>) -> Self {
        let id = id.into();
        debug!(worker_id = %id, "Worker::spawn: called");
        let (stop_tx, stop_rx) = watch::channel(None);
        let activity = Arc::new(Activity::default());
        activity.set_idle();

        let task = WorkerTask {
            id: id.clone(),
            config,
            store,
            driver,
            activity: activity.clone(),
            stop_rx,
        };
        let handle = tokio::spawn(task.run());
        info!(worker_id = %id, "Worker started");
        Self {
            id,
            stop_tx,
            activity,
            handle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_busy(&self) -> bool {
        self.activity.idle_since.load(Ordering::SeqCst) == 0
    }

    /// How long the worker has been idle, None while it holds a run
    pub fn idle_for(&self) -> Option<Duration> {
        let since = self.activity.idle_since.load(Ordering::SeqCst);
        (since != 0).then(|| Duration::from_millis(now_ms().saturating_sub(since).max(0) as u64))
    }

    pub fn runs_finished(&self) -> u64 {
        self.activity.runs_finished.load(Ordering::SeqCst)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Ask the worker to stop without waiting for it
    pub fn signal_stop(&self, mode: StopMode) {
        debug!(worker_id = %self.id, ?mode, "Worker::signal_stop: called");
        self.stop_tx.send_replace(Some(mode));
    }

    /// Stop the worker and wait for it to exit
    ///
    /// With `drain` the run in flight finishes first; without it the run is
    /// dropped and its lease released so another worker can claim it.
    pub async fn stop(self, drain: bool) {
        self.signal_stop(if drain { StopMode::Drain } else { StopMode::Abort });
        self.join().await;
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(worker_id = %self.id, error = %e, "Worker task panicked");
        }
        info!(worker_id = %self.id, "Worker stopped");
    }
}

struct WorkerTask {
    id: String,
    config: PoolConfig,
    store: LeaseStore,
    driver: Arc<dyn RunDriver>,
    activity: Arc<Activity>,
    stop_rx: watch::Receiver<Option<StopMode>>,
}

impl WorkerTask {
    fn stop_mode(&self) -> Option<StopMode> {
        *self.stop_rx.borrow()
    }

    async fn run(mut self) {
        loop {
            if self.stop_mode().is_some() {
                break;
            }

            let worker_id = self.id.clone();
            let ttl = self.config.lease_ttl();
            let claimed = blocking(&self.store, move |s| s.claim_next(&worker_id, ttl)).await;

            match claimed {
                Ok(Some((run, lease))) => {
                    self.activity.set_busy();
                    self.hold(run, lease).await;
                    self.activity.runs_finished.fetch_add(1, Ordering::SeqCst);
                    self.activity.set_idle();
                }
                Ok(None) => self.idle().await,
                Err(e) => {
                    warn!(worker_id = %self.id, error = %e, "Failed to poll run queue");
                    self.idle().await;
                }
            }
        }
        debug!(worker_id = %self.id, "WorkerTask::run: exiting");
    }

    async fn idle(&mut self) {
        let delay = jittered(self.config.poll_interval());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = self.stop_rx.changed() => {
                // handle dropped without a stop; keep the normal poll pace
                if changed.is_err() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Drive one claimed run while heartbeating its lease
    async fn hold(&mut self, run: RunRecord, lease: Lease) {
        info!(worker_id = %self.id, run_id = %run.run_id, token = lease.token, attempt = run.attempts, "Driving run");
        let driver = self.driver.clone();
        let drive = driver.drive(&run);
        tokio::pin!(drive);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval());
        heartbeat.tick().await;
        let mut draining = self.stop_mode() == Some(StopMode::Drain);

        let result = loop {
            tokio::select! {
                result = &mut drive => break result,
                _ = heartbeat.tick() => {
                    let held = lease.clone();
                    let ttl = self.config.lease_ttl();
                    match blocking(&self.store, move |s| s.heartbeat_lease(&held, ttl)).await {
                        Ok(true) => debug!(worker_id = %self.id, run_id = %run.run_id, "Lease renewed"),
                        Ok(false) => {
                            warn!(worker_id = %self.id, run_id = %run.run_id, "Lease lost, abandoning run");
                            return;
                        }
                        Err(e) => warn!(worker_id = %self.id, run_id = %run.run_id, error = %e, "Lease heartbeat failed"),
                    }
                }
                changed = self.stop_rx.changed(), if !draining => {
                    match (changed, self.stop_mode()) {
                        (Ok(()), Some(StopMode::Drain)) => {
                            info!(worker_id = %self.id, run_id = %run.run_id, "Draining current run");
                            draining = true;
                        }
                        (Ok(()), Some(StopMode::Abort)) | (Err(_), _) => {
                            info!(worker_id = %self.id, run_id = %run.run_id, "Stopping mid-run, releasing lease");
                            self.release(lease).await;
                            return;
                        }
                        (Ok(()), None) => {}
                    }
                }
            }
        };

        let (status, error) = match result {
            Ok(RunOutcome::Completed) => (RunStatus::Completed, None),
            Ok(RunOutcome::Failed { reason }) => (RunStatus::Failed, Some(reason)),
            Err(e) => (RunStatus::Failed, Some(format!("{:#}", e))),
        };
        info!(worker_id = %self.id, run_id = %run.run_id, %status, error = ?error, "Run finished");

        match blocking(&self.store, move |s| s.finish_run(&lease, status, error.as_deref())).await {
            Ok(true) => {}
            Ok(false) => warn!(worker_id = %self.id, run_id = %run.run_id, "Lease lost before finishing, result dropped"),
            Err(e) => warn!(worker_id = %self.id, run_id = %run.run_id, error = %e, "Failed to record run result"),
        }
    }

    async fn release(&self, lease: Lease) {
        let run_id = lease.run_id.clone();
        match blocking(&self.store, move |s| s.release_lease(&lease)).await {
            Ok(true) => info!(worker_id = %self.id, %run_id, "Released lease"),
            Ok(false) => warn!(worker_id = %self.id, %run_id, "Lease already lost"),
            Err(e) => warn!(worker_id = %self.id, %run_id, error = %e, "Failed to release lease"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::driver::mock::MockDriver;
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn fast_config() -> PoolConfig {
        PoolConfig {
            lease_ttl_ms: 2_000,
            heartbeat_interval_ms: 50,
            poll_interval_ms: 10,
            ..Default::default()
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..300 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn status(store: &LeaseStore, run_id: &str) -> RunStatus {
        store.get_run(run_id).unwrap().unwrap().status
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        for _ in 0..50 {
            let d = jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(150));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_worker_completes_queued_runs() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        store.enqueue("r1", &json!({})).unwrap();
        store.enqueue("r2", &json!({})).unwrap();

        let driver = Arc::new(MockDriver::completing(Duration::from_millis(5)));
        let worker = Worker::spawn("w1", fast_config(), store.clone(), driver.clone());
        wait_for(|| worker.runs_finished() == 2).await;
        worker.stop(true).await;

        assert_eq!(status(&store, "r1"), RunStatus::Completed);
        assert_eq!(status(&store, "r2"), RunStatus::Completed);
        assert_eq!(driver.driven(), vec!["r1", "r2"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_and_erroring_runs_are_recorded() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        store.enqueue("r1", &json!({})).unwrap();

        let worker = Worker::spawn("w1", fast_config(), store.clone(), Arc::new(MockDriver::erroring()));
        wait_for(|| worker.runs_finished() == 1).await;
        worker.stop(true).await;

        let run = store.get_run("r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("driver exploded"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abort_releases_run_back_to_queue() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        store.enqueue("r1", &json!({})).unwrap();

        let worker = Worker::spawn("w1", fast_config(), store.clone(), Arc::new(MockDriver::hanging()));
        wait_for(|| worker.is_busy()).await;
        assert_eq!(status(&store, "r1"), RunStatus::Processing);

        tokio::time::timeout(Duration::from_secs(5), worker.stop(false)).await.unwrap();
        let run = store.get_run("r1").unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert!(run.lease_owner.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_keeps_lease_past_ttl() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        store.enqueue("r1", &json!({})).unwrap();

        let config = PoolConfig {
            lease_ttl_ms: 200,
            heartbeat_interval_ms: 20,
            poll_interval_ms: 10,
            ..Default::default()
        };
        let worker = Worker::spawn("w1", config, store.clone(), Arc::new(MockDriver::hanging()));
        wait_for(|| worker.is_busy()).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let run = store.get_run("r1").unwrap().unwrap();
        assert!(run.is_leased(now_ms()));
        assert!(store.acquire_lease("r1", "intruder", Duration::from_secs(1)).unwrap().is_none());
        worker.stop(false).await;
    }

    #[tokio::test]
    async fn test_idle_worker_stops_promptly() {
        let temp = tempdir().unwrap();
        let store = LeaseStore::open(temp.path().join("runs.db")).unwrap();
        let config = PoolConfig {
            poll_interval_ms: 60_000,
            ..Default::default()
        };
        let worker = Worker::spawn("w1", config, store, Arc::new(MockDriver::failing()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(worker.idle_for().is_some());
        tokio::time::timeout(Duration::from_secs(2), worker.stop(true)).await.unwrap();
    }
}

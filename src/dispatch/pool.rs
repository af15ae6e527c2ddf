//! Device-bound worker threads with per-worker queues and a fan-in join.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::reconstructor::{SliceReconstructor, WorkerIdentity};
use crate::scene::SceneSnapshot;
use crate::types::{SliceReply, SliceRequest, Volume};
use crate::{Result, StreamError};

/// How partial replies from all workers fold into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanIn {
    /// Element-wise sum of the non-empty partials, which must share a shape.
    /// Matches back-projection over projection sets partitioned by worker.
    #[default]
    Sum,
    /// The first non-empty partial in worker order.
    First,
}

impl FanIn {
    /// Fold worker results in worker order.
    pub fn combine(self, partials: Vec<Result<SliceReply>>) -> Result<SliceReply> {
        match self {
            FanIn::Sum => {
                let mut total: Option<SliceReply> = None;
                for partial in partials {
                    let partial = partial?;
                    if partial.is_empty() {
                        continue;
                    }
                    match total.as_mut() {
                        None => total = Some(partial),
                        Some(acc) if acc.shape == partial.shape && acc.data.len() == partial.data.len() => {
                            acc.data.iter_mut().zip(&partial.data).for_each(|(a, b)| *a += b);
                        }
                        Some(acc) => {
                            return Err(StreamError::reconstruction(format!(
                                "partial shapes disagree: {:?} vs {:?}",
                                acc.shape, partial.shape
                            )));
                        }
                    }
                }
                Ok(total.unwrap_or_default())
            }
            FanIn::First => {
                let mut first_error = None;
                for partial in partials {
                    match partial {
                        Ok(reply) if !reply.is_empty() => return Ok(reply),
                        Ok(_) => {}
                        Err(e) => {
                            first_error.get_or_insert(e);
                        }
                    }
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(SliceReply::empty()),
                }
            }
        }
    }

    /// Fold worker previews in worker order. Workers without a preview are skipped.
    pub fn combine_previews(self, partials: Vec<Result<Option<Volume>>>) -> Result<Option<Volume>> {
        let mut total: Option<Volume> = None;
        let mut first_error = None;
        for partial in partials {
            let volume = match partial {
                Ok(Some(volume)) => volume,
                Ok(None) => continue,
                Err(e) if self == FanIn::First => {
                    first_error.get_or_insert(e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match (self, total.as_mut()) {
                (_, None) => total = Some(volume),
                (FanIn::First, Some(_)) => break,
                (FanIn::Sum, Some(acc)) if acc.shape == volume.shape && acc.data.len() == volume.data.len() => {
                    acc.data.iter_mut().zip(&volume.data).for_each(|(a, b)| *a += b);
                }
                (FanIn::Sum, Some(acc)) => {
                    return Err(StreamError::reconstruction(format!(
                        "preview shapes disagree: {:?} vs {:?}",
                        acc.shape, volume.shape
                    )));
                }
            }
        }
        match (total, first_error) {
            (None, Some(e)) => Err(e),
            (total, _) => Ok(total),
        }
    }
}

/// Settings of a [`WorkerPool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub workers: usize,
    /// Capacity of each worker's private queue.
    pub queue_depth: usize,
    /// Upper bound on waiting for all workers of one request.
    pub join_timeout_ms: u64,
    pub fan_in: FanIn,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { workers: 4, queue_depth: 8, join_timeout_ms: 2_000, fan_in: FanIn::Sum }
    }
}

impl PoolConfig {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(StreamError::config("pooled dispatch needs at least one worker"));
        }
        if self.queue_depth == 0 {
            return Err(StreamError::config("worker queue depth must be positive"));
        }
        if self.join_timeout_ms == 0 {
            return Err(StreamError::config("join timeout must be positive"));
        }
        Ok(())
    }
}

enum Job {
    Slice { scene: SceneSnapshot, request: Arc<SliceRequest>, done: oneshot::Sender<Result<SliceReply>> },
    Preview { scene: SceneSnapshot, size: u32, done: oneshot::Sender<Result<Option<Volume>>> },
}

struct Worker {
    identity: WorkerIdentity,
    queue: mpsc::Sender<Job>,
    thread: JoinHandle<()>,
}

/// N workers, each a named OS thread owning one reconstructor and one queue.
///
/// Every request goes to every worker; the pool awaits all of them (bounded
/// by the join timeout) and folds the partials with its [`FanIn`]. Workers
/// never talk to the transport. Dropping the pool closes the queues and the
/// threads exit after their current job.
pub struct WorkerPool {
    workers: Vec<Worker>,
    fan_in: FanIn,
    join_timeout: Duration,
}

impl WorkerPool {
    pub fn spawn<F>(config: &PoolConfig, mut factory: F) -> Result<Self>
    where
        F: FnMut(WorkerIdentity) -> Box<dyn SliceReconstructor>,
    {
        config.validate()?;

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let identity = WorkerIdentity { index, count: config.workers };
            let reconstructor = factory(identity);
            let (queue, jobs) = mpsc::channel(config.queue_depth);
            let thread = thread::Builder::new()
                .name(format!("tomostream-worker-{index}"))
                .spawn(move || worker_loop(identity, reconstructor, jobs))
                .map_err(|e| StreamError::reconstruction(format!("failed to spawn worker {identity}: {e}")))?;
            workers.push(Worker { identity, queue, thread });
        }

        info!(workers = config.workers, fan_in = ?config.fan_in, "Worker pool started");
        Ok(Self { workers, fan_in: config.fan_in, join_timeout: config.join_timeout() })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn fan_in(&self) -> FanIn {
        self.fan_in
    }

    /// Fan a request out to every worker and fold the results.
    pub async fn run(&self, scene: SceneSnapshot, request: SliceRequest) -> Result<SliceReply> {
        let slice_id = request.slice_id;
        let request = Arc::new(request);
        let partials = self
            .fan_out(|done| Job::Slice { scene: scene.clone(), request: Arc::clone(&request), done })
            .await?;
        trace!(slice_id, workers = partials.len(), "Joined slice job");
        self.fan_in.combine(partials)
    }

    /// Fan a preview out to every worker and fold the volumes.
    pub async fn preview(&self, scene: SceneSnapshot, size: u32) -> Result<Option<Volume>> {
        let partials = self.fan_out(|done| Job::Preview { scene: scene.clone(), size, done }).await?;
        self.fan_in.combine_previews(partials)
    }

    /// Send one job per worker and collect the results in worker order,
    /// bounded by the join timeout.
    async fn fan_out<T>(&self, mut job: impl FnMut(oneshot::Sender<Result<T>>) -> Job) -> Result<Vec<Result<T>>> {
        let work = async {
            let mut pending = Vec::with_capacity(self.workers.len());
            for worker in &self.workers {
                let (done, completion) = oneshot::channel();
                worker
                    .queue
                    .send(job(done))
                    .await
                    .map_err(|_| StreamError::reconstruction(format!("worker {} has stopped", worker.identity)))?;
                pending.push(completion);
            }

            Ok(join_all(pending)
                .await
                .into_iter()
                .zip(&self.workers)
                .map(|(completion, worker)| {
                    completion.unwrap_or_else(|_| {
                        Err(StreamError::reconstruction(format!("worker {} dropped the job", worker.identity)))
                    })
                })
                .collect())
        };

        tokio::time::timeout(self.join_timeout, work)
            .await
            .map_err(|_| StreamError::Timeout { duration: self.join_timeout })?
    }

    /// Close every queue and wait for the threads to finish their current job.
    pub async fn shutdown(self) {
        let threads: Vec<_> = self
            .workers
            .into_iter()
            .map(|worker| {
                drop(worker.queue);
                (worker.identity, worker.thread)
            })
            .collect();

        let joined = tokio::task::spawn_blocking(move || {
            for (identity, thread) in threads {
                if thread.join().is_err() {
                    warn!(worker = %identity, "Worker thread ended with a panic");
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("Failed to join worker threads");
        }
        debug!("Worker pool stopped");
    }
}

fn worker_loop(identity: WorkerIdentity, reconstructor: Box<dyn SliceReconstructor>, mut jobs: mpsc::Receiver<Job>) {
    debug!(worker = %identity, "Worker started");
    let mut completed = 0u64;

    while let Some(job) = jobs.blocking_recv() {
        let delivered = match job {
            Job::Slice { scene, request, done } => {
                let result = guarded(identity, || reconstructor.reconstruct(&scene, &request));
                done.send(result).is_ok()
            }
            Job::Preview { scene, size, done } => {
                let result = guarded(identity, || reconstructor.reconstruct_preview(&scene, size));
                done.send(result).is_ok()
            }
        };
        completed += 1;
        if !delivered {
            trace!(worker = %identity, "Result arrived after the join gave up");
        }
    }

    debug!(worker = %identity, completed, "Worker stopped");
}

/// Run one reconstruction, turning a panic into an error.
fn guarded<T>(identity: WorkerIdentity, f: impl FnOnce() -> Result<T>) -> Result<T> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(StreamError::reconstruction(format!("worker {identity} panicked: {message}")))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ConstantReconstructor, axial_request};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(workers: usize, fan_in: FanIn) -> PoolConfig {
        PoolConfig { workers, queue_depth: 4, join_timeout_ms: 1_000, fan_in }
    }

    #[test]
    fn sum_adds_equal_shaped_partials() {
        let partials = vec![
            Ok(SliceReply::new([1, 2], vec![1.0, 2.0]).unwrap()),
            Ok(SliceReply::empty()),
            Ok(SliceReply::new([1, 2], vec![10.0, 20.0]).unwrap()),
        ];
        let reply = FanIn::Sum.combine(partials).unwrap();
        assert_eq!(reply.data, vec![11.0, 22.0]);

        let disagree = vec![Ok(SliceReply::zeros([1, 2])), Ok(SliceReply::zeros([2, 1]))];
        assert!(FanIn::Sum.combine(disagree).is_err());

        let failed = vec![Ok(SliceReply::zeros([1, 1])), Err(StreamError::reconstruction("boom"))];
        assert!(FanIn::Sum.combine(failed).is_err());
    }

    #[test]
    fn first_skips_empty_and_failed_partials() {
        let partials = vec![
            Err(StreamError::reconstruction("boom")),
            Ok(SliceReply::empty()),
            Ok(SliceReply::new([1, 1], vec![7.0]).unwrap()),
            Ok(SliceReply::new([1, 1], vec![8.0]).unwrap()),
        ];
        assert_eq!(FanIn::First.combine(partials).unwrap().data, vec![7.0]);
        assert!(FanIn::First.combine(vec![Ok(SliceReply::empty())]).unwrap().is_empty());
        assert!(FanIn::First.combine(vec![Err(StreamError::reconstruction("x"))]).is_err());
    }

    #[test]
    fn previews_fold_like_slices() {
        let cube = |value: f32| {
            let mut volume = Volume::cube(2);
            volume.data.fill(value);
            volume
        };
        let partials = || vec![Ok(None), Ok(Some(cube(1.0))), Ok(Some(cube(2.0)))];
        assert_eq!(FanIn::Sum.combine_previews(partials()).unwrap(), Some(cube(3.0)));
        assert_eq!(FanIn::First.combine_previews(partials()).unwrap(), Some(cube(1.0)));
        assert_eq!(FanIn::Sum.combine_previews(vec![Ok(None), Ok(None)]).unwrap(), None);

        let mismatched = vec![Ok(Some(Volume::cube(2))), Ok(Some(Volume::cube(3)))];
        assert!(FanIn::Sum.combine_previews(mismatched).is_err());

        let failed = || vec![Err(StreamError::reconstruction("boom")), Ok(Some(cube(4.0)))];
        assert!(FanIn::Sum.combine_previews(failed()).is_err());
        assert_eq!(FanIn::First.combine_previews(failed()).unwrap(), Some(cube(4.0)));
        assert!(FanIn::First.combine_previews(vec![Err(StreamError::reconstruction("x"))]).is_err());
    }

    #[test]
    fn rejects_invalid_config() {
        assert!(PoolConfig { workers: 0, ..PoolConfig::default() }.validate().is_err());
        assert!(PoolConfig { queue_depth: 0, ..PoolConfig::default() }.validate().is_err());
        assert!(PoolConfig { join_timeout_ms: 0, ..PoolConfig::default() }.validate().is_err());
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn every_worker_contributes_to_the_sum() -> anyhow::Result<()> {
        let identities = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&identities);
        let pool = WorkerPool::spawn(&config(4, FanIn::Sum), move |identity| -> Box<dyn SliceReconstructor> {
            seen.fetch_add(1, Ordering::SeqCst);
            Box::new(ConstantReconstructor(identity.index as f32 + 1.0))
        })?;
        assert_eq!(identities.load(Ordering::SeqCst), 4);

        let reply = pool.run(SceneSnapshot::empty(0), axial_request(1, [2, 2])).await?;
        // 1 + 2 + 3 + 4
        assert_eq!(reply.data, vec![10.0; 4]);

        let preview = pool.preview(SceneSnapshot::empty(0), 2).await?.unwrap();
        assert_eq!(preview.data, vec![10.0; 8]);
        pool.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn panicking_worker_becomes_an_error() -> anyhow::Result<()> {
        let pool = WorkerPool::spawn(&config(2, FanIn::Sum), |identity| -> Box<dyn SliceReconstructor> {
            if identity.index == 1 {
                Box::new(|_: &SceneSnapshot, _: &SliceRequest| -> Result<SliceReply> { panic!("device lost") })
            } else {
                Box::new(ConstantReconstructor(1.0))
            }
        })?;

        let error = pool.run(SceneSnapshot::empty(0), axial_request(1, [2, 2])).await.unwrap_err();
        assert!(matches!(error, StreamError::Reconstruction { .. }));
        assert!(error.to_string().contains("device lost"));

        // the panicking worker keeps serving later jobs
        let error = pool.run(SceneSnapshot::empty(0), axial_request(2, [2, 2])).await.unwrap_err();
        assert!(error.to_string().contains("panicked"));
        pool.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_worker_hits_the_join_timeout() -> anyhow::Result<()> {
        let config = PoolConfig { join_timeout_ms: 50, ..config(2, FanIn::First) };
        let pool = WorkerPool::spawn(&config, |_| -> Box<dyn SliceReconstructor> {
            Box::new(|_: &SceneSnapshot, request: &SliceRequest| -> Result<SliceReply> {
                std::thread::sleep(Duration::from_millis(300));
                Ok(SliceReply::zeros(request.shape))
            })
        })?;

        let result = pool.run(SceneSnapshot::empty(0), axial_request(1, [2, 2])).await;
        assert!(matches!(result, Err(StreamError::Timeout { .. })));
        pool.shutdown().await;
        Ok(())
    }
}

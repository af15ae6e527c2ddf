//! Turns one slice request into exactly one reply.
//!
//! ## Architecture
//!
//! - [`Dispatcher::Single`]: one reconstructor, serialized, on the blocking pool
//! - [`Dispatcher::Pooled`]: N named worker threads, one private queue each,
//!   fan-out to all of them and fan-in with a [`FanIn`] policy
//!
//! The dispatcher's result is the only reply source. Failures of any kind
//! (invalid request, reconstructor error, worker panic, join timeout, a reply
//! whose shape disagrees with the request) are logged and answered with the
//! empty reply, so [`Dispatcher::dispatch`] never fails.

mod pool;
mod single;

pub use pool::{FanIn, PoolConfig, WorkerPool};
pub use single::SingleWorker;

use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ReconstructionSettings;
use crate::reconstructor::{SliceReconstructor, WorkerIdentity};
use crate::scene::SceneSnapshot;
use crate::types::{SliceReply, SliceRequest, Volume};
use crate::{Result, StreamError};

/// Dispatch policy as configured.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum DispatchConfig {
    #[default]
    Single,
    Pooled(PoolConfig),
}

impl DispatchConfig {
    pub fn validate(&self) -> Result<()> {
        match self {
            DispatchConfig::Single => Ok(()),
            DispatchConfig::Pooled(pool) => pool.validate(),
        }
    }
}

pub enum Dispatcher {
    Single(SingleWorker),
    Pooled(WorkerPool),
}

impl Dispatcher {
    pub fn single(reconstructor: impl SliceReconstructor) -> Self {
        Dispatcher::Single(SingleWorker::new(reconstructor))
    }

    /// Spawn a pool; `factory` builds one reconstructor per worker identity.
    pub fn pooled<F>(config: &PoolConfig, factory: F) -> Result<Self>
    where
        F: FnMut(WorkerIdentity) -> Box<dyn SliceReconstructor>,
    {
        Ok(Dispatcher::Pooled(WorkerPool::spawn(config, factory)?))
    }

    /// Build the configured policy. `factory` receives the reconstruction
    /// settings along with each worker identity.
    pub fn from_config<F>(config: &DispatchConfig, settings: &ReconstructionSettings, mut factory: F) -> Result<Self>
    where
        F: FnMut(WorkerIdentity, &ReconstructionSettings) -> Box<dyn SliceReconstructor>,
    {
        settings.validate()?;
        match config {
            DispatchConfig::Single => {
                let reconstructor = factory(WorkerIdentity::SOLE, settings);
                Ok(Dispatcher::Single(SingleWorker::from_arc(reconstructor.into())))
            }
            DispatchConfig::Pooled(pool) => Self::pooled(pool, |identity| factory(identity, settings)),
        }
    }

    pub fn worker_count(&self) -> usize {
        match self {
            Dispatcher::Single(_) => 1,
            Dispatcher::Pooled(pool) => pool.worker_count(),
        }
    }

    /// Reconstruct one slice, answering with the empty reply on any failure.
    pub async fn dispatch(&self, scene: SceneSnapshot, request: SliceRequest) -> SliceReply {
        let scene_id = scene.scene_id();
        let slice_id = request.slice_id;
        match self.try_dispatch(scene, request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(scene_id, slice_id, error = %e, "Slice dispatch failed, replying empty");
                SliceReply::empty()
            }
        }
    }

    /// Like [`dispatch`](Self::dispatch) but surfaces the failure.
    pub async fn try_dispatch(&self, scene: SceneSnapshot, request: SliceRequest) -> Result<SliceReply> {
        request.validate()?;
        let shape = request.shape;
        let slice_id = request.slice_id;
        let started = Instant::now();

        let reply = match self {
            Dispatcher::Single(worker) => worker.run(scene, request).await?,
            Dispatcher::Pooled(pool) => pool.run(scene, request).await?,
        };

        if !reply.is_empty() {
            reply.validate()?;
            if reply.shape != shape {
                return Err(StreamError::reconstruction(format!(
                    "reply shape {:?} does not match requested {:?}",
                    reply.shape, shape
                )));
            }
        }

        debug!(slice_id, elapsed_us = started.elapsed().as_micros() as u64, empty = reply.is_empty(), "Dispatched");
        Ok(reply)
    }

    /// Reconstruct a `size`³ preview. `None` when no backend produced one or
    /// the reconstruction failed.
    pub async fn preview(&self, scene: SceneSnapshot, size: u32) -> Option<Volume> {
        let scene_id = scene.scene_id();
        if size == 0 {
            return None;
        }
        let result = match self {
            Dispatcher::Single(worker) => worker.preview(scene, size).await,
            Dispatcher::Pooled(pool) => pool.preview(scene, size).await,
        };
        match result {
            Ok(Some(volume)) if volume.voxels() == volume.data.len() && volume.shape == [size; 3] => Some(volume),
            Ok(Some(volume)) => {
                warn!(scene_id, shape = ?volume.shape, size, "Discarding preview of the wrong shape");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(scene_id, error = %e, "Preview reconstruction failed");
                None
            }
        }
    }

    /// Stop worker threads; pending jobs finish first.
    pub async fn shutdown(self) {
        if let Dispatcher::Pooled(pool) = self {
            pool.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ConstantReconstructor, axial_request};
    use crate::types::Orientation;

    #[tokio::test]
    async fn invalid_requests_get_the_empty_reply() {
        let dispatcher = Dispatcher::single(ConstantReconstructor(1.0));

        let degenerate = SliceRequest::new(1, Orientation::new([1.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0; 3]), [2, 2]);
        assert!(dispatcher.dispatch(SceneSnapshot::empty(0), degenerate).await.is_empty());

        let zero_shape = axial_request(2, [0, 3]);
        assert!(dispatcher.dispatch(SceneSnapshot::empty(0), zero_shape).await.is_empty());
    }

    #[tokio::test]
    async fn wrongly_shaped_replies_are_discarded() {
        let dispatcher =
            Dispatcher::single(|_: &SceneSnapshot, _: &SliceRequest| -> Result<SliceReply> { Ok(SliceReply::zeros([3, 3])) });
        let result = dispatcher.try_dispatch(SceneSnapshot::empty(0), axial_request(1, [2, 2])).await;
        assert!(matches!(result, Err(StreamError::Reconstruction { .. })));
        assert!(dispatcher.dispatch(SceneSnapshot::empty(0), axial_request(1, [2, 2])).await.is_empty());
    }

    #[tokio::test]
    async fn reconstructor_errors_become_empty_replies() {
        let dispatcher = Dispatcher::single(|_: &SceneSnapshot, _: &SliceRequest| -> Result<SliceReply> {
            Err(StreamError::reconstruction("no projections yet"))
        });
        assert!(dispatcher.dispatch(SceneSnapshot::empty(0), axial_request(1, [2, 2])).await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn from_config_builds_either_policy() -> anyhow::Result<()> {
        let settings = ReconstructionSettings::default();
        let factory = |_: WorkerIdentity, _: &ReconstructionSettings| -> Box<dyn SliceReconstructor> {
            Box::new(ConstantReconstructor(2.0))
        };
        let single = Dispatcher::from_config(&DispatchConfig::Single, &settings, factory)?;
        assert_eq!(single.worker_count(), 1);
        let reply = single.dispatch(SceneSnapshot::empty(0), axial_request(1, [1, 2])).await;
        assert_eq!(reply.data, vec![2.0, 2.0]);

        let pooled_config = DispatchConfig::Pooled(PoolConfig { workers: 3, ..PoolConfig::default() });
        let pooled = Dispatcher::from_config(&pooled_config, &settings, factory)?;
        assert_eq!(pooled.worker_count(), 3);
        let reply = pooled.dispatch(SceneSnapshot::empty(0), axial_request(1, [1, 2])).await;
        assert_eq!(reply.data, vec![6.0, 6.0]);

        pooled.shutdown().await;
        single.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn factory_sees_the_reconstruction_settings() -> anyhow::Result<()> {
        let settings = ReconstructionSettings {
            preview_size: 3,
            custom_filter: Some(vec![0.5, 1.0, 0.5]),
            ..ReconstructionSettings::default()
        };
        let seen = std::sync::Mutex::new(Vec::new());
        let pooled_config = DispatchConfig::Pooled(PoolConfig { workers: 2, ..PoolConfig::default() });
        let pooled = Dispatcher::from_config(&pooled_config, &settings, |identity, settings| -> Box<dyn SliceReconstructor> {
            seen.lock().unwrap().push((identity.index, settings.custom_filter.clone()));
            Box::new(ConstantReconstructor(1.0))
        })?;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(0, Some(vec![0.5, 1.0, 0.5])), (1, Some(vec![0.5, 1.0, 0.5]))]
        );

        let preview = pooled.preview(SceneSnapshot::empty(0), settings.preview_size).await.unwrap();
        assert_eq!(preview.shape, [3, 3, 3]);
        assert_eq!(preview.data, vec![2.0; 27]);
        pooled.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn preview_is_none_without_a_backend_preview() {
        let dispatcher = Dispatcher::single(|_: &SceneSnapshot, request: &SliceRequest| -> Result<SliceReply> {
            Ok(SliceReply::zeros(request.shape))
        });
        assert_eq!(dispatcher.preview(SceneSnapshot::empty(0), 4).await, None);

        let zero = Dispatcher::single(crate::reconstructor::ZeroReconstructor);
        assert_eq!(zero.preview(SceneSnapshot::empty(0), 0).await, None);
        assert_eq!(zero.preview(SceneSnapshot::empty(0), 2).await.map(|v| v.voxels()), Some(8));
    }

    #[test]
    fn dispatch_config_yaml_shape() {
        let pooled: DispatchConfig =
            serde_yaml_ng::from_str("policy: pooled\nworkers: 2\nfan_in: first\n").unwrap();
        assert_eq!(
            pooled,
            DispatchConfig::Pooled(PoolConfig { workers: 2, fan_in: FanIn::First, ..PoolConfig::default() })
        );

        let single: DispatchConfig = serde_yaml_ng::from_str("policy: single\n").unwrap();
        assert_eq!(single, DispatchConfig::Single);
    }
}

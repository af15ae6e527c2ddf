//! Serialized reconstruction on the blocking pool.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::reconstructor::SliceReconstructor;
use crate::scene::SceneSnapshot;
use crate::types::{SliceReply, SliceRequest, Volume};
use crate::{Result, StreamError};

/// One reconstructor; at most one reconstruction runs at a time.
pub struct SingleWorker {
    reconstructor: Arc<dyn SliceReconstructor>,
    gate: Mutex<()>,
}

impl SingleWorker {
    pub fn new(reconstructor: impl SliceReconstructor) -> Self {
        Self::from_arc(Arc::new(reconstructor))
    }

    pub fn from_arc(reconstructor: Arc<dyn SliceReconstructor>) -> Self {
        Self { reconstructor, gate: Mutex::new(()) }
    }

    pub async fn run(&self, scene: SceneSnapshot, request: SliceRequest) -> Result<SliceReply> {
        let _guard = self.gate.lock().await;
        let reconstructor = Arc::clone(&self.reconstructor);
        let slice_id = request.slice_id;

        tokio::task::spawn_blocking(move || reconstructor.reconstruct(&scene, &request))
            .await
            .map_err(|e| {
                let cause = if e.is_panic() { "panicked" } else { "was cancelled" };
                StreamError::reconstruction(format!("reconstruction of slice {slice_id} {cause}"))
            })?
    }

    pub async fn preview(&self, scene: SceneSnapshot, size: u32) -> Result<Option<Volume>> {
        let _guard = self.gate.lock().await;
        let reconstructor = Arc::clone(&self.reconstructor);

        tokio::task::spawn_blocking(move || reconstructor.reconstruct_preview(&scene, size))
            .await
            .map_err(|e| StreamError::reconstruction(format!("preview reconstruction failed to finish: {e}")))?
    }
}

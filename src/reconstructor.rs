//! The reconstruction capability plugged into the dispatcher.
//!
//! Reconstruction mathematics live outside this crate. A backend implements
//! [`SliceReconstructor`] and reads whatever it needs from the scene snapshot.
//!
//! # Example
//!
//! ```rust
//! use tomostream::reconstructor::SliceReconstructor;
//! use tomostream::scene::SceneSnapshot;
//! use tomostream::types::{SliceReply, SliceRequest};
//!
//! let constant = |_: &SceneSnapshot, request: &SliceRequest| {
//!     SliceReply::new(request.shape, vec![1.0; request.pixels()])
//! };
//! let _boxed: Box<dyn SliceReconstructor> = Box::new(constant);
//! ```

use crate::Result;
use crate::scene::SceneSnapshot;
use crate::types::{SliceReply, SliceRequest, Volume};

/// Produces one slice from a scene snapshot.
///
/// Implementations may block; the dispatcher never calls them on an async
/// worker thread.
pub trait SliceReconstructor: Send + Sync + 'static {
    fn reconstruct(&self, scene: &SceneSnapshot, request: &SliceRequest) -> Result<SliceReply>;

    /// Coarse `size`³ volume of the whole window, pushed after new projections.
    ///
    /// `Ok(None)` means this backend has no preview.
    fn reconstruct_preview(&self, scene: &SceneSnapshot, size: u32) -> Result<Option<Volume>> {
        let _ = (scene, size);
        Ok(None)
    }
}

impl<F> SliceReconstructor for F
where
    F: Fn(&SceneSnapshot, &SliceRequest) -> Result<SliceReply> + Send + Sync + 'static,
{
    fn reconstruct(&self, scene: &SceneSnapshot, request: &SliceRequest) -> Result<SliceReply> {
        self(scene, request)
    }
}

/// Position of a worker in a pool. Fixed for the worker's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    pub index: usize,
    pub count: usize,
}

impl WorkerIdentity {
    /// The only worker of a single-worker dispatcher.
    pub const SOLE: WorkerIdentity = WorkerIdentity { index: 0, count: 1 };

    /// Round-robin partition of projections across the pool.
    pub fn owns_projection(&self, projection: u32) -> bool {
        self.count <= 1 || projection as usize % self.count == self.index
    }
}

impl std::fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.index, self.count)
    }
}

/// Answers every request with a zero-filled slice of the requested shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroReconstructor;

impl SliceReconstructor for ZeroReconstructor {
    fn reconstruct(&self, _scene: &SceneSnapshot, request: &SliceRequest) -> Result<SliceReply> {
        Ok(SliceReply::zeros(request.shape))
    }

    fn reconstruct_preview(&self, _scene: &SceneSnapshot, size: u32) -> Result<Option<Volume>> {
        Ok(Some(Volume::cube(size)))
    }
}

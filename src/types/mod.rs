//! Core value types shared by the codec, the scene store and the dispatcher.
//!
//! ## Architecture
//!
//! - [`SliceRequest`] describes an arbitrary slice plane plus the output resolution
//! - [`SliceReply`] is the reconstructed `(shape, data)` pair; empty means "no update"
//! - [`FrameClass`] and [`FrameKey`] address stored acquisition frames
//! - [`AcquisitionGeometry`], [`VolumeWindow`] and [`ScanSettings`] describe a scan
//!
//! ## Usage Example
//!
//! ```rust
//! use tomostream::types::{Orientation, SliceRequest, SliceReply};
//!
//! let orientation = Orientation::new([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [-0.5, -0.5, 0.0]);
//! let request = SliceRequest::new(7, orientation, [4, 4]);
//! assert!(request.validate().is_ok());
//!
//! let reply = SliceReply::zeros(request.shape);
//! assert_eq!(reply.data.len(), 16);
//! assert!(SliceReply::empty().is_empty());
//! ```

mod geometry;

pub use geometry::{AcquisitionGeometry, BeamGeometry, ProjectionPose, ScanSettings, VolumeWindow};

use crate::packet::DecodeError;
use crate::{Result, StreamError};

/// Identifies one acquisition/visualization session.
pub type SceneId = i32;

/// Correlates a slice request with its asynchronous reply.
pub type SliceId = i32;

/// A point or direction in volume coordinates.
pub type Vec3 = [f32; 3];

/// Number of floats per projection in vector-form geometries.
pub const FLOATS_PER_VECTOR: usize = 12;

/// Kind of an acquisition frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(i32)]
pub enum FrameClass {
    Dark = 0,
    Flat = 1,
    Projection = 2,
}

impl FrameClass {
    /// Wire representation of this class.
    pub const fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for FrameClass {
    type Error = DecodeError;

    fn try_from(value: i32) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameClass::Dark),
            1 => Ok(FrameClass::Flat),
            2 => Ok(FrameClass::Projection),
            other => Err(DecodeError::InvalidFrameClass(other)),
        }
    }
}

impl std::fmt::Display for FrameClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FrameClass::Dark => "dark",
            FrameClass::Flat => "flat",
            FrameClass::Projection => "projection",
        };
        f.write_str(name)
    }
}

/// Storage key for a frame: frames are overwritten per key, never appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameKey {
    pub class: FrameClass,
    pub index: u32,
}

impl FrameKey {
    pub const fn new(class: FrameClass, index: u32) -> Self {
        Self { class, index }
    }
}

/// In-plane basis and origin of a slice.
///
/// The wire order is `dx[3], dy[3], base[3]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Orientation {
    pub dx: Vec3,
    pub dy: Vec3,
    pub base: Vec3,
}

impl Orientation {
    pub const fn new(dx: Vec3, dy: Vec3, base: Vec3) -> Self {
        Self { dx, dy, base }
    }

    /// Axis-aligned slice through `z`, spanning the unit square from `base`.
    pub const fn axial(base: Vec3) -> Self {
        Self { dx: [1.0, 0.0, 0.0], dy: [0.0, 1.0, 0.0], base }
    }

    pub fn from_array(values: [f32; 9]) -> Self {
        Self {
            dx: [values[0], values[1], values[2]],
            dy: [values[3], values[4], values[5]],
            base: [values[6], values[7], values[8]],
        }
    }

    pub fn to_array(&self) -> [f32; 9] {
        let [a, b, c] = self.dx;
        let [d, e, f] = self.dy;
        let [g, h, i] = self.base;
        [a, b, c, d, e, f, g, h, i]
    }

    /// A plane is degenerate when its basis vectors are (nearly) parallel,
    /// zero, or not finite.
    pub fn is_degenerate(&self) -> bool {
        let finite = self.to_array().iter().all(|v| v.is_finite());
        if !finite {
            return true;
        }
        let [ax, ay, az] = self.dx;
        let [bx, by, bz] = self.dy;
        let cross = [ay * bz - az * by, az * bx - ax * bz, ax * by - ay * bx];
        let area = cross.iter().map(|c| c * c).sum::<f32>().sqrt();
        area <= f32::EPSILON
    }
}

/// A request for one reconstructed slice.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceRequest {
    pub slice_id: SliceId,
    pub orientation: Orientation,
    /// Output resolution as `[rows, cols]`; `[0, 0]` asks for the server default.
    pub shape: [u32; 2],
}

impl SliceRequest {
    pub fn new(slice_id: SliceId, orientation: Orientation, shape: [u32; 2]) -> Self {
        Self { slice_id, orientation, shape }
    }

    /// Number of output pixels.
    pub fn pixels(&self) -> usize {
        self.shape[0] as usize * self.shape[1] as usize
    }

    /// Replace an unspecified shape with a square of `slice_size`.
    pub fn with_default_shape(mut self, slice_size: u32) -> Self {
        if self.shape == [0, 0] {
            self.shape = [slice_size, slice_size];
        }
        self
    }

    /// Reject requests no reconstructor could answer.
    pub fn validate(&self) -> Result<()> {
        if self.shape[0] == 0 || self.shape[1] == 0 {
            return Err(StreamError::reconstruction(format!(
                "slice {} requests an empty shape {:?}",
                self.slice_id, self.shape
            )));
        }
        if self.orientation.is_degenerate() {
            return Err(StreamError::reconstruction(format!(
                "slice {} has a degenerate orientation {:?}",
                self.slice_id,
                self.orientation.to_array()
            )));
        }
        Ok(())
    }
}

/// A reconstructed slice, or the empty "no update" reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SliceReply {
    /// `[rows, cols]`
    pub shape: [u32; 2],
    pub data: Vec<f32>,
}

impl SliceReply {
    /// Build a reply, checking that the payload matches the shape.
    pub fn new(shape: [u32; 2], data: Vec<f32>) -> Result<Self> {
        let reply = Self { shape, data };
        reply.validate()?;
        Ok(reply)
    }

    /// The explicit "no data" reply.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn zeros(shape: [u32; 2]) -> Self {
        let len = shape[0] as usize * shape[1] as usize;
        Self { shape, data: vec![0.0; len] }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        let expected = self.shape[0] as u64 * self.shape[1] as u64;
        if expected != self.data.len() as u64 {
            return Err(StreamError::Protocol(DecodeError::ShapeMismatch {
                field: "slice",
                expected,
                actual: self.data.len() as u64,
            }));
        }
        Ok(())
    }
}

/// A full or coarse volume snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    pub shape: [u32; 3],
    pub data: Vec<f32>,
}

impl Volume {
    pub fn zeros(shape: [u32; 3]) -> Self {
        let len = shape.iter().map(|d| *d as usize).product();
        Self { shape, data: vec![0.0; len] }
    }

    /// A `size`³ cube of zeros.
    pub fn cube(size: u32) -> Self {
        Self::zeros([size; 3])
    }

    pub fn voxels(&self) -> usize {
        self.shape.iter().map(|d| *d as usize).product()
    }
}

/// One stored acquisition frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// `[rows, cols]`
    pub shape: [u32; 2],
    pub data: Vec<f32>,
    /// Source/detector pose, present for frames pushed as `projection_data`.
    pub pose: Option<ProjectionPose>,
}

impl Frame {
    pub fn pixels(&self) -> usize {
        self.shape[0] as usize * self.shape[1] as usize
    }
}

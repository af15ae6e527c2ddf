//! Acquisition geometry and scan settings

use super::{FLOATS_PER_VECTOR, Vec3};

/// Beam model of an acquisition, in analytic or per-projection vector form.
#[derive(Debug, Clone, PartialEq)]
pub enum BeamGeometry {
    /// Parallel beam rotating through `angles` (radians).
    Parallel { angles: Vec<f32> },
    /// Parallel beam with 12 floats per projection (ray, detector centre, u, v).
    ParallelVec { vectors: Vec<f32> },
    /// Circular cone beam.
    Cone { angles: Vec<f32>, detector_size: [f32; 2], source_origin: f32, origin_det: f32 },
    /// Cone beam with 12 floats per projection (source, detector centre, u, v).
    ConeVec { vectors: Vec<f32> },
}

impl BeamGeometry {
    pub fn is_parallel(&self) -> bool {
        matches!(self, BeamGeometry::Parallel { .. } | BeamGeometry::ParallelVec { .. })
    }

    pub fn is_vector(&self) -> bool {
        matches!(self, BeamGeometry::ParallelVec { .. } | BeamGeometry::ConeVec { .. })
    }

    /// Projection count implied by the payload.
    pub fn implied_projections(&self) -> usize {
        match self {
            BeamGeometry::Parallel { angles } | BeamGeometry::Cone { angles, .. } => angles.len(),
            BeamGeometry::ParallelVec { vectors } | BeamGeometry::ConeVec { vectors } => {
                vectors.len() / FLOATS_PER_VECTOR
            }
        }
    }
}

/// Detector layout and beam model of one scene.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionGeometry {
    pub rows: u32,
    pub cols: u32,
    pub proj_count: u32,
    pub beam: BeamGeometry,
}

impl AcquisitionGeometry {
    /// Detector pixels per frame.
    pub fn pixels(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    pub fn angles(&self) -> Option<&[f32]> {
        match &self.beam {
            BeamGeometry::Parallel { angles } | BeamGeometry::Cone { angles, .. } => Some(angles),
            _ => None,
        }
    }

    /// The 12-float vector of projection `index`, for vector geometries.
    pub fn projection_vector(&self, index: usize) -> Option<&[f32]> {
        match &self.beam {
            BeamGeometry::ParallelVec { vectors } | BeamGeometry::ConeVec { vectors } => {
                let start = index.checked_mul(FLOATS_PER_VECTOR)?;
                vectors.get(start..start + FLOATS_PER_VECTOR)
            }
            _ => None,
        }
    }
}

/// Bounding box of the reconstruction volume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolumeWindow {
    pub min: Vec3,
    pub max: Vec3,
}

impl Default for VolumeWindow {
    fn default() -> Self {
        Self { min: [0.0; 3], max: [1.0; 3] }
    }
}

impl VolumeWindow {
    pub fn extent(&self) -> Vec3 {
        [self.max[0] - self.min[0], self.max[1] - self.min[1], self.max[2] - self.min[2]]
    }

    pub fn center(&self) -> Vec3 {
        [
            0.5 * (self.min[0] + self.max[0]),
            0.5 * (self.min[1] + self.max[1]),
            0.5 * (self.min[2] + self.max[2]),
        ]
    }
}

/// Dark/flat bookkeeping for a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanSettings {
    pub dark_count: u32,
    pub flat_count: u32,
    /// Frames are already linearized; skip the negative log.
    pub already_linear: bool,
}

/// Source position and detector axes of a single projection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectionPose {
    pub source: Vec3,
    /// Detector `u` axis, `v` axis and base point.
    pub detector: [f32; 9],
}

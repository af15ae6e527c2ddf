//! Binary codec for the packet catalogue.
//!
//! Every packet starts with a `u32` tag followed by the `i32` scene id. All
//! integers are little-endian `i32`, floats little-endian `f32`, booleans a
//! single `0`/`1` byte. Variable-length arrays are an `i32` element count
//! followed by the elements. Decoding is strict: the whole buffer must be
//! consumed and every declared shape must agree with its payload.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{
    GeometryPacket, GeometrySpecificationPacket, Packet, PacketKind, ProjectionDataPacket,
    ProjectionPacket, RemoveSlicePacket, ScanSettingsPacket, SetSlicePacket, SliceDataPacket,
    VolumeDataPacket,
};
use crate::types::{
    AcquisitionGeometry, BeamGeometry, FLOATS_PER_VECTOR, FrameClass, Orientation, ProjectionPose,
    ScanSettings, SliceRequest, Volume, VolumeWindow,
};

/// Reasons a byte buffer is not a valid packet.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet truncated at offset {offset}: needed {needed} bytes, {available} available")]
    Truncated { offset: usize, needed: usize, available: usize },

    #[error("unknown packet tag {0:#x}")]
    UnknownTag(u32),

    #[error("{field} payload length {actual} does not match declared shape ({expected})")]
    ShapeMismatch { field: &'static str, expected: u64, actual: u64 },

    #[error("{field} has negative dimension {value}")]
    NegativeDimension { field: &'static str, value: i32 },

    #[error("{field} is not a boolean byte: {value}")]
    InvalidBool { field: &'static str, value: u8 },

    #[error("invalid frame class {0}")]
    InvalidFrameClass(i32),

    #[error("{0} trailing bytes after packet")]
    TrailingBytes(usize),

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("{field} value {value} does not fit in an i32")]
    OutOfRange { field: &'static str, value: u64 },
}

/// Encode a packet into its wire representation.
///
/// Fails when a value has no `i32` representation on the wire: a negative
/// scene id, or a dimension, count or index above `i32::MAX`.
pub fn encode(packet: &Packet) -> Result<Bytes, DecodeError> {
    let mut out = BytesMut::with_capacity(encoded_len(packet));
    out.put_u32_le(packet.kind().tag());
    let scene_id = packet.scene_id();
    if scene_id < 0 {
        return Err(DecodeError::NegativeDimension { field: "scene_id", value: scene_id });
    }
    out.put_i32_le(scene_id);

    match packet {
        Packet::SliceData(p) => {
            out.put_i32_le(p.slice_id);
            put_dims(&mut out, "slice_data.shape", &p.shape)?;
            out.put_u8(p.is_final as u8);
            put_f32_array(&mut out, "slice_data.data", &p.data)?;
        }
        Packet::VolumeData(p) => {
            put_dims(&mut out, "volume_data.shape", &p.volume.shape)?;
            put_f32_array(&mut out, "volume_data.data", &p.volume.data)?;
        }
        Packet::SetSlice(p) => {
            out.put_i32_le(p.request.slice_id);
            put_f32s(&mut out, &p.request.orientation.to_array());
            put_dims(&mut out, "set_slice.shape", &p.request.shape)?;
        }
        Packet::RemoveSlice(p) => out.put_i32_le(p.slice_id),
        Packet::GeometrySpecification(p) => {
            put_f32s(&mut out, &p.window.min);
            put_f32s(&mut out, &p.window.max);
        }
        Packet::ScanSettings(p) => {
            put_dims(&mut out, "scan_settings.counts", &[p.settings.dark_count, p.settings.flat_count])?;
            out.put_u8(p.settings.already_linear as u8);
        }
        Packet::Geometry(p) => {
            let g = &p.geometry;
            put_dims(&mut out, "geometry.shape", &[g.rows, g.cols, g.proj_count])?;
            match &g.beam {
                BeamGeometry::Parallel { angles } => put_f32_array(&mut out, "geometry.angles", angles)?,
                BeamGeometry::ParallelVec { vectors } | BeamGeometry::ConeVec { vectors } => {
                    put_f32_array(&mut out, "geometry.vectors", vectors)?
                }
                BeamGeometry::Cone { angles, detector_size, source_origin, origin_det } => {
                    put_f32s(&mut out, detector_size);
                    out.put_f32_le(*source_origin);
                    out.put_f32_le(*origin_det);
                    put_f32_array(&mut out, "geometry.angles", angles)?;
                }
            }
        }
        Packet::ProjectionData(p) => {
            put_dim(&mut out, "projection_data.frame_index", p.frame_index)?;
            put_f32s(&mut out, &p.pose.source);
            put_f32s(&mut out, &p.pose.detector);
            put_dims(&mut out, "projection_data.shape", &p.shape)?;
            put_f32_array(&mut out, "projection_data.data", &p.data)?;
        }
        Packet::Projection(p) => {
            out.put_i32_le(p.class.as_i32());
            put_dim(&mut out, "projection.frame_index", p.frame_index)?;
            put_dims(&mut out, "projection.shape", &p.shape)?;
            put_f32_array(&mut out, "projection.data", &p.data)?;
        }
    }

    Ok(out.freeze())
}

/// Exact number of bytes [`encode`] produces for `packet`.
pub fn encoded_len(packet: &Packet) -> usize {
    // tag + scene_id
    const HEADER: usize = 8;
    const ARRAY: usize = 4;

    let body = match packet {
        Packet::SliceData(p) => 4 + 8 + 1 + ARRAY + p.data.len() * 4,
        Packet::VolumeData(p) => 12 + ARRAY + p.volume.data.len() * 4,
        Packet::SetSlice(_) => 4 + 9 * 4 + 8,
        Packet::RemoveSlice(_) => 4,
        Packet::GeometrySpecification(_) => 6 * 4,
        Packet::ScanSettings(_) => 4 + 4 + 1,
        Packet::Geometry(p) => {
            let payload = match &p.geometry.beam {
                BeamGeometry::Parallel { angles } => ARRAY + angles.len() * 4,
                BeamGeometry::ParallelVec { vectors } | BeamGeometry::ConeVec { vectors } => {
                    ARRAY + vectors.len() * 4
                }
                BeamGeometry::Cone { angles, .. } => 4 * 4 + ARRAY + angles.len() * 4,
            };
            12 + payload
        }
        Packet::ProjectionData(p) => 4 + 12 * 4 + 8 + ARRAY + p.data.len() * 4,
        Packet::Projection(p) => 4 + 4 + 8 + ARRAY + p.data.len() * 4,
    };
    HEADER + body
}

/// Decode one packet, rejecting anything but an exact, well-formed encoding.
pub fn decode(bytes: &[u8]) -> Result<Packet, DecodeError> {
    let mut r = Reader::new(bytes);
    let kind = PacketKind::try_from(r.read_u32()?)?;
    // read_dim caps the value at i32::MAX
    let scene_id = r.read_dim("scene_id")? as i32;

    let packet = match kind {
        PacketKind::SliceData => {
            let slice_id = r.read_i32()?;
            let shape = r.read_dims::<2>("slice_data.shape")?;
            let is_final = r.read_bool("slice_data.is_final")?;
            let data = r.read_f32_array("slice_data.data", product(&shape))?;
            Packet::SliceData(SliceDataPacket { scene_id, slice_id, shape, is_final, data })
        }
        PacketKind::VolumeData => {
            let shape = r.read_dims::<3>("volume_data.shape")?;
            let data = r.read_f32_array("volume_data.data", product(&shape))?;
            Packet::VolumeData(VolumeDataPacket { scene_id, volume: Volume { shape, data } })
        }
        PacketKind::SetSlice => {
            let slice_id = r.read_i32()?;
            let orientation = Orientation::from_array(r.read_f32s::<9>()?);
            let shape = r.read_dims::<2>("set_slice.shape")?;
            Packet::SetSlice(SetSlicePacket {
                scene_id,
                request: SliceRequest { slice_id, orientation, shape },
            })
        }
        PacketKind::RemoveSlice => {
            let slice_id = r.read_i32()?;
            Packet::RemoveSlice(RemoveSlicePacket { scene_id, slice_id })
        }
        PacketKind::GeometrySpecification => {
            let min = r.read_f32s::<3>()?;
            let max = r.read_f32s::<3>()?;
            Packet::GeometrySpecification(GeometrySpecificationPacket {
                scene_id,
                window: VolumeWindow { min, max },
            })
        }
        PacketKind::ScanSettings => {
            let [dark_count, flat_count] = r.read_dims::<2>("scan_settings.counts")?;
            let already_linear = r.read_bool("scan_settings.is_linear")?;
            Packet::ScanSettings(ScanSettingsPacket {
                scene_id,
                settings: ScanSettings { dark_count, flat_count, already_linear },
            })
        }
        PacketKind::ParallelBeamGeometry
        | PacketKind::ParallelVecGeometry
        | PacketKind::ConeBeamGeometry
        | PacketKind::ConeVecGeometry => {
            let [rows, cols, proj_count] = r.read_dims::<3>("geometry.shape")?;
            let vector_len = proj_count as u64 * FLOATS_PER_VECTOR as u64;
            let beam = match kind {
                PacketKind::ParallelBeamGeometry => {
                    BeamGeometry::Parallel { angles: r.read_f32_array("geometry.angles", proj_count as u64)? }
                }
                PacketKind::ParallelVecGeometry => {
                    BeamGeometry::ParallelVec { vectors: r.read_f32_array("geometry.vectors", vector_len)? }
                }
                PacketKind::ConeVecGeometry => {
                    BeamGeometry::ConeVec { vectors: r.read_f32_array("geometry.vectors", vector_len)? }
                }
                _ => {
                    let detector_size = r.read_f32s::<2>()?;
                    let source_origin = r.read_f32()?;
                    let origin_det = r.read_f32()?;
                    let angles = r.read_f32_array("geometry.angles", proj_count as u64)?;
                    BeamGeometry::Cone { angles, detector_size, source_origin, origin_det }
                }
            };
            Packet::Geometry(GeometryPacket {
                scene_id,
                geometry: AcquisitionGeometry { rows, cols, proj_count, beam },
            })
        }
        PacketKind::ProjectionData => {
            let frame_index = r.read_dim("projection_data.frame_index")?;
            let source = r.read_f32s::<3>()?;
            let detector = r.read_f32s::<9>()?;
            let shape = r.read_dims::<2>("projection_data.shape")?;
            let data = r.read_f32_array("projection_data.data", product(&shape))?;
            Packet::ProjectionData(ProjectionDataPacket {
                scene_id,
                frame_index,
                pose: ProjectionPose { source, detector },
                shape,
                data,
            })
        }
        PacketKind::Projection => {
            let class = FrameClass::try_from(r.read_i32()?)?;
            let frame_index = r.read_dim("projection.frame_index")?;
            let shape = r.read_dims::<2>("projection.shape")?;
            let data = r.read_f32_array("projection.data", product(&shape))?;
            Packet::Projection(ProjectionPacket { scene_id, class, frame_index, shape, data })
        }
    };

    r.finish()?;
    Ok(packet)
}

fn product(dims: &[u32]) -> u64 {
    dims.iter().fold(1u64, |acc, d| acc.saturating_mul(*d as u64))
}

fn put_dim(out: &mut BytesMut, field: &'static str, value: u32) -> Result<(), DecodeError> {
    let value = i32::try_from(value).map_err(|_| DecodeError::OutOfRange { field, value: value as u64 })?;
    out.put_i32_le(value);
    Ok(())
}

fn put_dims(out: &mut BytesMut, field: &'static str, dims: &[u32]) -> Result<(), DecodeError> {
    dims.iter().try_for_each(|d| put_dim(out, field, *d))
}

fn put_f32s(out: &mut BytesMut, values: &[f32]) {
    for v in values {
        out.put_f32_le(*v);
    }
}

fn put_f32_array(out: &mut BytesMut, field: &'static str, values: &[f32]) -> Result<(), DecodeError> {
    let count = i32::try_from(values.len())
        .map_err(|_| DecodeError::OutOfRange { field, value: values.len() as u64 })?;
    out.put_i32_le(count);
    put_f32s(out, values);
    Ok(())
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < needed {
            return Err(DecodeError::Truncated { offset: self.offset, needed, available: self.remaining() });
        }
        let slice = &self.bytes[self.offset..self.offset + needed];
        self.offset += needed;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    fn read_f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    fn read_bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidBool { field, value }),
        }
    }

    /// A non-negative `i32` (dimension, count or index).
    fn read_dim(&mut self, field: &'static str) -> Result<u32, DecodeError> {
        let value = self.read_i32()?;
        u32::try_from(value).map_err(|_| DecodeError::NegativeDimension { field, value })
    }

    fn read_dims<const N: usize>(&mut self, field: &'static str) -> Result<[u32; N], DecodeError> {
        let mut dims = [0u32; N];
        for d in dims.iter_mut() {
            *d = self.read_dim(field)?;
        }
        Ok(dims)
    }

    fn read_f32s<const N: usize>(&mut self) -> Result<[f32; N], DecodeError> {
        let mut values = [0f32; N];
        for v in values.iter_mut() {
            *v = self.read_f32()?;
        }
        Ok(values)
    }

    /// Count-prefixed `f32` array whose length must equal `expected`.
    ///
    /// The count is checked against the declared shape and the remaining
    /// buffer before anything is allocated.
    fn read_f32_array(&mut self, field: &'static str, expected: u64) -> Result<Vec<f32>, DecodeError> {
        let count = self.read_dim(field)?;
        if count as u64 != expected {
            return Err(DecodeError::ShapeMismatch { field, expected, actual: count as u64 });
        }
        let bytes = self.take(count as usize * 4)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

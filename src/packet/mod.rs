//! Typed packet catalogue and wire codec.
//!
//! ## Architecture
//!
//! - [`PacketKind`] is the `u32` tag that makes every packet self-describing
//! - [`Packet`] is the closed set of packets the server understands
//! - [`codec`] turns packets into bytes and back, rejecting malformed input
//! - [`frame`] carries encoded packets over a byte stream
//!
//! ## Usage Example
//!
//! ```rust
//! use tomostream::packet::{Packet, RemoveSlicePacket};
//!
//! let packet: Packet = RemoveSlicePacket { scene_id: 3, slice_id: 12 }.into();
//! let bytes = packet.encode().unwrap();
//! assert_eq!(Packet::decode(&bytes).unwrap(), packet);
//! ```

pub mod codec;
pub mod frame;

pub use codec::{DecodeError, decode, encode, encoded_len};

use bytes::Bytes;

use crate::types::{
    AcquisitionGeometry, BeamGeometry, FrameClass, ProjectionPose, ScanSettings, SceneId, SliceId,
    SliceReply, SliceRequest, Volume, VolumeWindow,
};

/// Wire tag of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketKind {
    SliceData = 0x201,
    VolumeData = 0x203,
    SetSlice = 0x205,
    RemoveSlice = 0x206,
    GeometrySpecification = 0x301,
    ScanSettings = 0x302,
    ParallelBeamGeometry = 0x303,
    ParallelVecGeometry = 0x304,
    ConeBeamGeometry = 0x305,
    ConeVecGeometry = 0x306,
    ProjectionData = 0x307,
    Projection = 0x309,
}

impl PacketKind {
    pub const fn tag(self) -> u32 {
        self as u32
    }

    /// Short name used in log fields.
    pub const fn name(self) -> &'static str {
        match self {
            PacketKind::SliceData => "slice_data",
            PacketKind::VolumeData => "volume_data",
            PacketKind::SetSlice => "set_slice",
            PacketKind::RemoveSlice => "remove_slice",
            PacketKind::GeometrySpecification => "geometry_specification",
            PacketKind::ScanSettings => "scan_settings",
            PacketKind::ParallelBeamGeometry => "parallel_beam_geometry",
            PacketKind::ParallelVecGeometry => "parallel_vec_geometry",
            PacketKind::ConeBeamGeometry => "cone_beam_geometry",
            PacketKind::ConeVecGeometry => "cone_vec_geometry",
            PacketKind::ProjectionData => "projection_data",
            PacketKind::Projection => "projection",
        }
    }

    /// Packets a viewer sends on the reply channel.
    pub const fn is_request(self) -> bool {
        matches!(self, PacketKind::SetSlice | PacketKind::RemoveSlice)
    }
}

impl TryFrom<u32> for PacketKind {
    type Error = DecodeError;

    fn try_from(tag: u32) -> Result<Self, Self::Error> {
        let kind = match tag {
            0x201 => PacketKind::SliceData,
            0x203 => PacketKind::VolumeData,
            0x205 => PacketKind::SetSlice,
            0x206 => PacketKind::RemoveSlice,
            0x301 => PacketKind::GeometrySpecification,
            0x302 => PacketKind::ScanSettings,
            0x303 => PacketKind::ParallelBeamGeometry,
            0x304 => PacketKind::ParallelVecGeometry,
            0x305 => PacketKind::ConeBeamGeometry,
            0x306 => PacketKind::ConeVecGeometry,
            0x307 => PacketKind::ProjectionData,
            0x309 => PacketKind::Projection,
            other => return Err(DecodeError::UnknownTag(other)),
        };
        Ok(kind)
    }
}

impl std::fmt::Display for PacketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A reconstructed slice travelling to a viewer (or a plugin).
#[derive(Debug, Clone, PartialEq)]
pub struct SliceDataPacket {
    pub scene_id: SceneId,
    pub slice_id: SliceId,
    pub shape: [u32; 2],
    pub is_final: bool,
    pub data: Vec<f32>,
}

impl SliceDataPacket {
    /// The "no update" reply for `slice_id`.
    pub fn empty(scene_id: SceneId, slice_id: SliceId) -> Self {
        Self { scene_id, slice_id, shape: [0, 0], is_final: true, data: Vec::new() }
    }

    pub fn from_reply(scene_id: SceneId, slice_id: SliceId, reply: SliceReply) -> Self {
        Self { scene_id, slice_id, shape: reply.shape, is_final: true, data: reply.data }
    }

    pub fn into_reply(self) -> SliceReply {
        SliceReply { shape: self.shape, data: self.data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the payload length equals the product of the shape.
    pub fn is_consistent(&self) -> bool {
        self.shape[0] as u64 * self.shape[1] as u64 == self.data.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumeDataPacket {
    pub scene_id: SceneId,
    pub volume: Volume,
}

/// A viewer asking for (or updating) one slice.
#[derive(Debug, Clone, PartialEq)]
pub struct SetSlicePacket {
    pub scene_id: SceneId,
    pub request: SliceRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoveSlicePacket {
    pub scene_id: SceneId,
    pub slice_id: SliceId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeometrySpecificationPacket {
    pub scene_id: SceneId,
    pub window: VolumeWindow,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanSettingsPacket {
    pub scene_id: SceneId,
    pub settings: ScanSettings,
}

/// One of the four beam geometry packets; the tag follows the beam variant.
#[derive(Debug, Clone, PartialEq)]
pub struct GeometryPacket {
    pub scene_id: SceneId,
    pub geometry: AcquisitionGeometry,
}

/// A projection frame carrying its own source/detector pose.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionDataPacket {
    pub scene_id: SceneId,
    pub frame_index: u32,
    pub pose: ProjectionPose,
    pub shape: [u32; 2],
    pub data: Vec<f32>,
}

/// A dark, flat or projection frame.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionPacket {
    pub scene_id: SceneId,
    pub class: FrameClass,
    pub frame_index: u32,
    pub shape: [u32; 2],
    pub data: Vec<f32>,
}

/// Every packet of the protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    SliceData(SliceDataPacket),
    VolumeData(VolumeDataPacket),
    SetSlice(SetSlicePacket),
    RemoveSlice(RemoveSlicePacket),
    GeometrySpecification(GeometrySpecificationPacket),
    ScanSettings(ScanSettingsPacket),
    Geometry(GeometryPacket),
    ProjectionData(ProjectionDataPacket),
    Projection(ProjectionPacket),
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::SliceData(_) => PacketKind::SliceData,
            Packet::VolumeData(_) => PacketKind::VolumeData,
            Packet::SetSlice(_) => PacketKind::SetSlice,
            Packet::RemoveSlice(_) => PacketKind::RemoveSlice,
            Packet::GeometrySpecification(_) => PacketKind::GeometrySpecification,
            Packet::ScanSettings(_) => PacketKind::ScanSettings,
            Packet::Geometry(p) => match p.geometry.beam {
                BeamGeometry::Parallel { .. } => PacketKind::ParallelBeamGeometry,
                BeamGeometry::ParallelVec { .. } => PacketKind::ParallelVecGeometry,
                BeamGeometry::Cone { .. } => PacketKind::ConeBeamGeometry,
                BeamGeometry::ConeVec { .. } => PacketKind::ConeVecGeometry,
            },
            Packet::ProjectionData(_) => PacketKind::ProjectionData,
            Packet::Projection(_) => PacketKind::Projection,
        }
    }

    pub fn scene_id(&self) -> SceneId {
        match self {
            Packet::SliceData(p) => p.scene_id,
            Packet::VolumeData(p) => p.scene_id,
            Packet::SetSlice(p) => p.scene_id,
            Packet::RemoveSlice(p) => p.scene_id,
            Packet::GeometrySpecification(p) => p.scene_id,
            Packet::ScanSettings(p) => p.scene_id,
            Packet::Geometry(p) => p.scene_id,
            Packet::ProjectionData(p) => p.scene_id,
            Packet::Projection(p) => p.scene_id,
        }
    }

    pub fn encode(&self) -> Result<Bytes, DecodeError> {
        codec::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        codec::decode(bytes)
    }

    /// Position in the canonical acquisition order: geometry specification,
    /// beam geometry, scan settings, darks, flats, projections, the rest.
    pub fn acquisition_rank(&self) -> u8 {
        match self {
            Packet::GeometrySpecification(_) => 0,
            Packet::Geometry(_) => 1,
            Packet::ScanSettings(_) => 2,
            Packet::Projection(p) => match p.class {
                FrameClass::Dark => 3,
                FrameClass::Flat => 4,
                FrameClass::Projection => 5,
            },
            Packet::ProjectionData(_) => 5,
            _ => 6,
        }
    }
}

/// Stable sort into the canonical acquisition order.
pub fn sort_acquisition_order(packets: &mut [Packet]) {
    packets.sort_by_key(Packet::acquisition_rank);
}

macro_rules! impl_from_packet {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Packet {
                fn from(packet: $ty) -> Self {
                    Packet::$variant(packet)
                }
            }
        )*
    };
}

impl_from_packet! {
    SliceData => SliceDataPacket,
    VolumeData => VolumeDataPacket,
    SetSlice => SetSlicePacket,
    RemoveSlice => RemoveSlicePacket,
    GeometrySpecification => GeometrySpecificationPacket,
    ScanSettings => ScanSettingsPacket,
    Geometry => GeometryPacket,
    ProjectionData => ProjectionDataPacket,
    Projection => ProjectionPacket,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{acquisition_scenario, projection};

    #[test]
    fn tags_round_trip_through_kind() {
        for tag in [0x201, 0x203, 0x205, 0x206, 0x301, 0x302, 0x303, 0x304, 0x305, 0x306, 0x307, 0x309] {
            assert_eq!(PacketKind::try_from(tag).unwrap().tag(), tag);
        }
        assert_eq!(PacketKind::try_from(0x202), Err(DecodeError::UnknownTag(0x202)));
        assert!(PacketKind::SetSlice.is_request());
        assert!(!PacketKind::Projection.is_request());
    }

    #[test]
    fn acquisition_order_is_stable_and_canonical() {
        let mut packets = acquisition_scenario(4);
        packets.reverse();
        sort_acquisition_order(&mut packets);

        let ranks: Vec<u8> = packets.iter().map(Packet::acquisition_rank).collect();
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(packets[0].kind(), PacketKind::GeometrySpecification);

        // reversed input, stable sort: projections keep their reversed relative order
        let indices: Vec<u32> = packets
            .iter()
            .filter_map(|p| match p {
                Packet::Projection(p) if p.class == FrameClass::Projection => Some(p.frame_index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![7, 6, 5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn slice_data_helpers() {
        let empty = SliceDataPacket::empty(1, 2);
        assert!(empty.is_empty());
        assert!(empty.is_consistent());

        let reply = SliceReply::zeros([2, 2]);
        let packet = SliceDataPacket::from_reply(1, 2, reply.clone());
        assert!(packet.is_final);
        assert_eq!(packet.into_reply(), reply);

        let Packet::Projection(mut broken) = projection(0, FrameClass::Dark, 0, [2, 2], 0.0) else {
            panic!("expected projection");
        };
        broken.data.push(1.0);
        let slice = SliceDataPacket { scene_id: 0, slice_id: 0, shape: broken.shape, is_final: true, data: broken.data };
        assert!(!slice.is_consistent());
    }
}

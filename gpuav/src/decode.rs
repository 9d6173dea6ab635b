//! Typed view of error records.
//!
//! Records are decoded once into [`GpuError`] values, messages are produced
//! from those values only.

use crate::{
    join_u64, split_u64,
    wire::{
        bda_error, copy_error, descriptor_error, group, pre_dispatch_error,
        pre_draw_error, pre_trace_rays_error, ray_query_error, record, RecordHeader,
        HEADER_WORDS, PAYLOAD_WORDS, RECORD_WORDS,
    },
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Record of {len} words is shorter than its header")]
    Truncated { len: usize },

    #[error("Unknown error group {group}")]
    UnknownGroup { group: u32 },

    #[error("Unknown subcode {subcode} in error group {group}")]
    UnknownSubcode { group: u32, subcode: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorErrorKind {
    IndexOutOfBounds { length: u32 },
    Uninitialized,
    Destroyed,
    /// Access ends `end` bytes into a range of `size` bytes.
    BufferOutOfBounds { end: u32, size: u32 },
    TexelOutOfBounds { texel: u32, count: u32 },
}

impl DescriptorErrorKind {
    pub fn is_out_of_bounds(&self) -> bool {
        matches!(
            self,
            DescriptorErrorKind::BufferOutOfBounds { .. }
                | DescriptorErrorKind::TexelOutOfBounds { .. }
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorError {
    pub set: u32,
    pub binding: u32,
    pub index: u32,
    pub kind: DescriptorErrorKind,
}

/// Ray query argument problems. Floating point values keep their bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RayQueryError {
    NegativeMin { bits: u32 },
    NegativeMax { bits: u32 },
    BothSkip { flags: u32 },
    SkipCull { flags: u32 },
    Opaque { flags: u32 },
    MinMax { min_bits: u32, max_bits: u32 },
    MinNan,
    MaxNan,
    OriginNan,
    DirectionNan,
    OriginFinite,
    DirectionFinite,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn name(&self) -> &'static str {
        match self {
            Axis::X => "x",
            Axis::Y => "y",
            Axis::Z => "z",
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PreDrawError {
    /// `count` draws do not fit the buffer that holds `fit`.
    BufferSize { count: u32, fit: u32 },
    CountLimit { count: u32 },
    FirstInstance { draw: u32, first_instance: u32 },
    GroupCount { axis: Axis, count: u32 },
    GroupCountTotal { total: u32 },
    /// Index range of `draw` ends at `end`, past the bound index buffer.
    IndexRange { draw: u32, end: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PreDispatchError {
    CountLimit { axis: Axis, count: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PreTraceRaysError {
    WidthLimit { value: u64 },
    HeightLimit { value: u64 },
    DepthLimit { value: u64 },
    VolumeLimit { value: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CopyBufferToImageError {
    DepthTexelRange { texel: u32, bits: u32, region: u32 },
}

/// Error found on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GpuError {
    Descriptor(DescriptorError),
    DeviceAddress { address: u64, size: u32, is_write: bool },
    RayQuery(RayQueryError),
    PreDraw(PreDrawError),
    PreDispatch(PreDispatchError),
    PreTraceRays(PreTraceRaysError),
    CopyBufferToImage(CopyBufferToImageError),
}

impl GpuError {
    pub fn group(&self) -> u32 {
        match self {
            GpuError::Descriptor(_) => group::DESCRIPTOR,
            GpuError::DeviceAddress { .. } => group::BUFFER_DEVICE_ADDRESS,
            GpuError::RayQuery(_) => group::RAY_QUERY,
            GpuError::PreDraw(_) => group::PRE_DRAW,
            GpuError::PreDispatch(_) => group::PRE_DISPATCH,
            GpuError::PreTraceRays(_) => group::PRE_TRACE_RAYS,
            GpuError::CopyBufferToImage(_) => group::COPY_BUFFER_TO_IMAGE,
        }
    }

    /// Subcode and payload words.
    pub fn encode(&self) -> (u32, [u32; PAYLOAD_WORDS]) {
        match *self {
            GpuError::Descriptor(DescriptorError {
                set,
                binding,
                index,
                kind,
            }) => {
                let (subcode, p0, p1) = match kind {
                    DescriptorErrorKind::IndexOutOfBounds { length } => {
                        (descriptor_error::INDEX_OUT_OF_BOUNDS, length, 0)
                    }
                    DescriptorErrorKind::Uninitialized => (descriptor_error::UNINITIALIZED, 0, 0),
                    DescriptorErrorKind::Destroyed => (descriptor_error::DESTROYED, 0, 0),
                    DescriptorErrorKind::BufferOutOfBounds { end, size } => {
                        (descriptor_error::BUFFER_OUT_OF_BOUNDS, end, size)
                    }
                    DescriptorErrorKind::TexelOutOfBounds { texel, count } => {
                        (descriptor_error::TEXEL_OUT_OF_BOUNDS, texel, count)
                    }
                };
                (subcode, [set, binding, index, p0, p1])
            }
            GpuError::DeviceAddress {
                address,
                size,
                is_write,
            } => {
                let [lo, hi] = split_u64(address);
                (bda_error::UNALLOCATED, [lo, hi, size, is_write as u32, 0])
            }
            GpuError::RayQuery(error) => {
                let (subcode, p0, p1) = match error {
                    RayQueryError::NegativeMin { bits } => (ray_query_error::NEGATIVE_MIN, bits, 0),
                    RayQueryError::NegativeMax { bits } => (ray_query_error::NEGATIVE_MAX, bits, 0),
                    RayQueryError::BothSkip { flags } => (ray_query_error::BOTH_SKIP, flags, 0),
                    RayQueryError::SkipCull { flags } => (ray_query_error::SKIP_CULL, flags, 0),
                    RayQueryError::Opaque { flags } => (ray_query_error::OPAQUE, flags, 0),
                    RayQueryError::MinMax { min_bits, max_bits } => {
                        (ray_query_error::MIN_MAX, min_bits, max_bits)
                    }
                    RayQueryError::MinNan => (ray_query_error::MIN_NAN, 0, 0),
                    RayQueryError::MaxNan => (ray_query_error::MAX_NAN, 0, 0),
                    RayQueryError::OriginNan => (ray_query_error::ORIGIN_NAN, 0, 0),
                    RayQueryError::DirectionNan => (ray_query_error::DIRECTION_NAN, 0, 0),
                    RayQueryError::OriginFinite => (ray_query_error::ORIGIN_FINITE, 0, 0),
                    RayQueryError::DirectionFinite => (ray_query_error::DIRECTION_FINITE, 0, 0),
                };
                (subcode, [p0, p1, 0, 0, 0])
            }
            GpuError::PreDraw(error) => {
                let (subcode, p0, p1) = match error {
                    PreDrawError::BufferSize { count, fit } => {
                        (pre_draw_error::BUFFER_SIZE, count, fit)
                    }
                    PreDrawError::CountLimit { count } => (pre_draw_error::COUNT_LIMIT, count, 0),
                    PreDrawError::FirstInstance {
                        draw,
                        first_instance,
                    } => (pre_draw_error::FIRST_INSTANCE, draw, first_instance),
                    PreDrawError::GroupCount { axis, count } => {
                        let subcode = match axis {
                            Axis::X => pre_draw_error::GROUP_COUNT_X,
                            Axis::Y => pre_draw_error::GROUP_COUNT_Y,
                            Axis::Z => pre_draw_error::GROUP_COUNT_Z,
                        };
                        (subcode, count, 0)
                    }
                    PreDrawError::GroupCountTotal { total } => {
                        (pre_draw_error::GROUP_COUNT_TOTAL, total, 0)
                    }
                    PreDrawError::IndexRange { draw, end } => {
                        (pre_draw_error::INDEX_RANGE, draw, end)
                    }
                };
                (subcode, [p0, p1, 0, 0, 0])
            }
            GpuError::PreDispatch(PreDispatchError::CountLimit { axis, count }) => {
                let subcode = match axis {
                    Axis::X => pre_dispatch_error::COUNT_LIMIT_X,
                    Axis::Y => pre_dispatch_error::COUNT_LIMIT_Y,
                    Axis::Z => pre_dispatch_error::COUNT_LIMIT_Z,
                };
                (subcode, [count, 0, 0, 0, 0])
            }
            GpuError::PreTraceRays(error) => {
                let (subcode, value) = match error {
                    PreTraceRaysError::WidthLimit { value } => {
                        (pre_trace_rays_error::WIDTH_LIMIT, value)
                    }
                    PreTraceRaysError::HeightLimit { value } => {
                        (pre_trace_rays_error::HEIGHT_LIMIT, value)
                    }
                    PreTraceRaysError::DepthLimit { value } => {
                        (pre_trace_rays_error::DEPTH_LIMIT, value)
                    }
                    PreTraceRaysError::VolumeLimit { value } => {
                        (pre_trace_rays_error::VOLUME_LIMIT, value)
                    }
                };
                let [lo, hi] = split_u64(value);
                (subcode, [lo, hi, 0, 0, 0])
            }
            GpuError::CopyBufferToImage(CopyBufferToImageError::DepthTexelRange {
                texel,
                bits,
                region,
            }) => (copy_error::DEPTH_TEXEL_RANGE, [texel, bits, region, 0, 0]),
        }
    }

    pub fn decode(group: u32, subcode: u32, p: &[u32; PAYLOAD_WORDS]) -> Result<Self, DecodeError> {
        let unknown = || DecodeError::UnknownSubcode { group, subcode };

        let error = match group {
            group::DESCRIPTOR => {
                let kind = match subcode {
                    descriptor_error::INDEX_OUT_OF_BOUNDS => {
                        DescriptorErrorKind::IndexOutOfBounds { length: p[3] }
                    }
                    descriptor_error::UNINITIALIZED => DescriptorErrorKind::Uninitialized,
                    descriptor_error::DESTROYED => DescriptorErrorKind::Destroyed,
                    descriptor_error::BUFFER_OUT_OF_BOUNDS => {
                        DescriptorErrorKind::BufferOutOfBounds { end: p[3], size: p[4] }
                    }
                    descriptor_error::TEXEL_OUT_OF_BOUNDS => {
                        DescriptorErrorKind::TexelOutOfBounds {
                            texel: p[3],
                            count: p[4],
                        }
                    }
                    _ => return Err(unknown()),
                };
                GpuError::Descriptor(DescriptorError {
                    set: p[0],
                    binding: p[1],
                    index: p[2],
                    kind,
                })
            }
            group::BUFFER_DEVICE_ADDRESS => match subcode {
                bda_error::UNALLOCATED => GpuError::DeviceAddress {
                    address: join_u64(p[0], p[1]),
                    size: p[2],
                    is_write: p[3] != 0,
                },
                _ => return Err(unknown()),
            },
            group::RAY_QUERY => GpuError::RayQuery(match subcode {
                ray_query_error::NEGATIVE_MIN => RayQueryError::NegativeMin { bits: p[0] },
                ray_query_error::NEGATIVE_MAX => RayQueryError::NegativeMax { bits: p[0] },
                ray_query_error::BOTH_SKIP => RayQueryError::BothSkip { flags: p[0] },
                ray_query_error::SKIP_CULL => RayQueryError::SkipCull { flags: p[0] },
                ray_query_error::OPAQUE => RayQueryError::Opaque { flags: p[0] },
                ray_query_error::MIN_MAX => RayQueryError::MinMax {
                    min_bits: p[0],
                    max_bits: p[1],
                },
                ray_query_error::MIN_NAN => RayQueryError::MinNan,
                ray_query_error::MAX_NAN => RayQueryError::MaxNan,
                ray_query_error::ORIGIN_NAN => RayQueryError::OriginNan,
                ray_query_error::DIRECTION_NAN => RayQueryError::DirectionNan,
                ray_query_error::ORIGIN_FINITE => RayQueryError::OriginFinite,
                ray_query_error::DIRECTION_FINITE => RayQueryError::DirectionFinite,
                _ => return Err(unknown()),
            }),
            group::PRE_DRAW => GpuError::PreDraw(match subcode {
                pre_draw_error::BUFFER_SIZE => PreDrawError::BufferSize {
                    count: p[0],
                    fit: p[1],
                },
                pre_draw_error::COUNT_LIMIT => PreDrawError::CountLimit { count: p[0] },
                pre_draw_error::FIRST_INSTANCE => PreDrawError::FirstInstance {
                    draw: p[0],
                    first_instance: p[1],
                },
                pre_draw_error::GROUP_COUNT_X => PreDrawError::GroupCount {
                    axis: Axis::X,
                    count: p[0],
                },
                pre_draw_error::GROUP_COUNT_Y => PreDrawError::GroupCount {
                    axis: Axis::Y,
                    count: p[0],
                },
                pre_draw_error::GROUP_COUNT_Z => PreDrawError::GroupCount {
                    axis: Axis::Z,
                    count: p[0],
                },
                pre_draw_error::GROUP_COUNT_TOTAL => PreDrawError::GroupCountTotal { total: p[0] },
                pre_draw_error::INDEX_RANGE => PreDrawError::IndexRange {
                    draw: p[0],
                    end: p[1],
                },
                _ => return Err(unknown()),
            }),
            group::PRE_DISPATCH => {
                let axis = match subcode {
                    pre_dispatch_error::COUNT_LIMIT_X => Axis::X,
                    pre_dispatch_error::COUNT_LIMIT_Y => Axis::Y,
                    pre_dispatch_error::COUNT_LIMIT_Z => Axis::Z,
                    _ => return Err(unknown()),
                };
                GpuError::PreDispatch(PreDispatchError::CountLimit { axis, count: p[0] })
            }
            group::PRE_TRACE_RAYS => {
                let value = join_u64(p[0], p[1]);
                GpuError::PreTraceRays(match subcode {
                    pre_trace_rays_error::WIDTH_LIMIT => PreTraceRaysError::WidthLimit { value },
                    pre_trace_rays_error::HEIGHT_LIMIT => PreTraceRaysError::HeightLimit { value },
                    pre_trace_rays_error::DEPTH_LIMIT => PreTraceRaysError::DepthLimit { value },
                    pre_trace_rays_error::VOLUME_LIMIT => PreTraceRaysError::VolumeLimit { value },
                    _ => return Err(unknown()),
                })
            }
            group::COPY_BUFFER_TO_IMAGE => match subcode {
                copy_error::DEPTH_TEXEL_RANGE => {
                    GpuError::CopyBufferToImage(CopyBufferToImageError::DepthTexelRange {
                        texel: p[0],
                        bits: p[1],
                        region: p[2],
                    })
                }
                _ => return Err(unknown()),
            },
            _ => return Err(DecodeError::UnknownGroup { group }),
        };
        Ok(error)
    }

    /// Out of bounds accesses robustness may make well-defined.
    pub fn is_out_of_bounds(&self) -> bool {
        match self {
            GpuError::Descriptor(error) => error.kind.is_out_of_bounds(),
            _ => false,
        }
    }

    /// Written by the validator's own pipelines rather than application
    /// shaders.
    pub fn is_pre_action(&self) -> bool {
        matches!(
            self,
            GpuError::PreDraw(_)
                | GpuError::PreDispatch(_)
                | GpuError::PreTraceRays(_)
                | GpuError::CopyBufferToImage(_)
        )
    }
}

/// Decoded error record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ErrorRecord {
    pub header: RecordHeader,
    pub error: GpuError,
}

impl ErrorRecord {
    pub fn decode(words: &[u32]) -> Result<Self, DecodeError> {
        let header = RecordHeader::decode(words).ok_or(DecodeError::Truncated { len: words.len() })?;

        let mut payload = [0; PAYLOAD_WORDS];
        let available = words.len().min(RECORD_WORDS).saturating_sub(HEADER_WORDS);
        payload[..available].copy_from_slice(&words[record::PAYLOAD..record::PAYLOAD + available]);

        let error = GpuError::decode(header.group, header.subcode, &payload)?;
        Ok(ErrorRecord { header, error })
    }

    pub fn encode(&self) -> [u32; RECORD_WORDS] {
        let (subcode, payload) = self.error.encode();
        let header = RecordHeader {
            group: self.error.group(),
            subcode,
            ..self.header
        };
        header.encode(&payload)
    }
}

/// Walks records of the output buffer data region.
///
/// Stops at a zero size word, at a size smaller than a header and at a record
/// that would run past `min(written, data.len())`.
pub fn walk_records(data: &[u32], written: u32) -> impl Iterator<Item = &[u32]> + '_ {
    let limit = (written as usize).min(data.len());
    let mut offset = 0;

    std::iter::from_fn(move || {
        let size = *data.get(offset)? as usize;
        if offset >= limit || size < HEADER_WORDS {
            return None;
        }
        let end = offset.checked_add(size)?;
        if end > limit {
            tracing::warn!(
                "Error record at word {} of {} words runs past written data",
                offset,
                size
            );
            return None;
        }
        let words = &data[offset..end];
        offset = end;
        Some(words)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_errors() -> Vec<GpuError> {
        vec![
            GpuError::Descriptor(DescriptorError {
                set: 1,
                binding: 2,
                index: 7,
                kind: DescriptorErrorKind::BufferOutOfBounds { end: 260, size: 256 },
            }),
            GpuError::DeviceAddress {
                address: 0x1_0000_0040,
                size: 16,
                is_write: true,
            },
            GpuError::RayQuery(RayQueryError::MinMax {
                min_bits: 2.0f32.to_bits(),
                max_bits: 1.0f32.to_bits(),
            }),
            GpuError::PreDraw(PreDrawError::GroupCount {
                axis: Axis::Y,
                count: 70000,
            }),
            GpuError::PreTraceRays(PreTraceRaysError::VolumeLimit { value: 1 << 40 }),
            GpuError::CopyBufferToImage(CopyBufferToImageError::DepthTexelRange {
                texel: 3,
                bits: 1.5f32.to_bits(),
                region: 1,
            }),
        ]
    }

    #[test]
    fn records_keep_parameters() {
        for error in sample_errors() {
            let record = ErrorRecord {
                header: RecordHeader {
                    shader_id: 9,
                    instruction: 120,
                    resource_index: 4,
                    ..RecordHeader::default()
                },
                error,
            };
            let decoded = ErrorRecord::decode(&record.encode()).unwrap();
            assert_eq!(decoded.error, error);
            assert_eq!(decoded.header.shader_id, 9);
            assert_eq!(decoded.header.instruction, 120);
            assert_eq!(decoded.header.resource_index, 4);
            assert_eq!(decoded.header.group, error.group());
        }
    }

    #[test]
    fn unknown_codes() {
        let payload = [0; PAYLOAD_WORDS];
        assert_eq!(
            GpuError::decode(99, 1, &payload),
            Err(DecodeError::UnknownGroup { group: 99 })
        );
        assert_eq!(
            GpuError::decode(group::PRE_DISPATCH, 17, &payload),
            Err(DecodeError::UnknownSubcode {
                group: group::PRE_DISPATCH,
                subcode: 17
            })
        );
    }

    #[test]
    fn walk_stops_at_zero_size_and_overrun() {
        let record = RecordHeader::pre_action(0, 0, group::PRE_DRAW, 1).encode(&[]);
        let mut data = Vec::new();
        data.extend_from_slice(&record);
        data.extend_from_slice(&record);
        data.extend_from_slice(&[0; RECORD_WORDS]);

        assert_eq!(walk_records(&data, data.len() as u32).count(), 2);

        // Counter claims more than the buffer holds.
        assert_eq!(walk_records(&data[..RECORD_WORDS + 3], 1000).count(), 1);

        // Counter bounds the walk.
        assert_eq!(walk_records(&data, RECORD_WORDS as u32).count(), 1);
        assert_eq!(walk_records(&data, 0).count(), 0);
    }

    #[test]
    fn walk_rejects_tiny_records() {
        let data = [3, 1, 2, 3, 4, 5];
        assert_eq!(walk_records(&data, 6).count(), 0);
    }
}

//! Layouts of buffers shared between the validator and the GPU.
//!
//! Everything here is `u32` words. Instrumented shaders, validation pipelines
//! and the host decoder agree on these numbers.

use bytemuck::{Pod, Zeroable};

/// Words in one error record.
pub const RECORD_WORDS: usize = 16;

/// Words before the payload.
pub const HEADER_WORDS: usize = 11;

pub const PAYLOAD_WORDS: usize = RECORD_WORDS - HEADER_WORDS;

/// Offsets within an error record.
pub mod record {
    pub const SIZE: usize = 0;
    pub const SHADER_ID: usize = 1;
    pub const INSTRUCTION: usize = 2;
    pub const STAGE_ID: usize = 3;
    pub const STAGE_INFO: usize = 4;
    pub const ACTION_INDEX: usize = 7;
    pub const RESOURCE_INDEX: usize = 8;
    pub const ERROR_GROUP: usize = 9;
    pub const ERROR_SUBCODE: usize = 10;
    pub const PAYLOAD: usize = 11;
}

/// Offsets within the error output buffer.
pub mod output {
    pub const FLAGS: usize = 0;
    pub const WRITTEN: usize = 1;
    pub const DATA: usize = 2;

    /// Instrumentation does its own bounds checking.
    pub const FLAG_BOUNDS_CHECKING: u32 = 0x1;
}

/// Error groups.
pub mod group {
    pub const DESCRIPTOR: u32 = 1;
    pub const BUFFER_DEVICE_ADDRESS: u32 = 2;
    pub const RAY_QUERY: u32 = 3;
    pub const PRE_DRAW: u32 = 4;
    pub const PRE_DISPATCH: u32 = 5;
    pub const PRE_TRACE_RAYS: u32 = 6;
    pub const COPY_BUFFER_TO_IMAGE: u32 = 7;
}

/// Descriptor error subcodes.
/// Payload: `[set, binding, index, param0, param1]`.
pub mod descriptor_error {
    /// `param0` is the array length.
    pub const INDEX_OUT_OF_BOUNDS: u32 = 1;
    pub const UNINITIALIZED: u32 = 2;
    pub const DESTROYED: u32 = 3;
    /// `param0` is the byte offset past the end, `param1` the range size.
    pub const BUFFER_OUT_OF_BOUNDS: u32 = 4;
    /// `param0` is the texel index, `param1` the texel count.
    pub const TEXEL_OUT_OF_BOUNDS: u32 = 5;
}

/// Buffer device address subcodes.
/// Payload: `[addressLo, addressHi, size, isWrite, 0]`.
pub mod bda_error {
    pub const UNALLOCATED: u32 = 1;
}

/// Ray query subcodes.
/// Payload: `[value, 0, 0, 0, 0]`, float values as bits.
pub mod ray_query_error {
    pub const NEGATIVE_MIN: u32 = 1;
    pub const NEGATIVE_MAX: u32 = 2;
    pub const BOTH_SKIP: u32 = 3;
    pub const SKIP_CULL: u32 = 4;
    pub const OPAQUE: u32 = 5;
    pub const MIN_MAX: u32 = 6;
    pub const MIN_NAN: u32 = 7;
    pub const MAX_NAN: u32 = 8;
    pub const ORIGIN_NAN: u32 = 9;
    pub const DIRECTION_NAN: u32 = 10;
    pub const ORIGIN_FINITE: u32 = 11;
    pub const DIRECTION_FINITE: u32 = 12;
}

/// Pre-draw subcodes. Payload: `[param0, param1, 0, 0, 0]`.
pub mod pre_draw_error {
    /// `param0` is the count, `param1` the number of draws the buffer fits.
    pub const BUFFER_SIZE: u32 = 1;
    /// `param0` is the count.
    pub const COUNT_LIMIT: u32 = 2;
    /// `param0` is the draw index, `param1` the first instance.
    pub const FIRST_INSTANCE: u32 = 3;
    /// `param0` is the group count.
    pub const GROUP_COUNT_X: u32 = 4;
    pub const GROUP_COUNT_Y: u32 = 5;
    pub const GROUP_COUNT_Z: u32 = 6;
    /// `param0` is the total group count.
    pub const GROUP_COUNT_TOTAL: u32 = 7;
    /// `param0` is the draw index, `param1` the end of the index range.
    pub const INDEX_RANGE: u32 = 8;
}

/// Pre-dispatch subcodes. Payload: `[groupCount, 0, 0, 0, 0]`.
pub mod pre_dispatch_error {
    pub const COUNT_LIMIT_X: u32 = 1;
    pub const COUNT_LIMIT_Y: u32 = 2;
    pub const COUNT_LIMIT_Z: u32 = 3;
}

/// Pre-trace-rays subcodes. Payload: `[valueLo, valueHi, 0, 0, 0]`.
pub mod pre_trace_rays_error {
    pub const WIDTH_LIMIT: u32 = 1;
    pub const HEIGHT_LIMIT: u32 = 2;
    pub const DEPTH_LIMIT: u32 = 3;
    pub const VOLUME_LIMIT: u32 = 4;
}

/// Copy-buffer-to-image subcodes. Payload: `[texelIndex, valueBits, region, 0, 0]`.
pub mod copy_error {
    pub const DEPTH_TEXEL_RANGE: u32 = 1;
}

/// Descriptor class tags stored in the top bits of current state id words.
pub mod class {
    pub const SHIFT: u32 = 24;
    pub const ID_MASK: u32 = (1 << SHIFT) - 1;

    pub const BUFFER: u32 = 1;
    pub const TEXEL_BUFFER: u32 = 2;
    pub const IMAGE: u32 = 3;
    pub const SAMPLER: u32 = 4;
    pub const IMAGE_SAMPLER: u32 = 5;
    pub const ACCELERATION_STRUCTURE: u32 = 6;
    pub const INLINE_UNIFORM: u32 = 7;
}

/// Builds current state id word.
#[inline(always)]
pub fn id_word(class: u32, id: u32) -> u32 {
    debug_assert!(id <= class::ID_MASK);
    (class << class::SHIFT) | (id & class::ID_MASK)
}

/// Splits current state id word into class tag and id.
#[inline(always)]
pub fn split_id_word(word: u32) -> (u32, u32) {
    (word >> class::SHIFT, word & class::ID_MASK)
}

/// Offsets within the descriptor layout state buffer.
pub mod layout_state {
    pub const BINDING_COUNT: usize = 0;
    pub const BINDINGS: usize = 2;
    pub const BINDING_WORDS: usize = 2;
}

/// Bindings of the validation descriptor set.
pub mod validation_set {
    pub const OUTPUT: u32 = 0;
    pub const ERROR_COUNTS: u32 = 1;
    pub const COMMAND_INDICES: u32 = 2;
    pub const BINDLESS_STATE: u32 = 3;
    pub const BDA_TABLE: u32 = 4;
    pub const HEAP_BITMAP: u32 = 5;
    pub const BINDING_COUNT: u32 = 6;
}

/// Bindings of the pre-action parameter set.
pub mod action_set {
    /// Indirect parameters or copy source.
    pub const SOURCE: u32 = 0;
    /// Count buffer or index buffer.
    pub const AUX: u32 = 1;
    pub const BINDING_COUNT: u32 = 2;
}

/// Offsets within the bindless state buffer.
pub mod bindless_state {
    pub const HEAP_ADDRESS: usize = 0;
    pub const SET_COUNT: usize = 2;
    pub const SETS: usize = 3;

    /// `{layoutLo, layoutHi, stateLo, stateHi, outputLo, outputHi}`
    pub const SET_WORDS: usize = 6;
    pub const MAX_SETS: usize = 32;

    pub const WORDS: usize = SETS + SET_WORDS * MAX_SETS;
}

/// Descriptor set index the helper library is compiled against.
pub const PLACEHOLDER_DESCRIPTOR_SET: u32 = 7;

/// Highest validation slot used even on devices allowing more sets.
pub const MAX_VALIDATION_SLOT: u32 = 32;

/// Per-command entry of the command indices buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CommandIndices {
    pub action_index: u32,
    pub resource_index: u32,
    pub max_errors: u32,
    pub flags: u32,
}

/// Maximum validated commands in one command buffer.
pub const MAX_COMMANDS_PER_COMMAND_BUFFER: u32 = 8192;

/// Draw indirect parameter struct sizes in words.
pub mod draw_struct {
    pub const DRAW: u32 = 4;
    pub const DRAW_INDEXED: u32 = 5;
    pub const MESH: u32 = 3;

    pub const DRAW_FIRST_INSTANCE: usize = 3;
    pub const DRAW_INDEXED_INDEX_COUNT: usize = 0;
    pub const DRAW_INDEXED_FIRST_INDEX: usize = 2;
    pub const DRAW_INDEXED_FIRST_INSTANCE: usize = 4;
}

pub mod pre_draw_flags {
    pub const COUNT_BUFFER: u32 = 0x1;
    pub const CHECK_FIRST_INSTANCE: u32 = 0x2;
    pub const INDEXED: u32 = 0x4;
    pub const MESH: u32 = 0x8;
    pub const CHECK_INDEX_RANGE: u32 = 0x10;
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PreDrawPushConstants {
    pub flags: u32,
    pub draw_offset_words: u32,
    pub stride_words: u32,

    /// `drawCount` or `maxDrawCount` for count variants.
    pub draw_count: u32,
    pub count_offset_words: u32,
    pub max_draw_indirect_count: u32,
    pub buffer_fit_count: u32,
    pub struct_words: u32,
    pub index_buffer_elements: u32,
    pub group_count_limit: [u32; 3],
    pub group_total_limit: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PreDispatchPushConstants {
    pub offset_words: u32,
    pub limit: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PreTraceRaysPushConstants {
    pub address_lo: u32,
    pub address_hi: u32,
    pub limit: [u32; 3],
    pub max_invocations: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CopyBufferToImagePushConstants {
    pub offset_words: u32,
    /// Texels between rows in the source buffer.
    pub row_texels: u32,
    /// Rows between depth slices in the source buffer.
    pub image_rows: u32,
    pub region_index: u32,
    pub extent: [u32; 3],
    pub texel_stride_words: u32,
}

/// Error record header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct RecordHeader {
    pub shader_id: u32,
    pub instruction: u32,
    pub stage_id: u32,
    pub stage_info: [u32; 3],
    pub action_index: u32,
    pub resource_index: u32,
    pub group: u32,
    pub subcode: u32,
}

impl RecordHeader {
    /// Record written by the validator's own pipelines.
    pub fn pre_action(resource_index: u32, action_index: u32, group: u32, subcode: u32) -> Self {
        RecordHeader {
            action_index,
            resource_index,
            group,
            subcode,
            ..RecordHeader::default()
        }
    }

    pub fn encode(&self, payload: &[u32]) -> [u32; RECORD_WORDS] {
        assert!(payload.len() <= PAYLOAD_WORDS);
        let mut words = [0; RECORD_WORDS];
        words[record::SIZE] = RECORD_WORDS as u32;
        words[record::SHADER_ID] = self.shader_id;
        words[record::INSTRUCTION] = self.instruction;
        words[record::STAGE_ID] = self.stage_id;
        words[record::STAGE_INFO..record::STAGE_INFO + 3]
            .copy_from_slice(&self.stage_info);
        words[record::ACTION_INDEX] = self.action_index;
        words[record::RESOURCE_INDEX] = self.resource_index;
        words[record::ERROR_GROUP] = self.group;
        words[record::ERROR_SUBCODE] = self.subcode;
        words[record::PAYLOAD..record::PAYLOAD + payload.len()]
            .copy_from_slice(payload);
        words
    }

    /// Reads header from the start of a record.
    pub fn decode(words: &[u32]) -> Option<Self> {
        if words.len() < HEADER_WORDS {
            return None;
        }
        Some(RecordHeader {
            shader_id: words[record::SHADER_ID],
            instruction: words[record::INSTRUCTION],
            stage_id: words[record::STAGE_ID],
            stage_info: [
                words[record::STAGE_INFO],
                words[record::STAGE_INFO + 1],
                words[record::STAGE_INFO + 2],
            ],
            action_index: words[record::ACTION_INDEX],
            resource_index: words[record::RESOURCE_INDEX],
            group: words[record::ERROR_GROUP],
            subcode: words[record::ERROR_SUBCODE],
        })
    }
}

/// Appends records to an output buffer image the way shaders do:
/// the written counter always grows, records that do not fit are dropped.
pub struct OutputWriter<'a> {
    words: &'a mut [u32],
}

impl<'a> OutputWriter<'a> {
    pub fn new(words: &'a mut [u32]) -> Self {
        assert!(words.len() >= output::DATA);
        OutputWriter { words }
    }

    /// Returns whether the record was stored.
    pub fn append(&mut self, record: &[u32; RECORD_WORDS]) -> bool {
        let written = self.words[output::WRITTEN] as usize;
        self.words[output::WRITTEN] =
            self.words[output::WRITTEN].saturating_add(RECORD_WORDS as u32);

        let start = output::DATA + written;
        match self.words.get_mut(start..start + RECORD_WORDS) {
            Some(slot) => {
                slot.copy_from_slice(record);
                true
            }
            None => false,
        }
    }

    /// Same as `append` but counts errors of the command first and drops the
    /// record once `max_errors` were counted.
    pub fn append_limited(
        &mut self,
        error_counts: &mut [u32],
        max_errors: u32,
        record: &[u32; RECORD_WORDS],
    ) -> bool {
        let index = record[record::RESOURCE_INDEX] as usize;
        match error_counts.get_mut(index) {
            Some(count) => {
                let previous = *count;
                *count = count.saturating_add(1);
                if previous >= max_errors {
                    return false;
                }
            }
            None => return false,
        }
        self.append(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writer_drops_what_does_not_fit() {
        let mut buffer = vec![0u32; output::DATA + RECORD_WORDS + 4];
        let record = RecordHeader::pre_action(0, 0, group::PRE_DRAW, 1).encode(&[5]);
        let mut writer = OutputWriter::new(&mut buffer);
        assert!(writer.append(&record));
        assert!(!writer.append(&record));
        assert_eq!(buffer[output::WRITTEN], 2 * RECORD_WORDS as u32);
        assert_eq!(&buffer[output::DATA..output::DATA + RECORD_WORDS], &record[..]);
    }

    #[test]
    fn writer_limits_per_command() {
        let mut buffer = vec![0u32; output::DATA + 8 * RECORD_WORDS];
        let mut counts = vec![0u32; 2];
        let record = RecordHeader::pre_action(1, 0, group::PRE_DRAW, 1).encode(&[]);
        let mut writer = OutputWriter::new(&mut buffer);
        let stored = (0..5)
            .filter(|_| writer.append_limited(&mut counts, 3, &record))
            .count();
        assert_eq!(stored, 3);
        assert_eq!(counts, [0, 5]);
    }

    #[test]
    fn id_words() {
        let word = id_word(class::IMAGE_SAMPLER, 77);
        assert_eq!(split_id_word(word), (class::IMAGE_SAMPLER, 77));
        assert_eq!(split_id_word(0), (0, 0));
    }
}

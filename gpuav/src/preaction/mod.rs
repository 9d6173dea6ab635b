//! Validation commands injected in front of application commands.
//!
//! Each validator has two halves. The host half decides whether a command
//! needs checking and packs the parameters into push constants. The device
//! half is what the validation pipeline computes: it reads the parameters the
//! application left in GPU memory, compares them against limits and writes
//! error records. Device halves here are plain functions over words so
//! backends without a shader compiler can execute them.

mod copy;
mod dispatch;
mod draw;
mod trace_rays;

pub(crate) use self::{copy::*, dispatch::*, draw::*, trace_rays::*};

use {
    crate::{
        command::{Command, CommandSink, ShaderBindingTable},
        decode::GpuError,
        device::{
            RawDescriptorSet, RawPipeline, RawPipelineLayout,
            ValidationPipelineKind,
        },
        pipeline::{PipelineBindPoint, ShaderStageFlags},
        wire::{CommandIndices, OutputWriter, RecordHeader},
    },
    std::convert::TryFrom as _,
};

/// Number of whole parameter structs of `struct_size` bytes laid out with
/// `stride` starting at `offset` that fit a buffer of `buffer_size` bytes.
pub fn max_indirect_count(buffer_size: u64, offset: u64, struct_size: u64, stride: u64) -> u32 {
    let end = match offset.checked_add(struct_size) {
        Some(end) if end <= buffer_size => end,
        _ => return 0,
    };
    if stride == 0 {
        return 1;
    }
    let fit = (buffer_size - end) / stride + 1;
    u32::try_from(fit).unwrap_or(u32::MAX)
}

/// Destination of records written by validation pipelines.
pub struct ActionOutput<'a> {
    writer: OutputWriter<'a>,
    error_counts: &'a mut [u32],
    indices: CommandIndices,
}

impl<'a> ActionOutput<'a> {
    pub fn new(
        output: &'a mut [u32],
        error_counts: &'a mut [u32],
        indices: CommandIndices,
    ) -> Self {
        ActionOutput {
            writer: OutputWriter::new(output),
            error_counts,
            indices,
        }
    }

    /// Writes one record. Returns whether it was stored.
    pub fn report(&mut self, error: GpuError) -> bool {
        let (subcode, payload) = error.encode();
        let record = RecordHeader::pre_action(
            self.indices.resource_index,
            self.indices.action_index,
            error.group(),
            subcode,
        )
        .encode(&payload);
        self.writer
            .append_limited(self.error_counts, self.indices.max_errors, &record)
    }
}

/// Word `index` of a buffer, zero past the end like a robust device read.
#[inline(always)]
pub(crate) fn word(words: &[u32], index: u64) -> u32 {
    usize::try_from(index)
        .ok()
        .and_then(|index| words.get(index))
        .copied()
        .unwrap_or(0)
}

/// Minimal command that runs the validation pipeline once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Launch {
    /// Three vertices, one instance.
    Draw,
    /// One work group.
    Dispatch,
    /// One ray.
    TraceRays,
}

/// Bind point and launch of a validation pipeline.
pub(crate) fn action_target(kind: ValidationPipelineKind) -> (PipelineBindPoint, Launch) {
    match kind {
        ValidationPipelineKind::PreDraw => (PipelineBindPoint::Graphics, Launch::Draw),
        ValidationPipelineKind::PreDispatch => {
            (PipelineBindPoint::Compute, Launch::Dispatch)
        }
        ValidationPipelineKind::PreTraceRays => {
            (PipelineBindPoint::RayTracing, Launch::TraceRays)
        }
        ValidationPipelineKind::PreCopyBufferToImage => {
            (PipelineBindPoint::Compute, Launch::Dispatch)
        }
    }
}

/// Injected validation command.
#[derive(Debug)]
pub(crate) struct ActionRecording<'a> {
    pub bind_point: PipelineBindPoint,
    pub pipeline: RawPipeline,
    pub layout: RawPipelineLayout,
    pub validation_set: RawDescriptorSet,

    /// Parameter set, bound right after the validation set.
    pub action_set: Option<RawDescriptorSet>,
    pub push_constants: &'a [u8],
    pub launch: Launch,
}

impl ActionRecording<'_> {
    /// Binds the validation pipeline with its sets and constants and launches
    /// it. Application state must be restored by the caller.
    pub fn record(&self, sink: &mut dyn CommandSink) {
        sink.record(Command::BindPipeline {
            bind_point: self.bind_point,
            pipeline: self.pipeline,
        });

        let sets = [
            self.validation_set,
            self.action_set.unwrap_or(RawDescriptorSet::NULL),
        ];
        let count = if self.action_set.is_some() { 2 } else { 1 };
        sink.record(Command::BindDescriptorSets {
            bind_point: self.bind_point,
            layout: self.layout,
            first_set: 0,
            sets: &sets[..count],
            dynamic_offsets: &[],
        });

        if !self.push_constants.is_empty() {
            sink.record(Command::PushConstants {
                layout: self.layout,
                stages: launch_stages(self.launch),
                offset: 0,
                data: self.push_constants,
            });
        }

        match self.launch {
            Launch::Draw => sink.record(Command::Draw {
                vertices: 0..3,
                instances: 0..1,
            }),
            Launch::Dispatch => sink.record(Command::Dispatch {
                group_count: [1, 1, 1],
            }),
            Launch::TraceRays => sink.record(Command::TraceRays {
                shader_binding_table: &ShaderBindingTable::default(),
                extent: [1, 1, 1],
            }),
        }
    }
}

/// Stages the validation pipelines read push constants from.
pub(crate) fn launch_stages(launch: Launch) -> ShaderStageFlags {
    match launch {
        Launch::Draw => ShaderStageFlags::VERTEX,
        Launch::Dispatch => ShaderStageFlags::COMPUTE,
        Launch::TraceRays => ShaderStageFlags::RAYGEN,
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            decode::{ErrorRecord, PreDispatchError, Axis},
            wire::{output, RECORD_WORDS},
        },
    };

    #[test]
    fn buffer_fit_count() {
        // 64 byte buffer, 16 byte structs, stride 20.
        assert_eq!(max_indirect_count(64, 0, 16, 20), 3);
        assert_eq!(max_indirect_count(64, 8, 16, 20), 3);
        assert_eq!(max_indirect_count(64, 9, 16, 20), 2);
        assert_eq!(max_indirect_count(64, 48, 16, 20), 1);
        assert_eq!(max_indirect_count(64, 49, 16, 20), 0);
        assert_eq!(max_indirect_count(64, u64::MAX, 16, 20), 0);
        assert_eq!(max_indirect_count(64, 0, 16, 0), 1);
    }

    #[test]
    fn output_is_attributed_to_command() {
        let mut buffer = vec![0u32; output::DATA + 4 * RECORD_WORDS];
        let mut counts = vec![0u32; 4];
        let indices = CommandIndices {
            action_index: 1,
            resource_index: 2,
            max_errors: 1,
            flags: 0,
        };
        let error = GpuError::PreDispatch(PreDispatchError::CountLimit {
            axis: Axis::Y,
            count: 70000,
        });

        let mut out = ActionOutput::new(&mut buffer, &mut counts, indices);
        assert!(out.report(error));
        assert!(!out.report(error));

        assert_eq!(counts[2], 2);
        let record = ErrorRecord::decode(&buffer[output::DATA..]).unwrap();
        assert_eq!(record.error, error);
        assert_eq!(record.header.resource_index, 2);
        assert_eq!(record.header.action_index, 1);
        assert_eq!(record.header.shader_id, 0);
    }
}

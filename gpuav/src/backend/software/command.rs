use {
    crate::{
        command::{BufferImageCopy, Command, CommandSink, IndexType, ShaderBindingTable},
        descriptor::RawDescriptorWrite,
        device::{
            RawBuffer, RawDescriptorSet, RawImage, RawPipeline, RawPipelineLayout,
            RawRenderPass,
        },
        pipeline::{PipelineBindPoint, ShaderStageFlags},
        DeviceAddress,
    },
    std::{any::Any, ops::Range},
};

/// Owned copy of a [`Command`].
#[derive(Clone, Debug, PartialEq)]
pub enum Recorded {
    BeginRenderPass {
        pass: RawRenderPass,
    },
    EndRenderPass,
    BindPipeline {
        bind_point: PipelineBindPoint,
        pipeline: RawPipeline,
    },
    BindDescriptorSets {
        bind_point: PipelineBindPoint,
        layout: RawPipelineLayout,
        first_set: u32,
        sets: Vec<RawDescriptorSet>,
        dynamic_offsets: Vec<u32>,
    },
    PushDescriptorSet {
        bind_point: PipelineBindPoint,
        layout: RawPipelineLayout,
        set: u32,
        writes: Vec<RawDescriptorWrite>,
    },
    PushConstants {
        layout: RawPipelineLayout,
        stages: ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    BindIndexBuffer {
        buffer: RawBuffer,
        offset: u64,
        index_type: IndexType,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        vertex_offset: i32,
        instances: Range<u32>,
    },
    DrawIndirect {
        buffer: RawBuffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
        indexed: bool,
        mesh: bool,
    },
    DrawIndirectCount {
        buffer: RawBuffer,
        offset: u64,
        count_buffer: RawBuffer,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
        indexed: bool,
        mesh: bool,
    },
    Dispatch {
        group_count: [u32; 3],
    },
    DispatchIndirect {
        buffer: RawBuffer,
        offset: u64,
    },
    TraceRays {
        shader_binding_table: ShaderBindingTable,
        extent: [u32; 3],
    },
    TraceRaysIndirect {
        shader_binding_table: ShaderBindingTable,
        address: DeviceAddress,
    },
    CopyBufferToImage {
        src_buffer: RawBuffer,
        dst_image: RawImage,
        regions: Vec<BufferImageCopy>,
    },
    BeginDebugLabel {
        name: String,
    },
    EndDebugLabel,
}

impl Recorded {
    /// Bind point whose pipeline this command launches.
    pub fn launches(&self) -> Option<PipelineBindPoint> {
        match self {
            Recorded::Draw { .. }
            | Recorded::DrawIndexed { .. }
            | Recorded::DrawIndirect { .. }
            | Recorded::DrawIndirectCount { .. } => Some(PipelineBindPoint::Graphics),
            Recorded::Dispatch { .. } | Recorded::DispatchIndirect { .. } => {
                Some(PipelineBindPoint::Compute)
            }
            Recorded::TraceRays { .. } | Recorded::TraceRaysIndirect { .. } => {
                Some(PipelineBindPoint::RayTracing)
            }
            _ => None,
        }
    }
}

impl From<Command<'_>> for Recorded {
    fn from(command: Command<'_>) -> Self {
        match command {
            Command::BeginRenderPass { pass } => Recorded::BeginRenderPass { pass },
            Command::EndRenderPass => Recorded::EndRenderPass,
            Command::BindPipeline {
                bind_point,
                pipeline,
            } => Recorded::BindPipeline {
                bind_point,
                pipeline,
            },
            Command::BindDescriptorSets {
                bind_point,
                layout,
                first_set,
                sets,
                dynamic_offsets,
            } => Recorded::BindDescriptorSets {
                bind_point,
                layout,
                first_set,
                sets: sets.to_vec(),
                dynamic_offsets: dynamic_offsets.to_vec(),
            },
            Command::PushDescriptorSet {
                bind_point,
                layout,
                set,
                writes,
            } => Recorded::PushDescriptorSet {
                bind_point,
                layout,
                set,
                writes: writes.to_vec(),
            },
            Command::PushConstants {
                layout,
                stages,
                offset,
                data,
            } => Recorded::PushConstants {
                layout,
                stages,
                offset,
                data: data.to_vec(),
            },
            Command::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => Recorded::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            },
            Command::Draw {
                vertices,
                instances,
            } => Recorded::Draw {
                vertices,
                instances,
            },
            Command::DrawIndexed {
                indices,
                vertex_offset,
                instances,
            } => Recorded::DrawIndexed {
                indices,
                vertex_offset,
                instances,
            },
            Command::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => Recorded::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
                indexed: false,
                mesh: false,
            },
            Command::DrawIndexedIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => Recorded::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
                indexed: true,
                mesh: false,
            },
            Command::DrawMeshTasksIndirect {
                buffer,
                offset,
                draw_count,
                stride,
            } => Recorded::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
                indexed: false,
                mesh: true,
            },
            Command::DrawIndirectCount {
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                stride,
            } => Recorded::DrawIndirectCount {
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                stride,
                indexed: false,
                mesh: false,
            },
            Command::DrawIndexedIndirectCount {
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                stride,
            } => Recorded::DrawIndirectCount {
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                stride,
                indexed: true,
                mesh: false,
            },
            Command::DrawMeshTasksIndirectCount {
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                stride,
            } => Recorded::DrawIndirectCount {
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                stride,
                indexed: false,
                mesh: true,
            },
            Command::Dispatch { group_count } => Recorded::Dispatch { group_count },
            Command::DispatchIndirect { buffer, offset } => {
                Recorded::DispatchIndirect { buffer, offset }
            }
            Command::TraceRays {
                shader_binding_table,
                extent,
            } => Recorded::TraceRays {
                shader_binding_table: *shader_binding_table,
                extent,
            },
            Command::TraceRaysIndirect {
                shader_binding_table,
                address,
            } => Recorded::TraceRaysIndirect {
                shader_binding_table: *shader_binding_table,
                address,
            },
            Command::CopyBufferToImage {
                src_buffer,
                dst_image,
                regions,
            } => Recorded::CopyBufferToImage {
                src_buffer,
                dst_image,
                regions: regions.to_vec(),
            },
            Command::BeginDebugLabel { name } => Recorded::BeginDebugLabel {
                name: name.to_owned(),
            },
            Command::EndDebugLabel => Recorded::EndDebugLabel,
        }
    }
}

/// Command buffer of the software device. Keeps commands until reset.
#[derive(Debug, Default)]
pub struct SoftCommandBuffer {
    commands: Vec<Recorded>,
}

impl SoftCommandBuffer {
    pub fn new() -> Self {
        SoftCommandBuffer::default()
    }

    pub fn commands(&self) -> &[Recorded] {
        &self.commands
    }
}

impl CommandSink for SoftCommandBuffer {
    fn record(&mut self, command: Command<'_>) {
        tracing::trace!("Recording {:?}", command);
        self.commands.push(command.into());
    }

    fn reset(&mut self) {
        self.commands.clear();
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

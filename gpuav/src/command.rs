use {
    crate::{
        descriptor::RawDescriptorWrite,
        device::{
            RawBuffer, RawDescriptorSet, RawImage, RawPipeline,
            RawPipelineLayout, RawRenderPass,
        },
        pipeline::{PipelineBindPoint, ShaderStageFlags},
        DeviceAddress,
    },
    std::{any::Any, fmt::Debug, ops::Range},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size(&self) -> u64 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

/// Region of a shader binding table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct StridedDeviceRegion {
    pub address: u64,
    pub stride: u64,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct ShaderBindingTable {
    pub raygen: StridedDeviceRegion,
    pub miss: StridedDeviceRegion,
    pub hit: StridedDeviceRegion,
    pub callable: StridedDeviceRegion,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferImageCopy {
    pub buffer_offset: u64,

    /// `0` means tightly packed.
    pub buffer_row_length: u32,

    /// `0` means tightly packed.
    pub buffer_image_height: u32,
    pub image_offset: [i32; 3],
    pub image_extent: [u32; 3],
}

impl BufferImageCopy {
    /// Texels per row in the buffer.
    pub fn row_texels(&self) -> u32 {
        if self.buffer_row_length == 0 {
            self.image_extent[0]
        } else {
            self.buffer_row_length
        }
    }

    /// Rows per depth slice in the buffer.
    pub fn image_rows(&self) -> u32 {
        if self.buffer_image_height == 0 {
            self.image_extent[1]
        } else {
            self.buffer_image_height
        }
    }
}

/// Commands forwarded to the underlying command buffer.
///
/// The validator records application commands unchanged and interleaves its
/// own state changes and auxiliary draws, dispatches and ray traces.
#[derive(Debug)]
pub enum Command<'a> {
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
        sets: &'a [RawDescriptorSet],
        dynamic_offsets: &'a [u32],
    },

    PushDescriptorSet {
        bind_point: PipelineBindPoint,
        layout: RawPipelineLayout,
        set: u32,
        writes: &'a [RawDescriptorWrite],
    },

    PushConstants {
        layout: RawPipelineLayout,
        stages: ShaderStageFlags,
        offset: u32,
        data: &'a [u8],
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
    },

    DrawIndexedIndirect {
        buffer: RawBuffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },

    DrawIndirectCount {
        buffer: RawBuffer,
        offset: u64,
        count_buffer: RawBuffer,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    },

    DrawIndexedIndirectCount {
        buffer: RawBuffer,
        offset: u64,
        count_buffer: RawBuffer,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    },

    DrawMeshTasksIndirect {
        buffer: RawBuffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
    },

    DrawMeshTasksIndirectCount {
        buffer: RawBuffer,
        offset: u64,
        count_buffer: RawBuffer,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    },

    Dispatch {
        group_count: [u32; 3],
    },

    DispatchIndirect {
        buffer: RawBuffer,
        offset: u64,
    },

    TraceRays {
        shader_binding_table: &'a ShaderBindingTable,
        extent: [u32; 3],
    },

    TraceRaysIndirect {
        shader_binding_table: &'a ShaderBindingTable,
        address: DeviceAddress,
    },

    CopyBufferToImage {
        src_buffer: RawBuffer,
        dst_image: RawImage,
        regions: &'a [BufferImageCopy],
    },

    BeginDebugLabel {
        name: &'a str,
    },
    EndDebugLabel,
}

/// Command buffer of the underlying device.
pub trait CommandSink: Debug + Send + 'static {
    fn record(&mut self, command: Command<'_>);

    /// Drops all recorded commands.
    fn reset(&mut self);

    /// Allows queue implementations to reach their own command buffer type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

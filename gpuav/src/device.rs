use {
    crate::{
        buffer::{Buffer, BufferInfo},
        descriptor::{
            BufferDescriptorWrite, DescriptorSetLayoutBinding, DescriptorSizes,
        },
        pipeline::PushConstantRange,
        DeviceAddress, OutOfMemory,
    },
    std::{
        fmt::{self, Debug},
        sync::Arc,
    },
};

define_handle! {
    /// Buffer handle of the underlying device.
    pub struct RawBuffer;
}

define_handle! {
    pub struct RawBufferView;
}

define_handle! {
    pub struct RawImage;
}

define_handle! {
    pub struct RawImageView;
}

define_handle! {
    pub struct RawSampler;
}

define_handle! {
    pub struct RawAccelerationStructure;
}

define_handle! {
    pub struct RawDescriptorSetLayout;
}

define_handle! {
    pub struct RawDescriptorPool;
}

define_handle! {
    pub struct RawDescriptorSet;
}

define_handle! {
    pub struct RawPipelineLayout;
}

define_handle! {
    pub struct RawPipeline;
}

define_handle! {
    pub struct RawRenderPass;
}

define_handle! {
    pub struct RawShaderModule;
}

define_handle! {
    pub struct RawCommandBuffer;
}

/// Device limits the validator compares GPU-read parameters against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_bound_descriptor_sets: u32,
    pub max_draw_indirect_count: u32,
    pub max_compute_work_group_count: [u32; 3],
    pub max_compute_work_group_size: [u32; 3],
    pub max_task_work_group_count: [u32; 3],
    pub max_task_work_group_total_count: u32,
    pub max_mesh_work_group_count: [u32; 3],
    pub max_mesh_work_group_total_count: u32,
    pub max_ray_dispatch_invocation_count: u32,
    pub max_push_constants_size: u32,
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        DeviceLimits {
            max_bound_descriptor_sets: 8,
            max_draw_indirect_count: u32::MAX,
            max_compute_work_group_count: [65535; 3],
            max_compute_work_group_size: [1024, 1024, 64],
            max_task_work_group_count: [65535; 3],
            max_task_work_group_total_count: 1 << 22,
            max_mesh_work_group_count: [65535; 3],
            max_mesh_work_group_total_count: 1 << 22,
            max_ray_dispatch_invocation_count: 1 << 30,
            max_push_constants_size: 128,
            min_uniform_buffer_offset_alignment: 256,
            min_storage_buffer_offset_alignment: 256,
        }
    }
}

/// Enabled device features relevant to validation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub draw_indirect_first_instance: bool,
    pub buffer_device_address: bool,
    pub robust_buffer_access: bool,
    pub robust_buffer_access2: bool,
    pub null_descriptor: bool,
    pub ray_query: bool,
    pub ray_tracing_pipeline: bool,
    pub mesh_shader: bool,
    pub shader_int64: bool,
}

/// Fixed pipelines the validator injects in front of application commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValidationPipelineKind {
    PreDraw,
    PreDispatch,
    PreTraceRays,
    PreCopyBufferToImage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ValidationPipelineInfo {
    pub kind: ValidationPipelineKind,
    pub layout: RawPipelineLayout,

    /// Render pass for graphics pipelines.
    /// `None` for dynamic rendering and non-graphics kinds.
    pub render_pass: Option<RawRenderPass>,
}

#[derive(Debug, thiserror::Error)]
pub enum MapError {
    #[error("{source}")]
    OutOfMemory {
        #[from]
        source: OutOfMemory,
    },

    #[error("Buffer memory is not host visible")]
    NonHostVisible,

    #[error("Range {offset}..{end} is out of buffer {buffer:?} bounds")]
    OutOfBounds {
        buffer: RawBuffer,
        offset: u64,
        end: u64,
    },

    #[error("Buffer {buffer:?} is unknown to the device")]
    UnknownBuffer { buffer: RawBuffer },
}

#[derive(Debug, thiserror::Error)]
pub enum AllocateDescriptorSetError {
    #[error("{source}")]
    OutOfMemory {
        #[from]
        source: OutOfMemory,
    },

    #[error("Descriptor pool is exhausted")]
    PoolExhausted,
}

#[derive(Debug, thiserror::Error)]
pub enum CreatePipelineError {
    #[error("{source}")]
    OutOfMemory {
        #[from]
        source: OutOfMemory,
    },

    #[error("Validation pipeline {kind:?} is not supported by the device")]
    Unsupported { kind: ValidationPipelineKind },

    /// Implementation specific error.
    #[error("{source}")]
    Other {
        #[from]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Capabilities the validator needs from the underlying device.
///
/// Buffers created through this trait are host visible. Writes become
/// visible to the device before next submission, device writes become
/// visible to reads after the submission completes.
pub trait DeviceTrait: Debug + Send + Sync + 'static {
    fn limits(&self) -> &DeviceLimits;

    fn features(&self) -> &DeviceFeatures;

    fn create_buffer(&self, info: BufferInfo) -> Result<RawBuffer, OutOfMemory>;

    fn destroy_buffer(&self, buffer: RawBuffer);

    /// Returns address of a buffer created with `SHADER_DEVICE_ADDRESS`.
    fn buffer_address(&self, buffer: RawBuffer) -> Option<DeviceAddress>;

    fn write_buffer(
        &self,
        buffer: RawBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), MapError>;

    fn read_buffer(
        &self,
        buffer: RawBuffer,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), MapError>;

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<RawDescriptorSetLayout, OutOfMemory>;

    fn destroy_descriptor_set_layout(&self, layout: RawDescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        sets: &[RawDescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout, OutOfMemory>;

    fn destroy_pipeline_layout(&self, layout: RawPipelineLayout);

    fn create_descriptor_pool(
        &self,
        sizes: &DescriptorSizes,
        max_sets: u32,
    ) -> Result<RawDescriptorPool, OutOfMemory>;

    fn destroy_descriptor_pool(&self, pool: RawDescriptorPool);

    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        layout: RawDescriptorSetLayout,
    ) -> Result<RawDescriptorSet, AllocateDescriptorSetError>;

    fn free_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        set: RawDescriptorSet,
    );

    fn update_descriptor_set(
        &self,
        set: RawDescriptorSet,
        writes: &[BufferDescriptorWrite],
    );

    fn create_validation_pipeline(
        &self,
        info: ValidationPipelineInfo,
    ) -> Result<RawPipeline, CreatePipelineError>;

    fn destroy_pipeline(&self, pipeline: RawPipeline);
}

/// Opaque value that represents the underlying device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<dyn DeviceTrait>,
}

impl Debug for Device {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("Device")
                .field("inner", &&*self.inner)
                .finish()
        } else {
            fmt.write_str("Device")
        }
    }
}

impl Device {
    pub fn new(inner: Arc<impl DeviceTrait>) -> Self {
        Device { inner }
    }

    pub fn limits(&self) -> &DeviceLimits {
        self.inner.limits()
    }

    pub fn features(&self) -> &DeviceFeatures {
        self.inner.features()
    }

    /// Creates host visible buffer.
    /// Content is zero-filled.
    #[tracing::instrument]
    pub fn create_buffer(&self, info: BufferInfo) -> Result<Buffer, OutOfMemory> {
        assert!(info.size > 0, "Buffers cannot be empty");
        let raw = self.inner.create_buffer(info)?;
        let address = self.inner.buffer_address(raw);
        let buffer = Buffer::new(self.clone(), raw, info, address);
        if let Err(err) = buffer.fill_zero() {
            tracing::error!("Failed to initialize buffer: {:#}", err);
            return Err(OutOfMemory);
        }
        Ok(buffer)
    }

    /// Creates buffer initialized with `data`.
    #[tracing::instrument(skip(data))]
    pub fn create_buffer_with_words(
        &self,
        mut info: BufferInfo,
        data: &[u32],
    ) -> Result<Buffer, OutOfMemory> {
        info.size = info.size.max(4 * data.len() as u64).max(4);
        let buffer = self.create_buffer(info)?;
        if !data.is_empty() {
            buffer.write(0, data).map_err(|err| {
                tracing::error!("Failed to upload buffer: {:#}", err);
                OutOfMemory
            })?;
        }
        Ok(buffer)
    }

    /// Address of a buffer created with `SHADER_DEVICE_ADDRESS`.
    pub fn buffer_address(&self, buffer: RawBuffer) -> Option<DeviceAddress> {
        self.inner.buffer_address(buffer)
    }

    pub(crate) fn destroy_buffer(&self, buffer: RawBuffer) {
        self.inner.destroy_buffer(buffer)
    }

    pub(crate) fn write_buffer(
        &self,
        buffer: RawBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), MapError> {
        self.inner.write_buffer(buffer, offset, data)
    }

    pub(crate) fn read_buffer(
        &self,
        buffer: RawBuffer,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), MapError> {
        self.inner.read_buffer(buffer, offset, data)
    }

    #[tracing::instrument]
    pub fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<RawDescriptorSetLayout, OutOfMemory> {
        self.inner.create_descriptor_set_layout(bindings)
    }

    pub fn destroy_descriptor_set_layout(&self, layout: RawDescriptorSetLayout) {
        self.inner.destroy_descriptor_set_layout(layout)
    }

    #[tracing::instrument]
    pub fn create_pipeline_layout(
        &self,
        sets: &[RawDescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout, OutOfMemory> {
        self.inner.create_pipeline_layout(sets, push_constants)
    }

    pub fn destroy_pipeline_layout(&self, layout: RawPipelineLayout) {
        self.inner.destroy_pipeline_layout(layout)
    }

    #[tracing::instrument]
    pub(crate) fn create_descriptor_pool(
        &self,
        sizes: &DescriptorSizes,
        max_sets: u32,
    ) -> Result<RawDescriptorPool, OutOfMemory> {
        self.inner.create_descriptor_pool(sizes, max_sets)
    }

    pub(crate) fn destroy_descriptor_pool(&self, pool: RawDescriptorPool) {
        self.inner.destroy_descriptor_pool(pool)
    }

    pub(crate) fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        layout: RawDescriptorSetLayout,
    ) -> Result<RawDescriptorSet, AllocateDescriptorSetError> {
        self.inner.allocate_descriptor_set(pool, layout)
    }

    pub(crate) fn free_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        set: RawDescriptorSet,
    ) {
        self.inner.free_descriptor_set(pool, set)
    }

    pub(crate) fn update_descriptor_set(
        &self,
        set: RawDescriptorSet,
        writes: &[BufferDescriptorWrite],
    ) {
        self.inner.update_descriptor_set(set, writes)
    }

    #[tracing::instrument]
    pub(crate) fn create_validation_pipeline(
        &self,
        info: ValidationPipelineInfo,
    ) -> Result<RawPipeline, CreatePipelineError> {
        self.inner.create_validation_pipeline(info)
    }

    pub(crate) fn destroy_pipeline(&self, pipeline: RawPipeline) {
        self.inner.destroy_pipeline(pipeline)
    }
}

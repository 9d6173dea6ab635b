use {
    super::convert::{oom_error_from_erupt, out_of_host_memory, ToErupt as _},
    crate::{
        buffer::{BufferInfo, BufferUsage},
        descriptor::{BufferDescriptorWrite, DescriptorSetLayoutBinding, DescriptorSizes},
        device::*,
        pipeline::PushConstantRange,
        DeviceAddress, OutOfMemory,
    },
    erupt::{vk1_0, vk1_2, DeviceLoader},
    gpu_alloc::{GpuAllocator, MemoryBlock},
    gpu_alloc_erupt::EruptMemoryDevice,
    parking_lot::Mutex,
    smallvec::SmallVec,
    std::{
        collections::HashMap,
        ffi::CStr,
        fmt::{self, Debug},
        sync::Arc,
    },
};

/// SPIR-V of the validation pipelines.
/// Kinds without code are reported as unsupported.
#[derive(Clone, Debug, Default)]
pub struct ValidationShaders {
    /// Vertex shader with a single `main` entry point.
    pub pre_draw: Option<Vec<u32>>,

    /// Compute shaders with a single `main` entry point.
    pub pre_dispatch: Option<Vec<u32>>,
    pub pre_trace_rays: Option<Vec<u32>>,
    pub pre_copy_buffer_to_image: Option<Vec<u32>>,
}

impl ValidationShaders {
    fn get(&self, kind: ValidationPipelineKind) -> Option<&[u32]> {
        match kind {
            ValidationPipelineKind::PreDraw => self.pre_draw.as_deref(),
            ValidationPipelineKind::PreDispatch => self.pre_dispatch.as_deref(),
            ValidationPipelineKind::PreTraceRays => self.pre_trace_rays.as_deref(),
            ValidationPipelineKind::PreCopyBufferToImage => {
                self.pre_copy_buffer_to_image.as_deref()
            }
        }
    }
}

struct VulkanBuffer {
    block: MemoryBlock<vk1_0::DeviceMemory>,
    size: u64,
    address: Option<DeviceAddress>,
}

/// Vulkan device driven through erupt.
/// Memory for validator buffers comes from gpu-alloc.
pub struct VulkanDevice {
    logical: Arc<DeviceLoader>,
    limits: DeviceLimits,
    features: DeviceFeatures,
    allocator: Mutex<GpuAllocator<vk1_0::DeviceMemory>>,
    buffers: Mutex<HashMap<vk1_0::Buffer, VulkanBuffer>>,
    shaders: ValidationShaders,
}

impl Debug for VulkanDevice {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.logical.handle, fmt)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let memory_device = EruptMemoryDevice::wrap(&self.logical);
        let allocator = self.allocator.get_mut();
        for (handle, buffer) in self.buffers.get_mut().drain() {
            unsafe {
                self.logical.destroy_buffer(Some(handle), None);
                allocator.dealloc(memory_device, buffer.block);
            }
        }
        unsafe { allocator.cleanup(memory_device) }
    }
}

impl VulkanDevice {
    /// Wraps logical device.
    ///
    /// # Safety
    ///
    /// `memory` must describe the physical device `logical` was created
    /// from, and `features` must be a subset of features enabled on it.
    pub unsafe fn new(
        logical: Arc<DeviceLoader>,
        memory: &vk1_0::PhysicalDeviceMemoryProperties,
        core_limits: &vk1_0::PhysicalDeviceLimits,
        limits: DeviceLimits,
        features: DeviceFeatures,
        shaders: ValidationShaders,
    ) -> Self {
        let properties = gpu_alloc::DeviceProperties {
            max_memory_allocation_count: core_limits.max_memory_allocation_count,
            max_memory_allocation_size: u64::max_value(),
            non_coherent_atom_size: core_limits.non_coherent_atom_size,
            memory_types: memory.memory_types[..memory.memory_type_count as usize]
                .iter()
                .map(|memory_type| gpu_alloc::MemoryType {
                    props: gpu_alloc_erupt::memory_properties_from_erupt(
                        memory_type.property_flags,
                    ),
                    heap: memory_type.heap_index,
                })
                .collect(),
            memory_heaps: memory.memory_heaps[..memory.memory_heap_count as usize]
                .iter()
                .map(|&memory_heap| gpu_alloc::MemoryHeap {
                    size: memory_heap.size,
                })
                .collect(),
            buffer_device_address: features.buffer_device_address,
        };

        VulkanDevice {
            allocator: Mutex::new(GpuAllocator::new(
                gpu_alloc::Config::i_am_prototyping(),
                properties,
            )),
            buffers: Mutex::new(HashMap::new()),
            logical,
            limits,
            features,
            shaders,
        }
    }

    fn map_access<T>(
        &self,
        buffer: RawBuffer,
        offset: u64,
        len: usize,
        f: impl FnOnce(&mut MemoryBlock<vk1_0::DeviceMemory>) -> Result<T, gpu_alloc::MapError>,
    ) -> Result<T, MapError> {
        let mut buffers = self.buffers.lock();
        let entry = match buffers.get_mut(&vk1_0::Buffer(buffer.0)) {
            Some(entry) => entry,
            None => return Err(MapError::UnknownBuffer { buffer }),
        };

        let end = offset.checked_add(len as u64).unwrap_or(u64::max_value());
        if end > entry.size {
            return Err(MapError::OutOfBounds {
                buffer,
                offset,
                end,
            });
        }

        f(&mut entry.block).map_err(|err| match err {
            gpu_alloc::MapError::OutOfDeviceMemory => MapError::OutOfMemory {
                source: OutOfMemory,
            },
            gpu_alloc::MapError::OutOfHostMemory => out_of_host_memory(),
            gpu_alloc::MapError::NonHostVisible => MapError::NonHostVisible,
            gpu_alloc::MapError::MapFailed | gpu_alloc::MapError::AlreadyMapped => {
                tracing::error!("Failed to map buffer {:?}: {}", buffer, err);
                MapError::OutOfMemory {
                    source: OutOfMemory,
                }
            }
        })
    }

    unsafe fn create_shader_module(
        &self,
        code: &[u32],
    ) -> Result<vk1_0::ShaderModule, OutOfMemory> {
        self.logical
            .create_shader_module(
                &vk1_0::ShaderModuleCreateInfo::default()
                    .into_builder()
                    .code(code),
                None,
                None,
            )
            .result()
            .map_err(oom_error_from_erupt)
    }
}

const ENTRY: &[u8] = b"main\0";

impl DeviceTrait for VulkanDevice {
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn features(&self) -> &DeviceFeatures {
        &self.features
    }

    fn create_buffer(&self, info: BufferInfo) -> Result<RawBuffer, OutOfMemory> {
        let device_address = info.usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS);
        if device_address && !self.features.buffer_device_address {
            tracing::error!("Buffer device address feature is not enabled");
            return Err(OutOfMemory);
        }

        let handle = unsafe {
            self.logical.create_buffer(
                &vk1_0::BufferCreateInfo::default()
                    .into_builder()
                    .size(info.size)
                    .usage(info.usage.to_erupt())
                    .sharing_mode(vk1_0::SharingMode::EXCLUSIVE),
                None,
                None,
            )
        }
        .result()
        .map_err(oom_error_from_erupt)?;

        let reqs = unsafe { self.logical.get_buffer_memory_requirements(handle, None) };
        debug_assert!(reqs.alignment.is_power_of_two());

        let mut usage = gpu_alloc::UsageFlags::HOST_ACCESS
            | gpu_alloc::UsageFlags::UPLOAD
            | gpu_alloc::UsageFlags::DOWNLOAD;
        if device_address {
            usage |= gpu_alloc::UsageFlags::DEVICE_ADDRESS;
        }

        let block = unsafe {
            self.allocator.lock().alloc(
                EruptMemoryDevice::wrap(&self.logical),
                gpu_alloc::Request {
                    size: reqs.size,
                    align_mask: reqs.alignment - 1,
                    memory_types: reqs.memory_type_bits,
                    usage,
                },
            )
        }
        .map_err(|err| {
            unsafe { self.logical.destroy_buffer(Some(handle), None) }

            tracing::error!("{:#}", err);
            OutOfMemory
        })?;

        let result = unsafe {
            self.logical
                .bind_buffer_memory(handle, *block.memory(), block.offset())
        }
        .result();

        if let Err(err) = result {
            unsafe {
                self.logical.destroy_buffer(Some(handle), None);
                self.allocator
                    .lock()
                    .dealloc(EruptMemoryDevice::wrap(&self.logical), block);
            }
            return Err(oom_error_from_erupt(err));
        }

        let address = if device_address {
            DeviceAddress::new(unsafe {
                self.logical.get_buffer_device_address(
                    &vk1_2::BufferDeviceAddressInfo::default()
                        .into_builder()
                        .buffer(handle),
                )
            })
        } else {
            None
        };

        self.buffers.lock().insert(
            handle,
            VulkanBuffer {
                block,
                size: info.size,
                address,
            },
        );

        tracing::debug!("Buffer created {:?}", handle);
        Ok(RawBuffer(handle.0))
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        let handle = vk1_0::Buffer(buffer.0);
        match self.buffers.lock().remove(&handle) {
            Some(entry) => unsafe {
                self.logical.destroy_buffer(Some(handle), None);
                self.allocator
                    .lock()
                    .dealloc(EruptMemoryDevice::wrap(&self.logical), entry.block);
            },
            None => tracing::warn!("Destroying unknown buffer {:?}", buffer),
        }
    }

    fn buffer_address(&self, buffer: RawBuffer) -> Option<DeviceAddress> {
        self.buffers
            .lock()
            .get(&vk1_0::Buffer(buffer.0))
            .and_then(|entry| entry.address)
    }

    fn write_buffer(
        &self,
        buffer: RawBuffer,
        offset: u64,
        data: &[u8],
    ) -> Result<(), MapError> {
        let logical = &*self.logical;
        self.map_access(buffer, offset, data.len(), |block| unsafe {
            block.write_bytes(EruptMemoryDevice::wrap(logical), offset, data)
        })
    }

    fn read_buffer(
        &self,
        buffer: RawBuffer,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), MapError> {
        let logical = &*self.logical;
        let len = data.len();
        self.map_access(buffer, offset, len, |block| unsafe {
            block.read_bytes(EruptMemoryDevice::wrap(logical), offset, data)
        })
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<RawDescriptorSetLayout, OutOfMemory> {
        let bindings: SmallVec<[_; 8]> = bindings
            .iter()
            .map(|binding| {
                vk1_0::DescriptorSetLayoutBinding::default()
                    .into_builder()
                    .binding(binding.binding)
                    .descriptor_type(binding.ty.to_erupt())
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages.to_erupt())
            })
            .collect();

        let handle = unsafe {
            self.logical.create_descriptor_set_layout(
                &vk1_0::DescriptorSetLayoutCreateInfo::default()
                    .into_builder()
                    .bindings(&bindings),
                None,
                None,
            )
        }
        .result()
        .map_err(oom_error_from_erupt)?;

        Ok(RawDescriptorSetLayout(handle.0))
    }

    fn destroy_descriptor_set_layout(&self, layout: RawDescriptorSetLayout) {
        unsafe {
            self.logical.destroy_descriptor_set_layout(
                Some(vk1_0::DescriptorSetLayout(layout.0)),
                None,
            )
        }
    }

    fn create_pipeline_layout(
        &self,
        sets: &[RawDescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout, OutOfMemory> {
        let set_layouts: SmallVec<[_; 8]> = sets
            .iter()
            .map(|set| vk1_0::DescriptorSetLayout(set.0))
            .collect();

        let push_constant_ranges: SmallVec<[_; 4]> = push_constants
            .iter()
            .map(|range| {
                vk1_0::PushConstantRange::default()
                    .into_builder()
                    .stage_flags(range.stages.to_erupt())
                    .offset(range.offset)
                    .size(range.size)
            })
            .collect();

        let handle = unsafe {
            self.logical.create_pipeline_layout(
                &vk1_0::PipelineLayoutCreateInfo::default()
                    .into_builder()
                    .set_layouts(&set_layouts)
                    .push_constant_ranges(&push_constant_ranges),
                None,
                None,
            )
        }
        .result()
        .map_err(oom_error_from_erupt)?;

        Ok(RawPipelineLayout(handle.0))
    }

    fn destroy_pipeline_layout(&self, layout: RawPipelineLayout) {
        unsafe {
            self.logical
                .destroy_pipeline_layout(Some(vk1_0::PipelineLayout(layout.0)), None)
        }
    }

    fn create_descriptor_pool(
        &self,
        sizes: &DescriptorSizes,
        max_sets: u32,
    ) -> Result<RawDescriptorPool, OutOfMemory> {
        let pool_sizes: SmallVec<[_; 8]> = sizes
            .iter()
            .map(|(ty, count)| {
                vk1_0::DescriptorPoolSize::default()
                    .into_builder()
                    ._type(ty.to_erupt())
                    .descriptor_count(count)
            })
            .collect();

        let handle = unsafe {
            self.logical.create_descriptor_pool(
                &vk1_0::DescriptorPoolCreateInfo::default()
                    .into_builder()
                    .flags(vk1_0::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
                    .max_sets(max_sets)
                    .pool_sizes(&pool_sizes),
                None,
                None,
            )
        }
        .result()
        .map_err(oom_error_from_erupt)?;

        Ok(RawDescriptorPool(handle.0))
    }

    fn destroy_descriptor_pool(&self, pool: RawDescriptorPool) {
        unsafe {
            self.logical
                .destroy_descriptor_pool(Some(vk1_0::DescriptorPool(pool.0)), None)
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        layout: RawDescriptorSetLayout,
    ) -> Result<RawDescriptorSet, AllocateDescriptorSetError> {
        let set_layouts = [vk1_0::DescriptorSetLayout(layout.0)];
        let result = unsafe {
            self.logical.allocate_descriptor_sets(
                &vk1_0::DescriptorSetAllocateInfo::default()
                    .into_builder()
                    .descriptor_pool(vk1_0::DescriptorPool(pool.0))
                    .set_layouts(&set_layouts),
            )
        }
        .result();

        match result {
            Ok(sets) => match sets.first() {
                Some(set) => Ok(RawDescriptorSet(set.0)),
                None => Err(AllocateDescriptorSetError::PoolExhausted),
            },
            Err(vk1_0::Result::ERROR_OUT_OF_POOL_MEMORY)
            | Err(vk1_0::Result::ERROR_FRAGMENTED_POOL) => {
                Err(AllocateDescriptorSetError::PoolExhausted)
            }
            Err(err) => Err(oom_error_from_erupt(err).into()),
        }
    }

    fn free_descriptor_set(&self, pool: RawDescriptorPool, set: RawDescriptorSet) {
        let result = unsafe {
            self.logical.free_descriptor_sets(
                vk1_0::DescriptorPool(pool.0),
                &[vk1_0::DescriptorSet(set.0)],
            )
        }
        .result();

        if let Err(err) = result {
            tracing::error!("Failed to free descriptor set {:?}: {}", set, err);
        }
    }

    fn update_descriptor_set(&self, set: RawDescriptorSet, writes: &[BufferDescriptorWrite]) {
        let infos: SmallVec<[_; 8]> = writes
            .iter()
            .map(|write| {
                vk1_0::DescriptorBufferInfo::default()
                    .into_builder()
                    .buffer(vk1_0::Buffer(write.buffer.0))
                    .offset(write.offset)
                    .range(write.range)
            })
            .collect();

        let writes: SmallVec<[_; 8]> = writes
            .iter()
            .zip(&infos)
            .map(|(write, info)| {
                vk1_0::WriteDescriptorSet::default()
                    .into_builder()
                    .dst_set(vk1_0::DescriptorSet(set.0))
                    .dst_binding(write.binding)
                    .dst_array_element(0)
                    .descriptor_type(write.ty.to_erupt())
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();

        unsafe { self.logical.update_descriptor_sets(&writes, &[]) }
    }

    fn create_validation_pipeline(
        &self,
        info: ValidationPipelineInfo,
    ) -> Result<RawPipeline, CreatePipelineError> {
        let code = self
            .shaders
            .get(info.kind)
            .ok_or(CreatePipelineError::Unsupported { kind: info.kind })?;

        // Pre-draw checks run as a vertex shader with rasterization
        // discarded, which needs a render pass to be compatible with.
        let render_pass = match (info.kind, info.render_pass) {
            (ValidationPipelineKind::PreDraw, Some(render_pass)) => {
                Some(vk1_0::RenderPass(render_pass.0))
            }
            (ValidationPipelineKind::PreDraw, None) => {
                return Err(CreatePipelineError::Unsupported { kind: info.kind })
            }
            _ => None,
        };

        let module = unsafe { self.create_shader_module(code) }?;

        // Trailing nul is present.
        let entry = unsafe { CStr::from_bytes_with_nul_unchecked(ENTRY) };
        let layout = vk1_0::PipelineLayout(info.layout.0);

        let result = match render_pass {
            None => {
                unsafe {
                    self.logical.create_compute_pipelines(
                        None,
                        &[vk1_0::ComputePipelineCreateInfo::default()
                            .into_builder()
                            .stage(
                                vk1_0::PipelineShaderStageCreateInfo::default()
                                    .into_builder()
                                    .stage(vk1_0::ShaderStageFlagBits::COMPUTE)
                                    .module(module)
                                    .name(entry)
                                    .build(),
                            )
                            .layout(layout)],
                        None,
                    )
                }
            }
            Some(render_pass) => {
                let stages = [vk1_0::PipelineShaderStageCreateInfo::default()
                    .into_builder()
                    .stage(vk1_0::ShaderStageFlagBits::VERTEX)
                    .module(module)
                    .name(entry)];

                let vertex_input_state =
                    vk1_0::PipelineVertexInputStateCreateInfo::default().into_builder();

                let input_assembly_state =
                    vk1_0::PipelineInputAssemblyStateCreateInfo::default()
                        .into_builder()
                        .topology(vk1_0::PrimitiveTopology::POINT_LIST);

                let rasterization_state =
                    vk1_0::PipelineRasterizationStateCreateInfo::default()
                        .into_builder()
                        .rasterizer_discard_enable(true)
                        .line_width(1.0);

                unsafe {
                    self.logical.create_graphics_pipelines(
                        None,
                        &[vk1_0::GraphicsPipelineCreateInfo::default()
                            .into_builder()
                            .stages(&stages)
                            .vertex_input_state(&vertex_input_state)
                            .input_assembly_state(&input_assembly_state)
                            .rasterization_state(&rasterization_state)
                            .layout(layout)
                            .render_pass(render_pass)
                            .subpass(0)],
                        None,
                    )
                }
            }
        }
        .result();

        unsafe { self.logical.destroy_shader_module(Some(module), None) }

        let pipelines = result.map_err(oom_error_from_erupt)?;
        debug_assert_eq!(pipelines.len(), 1);

        match pipelines.first() {
            Some(pipeline) => {
                tracing::debug!("Validation pipeline {:?} created {:?}", info.kind, pipeline);
                Ok(RawPipeline(pipeline.0))
            }
            None => Err(CreatePipelineError::Other {
                source: format!("No pipeline returned for {:?}", info.kind).into(),
            }),
        }
    }

    fn destroy_pipeline(&self, pipeline: RawPipeline) {
        unsafe {
            self.logical
                .destroy_pipeline(Some(vk1_0::Pipeline(pipeline.0)), None)
        }
    }
}

/// Converts size of a descriptor range to the form Vulkan expects.
pub(super) fn whole_size(range: u64) -> vk1_0::DeviceSize {
    if range == u64::max_value() {
        vk1_0::WHOLE_SIZE
    } else {
        range
    }
}

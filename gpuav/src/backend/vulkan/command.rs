use {
    super::{
        convert::{oom_error_from_erupt, ToErupt as _},
        device::whole_size,
    },
    crate::{
        command::{Command, CommandSink},
        descriptor::{DescriptorType, RawDescriptor, RawDescriptorWrite},
        device::RawPipelineLayout,
        pipeline::PipelineBindPoint,
        OutOfMemory,
    },
    erupt::{
        extensions::khr_ray_tracing_pipeline as vkrt,
        vk1_0, DeviceLoader,
    },
    smallvec::SmallVec,
    std::{
        any::Any,
        fmt::{self, Debug},
        sync::Arc,
    },
};

/// Framebuffer and clear values for the next render pass begin.
#[derive(Clone, Debug)]
pub struct RenderPassTarget {
    pub framebuffer: vk1_0::Framebuffer,
    pub render_area: vk1_0::Rect2D,
    pub clear_values: Vec<vk1_0::ClearValue>,
}

/// Primary command buffer recorded through erupt.
///
/// Recording begins with the first command. Errors are deferred until
/// the command buffer is submitted.
pub struct VulkanCommandBuffer {
    logical: Arc<DeviceLoader>,
    handle: vk1_0::CommandBuffer,
    recording: bool,
    failed: Option<OutOfMemory>,
    render_pass_target: Option<RenderPassTarget>,
}

// Command buffer handle is externally synchronized by `&mut self`.
unsafe impl Send for VulkanCommandBuffer {}

impl Debug for VulkanCommandBuffer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.handle, fmt)
    }
}

impl VulkanCommandBuffer {
    /// Wraps command buffer allocated from a pool created with
    /// `RESET_COMMAND_BUFFER` flag.
    pub fn new(logical: Arc<DeviceLoader>, handle: vk1_0::CommandBuffer) -> Self {
        VulkanCommandBuffer {
            logical,
            handle,
            recording: false,
            failed: None,
            render_pass_target: None,
        }
    }

    /// Sets framebuffer used by following render pass begins.
    pub fn set_render_pass_target(&mut self, target: RenderPassTarget) {
        self.render_pass_target = Some(target);
    }

    /// Ends recording. Returns handle ready for submission.
    pub(super) fn finish(&mut self) -> Result<vk1_0::CommandBuffer, OutOfMemory> {
        if let Some(err) = self.failed {
            return Err(err);
        }

        self.ensure_recording()?;
        unsafe { self.logical.end_command_buffer(self.handle) }
            .result()
            .map_err(oom_error_from_erupt)?;

        self.recording = false;
        Ok(self.handle)
    }

    fn ensure_recording(&mut self) -> Result<(), OutOfMemory> {
        if !self.recording {
            unsafe {
                self.logical.begin_command_buffer(
                    self.handle,
                    &vk1_0::CommandBufferBeginInfo::default()
                        .into_builder()
                        .flags(vk1_0::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
            }
            .result()
            .map_err(oom_error_from_erupt)?;
            self.recording = true;
        }
        Ok(())
    }

    fn push_descriptor_set(
        &self,
        bind_point: PipelineBindPoint,
        layout: RawPipelineLayout,
        set: u32,
        writes: &[RawDescriptorWrite],
    ) {
        enum Infos {
            Images(SmallVec<[vk1_0::DescriptorImageInfoBuilder<'static>; 4]>),
            Buffers(SmallVec<[vk1_0::DescriptorBufferInfoBuilder<'static>; 4]>),
            TexelBuffers(SmallVec<[vk1_0::BufferView; 4]>),
        }

        let mut infos = Vec::with_capacity(writes.len());
        for write in writes {
            let image_layout = match write.ty {
                DescriptorType::StorageImage => vk1_0::ImageLayout::GENERAL,
                _ => vk1_0::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            };

            let info = match write.ty {
                DescriptorType::Sampler
                | DescriptorType::CombinedImageSampler
                | DescriptorType::SampledImage
                | DescriptorType::StorageImage
                | DescriptorType::InputAttachment => Infos::Images(
                    write
                        .descriptors
                        .iter()
                        .map(|descriptor| {
                            let builder = vk1_0::DescriptorImageInfo::default()
                                .into_builder()
                                .image_layout(image_layout);
                            match descriptor {
                                RawDescriptor::Sampler(sampler) => {
                                    builder.sampler(vk1_0::Sampler(sampler.0))
                                }
                                RawDescriptor::ImageSampler { view, sampler } => builder
                                    .image_view(vk1_0::ImageView(view.0))
                                    .sampler(vk1_0::Sampler(sampler.0)),
                                RawDescriptor::Image(view) => {
                                    builder.image_view(vk1_0::ImageView(view.0))
                                }
                                _ => builder,
                            }
                        })
                        .collect(),
                ),
                DescriptorType::UniformTexelBuffer | DescriptorType::StorageTexelBuffer => {
                    Infos::TexelBuffers(
                        write
                            .descriptors
                            .iter()
                            .map(|descriptor| match descriptor {
                                RawDescriptor::TexelBuffer(view) => vk1_0::BufferView(view.0),
                                _ => vk1_0::BufferView::null(),
                            })
                            .collect(),
                    )
                }
                DescriptorType::UniformBuffer
                | DescriptorType::StorageBuffer
                | DescriptorType::UniformBufferDynamic
                | DescriptorType::StorageBufferDynamic => Infos::Buffers(
                    write
                        .descriptors
                        .iter()
                        .map(|descriptor| match descriptor {
                            RawDescriptor::Buffer {
                                buffer,
                                offset,
                                range,
                            } => vk1_0::DescriptorBufferInfo::default()
                                .into_builder()
                                .buffer(vk1_0::Buffer(buffer.0))
                                .offset(*offset)
                                .range(whole_size(*range)),
                            _ => vk1_0::DescriptorBufferInfo::default()
                                .into_builder()
                                .range(vk1_0::WHOLE_SIZE),
                        })
                        .collect(),
                ),
                DescriptorType::AccelerationStructure | DescriptorType::InlineUniformBlock => {
                    tracing::warn!(
                        "Push descriptor write of {:?} at binding {} is not forwarded",
                        write.ty,
                        write.binding
                    );
                    continue;
                }
            };
            infos.push((write, info));
        }

        let writes: SmallVec<[_; 8]> = infos
            .iter()
            .map(|(write, info)| {
                let builder = vk1_0::WriteDescriptorSet::default()
                    .into_builder()
                    .dst_binding(write.binding)
                    .dst_array_element(write.element)
                    .descriptor_type(write.ty.to_erupt());
                match info {
                    Infos::Images(images) => builder.image_info(images),
                    Infos::Buffers(buffers) => builder.buffer_info(buffers),
                    Infos::TexelBuffers(views) => builder.texel_buffer_view(views),
                }
            })
            .collect();

        unsafe {
            self.logical.cmd_push_descriptor_set_khr(
                self.handle,
                bind_point.to_erupt(),
                vk1_0::PipelineLayout(layout.0),
                set,
                &writes,
            )
        }
    }
}

impl CommandSink for VulkanCommandBuffer {
    fn record(&mut self, command: Command<'_>) {
        if self.failed.is_some() {
            return;
        }
        if let Err(err) = self.ensure_recording() {
            tracing::error!("Failed to begin command buffer {:?}", self.handle);
            self.failed = Some(err);
            return;
        }

        let logical = &*self.logical;
        let handle = self.handle;

        unsafe {
            match command {
                Command::BeginRenderPass { pass } => match &self.render_pass_target {
                    Some(target) => logical.cmd_begin_render_pass(
                        handle,
                        &vk1_0::RenderPassBeginInfo::default()
                            .into_builder()
                            .render_pass(vk1_0::RenderPass(pass.0))
                            .framebuffer(target.framebuffer)
                            .render_area(target.render_area)
                            .clear_values(&target.clear_values),
                        vk1_0::SubpassContents::INLINE,
                    ),
                    None => {
                        tracing::error!("Render pass {:?} begins without framebuffer target", pass)
                    }
                },
                Command::EndRenderPass => logical.cmd_end_render_pass(handle),
                Command::BindPipeline {
                    bind_point,
                    pipeline,
                } => logical.cmd_bind_pipeline(
                    handle,
                    bind_point.to_erupt(),
                    vk1_0::Pipeline(pipeline.0),
                ),
                Command::BindDescriptorSets {
                    bind_point,
                    layout,
                    first_set,
                    sets,
                    dynamic_offsets,
                } => {
                    let sets: SmallVec<[_; 8]> = sets
                        .iter()
                        .map(|set| vk1_0::DescriptorSet(set.0))
                        .collect();
                    logical.cmd_bind_descriptor_sets(
                        handle,
                        bind_point.to_erupt(),
                        vk1_0::PipelineLayout(layout.0),
                        first_set,
                        &sets,
                        dynamic_offsets,
                    )
                }
                Command::PushDescriptorSet {
                    bind_point,
                    layout,
                    set,
                    writes,
                } => self.push_descriptor_set(bind_point, layout, set, writes),
                Command::PushConstants {
                    layout,
                    stages,
                    offset,
                    data,
                } => logical.cmd_push_constants(
                    handle,
                    vk1_0::PipelineLayout(layout.0),
                    stages.to_erupt(),
                    offset,
                    data.len() as u32,
                    data.as_ptr() as *const _,
                ),
                Command::BindIndexBuffer {
                    buffer,
                    offset,
                    index_type,
                } => logical.cmd_bind_index_buffer(
                    handle,
                    vk1_0::Buffer(buffer.0),
                    offset,
                    index_type.to_erupt(),
                ),
                Command::Draw {
                    vertices,
                    instances,
                } => logical.cmd_draw(
                    handle,
                    vertices.end - vertices.start,
                    instances.end - instances.start,
                    vertices.start,
                    instances.start,
                ),
                Command::DrawIndexed {
                    indices,
                    vertex_offset,
                    instances,
                } => logical.cmd_draw_indexed(
                    handle,
                    indices.end - indices.start,
                    instances.end - instances.start,
                    indices.start,
                    vertex_offset,
                    instances.start,
                ),
                Command::DrawIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => logical.cmd_draw_indirect(
                    handle,
                    vk1_0::Buffer(buffer.0),
                    offset,
                    draw_count,
                    stride,
                ),
                Command::DrawIndexedIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => logical.cmd_draw_indexed_indirect(
                    handle,
                    vk1_0::Buffer(buffer.0),
                    offset,
                    draw_count,
                    stride,
                ),
                Command::DrawIndirectCount {
                    buffer,
                    offset,
                    count_buffer,
                    count_offset,
                    max_draw_count,
                    stride,
                } => logical.cmd_draw_indirect_count(
                    handle,
                    vk1_0::Buffer(buffer.0),
                    offset,
                    vk1_0::Buffer(count_buffer.0),
                    count_offset,
                    max_draw_count,
                    stride,
                ),
                Command::DrawIndexedIndirectCount {
                    buffer,
                    offset,
                    count_buffer,
                    count_offset,
                    max_draw_count,
                    stride,
                } => logical.cmd_draw_indexed_indirect_count(
                    handle,
                    vk1_0::Buffer(buffer.0),
                    offset,
                    vk1_0::Buffer(count_buffer.0),
                    count_offset,
                    max_draw_count,
                    stride,
                ),
                Command::DrawMeshTasksIndirect {
                    buffer,
                    offset,
                    draw_count,
                    stride,
                } => logical.cmd_draw_mesh_tasks_indirect_nv(
                    handle,
                    vk1_0::Buffer(buffer.0),
                    offset,
                    draw_count,
                    stride,
                ),
                Command::DrawMeshTasksIndirectCount {
                    buffer,
                    offset,
                    count_buffer,
                    count_offset,
                    max_draw_count,
                    stride,
                } => logical.cmd_draw_mesh_tasks_indirect_count_nv(
                    handle,
                    vk1_0::Buffer(buffer.0),
                    offset,
                    vk1_0::Buffer(count_buffer.0),
                    count_offset,
                    max_draw_count,
                    stride,
                ),
                Command::Dispatch { group_count: [x, y, z] } => {
                    logical.cmd_dispatch(handle, x, y, z)
                }
                Command::DispatchIndirect { buffer, offset } => {
                    logical.cmd_dispatch_indirect(handle, vk1_0::Buffer(buffer.0), offset)
                }
                Command::TraceRays {
                    shader_binding_table,
                    extent: [width, height, depth],
                } => {
                    let regions: [vkrt::StridedDeviceAddressRegionKHR; 4] = [
                        shader_binding_table.raygen.to_erupt(),
                        shader_binding_table.miss.to_erupt(),
                        shader_binding_table.hit.to_erupt(),
                        shader_binding_table.callable.to_erupt(),
                    ];
                    logical.cmd_trace_rays_khr(
                        handle,
                        &regions[0],
                        &regions[1],
                        &regions[2],
                        &regions[3],
                        width,
                        height,
                        depth,
                    )
                }
                Command::TraceRaysIndirect {
                    shader_binding_table,
                    address,
                } => {
                    let regions: [vkrt::StridedDeviceAddressRegionKHR; 4] = [
                        shader_binding_table.raygen.to_erupt(),
                        shader_binding_table.miss.to_erupt(),
                        shader_binding_table.hit.to_erupt(),
                        shader_binding_table.callable.to_erupt(),
                    ];
                    logical.cmd_trace_rays_indirect_khr(
                        handle,
                        &regions[0],
                        &regions[1],
                        &regions[2],
                        &regions[3],
                        address.get(),
                    )
                }
                Command::CopyBufferToImage {
                    src_buffer,
                    dst_image,
                    regions,
                } => {
                    let regions: SmallVec<[_; 4]> = regions
                        .iter()
                        .map(|region| {
                            vk1_0::BufferImageCopy::default()
                                .into_builder()
                                .buffer_offset(region.buffer_offset)
                                .buffer_row_length(region.buffer_row_length)
                                .buffer_image_height(region.buffer_image_height)
                                .image_subresource(vk1_0::ImageSubresourceLayers {
                                    aspect_mask: vk1_0::ImageAspectFlags::COLOR,
                                    mip_level: 0,
                                    base_array_layer: 0,
                                    layer_count: 1,
                                })
                                .image_offset(vk1_0::Offset3D {
                                    x: region.image_offset[0],
                                    y: region.image_offset[1],
                                    z: region.image_offset[2],
                                })
                                .image_extent(vk1_0::Extent3D {
                                    width: region.image_extent[0],
                                    height: region.image_extent[1],
                                    depth: region.image_extent[2],
                                })
                        })
                        .collect();
                    logical.cmd_copy_buffer_to_image(
                        handle,
                        vk1_0::Buffer(src_buffer.0),
                        vk1_0::Image(dst_image.0),
                        vk1_0::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &regions,
                    )
                }
                // Labels only name regions in validator messages.
                Command::BeginDebugLabel { .. } | Command::EndDebugLabel => {}
            }
        }
    }

    fn reset(&mut self) {
        let result = unsafe {
            self.logical
                .reset_command_buffer(self.handle, vk1_0::CommandBufferResetFlags::empty())
        }
        .result();

        self.recording = false;
        self.failed = result.err().map(oom_error_from_erupt);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

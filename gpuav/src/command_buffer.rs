use {
    crate::{
        buffer::{Buffer, BufferInfo},
        command::{
            BufferImageCopy, Command, CommandSink, IndexType, ShaderBindingTable,
        },
        descriptor::{
            BufferDescriptorWrite, DescriptorSetLayoutState, DescriptorSetState,
            DescriptorSnapshot, DescriptorType, ManagedDescriptorSet,
            PushDescriptorWrite, RawDescriptorWrite,
        },
        device::{
            RawBuffer, RawDescriptorSet, RawImage, RawRenderPass,
            ValidationPipelineKind,
        },
        pipeline::{
            PipelineBindPoint, PipelineLayoutState, PipelineState, ShaderStageFlags,
        },
        preaction::{
            action_target, copy_buffer_to_image_constants, pre_dispatch_constants,
            pre_draw_constants, pre_trace_rays_constants, ActionRecording,
        },
        resource::{BufferState, CopyImageFormat},
        resources::{
            ActionInfo, ActionResources, CommandKind, CommandResources, IndirectDraw,
        },
        split_u64,
        validator::{ValidationObjects, Validator},
        wire::{
            bindless_state, output, validation_set, action_set, CommandIndices,
            MAX_COMMANDS_PER_COMMAND_BUFFER, RECORD_WORDS,
        },
        align_up, DeviceAddress, OutOfMemory,
    },
    parking_lot::Mutex,
    smallvec::SmallVec,
    std::{
        fmt::{self, Debug},
        ops::Range,
        sync::Arc,
    },
};

/// Command indices entries per indices buffer.
const INDICES_PER_CHUNK: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandBufferState {
    Idle,
    Recording,
    /// Recording ended, ready for submission.
    Executable,
    /// Submitted and not yet processed.
    Submitted,
    /// Error records of the last submission were reported.
    Processed,
}

#[derive(Debug, thiserror::Error)]
pub enum CommandBufferError {
    #[error("Command buffer is {state:?}, expected {expected:?}")]
    InvalidState {
        state: CommandBufferState,
        expected: CommandBufferState,
    },

    #[error("Command buffer is pending execution")]
    Pending,
}

/// Descriptor set bound by the application.
#[derive(Clone)]
pub(crate) struct BoundSet {
    pub state: Arc<DescriptorSetState>,

    /// Layout used to bind the set.
    pub layout: Arc<PipelineLayoutState>,
    pub dynamic_offsets: SmallVec<[u32; 4]>,

    /// Writes of a push descriptor set, replayed on restore.
    pub push_writes: Option<Arc<[RawDescriptorWrite]>>,
}

impl Debug for BoundSet {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("BoundSet")
            .field("state", &self.state)
            .field("layout", &self.layout)
            .field("dynamic_offsets", &self.dynamic_offsets)
            .field("push", &self.push_writes.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct LastBound {
    pipeline: Option<Arc<PipelineState>>,
    sets: Vec<Option<BoundSet>>,

    /// Descriptor binding entry of the current sets.
    binding: Option<usize>,
}

#[derive(Debug)]
struct PushConstantsData {
    layout: Arc<PipelineLayoutState>,
    stages: ShaderStageFlags,
    offset: u32,
    data: Vec<u8>,
}

/// Sets bound when a validated command was recorded.
pub(crate) struct DescriptorBinding {
    /// Indexed by set number.
    pub sets: Vec<Option<Arc<DescriptorSetState>>>,

    /// Filled at submission.
    pub bindless_state: Buffer,

    /// Snapshots the last submission referenced. Kept until reset.
    pub snapshots: Vec<Arc<DescriptorSnapshot>>,
}

impl Debug for DescriptorBinding {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("DescriptorBinding")
            .field("sets", &self.sets)
            .field("bindless_state", &self.bindless_state)
            .field("snapshots", &self.snapshots.len())
            .finish()
    }
}

impl DescriptorBinding {
    /// Serializes every bound set and fills the bindless state buffer.
    fn prepare(&mut self, heap_address: u64) -> Result<(), OutOfMemory> {
        let mut words = vec![0u32; bindless_state::WORDS];
        words[bindless_state::HEAP_ADDRESS..bindless_state::HEAP_ADDRESS + 2]
            .copy_from_slice(&split_u64(heap_address));
        words[bindless_state::SET_COUNT] = self.sets.len() as u32;

        self.snapshots.clear();
        for (index, set) in self.sets.iter().enumerate() {
            let set = match set {
                Some(set) => set,
                None => continue,
            };
            let snapshot = set.current_state()?;
            let output = set.output_state()?;
            let layout = set.layout_state()?;

            let at = bindless_state::SETS + index * bindless_state::SET_WORDS;
            words[at..at + 2].copy_from_slice(&split_u64(layout.address_value()));
            words[at + 2..at + 4]
                .copy_from_slice(&split_u64(snapshot.buffer().address_value()));
            words[at + 4..at + 6].copy_from_slice(&split_u64(output.address_value()));
            self.snapshots.push(snapshot);
        }

        self.bindless_state.write(0, &words).map_err(|err| {
            tracing::error!("Failed to upload bindless state: {:#}", err);
            OutOfMemory
        })
    }
}

/// Validation state of one command buffer.
pub(crate) struct CommandBufferInner {
    pub state: CommandBufferState,
    pub output: Option<Buffer>,
    pub error_counts: Option<Buffer>,
    indices: Vec<Buffer>,
    indices_stride: u64,
    pub resources: Vec<CommandResources>,
    pub bindings: Vec<DescriptorBinding>,
    operation_counts: [u32; PipelineBindPoint::COUNT + 1],
    action_count: u32,
    labels: Vec<String>,
    last_bound: [LastBound; PipelineBindPoint::COUNT],
    push_constants: Vec<PushConstantsData>,
    index_buffer: Option<(Arc<BufferState>, u64, IndexType)>,
    render_pass: Option<RawRenderPass>,
    overflow_warned: bool,
}

impl Debug for CommandBufferInner {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CommandBufferInner")
            .field("state", &self.state)
            .field("output", &self.output)
            .field("resources", &self.resources.len())
            .field("bindings", &self.bindings.len())
            .field("labels", &self.labels)
            .finish()
    }
}

impl CommandBufferInner {
    fn new(indices_stride: u64) -> Self {
        CommandBufferInner {
            state: CommandBufferState::Idle,
            output: None,
            error_counts: None,
            indices: Vec::new(),
            indices_stride,
            resources: Vec::new(),
            bindings: Vec::new(),
            operation_counts: [0; PipelineBindPoint::COUNT + 1],
            action_count: 0,
            labels: Vec::new(),
            last_bound: Default::default(),
            push_constants: Vec::new(),
            index_buffer: None,
            render_pass: None,
            overflow_warned: false,
        }
    }

    /// Drops everything recorded. Shared buffers are kept for reuse.
    fn clear(&mut self) {
        self.resources.clear();
        self.bindings.clear();
        self.operation_counts = [0; PipelineBindPoint::COUNT + 1];
        self.action_count = 0;
        self.labels.clear();
        self.last_bound = Default::default();
        self.push_constants.clear();
        self.index_buffer = None;
        self.render_pass = None;
        self.overflow_warned = false;
    }

    /// Output and error count buffers shared by all commands.
    fn ensure_buffers(&mut self, validator: &Validator) -> Result<(), OutOfMemory> {
        if self.output.is_none() {
            let records = validator.settings().output_buffer_records.max(1) as usize;
            let words = output::DATA + records * RECORD_WORDS;
            let buffer = validator
                .device()
                .create_buffer(BufferInfo::storage(4 * words as u64))?;

            let flags = if validator.settings().shader_instrumentation.descriptor_checks {
                output::FLAG_BOUNDS_CHECKING
            } else {
                0
            };
            buffer.write(4 * output::FLAGS as u64, &[flags]).map_err(|err| {
                tracing::error!("Failed to initialize output buffer: {:#}", err);
                OutOfMemory
            })?;
            self.output = Some(buffer);
        }

        if self.error_counts.is_none() {
            let size = 4 * u64::from(MAX_COMMANDS_PER_COMMAND_BUFFER);
            self.error_counts = Some(
                validator
                    .device()
                    .create_buffer(BufferInfo::storage(size))?,
            );
        }
        Ok(())
    }

    /// Writes indices entry of a command, returns buffer and offset.
    fn write_indices(
        &mut self,
        validator: &Validator,
        indices: CommandIndices,
    ) -> Result<(RawBuffer, u64), OutOfMemory> {
        let chunk = (indices.resource_index / INDICES_PER_CHUNK) as usize;
        let slot = u64::from(indices.resource_index % INDICES_PER_CHUNK);

        while self.indices.len() <= chunk {
            let size = self.indices_stride * u64::from(INDICES_PER_CHUNK);
            let buffer = validator.device().create_buffer(BufferInfo::uniform(size))?;
            self.indices.push(buffer);
        }

        let buffer = &self.indices[chunk];
        let offset = slot * self.indices_stride;
        buffer.write(offset, &[indices]).map_err(|err| {
            tracing::error!("Failed to write command indices: {:#}", err);
            OutOfMemory
        })?;
        Ok((buffer.raw(), offset))
    }

    /// Replays application state of `bind_point` after an injected command.
    fn restore(&self, bind_point: PipelineBindPoint, sink: &mut dyn CommandSink) {
        let bound = &self.last_bound[bind_point.index()];

        if let Some(pipeline) = &bound.pipeline {
            sink.record(Command::BindPipeline {
                bind_point,
                pipeline: pipeline.raw(),
            });
        }

        for (index, set) in bound.sets.iter().enumerate() {
            let set = match set {
                Some(set) => set,
                None => continue,
            };
            match &set.push_writes {
                Some(writes) => sink.record(Command::PushDescriptorSet {
                    bind_point,
                    layout: set.layout.raw(),
                    set: index as u32,
                    writes,
                }),
                None => sink.record(Command::BindDescriptorSets {
                    bind_point,
                    layout: set.layout.raw(),
                    first_set: index as u32,
                    sets: &[set.state.raw()],
                    dynamic_offsets: &set.dynamic_offsets,
                }),
            }
        }

        let layout = bound.pipeline.as_ref().map(|pipeline| pipeline.layout());
        for push in &self.push_constants {
            if layout.map_or(true, |layout| layout.push_constants_compatible(&push.layout)) {
                sink.record(Command::PushConstants {
                    layout: push.layout.raw(),
                    stages: push.stages,
                    offset: push.offset,
                    data: &push.data,
                });
            }
        }
    }

    /// Descriptor binding entry for commands at `bind_point`, creating one
    /// when sets changed since the last.
    fn descriptor_binding(
        &mut self,
        validator: &Validator,
        bind_point: PipelineBindPoint,
    ) -> Result<usize, OutOfMemory> {
        let bound = &mut self.last_bound[bind_point.index()];
        if let Some(index) = bound.binding {
            return Ok(index);
        }

        let sets = bound
            .sets
            .iter()
            .take(bindless_state::MAX_SETS)
            .map(|set| set.as_ref().map(|set| set.state.clone()))
            .collect();

        let bindless_state = validator.device().create_buffer(BufferInfo::storage(
            4 * bindless_state::WORDS as u64,
        ))?;

        let index = self.bindings.len();
        bound.binding = Some(index);
        self.bindings.push(DescriptorBinding {
            sets,
            bindless_state,
            snapshots: Vec::new(),
        });
        Ok(index)
    }

    /// Refreshes GPU visible state before submission.
    pub(crate) fn pre_submit(&mut self, validator: &Validator) -> Result<(), OutOfMemory> {
        let heap_address = validator
            .heap()
            .bitmap()
            .map_or(0, |bitmap| bitmap.address_value());
        for binding in &mut self.bindings {
            binding.prepare(heap_address)?;
        }
        Ok(())
    }
}

/// Parameters of an injected validation command.
struct ActionPlan {
    kind: ValidationPipelineKind,
    info: ActionInfo,

    /// Buffers bound to the action set.
    source: Option<RawBuffer>,
    aux: Option<RawBuffer>,

    /// Push constants of each launch.
    launches: Vec<Vec<u8>>,
}

/// Command buffer wrapper that records validation alongside application
/// commands.
pub struct CommandBuffer {
    validator: Arc<Validator>,
    sink: Box<dyn CommandSink>,
    inner: Arc<Mutex<CommandBufferInner>>,
}

impl Debug for CommandBuffer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("CommandBuffer")
                .field("sink", &self.sink)
                .field("inner", &*self.inner.lock())
                .finish()
        } else {
            write!(fmt, "CommandBuffer({:?})", self.inner.lock().state)
        }
    }
}

impl CommandBuffer {
    pub fn new(validator: &Arc<Validator>, sink: Box<dyn CommandSink>) -> Self {
        let alignment = validator.device().limits().min_uniform_buffer_offset_alignment;
        let stride = align_up(alignment.max(1) - 1, std::mem::size_of::<CommandIndices>() as u64)
            .unwrap_or(256);

        CommandBuffer {
            validator: validator.clone(),
            sink,
            inner: Arc::new(Mutex::new(CommandBufferInner::new(stride))),
        }
    }

    pub fn state(&self) -> CommandBufferState {
        self.inner.lock().state
    }

    pub fn sink_mut(&mut self) -> &mut dyn CommandSink {
        &mut *self.sink
    }

    pub(crate) fn shared(&self) -> &Arc<Mutex<CommandBufferInner>> {
        &self.inner
    }

    /// Number of validated commands recorded.
    pub fn command_count(&self) -> usize {
        self.inner.lock().resources.len()
    }

    /// Number of descriptor binding entries recorded.
    pub fn descriptor_binding_count(&self) -> usize {
        self.inner.lock().bindings.len()
    }

    pub fn begin(&mut self) -> Result<(), CommandBufferError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CommandBufferState::Submitted => return Err(CommandBufferError::Pending),
            CommandBufferState::Recording => {
                return Err(CommandBufferError::InvalidState {
                    state: inner.state,
                    expected: CommandBufferState::Idle,
                })
            }
            _ => {}
        }
        inner.clear();
        self.sink.reset();
        inner.state = CommandBufferState::Recording;
        Ok(())
    }

    pub fn end(&mut self) -> Result<(), CommandBufferError> {
        let mut inner = self.inner.lock();
        if inner.state != CommandBufferState::Recording {
            return Err(CommandBufferError::InvalidState {
                state: inner.state,
                expected: CommandBufferState::Recording,
            });
        }
        if !inner.labels.is_empty() {
            tracing::warn!("{} debug labels left open", inner.labels.len());
        }
        inner.state = CommandBufferState::Executable;
        Ok(())
    }

    /// Destroys all command resources and returns to `Idle`.
    pub fn reset(&mut self) -> Result<(), CommandBufferError> {
        let mut inner = self.inner.lock();
        if inner.state == CommandBufferState::Submitted {
            return Err(CommandBufferError::Pending);
        }
        inner.clear();
        self.sink.reset();
        inner.state = CommandBufferState::Idle;
        Ok(())
    }

    pub fn begin_render_pass(&mut self, pass: RawRenderPass) {
        self.inner.lock().render_pass = Some(pass);
        self.sink.record(Command::BeginRenderPass { pass });
    }

    pub fn end_render_pass(&mut self) {
        self.inner.lock().render_pass = None;
        self.sink.record(Command::EndRenderPass);
    }

    pub fn begin_debug_label(&mut self, name: &str) {
        self.inner.lock().labels.push(name.to_owned());
        self.sink.record(Command::BeginDebugLabel { name });
    }

    pub fn end_debug_label(&mut self) {
        if self.inner.lock().labels.pop().is_none() {
            tracing::warn!("Debug label ended without matching begin");
        }
        self.sink.record(Command::EndDebugLabel);
    }

    pub fn bind_pipeline(&mut self, pipeline: &Arc<PipelineState>) {
        let bind_point = pipeline.bind_point();
        self.inner.lock().last_bound[bind_point.index()].pipeline = Some(pipeline.clone());
        self.sink.record(Command::BindPipeline {
            bind_point,
            pipeline: pipeline.raw(),
        });
    }

    pub fn bind_descriptor_sets(
        &mut self,
        bind_point: PipelineBindPoint,
        layout: &Arc<PipelineLayoutState>,
        first_set: u32,
        sets: &[Arc<DescriptorSetState>],
        dynamic_offsets: &[u32],
    ) {
        {
            let mut inner = self.inner.lock();
            let bound = &mut inner.last_bound[bind_point.index()];
            let mut offsets = dynamic_offsets;

            for (i, set) in sets.iter().enumerate() {
                let count = dynamic_count(set.layout()).min(offsets.len());
                let (own, rest) = offsets.split_at(count);
                offsets = rest;

                let index = first_set as usize + i;
                if bound.sets.len() <= index {
                    bound.sets.resize(index + 1, None);
                }
                bound.sets[index] = Some(BoundSet {
                    state: set.clone(),
                    layout: layout.clone(),
                    dynamic_offsets: own.iter().copied().collect(),
                    push_writes: None,
                });
            }
            bound.binding = None;
        }

        let raw: SmallVec<[RawDescriptorSet; 8]> = sets.iter().map(|set| set.raw()).collect();
        self.sink.record(Command::BindDescriptorSets {
            bind_point,
            layout: layout.raw(),
            first_set,
            sets: &raw,
            dynamic_offsets,
        });
    }

    /// Each push creates a fresh set state.
    pub fn push_descriptor_set(
        &mut self,
        bind_point: PipelineBindPoint,
        layout: &Arc<PipelineLayoutState>,
        set: u32,
        writes: &[PushDescriptorWrite<'_>],
    ) {
        let raw: Arc<[RawDescriptorWrite]> = writes.iter().map(|write| write.to_raw()).collect();

        if let Some(set_layout) = layout.sets().get(set as usize) {
            let state = Arc::new(DescriptorSetState::new(
                self.validator.device().clone(),
                RawDescriptorSet::NULL,
                set_layout.clone(),
                None,
            ));
            state.perform_push_descriptors_update(writes);

            let mut inner = self.inner.lock();
            let bound = &mut inner.last_bound[bind_point.index()];
            let index = set as usize;
            if bound.sets.len() <= index {
                bound.sets.resize(index + 1, None);
            }
            bound.sets[index] = Some(BoundSet {
                state,
                layout: layout.clone(),
                dynamic_offsets: SmallVec::new(),
                push_writes: Some(raw.clone()),
            });
            bound.binding = None;
        } else {
            tracing::warn!("Push descriptor set {} is outside of layout {:?}", set, layout);
        }

        self.sink.record(Command::PushDescriptorSet {
            bind_point,
            layout: layout.raw(),
            set,
            writes: &raw,
        });
    }

    pub fn push_constants(
        &mut self,
        layout: &Arc<PipelineLayoutState>,
        stages: ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        {
            let mut inner = self.inner.lock();

            // Pushes with an incompatible layout disturb the earlier ones.
            inner
                .push_constants
                .retain(|push| push.layout.push_constants_compatible(layout));
            inner.push_constants.push(PushConstantsData {
                layout: layout.clone(),
                stages,
                offset,
                data: data.to_vec(),
            });
        }

        self.sink.record(Command::PushConstants {
            layout: layout.raw(),
            stages,
            offset,
            data,
        });
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: &Arc<BufferState>,
        offset: u64,
        index_type: IndexType,
    ) {
        self.inner.lock().index_buffer = Some((buffer.clone(), offset, index_type));
        self.sink.record(Command::BindIndexBuffer {
            buffer: buffer.raw(),
            offset,
            index_type,
        });
    }

    pub fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.validate(CommandKind::Draw, None);
        self.sink.record(Command::Draw { vertices, instances });
    }

    pub fn draw_indexed(
        &mut self,
        indices: Range<u32>,
        vertex_offset: i32,
        instances: Range<u32>,
    ) {
        self.validate(CommandKind::DrawIndexed, None);
        self.sink.record(Command::DrawIndexed {
            indices,
            vertex_offset,
            instances,
        });
    }

    pub fn draw_indirect(
        &mut self,
        buffer: &Arc<BufferState>,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        let plan = self.pre_draw(CommandKind::DrawIndirect, buffer, offset, draw_count, stride, None);
        self.validate(CommandKind::DrawIndirect, plan);
        self.sink.record(Command::DrawIndirect {
            buffer: buffer.raw(),
            offset,
            draw_count,
            stride,
        });
    }

    pub fn draw_indexed_indirect(
        &mut self,
        buffer: &Arc<BufferState>,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        let plan = self.pre_draw(
            CommandKind::DrawIndexedIndirect,
            buffer,
            offset,
            draw_count,
            stride,
            None,
        );
        self.validate(CommandKind::DrawIndexedIndirect, plan);
        self.sink.record(Command::DrawIndexedIndirect {
            buffer: buffer.raw(),
            offset,
            draw_count,
            stride,
        });
    }

    pub fn draw_indirect_count(
        &mut self,
        buffer: &Arc<BufferState>,
        offset: u64,
        count_buffer: &Arc<BufferState>,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) {
        let plan = self.pre_draw(
            CommandKind::DrawIndirectCount,
            buffer,
            offset,
            max_draw_count,
            stride,
            Some((count_buffer, count_offset)),
        );
        self.validate(CommandKind::DrawIndirectCount, plan);
        self.sink.record(Command::DrawIndirectCount {
            buffer: buffer.raw(),
            offset,
            count_buffer: count_buffer.raw(),
            count_offset,
            max_draw_count,
            stride,
        });
    }

    pub fn draw_indexed_indirect_count(
        &mut self,
        buffer: &Arc<BufferState>,
        offset: u64,
        count_buffer: &Arc<BufferState>,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) {
        let plan = self.pre_draw(
            CommandKind::DrawIndexedIndirectCount,
            buffer,
            offset,
            max_draw_count,
            stride,
            Some((count_buffer, count_offset)),
        );
        self.validate(CommandKind::DrawIndexedIndirectCount, plan);
        self.sink.record(Command::DrawIndexedIndirectCount {
            buffer: buffer.raw(),
            offset,
            count_buffer: count_buffer.raw(),
            count_offset,
            max_draw_count,
            stride,
        });
    }

    pub fn draw_mesh_tasks_indirect(
        &mut self,
        buffer: &Arc<BufferState>,
        offset: u64,
        draw_count: u32,
        stride: u32,
    ) {
        let plan = self.pre_draw(
            CommandKind::DrawMeshTasksIndirect,
            buffer,
            offset,
            draw_count,
            stride,
            None,
        );
        self.validate(CommandKind::DrawMeshTasksIndirect, plan);
        self.sink.record(Command::DrawMeshTasksIndirect {
            buffer: buffer.raw(),
            offset,
            draw_count,
            stride,
        });
    }

    pub fn draw_mesh_tasks_indirect_count(
        &mut self,
        buffer: &Arc<BufferState>,
        offset: u64,
        count_buffer: &Arc<BufferState>,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
    ) {
        let plan = self.pre_draw(
            CommandKind::DrawMeshTasksIndirectCount,
            buffer,
            offset,
            max_draw_count,
            stride,
            Some((count_buffer, count_offset)),
        );
        self.validate(CommandKind::DrawMeshTasksIndirectCount, plan);
        self.sink.record(Command::DrawMeshTasksIndirectCount {
            buffer: buffer.raw(),
            offset,
            count_buffer: count_buffer.raw(),
            count_offset,
            max_draw_count,
            stride,
        });
    }

    pub fn dispatch(&mut self, group_count: [u32; 3]) {
        self.validate(CommandKind::Dispatch, None);
        self.sink.record(Command::Dispatch { group_count });
    }

    pub fn dispatch_indirect(&mut self, buffer: &Arc<BufferState>, offset: u64) {
        let validator = &self.validator;
        let plan = pre_dispatch_constants(offset, validator.device().limits(), validator.settings())
            .map(|pc| ActionPlan {
                kind: ValidationPipelineKind::PreDispatch,
                info: ActionInfo::PreDispatch {
                    buffer: buffer.raw(),
                    offset,
                },
                source: Some(buffer.raw()),
                aux: None,
                launches: vec![bytemuck::bytes_of(&pc).to_vec()],
            });
        self.validate(CommandKind::DispatchIndirect, plan);
        self.sink.record(Command::DispatchIndirect {
            buffer: buffer.raw(),
            offset,
        });
    }

    pub fn trace_rays(&mut self, shader_binding_table: &ShaderBindingTable, extent: [u32; 3]) {
        self.validate(CommandKind::TraceRays, None);
        self.sink.record(Command::TraceRays {
            shader_binding_table,
            extent,
        });
    }

    pub fn trace_rays_indirect(
        &mut self,
        shader_binding_table: &ShaderBindingTable,
        address: DeviceAddress,
    ) {
        let validator = &self.validator;
        let plan = pre_trace_rays_constants(address, validator.device().limits(), validator.settings())
            .map(|pc| ActionPlan {
                kind: ValidationPipelineKind::PreTraceRays,
                info: ActionInfo::PreTraceRays { address },
                source: None,
                aux: None,
                launches: vec![bytemuck::bytes_of(&pc).to_vec()],
            });
        self.validate(CommandKind::TraceRaysIndirect, plan);
        self.sink.record(Command::TraceRaysIndirect {
            shader_binding_table,
            address,
        });
    }

    pub fn copy_buffer_to_image(
        &mut self,
        src: &Arc<BufferState>,
        dst: RawImage,
        format: CopyImageFormat,
        regions: &[BufferImageCopy],
    ) {
        let constants = copy_buffer_to_image_constants(format, regions, self.validator.settings());
        if !constants.is_empty() {
            let plan = ActionPlan {
                kind: ValidationPipelineKind::PreCopyBufferToImage,
                info: ActionInfo::CopyBufferToImage {
                    src: src.raw(),
                    dst,
                    format,
                    regions: regions.len() as u32,
                },
                source: Some(src.raw()),
                aux: None,
                launches: constants
                    .iter()
                    .map(|pc| bytemuck::bytes_of(pc).to_vec())
                    .collect(),
            };
            self.validate(CommandKind::CopyBufferToImage, Some(plan));
        }
        self.sink.record(Command::CopyBufferToImage {
            src_buffer: src.raw(),
            dst_image: dst,
            regions,
        });
    }

    fn pre_draw(
        &self,
        kind: CommandKind,
        buffer: &Arc<BufferState>,
        offset: u64,
        draw_count: u32,
        stride: u32,
        count_buffer: Option<(&Arc<BufferState>, u64)>,
    ) -> Option<ActionPlan> {
        let inner = self.inner.lock();
        let index_buffer = if kind.is_indexed() {
            inner.index_buffer.as_ref().map(|(buffer, offset, ty)| {
                let elements = buffer.size().saturating_sub(*offset) / ty.size();
                (buffer.raw(), *ty, elements.min(u64::from(u32::MAX)) as u32)
            })
        } else {
            None
        };
        let task_shader = kind.is_mesh()
            && inner.last_bound[PipelineBindPoint::Graphics.index()]
                .pipeline
                .as_ref()
                .map_or(false, |pipeline| pipeline.stages().contains(ShaderStageFlags::TASK));
        drop(inner);

        let draw = IndirectDraw {
            buffer: buffer.raw(),
            buffer_size: buffer.size(),
            offset,
            stride,
            draw_count,
            count_buffer: count_buffer.map(|(buffer, offset)| (buffer.raw(), offset)),
            index_buffer,
            task_shader,
        };

        let validator = &self.validator;
        let pc = pre_draw_constants(
            kind,
            &draw,
            validator.device().limits(),
            validator.device().features(),
            validator.settings(),
        )?;

        Some(ActionPlan {
            kind: ValidationPipelineKind::PreDraw,
            info: ActionInfo::PreDraw(draw),
            source: Some(buffer.raw()),
            aux: count_buffer.map(|(buffer, _)| buffer.raw()),
            launches: vec![bytemuck::bytes_of(&pc).to_vec()],
        })
    }

    /// Allocates command resources, injects the pre-action command and binds
    /// the validation set for the application command that follows.
    fn validate(&mut self, kind: CommandKind, plan: Option<ActionPlan>) {
        if self.validator.is_aborted() {
            return;
        }

        let mut inner = self.inner.lock();
        if inner.state != CommandBufferState::Recording {
            tracing::debug!("{} recorded outside of recording, not validated", kind.name());
            return;
        }

        if let Err(err) = record_validated(&self.validator, &mut inner, &mut *self.sink, kind, plan)
        {
            self.validator
                .abort(&format!("Failed to allocate resources for {}: {}", kind.name(), err));
        }
    }
}

fn record_validated(
    validator: &Validator,
    inner: &mut CommandBufferInner,
    sink: &mut dyn CommandSink,
    kind: CommandKind,
    plan: Option<ActionPlan>,
) -> Result<(), OutOfMemory> {
    let resource_index = inner.resources.len() as u32;
    if resource_index >= MAX_COMMANDS_PER_COMMAND_BUFFER {
        if !inner.overflow_warned {
            inner.overflow_warned = true;
            tracing::warn!(
                "More than {} validated commands in one command buffer, the rest are not validated",
                MAX_COMMANDS_PER_COMMAND_BUFFER
            );
        }
        return Ok(());
    }

    let bind_point = kind.bind_point();
    let pipeline = bind_point.and_then(|bp| inner.last_bound[bp.index()].pipeline.clone());
    let instrumented_layout = pipeline
        .as_ref()
        .filter(|pipeline| pipeline.is_instrumented())
        .and_then(|pipeline| pipeline.layout().instrumented());

    if instrumented_layout.is_none() && plan.is_none() {
        return Ok(());
    }

    inner.ensure_buffers(validator)?;

    let counter = kind
        .bind_point()
        .map_or(PipelineBindPoint::COUNT, |bp| bp.index());
    let operation_index = inner.operation_counts[counter];
    inner.operation_counts[counter] += 1;

    let descriptor_binding_index = match (bind_point, instrumented_layout) {
        (Some(bp), Some(_)) => Some(inner.descriptor_binding(validator, bp)?),
        _ => None,
    };

    let settings = validator.settings();
    let indices = CommandIndices {
        action_index: operation_index,
        resource_index,
        max_errors: settings.max_errors_per_command,
        flags: 0,
    };
    let (indices_buffer, indices_offset) = inner.write_indices(validator, indices)?;

    let objects = validator.objects().ok_or(OutOfMemory)?;
    let validation_set = objects.validation_sets.allocate()?;
    let bindless = descriptor_binding_index
        .map(|index| inner.bindings[index].bindless_state.raw());
    write_validation_set(
        validator,
        objects,
        inner,
        &validation_set,
        (indices_buffer, indices_offset),
        bindless,
    );

    let action = match plan {
        Some(plan) => record_action(validator, objects, inner, sink, &validation_set, plan)?,
        None => None,
    };

    if let (Some(bp), Some(layout)) = (bind_point, instrumented_layout) {
        sink.record(Command::BindDescriptorSets {
            bind_point: bp,
            layout,
            first_set: validator.validation_slot(),
            sets: &[validation_set.raw()],
            dynamic_offsets: &[],
        });
    }

    let uses_robustness = pipeline
        .as_ref()
        .map_or(false, |pipeline| pipeline.robustness().any());
    let debug_region = inner.labels.last().cloned();

    tracing::trace!(
        "Validating {} #{} as resource {}",
        kind.name(),
        operation_index,
        resource_index
    );

    inner.resources.push(CommandResources {
        kind,
        operation_index,
        descriptor_binding_index,
        validation_set: Some(validation_set),
        pipeline,
        uses_robustness,
        debug_region,
        action,
    });
    Ok(())
}

fn write_validation_set(
    validator: &Validator,
    objects: &ValidationObjects,
    inner: &CommandBufferInner,
    set: &ManagedDescriptorSet,
    (indices, indices_offset): (RawBuffer, u64),
    bindless: Option<RawBuffer>,
) {
    let null = objects.null_buffer.raw();
    let storage = |binding, buffer: Option<RawBuffer>| BufferDescriptorWrite {
        binding,
        ty: DescriptorType::StorageBuffer,
        buffer: buffer.unwrap_or(null),
        offset: 0,
        range: u64::MAX,
    };

    let writes = [
        storage(
            validation_set::OUTPUT,
            inner.output.as_ref().map(|buffer| buffer.raw()),
        ),
        storage(
            validation_set::ERROR_COUNTS,
            inner.error_counts.as_ref().map(|buffer| buffer.raw()),
        ),
        BufferDescriptorWrite {
            binding: validation_set::COMMAND_INDICES,
            ty: DescriptorType::UniformBuffer,
            buffer: indices,
            offset: indices_offset,
            range: std::mem::size_of::<CommandIndices>() as u64,
        },
        storage(validation_set::BINDLESS_STATE, bindless),
        storage(
            validation_set::BDA_TABLE,
            validator.bda_table().buffer().map(|buffer| buffer.raw()),
        ),
        storage(
            validation_set::HEAP_BITMAP,
            validator.heap().bitmap().map(|buffer| buffer.raw()),
        ),
    ];
    validator.device().update_descriptor_set(set.raw(), &writes);
}

fn record_action(
    validator: &Validator,
    objects: &ValidationObjects,
    inner: &mut CommandBufferInner,
    sink: &mut dyn CommandSink,
    validation_set: &ManagedDescriptorSet,
    plan: ActionPlan,
) -> Result<Option<ActionResources>, OutOfMemory> {
    let (bind_point, launch) = action_target(plan.kind);
    let render_pass = match bind_point {
        PipelineBindPoint::Graphics => inner.render_pass,
        _ => None,
    };

    let pipeline = match validator.validation_pipeline(plan.kind, render_pass) {
        Some(pipeline) => pipeline,
        None => return Ok(None),
    };

    let action_set = match plan.source {
        Some(source) => {
            let set = objects.action_sets.allocate()?;
            let writes = [
                BufferDescriptorWrite {
                    binding: action_set::SOURCE,
                    ty: DescriptorType::StorageBuffer,
                    buffer: source,
                    offset: 0,
                    range: u64::MAX,
                },
                BufferDescriptorWrite {
                    binding: action_set::AUX,
                    ty: DescriptorType::StorageBuffer,
                    buffer: plan.aux.unwrap_or(source),
                    offset: 0,
                    range: u64::MAX,
                },
            ];
            validator.device().update_descriptor_set(set.raw(), &writes);
            Some(set)
        }
        None => None,
    };

    for push_constants in &plan.launches {
        ActionRecording {
            bind_point,
            pipeline,
            layout: objects.pipeline_layout,
            validation_set: validation_set.raw(),
            action_set: action_set.as_ref().map(|set| set.raw()),
            push_constants,
            launch,
        }
        .record(sink);
        inner.action_count += 1;
    }
    inner.restore(bind_point, sink);

    Ok(Some(ActionResources {
        info: plan.info,
        set: action_set,
    }))
}

/// Number of dynamic offsets a set with `layout` consumes.
fn dynamic_count(layout: &DescriptorSetLayoutState) -> usize {
    layout
        .bindings()
        .iter()
        .filter(|binding| binding.ty.is_dynamic())
        .map(|binding| binding.count as usize)
        .sum()
}

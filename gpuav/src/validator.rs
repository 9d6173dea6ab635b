use {
    crate::{
        bda::BdaTable,
        buffer::{Buffer, BufferInfo, BufferUsage},
        descriptor::{
            CopyDescriptorSet, DescriptorBindingFlags, DescriptorSetLayoutBinding,
            DescriptorSetLayoutInfo, DescriptorSetLayoutState, DescriptorSetManager,
            DescriptorSetState, DescriptorType, WriteDescriptorSet,
        },
        device::{
            CreatePipelineError, Device, RawAccelerationStructure, RawBuffer,
            RawBufferView, RawDescriptorSet, RawDescriptorSetLayout, RawImageView,
            RawPipeline, RawPipelineLayout, RawRenderPass, RawSampler,
            ValidationPipelineInfo, ValidationPipelineKind,
        },
        heap::{DescriptorHeap, ResourceTag},
        instrument::{InstrumentedShader, ShaderInstrumenter, Toolkit},
        pipeline::{
            PipelineBindPoint, PipelineLayoutState, PipelineState, PushConstantRange,
            Robustness, ShaderStageFlags,
        },
        report::{Diagnostic, Reporter, Severity, SETUP_VUID},
        resource::{
            AccelerationStructureState, BufferState, BufferViewState, ImageViewInfo,
            ImageViewState, SamplerState,
        },
        settings::Settings,
        wire::{
            action_set, validation_set, PreDrawPushConstants, MAX_VALIDATION_SLOT,
        },
        DeviceAddress, OutOfMemory,
    },
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        fmt::{self, Debug},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

/// Validation sets allocated from one pool.
const SETS_PER_POOL: u32 = 512;

/// Device objects shared by all validated commands.
pub(crate) struct ValidationObjects {
    pub empty_set_layout: RawDescriptorSetLayout,
    pub validation_set_layout: RawDescriptorSetLayout,
    pub action_set_layout: RawDescriptorSetLayout,
    pub validation_sets: Arc<DescriptorSetManager>,
    pub action_sets: Arc<DescriptorSetManager>,

    /// Set 0 is the validation set, set 1 the action set.
    pub pipeline_layout: RawPipelineLayout,

    /// Bound where a command has no buffer of its own.
    pub null_buffer: Buffer,
}

impl Debug for ValidationObjects {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ValidationObjects")
            .field("validation_set_layout", &self.validation_set_layout)
            .field("action_set_layout", &self.action_set_layout)
            .field("validation_sets", &self.validation_sets)
            .field("action_sets", &self.action_sets)
            .field("pipeline_layout", &self.pipeline_layout)
            .finish()
    }
}

impl ValidationObjects {
    fn new(device: &Device) -> Result<Self, OutOfMemory> {
        let storage = |binding| DescriptorSetLayoutBinding {
            binding,
            ty: DescriptorType::StorageBuffer,
            count: 1,
            stages: ShaderStageFlags::all(),
            flags: DescriptorBindingFlags::empty(),
        };

        let validation_bindings = [
            storage(validation_set::OUTPUT),
            storage(validation_set::ERROR_COUNTS),
            DescriptorSetLayoutBinding {
                ty: DescriptorType::UniformBuffer,
                ..storage(validation_set::COMMAND_INDICES)
            },
            storage(validation_set::BINDLESS_STATE),
            storage(validation_set::BDA_TABLE),
            storage(validation_set::HEAP_BITMAP),
        ];
        let action_bindings = [storage(action_set::SOURCE), storage(action_set::AUX)];

        let empty_set_layout = device.create_descriptor_set_layout(&[])?;
        let validation_set_layout = device.create_descriptor_set_layout(&validation_bindings)?;
        let action_set_layout = device.create_descriptor_set_layout(&action_bindings)?;

        let push_constants = [PushConstantRange {
            stages: ShaderStageFlags::VERTEX
                | ShaderStageFlags::COMPUTE
                | ShaderStageFlags::RAYGEN,
            offset: 0,
            size: std::mem::size_of::<PreDrawPushConstants>() as u32,
        }];
        let pipeline_layout = device.create_pipeline_layout(
            &[validation_set_layout, action_set_layout],
            &push_constants,
        )?;

        let null_buffer = device.create_buffer(BufferInfo::storage(16))?;

        Ok(ValidationObjects {
            empty_set_layout,
            validation_set_layout,
            action_set_layout,
            validation_sets: Arc::new(DescriptorSetManager::new(
                device.clone(),
                validation_set_layout,
                &validation_bindings,
                SETS_PER_POOL,
            )),
            action_sets: Arc::new(DescriptorSetManager::new(
                device.clone(),
                action_set_layout,
                &action_bindings,
                SETS_PER_POOL,
            )),
            pipeline_layout,
            null_buffer,
        })
    }
}

/// Root object of the validation layer for one device.
///
/// Resource hooks must be called when the application creates and destroys
/// the corresponding objects, so that descriptors can be tracked.
pub struct Validator {
    device: Device,
    settings: Settings,
    reporter: Arc<dyn Reporter>,
    aborted: AtomicBool,
    heap: Arc<DescriptorHeap>,
    bda: BdaTable,
    instrumenter: ShaderInstrumenter,
    validation_slot: u32,
    objects: Option<ValidationObjects>,
    pipelines: Mutex<HashMap<(ValidationPipelineKind, Option<RawRenderPass>), Option<RawPipeline>>>,
}

impl Debug for Validator {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("Validator")
                .field("device", &self.device)
                .field("aborted", &self.is_aborted())
                .field("heap", &self.heap)
                .field("bda", &self.bda)
                .field("instrumenter", &self.instrumenter)
                .field("validation_slot", &self.validation_slot)
                .field("objects", &self.objects)
                .finish()
        } else {
            write!(fmt, "Validator(aborted: {})", self.is_aborted())
        }
    }
}

impl Drop for Validator {
    fn drop(&mut self) {
        self.instrumenter.persist_cache();

        for (_, pipeline) in self.pipelines.get_mut().drain() {
            if let Some(pipeline) = pipeline {
                self.device.destroy_pipeline(pipeline);
            }
        }

        if let Some(objects) = &self.objects {
            self.device.destroy_pipeline_layout(objects.pipeline_layout);
            self.device.destroy_descriptor_set_layout(objects.validation_set_layout);
            self.device.destroy_descriptor_set_layout(objects.action_set_layout);
            self.device.destroy_descriptor_set_layout(objects.empty_set_layout);
        }
    }
}

impl Validator {
    /// Creates validator for `device`.
    ///
    /// Failure to create validator's own objects is reported once and leaves
    /// the validator aborted: every hook keeps working, nothing is validated.
    #[tracing::instrument(skip(device, toolkit, reporter))]
    pub fn new(
        device: Device,
        settings: Settings,
        toolkit: Option<Box<dyn Toolkit>>,
        reporter: Arc<dyn Reporter>,
    ) -> Arc<Self> {
        let limits = *device.limits();
        let validation_slot = limits
            .max_bound_descriptor_sets
            .min(MAX_VALIDATION_SLOT + 1)
            .saturating_sub(1);

        let mut failure = None;

        let heap = match DescriptorHeap::with_device(&device, settings.descriptor_heap_capacity) {
            Ok(heap) => heap,
            Err(err) => {
                failure = Some(format!("Failed to create descriptor heap: {}", err));
                DescriptorHeap::new(settings.descriptor_heap_capacity)
            }
        };

        let bda = match BdaTable::with_device(&device, settings.max_buffer_device_addresses) {
            Ok(bda) => bda,
            Err(err) => {
                failure = Some(format!("Failed to create device address table: {}", err));
                BdaTable::new(settings.max_buffer_device_addresses)
            }
        };

        let objects = match ValidationObjects::new(&device) {
            Ok(objects) => Some(objects),
            Err(err) => {
                failure = Some(format!("Failed to create validation objects: {}", err));
                None
            }
        };

        let instrumenter =
            ShaderInstrumenter::new(toolkit, reporter.clone(), &settings, validation_slot);

        tracing::debug!("Validation set slot is {}", validation_slot);

        let validator = Validator {
            device,
            settings,
            reporter,
            aborted: AtomicBool::new(false),
            heap: Arc::new(heap),
            bda,
            instrumenter,
            validation_slot,
            objects,
            pipelines: Mutex::new(HashMap::new()),
        };

        if let Some(message) = failure {
            validator.abort(&message);
        }
        Arc::new(validator)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn reporter(&self) -> &dyn Reporter {
        &*self.reporter
    }

    pub fn heap(&self) -> &Arc<DescriptorHeap> {
        &self.heap
    }

    pub fn bda_table(&self) -> &BdaTable {
        &self.bda
    }

    pub fn instrumenter(&self) -> &ShaderInstrumenter {
        &self.instrumenter
    }

    /// Descriptor set index validation sets are bound at.
    pub fn validation_slot(&self) -> u32 {
        self.validation_slot
    }

    pub(crate) fn objects(&self) -> Option<&ValidationObjects> {
        self.objects.as_ref()
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    /// Stops all validation. Reported once.
    pub fn abort(&self, message: &str) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            tracing::error!("{}", message);
            self.reporter.report(Diagnostic {
                severity: Severity::Error,
                vuid: SETUP_VUID.to_owned(),
                message: format!("{}. GPU-assisted validation is disabled", message),
            });
        }
    }

    /// Uploads heap bitmap and address table if they changed.
    pub(crate) fn sync_tables(&self) {
        if let Err(err) = self.heap.sync() {
            self.abort(&format!("Failed to upload descriptor heap: {}", err));
        }
        if let Err(err) = self.bda.sync() {
            self.abort(&format!("Failed to upload device address table: {}", err));
        }
    }

    /// Pipeline injected in front of commands, created on first use.
    /// `None` when the device can't create it.
    pub(crate) fn validation_pipeline(
        &self,
        kind: ValidationPipelineKind,
        render_pass: Option<RawRenderPass>,
    ) -> Option<RawPipeline> {
        let objects = self.objects.as_ref()?;
        let mut pipelines = self.pipelines.lock();
        if let Some(pipeline) = pipelines.get(&(kind, render_pass)) {
            return *pipeline;
        }

        let info = ValidationPipelineInfo {
            kind,
            layout: objects.pipeline_layout,
            render_pass,
        };
        let pipeline = match self.device.create_validation_pipeline(info) {
            Ok(pipeline) => Some(pipeline),
            Err(CreatePipelineError::Unsupported { kind }) => {
                tracing::warn!("Validation pipeline {:?} is unsupported, checks are skipped", kind);
                None
            }
            Err(err) => {
                tracing::error!("Failed to create validation pipeline {:?}: {}", kind, err);
                None
            }
        };
        pipelines.insert((kind, render_pass), pipeline);
        pipeline
    }

    /// Adjusts creation info of an application buffer.
    /// Indirect buffers are read by validation pipelines as storage buffers.
    pub fn modify_buffer_info(&self, mut info: BufferInfo) -> BufferInfo {
        if info.usage.contains(BufferUsage::INDIRECT) {
            info.usage |= BufferUsage::STORAGE;
        }
        info
    }

    #[tracing::instrument(skip(self))]
    pub fn create_buffer(&self, raw: RawBuffer, info: BufferInfo) -> Arc<BufferState> {
        let address = if info.usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS) {
            self.device.buffer_address(raw)
        } else {
            None
        };
        if let Some(address) = address {
            self.bda.insert(address, info.size, raw);
        }

        let id = self.heap.allocate(ResourceTag::Buffer(raw));
        Arc::new(BufferState::new(raw, info, address, id))
    }

    pub fn destroy_buffer(&self, buffer: &BufferState) {
        if let Some(address) = buffer.address {
            self.bda.remove(address);
        }
        buffer.destroy();
    }

    pub fn create_buffer_view(
        &self,
        raw: RawBufferView,
        buffer: &Arc<BufferState>,
        offset: u64,
        range: u64,
        format_size: u32,
    ) -> Arc<BufferViewState> {
        let id = self.heap.allocate(ResourceTag::BufferView(raw));
        Arc::new(BufferViewState::new(
            raw,
            buffer.clone(),
            offset,
            range,
            format_size,
            id,
        ))
    }

    pub fn destroy_buffer_view(&self, view: &BufferViewState) {
        view.destroy();
    }

    pub fn create_image_view(&self, raw: RawImageView, info: ImageViewInfo) -> Arc<ImageViewState> {
        let id = self.heap.allocate(ResourceTag::ImageView(raw));
        Arc::new(ImageViewState::new(raw, info, id))
    }

    pub fn destroy_image_view(&self, view: &ImageViewState) {
        view.destroy();
    }

    pub fn create_sampler(&self, raw: RawSampler) -> Arc<SamplerState> {
        let id = self.heap.allocate(ResourceTag::Sampler(raw));
        Arc::new(SamplerState::new(raw, id))
    }

    pub fn destroy_sampler(&self, sampler: &SamplerState) {
        sampler.destroy();
    }

    pub fn create_acceleration_structure(
        &self,
        raw: RawAccelerationStructure,
        address: Option<DeviceAddress>,
    ) -> Arc<AccelerationStructureState> {
        let id = self.heap.allocate(ResourceTag::AccelerationStructure(raw));
        Arc::new(AccelerationStructureState::new(raw, address, id))
    }

    pub fn destroy_acceleration_structure(&self, structure: &AccelerationStructureState) {
        structure.destroy();
    }

    pub fn create_descriptor_set_layout(
        &self,
        raw: RawDescriptorSetLayout,
        info: DescriptorSetLayoutInfo,
    ) -> Arc<DescriptorSetLayoutState> {
        Arc::new(DescriptorSetLayoutState::new(raw, info))
    }

    /// Tracks application pipeline layout. When the layout leaves the
    /// validation slot free, a copy with the validation set at that slot is
    /// created for instrumented pipelines.
    #[tracing::instrument(skip(self, sets, push_constants))]
    pub fn create_pipeline_layout(
        &self,
        raw: RawPipelineLayout,
        sets: &[Arc<DescriptorSetLayoutState>],
        push_constants: &[PushConstantRange],
    ) -> Arc<PipelineLayoutState> {
        let instrumented = match &self.objects {
            Some(objects) if !self.is_aborted() => {
                if sets.len() > self.validation_slot as usize {
                    tracing::warn!(
                        "Pipeline layout {:?} uses {} sets, validation slot {} is taken. \
                         Pipelines with this layout are not instrumented",
                        raw,
                        sets.len(),
                        self.validation_slot
                    );
                    None
                } else {
                    let mut layouts: Vec<_> = sets.iter().map(|set| set.raw()).collect();
                    layouts.resize(self.validation_slot as usize, objects.empty_set_layout);
                    layouts.push(objects.validation_set_layout);

                    match self.device.create_pipeline_layout(&layouts, push_constants) {
                        Ok(layout) => Some(layout),
                        Err(err) => {
                            self.abort(&format!("Failed to create instrumented pipeline layout: {}", err));
                            None
                        }
                    }
                }
            }
            _ => None,
        };

        Arc::new(PipelineLayoutState::new(
            raw,
            sets.to_vec(),
            push_constants,
            instrumented,
        ))
    }

    pub fn destroy_pipeline_layout(&self, layout: &PipelineLayoutState) {
        if let Some(instrumented) = layout.instrumented() {
            self.device.destroy_pipeline_layout(instrumented);
        }
    }

    pub fn allocate_descriptor_set(
        &self,
        raw: RawDescriptorSet,
        layout: &Arc<DescriptorSetLayoutState>,
        variable_count: Option<u32>,
    ) -> Arc<DescriptorSetState> {
        Arc::new(DescriptorSetState::new(
            self.device.clone(),
            raw,
            layout.clone(),
            variable_count,
        ))
    }

    pub fn update_descriptor_sets(
        &self,
        writes: &[WriteDescriptorSet<'_>],
        copies: &[CopyDescriptorSet<'_>],
    ) {
        for write in writes {
            write.set.perform_write_update(write);
        }
        for copy in copies {
            copy.dst.perform_copy_update(copy);
        }
    }

    /// Instruments shader code. The returned code replaces the application's.
    pub fn create_shader_module(&self, code: &[u32], name: Option<&str>) -> InstrumentedShader {
        self.instrumenter.instrument(code, name)
    }

    /// Forgets the original program of `shader` once no pipeline uses it.
    pub fn destroy_shader_module(&self, shader: InstrumentedShader) {
        self.instrumenter.release(shader);
    }

    /// Shaders to create a pipeline with `layout` from.
    /// Instrumented shaders are swapped for their original programs when
    /// the layout has no room for the validation set.
    pub fn pipeline_shaders(
        &self,
        layout: &PipelineLayoutState,
        shaders: &[InstrumentedShader],
    ) -> Vec<InstrumentedShader> {
        if layout.instrumented().is_some() {
            return shaders.to_vec();
        }

        shaders
            .iter()
            .map(|shader| {
                if !shader.is_instrumented() {
                    return shader.clone();
                }
                match shader.record() {
                    Some(record) => InstrumentedShader::passthrough(record.original().into()),
                    None => shader.clone(),
                }
            })
            .collect()
    }

    /// Layout to create a pipeline with `shaders` from.
    pub fn pipeline_create_layout(
        &self,
        layout: &PipelineLayoutState,
        shaders: &[InstrumentedShader],
    ) -> RawPipelineLayout {
        match layout.instrumented() {
            Some(instrumented) if shaders.iter().any(|shader| shader.is_instrumented()) => {
                instrumented
            }
            _ => layout.raw(),
        }
    }

    /// Tracks application pipeline created from `shaders` with the layout
    /// returned by [`Validator::pipeline_create_layout`].
    /// `stages` are the shader stages of the pipeline.
    pub fn create_pipeline(
        &self,
        raw: RawPipeline,
        bind_point: PipelineBindPoint,
        stages: ShaderStageFlags,
        layout: &Arc<PipelineLayoutState>,
        shaders: &[InstrumentedShader],
        robustness: Robustness,
    ) -> Arc<PipelineState> {
        if layout.instrumented().is_none() && shaders.iter().any(|s| s.is_instrumented()) {
            tracing::warn!(
                "Pipeline {:?} has instrumented shaders but its layout can't bind the \
                 validation set",
                raw
            );
        }
        Arc::new(PipelineState::new(
            raw,
            bind_point,
            stages,
            layout.clone(),
            shaders,
            robustness,
        ))
    }

    pub fn destroy_pipeline(&self, pipeline: &PipelineState) {
        tracing::trace!("Pipeline {:?} destroyed", pipeline);
    }
}

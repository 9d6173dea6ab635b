#![allow(dead_code)]

use {
    gpuav::{
        backend::software::{Invocation, Program, Recorded, SoftCommandBuffer, SoftDevice, SoftQueue},
        BufferInfo, BufferState, CollectingReporter, CommandBuffer, DescriptorBindingFlags,
        DescriptorSetLayoutBinding, DescriptorSetLayoutInfo, DescriptorSetLayoutState,
        DescriptorSetState, DescriptorSizes, DescriptorType, Device, DeviceFeatures,
        DeviceLimits, DeviceTrait as _, PassInfo, PipelineBindPoint, PipelineLayoutState,
        PipelineState, PushConstantRange, Queue, Robustness, Settings, ShaderStageFlags,
        Toolkit, ToolkitError, Validator,
    },
    rspirv::{
        binary::Assemble as _,
        dr::{Builder, Operand},
        spirv::{Capability, Decoration, ExecutionModel, StorageClass},
    },
    std::sync::Arc,
};

pub fn stage_flags(stage: ExecutionModel) -> ShaderStageFlags {
    match stage {
        ExecutionModel::Vertex => ShaderStageFlags::VERTEX,
        ExecutionModel::Fragment => ShaderStageFlags::FRAGMENT,
        ExecutionModel::GLCompute => ShaderStageFlags::COMPUTE,
        ExecutionModel::TaskNV => ShaderStageFlags::TASK | ShaderStageFlags::MESH,
        ExecutionModel::MeshNV => ShaderStageFlags::MESH,
        _ => ShaderStageFlags::empty(),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Toolkit that marks every pass by appending the shader id.
#[derive(Debug, Default)]
pub struct StampingToolkit;

impl Toolkit for StampingToolkit {
    fn run_pass(&self, words: &[u32], pass: &PassInfo) -> Result<Option<Vec<u32>>, ToolkitError> {
        let mut words = words.to_vec();
        words.push(pass.shader_id);
        Ok(Some(words))
    }

    fn helper_library(&self) -> Result<Vec<u32>, ToolkitError> {
        let mut b = Builder::new();
        let float = b.type_float(32);
        let var = b.variable(float, None, StorageClass::Uniform, None);
        b.decorate(
            var,
            Decoration::DescriptorSet,
            vec![Operand::LiteralInt32(gpuav::wire::PLACEHOLDER_DESCRIPTOR_SET)],
        );
        Ok(b.module().assemble())
    }

    fn link(&self, module: &[u32], _library: &[u32]) -> Result<Vec<u32>, ToolkitError> {
        Ok(module.to_vec())
    }

    fn validate(&self, _words: &[u32]) -> Result<(), ToolkitError> {
        Ok(())
    }

    fn eliminate_dead_code(&self, words: &[u32]) -> Result<Vec<u32>, ToolkitError> {
        Ok(words.to_vec())
    }
}

pub fn shader_words() -> Vec<u32> {
    let mut b = Builder::new();
    b.capability(Capability::Shader);
    b.module().assemble()
}

pub fn program<F>(f: F) -> Arc<dyn Program>
where
    F: Fn(&mut Invocation<'_>) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn storage_binding(binding: u32, count: u32, stages: ShaderStageFlags) -> DescriptorSetLayoutBinding {
    DescriptorSetLayoutBinding {
        binding,
        ty: DescriptorType::StorageBuffer,
        count,
        stages,
        flags: DescriptorBindingFlags::empty(),
    }
}

/// Application pipeline with one descriptor set.
pub struct AppPipeline {
    pub set_layout: Arc<DescriptorSetLayoutState>,
    pub layout: Arc<PipelineLayoutState>,
    pub pipeline: Arc<PipelineState>,
}

pub struct Harness {
    pub device: Arc<SoftDevice>,
    pub validator: Arc<Validator>,
    pub reporter: Arc<CollectingReporter>,
}

impl Harness {
    pub fn new(device: SoftDevice, settings: Settings, instrument: bool) -> Self {
        init_tracing();
        let device = Arc::new(device);
        let reporter = Arc::new(CollectingReporter::new());
        let toolkit: Option<Box<dyn Toolkit>> = if instrument {
            Some(Box::new(StampingToolkit))
        } else {
            None
        };
        let validator = Validator::new(
            Device::new(device.clone()),
            settings,
            toolkit,
            reporter.clone(),
        );
        Harness {
            device,
            validator,
            reporter,
        }
    }

    /// Device with default limits and instrumentation enabled.
    pub fn instrumented() -> Self {
        let features = DeviceFeatures {
            draw_indirect_first_instance: true,
            buffer_device_address: true,
            ..DeviceFeatures::default()
        };
        Harness::new(
            SoftDevice::new(DeviceLimits::default(), features),
            Settings::default(),
            true,
        )
    }

    pub fn buffer(&self, info: BufferInfo) -> Arc<BufferState> {
        let info = self.validator.modify_buffer_info(info);
        let raw = self.device.create_buffer(info).unwrap();
        self.validator.create_buffer(raw, info)
    }

    pub fn pipeline(
        &self,
        bind_point: PipelineBindPoint,
        stage: ExecutionModel,
        bindings: Vec<DescriptorSetLayoutBinding>,
        push_constants: &[PushConstantRange],
        program: Arc<dyn Program>,
    ) -> AppPipeline {
        let raw_set_layout = self.device.create_descriptor_set_layout(&bindings).unwrap();
        let set_layout = self.validator.create_descriptor_set_layout(
            raw_set_layout,
            DescriptorSetLayoutInfo {
                bindings,
                ..DescriptorSetLayoutInfo::default()
            },
        );

        let raw_layout = self
            .device
            .create_pipeline_layout(&[raw_set_layout], push_constants)
            .unwrap();
        let layout = self.validator.create_pipeline_layout(
            raw_layout,
            &[set_layout.clone()],
            push_constants,
        );

        let shader = self.validator.create_shader_module(&shader_words(), Some("app"));
        let shaders = self.validator.pipeline_shaders(&layout, &[shader]);
        let create_layout = self.validator.pipeline_create_layout(&layout, &shaders);
        let raw = self.device.create_program_pipeline(
            bind_point,
            create_layout,
            &shaders[0],
            stage,
            program,
        );
        let pipeline = self.validator.create_pipeline(
            raw,
            bind_point,
            stage_flags(stage),
            &layout,
            &shaders,
            Robustness::default(),
        );

        AppPipeline {
            set_layout,
            layout,
            pipeline,
        }
    }

    pub fn descriptor_set(&self, layout: &Arc<DescriptorSetLayoutState>) -> Arc<DescriptorSetState> {
        let pool = self
            .device
            .create_descriptor_pool(&DescriptorSizes::from_bindings(layout.bindings()), 1)
            .unwrap();
        let raw = self.device.allocate_descriptor_set(pool, layout.raw()).unwrap();
        self.validator.allocate_descriptor_set(raw, layout, None)
    }

    pub fn command_buffer(&self) -> CommandBuffer {
        CommandBuffer::new(&self.validator, Box::new(SoftCommandBuffer::new()))
    }

    pub fn queue(&self) -> Queue {
        Queue::new(&self.validator, Box::new(SoftQueue::new(self.device.clone())))
    }

    pub fn deferred_queue(&self) -> Queue {
        Queue::new(
            &self.validator,
            Box::new(SoftQueue::deferred(self.device.clone())),
        )
    }
}

/// Commands the device received for `command_buffer`.
pub fn recorded(command_buffer: &mut CommandBuffer) -> Vec<Recorded> {
    command_buffer
        .sink_mut()
        .as_any_mut()
        .downcast_mut::<SoftCommandBuffer>()
        .map(|sink| sink.commands().to_vec())
        .unwrap_or_default()
}

use {
    crate::{
        descriptor::DescriptorSetLayoutState,
        device::{RawPipeline, RawPipelineLayout},
        instrument::InstrumentedShader,
    },
    smallvec::SmallVec,
    std::{
        fmt::{self, Debug},
        sync::Arc,
    },
};

bitflags::bitflags! {
    #[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 0x001;
        const TESSELLATION_CONTROL = 0x002;
        const TESSELLATION_EVALUATION = 0x004;
        const GEOMETRY = 0x008;
        const FRAGMENT = 0x010;
        const COMPUTE = 0x020;
        const ALL_GRAPHICS = 0x0000001F;
        const RAYGEN = 0x100;
        const ANY_HIT = 0x200;
        const CLOSEST_HIT = 0x400;
        const MISS = 0x800;
        const INTERSECTION = 0x1000;
        const CALLABLE = 0x2000;
        const TASK = 0x40;
        const MESH = 0x80;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub enum PipelineBindPoint {
    Graphics,
    Compute,
    RayTracing,
}

impl PipelineBindPoint {
    pub(crate) const COUNT: usize = 3;

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct PushConstantRange {
    pub stages: ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

/// Application pipeline layout as seen by the validator.
pub struct PipelineLayoutState {
    raw: RawPipelineLayout,
    sets: Vec<Arc<DescriptorSetLayoutState>>,
    push_constants: SmallVec<[PushConstantRange; 4]>,

    /// Copy of the layout with the validation set appended at the
    /// validation slot. `None` when the application uses the slot.
    instrumented: Option<RawPipelineLayout>,
}

impl Debug for PipelineLayoutState {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("PipelineLayoutState")
                .field("raw", &self.raw)
                .field("sets", &self.sets.len())
                .field("push_constants", &self.push_constants)
                .field("instrumented", &self.instrumented)
                .finish()
        } else {
            Debug::fmt(&self.raw, fmt)
        }
    }
}

impl PipelineLayoutState {
    pub(crate) fn new(
        raw: RawPipelineLayout,
        sets: Vec<Arc<DescriptorSetLayoutState>>,
        push_constants: &[PushConstantRange],
        instrumented: Option<RawPipelineLayout>,
    ) -> Self {
        PipelineLayoutState {
            raw,
            sets,
            push_constants: push_constants.iter().copied().collect(),
            instrumented,
        }
    }

    pub fn raw(&self) -> RawPipelineLayout {
        self.raw
    }

    pub fn sets(&self) -> &[Arc<DescriptorSetLayoutState>] {
        &self.sets
    }

    pub fn push_constants(&self) -> &[PushConstantRange] {
        &self.push_constants
    }

    pub fn instrumented(&self) -> Option<RawPipelineLayout> {
        self.instrumented
    }

    /// Push constant ranges compatible between layouts.
    pub(crate) fn push_constants_compatible(&self, other: &Self) -> bool {
        self.raw == other.raw || self.push_constants == other.push_constants
    }
}

/// How out of bounds accesses behave for a pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Robustness {
    pub robust_buffer_access: bool,
    pub robust_buffer_access2: bool,
}

impl Robustness {
    pub fn any(&self) -> bool {
        self.robust_buffer_access || self.robust_buffer_access2
    }
}

/// Application pipeline as seen by the validator.
pub struct PipelineState {
    raw: RawPipeline,
    bind_point: PipelineBindPoint,
    stages: ShaderStageFlags,
    layout: Arc<PipelineLayoutState>,
    shaders: SmallVec<[InstrumentedShader; 4]>,
    robustness: Robustness,
}

impl Debug for PipelineState {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("PipelineState")
                .field("raw", &self.raw)
                .field("bind_point", &self.bind_point)
                .field("layout", &self.layout)
                .field("shaders", &self.shaders)
                .field("robustness", &self.robustness)
                .finish()
        } else {
            Debug::fmt(&self.raw, fmt)
        }
    }
}

impl PipelineState {
    pub(crate) fn new(
        raw: RawPipeline,
        bind_point: PipelineBindPoint,
        stages: ShaderStageFlags,
        layout: Arc<PipelineLayoutState>,
        shaders: &[InstrumentedShader],
        robustness: Robustness,
    ) -> Self {
        PipelineState {
            raw,
            bind_point,
            stages,
            layout,
            shaders: shaders.iter().cloned().collect(),
            robustness,
        }
    }

    pub fn raw(&self) -> RawPipeline {
        self.raw
    }

    pub fn bind_point(&self) -> PipelineBindPoint {
        self.bind_point
    }

    /// Stages the pipeline was created with.
    pub fn stages(&self) -> ShaderStageFlags {
        self.stages
    }

    pub fn layout(&self) -> &Arc<PipelineLayoutState> {
        &self.layout
    }

    pub fn shaders(&self) -> &[InstrumentedShader] {
        &self.shaders
    }

    pub fn robustness(&self) -> Robustness {
        self.robustness
    }

    /// Any stage runs instrumented code.
    pub fn is_instrumented(&self) -> bool {
        self.shaders.iter().any(|s| s.is_instrumented())
    }
}

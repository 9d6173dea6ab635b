use {
    crate::{
        command::IndexType,
        descriptor::ManagedDescriptorSet,
        device::{RawBuffer, RawImage},
        pipeline::{PipelineBindPoint, PipelineState},
        resource::CopyImageFormat,
        DeviceAddress,
    },
    std::{
        fmt::{self, Debug},
        sync::Arc,
    },
};

/// Validated command types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    Draw,
    DrawIndexed,
    DrawIndirect,
    DrawIndexedIndirect,
    DrawIndirectCount,
    DrawIndexedIndirectCount,
    DrawMeshTasksIndirect,
    DrawMeshTasksIndirectCount,
    Dispatch,
    DispatchIndirect,
    TraceRays,
    TraceRaysIndirect,
    CopyBufferToImage,
}

impl CommandKind {
    /// API name used in messages and rule identifiers.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::Draw => "vkCmdDraw",
            CommandKind::DrawIndexed => "vkCmdDrawIndexed",
            CommandKind::DrawIndirect => "vkCmdDrawIndirect",
            CommandKind::DrawIndexedIndirect => "vkCmdDrawIndexedIndirect",
            CommandKind::DrawIndirectCount => "vkCmdDrawIndirectCount",
            CommandKind::DrawIndexedIndirectCount => "vkCmdDrawIndexedIndirectCount",
            CommandKind::DrawMeshTasksIndirect => "vkCmdDrawMeshTasksIndirectEXT",
            CommandKind::DrawMeshTasksIndirectCount => "vkCmdDrawMeshTasksIndirectCountEXT",
            CommandKind::Dispatch => "vkCmdDispatch",
            CommandKind::DispatchIndirect => "vkCmdDispatchIndirect",
            CommandKind::TraceRays => "vkCmdTraceRaysKHR",
            CommandKind::TraceRaysIndirect => "vkCmdTraceRaysIndirectKHR",
            CommandKind::CopyBufferToImage => "vkCmdCopyBufferToImage",
        }
    }

    pub fn bind_point(&self) -> Option<PipelineBindPoint> {
        match self {
            CommandKind::Draw
            | CommandKind::DrawIndexed
            | CommandKind::DrawIndirect
            | CommandKind::DrawIndexedIndirect
            | CommandKind::DrawIndirectCount
            | CommandKind::DrawIndexedIndirectCount
            | CommandKind::DrawMeshTasksIndirect
            | CommandKind::DrawMeshTasksIndirectCount => Some(PipelineBindPoint::Graphics),
            CommandKind::Dispatch | CommandKind::DispatchIndirect => {
                Some(PipelineBindPoint::Compute)
            }
            CommandKind::TraceRays | CommandKind::TraceRaysIndirect => {
                Some(PipelineBindPoint::RayTracing)
            }
            CommandKind::CopyBufferToImage => None,
        }
    }

    pub fn is_indexed(&self) -> bool {
        matches!(
            self,
            CommandKind::DrawIndexed
                | CommandKind::DrawIndexedIndirect
                | CommandKind::DrawIndexedIndirectCount
        )
    }

    pub fn is_mesh(&self) -> bool {
        matches!(
            self,
            CommandKind::DrawMeshTasksIndirect | CommandKind::DrawMeshTasksIndirectCount
        )
    }
}

/// Parameters of an indirect draw as recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndirectDraw {
    pub buffer: RawBuffer,
    pub buffer_size: u64,
    pub offset: u64,
    pub stride: u32,

    /// `drawCount`, or `maxDrawCount` with a count buffer.
    pub draw_count: u32,
    pub count_buffer: Option<(RawBuffer, u64)>,

    /// Bound index buffer and its element count for indexed draws.
    pub index_buffer: Option<(RawBuffer, IndexType, u32)>,

    /// Mesh draw launches task shaders first.
    pub task_shader: bool,
}

/// What a pre-action validator checked, for messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionInfo {
    PreDraw(IndirectDraw),
    PreDispatch {
        buffer: RawBuffer,
        offset: u64,
    },
    PreTraceRays {
        address: DeviceAddress,
    },
    CopyBufferToImage {
        src: RawBuffer,
        dst: RawImage,
        format: CopyImageFormat,
        regions: u32,
    },
}

/// Resources of an injected pre-action validation command.
pub struct ActionResources {
    pub(crate) info: ActionInfo,

    /// Parameter set of the validation pipeline.
    pub(crate) set: Option<ManagedDescriptorSet>,
}

impl Debug for ActionResources {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ActionResources")
            .field("info", &self.info)
            .field("set", &self.set)
            .finish()
    }
}

impl ActionResources {
    pub fn info(&self) -> &ActionInfo {
        &self.info
    }
}

/// Everything needed to attribute error records of one validated command.
///
/// Position in the command buffer's list is the record's
/// `cmdResourceIndex`.
pub struct CommandResources {
    pub(crate) kind: CommandKind,
    pub(crate) operation_index: u32,

    /// Index into the command buffer's list of descriptor bindings.
    pub(crate) descriptor_binding_index: Option<usize>,
    pub(crate) validation_set: Option<ManagedDescriptorSet>,
    pub(crate) pipeline: Option<Arc<PipelineState>>,
    pub(crate) uses_robustness: bool,
    pub(crate) debug_region: Option<String>,
    pub(crate) action: Option<ActionResources>,
}

impl Debug for CommandResources {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("CommandResources")
                .field("kind", &self.kind)
                .field("operation_index", &self.operation_index)
                .field("descriptor_binding_index", &self.descriptor_binding_index)
                .field("validation_set", &self.validation_set)
                .field("pipeline", &self.pipeline)
                .field("uses_robustness", &self.uses_robustness)
                .field("debug_region", &self.debug_region)
                .field("action", &self.action)
                .finish()
        } else {
            write!(fmt, "{}#{}", self.kind.name(), self.operation_index)
        }
    }
}

impl CommandResources {
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Number of this command among commands of the same kind in the command
    /// buffer.
    pub fn operation_index(&self) -> u32 {
        self.operation_index
    }

    pub fn descriptor_binding_index(&self) -> Option<usize> {
        self.descriptor_binding_index
    }

    pub fn pipeline(&self) -> Option<&Arc<PipelineState>> {
        self.pipeline.as_ref()
    }

    pub fn uses_robustness(&self) -> bool {
        self.uses_robustness
    }

    pub fn debug_region(&self) -> Option<&str> {
        self.debug_region.as_deref()
    }

    pub fn action(&self) -> Option<&ActionResources> {
        self.action.as_ref()
    }
}

//! Diagnostic text and rule identifiers for decoded error records.

use {
    crate::{
        decode::{
            Axis, CopyBufferToImageError, DescriptorError, DescriptorErrorKind,
            GpuError, PreDispatchError, PreDrawError, PreTraceRaysError,
            RayQueryError,
        },
        descriptor::DescriptorType,
        device::DeviceLimits,
        instrument::ShaderRecord,
        preaction::mesh_group_limits,
        resources::{ActionInfo, CommandKind, CommandResources},
        spirv::SourceLocation,
        wire::RecordHeader,
    },
    std::fmt::Write as _,
};

/// Everything known about a record's origin.
pub(crate) struct MessageContext<'a> {
    pub resources: &'a CommandResources,
    pub header: &'a RecordHeader,

    /// Original program of `header.shader_id`.
    pub shader: Option<&'a ShaderRecord>,
    pub limits: &'a DeviceLimits,

    /// Type of the binding a descriptor error refers to.
    pub binding_type: Option<DescriptorType>,
}

/// Full message: error text, command, stage and source location.
pub(crate) fn compose(ctx: &MessageContext<'_>, error: &GpuError) -> String {
    let mut text = describe(ctx, error);
    let resources = ctx.resources;

    // Writing into `String` can't fail.
    let _ = write!(
        text,
        "\nCommand {} (operation {})",
        resources.kind().name(),
        resources.operation_index()
    );
    if let Some(region) = resources.debug_region() {
        let _ = write!(text, " in debug region \"{}\"", region);
    }

    if !error.is_pre_action() {
        if let Some(stage) = stage_info(ctx.header) {
            let _ = write!(text, "\n{}", stage);
        }
        let _ = write!(text, "\n{}", shader_info(ctx));
    }
    text
}

/// Identifier of the violated rule.
pub(crate) fn vuid(
    command: CommandKind,
    error: &GpuError,
    binding_type: Option<DescriptorType>,
) -> String {
    let cmd = command.name();
    match error {
        GpuError::Descriptor(DescriptorError { kind, .. }) => match kind {
            DescriptorErrorKind::IndexOutOfBounds { .. } => {
                format!("VUID-{}-None-10068", cmd)
            }
            DescriptorErrorKind::Uninitialized | DescriptorErrorKind::Destroyed => {
                format!("VUID-{}-None-08114", cmd)
            }
            DescriptorErrorKind::BufferOutOfBounds { .. } => {
                if binding_type.map_or(false, |ty| ty.is_uniform_buffer()) {
                    format!("VUID-{}-uniformBuffers-06935", cmd)
                } else {
                    format!("VUID-{}-storageBuffers-06936", cmd)
                }
            }
            DescriptorErrorKind::TexelOutOfBounds { .. } => {
                if binding_type == Some(DescriptorType::UniformTexelBuffer) {
                    format!("VUID-{}-None-08612", cmd)
                } else {
                    format!("VUID-{}-None-08613", cmd)
                }
            }
        },
        GpuError::DeviceAddress { .. } => {
            "UNASSIGNED-Device address out of bounds".to_owned()
        }
        GpuError::RayQuery(error) => {
            let code = match error {
                RayQueryError::OriginNan { .. }
                | RayQueryError::DirectionNan { .. }
                | RayQueryError::OriginFinite { .. }
                | RayQueryError::DirectionFinite { .. } => "06348",
                RayQueryError::NegativeMin { .. } | RayQueryError::NegativeMax { .. } => {
                    "06349"
                }
                RayQueryError::MinMax { .. } => "06350",
                RayQueryError::MinNan { .. } | RayQueryError::MaxNan { .. } => "06351",
                RayQueryError::BothSkip { .. } => "06889",
                RayQueryError::SkipCull { .. } => "06890",
                RayQueryError::Opaque { .. } => "06891",
            };
            format!("VUID-RuntimeSpirv-OpRayQueryInitializeKHR-{}", code)
        }
        GpuError::PreDraw(error) => pre_draw_vuid(command, error),
        GpuError::PreDispatch(PreDispatchError::CountLimit { axis, .. }) => {
            let code = match axis {
                Axis::X => "x-00417",
                Axis::Y => "y-00418",
                Axis::Z => "z-00419",
            };
            format!("VUID-VkDispatchIndirectCommand-{}", code)
        }
        GpuError::PreTraceRays(error) => {
            let code = match error {
                PreTraceRaysError::WidthLimit { .. } => "width-03638",
                PreTraceRaysError::HeightLimit { .. } => "height-03639",
                PreTraceRaysError::DepthLimit { .. } => "depth-03640",
                PreTraceRaysError::VolumeLimit { .. } => "width-03641",
            };
            format!("VUID-VkTraceRaysIndirectCommandKHR-{}", code)
        }
        GpuError::CopyBufferToImage(_) => {
            "VUID-vkCmdCopyBufferToImage-pRegions-07931".to_owned()
        }
    }
}

fn pre_draw_vuid(command: CommandKind, error: &PreDrawError) -> String {
    let cmd = command.name();
    match error {
        PreDrawError::CountLimit { .. } => format!("VUID-{}-countBuffer-02717", cmd),
        PreDrawError::BufferSize { .. } => match command {
            CommandKind::DrawIndexedIndirectCount => {
                format!("VUID-{}-countBuffer-03154", cmd)
            }
            CommandKind::DrawMeshTasksIndirectCount => {
                format!("VUID-{}-countBuffer-07099", cmd)
            }
            _ => format!("VUID-{}-countBuffer-03122", cmd),
        },
        PreDrawError::FirstInstance { .. } => {
            if command.is_indexed() {
                "VUID-VkDrawIndexedIndirectCommand-firstInstance-00554".to_owned()
            } else {
                "VUID-VkDrawIndirectCommand-firstInstance-00501".to_owned()
            }
        }
        PreDrawError::GroupCount { axis, .. } => {
            let code = match axis {
                Axis::X => "07322",
                Axis::Y => "07323",
                Axis::Z => "07324",
            };
            format!("VUID-VkDrawMeshTasksIndirectCommandEXT-TaskEXT-{}", code)
        }
        PreDrawError::GroupCountTotal { .. } => {
            "VUID-VkDrawMeshTasksIndirectCommandEXT-TaskEXT-07325".to_owned()
        }
        PreDrawError::IndexRange { .. } => {
            "VUID-VkDrawIndexedIndirectCommand-robustBufferAccess2-08798".to_owned()
        }
    }
}

fn describe(ctx: &MessageContext<'_>, error: &GpuError) -> String {
    match error {
        GpuError::Descriptor(error) => describe_descriptor(error, ctx.binding_type),
        GpuError::DeviceAddress {
            address,
            size,
            is_write,
        } => format!(
            "Out of bounds access: {} bytes {} at buffer device address {:#x}.",
            size,
            if *is_write { "written" } else { "read" },
            address
        ),
        GpuError::RayQuery(error) => describe_ray_query(error),
        GpuError::PreDraw(error) => describe_pre_draw(ctx, error),
        GpuError::PreDispatch(PreDispatchError::CountLimit { axis, count }) => format!(
            "Indirect dispatch VkDispatchIndirectCommand::{} of {} would exceed \
             maxComputeWorkGroupCount[{}] limit of {}.",
            axis.name(),
            count,
            axis.index(),
            ctx.limits.max_compute_work_group_count[axis.index()]
        ),
        GpuError::PreTraceRays(error) => describe_trace_rays(ctx.limits, error),
        GpuError::CopyBufferToImage(CopyBufferToImageError::DepthTexelRange {
            texel,
            bits,
            region,
        }) => format!(
            "Source buffer texel at index {} of region {} has value {} which is \
             outside the [0, 1] depth range of the D32_SFLOAT destination.",
            texel,
            region,
            f32::from_bits(*bits)
        ),
    }
}

fn describe_descriptor(error: &DescriptorError, ty: Option<DescriptorType>) -> String {
    let prefix = format!("(set = {}, binding = {})", error.set, error.binding);
    let what = ty.map_or("descriptor", |ty| ty.name());
    match error.kind {
        DescriptorErrorKind::IndexOutOfBounds { length } => format!(
            "{} Index of {} used to index {} array of length {}.",
            prefix, error.index, what, length
        ),
        DescriptorErrorKind::Uninitialized => format!(
            "{} Descriptor index {} is uninitialized.",
            prefix, error.index
        ),
        DescriptorErrorKind::Destroyed => format!(
            "{} Descriptor index {} references a resource that was destroyed.",
            prefix, error.index
        ),
        DescriptorErrorKind::BufferOutOfBounds { end, size } => format!(
            "{} Descriptor index {} access out of bounds. \
             Descriptor size is {} bytes and highest byte accessed was {}.",
            prefix, error.index, size, end
        ),
        DescriptorErrorKind::TexelOutOfBounds { texel, count } => format!(
            "{} Descriptor index {} access out of bounds. \
             Descriptor size is {} texels and highest texel accessed was {}.",
            prefix, error.index, count, texel
        ),
    }
}

fn describe_ray_query(error: &RayQueryError) -> String {
    let init = "OpRayQueryInitializeKHR operand";
    match *error {
        RayQueryError::NegativeMin { bits } => format!(
            "{} Ray Tmin value is negative. Ray Tmin = {}.",
            init,
            f32::from_bits(bits)
        ),
        RayQueryError::NegativeMax { bits } => format!(
            "{} Ray Tmax value is negative. Ray Tmax = {}.",
            init,
            f32::from_bits(bits)
        ),
        RayQueryError::BothSkip { flags } => format!(
            "{} Ray Flags ({:#x}) contains both SkipTrianglesKHR and SkipAABBsKHR.",
            init, flags
        ),
        RayQueryError::SkipCull { flags } => format!(
            "{} Ray Flags ({:#x}) contains both SkipTrianglesKHR and a cull triangles flag.",
            init, flags
        ),
        RayQueryError::Opaque { flags } => format!(
            "{} Ray Flags ({:#x}) contains more than one of OpaqueKHR, NoOpaqueKHR, \
             CullOpaqueKHR and CullNoOpaqueKHR.",
            init, flags
        ),
        RayQueryError::MinMax { min_bits, max_bits } => format!(
            "{} Ray Tmax is less than Ray Tmin. Ray Tmin = {}, Ray Tmax = {}.",
            init,
            f32::from_bits(min_bits),
            f32::from_bits(max_bits)
        ),
        RayQueryError::MinNan { .. } => format!("{} Ray Tmin is NaN.", init),
        RayQueryError::MaxNan { .. } => format!("{} Ray Tmax is NaN.", init),
        RayQueryError::OriginNan { .. } => {
            format!("{} Ray Origin contains a NaN.", init)
        }
        RayQueryError::DirectionNan { .. } => {
            format!("{} Ray Direction contains a NaN.", init)
        }
        RayQueryError::OriginFinite { .. } => {
            format!("{} Ray Origin contains a non-finite value.", init)
        }
        RayQueryError::DirectionFinite { .. } => {
            format!("{} Ray Direction contains a non-finite value.", init)
        }
    }
}

fn describe_pre_draw(ctx: &MessageContext<'_>, error: &PreDrawError) -> String {
    let draw = ctx.resources.action().and_then(|action| match action.info() {
        ActionInfo::PreDraw(draw) => Some(draw),
        _ => None,
    });
    let (group_count_limit, group_total_limit) = match draw {
        Some(draw) => mesh_group_limits(draw, ctx.limits),
        None => (
            ctx.limits.max_mesh_work_group_count,
            ctx.limits.max_mesh_work_group_total_count,
        ),
    };

    match *error {
        PreDrawError::CountLimit { count } => format!(
            "Indirect draw count of {} would exceed maxDrawIndirectCount limit of {}.",
            count, ctx.limits.max_draw_indirect_count
        ),
        PreDrawError::BufferSize { count, fit } => match draw {
            Some(draw) => format!(
                "Indirect draw count of {} would exceed size of buffer {:?}: \
                 {} bytes at offset {} with stride {} fit {} draws.",
                count, draw.buffer, draw.buffer_size, draw.offset, draw.stride, fit
            ),
            None => format!(
                "Indirect draw count of {} would exceed buffer size, \
                 it fits {} draws.",
                count, fit
            ),
        },
        PreDrawError::FirstInstance {
            draw: index,
            first_instance,
        } => format!(
            "The drawIndirectFirstInstance feature is not enabled, but the \
             firstInstance member of the indirect command at index {} is {}.",
            index, first_instance
        ),
        PreDrawError::GroupCount { axis, count } => format!(
            "Indirect draw group count {} of {} would exceed work group count \
             limit of {}.",
            axis.name().to_uppercase(),
            count,
            group_count_limit[axis.index()]
        ),
        PreDrawError::GroupCountTotal { total } => format!(
            "Indirect draw total group count of {} would exceed the work group \
             total count limit of {}.",
            total, group_total_limit
        ),
        PreDrawError::IndexRange { draw: index, end } => match draw
            .and_then(|draw| draw.index_buffer)
        {
            Some((buffer, _, elements)) => format!(
                "Indexed draw at index {} reads indices up to {} but index buffer \
                 {:?} holds {} indices.",
                index, end, buffer, elements
            ),
            None => format!(
                "Indexed draw at index {} reads indices up to {} beyond the bound \
                 index buffer.",
                index, end
            ),
        },
    }
}

fn describe_trace_rays(limits: &DeviceLimits, error: &PreTraceRaysError) -> String {
    let axis_limit = |i: usize| {
        u64::from(limits.max_compute_work_group_count[i])
            * u64::from(limits.max_compute_work_group_size[i])
    };
    match *error {
        PreTraceRaysError::WidthLimit { value } => format!(
            "Indirect trace rays width of {} would exceed \
             maxComputeWorkGroupCount[0] * maxComputeWorkGroupSize[0] limit of {}.",
            value,
            axis_limit(0)
        ),
        PreTraceRaysError::HeightLimit { value } => format!(
            "Indirect trace rays height of {} would exceed \
             maxComputeWorkGroupCount[1] * maxComputeWorkGroupSize[1] limit of {}.",
            value,
            axis_limit(1)
        ),
        PreTraceRaysError::DepthLimit { value } => format!(
            "Indirect trace rays depth of {} would exceed \
             maxComputeWorkGroupCount[2] * maxComputeWorkGroupSize[2] limit of {}.",
            value,
            axis_limit(2)
        ),
        PreTraceRaysError::VolumeLimit { value } => format!(
            "Indirect trace rays dimensions product of {} would exceed \
             maxRayDispatchInvocationCount limit of {}.",
            value, limits.max_ray_dispatch_invocation_count
        ),
    }
}

// SPIR-V execution models.
const VERTEX: u32 = 0;
const TESS_CONTROL: u32 = 1;
const TESS_EVAL: u32 = 2;
const GEOMETRY: u32 = 3;
const FRAGMENT: u32 = 4;
const COMPUTE: u32 = 5;
const TASK_NV: u32 = 5267;
const MESH_NV: u32 = 5268;
const RAY_GENERATION: u32 = 5313;
const INTERSECTION: u32 = 5314;
const ANY_HIT: u32 = 5315;
const CLOSEST_HIT: u32 = 5316;
const MISS: u32 = 5317;
const CALLABLE: u32 = 5318;
const TASK_EXT: u32 = 5364;
const MESH_EXT: u32 = 5365;

/// Stage name and invocation coordinates of a shader record.
pub(crate) fn stage_info(header: &RecordHeader) -> Option<String> {
    let [a, b, c] = header.stage_info;
    let text = match header.stage_id {
        VERTEX => format!(
            "Stage = Vertex. Vertex Index = {}, Instance Index = {}.",
            a, b
        ),
        TESS_CONTROL => format!(
            "Stage = Tessellation Control. Invocation ID = {}, Primitive ID = {}.",
            a, b
        ),
        TESS_EVAL => format!(
            "Stage = Tessellation Eval. Primitive ID = {}, TessCoord (u, v) = ({}, {}).",
            a,
            f32::from_bits(b),
            f32::from_bits(c)
        ),
        GEOMETRY => format!(
            "Stage = Geometry. Primitive ID = {}, Invocation ID = {}.",
            a, b
        ),
        FRAGMENT => format!(
            "Stage = Fragment. Fragment coord (x, y) = ({}, {}).",
            f32::from_bits(a),
            f32::from_bits(b)
        ),
        COMPUTE => format!(
            "Stage = Compute. Global invocation ID (x, y, z) = ({}, {}, {}).",
            a, b, c
        ),
        TASK_NV | TASK_EXT => format!(
            "Stage = Task. Global invocation ID (x, y, z) = ({}, {}, {}).",
            a, b, c
        ),
        MESH_NV | MESH_EXT => format!(
            "Stage = Mesh. Global invocation ID (x, y, z) = ({}, {}, {}).",
            a, b, c
        ),
        RAY_GENERATION | INTERSECTION | ANY_HIT | CLOSEST_HIT | MISS | CALLABLE => {
            let name = match header.stage_id {
                RAY_GENERATION => "Ray Generation",
                INTERSECTION => "Intersection",
                ANY_HIT => "Any Hit",
                CLOSEST_HIT => "Closest Hit",
                MISS => "Miss",
                _ => "Callable",
            };
            format!(
                "Stage = {}. Launch ID (x, y, z) = ({}, {}, {}).",
                name, a, b, c
            )
        }
        _ => return None,
    };
    Some(text)
}

fn shader_info(ctx: &MessageContext<'_>) -> String {
    let header = ctx.header;
    let shader = match ctx.shader {
        Some(shader) => shader,
        None => {
            return format!(
                "Shader {} is unknown, instruction {}.",
                header.shader_id, header.instruction
            )
        }
    };

    let mut text = match shader.name() {
        Some(name) => format!(
            "Shader \"{}\" (id {}), instruction {}.",
            name, header.shader_id, header.instruction
        ),
        None => format!(
            "Shader id {}, instruction {}.",
            header.shader_id, header.instruction
        ),
    };

    match shader.location(header.instruction) {
        Some(location) => write_location(&mut text, &location),
        None => text.push_str(
            "\nUnable to find source line information. \
             Build the shader with debug info to get source locations.",
        ),
    }
    text
}

fn write_location(text: &mut String, location: &SourceLocation) {
    let file = location.file.as_deref().unwrap_or("<unknown>");
    let _ = write!(text, "\nAt {}:{}", file, location.line);
    if location.column != 0 {
        let _ = write!(text, ":{}", location.column);
    }
    if let Some(source) = &location.source {
        let _ = write!(text, "\n{}: {}", location.line, source);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            decode::ErrorRecord,
            resources::{ActionResources, IndirectDraw},
            wire::group,
        },
    };

    fn resources(kind: CommandKind) -> CommandResources {
        CommandResources {
            kind,
            operation_index: 3,
            descriptor_binding_index: None,
            validation_set: None,
            pipeline: None,
            uses_robustness: false,
            debug_region: Some("shadows".to_owned()),
            action: None,
        }
    }

    #[test]
    fn descriptor_message_names_coordinates() {
        let error = GpuError::Descriptor(DescriptorError {
            set: 1,
            binding: 4,
            index: 7,
            kind: DescriptorErrorKind::Uninitialized,
        });
        let header = RecordHeader {
            shader_id: 12,
            instruction: 30,
            stage_id: COMPUTE,
            stage_info: [5, 6, 7],
            group: group::DESCRIPTOR,
            ..RecordHeader::default()
        };
        let resources = resources(CommandKind::Dispatch);
        let limits = DeviceLimits::default();
        let ctx = MessageContext {
            resources: &resources,
            header: &header,
            shader: None,
            limits: &limits,
            binding_type: Some(DescriptorType::StorageBuffer),
        };

        let text = compose(&ctx, &error);
        assert!(text.contains("(set = 1, binding = 4)"), "{}", text);
        assert!(text.contains("Descriptor index 7 is uninitialized"), "{}", text);
        assert!(text.contains("vkCmdDispatch (operation 3)"), "{}", text);
        assert!(text.contains("\"shadows\""), "{}", text);
        assert!(text.contains("(5, 6, 7)"), "{}", text);
        assert!(text.contains("Shader 12 is unknown, instruction 30"), "{}", text);
        assert_eq!(
            vuid(CommandKind::Dispatch, &error, ctx.binding_type),
            "VUID-vkCmdDispatch-None-08114"
        );
    }

    #[test]
    fn decoded_record_keeps_parameters_in_text() {
        let error = GpuError::PreDraw(PreDrawError::CountLimit { count: 5 });
        let (subcode, payload) = error.encode();
        let words = RecordHeader::pre_action(0, 0, group::PRE_DRAW, subcode).encode(&payload);
        let record = ErrorRecord::decode(&words).unwrap();
        assert_eq!(record.error, error);

        let resources = resources(CommandKind::DrawIndirectCount);
        let limits = DeviceLimits {
            max_draw_indirect_count: 3,
            ..DeviceLimits::default()
        };
        let ctx = MessageContext {
            resources: &resources,
            header: &record.header,
            shader: None,
            limits: &limits,
            binding_type: None,
        };
        let text = compose(&ctx, &record.error);
        assert!(text.starts_with(
            "Indirect draw count of 5 would exceed maxDrawIndirectCount limit of 3."
        ));
        // Pre-action records carry no shader context.
        assert!(!text.contains("Shader"));
        assert_eq!(
            vuid(resources.kind(), &record.error, None),
            "VUID-vkCmdDrawIndirectCount-countBuffer-02717"
        );
    }

    #[test]
    fn buffer_out_of_bounds_rule_depends_on_binding_type() {
        let error = GpuError::Descriptor(DescriptorError {
            set: 0,
            binding: 0,
            index: 0,
            kind: DescriptorErrorKind::BufferOutOfBounds { end: 68, size: 64 },
        });
        assert_eq!(
            vuid(CommandKind::Draw, &error, Some(DescriptorType::UniformBuffer)),
            "VUID-vkCmdDraw-uniformBuffers-06935"
        );
        assert_eq!(
            vuid(CommandKind::Draw, &error, Some(DescriptorType::StorageBuffer)),
            "VUID-vkCmdDraw-storageBuffers-06936"
        );
    }

    #[test]
    fn fragment_coordinates_are_floats() {
        let header = RecordHeader {
            stage_id: FRAGMENT,
            stage_info: [1.5f32.to_bits(), 20.5f32.to_bits(), 0],
            ..RecordHeader::default()
        };
        assert_eq!(
            stage_info(&header).unwrap(),
            "Stage = Fragment. Fragment coord (x, y) = (1.5, 20.5)."
        );

        let header = RecordHeader {
            stage_id: 9999,
            ..RecordHeader::default()
        };
        assert_eq!(stage_info(&header), None);
    }

    #[test]
    fn mesh_group_limit_follows_bound_stages() {
        let limits = DeviceLimits {
            max_task_work_group_count: [100; 3],
            max_mesh_work_group_count: [10000; 3],
            ..DeviceLimits::default()
        };
        let error = GpuError::PreDraw(PreDrawError::GroupCount {
            axis: Axis::X,
            count: 500,
        });
        let header = RecordHeader::default();

        let text = |task_shader| {
            let mut resources = resources(CommandKind::DrawMeshTasksIndirect);
            resources.action = Some(ActionResources {
                info: ActionInfo::PreDraw(IndirectDraw {
                    buffer: crate::device::RawBuffer(2),
                    buffer_size: 12,
                    offset: 0,
                    stride: 12,
                    draw_count: 1,
                    count_buffer: None,
                    index_buffer: None,
                    task_shader,
                }),
                set: None,
            });
            let ctx = MessageContext {
                resources: &resources,
                header: &header,
                shader: None,
                limits: &limits,
                binding_type: None,
            };
            describe(&ctx, &error)
        };

        assert_eq!(
            text(false),
            "Indirect draw group count X of 500 would exceed work group count limit of 10000."
        );
        assert_eq!(
            text(true),
            "Indirect draw group count X of 500 would exceed work group count limit of 100."
        );
    }

    #[test]
    fn location_without_file_is_still_printed() {
        let mut text = String::new();
        write_location(
            &mut text,
            &SourceLocation {
                file: None,
                line: 12,
                column: 0,
                source: None,
            },
        );
        assert_eq!(text, "\nAt <unknown>:12");

        let mut text = String::new();
        write_location(
            &mut text,
            &SourceLocation {
                file: Some("blur.comp".to_owned()),
                line: 4,
                column: 9,
                source: Some("x = y;".to_owned()),
            },
        );
        assert_eq!(text, "\nAt blur.comp:4:9\n4: x = y;");
    }
}

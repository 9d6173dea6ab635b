use {
    super::{max_indirect_count, word, ActionOutput},
    crate::{
        decode::{Axis, GpuError, PreDrawError},
        device::{DeviceFeatures, DeviceLimits},
        resources::{CommandKind, IndirectDraw},
        settings::Settings,
        wire::{draw_struct, pre_draw_flags, PreDrawPushConstants},
    },
    std::convert::TryFrom as _,
};

fn struct_words(kind: CommandKind) -> u32 {
    if kind.is_mesh() {
        draw_struct::MESH
    } else if kind.is_indexed() {
        draw_struct::DRAW_INDEXED
    } else {
        draw_struct::DRAW
    }
}

/// Group count limits that apply to an indirect mesh draw.
/// Task shaders are launched first when present, otherwise mesh shaders.
pub(crate) fn mesh_group_limits(draw: &IndirectDraw, limits: &DeviceLimits) -> ([u32; 3], u32) {
    if draw.task_shader {
        (
            limits.max_task_work_group_count,
            limits.max_task_work_group_total_count,
        )
    } else {
        (
            limits.max_mesh_work_group_count,
            limits.max_mesh_work_group_total_count,
        )
    }
}

/// Packs checks an indirect draw needs.
/// Returns `None` when nothing about the draw needs the device.
pub(crate) fn pre_draw_constants(
    kind: CommandKind,
    draw: &IndirectDraw,
    limits: &DeviceLimits,
    features: &DeviceFeatures,
    settings: &Settings,
) -> Option<PreDrawPushConstants> {
    if !settings.validate_indirect_draws_buffers {
        return None;
    }

    let struct_words = struct_words(kind);
    let mut flags = 0;

    if draw.count_buffer.is_some() {
        flags |= pre_draw_flags::COUNT_BUFFER;
    }
    if kind.is_mesh() {
        flags |= pre_draw_flags::MESH;
    } else if !features.draw_indirect_first_instance {
        flags |= pre_draw_flags::CHECK_FIRST_INSTANCE;
    }
    if kind.is_indexed() {
        flags |= pre_draw_flags::INDEXED;
        if settings.validate_index_buffers && draw.index_buffer.is_some() {
            flags |= pre_draw_flags::CHECK_INDEX_RANGE;
        }
    }

    let checks = pre_draw_flags::COUNT_BUFFER
        | pre_draw_flags::MESH
        | pre_draw_flags::CHECK_FIRST_INSTANCE
        | pre_draw_flags::CHECK_INDEX_RANGE;
    if flags & checks == 0 {
        return None;
    }

    let stride = if draw.stride == 0 {
        4 * struct_words
    } else {
        draw.stride
    };

    let (group_count_limit, group_total_limit) = if kind.is_mesh() {
        mesh_group_limits(draw, limits)
    } else {
        ([0; 3], 0)
    };

    Some(PreDrawPushConstants {
        flags,
        draw_offset_words: (draw.offset / 4) as u32,
        stride_words: stride / 4,
        draw_count: draw.draw_count,
        count_offset_words: draw.count_buffer.map_or(0, |(_, offset)| (offset / 4) as u32),
        max_draw_indirect_count: limits.max_draw_indirect_count,
        buffer_fit_count: max_indirect_count(
            draw.buffer_size,
            draw.offset,
            4 * u64::from(struct_words),
            u64::from(stride),
        ),
        struct_words,
        index_buffer_elements: draw.index_buffer.map_or(0, |(_, _, elements)| elements),
        group_count_limit,
        group_total_limit,
    })
}

/// Device half of draw validation.
///
/// `params` is the indirect buffer, `count` the count buffer when
/// [`pre_draw_flags::COUNT_BUFFER`] is set.
pub fn evaluate_pre_draw(
    pc: &PreDrawPushConstants,
    params: &[u32],
    count: &[u32],
    out: &mut ActionOutput<'_>,
) {
    let mut draws = pc.draw_count;

    if pc.flags & pre_draw_flags::COUNT_BUFFER != 0 {
        let value = word(count, u64::from(pc.count_offset_words));
        if value > pc.max_draw_indirect_count {
            out.report(GpuError::PreDraw(PreDrawError::CountLimit { count: value }));
            return;
        }
        draws = value.min(pc.draw_count);
        if draws > pc.buffer_fit_count {
            out.report(GpuError::PreDraw(PreDrawError::BufferSize {
                count: value,
                fit: pc.buffer_fit_count,
            }));
            return;
        }
    }

    // Draws past the buffer were reported above or by host validation.
    let draws = draws.min(pc.buffer_fit_count);
    for draw in 0..draws {
        let base = u64::from(pc.draw_offset_words) + u64::from(draw) * u64::from(pc.stride_words);

        if pc.flags & pre_draw_flags::CHECK_FIRST_INSTANCE != 0 {
            let at = if pc.flags & pre_draw_flags::INDEXED != 0 {
                draw_struct::DRAW_INDEXED_FIRST_INSTANCE
            } else {
                draw_struct::DRAW_FIRST_INSTANCE
            };
            let first_instance = word(params, base + at as u64);
            if first_instance != 0 {
                out.report(GpuError::PreDraw(PreDrawError::FirstInstance {
                    draw,
                    first_instance,
                }));
            }
        }

        if pc.flags & pre_draw_flags::CHECK_INDEX_RANGE != 0 {
            let index_count = word(params, base + draw_struct::DRAW_INDEXED_INDEX_COUNT as u64);
            let first_index = word(params, base + draw_struct::DRAW_INDEXED_FIRST_INDEX as u64);
            let end = u64::from(first_index) + u64::from(index_count);
            if index_count != 0 && end > u64::from(pc.index_buffer_elements) {
                out.report(GpuError::PreDraw(PreDrawError::IndexRange {
                    draw,
                    end: u32::try_from(end).unwrap_or(u32::MAX),
                }));
            }
        }

        if pc.flags & pre_draw_flags::MESH != 0 {
            let groups = [word(params, base), word(params, base + 1), word(params, base + 2)];
            let mut in_limits = true;
            for (axis, (&count, &limit)) in [Axis::X, Axis::Y, Axis::Z]
                .iter()
                .zip(groups.iter().zip(&pc.group_count_limit))
            {
                if count > limit {
                    in_limits = false;
                    out.report(GpuError::PreDraw(PreDrawError::GroupCount {
                        axis: *axis,
                        count,
                    }));
                }
            }
            let total = groups.iter().map(|&g| u64::from(g)).product::<u64>();
            if in_limits && total > u64::from(pc.group_total_limit) {
                out.report(GpuError::PreDraw(PreDrawError::GroupCountTotal {
                    total: u32::try_from(total).unwrap_or(u32::MAX),
                }));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            decode::{walk_records, ErrorRecord},
            device::RawBuffer,
            wire::{output, CommandIndices, RECORD_WORDS},
        },
    };

    fn run(pc: &PreDrawPushConstants, params: &[u32], count: &[u32]) -> Vec<GpuError> {
        let mut buffer = vec![0u32; output::DATA + 16 * RECORD_WORDS];
        let mut counts = vec![0u32; 1];
        let indices = CommandIndices {
            max_errors: 16,
            ..CommandIndices::default()
        };
        let mut out = ActionOutput::new(&mut buffer, &mut counts, indices);
        evaluate_pre_draw(pc, params, count, &mut out);

        let written = buffer[output::WRITTEN];
        walk_records(&buffer[output::DATA..], written)
            .map(|record| ErrorRecord::decode(record).unwrap().error)
            .collect()
    }

    fn count_draw(buffer_size: u64, max_draw_count: u32) -> IndirectDraw {
        IndirectDraw {
            buffer: RawBuffer(1),
            buffer_size,
            offset: 0,
            stride: 16,
            draw_count: max_draw_count,
            count_buffer: Some((RawBuffer(2), 0)),
            index_buffer: None,
            task_shader: false,
        }
    }

    #[test]
    fn count_above_device_limit_stops() {
        let limits = DeviceLimits {
            max_draw_indirect_count: 3,
            ..DeviceLimits::default()
        };
        let features = DeviceFeatures {
            draw_indirect_first_instance: true,
            ..DeviceFeatures::default()
        };
        let pc = pre_draw_constants(
            CommandKind::DrawIndirectCount,
            &count_draw(16 * 8, 8),
            &limits,
            &features,
            &Settings::default(),
        )
        .unwrap();

        let errors = run(&pc, &[0; 32], &[5]);
        assert_eq!(
            errors,
            [GpuError::PreDraw(PreDrawError::CountLimit { count: 5 })]
        );
    }

    #[test]
    fn count_above_buffer_fit() {
        let features = DeviceFeatures {
            draw_indirect_first_instance: true,
            ..DeviceFeatures::default()
        };
        let pc = pre_draw_constants(
            CommandKind::DrawIndirectCount,
            &count_draw(16 * 2, 8),
            &DeviceLimits::default(),
            &features,
            &Settings::default(),
        )
        .unwrap();
        assert_eq!(pc.buffer_fit_count, 2);

        let errors = run(&pc, &[0; 8], &[4]);
        assert_eq!(
            errors,
            [GpuError::PreDraw(PreDrawError::BufferSize { count: 4, fit: 2 })]
        );

        // Clamped by `maxDrawCount` first.
        assert!(run(&pc, &[0; 8], &[2]).is_empty());
    }

    #[test]
    fn first_instance_without_feature() {
        let draw = IndirectDraw {
            buffer: RawBuffer(1),
            buffer_size: 64,
            offset: 0,
            stride: 16,
            draw_count: 3,
            count_buffer: None,
            index_buffer: None,
            task_shader: false,
        };
        let pc = pre_draw_constants(
            CommandKind::DrawIndirect,
            &draw,
            &DeviceLimits::default(),
            &DeviceFeatures::default(),
            &Settings::default(),
        )
        .unwrap();

        #[rustfmt::skip]
        let params = [
            3, 1, 0, 0,
            3, 1, 0, 9,
            3, 1, 0, 0,
        ];
        assert_eq!(
            run(&pc, &params, &[]),
            [GpuError::PreDraw(PreDrawError::FirstInstance {
                draw: 1,
                first_instance: 9
            })]
        );

        let features = DeviceFeatures {
            draw_indirect_first_instance: true,
            ..DeviceFeatures::default()
        };
        assert_eq!(
            pre_draw_constants(
                CommandKind::DrawIndirect,
                &draw,
                &DeviceLimits::default(),
                &features,
                &Settings::default(),
            ),
            None
        );
    }

    #[test]
    fn indexed_range_against_index_buffer() {
        let draw = IndirectDraw {
            buffer: RawBuffer(1),
            buffer_size: 40,
            offset: 0,
            stride: 20,
            draw_count: 2,
            count_buffer: None,
            index_buffer: Some((RawBuffer(3), crate::command::IndexType::U16, 100)),
            task_shader: false,
        };
        let features = DeviceFeatures {
            draw_indirect_first_instance: true,
            ..DeviceFeatures::default()
        };
        let pc = pre_draw_constants(
            CommandKind::DrawIndexedIndirect,
            &draw,
            &DeviceLimits::default(),
            &features,
            &Settings::default(),
        )
        .unwrap();

        #[rustfmt::skip]
        let params = [
            60, 1, 40, 0, 0,
            60, 1, 41, 0, 0,
        ];
        assert_eq!(
            run(&pc, &params, &[]),
            [GpuError::PreDraw(PreDrawError::IndexRange { draw: 1, end: 101 })]
        );
    }

    #[test]
    fn mesh_group_counts() {
        let draw = IndirectDraw {
            buffer: RawBuffer(1),
            buffer_size: 24,
            offset: 0,
            stride: 12,
            draw_count: 2,
            count_buffer: None,
            index_buffer: None,
            task_shader: true,
        };
        let limits = DeviceLimits {
            max_task_work_group_count: [100, 100, 100],
            max_task_work_group_total_count: 1000,
            max_mesh_work_group_count: [10000; 3],
            max_mesh_work_group_total_count: 100_000,
            ..DeviceLimits::default()
        };
        let pc = pre_draw_constants(
            CommandKind::DrawMeshTasksIndirect,
            &draw,
            &limits,
            &DeviceFeatures::default(),
            &Settings::default(),
        )
        .unwrap();

        let params = [101, 1, 1, 50, 50, 1];
        assert_eq!(
            run(&pc, &params, &[]),
            [
                GpuError::PreDraw(PreDrawError::GroupCount {
                    axis: Axis::X,
                    count: 101
                }),
                GpuError::PreDraw(PreDrawError::GroupCountTotal { total: 2500 }),
            ]
        );
    }

    #[test]
    fn mesh_limits_apply_without_task_shader() {
        let draw = IndirectDraw {
            buffer: RawBuffer(1),
            buffer_size: 12,
            offset: 0,
            stride: 12,
            draw_count: 1,
            count_buffer: None,
            index_buffer: None,
            task_shader: false,
        };
        let limits = DeviceLimits {
            max_task_work_group_count: [100; 3],
            max_mesh_work_group_count: [10000; 3],
            max_mesh_work_group_total_count: 100_000,
            ..DeviceLimits::default()
        };
        assert_eq!(
            mesh_group_limits(&draw, &limits),
            ([10000; 3], 100_000)
        );
        let pc = pre_draw_constants(
            CommandKind::DrawMeshTasksIndirect,
            &draw,
            &limits,
            &DeviceFeatures::default(),
            &Settings::default(),
        )
        .unwrap();

        assert!(run(&pc, &[500, 1, 1], &[]).is_empty());
        assert_eq!(
            run(&pc, &[10001, 1, 1], &[]),
            [GpuError::PreDraw(PreDrawError::GroupCount {
                axis: Axis::X,
                count: 10001
            })]
        );
    }
}

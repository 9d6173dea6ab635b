use {
    super::{word, ActionOutput},
    crate::{
        decode::{Axis, GpuError, PreDispatchError},
        device::DeviceLimits,
        settings::Settings,
        wire::PreDispatchPushConstants,
    },
};

pub(crate) fn pre_dispatch_constants(
    offset: u64,
    limits: &DeviceLimits,
    settings: &Settings,
) -> Option<PreDispatchPushConstants> {
    if !settings.validate_indirect_dispatches_buffers {
        return None;
    }
    Some(PreDispatchPushConstants {
        offset_words: (offset / 4) as u32,
        limit: limits.max_compute_work_group_count,
    })
}

/// Device half of dispatch validation. `params` is the indirect buffer.
pub fn evaluate_pre_dispatch(
    pc: &PreDispatchPushConstants,
    params: &[u32],
    out: &mut ActionOutput<'_>,
) {
    let base = u64::from(pc.offset_words);
    for (i, axis) in [Axis::X, Axis::Y, Axis::Z].iter().enumerate() {
        let count = word(params, base + i as u64);
        if count > pc.limit[i] {
            out.report(GpuError::PreDispatch(PreDispatchError::CountLimit {
                axis: *axis,
                count,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            decode::{walk_records, ErrorRecord},
            wire::{output, CommandIndices, RECORD_WORDS},
        },
    };

    #[test]
    fn each_axis_is_checked() {
        let limits = DeviceLimits {
            max_compute_work_group_count: [10, 20, 30],
            ..DeviceLimits::default()
        };
        let pc = pre_dispatch_constants(8, &limits, &Settings::default()).unwrap();
        assert_eq!(pc.offset_words, 2);

        let mut buffer = vec![0u32; output::DATA + 4 * RECORD_WORDS];
        let mut counts = vec![0u32; 1];
        let indices = CommandIndices {
            max_errors: 4,
            ..CommandIndices::default()
        };
        let mut out = ActionOutput::new(&mut buffer, &mut counts, indices);
        evaluate_pre_dispatch(&pc, &[99, 99, 10, 21, 30], &mut out);

        let written = buffer[output::WRITTEN];
        let errors: Vec<_> = walk_records(&buffer[output::DATA..], written)
            .map(|record| ErrorRecord::decode(record).unwrap().error)
            .collect();
        assert_eq!(
            errors,
            [GpuError::PreDispatch(PreDispatchError::CountLimit {
                axis: Axis::Y,
                count: 21
            })]
        );
    }

    #[test]
    fn disabled_by_settings() {
        let settings = Settings {
            validate_indirect_dispatches_buffers: false,
            ..Settings::default()
        };
        assert_eq!(
            pre_dispatch_constants(0, &DeviceLimits::default(), &settings),
            None
        );
    }
}

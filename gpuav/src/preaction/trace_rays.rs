use {
    super::ActionOutput,
    crate::{
        decode::{GpuError, PreTraceRaysError},
        device::DeviceLimits,
        settings::Settings,
        split_u64,
        wire::PreTraceRaysPushConstants,
        DeviceAddress,
    },
    std::convert::TryFrom as _,
};

pub(crate) fn pre_trace_rays_constants(
    address: DeviceAddress,
    limits: &DeviceLimits,
    settings: &Settings,
) -> Option<PreTraceRaysPushConstants> {
    if !settings.validate_indirect_trace_rays_buffers {
        return None;
    }

    let mut limit = [0; 3];
    for (i, limit) in limit.iter_mut().enumerate() {
        let value = u64::from(limits.max_compute_work_group_count[i])
            * u64::from(limits.max_compute_work_group_size[i]);
        *limit = u32::try_from(value).unwrap_or(u32::MAX);
    }

    let [address_lo, address_hi] = split_u64(address.get());
    Some(PreTraceRaysPushConstants {
        address_lo,
        address_hi,
        limit,
        max_invocations: limits.max_ray_dispatch_invocation_count,
    })
}

/// Device half of trace rays validation.
/// `extent` is `{width, height, depth}` read from the indirect address.
pub fn evaluate_pre_trace_rays(
    pc: &PreTraceRaysPushConstants,
    extent: [u32; 3],
    out: &mut ActionOutput<'_>,
) {
    let [width, height, depth] = extent;
    if width > pc.limit[0] {
        out.report(GpuError::PreTraceRays(PreTraceRaysError::WidthLimit {
            value: width.into(),
        }));
    }
    if height > pc.limit[1] {
        out.report(GpuError::PreTraceRays(PreTraceRaysError::HeightLimit {
            value: height.into(),
        }));
    }
    if depth > pc.limit[2] {
        out.report(GpuError::PreTraceRays(PreTraceRaysError::DepthLimit {
            value: depth.into(),
        }));
    }

    let volume = u64::from(width) * u64::from(height) * u64::from(depth);
    if volume > u64::from(pc.max_invocations) {
        out.report(GpuError::PreTraceRays(PreTraceRaysError::VolumeLimit {
            value: volume,
        }));
    }
}

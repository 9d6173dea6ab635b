mod common;

use {
    common::{program, recorded, shader_words, Harness},
    gpuav::{
        backend::software::{RayQueryArgs, Recorded, SoftDevice},
        BufferInfo, BufferUsage, CommandBufferError, CommandBufferState, DescriptorSetLayoutInfo,
        DeviceFeatures, DeviceLimits, DeviceTrait as _, PipelineBindPoint, Settings, Severity,
        Command, CommandBuffer, CommandSink, SubmitError, ValidationPipelineKind, SETUP_VUID,
    },
    std::any::Any,
    rspirv::spirv::ExecutionModel,
};

fn limited_device() -> SoftDevice {
    let limits = DeviceLimits {
        max_draw_indirect_count: 3,
        ..DeviceLimits::default()
    };
    let features = DeviceFeatures {
        draw_indirect_first_instance: true,
        ..DeviceFeatures::default()
    };
    SoftDevice::new(limits, features)
}

fn indirect(size: u64) -> BufferInfo {
    BufferInfo {
        size,
        usage: BufferUsage::INDIRECT,
    }
}

#[test]
fn setup_failure_disables_validation() {
    let h = Harness::new(
        limited_device().with_memory_limit(64 * 1024),
        Settings::default(),
        false,
    );
    assert!(h.validator.is_aborted());

    let diagnostics = h.reporter.take();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0].severity, Severity::Error);
    assert_eq!(diagnostics[0].vuid, SETUP_VUID);
    assert!(diagnostics[0]
        .message
        .ends_with("GPU-assisted validation is disabled"));

    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::Vertex,
        Vec::new(),
        &[],
        program(|_| {}),
    );
    let params = h.buffer(indirect(64));
    let count = h.buffer(indirect(4));
    h.device.write_words(count.raw(), 0, &[5]);

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.draw_indirect_count(&params, 0, &count, 0, 4, 16);
    cb.end().unwrap();
    assert_eq!(cb.command_count(), 0);
    assert_eq!(recorded(&mut cb).len(), 2);

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    assert_eq!(queue.wait_idle().unwrap(), 0);
    assert!(h.reporter.is_empty());
}

#[test]
fn deferred_submission_is_processed_after_completion() {
    let h = Harness::new(limited_device(), Settings::default(), false);
    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::Vertex,
        Vec::new(),
        &[],
        program(|_| {}),
    );
    let params = h.buffer(indirect(64));
    let count = h.buffer(indirect(4));
    h.device.write_words(count.raw(), 0, &[7]);

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.draw_indirect_count(&params, 0, &count, 0, 4, 16);
    cb.end().unwrap();

    let mut queue = h.deferred_queue();
    queue.submit(&mut [&mut cb]).unwrap();
    assert_eq!(queue.pending_count(), 1);
    assert_eq!(queue.poll(), 0);
    assert_eq!(cb.state(), CommandBufferState::Submitted);
    assert!(h.reporter.is_empty());

    assert!(matches!(cb.begin(), Err(CommandBufferError::Pending)));
    assert!(matches!(
        queue.submit(&mut [&mut cb]),
        Err(SubmitError::CommandBuffer { index: 0, .. })
    ));

    assert_eq!(queue.wait_idle().unwrap(), 1);
    assert_eq!(queue.pending_count(), 0);
    assert_eq!(cb.state(), CommandBufferState::Processed);
    assert_eq!(h.reporter.len(), 1);
}

#[test]
fn unsupported_validation_pipeline_skips_checks() {
    let h = Harness::new(
        limited_device().with_unsupported_pipeline(ValidationPipelineKind::PreDraw),
        Settings::default(),
        false,
    );
    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::Vertex,
        Vec::new(),
        &[],
        program(|_| {}),
    );
    let params = h.buffer(indirect(64));
    let count = h.buffer(indirect(4));
    h.device.write_words(count.raw(), 0, &[5]);

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.draw_indirect_count(&params, 0, &count, 0, 4, 16);
    cb.end().unwrap();

    let commands = recorded(&mut cb);
    assert_eq!(commands.len(), 2);
    assert!(matches!(commands[1], Recorded::DrawIndirectCount { .. }));

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    assert_eq!(queue.wait_idle().unwrap(), 0);
    assert!(!h.validator.is_aborted());
}

#[test]
fn device_address_outside_buffers_is_reported() {
    let h = Harness::instrumented();
    let buffer = h.buffer(BufferInfo::storage(64));
    let address = buffer.address.unwrap().get();

    let app = h.pipeline(
        PipelineBindPoint::Compute,
        ExecutionModel::GLCompute,
        Vec::new(),
        &[],
        program(move |invocation| {
            invocation.store(address, 7);
            invocation.at(12).access_address(address + 60, 8, false);
        }),
    );

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.dispatch([1, 1, 1]);
    cb.end().unwrap();

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    assert_eq!(queue.wait_idle().unwrap(), 1);
    assert_eq!(h.device.buffer_words(buffer.raw())[0], 7);

    let diagnostics = h.reporter.take();
    assert_eq!(diagnostics[0].vuid, "UNASSIGNED-Device address out of bounds");
    assert!(diagnostics[0].message.starts_with(&format!(
        "Out of bounds access: 8 bytes read at buffer device address {:#x}.",
        address + 60
    )));

    // Destroyed buffers leave the address table.
    h.validator.destroy_buffer(&buffer);
    queue.submit(&mut [&mut cb]).unwrap();
    assert_eq!(queue.wait_idle().unwrap(), 2);
    let diagnostics = h.reporter.take();
    assert!(diagnostics[0].message.contains("4 bytes written"));
}

#[test]
fn ray_query_arguments_are_checked() {
    let h = Harness::instrumented();
    let app = h.pipeline(
        PipelineBindPoint::Compute,
        ExecutionModel::GLCompute,
        Vec::new(),
        &[],
        program(|invocation| {
            invocation.initialize_ray_query(&RayQueryArgs {
                flags: 0,
                cull_mask: 0xff,
                origin: [0.0; 3],
                t_min: -1.0,
                direction: [0.0, 0.0, 1.0],
                t_max: 10.0,
            });
        }),
    );

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.dispatch([1, 1, 1]);
    cb.end().unwrap();

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    assert_eq!(queue.wait_idle().unwrap(), 1);

    let diagnostics = h.reporter.take();
    assert_eq!(
        diagnostics[0].vuid,
        "VUID-RuntimeSpirv-OpRayQueryInitializeKHR-06349"
    );
}

#[test]
fn layout_taking_validation_slot_keeps_original_shaders() {
    let h = Harness::instrumented();
    let slot = h.validator.validation_slot() as usize;

    let raw_set_layout = h.device.create_descriptor_set_layout(&[]).unwrap();
    let set_layout = h
        .validator
        .create_descriptor_set_layout(raw_set_layout, DescriptorSetLayoutInfo::default());
    let sets = vec![set_layout; slot + 1];
    let raw_sets: Vec<_> = sets.iter().map(|set| set.raw()).collect();

    let raw_layout = h.device.create_pipeline_layout(&raw_sets, &[]).unwrap();
    let layout = h.validator.create_pipeline_layout(raw_layout, &sets, &[]);
    assert!(layout.instrumented().is_none());

    let original = shader_words();
    let shader = h.validator.create_shader_module(&original, Some("crowded"));
    assert!(shader.is_instrumented());

    let shaders = h.validator.pipeline_shaders(&layout, &[shader]);
    assert!(!shaders[0].is_instrumented());
    assert_eq!(&shaders[0].code()[..], &original[..]);
    assert_eq!(h.validator.pipeline_create_layout(&layout, &shaders), raw_layout);
}

/// Sink of some other device.
#[derive(Debug, Default)]
struct OtherDeviceSink;

impl CommandSink for OtherDeviceSink {
    fn record(&mut self, _command: Command<'_>) {}

    fn reset(&mut self) {}

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[test]
fn foreign_command_buffer_is_rejected() {
    let h = Harness::instrumented();
    let mut own = h.command_buffer();
    own.begin().unwrap();
    own.end().unwrap();
    let mut other = CommandBuffer::new(&h.validator, Box::new(OtherDeviceSink));
    other.begin().unwrap();
    other.end().unwrap();

    let mut queue = h.queue();
    match queue.submit(&mut [&mut own, &mut other]) {
        Err(SubmitError::ForeignCommandBuffer { index: 1 }) => {}
        result => panic!("Expected foreign command buffer error, got {:?}", result),
    }
    assert_eq!(queue.pending_count(), 0);
}

#[test]
fn destroyed_shader_module_outlives_its_pipeline_only() {
    let h = Harness::instrumented();
    let module = h.validator.create_shader_module(&shader_words(), Some("tonemap"));
    assert!(module.is_instrumented());
    let id = module.shader_id();

    let again = h.validator.create_shader_module(&shader_words(), Some("tonemap"));
    assert_eq!(again.shader_id(), id);
    assert_eq!(again.code(), module.code());

    let pipeline_copy = module.clone();
    h.validator.destroy_shader_module(module);
    h.validator.destroy_shader_module(again);
    assert!(h.validator.instrumenter().shader(id).is_some());

    drop(pipeline_copy);
    assert!(h.validator.instrumenter().shader(id).is_none());
}

mod common;

use {
    common::{program, recorded, storage_binding, AppPipeline, Harness},
    gpuav::{
        backend::software::Recorded, BufferInfo, BufferRange, BufferState, BufferUsage,
        CommandBuffer, DescriptorSetState, Descriptors, PipelineBindPoint, PushConstantRange,
        Severity, ShaderStageFlags, WriteDescriptorSet,
    },
    rspirv::spirv::ExecutionModel,
    std::{convert::TryInto as _, sync::Arc},
};

fn word(bytes: &[u8], index: usize) -> u32 {
    bytes
        .get(4 * index..4 * index + 4)
        .map_or(0, |b| u32::from_le_bytes(b.try_into().unwrap()))
}

fn compute(h: &Harness) -> AppPipeline {
    compute_array(h, 2)
}

/// Reads `size` bytes of element `push_constants[0]` of binding 0 at offset
/// `push_constants[1]`. Binding 0 is an array of `count` storage buffers.
fn compute_array(h: &Harness, count: u32) -> AppPipeline {
    h.pipeline(
        PipelineBindPoint::Compute,
        ExecutionModel::GLCompute,
        vec![storage_binding(0, count, ShaderStageFlags::COMPUTE)],
        &[PushConstantRange {
            stages: ShaderStageFlags::COMPUTE,
            offset: 0,
            size: 8,
        }],
        program(|invocation| {
            let index = word(invocation.push_constants(), 0);
            let offset = word(invocation.push_constants(), 1);
            invocation
                .at(42)
                .stage_info([1, 0, 0])
                .access_buffer(0, 0, index, offset, 4);
        }),
    )
}

fn write(h: &Harness, set: &Arc<DescriptorSetState>, element: u32, buffers: &[&Arc<BufferState>]) {
    let ranges: Vec<_> = buffers.iter().map(|b| BufferRange::whole(b)).collect();
    h.validator.update_descriptor_sets(
        &[WriteDescriptorSet {
            set,
            binding: 0,
            element,
            descriptors: Descriptors::StorageBuffer(&ranges),
        }],
        &[],
    );
}

fn record(
    h: &Harness,
    app: &AppPipeline,
    set: &Arc<DescriptorSetState>,
    accesses: &[[u32; 2]],
) -> CommandBuffer {
    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.bind_descriptor_sets(PipelineBindPoint::Compute, &app.layout, 0, &[set.clone()], &[]);
    for access in accesses {
        cb.push_constants(
            &app.layout,
            ShaderStageFlags::COMPUTE,
            0,
            bytemuck::cast_slice(&access[..]),
        );
        cb.dispatch([1, 1, 1]);
    }
    cb.end().unwrap();
    cb
}

fn run(h: &Harness, cb: &mut CommandBuffer) -> usize {
    let mut queue = h.queue();
    queue.submit(&mut [cb]).unwrap();
    queue.wait_idle().unwrap()
}

#[test]
fn index_out_of_bounds_is_reported() {
    let h = Harness::instrumented();
    let app = compute(&h);
    assert!(app.pipeline.is_instrumented());

    let set = h.descriptor_set(&app.set_layout);
    let buffer = h.buffer(BufferInfo::storage(64));
    write(&h, &set, 0, &[&buffer, &buffer]);

    let mut cb = record(&h, &app, &set, &[[5, 0]]);
    assert_eq!(run(&h, &mut cb), 1);

    let diagnostics = h.reporter.take();
    assert_eq!(diagnostics[0].severity, Severity::Error);
    assert_eq!(diagnostics[0].vuid, "VUID-vkCmdDispatch-None-10068");
    let message = &diagnostics[0].message;
    assert!(
        message.starts_with(
            "(set = 0, binding = 0) Index of 5 used to index storage buffer array of length 2."
        ),
        "{}",
        message
    );
    assert!(message.contains("Stage = Compute. Global invocation ID (x, y, z) = (1, 0, 0)."));
}

#[test]
fn buffer_overrun_is_reported() {
    let h = Harness::instrumented();
    let app = compute(&h);
    let set = h.descriptor_set(&app.set_layout);
    let buffer = h.buffer(BufferInfo::storage(64));
    write(&h, &set, 0, &[&buffer, &buffer]);

    let mut cb = record(&h, &app, &set, &[[1, 62]]);
    assert_eq!(run(&h, &mut cb), 1);

    let diagnostics = h.reporter.take();
    assert_eq!(diagnostics[0].vuid, "VUID-vkCmdDispatch-storageBuffers-06936");
    assert!(diagnostics[0]
        .message
        .contains("Descriptor size is 64 bytes and highest byte accessed was 66."));
}

#[test]
fn valid_accesses_are_silent() {
    let h = Harness::instrumented();
    let app = compute(&h);
    let set = h.descriptor_set(&app.set_layout);
    let buffer = h.buffer(BufferInfo::storage(64));
    write(&h, &set, 0, &[&buffer, &buffer]);

    let mut cb = record(&h, &app, &set, &[[0, 0], [1, 60]]);
    assert_eq!(run(&h, &mut cb), 0);
    assert!(h.reporter.is_empty());
}

#[test]
fn uninitialized_descriptor_is_reported_by_shader_and_post_process() {
    let h = Harness::instrumented();
    let app = compute(&h);
    let set = h.descriptor_set(&app.set_layout);
    let buffer = h.buffer(BufferInfo::storage(64));
    write(&h, &set, 0, &[&buffer]);

    let mut cb = record(&h, &app, &set, &[[1, 0]]);
    assert_eq!(run(&h, &mut cb), 2);

    let diagnostics = h.reporter.take();
    assert!(diagnostics
        .iter()
        .all(|d| d.vuid == "VUID-vkCmdDispatch-None-08114"));
    assert!(diagnostics
        .iter()
        .any(|d| d.message.contains("Descriptor index 1 is uninitialized.")));
    assert!(diagnostics
        .iter()
        .any(|d| d.message.contains("binding #0 index 1 is uninitialized.")));
}

#[test]
fn destroyed_buffer_is_reported() {
    let h = Harness::instrumented();
    let app = compute(&h);
    let set = h.descriptor_set(&app.set_layout);
    let buffer = h.buffer(BufferInfo::storage(64));
    write(&h, &set, 0, &[&buffer, &buffer]);
    h.validator.destroy_buffer(&buffer);

    let mut cb = record(&h, &app, &set, &[[0, 0]]);
    assert_eq!(run(&h, &mut cb), 2);

    let diagnostics = h.reporter.take();
    assert!(diagnostics
        .iter()
        .all(|d| d.vuid == "VUID-vkCmdDispatch-None-08114"));
    assert!(diagnostics
        .iter()
        .any(|d| d.message.contains("references a resource that was destroyed")));
    assert!(diagnostics
        .iter()
        .any(|d| d.message.contains("references a destroyed buffer")));
}

#[test]
fn unchanged_set_is_serialized_once() {
    let h = Harness::instrumented();
    let app = compute(&h);
    let set = h.descriptor_set(&app.set_layout);
    let buffer = h.buffer(BufferInfo::storage(64));
    write(&h, &set, 0, &[&buffer, &buffer]);

    let mut cb = record(&h, &app, &set, &[[0, 0]]);
    let mut queue = h.queue();
    for _ in 0..3 {
        queue.submit(&mut [&mut cb]).unwrap();
        queue.wait_idle().unwrap();
    }
    assert_eq!(set.snapshot_builds(), 1);
    assert_eq!(set.snapshot_reads(), 3);

    write(&h, &set, 1, &[&buffer]);
    queue.submit(&mut [&mut cb]).unwrap();
    queue.wait_idle().unwrap();
    assert_eq!(set.snapshot_builds(), 2);
    assert!(h.reporter.is_empty());
}

#[test]
fn accessed_elements_accumulate_across_commands() {
    let h = Harness::instrumented();
    let app = compute(&h);
    let set = h.descriptor_set(&app.set_layout);
    let buffer = h.buffer(BufferInfo::storage(64));
    write(&h, &set, 0, &[&buffer, &buffer]);

    let mut cb = record(&h, &app, &set, &[[0, 0], [1, 0]]);
    assert_eq!(cb.command_count(), 2);
    assert_eq!(cb.descriptor_binding_count(), 1);
    assert_eq!(run(&h, &mut cb), 0);

    let output = set.existing_output_state().unwrap();
    assert_eq!(output.read_words(0, 2).unwrap(), vec![1, 1]);
}

#[test]
fn indirect_dispatch_restores_application_state() {
    let h = Harness::instrumented();
    let app = compute(&h);
    let set = h.descriptor_set(&app.set_layout);
    let buffer = h.buffer(BufferInfo::storage(64));
    write(&h, &set, 0, &[&buffer, &buffer]);

    let params = h.buffer(BufferInfo {
        size: 12,
        usage: BufferUsage::INDIRECT,
    });
    h.device.write_words(params.raw(), 0, &[1, 1, 1]);

    let constants = [0u32, 0];
    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.bind_descriptor_sets(PipelineBindPoint::Compute, &app.layout, 0, &[set.clone()], &[]);
    cb.push_constants(
        &app.layout,
        ShaderStageFlags::COMPUTE,
        0,
        bytemuck::cast_slice(&constants[..]),
    );
    cb.dispatch_indirect(&params, 0);
    cb.end().unwrap();

    let commands = recorded(&mut cb);
    assert_eq!(commands.len(), 12, "{:#?}", commands);

    // Validation dispatch.
    assert!(matches!(commands[3], Recorded::BindPipeline { .. }));
    assert_ne!(commands[3], commands[0]);
    let validation_set = match &commands[4] {
        Recorded::BindDescriptorSets {
            first_set: 0, sets, ..
        } => sets[0],
        other => panic!("Expected validation sets, got {:?}", other),
    };
    assert!(matches!(commands[5], Recorded::PushConstants { .. }));
    assert_eq!(
        commands[6],
        Recorded::Dispatch {
            group_count: [1, 1, 1],
        }
    );

    // Application state replayed in recording order.
    assert_eq!(&commands[7..10], &commands[0..3]);

    assert_eq!(
        commands[10],
        Recorded::BindDescriptorSets {
            bind_point: PipelineBindPoint::Compute,
            layout: app.layout.instrumented().unwrap(),
            first_set: h.validator.validation_slot(),
            sets: vec![validation_set],
            dynamic_offsets: Vec::new(),
        }
    );
    assert!(matches!(commands[11], Recorded::DispatchIndirect { .. }));

    assert_eq!(run(&h, &mut cb), 0);
}

#[test]
fn updates_before_submit_share_one_snapshot() {
    let h = Harness::instrumented();
    let app = compute(&h);
    let set = h.descriptor_set(&app.set_layout);
    let small = h.buffer(BufferInfo::storage(16));
    let large = h.buffer(BufferInfo::storage(256));
    write(&h, &set, 0, &[&small]);
    write(&h, &set, 1, &[&large]);

    let mut cb = record(&h, &app, &set, &[[0, 12], [1, 200]]);
    assert_eq!(run(&h, &mut cb), 0);
    assert_eq!(set.snapshot_builds(), 1);
    assert_eq!(set.snapshot_reads(), 1);
    assert!(h.reporter.is_empty());
}

#[test]
fn output_state_is_union_across_submissions() {
    let h = Harness::instrumented();
    let app = compute_array(&h, 6);
    let set = h.descriptor_set(&app.set_layout);
    let buffer = h.buffer(BufferInfo::storage(32));
    write(&h, &set, 0, &[&buffer; 6]);

    let mut first = record(&h, &app, &set, &[[2, 0]]);
    let mut second = record(&h, &app, &set, &[[5, 28]]);
    assert_eq!(run(&h, &mut first), 0);
    assert_eq!(run(&h, &mut second), 0);

    let output = set.existing_output_state().unwrap();
    assert_eq!(output.read_words(0, 6).unwrap(), vec![0, 0, 1, 0, 0, 1]);
}

#[test]
fn marked_element_is_checked_once() {
    let h = Harness::instrumented();
    let app = compute_array(&h, 3);
    let set = h.descriptor_set(&app.set_layout);
    let buffer = h.buffer(BufferInfo::storage(64));
    write(&h, &set, 0, &[&buffer]);

    let mut cb = record(&h, &app, &set, &[[2, 8]]);
    assert_eq!(run(&h, &mut cb), 2);
    h.reporter.take();

    // Only the shader record remains; the marker was handled before.
    assert_eq!(run(&h, &mut cb), 1);
    let diagnostics = h.reporter.take();
    assert!(
        diagnostics[0].message.contains("Descriptor index 2 is uninitialized."),
        "{}",
        diagnostics[0].message
    );
}

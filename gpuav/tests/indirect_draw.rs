mod common;

use {
    common::{program, recorded, Harness},
    gpuav::{
        backend::software::{Recorded, SoftDevice},
        BufferImageCopy, BufferInfo, BufferUsage, CopyImageFormat, DeviceFeatures, DeviceLimits,
        IndexType, PipelineBindPoint, RawRenderPass, Settings, Severity,
    },
    rspirv::spirv::ExecutionModel,
};

fn harness(first_instance: bool) -> Harness {
    let limits = DeviceLimits {
        max_draw_indirect_count: 3,
        ..DeviceLimits::default()
    };
    let features = DeviceFeatures {
        draw_indirect_first_instance: first_instance,
        ..DeviceFeatures::default()
    };
    Harness::new(SoftDevice::new(limits, features), Settings::default(), false)
}

fn indirect(size: u64) -> BufferInfo {
    BufferInfo {
        size,
        usage: BufferUsage::INDIRECT,
    }
}

#[test]
fn count_above_limit_is_reported() {
    let h = harness(true);
    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::Vertex,
        Vec::new(),
        &[],
        program(|_| {}),
    );
    let params = h.buffer(indirect(16 * 8));
    let count = h.buffer(indirect(4));
    h.device.write_words(count.raw(), 0, &[5]);

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.draw_indirect_count(&params, 0, &count, 0, 8, 16);
    cb.end().unwrap();

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    assert_eq!(queue.wait_idle().unwrap(), 1);

    let diagnostics = h.reporter.take();
    assert_eq!(diagnostics.len(), 1);
    let diagnostic = &diagnostics[0];
    assert_eq!(diagnostic.severity, Severity::Error);
    assert_eq!(diagnostic.vuid, "VUID-vkCmdDrawIndirectCount-countBuffer-02717");
    assert!(
        diagnostic
            .message
            .starts_with("Indirect draw count of 5 would exceed maxDrawIndirectCount limit of 3."),
        "{}",
        diagnostic.message
    );
    assert!(diagnostic
        .message
        .contains("Command vkCmdDrawIndirectCount (operation 0)"));
}

#[test]
fn count_within_limit_is_silent() {
    let h = harness(true);
    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::Vertex,
        Vec::new(),
        &[],
        program(|_| {}),
    );
    let params = h.buffer(indirect(16 * 8));
    let count = h.buffer(indirect(4));
    h.device.write_words(count.raw(), 0, &[3]);

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.draw_indirect_count(&params, 0, &count, 0, 8, 16);
    cb.end().unwrap();

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    assert_eq!(queue.wait_idle().unwrap(), 0);
    assert!(h.reporter.is_empty());
}

#[test]
fn validation_draw_precedes_application_draw() {
    let h = harness(true);
    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::Vertex,
        Vec::new(),
        &[],
        program(|_| {}),
    );
    let params = h.buffer(indirect(64));
    let count = h.buffer(indirect(4));

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.draw_indirect_count(&params, 0, &count, 0, 4, 16);
    cb.end().unwrap();

    let commands = recorded(&mut cb);
    assert_eq!(commands.len(), 7, "{:#?}", commands);
    assert_eq!(
        commands[0],
        Recorded::BindPipeline {
            bind_point: PipelineBindPoint::Graphics,
            pipeline: app.pipeline.raw(),
        }
    );
    match &commands[1] {
        Recorded::BindPipeline {
            bind_point: PipelineBindPoint::Graphics,
            pipeline,
        } => assert_ne!(*pipeline, app.pipeline.raw()),
        other => panic!("Expected validation pipeline, got {:?}", other),
    }
    match &commands[2] {
        Recorded::BindDescriptorSets {
            first_set: 0, sets, ..
        } => assert_eq!(sets.len(), 2),
        other => panic!("Expected validation sets, got {:?}", other),
    }
    assert!(matches!(commands[3], Recorded::PushConstants { offset: 0, .. }));
    assert_eq!(
        commands[4],
        Recorded::Draw {
            vertices: 0..3,
            instances: 0..1,
        }
    );
    assert_eq!(commands[5], commands[0]);
    assert!(matches!(commands[6], Recorded::DrawIndirectCount { .. }));
}

#[test]
fn first_instance_is_checked_without_feature() {
    let h = harness(false);
    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::Vertex,
        Vec::new(),
        &[],
        program(|_| {}),
    );
    let params = h.buffer(indirect(32));
    h.device.write_words(params.raw(), 0, &[3, 1, 0, 0, 3, 1, 0, 2]);

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.draw_indirect(&params, 0, 2, 16);
    cb.end().unwrap();

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    queue.wait_idle().unwrap();

    let diagnostics = h.reporter.take();
    assert_eq!(diagnostics.len(), 1, "{:#?}", diagnostics);
    assert_eq!(
        diagnostics[0].vuid,
        "VUID-VkDrawIndirectCommand-firstInstance-00501"
    );
}

#[test]
fn direct_draws_without_instrumentation_are_not_tracked() {
    let h = harness(false);
    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::Vertex,
        Vec::new(),
        &[],
        program(|_| {}),
    );

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.begin_render_pass(RawRenderPass(1));
    cb.bind_pipeline(&app.pipeline);
    cb.draw(0..3, 0..1);
    cb.draw_indexed(0..3, 0, 0..1);
    cb.end_render_pass();
    cb.end().unwrap();

    assert_eq!(cb.command_count(), 0);
    assert_eq!(recorded(&mut cb).len(), 5);
}

#[test]
fn debug_region_names_the_label() {
    let h = harness(true);
    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::Vertex,
        Vec::new(),
        &[],
        program(|_| {}),
    );
    let params = h.buffer(indirect(64));
    let count = h.buffer(indirect(4));
    h.device.write_words(count.raw(), 0, &[4]);

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.begin_debug_label("shadow pass");
    cb.bind_pipeline(&app.pipeline);
    cb.draw_indirect_count(&params, 0, &count, 0, 4, 16);
    cb.end_debug_label();
    cb.end().unwrap();

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    queue.wait_idle().unwrap();

    let diagnostics = h.reporter.take();
    assert_eq!(diagnostics.len(), 1);
    assert!(diagnostics[0]
        .message
        .contains("in debug region \"shadow pass\""));
}

#[test]
fn indexed_draws_past_index_buffer_are_reported() {
    let h = harness(true);
    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::Vertex,
        Vec::new(),
        &[],
        program(|_| {}),
    );
    let index = h.buffer(BufferInfo {
        size: 12,
        usage: BufferUsage::INDEX,
    });
    let params = h.buffer(indirect(20));
    h.device.write_words(params.raw(), 0, &[6, 1, 0, 0, 0]);
    let count = h.buffer(indirect(4));
    h.device.write_words(count.raw(), 0, &[1]);

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.bind_index_buffer(&index, 0, IndexType::U32);
    cb.draw_indexed_indirect(&params, 0, 1, 20);
    cb.draw_indexed_indirect_count(&params, 0, &count, 0, 1, 20);
    cb.end().unwrap();

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    queue.wait_idle().unwrap();

    let diagnostics = h.reporter.take();
    assert_eq!(diagnostics.len(), 2, "{:#?}", diagnostics);
    for diagnostic in &diagnostics {
        assert_eq!(
            diagnostic.vuid,
            "VUID-VkDrawIndexedIndirectCommand-robustBufferAccess2-08798"
        );
        assert!(
            diagnostic.message.contains("reads indices up to 6")
                && diagnostic.message.contains("holds 3 indices"),
            "{}",
            diagnostic.message
        );
    }
    assert!(diagnostics[0].message.contains("vkCmdDrawIndexedIndirect "));
    assert!(diagnostics[1]
        .message
        .contains("vkCmdDrawIndexedIndirectCount"));
}

#[test]
fn mesh_group_counts_use_mesh_limits() {
    let limits = DeviceLimits {
        max_task_work_group_count: [16; 3],
        max_mesh_work_group_count: [64; 3],
        ..DeviceLimits::default()
    };
    let h = Harness::new(
        SoftDevice::new(limits, DeviceFeatures::default()),
        Settings::default(),
        false,
    );
    let app = h.pipeline(
        PipelineBindPoint::Graphics,
        ExecutionModel::MeshNV,
        Vec::new(),
        &[],
        program(|_| {}),
    );
    let params = h.buffer(indirect(24));
    h.device.write_words(params.raw(), 0, &[32, 1, 1, 65, 1, 1]);
    let count = h.buffer(indirect(4));
    h.device.write_words(count.raw(), 0, &[2]);

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.bind_pipeline(&app.pipeline);
    cb.draw_mesh_tasks_indirect(&params, 0, 1, 12);
    cb.draw_mesh_tasks_indirect_count(&params, 0, &count, 0, 2, 12);
    cb.end().unwrap();

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    queue.wait_idle().unwrap();

    let diagnostics = h.reporter.take();
    assert_eq!(diagnostics.len(), 1, "{:#?}", diagnostics);
    assert_eq!(
        diagnostics[0].vuid,
        "VUID-VkDrawMeshTasksIndirectCommandEXT-TaskEXT-07322"
    );
    assert!(
        diagnostics[0].message.starts_with(
            "Indirect draw group count X of 65 would exceed work group count limit of 64."
        ),
        "{}",
        diagnostics[0].message
    );
    assert!(diagnostics[0]
        .message
        .contains("vkCmdDrawMeshTasksIndirectCountEXT"));
}

#[test]
fn depth_copy_outside_unit_range_is_reported() {
    let h = harness(true);
    let src = h.buffer(BufferInfo {
        size: 8,
        usage: BufferUsage::TRANSFER_SRC,
    });
    h.device
        .write_words(src.raw(), 0, &[0.5f32.to_bits(), 2.0f32.to_bits()]);
    let image = h.device.create_image();
    let region = BufferImageCopy {
        buffer_offset: 0,
        buffer_row_length: 0,
        buffer_image_height: 0,
        image_offset: [0; 3],
        image_extent: [2, 1, 1],
    };

    let mut cb = h.command_buffer();
    cb.begin().unwrap();
    cb.copy_buffer_to_image(&src, image, CopyImageFormat::D32Sfloat, &[region]);
    cb.copy_buffer_to_image(&src, image, CopyImageFormat::Other { texel_size: 4 }, &[region]);
    cb.end().unwrap();

    assert_eq!(cb.command_count(), 1);

    let mut queue = h.queue();
    queue.submit(&mut [&mut cb]).unwrap();
    queue.wait_idle().unwrap();

    let diagnostics = h.reporter.take();
    assert_eq!(diagnostics.len(), 1, "{:#?}", diagnostics);
    assert_eq!(
        diagnostics[0].vuid,
        "VUID-vkCmdCopyBufferToImage-pRegions-07931"
    );
    assert!(
        diagnostics[0]
            .message
            .starts_with("Source buffer texel at index 1 of region 0 has value 2 "),
        "{}",
        diagnostics[0].message
    );
}

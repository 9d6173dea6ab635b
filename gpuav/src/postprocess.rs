//! Turns what validated work left in GPU memory into diagnostics.

use {
    crate::{
        buffer::Buffer,
        command_buffer::{CommandBufferInner, CommandBufferState, DescriptorBinding},
        decode::{walk_records, ErrorRecord, GpuError},
        descriptor::{BufferRange, Descriptor, DescriptorSetState, DescriptorType},
        message::{compose, vuid, MessageContext},
        report::{Diagnostic, Severity},
        resources::CommandResources,
        validator::Validator,
        wire::output,
    },
    std::{collections::HashSet, fmt::Write as _, sync::Arc},
};

/// Processes the results of the last submission once. Returns the number of
/// diagnostics reported.
#[tracing::instrument(skip_all)]
pub(crate) fn process(validator: &Validator, inner: &mut CommandBufferInner) -> usize {
    if inner.state != CommandBufferState::Submitted {
        tracing::debug!("Command buffer is {:?}, nothing to process", inner.state);
        return 0;
    }
    inner.state = CommandBufferState::Processed;

    let mut reported = 0;
    if let Some(output) = &inner.output {
        reported += process_records(validator, output, &inner.resources, &inner.bindings);
        clear_output(output);
    }
    if let Some(counts) = &inner.error_counts {
        if let Err(err) = counts.fill_zero() {
            tracing::error!("Failed to clear error counts: {:#}", err);
        }
    }

    if validator
        .settings()
        .shader_instrumentation
        .post_process_descriptor_indexing
    {
        reported += process_output_state(validator, &inner.resources, &inner.bindings);
    }
    reported
}

fn process_records(
    validator: &Validator,
    output: &Buffer,
    resources: &[CommandResources],
    bindings: &[DescriptorBinding],
) -> usize {
    let capacity = output.word_capacity();
    let words = match output.read_words(0, capacity) {
        Ok(words) => words,
        Err(err) => {
            tracing::error!("Failed to read error output: {:#}", err);
            return 0;
        }
    };
    let written = words[output::WRITTEN];
    if written == 0 {
        return 0;
    }

    let settings = validator.settings();
    let mut reported = 0;

    for record in walk_records(&words[output::DATA..], written) {
        let record = match ErrorRecord::decode(record) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!("Skipping error record: {}", err);
                continue;
            }
        };

        let resources = match resources.get(record.header.resource_index as usize) {
            Some(resources) => resources,
            None => {
                tracing::warn!(
                    "Error record refers to unknown command {}",
                    record.header.resource_index
                );
                continue;
            }
        };

        let severity = if record.error.is_out_of_bounds() && resources.uses_robustness() {
            if !settings.warn_on_robust_oob {
                continue;
            }
            Severity::Warning
        } else {
            Severity::Error
        };

        let binding_type = binding_type(resources, bindings, &record.error);
        let shader = match record.header.shader_id {
            0 => None,
            id => validator.instrumenter().shader(id),
        };

        let ctx = MessageContext {
            resources,
            header: &record.header,
            shader: shader.as_deref(),
            limits: validator.device().limits(),
            binding_type,
        };

        validator.reporter().report(Diagnostic {
            severity,
            vuid: vuid(resources.kind(), &record.error, binding_type),
            message: compose(&ctx, &record.error),
        });
        reported += 1;
    }
    reported
}

/// Type of the binding a descriptor error refers to.
fn binding_type(
    resources: &CommandResources,
    bindings: &[DescriptorBinding],
    error: &GpuError,
) -> Option<DescriptorType> {
    let error = match error {
        GpuError::Descriptor(error) => error,
        _ => return None,
    };
    let binding = bindings.get(resources.descriptor_binding_index()?)?;
    let set = binding.sets.get(error.set as usize)?.as_ref()?;
    set.binding_range(error.binding).map(|range| range.ty)
}

/// Zeroes the written counter and records, keeping the flags word.
fn clear_output(output: &Buffer) {
    let zeros = vec![0u32; output.word_capacity().saturating_sub(output::WRITTEN)];
    if let Err(err) = output.write(4 * output::WRITTEN as u64, &zeros) {
        tracing::error!("Failed to clear error output: {:#}", err);
    }
}

/// Problem found in a descriptor a shader accessed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum DescriptorIssue {
    Uninitialized,
    Destroyed(&'static str),
    Null,
    /// Buffer range ends at `end`, past a buffer of `size` bytes.
    BufferRange { end: u64, size: u64 },
    MissingSampler,
}

/// Checks a descriptor that was accessed.
fn check_descriptor(descriptor: &Descriptor, null_descriptor: bool) -> Option<DescriptorIssue> {
    let null = if null_descriptor {
        None
    } else {
        Some(DescriptorIssue::Null)
    };

    match descriptor {
        Descriptor::Empty => Some(DescriptorIssue::Uninitialized),
        Descriptor::InlineUniform => None,
        Descriptor::Sampler(sampler) => match sampler {
            Some(sampler) if sampler.is_destroyed() => Some(DescriptorIssue::Destroyed("sampler")),
            Some(_) => None,
            None => Some(DescriptorIssue::MissingSampler),
        },
        Descriptor::ImageSampler { view, sampler } => match (view, sampler) {
            (Some(view), _) if view.is_destroyed() => {
                Some(DescriptorIssue::Destroyed("image view"))
            }
            (_, Some(sampler)) if sampler.is_destroyed() => {
                Some(DescriptorIssue::Destroyed("sampler"))
            }
            (_, None) => Some(DescriptorIssue::MissingSampler),
            (None, Some(_)) => null,
            (Some(_), Some(_)) => None,
        },
        Descriptor::Image(view) => match view {
            Some(view) if view.is_destroyed() => Some(DescriptorIssue::Destroyed("image view")),
            Some(_) => None,
            None => null,
        },
        Descriptor::TexelBuffer(view) => match view {
            Some(view) if view.is_destroyed() => Some(DescriptorIssue::Destroyed("buffer view")),
            Some(view) if view.buffer.is_destroyed() => {
                Some(DescriptorIssue::Destroyed("buffer"))
            }
            Some(_) => None,
            None => null,
        },
        Descriptor::Buffer(BufferRange {
            buffer,
            offset,
            range,
        }) => match buffer {
            Some(buffer) if buffer.is_destroyed() => Some(DescriptorIssue::Destroyed("buffer")),
            Some(buffer) => {
                let end = if *range == u64::MAX {
                    *offset
                } else {
                    offset.saturating_add(*range)
                };
                if end > buffer.size() || *offset > buffer.size() {
                    Some(DescriptorIssue::BufferRange {
                        end,
                        size: buffer.size(),
                    })
                } else {
                    None
                }
            }
            None => null,
        },
        Descriptor::AccelerationStructure(structure) => match structure {
            Some(structure) if structure.is_destroyed() => {
                Some(DescriptorIssue::Destroyed("acceleration structure"))
            }
            Some(_) => None,
            None => null,
        },
    }
}

/// Validates elements shaders marked as accessed. Sets that may change after
/// binding are skipped since their contents at execution time are unknown.
fn process_output_state(
    validator: &Validator,
    resources: &[CommandResources],
    bindings: &[DescriptorBinding],
) -> usize {
    let null_descriptor = validator.device().features().null_descriptor;
    let mut seen = HashSet::new();
    let mut reported = 0;

    for (binding_index, binding) in bindings.iter().enumerate() {
        for (set_index, set) in binding.sets.iter().enumerate() {
            let set = match set {
                Some(set) if !set.is_update_after_bind() => set,
                _ => continue,
            };

            let output = match set.existing_output_state() {
                Some(output) => output,
                None => continue,
            };

            let markers = match output.read_words(0, set.element_count() as usize) {
                Ok(markers) => markers,
                Err(err) => {
                    tracing::error!("Failed to read descriptor output state: {:#}", err);
                    continue;
                }
            };

            for element in set.take_new_markers(&markers) {
                let (binding_number, index) = match set.locate(element) {
                    Some(location) => location,
                    None => continue,
                };

                let descriptor = match set.element(binding_number, index) {
                    Some(descriptor) => descriptor,
                    None => continue,
                };

                let issue = match check_descriptor(&descriptor, null_descriptor) {
                    Some(issue) => issue,
                    None => continue,
                };

                if !seen.insert((Arc::as_ptr(set), element, issue)) {
                    continue;
                }

                let command = match resources
                    .iter()
                    .find(|r| r.descriptor_binding_index() == Some(binding_index))
                {
                    Some(command) => command,
                    None => continue,
                };

                validator.reporter().report(Diagnostic {
                    severity: Severity::Error,
                    vuid: format!("VUID-{}-None-08114", command.kind().name()),
                    message: describe_issue(command, set, set_index, binding_number, index, issue),
                });
                reported += 1;
            }
        }
    }
    reported
}

fn describe_issue(
    command: &CommandResources,
    set: &DescriptorSetState,
    set_index: usize,
    binding: u32,
    index: u32,
    issue: DescriptorIssue,
) -> String {
    let mut text = format!(
        "Descriptor set {} ({:?}) binding #{} index {} ",
        set_index,
        set.raw(),
        binding,
        index
    );

    // Writing into `String` can't fail.
    let _ = match issue {
        DescriptorIssue::Uninitialized => write!(text, "is uninitialized."),
        DescriptorIssue::Destroyed(what) => write!(text, "references a destroyed {}.", what),
        DescriptorIssue::Null => write!(
            text,
            "is null but the nullDescriptor feature is not enabled."
        ),
        DescriptorIssue::BufferRange { end, size } => write!(
            text,
            "range ends at byte {} past the end of a buffer of {} bytes.",
            end, size
        ),
        DescriptorIssue::MissingSampler => write!(text, "has no sampler."),
    };

    let _ = write!(
        text,
        "\nCommand {} (operation {})",
        command.kind().name(),
        command.operation_index()
    );
    if let Some(region) = command.debug_region() {
        let _ = write!(text, " in debug region \"{}\"", region);
    }
    text
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            buffer::BufferInfo,
            heap::DescriptorIdGuard,
            resource::BufferState,
        },
    };

    fn buffer(size: u64) -> Arc<BufferState> {
        Arc::new(BufferState::new(
            crate::device::RawBuffer(1),
            BufferInfo::storage(size),
            None,
            DescriptorIdGuard::untracked(),
        ))
    }

    #[test]
    fn empty_descriptor_is_uninitialized() {
        assert_eq!(
            check_descriptor(&Descriptor::Empty, true),
            Some(DescriptorIssue::Uninitialized)
        );
        assert_eq!(check_descriptor(&Descriptor::InlineUniform, false), None);
    }

    #[test]
    fn null_depends_on_feature() {
        let descriptor = Descriptor::Buffer(BufferRange {
            buffer: None,
            offset: 0,
            range: 16,
        });
        assert_eq!(check_descriptor(&descriptor, true), None);
        assert_eq!(
            check_descriptor(&descriptor, false),
            Some(DescriptorIssue::Null)
        );
    }

    #[test]
    fn buffer_range_and_destruction() {
        let small = buffer(64);
        let descriptor = Descriptor::Buffer(BufferRange {
            buffer: Some(small.clone()),
            offset: 32,
            range: 64,
        });
        assert_eq!(
            check_descriptor(&descriptor, false),
            Some(DescriptorIssue::BufferRange { end: 96, size: 64 })
        );

        let whole = Descriptor::Buffer(BufferRange::whole(&small));
        assert_eq!(check_descriptor(&whole, false), None);

        small.destroy();
        assert_eq!(
            check_descriptor(&whole, false),
            Some(DescriptorIssue::Destroyed("buffer"))
        );
    }

    #[test]
    fn combined_image_sampler_needs_sampler() {
        let descriptor = Descriptor::ImageSampler {
            view: None,
            sampler: None,
        };
        assert_eq!(
            check_descriptor(&descriptor, true),
            Some(DescriptorIssue::MissingSampler)
        );
    }
}

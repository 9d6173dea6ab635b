//! Application shaders of the software device.
//!
//! A [`Program`] stands in for a compiled shader. Where an instrumented
//! shader would call into the helper library, a program calls methods of
//! [`Invocation`] which perform the same checks against the same buffers and
//! write the same error records.

use {
    super::device::Memory,
    crate::{
        bda::bda_table_contains,
        decode::{DescriptorError, DescriptorErrorKind, GpuError, RayQueryError},
        device::RawDescriptorSet,
        join_u64,
        pipeline::PipelineBindPoint,
        wire::{
            bindless_state, class, layout_state, output, split_id_word, validation_set,
            CommandIndices, OutputWriter, RecordHeader,
        },
    },
    std::sync::Arc,
};

/// Behavior of an application pipeline.
pub trait Program: Send + Sync + 'static {
    fn run(&self, invocation: &mut Invocation<'_>);
}

impl<F> Program for F
where
    F: Fn(&mut Invocation<'_>) + Send + Sync + 'static,
{
    fn run(&self, invocation: &mut Invocation<'_>) {
        self(invocation)
    }
}

pub(super) struct ProgramPipeline {
    pub program: Arc<dyn Program>,
    pub bind_point: PipelineBindPoint,
    pub shader_id: u32,
    pub stage: u32,

    /// Set index of the validation set for instrumented programs.
    pub validation_slot: Option<u32>,
}

/// Arguments of `OpRayQueryInitializeKHR`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayQueryArgs {
    pub flags: u32,
    pub cull_mask: u32,
    pub origin: [f32; 3],
    pub t_min: f32,
    pub direction: [f32; 3],
    pub t_max: f32,
}

mod ray_flags {
    pub const OPAQUE: u32 = 0x1;
    pub const NO_OPAQUE: u32 = 0x2;
    pub const CULL_BACK_FACING_TRIANGLES: u32 = 0x10;
    pub const CULL_FRONT_FACING_TRIANGLES: u32 = 0x20;
    pub const CULL_OPAQUE: u32 = 0x40;
    pub const CULL_NO_OPAQUE: u32 = 0x80;
    pub const SKIP_TRIANGLES: u32 = 0x100;
    pub const SKIP_AABBS: u32 = 0x200;
}

/// First problem with ray query arguments, checked in the order the
/// instrumentation checks them.
pub fn check_ray_query(args: &RayQueryArgs) -> Option<RayQueryError> {
    use self::ray_flags::*;

    let flags = args.flags;
    let opacity = flags & (OPAQUE | NO_OPAQUE | CULL_OPAQUE | CULL_NO_OPAQUE);

    let error = if args.origin.iter().any(|v| v.is_nan()) {
        RayQueryError::OriginNan
    } else if args.direction.iter().any(|v| v.is_nan()) {
        RayQueryError::DirectionNan
    } else if args.origin.iter().any(|v| v.is_infinite()) {
        RayQueryError::OriginFinite
    } else if args.direction.iter().any(|v| v.is_infinite()) {
        RayQueryError::DirectionFinite
    } else if args.t_min.is_nan() {
        RayQueryError::MinNan
    } else if args.t_max.is_nan() {
        RayQueryError::MaxNan
    } else if args.t_min < 0.0 {
        RayQueryError::NegativeMin {
            bits: args.t_min.to_bits(),
        }
    } else if args.t_max < 0.0 {
        RayQueryError::NegativeMax {
            bits: args.t_max.to_bits(),
        }
    } else if args.t_max < args.t_min {
        RayQueryError::MinMax {
            min_bits: args.t_min.to_bits(),
            max_bits: args.t_max.to_bits(),
        }
    } else if flags & SKIP_TRIANGLES != 0 && flags & SKIP_AABBS != 0 {
        RayQueryError::BothSkip { flags }
    } else if flags & SKIP_TRIANGLES != 0
        && flags & (CULL_BACK_FACING_TRIANGLES | CULL_FRONT_FACING_TRIANGLES) != 0
    {
        RayQueryError::SkipCull { flags }
    } else if opacity.count_ones() > 1 {
        RayQueryError::Opaque { flags }
    } else {
        return None;
    };
    Some(error)
}

/// One launch of a program.
pub struct Invocation<'a> {
    memory: &'a mut Memory,
    validation_set: Option<RawDescriptorSet>,
    push_constants: &'a [u8],
    header: RecordHeader,
}

impl<'a> Invocation<'a> {
    pub(super) fn new(
        memory: &'a mut Memory,
        validation_set: Option<RawDescriptorSet>,
        push_constants: &'a [u8],
        shader_id: u32,
        stage: u32,
    ) -> Self {
        Invocation {
            memory,
            validation_set,
            push_constants,
            header: RecordHeader {
                shader_id,
                stage_id: stage,
                ..RecordHeader::default()
            },
        }
    }

    /// Whether checks run. Checks of uninstrumented programs always pass.
    pub fn is_instrumented(&self) -> bool {
        self.validation_set.is_some()
    }

    pub fn push_constants(&self) -> &[u8] {
        self.push_constants
    }

    /// Position of the instruction following accesses are attributed to.
    pub fn at(&mut self, instruction: u32) -> &mut Self {
        self.header.instruction = instruction;
        self
    }

    /// Stage specific coordinates of this invocation.
    pub fn stage_info(&mut self, info: [u32; 3]) -> &mut Self {
        self.header.stage_info = info;
        self
    }

    /// Accesses `size` bytes at `offset` through a buffer descriptor.
    pub fn access_buffer(&mut self, set: u32, binding: u32, index: u32, offset: u32, size: u32) -> bool {
        match self.check_descriptor(set, binding, index, offset, size) {
            Ok(()) => true,
            Err(kind) => {
                self.report(GpuError::Descriptor(DescriptorError {
                    set,
                    binding,
                    index,
                    kind,
                }));
                false
            }
        }
    }

    /// Dereferences `size` bytes at a buffer device address.
    pub fn access_address(&mut self, address: u64, size: u32, is_write: bool) -> bool {
        let validation_set = match self.validation_set {
            Some(set) => set,
            None => return true,
        };
        let words = self
            .memory
            .binding_words(validation_set, validation_set::BDA_TABLE);
        let table: Vec<u64> = words
            .chunks_exact(2)
            .map(|pair| join_u64(pair[0], pair[1]))
            .collect();

        if bda_table_contains(&table, address, size.into()) {
            return true;
        }
        self.report(GpuError::DeviceAddress {
            address,
            size,
            is_write,
        });
        false
    }

    /// Reads a word at a buffer device address after checking it.
    /// Returns zero for rejected addresses.
    pub fn load(&mut self, address: u64) -> u32 {
        if self.access_address(address, 4, false) {
            self.memory.load(address)
        } else {
            0
        }
    }

    pub fn store(&mut self, address: u64, value: u32) {
        if self.access_address(address, 4, true) {
            self.memory.store(address, value)
        }
    }

    /// Initializes a ray query. Returns whether the arguments are valid.
    pub fn initialize_ray_query(&mut self, args: &RayQueryArgs) -> bool {
        if self.validation_set.is_none() {
            return true;
        }
        match check_ray_query(args) {
            Some(error) => {
                self.report(GpuError::RayQuery(error));
                false
            }
            None => true,
        }
    }

    /// Walks bindless state the way the helper library does.
    fn check_descriptor(
        &mut self,
        set: u32,
        binding: u32,
        index: u32,
        offset: u32,
        size: u32,
    ) -> Result<(), DescriptorErrorKind> {
        let validation_set = match self.validation_set {
            Some(validation_set) => validation_set,
            None => return Ok(()),
        };

        let bindless = self
            .memory
            .binding_words(validation_set, validation_set::BINDLESS_STATE);
        let set_count = bindless
            .get(bindless_state::SET_COUNT)
            .copied()
            .unwrap_or(0);
        if set >= set_count || set as usize >= bindless_state::MAX_SETS {
            return Ok(());
        }

        let at = bindless_state::SETS + set as usize * bindless_state::SET_WORDS;
        let word = |i: usize| bindless.get(at + i).copied().unwrap_or(0);
        let address = |i: usize| join_u64(word(i), word(i + 1));
        let (layout, state, marks) = (address(0), address(2), address(4));
        if layout == 0 {
            return Ok(());
        }

        let slots = self.memory.load(layout + 4 * layout_state::BINDING_COUNT as u64);
        if binding >= slots {
            return Err(DescriptorErrorKind::IndexOutOfBounds { length: 0 });
        }
        let entry = layout
            + 4 * (layout_state::BINDINGS + layout_state::BINDING_WORDS * binding as usize) as u64;
        let count = self.memory.load(entry);
        let start = self.memory.load(entry + 4);
        if index >= count {
            return Err(DescriptorErrorKind::IndexOutOfBounds { length: count });
        }

        let element = u64::from(start + index);
        if marks != 0 {
            self.memory.store(marks + 4 * element, 1);
        }

        let (tag, id) = split_id_word(self.memory.load(state + 8 * element));
        let extra = self.memory.load(state + 8 * element + 4);
        if tag == 0 {
            return Err(DescriptorErrorKind::Uninitialized);
        }
        if !self.is_live(id) || (tag == class::IMAGE_SAMPLER && !self.is_live(extra)) {
            return Err(DescriptorErrorKind::Destroyed);
        }

        let flags = self
            .memory
            .binding_words(validation_set, validation_set::OUTPUT)
            .get(output::FLAGS)
            .copied()
            .unwrap_or(0);
        if flags & output::FLAG_BOUNDS_CHECKING == 0 {
            return Ok(());
        }

        let end = offset.saturating_add(size);
        if tag == class::BUFFER && id != 0 && end > extra {
            return Err(DescriptorErrorKind::BufferOutOfBounds { end, size: extra });
        }
        Ok(())
    }

    /// Null ids are always live.
    fn is_live(&self, id: u32) -> bool {
        if id == 0 {
            return true;
        }
        let validation_set = match self.validation_set {
            Some(set) => set,
            None => return true,
        };
        let bitmap = self
            .memory
            .binding_words(validation_set, validation_set::HEAP_BITMAP);
        bitmap
            .get(id as usize / 32)
            .map_or(false, |word| word & (1 << (id % 32)) != 0)
    }

    fn report(&mut self, error: GpuError) {
        let validation_set = match self.validation_set {
            Some(set) => set,
            None => return,
        };
        let mut words = self
            .memory
            .binding_words(validation_set, validation_set::OUTPUT);
        if words.len() < output::DATA {
            return;
        }
        let mut counts = self
            .memory
            .binding_words(validation_set, validation_set::ERROR_COUNTS);
        let indices = command_indices(self.memory, validation_set);

        let (subcode, payload) = error.encode();
        let record = RecordHeader {
            action_index: indices.action_index,
            resource_index: indices.resource_index,
            group: error.group(),
            subcode,
            ..self.header
        }
        .encode(&payload);

        OutputWriter::new(&mut words).append_limited(&mut counts, indices.max_errors, &record);
        self.memory
            .write_binding_words(validation_set, validation_set::OUTPUT, &words);
        self.memory
            .write_binding_words(validation_set, validation_set::ERROR_COUNTS, &counts);
    }
}

/// Indices of the command a validation set was bound for.
pub(super) fn command_indices(memory: &Memory, validation_set: RawDescriptorSet) -> CommandIndices {
    let words = memory.binding_words(validation_set, validation_set::COMMAND_INDICES);
    let word = |i: usize| words.get(i).copied().unwrap_or(0);
    CommandIndices {
        action_index: word(0),
        resource_index: word(1),
        max_errors: word(2),
        flags: word(3),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ray(flags: u32, t_min: f32, t_max: f32) -> RayQueryArgs {
        RayQueryArgs {
            flags,
            cull_mask: 0xff,
            origin: [0.0; 3],
            t_min,
            direction: [0.0, 0.0, 1.0],
            t_max,
        }
    }

    #[test]
    fn valid_ray_passes() {
        assert_eq!(check_ray_query(&ray(ray_flags::OPAQUE, 0.0, 100.0)), None);
    }

    #[test]
    fn range_checks() {
        assert_eq!(
            check_ray_query(&ray(0, -1.0, 1.0)),
            Some(RayQueryError::NegativeMin {
                bits: (-1.0f32).to_bits()
            })
        );
        assert_eq!(
            check_ray_query(&ray(0, 2.0, 1.0)),
            Some(RayQueryError::MinMax {
                min_bits: 2.0f32.to_bits(),
                max_bits: 1.0f32.to_bits(),
            })
        );
        assert_eq!(
            check_ray_query(&ray(0, f32::NAN, 1.0)),
            Some(RayQueryError::MinNan)
        );
    }

    #[test]
    fn flag_combinations() {
        let both = ray_flags::SKIP_TRIANGLES | ray_flags::SKIP_AABBS;
        assert_eq!(
            check_ray_query(&ray(both, 0.0, 1.0)),
            Some(RayQueryError::BothSkip { flags: both })
        );

        let cull = ray_flags::SKIP_TRIANGLES | ray_flags::CULL_BACK_FACING_TRIANGLES;
        assert_eq!(
            check_ray_query(&ray(cull, 0.0, 1.0)),
            Some(RayQueryError::SkipCull { flags: cull })
        );

        let opaque = ray_flags::OPAQUE | ray_flags::CULL_NO_OPAQUE;
        assert_eq!(
            check_ray_query(&ray(opaque, 0.0, 1.0)),
            Some(RayQueryError::Opaque { flags: opaque })
        );
    }

    #[test]
    fn origin_checks_come_first() {
        let mut args = ray(0, -1.0, 1.0);
        args.origin[1] = f32::INFINITY;
        assert_eq!(check_ray_query(&args), Some(RayQueryError::OriginFinite));
        args.direction[2] = f32::NAN;
        assert_eq!(check_ray_query(&args), Some(RayQueryError::DirectionNan));
    }
}

//! Read-only SPIR-V helpers.
//!
//! Rewriting shaders is the job of a [`Toolkit`](crate::Toolkit). This module
//! only inspects modules: capabilities and entry points to pick passes, debug
//! line information to attribute error records, and descriptor set
//! decorations to move the helper library onto the validation slot.

mod debug;
mod remap;

pub use self::{debug::*, remap::*};

use {
    rspirv::{
        binary::{parse_words, Consumer, ParseAction},
        dr::{self, Operand},
        spirv::{Capability, ExecutionModel, Op},
    },
    smallvec::SmallVec,
};

/// SPIR-V magic number.
pub const MAGIC: u32 = 0x0723_0203;

/// Words in module header.
pub const HEADER_WORDS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum SpirvError {
    #[error("Module is too short or has wrong magic number")]
    NotSpirv,

    #[error("Failed to parse module: {message}")]
    Parse { message: String },
}

/// Checks magic number and header length.
pub fn is_spirv(words: &[u32]) -> bool {
    words.len() >= HEADER_WORDS && words[0] == MAGIC
}

/// Entry point declared by a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryPoint {
    pub model: ExecutionModel,
    pub name: String,
}

/// Properties of a module relevant to pass selection.
#[derive(Clone, Debug, Default)]
pub struct ModuleSummary {
    pub capabilities: SmallVec<[Capability; 8]>,
    pub entry_points: SmallVec<[EntryPoint; 2]>,
}

impl ModuleSummary {
    pub fn parse(words: &[u32]) -> Result<Self, SpirvError> {
        if !is_spirv(words) {
            return Err(SpirvError::NotSpirv);
        }

        let mut summary = ModuleSummary::default();
        parse_words(words, &mut SummaryConsumer(&mut summary)).map_err(|err| {
            SpirvError::Parse {
                message: format!("{:?}", err),
            }
        })?;
        Ok(summary)
    }

    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Module dereferences buffer device addresses.
    pub fn uses_buffer_device_address(&self) -> bool {
        self.has_capability(Capability::PhysicalStorageBufferAddresses)
    }

    pub fn uses_ray_query(&self) -> bool {
        self.has_capability(Capability::RayQueryKHR)
    }
}

struct SummaryConsumer<'a>(&'a mut ModuleSummary);

impl Consumer for SummaryConsumer<'_> {
    fn initialize(&mut self) -> ParseAction {
        ParseAction::Continue
    }

    fn finalize(&mut self) -> ParseAction {
        ParseAction::Continue
    }

    fn consume_header(&mut self, _header: dr::ModuleHeader) -> ParseAction {
        ParseAction::Continue
    }

    fn consume_instruction(&mut self, inst: dr::Instruction) -> ParseAction {
        match inst.class.opcode {
            Op::Capability => {
                if let Some(Operand::Capability(capability)) = inst.operands.first() {
                    self.0.capabilities.push(*capability);
                }
            }
            Op::EntryPoint => {
                if let (Some(Operand::ExecutionModel(model)), Some(Operand::LiteralString(name))) =
                    (inst.operands.get(0), inst.operands.get(2))
                {
                    self.0.entry_points.push(EntryPoint {
                        model: *model,
                        name: name.clone(),
                    });
                }
            }
            _ => {}
        }
        ParseAction::Continue
    }
}

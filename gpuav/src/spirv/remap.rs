use {
    super::{is_spirv, SpirvError, HEADER_WORDS},
    rspirv::spirv::{Decoration, Op},
};

/// Rewrites `DescriptorSet` decorations equal to `from` into `to`.
/// Returns number of decorations changed.
pub fn remap_descriptor_set(
    words: &mut [u32],
    from: u32,
    to: u32,
) -> Result<usize, SpirvError> {
    if !is_spirv(words) {
        return Err(SpirvError::NotSpirv);
    }

    let mut changed = 0;
    let mut offset = HEADER_WORDS;
    while offset < words.len() {
        let count = (words[offset] >> 16) as usize;
        let opcode = words[offset] & 0xffff;
        if count == 0 || offset + count > words.len() {
            return Err(SpirvError::Parse {
                message: format!("Malformed instruction at word {}", offset),
            });
        }

        // OpDecorate %target DescriptorSet <literal>
        if opcode == Op::Decorate as u32
            && count == 4
            && words[offset + 2] == Decoration::DescriptorSet as u32
            && words[offset + 3] == from
        {
            words[offset + 3] = to;
            changed += 1;
        }
        offset += count;
    }

    Ok(changed)
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        rspirv::{binary::Assemble as _, dr::Builder, dr::Operand},
    };

    #[test]
    fn moves_placeholder_set() {
        let mut b = Builder::new();
        let float = b.type_float(32);
        let a = b.variable(float, None, rspirv::spirv::StorageClass::Uniform, None);
        let c = b.variable(float, None, rspirv::spirv::StorageClass::Uniform, None);
        b.decorate(a, Decoration::DescriptorSet, vec![Operand::LiteralInt32(7)]);
        b.decorate(c, Decoration::DescriptorSet, vec![Operand::LiteralInt32(1)]);
        b.decorate(a, Decoration::Binding, vec![Operand::LiteralInt32(7)]);
        let mut words = b.module().assemble();

        assert_eq!(remap_descriptor_set(&mut words, 7, 3).unwrap(), 1);
        assert_eq!(remap_descriptor_set(&mut words, 7, 3).unwrap(), 0);
        assert_eq!(remap_descriptor_set(&mut words, 3, 7).unwrap(), 1);
    }

    #[test]
    fn rejects_truncated() {
        let mut words = vec![super::super::MAGIC, 0, 0, 0, 0, 5 << 16];
        assert!(remap_descriptor_set(&mut words, 7, 3).is_err());
    }
}

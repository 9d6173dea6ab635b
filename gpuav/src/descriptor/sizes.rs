use {
    super::{DescriptorSetLayoutBinding, DescriptorType},
    std::hash::{Hash, Hasher},
};

pub(crate) const DESCRIPTOR_TYPES_COUNT: usize = 13;

const ALL_TYPES: [DescriptorType; DESCRIPTOR_TYPES_COUNT] = [
    DescriptorType::Sampler,
    DescriptorType::CombinedImageSampler,
    DescriptorType::SampledImage,
    DescriptorType::StorageImage,
    DescriptorType::UniformTexelBuffer,
    DescriptorType::StorageTexelBuffer,
    DescriptorType::UniformBuffer,
    DescriptorType::StorageBuffer,
    DescriptorType::UniformBufferDynamic,
    DescriptorType::StorageBufferDynamic,
    DescriptorType::InputAttachment,
    DescriptorType::AccelerationStructure,
    DescriptorType::InlineUniformBlock,
];

/// Number of descriptors per type, used to size pools.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorSizes {
    sizes: [u32; DESCRIPTOR_TYPES_COUNT],
}

impl Hash for DescriptorSizes {
    fn hash<H>(&self, hasher: &mut H)
    where
        H: Hasher,
    {
        for size in &self.sizes {
            hasher.write_u32(*size);
        }
    }
}

impl DescriptorSizes {
    /// Create new instance without descriptors.
    pub fn zero() -> Self {
        DescriptorSizes {
            sizes: [0; DESCRIPTOR_TYPES_COUNT],
        }
    }

    /// Add a single layout binding.
    pub fn add_binding(&mut self, binding: &DescriptorSetLayoutBinding) {
        self.sizes[binding.ty as usize] += binding.count;
    }

    /// Calculate sizes from bindings.
    pub fn from_bindings(bindings: &[DescriptorSetLayoutBinding]) -> Self {
        let mut sizes = Self::zero();
        for binding in bindings {
            sizes.add_binding(binding);
        }
        sizes
    }

    /// Multiplies every size, e.g. by number of sets in a pool.
    pub fn scaled(&self, factor: u32) -> Self {
        let mut sizes = self.clone();
        for size in &mut sizes.sizes {
            *size = size.saturating_mul(factor);
        }
        sizes
    }

    /// Non-zero sizes.
    pub fn iter(&self) -> impl Iterator<Item = (DescriptorType, u32)> + '_ {
        ALL_TYPES
            .iter()
            .zip(self.sizes.iter())
            .filter(|(_, &size)| size > 0)
            .map(|(&ty, &size)| (ty, size))
    }

    pub fn get(&self, ty: DescriptorType) -> u32 {
        self.sizes[ty as usize]
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::pipeline::ShaderStageFlags};

    #[test]
    fn sums_per_type() {
        let binding = |binding, ty, count| DescriptorSetLayoutBinding {
            binding,
            ty,
            count,
            stages: ShaderStageFlags::COMPUTE,
            flags: Default::default(),
        };
        let sizes = DescriptorSizes::from_bindings(&[
            binding(0, DescriptorType::StorageBuffer, 2),
            binding(1, DescriptorType::UniformBuffer, 1),
            binding(2, DescriptorType::StorageBuffer, 3),
        ])
        .scaled(4);

        assert_eq!(
            sizes.iter().collect::<Vec<_>>(),
            [
                (DescriptorType::UniformBuffer, 4),
                (DescriptorType::StorageBuffer, 20)
            ]
        );
    }
}

use {
    crate::{
        buffer::BufferUsage,
        command::{IndexType, StridedDeviceRegion},
        descriptor::DescriptorType,
        pipeline::{PipelineBindPoint, ShaderStageFlags},
        OutOfMemory,
    },
    erupt::{extensions::khr_ray_tracing_pipeline as vkrt, vk1_0},
};

pub(super) trait ToErupt<T> {
    fn to_erupt(self) -> T;
}

impl ToErupt<vk1_0::BufferUsageFlags> for BufferUsage {
    fn to_erupt(self) -> vk1_0::BufferUsageFlags {
        vk1_0::BufferUsageFlags::from_bits_truncate(self.bits())
    }
}

impl ToErupt<vk1_0::ShaderStageFlags> for ShaderStageFlags {
    fn to_erupt(self) -> vk1_0::ShaderStageFlags {
        vk1_0::ShaderStageFlags::from_bits_truncate(self.bits())
    }
}

impl ToErupt<vk1_0::DescriptorType> for DescriptorType {
    fn to_erupt(self) -> vk1_0::DescriptorType {
        match self {
            DescriptorType::Sampler => vk1_0::DescriptorType::SAMPLER,
            DescriptorType::CombinedImageSampler => {
                vk1_0::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
            DescriptorType::SampledImage => vk1_0::DescriptorType::SAMPLED_IMAGE,
            DescriptorType::StorageImage => vk1_0::DescriptorType::STORAGE_IMAGE,
            DescriptorType::UniformTexelBuffer => {
                vk1_0::DescriptorType::UNIFORM_TEXEL_BUFFER
            }
            DescriptorType::StorageTexelBuffer => {
                vk1_0::DescriptorType::STORAGE_TEXEL_BUFFER
            }
            DescriptorType::UniformBuffer => vk1_0::DescriptorType::UNIFORM_BUFFER,
            DescriptorType::StorageBuffer => vk1_0::DescriptorType::STORAGE_BUFFER,
            DescriptorType::UniformBufferDynamic => {
                vk1_0::DescriptorType::UNIFORM_BUFFER_DYNAMIC
            }
            DescriptorType::StorageBufferDynamic => {
                vk1_0::DescriptorType::STORAGE_BUFFER_DYNAMIC
            }
            DescriptorType::InputAttachment => vk1_0::DescriptorType::INPUT_ATTACHMENT,
            DescriptorType::AccelerationStructure => {
                vk1_0::DescriptorType::ACCELERATION_STRUCTURE_KHR
            }
            DescriptorType::InlineUniformBlock => {
                vk1_0::DescriptorType::INLINE_UNIFORM_BLOCK_EXT
            }
        }
    }
}

impl ToErupt<vk1_0::PipelineBindPoint> for PipelineBindPoint {
    fn to_erupt(self) -> vk1_0::PipelineBindPoint {
        match self {
            PipelineBindPoint::Graphics => vk1_0::PipelineBindPoint::GRAPHICS,
            PipelineBindPoint::Compute => vk1_0::PipelineBindPoint::COMPUTE,
            PipelineBindPoint::RayTracing => vk1_0::PipelineBindPoint::RAY_TRACING_KHR,
        }
    }
}

impl ToErupt<vk1_0::IndexType> for IndexType {
    fn to_erupt(self) -> vk1_0::IndexType {
        match self {
            IndexType::U16 => vk1_0::IndexType::UINT16,
            IndexType::U32 => vk1_0::IndexType::UINT32,
        }
    }
}

impl ToErupt<vkrt::StridedDeviceAddressRegionKHR> for StridedDeviceRegion {
    fn to_erupt(self) -> vkrt::StridedDeviceAddressRegionKHR {
        vkrt::StridedDeviceAddressRegionKHR {
            device_address: self.address,
            stride: self.stride,
            size: self.size,
        }
    }
}

pub(crate) fn out_of_host_memory() -> ! {
    std::alloc::handle_alloc_error(std::alloc::Layout::new::<u8>())
}

#[track_caller]
pub(crate) fn unexpected_result(result: vk1_0::Result) -> ! {
    panic!("Unexpected Vulkan result {}", result)
}

pub(crate) fn oom_error_from_erupt(err: vk1_0::Result) -> OutOfMemory {
    match err {
        vk1_0::Result::ERROR_OUT_OF_HOST_MEMORY => out_of_host_memory(),
        vk1_0::Result::ERROR_OUT_OF_DEVICE_MEMORY => OutOfMemory,
        _ => unexpected_result(err),
    }
}

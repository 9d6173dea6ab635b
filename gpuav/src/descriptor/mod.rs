mod manager;
mod set;
mod sizes;

pub use self::{set::*, sizes::*};
pub(crate) use self::manager::*;

use {
    crate::{
        device::{
            RawAccelerationStructure, RawBuffer, RawBufferView,
            RawDescriptorSetLayout, RawImageView, RawSampler,
        },
        pipeline::ShaderStageFlags,
        resource::{
            AccelerationStructureState, BufferState, BufferViewState,
            ImageViewState, SamplerState,
        },
    },
    smallvec::SmallVec,
    std::{
        fmt::{self, Debug},
        sync::Arc,
    },
};

bitflags::bitflags! {
    /// Options for one descriptor set layout binding.
    #[derive(Default)]
    #[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
    pub struct DescriptorBindingFlags: u32 {
        const UPDATE_AFTER_BIND = 0x00000001;
        const UPDATE_UNUSED_WHILE_PENDING = 0x00000002;
        const PARTIALLY_BOUND = 0x00000004;
        const VARIABLE_DESCRIPTOR_COUNT = 0x00000008;
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    #[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
    pub struct DescriptorSetLayoutFlags: u32 {
        const PUSH_DESCRIPTOR = 0x00000001;
        const UPDATE_AFTER_BIND_POOL = 0x00000002;
    }
}

/// Types of descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub enum DescriptorType {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
    InputAttachment,
    AccelerationStructure,
    InlineUniformBlock,
}

impl DescriptorType {
    pub fn is_dynamic(&self) -> bool {
        matches!(
            self,
            DescriptorType::UniformBufferDynamic
                | DescriptorType::StorageBufferDynamic
        )
    }

    pub fn is_uniform_buffer(&self) -> bool {
        matches!(
            self,
            DescriptorType::UniformBuffer | DescriptorType::UniformBufferDynamic
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            DescriptorType::Sampler => "sampler",
            DescriptorType::CombinedImageSampler => "combined image sampler",
            DescriptorType::SampledImage => "sampled image",
            DescriptorType::StorageImage => "storage image",
            DescriptorType::UniformTexelBuffer => "uniform texel buffer",
            DescriptorType::StorageTexelBuffer => "storage texel buffer",
            DescriptorType::UniformBuffer => "uniform buffer",
            DescriptorType::StorageBuffer => "storage buffer",
            DescriptorType::UniformBufferDynamic => "dynamic uniform buffer",
            DescriptorType::StorageBufferDynamic => "dynamic storage buffer",
            DescriptorType::InputAttachment => "input attachment",
            DescriptorType::AccelerationStructure => "acceleration structure",
            DescriptorType::InlineUniformBlock => "inline uniform block",
        }
    }
}

/// Defines layout for one binding in descriptor set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct DescriptorSetLayoutBinding {
    /// Binding index.
    pub binding: u32,

    /// Type of descriptor in the binding.
    pub ty: DescriptorType,

    /// Number of descriptors in the binding.
    /// Size in bytes for inline uniform blocks.
    pub count: u32,

    /// Shader stages where this binding is accessible.
    pub stages: ShaderStageFlags,

    /// Flags to specify options for the descriptor set layout binding.
    pub flags: DescriptorBindingFlags,
}

impl DescriptorSetLayoutBinding {
    /// Number of elements validation tracks for the binding.
    /// Inline uniform blocks are a single element.
    pub fn element_count(&self, variable_count: Option<u32>) -> u32 {
        if self.ty == DescriptorType::InlineUniformBlock {
            return 1;
        }
        match variable_count {
            Some(count)
                if self
                    .flags
                    .contains(DescriptorBindingFlags::VARIABLE_DESCRIPTOR_COUNT) =>
            {
                count.min(self.count)
            }
            _ => self.count,
        }
    }
}

/// Defines layout for descriptor sets.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct DescriptorSetLayoutInfo {
    pub bindings: Vec<DescriptorSetLayoutBinding>,
    pub flags: DescriptorSetLayoutFlags,
}

/// Application descriptor set layout as seen by the validator.
pub struct DescriptorSetLayoutState {
    raw: RawDescriptorSetLayout,
    flags: DescriptorSetLayoutFlags,

    /// Sorted by binding number.
    bindings: Vec<DescriptorSetLayoutBinding>,
}

impl Debug for DescriptorSetLayoutState {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("DescriptorSetLayoutState")
                .field("raw", &self.raw)
                .field("flags", &self.flags)
                .field("bindings", &self.bindings)
                .finish()
        } else {
            Debug::fmt(&self.raw, fmt)
        }
    }
}

impl DescriptorSetLayoutState {
    pub fn new(raw: RawDescriptorSetLayout, info: DescriptorSetLayoutInfo) -> Self {
        let mut bindings = info.bindings;
        bindings.sort_by_key(|b| b.binding);
        DescriptorSetLayoutState {
            raw,
            flags: info.flags,
            bindings,
        }
    }

    pub fn raw(&self) -> RawDescriptorSetLayout {
        self.raw
    }

    pub fn flags(&self) -> DescriptorSetLayoutFlags {
        self.flags
    }

    pub fn bindings(&self) -> &[DescriptorSetLayoutBinding] {
        &self.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&DescriptorSetLayoutBinding> {
        self.bindings
            .binary_search_by_key(&binding, |b| b.binding)
            .ok()
            .map(|index| &self.bindings[index])
    }

    /// Sets with this layout may change after they are bound.
    pub fn is_update_after_bind(&self) -> bool {
        self.flags
            .contains(DescriptorSetLayoutFlags::UPDATE_AFTER_BIND_POOL)
            || self.bindings.iter().any(|b| {
                b.flags.contains(DescriptorBindingFlags::UPDATE_AFTER_BIND)
            })
    }

    /// Number of binding slots including gaps.
    pub fn binding_slots(&self) -> u32 {
        self.bindings.last().map_or(0, |b| b.binding + 1)
    }
}

/// Range of a buffer bound to a descriptor.
/// `range == u64::MAX` means "until the end of the buffer".
#[derive(Clone, Debug)]
pub struct BufferRange {
    pub buffer: Option<Arc<BufferState>>,
    pub offset: u64,
    pub range: u64,
}

impl BufferRange {
    pub fn whole(buffer: &Arc<BufferState>) -> Self {
        BufferRange {
            buffer: Some(buffer.clone()),
            offset: 0,
            range: u64::MAX,
        }
    }

    pub fn new(buffer: &Arc<BufferState>, offset: u64, range: u64) -> Self {
        BufferRange {
            buffer: Some(buffer.clone()),
            offset,
            range,
        }
    }

    /// Resolved size of the range in bytes.
    pub fn size(&self) -> u64 {
        match &self.buffer {
            None => 0,
            Some(buffer) if self.range == u64::MAX => {
                buffer.size().saturating_sub(self.offset)
            }
            Some(_) => self.range,
        }
    }
}

/// Content of one descriptor array element.
/// `None` resources are null descriptors.
#[derive(Clone, Debug)]
pub enum Descriptor {
    /// Never written.
    Empty,
    Sampler(Option<Arc<SamplerState>>),
    ImageSampler {
        view: Option<Arc<ImageViewState>>,
        sampler: Option<Arc<SamplerState>>,
    },
    Image(Option<Arc<ImageViewState>>),
    TexelBuffer(Option<Arc<BufferViewState>>),
    Buffer(BufferRange),
    AccelerationStructure(Option<Arc<AccelerationStructureState>>),
    InlineUniform,
}

impl Default for Descriptor {
    fn default() -> Self {
        Descriptor::Empty
    }
}

impl Descriptor {
    pub fn is_empty(&self) -> bool {
        matches!(self, Descriptor::Empty)
    }

    pub fn to_raw(&self) -> RawDescriptor {
        match self {
            Descriptor::Empty => RawDescriptor::Empty,
            Descriptor::Sampler(sampler) => RawDescriptor::Sampler(
                sampler.as_ref().map_or(RawSampler::NULL, |s| s.raw()),
            ),
            Descriptor::ImageSampler { view, sampler } => {
                RawDescriptor::ImageSampler {
                    view: view.as_ref().map_or(RawImageView::NULL, |v| v.raw()),
                    sampler: sampler
                        .as_ref()
                        .map_or(RawSampler::NULL, |s| s.raw()),
                }
            }
            Descriptor::Image(view) => RawDescriptor::Image(
                view.as_ref().map_or(RawImageView::NULL, |v| v.raw()),
            ),
            Descriptor::TexelBuffer(view) => RawDescriptor::TexelBuffer(
                view.as_ref().map_or(RawBufferView::NULL, |v| v.raw()),
            ),
            Descriptor::Buffer(range) => RawDescriptor::Buffer {
                buffer: range.buffer.as_ref().map_or(RawBuffer::NULL, |b| b.raw()),
                offset: range.offset,
                range: range.range,
            },
            Descriptor::AccelerationStructure(accel) => {
                RawDescriptor::AccelerationStructure(
                    accel
                        .as_ref()
                        .map_or(RawAccelerationStructure::NULL, |a| a.raw()),
                )
            }
            Descriptor::InlineUniform => RawDescriptor::Empty,
        }
    }
}

/// Descriptors written by one update.
#[derive(Clone, Copy, Debug)]
pub enum Descriptors<'a> {
    Sampler(&'a [Option<Arc<SamplerState>>]),
    CombinedImageSampler(
        &'a [(Option<Arc<ImageViewState>>, Option<Arc<SamplerState>>)],
    ),
    SampledImage(&'a [Option<Arc<ImageViewState>>]),
    StorageImage(&'a [Option<Arc<ImageViewState>>]),
    UniformTexelBuffer(&'a [Option<Arc<BufferViewState>>]),
    StorageTexelBuffer(&'a [Option<Arc<BufferViewState>>]),
    UniformBuffer(&'a [BufferRange]),
    StorageBuffer(&'a [BufferRange]),
    UniformBufferDynamic(&'a [BufferRange]),
    StorageBufferDynamic(&'a [BufferRange]),
    InputAttachment(&'a [Option<Arc<ImageViewState>>]),
    AccelerationStructure(&'a [Option<Arc<AccelerationStructureState>>]),
    InlineUniformBlock(&'a [u8]),
}

impl<'a> Descriptors<'a> {
    pub fn ty(&self) -> DescriptorType {
        match self {
            Descriptors::Sampler(_) => DescriptorType::Sampler,
            Descriptors::CombinedImageSampler(_) => {
                DescriptorType::CombinedImageSampler
            }
            Descriptors::SampledImage(_) => DescriptorType::SampledImage,
            Descriptors::StorageImage(_) => DescriptorType::StorageImage,
            Descriptors::UniformTexelBuffer(_) => {
                DescriptorType::UniformTexelBuffer
            }
            Descriptors::StorageTexelBuffer(_) => {
                DescriptorType::StorageTexelBuffer
            }
            Descriptors::UniformBuffer(_) => DescriptorType::UniformBuffer,
            Descriptors::StorageBuffer(_) => DescriptorType::StorageBuffer,
            Descriptors::UniformBufferDynamic(_) => {
                DescriptorType::UniformBufferDynamic
            }
            Descriptors::StorageBufferDynamic(_) => {
                DescriptorType::StorageBufferDynamic
            }
            Descriptors::InputAttachment(_) => DescriptorType::InputAttachment,
            Descriptors::AccelerationStructure(_) => {
                DescriptorType::AccelerationStructure
            }
            Descriptors::InlineUniformBlock(_) => {
                DescriptorType::InlineUniformBlock
            }
        }
    }

    /// Number of array elements written.
    /// Inline uniform block data is one element.
    pub fn len(&self) -> usize {
        match self {
            Descriptors::Sampler(d) => d.len(),
            Descriptors::CombinedImageSampler(d) => d.len(),
            Descriptors::SampledImage(d)
            | Descriptors::StorageImage(d)
            | Descriptors::InputAttachment(d) => d.len(),
            Descriptors::UniformTexelBuffer(d)
            | Descriptors::StorageTexelBuffer(d) => d.len(),
            Descriptors::UniformBuffer(d)
            | Descriptors::StorageBuffer(d)
            | Descriptors::UniformBufferDynamic(d)
            | Descriptors::StorageBufferDynamic(d) => d.len(),
            Descriptors::AccelerationStructure(d) => d.len(),
            Descriptors::InlineUniformBlock(_) => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Descriptor {
        match self {
            Descriptors::Sampler(d) => Descriptor::Sampler(d[index].clone()),
            Descriptors::CombinedImageSampler(d) => {
                let (view, sampler) = d[index].clone();
                Descriptor::ImageSampler { view, sampler }
            }
            Descriptors::SampledImage(d)
            | Descriptors::StorageImage(d)
            | Descriptors::InputAttachment(d) => Descriptor::Image(d[index].clone()),
            Descriptors::UniformTexelBuffer(d)
            | Descriptors::StorageTexelBuffer(d) => {
                Descriptor::TexelBuffer(d[index].clone())
            }
            Descriptors::UniformBuffer(d)
            | Descriptors::StorageBuffer(d)
            | Descriptors::UniformBufferDynamic(d)
            | Descriptors::StorageBufferDynamic(d) => {
                Descriptor::Buffer(d[index].clone())
            }
            Descriptors::AccelerationStructure(d) => {
                Descriptor::AccelerationStructure(d[index].clone())
            }
            Descriptors::InlineUniformBlock(_) => Descriptor::InlineUniform,
        }
    }

    /// Raw handles to forward to the device.
    pub fn to_raw(&self) -> SmallVec<[RawDescriptor; 4]> {
        match self {
            Descriptors::InlineUniformBlock(data) => {
                std::iter::once(RawDescriptor::InlineUniform(data.to_vec()))
                    .collect()
            }
            _ => (0..self.len()).map(|i| self.get(i).to_raw()).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct WriteDescriptorSet<'a> {
    pub set: &'a Arc<DescriptorSetState>,
    pub binding: u32,
    pub element: u32,
    pub descriptors: Descriptors<'a>,
}

/// Write into a push descriptor set.
#[derive(Clone, Copy, Debug)]
pub struct PushDescriptorWrite<'a> {
    pub binding: u32,
    pub element: u32,
    pub descriptors: Descriptors<'a>,
}

impl PushDescriptorWrite<'_> {
    pub fn to_raw(&self) -> RawDescriptorWrite {
        RawDescriptorWrite {
            binding: self.binding,
            element: self.element,
            ty: self.descriptors.ty(),
            descriptors: self.descriptors.to_raw(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CopyDescriptorSet<'a> {
    pub src: &'a Arc<DescriptorSetState>,
    pub src_binding: u32,
    pub src_element: u32,
    pub dst: &'a Arc<DescriptorSetState>,
    pub dst_binding: u32,
    pub dst_element: u32,
    pub count: u32,
}

/// Descriptor in terms of device handles.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RawDescriptor {
    Empty,
    Sampler(RawSampler),
    ImageSampler {
        view: RawImageView,
        sampler: RawSampler,
    },
    Image(RawImageView),
    TexelBuffer(RawBufferView),
    Buffer {
        buffer: RawBuffer,
        offset: u64,
        range: u64,
    },
    AccelerationStructure(RawAccelerationStructure),
    InlineUniform(Vec<u8>),
}

/// Push descriptor write recorded into a command buffer.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RawDescriptorWrite {
    pub binding: u32,
    pub element: u32,
    pub ty: DescriptorType,
    pub descriptors: SmallVec<[RawDescriptor; 4]>,
}

/// Buffer write into the validator's own descriptor sets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDescriptorWrite {
    pub binding: u32,
    pub ty: DescriptorType,
    pub buffer: RawBuffer,
    pub offset: u64,
    pub range: u64,
}

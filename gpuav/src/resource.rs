//! Application resources tracked by the validator.

use {
    crate::{
        buffer::BufferInfo,
        device::{
            RawAccelerationStructure, RawBuffer, RawBufferView, RawImageView,
            RawSampler,
        },
        heap::{DescriptorId, DescriptorIdGuard},
        DeviceAddress,
    },
    parking_lot::Mutex,
    std::{
        fmt::{self, Debug},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

/// Liveness shared by all tracked resources.
struct Tracking {
    id: Mutex<DescriptorIdGuard>,
    destroyed: AtomicBool,
}

impl Tracking {
    fn new(id: DescriptorIdGuard) -> Self {
        Tracking {
            id: Mutex::new(id),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Id stays readable after destruction so stale references can be
    /// reported.
    fn id(&self) -> DescriptorId {
        self.id.lock().id()
    }

    fn destroy(&self, last_id: &Mutex<DescriptorId>) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            let mut guard = self.id.lock();
            *last_id.lock() = guard.id();
            guard.release();
        }
    }
}

macro_rules! tracked_resource {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            raw: $raw:ty,
            $(pub $field:ident: $ty:ty,)*
        }
    ) => {
        $(#[$meta])*
        pub struct $name {
            raw: $raw,
            $(pub $field: $ty,)*
            tracking: Tracking,
            last_id: Mutex<DescriptorId>,
        }

        impl Debug for $name {
            fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
                if fmt.alternate() {
                    fmt.debug_struct(stringify!($name))
                        .field("raw", &self.raw)
                        $(.field(stringify!($field), &self.$field))*
                        .field("id", &self.id())
                        .field("destroyed", &self.is_destroyed())
                        .finish()
                } else {
                    Debug::fmt(&self.raw, fmt)
                }
            }
        }

        impl $name {
            pub fn raw(&self) -> $raw {
                self.raw
            }

            /// Descriptor id. After destruction returns the id the resource
            /// had while alive.
            pub fn id(&self) -> DescriptorId {
                if self.is_destroyed() {
                    *self.last_id.lock()
                } else {
                    self.tracking.id()
                }
            }

            pub fn is_destroyed(&self) -> bool {
                self.tracking.destroyed.load(Ordering::Acquire)
            }

            /// Marks resource destroyed and frees its id.
            pub(crate) fn destroy(&self) {
                self.tracking.destroy(&self.last_id)
            }
        }
    };
}

tracked_resource! {
    pub struct BufferState {
        raw: RawBuffer,
        pub info: BufferInfo,
        pub address: Option<DeviceAddress>,
    }
}

tracked_resource! {
    pub struct BufferViewState {
        raw: RawBufferView,
        pub buffer: Arc<BufferState>,
        pub offset: u64,
        pub range: u64,
        pub format_size: u32,
    }
}

tracked_resource! {
    pub struct ImageViewState {
        raw: RawImageView,
        pub info: ImageViewInfo,
    }
}

tracked_resource! {
    pub struct SamplerState {
        raw: RawSampler,
    }
}

tracked_resource! {
    pub struct AccelerationStructureState {
        raw: RawAccelerationStructure,
        pub address: Option<DeviceAddress>,
    }
}

impl BufferState {
    pub(crate) fn new(
        raw: RawBuffer,
        info: BufferInfo,
        address: Option<DeviceAddress>,
        id: DescriptorIdGuard,
    ) -> Self {
        BufferState {
            raw,
            info,
            address,
            tracking: Tracking::new(id),
            last_id: Mutex::new(DescriptorId::INVALID),
        }
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }
}

impl BufferViewState {
    pub(crate) fn new(
        raw: RawBufferView,
        buffer: Arc<BufferState>,
        offset: u64,
        range: u64,
        format_size: u32,
        id: DescriptorIdGuard,
    ) -> Self {
        BufferViewState {
            raw,
            buffer,
            offset,
            range,
            format_size,
            tracking: Tracking::new(id),
            last_id: Mutex::new(DescriptorId::INVALID),
        }
    }

    /// Number of texels the view exposes.
    pub fn texel_count(&self) -> u32 {
        let range = if self.range == u64::MAX {
            self.buffer.size().saturating_sub(self.offset)
        } else {
            self.range
        };
        (range / u64::from(self.format_size.max(1))) as u32
    }
}

impl ImageViewState {
    pub(crate) fn new(
        raw: RawImageView,
        info: ImageViewInfo,
        id: DescriptorIdGuard,
    ) -> Self {
        ImageViewState {
            raw,
            info,
            tracking: Tracking::new(id),
            last_id: Mutex::new(DescriptorId::INVALID),
        }
    }
}

impl SamplerState {
    pub(crate) fn new(raw: RawSampler, id: DescriptorIdGuard) -> Self {
        SamplerState {
            raw,
            tracking: Tracking::new(id),
            last_id: Mutex::new(DescriptorId::INVALID),
        }
    }
}

impl AccelerationStructureState {
    pub(crate) fn new(
        raw: RawAccelerationStructure,
        address: Option<DeviceAddress>,
        id: DescriptorIdGuard,
    ) -> Self {
        AccelerationStructureState {
            raw,
            address,
            tracking: Tracking::new(id),
            last_id: Mutex::new(DescriptorId::INVALID),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ImageViewKind {
    D1,
    D2,
    D3,
    Cube,
    D1Array,
    D2Array,
    CubeArray,
}

/// Image view properties messages refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageViewInfo {
    pub kind: ImageViewKind,

    /// Depth formats get copy range checks.
    pub depth: bool,
}

/// Format of an image copy destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CopyImageFormat {
    D32Sfloat,
    D32SfloatS8Uint,
    Other { texel_size: u32 },
}

impl CopyImageFormat {
    /// Size of one texel in the source buffer.
    pub fn texel_size(&self) -> u32 {
        match *self {
            CopyImageFormat::D32Sfloat => 4,
            // Depth aspect is copied alone.
            CopyImageFormat::D32SfloatS8Uint => 4,
            CopyImageFormat::Other { texel_size } => texel_size,
        }
    }

    pub fn is_float_depth(&self) -> bool {
        !matches!(self, CopyImageFormat::Other { .. })
    }
}

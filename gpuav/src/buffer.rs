use {
    crate::{
        device::{Device, MapError, RawBuffer},
        DeviceAddress,
    },
    bytemuck::{cast_slice, cast_slice_mut, Pod},
    std::fmt::{self, Debug},
};

bitflags::bitflags! {
    #[derive(Default)]
    #[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x00000001;
        const TRANSFER_DST = 0x00000002;
        const UNIFORM_TEXEL = 0x00000004;
        const STORAGE_TEXEL = 0x00000008;
        const UNIFORM = 0x00000010;
        const STORAGE = 0x00000020;
        const INDEX = 0x00000040;
        const VERTEX = 0x00000080;
        const INDIRECT = 0x00000100;
        const SHADER_DEVICE_ADDRESS = 0x00020000;
        const ACCELERATION_STRUCTURE_STORAGE = 0x00100000;
        const SHADER_BINDING_TABLE = 0x00000400;
    }
}

/// Information required to create a buffer.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub struct BufferInfo {
    /// Size of content buffer can hold.
    pub size: u64,

    /// Usage types supported by buffer.
    pub usage: BufferUsage,
}

impl BufferInfo {
    /// Storage buffer the validator reads and writes from shaders and host.
    pub fn storage(size: u64) -> Self {
        BufferInfo {
            size,
            usage: BufferUsage::STORAGE
                | BufferUsage::TRANSFER_DST
                | BufferUsage::SHADER_DEVICE_ADDRESS,
        }
    }

    pub fn uniform(size: u64) -> Self {
        BufferInfo {
            size,
            usage: BufferUsage::UNIFORM | BufferUsage::TRANSFER_DST,
        }
    }
}

/// Host visible buffer owned by the validator.
/// Destroyed when dropped.
pub struct Buffer {
    device: Device,
    raw: RawBuffer,
    info: BufferInfo,
    address: Option<DeviceAddress>,
}

impl Debug for Buffer {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("Buffer")
                .field("raw", &self.raw)
                .field("info", &self.info)
                .field("address", &self.address)
                .finish()
        } else {
            Debug::fmt(&self.raw, fmt)
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.raw);
    }
}

impl Buffer {
    pub(crate) fn new(
        device: Device,
        raw: RawBuffer,
        info: BufferInfo,
        address: Option<DeviceAddress>,
    ) -> Self {
        Buffer {
            device,
            raw,
            info,
            address,
        }
    }

    pub fn raw(&self) -> RawBuffer {
        self.raw
    }

    pub fn info(&self) -> &BufferInfo {
        &self.info
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    pub fn address(&self) -> Option<DeviceAddress> {
        self.address
    }

    /// Raw address value, `0` for buffers without one.
    pub fn address_value(&self) -> u64 {
        self.address.map_or(0, |a| a.get())
    }

    pub fn write<T: Pod>(&self, offset: u64, data: &[T]) -> Result<(), MapError> {
        self.device.write_buffer(self.raw, offset, cast_slice(data))
    }

    pub fn read<T: Pod>(
        &self,
        offset: u64,
        data: &mut [T],
    ) -> Result<(), MapError> {
        self.device.read_buffer(self.raw, offset, cast_slice_mut(data))
    }

    /// Reads `count` words starting at word `first`.
    pub fn read_words(
        &self,
        first: usize,
        count: usize,
    ) -> Result<Vec<u32>, MapError> {
        let mut words = vec![0u32; count];
        self.read(4 * first as u64, &mut words)?;
        Ok(words)
    }

    /// Number of whole `u32` words buffer can hold.
    pub fn word_capacity(&self) -> usize {
        (self.info.size / 4) as usize
    }

    pub fn fill_zero(&self) -> Result<(), MapError> {
        let zeros = vec![0u8; self.info.size as usize];
        self.device.write_buffer(self.raw, 0, &zeros)
    }
}

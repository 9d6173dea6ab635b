//! GPU-assisted validation.
//!
//! This crate sits between an application and a graphics device and checks
//! what only the GPU can observe: descriptor indexing, buffer device address
//! use, ray query arguments and indirect command parameters. Shaders are
//! rewritten to write compact error records into buffers owned by the
//! validator, small validation pipelines are injected in front of indirect
//! commands, and after the work completes the records are decoded into
//! diagnostics with source line information.
//!
//! Entry points are [`Validator`], [`CommandBuffer`] and [`Queue`].
//! The device itself is abstracted by [`DeviceTrait`], shader rewriting by
//! [`Toolkit`] and message delivery by [`Reporter`].

macro_rules! define_handle {
    ($(#[$meta:meta])* pub struct $name:ident;) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const NULL: Self = $name(0);

            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(fmt, "{}({:#x})", stringify!($name), self.0)
            }
        }
    };
}

pub mod backend;
mod bda;
mod buffer;
mod command;
mod command_buffer;
mod decode;
mod descriptor;
mod device;
mod heap;
mod instrument;
mod message;
mod pipeline;
mod postprocess;
mod preaction;
mod queue;
mod report;
mod resource;
mod resources;
mod settings;
pub mod spirv;
mod validator;
pub mod wire;

pub use self::{
    bda::*, buffer::*, command::*, command_buffer::*, decode::*,
    descriptor::*, device::*, heap::*, instrument::*, pipeline::*,
    queue::*, report::*, resource::*, resources::*, settings::*,
    validator::*,
};

use std::{
    fmt::{self, Debug, Display},
    num::NonZeroU64,
};

/// Device memory or host memory required for an operation is exhausted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[error("Out of device memory")]
pub struct OutOfMemory;

/// Address of a buffer in device memory.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DeviceAddress(pub NonZeroU64);

impl DeviceAddress {
    pub fn new(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(DeviceAddress)
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }

    /// Returns address `offset` bytes after this one.
    pub fn offset(&self, offset: u64) -> Self {
        let value = self.0.get().saturating_add(offset);
        DeviceAddress(NonZeroU64::new(value).unwrap_or(self.0))
    }
}

impl Debug for DeviceAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "DeviceAddress({:#x})", self.0.get())
    }
}

impl Display for DeviceAddress {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{:#x}", self.0.get())
    }
}

/// Splits 64-bit value into low and high words.
#[inline(always)]
pub(crate) fn split_u64(value: u64) -> [u32; 2] {
    [value as u32, (value >> 32) as u32]
}

/// Joins low and high words.
#[inline(always)]
pub(crate) fn join_u64(lo: u32, hi: u32) -> u64 {
    u64::from(lo) | (u64::from(hi) << 32)
}

/// Rounds `value` up to multiple of `mask + 1`.
/// Returns `None` on overflow.
#[inline(always)]
pub(crate) fn align_up(mask: u64, value: u64) -> Option<u64> {
    Some(value.checked_add(mask)? & !mask)
}

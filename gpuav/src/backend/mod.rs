//! Implementations of [`DeviceTrait`](crate::DeviceTrait),
//! [`CommandSink`](crate::CommandSink) and [`QueueTrait`](crate::QueueTrait).

pub mod software;

#[cfg(feature = "vulkan")]
pub mod vulkan;

//! Vulkan backend built on erupt.
//!
//! The embedder creates the instance, device and queues, then wraps them
//! in [`VulkanDevice`], [`VulkanQueue`] and [`VulkanCommandBuffer`].
//! SPIR-V of the validation pipelines is provided with
//! [`ValidationShaders`].

mod command;
mod convert;
mod device;
mod queue;

pub use self::{
    command::{RenderPassTarget, VulkanCommandBuffer},
    device::{ValidationShaders, VulkanDevice},
    queue::VulkanQueue,
};

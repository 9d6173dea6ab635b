//! Device that lives in host memory.
//!
//! Useful to run the validator where no GPU is available and to exercise it
//! end to end in tests: validation pipelines execute for real and
//! application pipelines are [`Program`]s that perform the checks
//! instrumentation would add.

mod command;
mod device;
mod program;
mod queue;

pub use self::{
    command::{Recorded, SoftCommandBuffer},
    device::SoftDevice,
    program::{check_ray_query, Invocation, Program, RayQueryArgs},
    queue::SoftQueue,
};

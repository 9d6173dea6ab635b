use {
    super::{command::VulkanCommandBuffer, convert::oom_error_from_erupt},
    crate::{
        command::CommandSink,
        queue::{QueueTrait, SubmitError},
    },
    erupt::{vk1_0, DeviceLoader},
    smallvec::SmallVec,
    std::{
        collections::VecDeque,
        fmt::{self, Debug},
        sync::Arc,
    },
};

/// Vulkan queue. Each submission signals its own fence.
pub struct VulkanQueue {
    logical: Arc<DeviceLoader>,
    handle: vk1_0::Queue,
    submitted: u64,
    completed: u64,
    pending: VecDeque<(u64, vk1_0::Fence)>,
    free_fences: Vec<vk1_0::Fence>,
}

// Queue handle is externally synchronized by `&mut self`.
unsafe impl Send for VulkanQueue {}

impl Debug for VulkanQueue {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.handle, fmt)
    }
}

impl Drop for VulkanQueue {
    fn drop(&mut self) {
        if let Err(err) = self.wait(self.submitted) {
            tracing::error!("Failed to wait for queue {:?}: {}", self.handle, err);
        }
        for fence in self.free_fences.drain(..) {
            unsafe { self.logical.destroy_fence(Some(fence), None) }
        }
    }
}

impl VulkanQueue {
    pub fn new(logical: Arc<DeviceLoader>, handle: vk1_0::Queue) -> Self {
        VulkanQueue {
            logical,
            handle,
            submitted: 0,
            completed: 0,
            pending: VecDeque::new(),
            free_fences: Vec::new(),
        }
    }

    fn fence(&mut self) -> Result<vk1_0::Fence, SubmitError> {
        match self.free_fences.pop() {
            Some(fence) => Ok(fence),
            None => unsafe {
                self.logical
                    .create_fence(&vk1_0::FenceCreateInfo::default().into_builder(), None, None)
            }
            .result()
            .map_err(submit_error_from_erupt),
        }
    }
}

impl QueueTrait for VulkanQueue {
    fn submit(
        &mut self,
        command_buffers: &mut [&mut dyn CommandSink],
    ) -> Result<u64, SubmitError> {
        let mut handles = SmallVec::<[_; 8]>::with_capacity(command_buffers.len());
        for (index, sink) in command_buffers.iter_mut().enumerate() {
            match sink.as_any_mut().downcast_mut::<VulkanCommandBuffer>() {
                Some(command_buffer) => handles.push(command_buffer.finish()?),
                None => return Err(SubmitError::ForeignCommandBuffer { index }),
            }
        }

        let fence = self.fence()?;
        let result = unsafe {
            self.logical.queue_submit(
                self.handle,
                &[vk1_0::SubmitInfo::default()
                    .into_builder()
                    .command_buffers(&handles)],
                Some(fence),
            )
        }
        .result();

        if let Err(err) = result {
            self.free_fences.push(fence);
            return Err(submit_error_from_erupt(err));
        }

        self.submitted += 1;
        self.pending.push_back((self.submitted, fence));
        Ok(self.submitted)
    }

    fn is_complete(&self, serial: u64) -> bool {
        if serial <= self.completed {
            return true;
        }

        match self.pending.iter().find(|(pending, _)| *pending == serial) {
            Some(&(_, fence)) => {
                let status = unsafe { self.logical.get_fence_status(fence) };
                status.raw == vk1_0::Result::SUCCESS
            }
            None => false,
        }
    }

    fn wait(&mut self, serial: u64) -> Result<(), SubmitError> {
        while let Some(&(pending, fence)) = self.pending.front() {
            if pending > serial {
                break;
            }

            unsafe {
                self.logical
                    .wait_for_fences(&[fence], true, u64::max_value())
                    .result()
                    .map_err(submit_error_from_erupt)?;
                self.logical
                    .reset_fences(&[fence])
                    .result()
                    .map_err(submit_error_from_erupt)?;
            }

            self.pending.pop_front();
            self.free_fences.push(fence);
            self.completed = pending;
        }
        Ok(())
    }
}

fn submit_error_from_erupt(err: vk1_0::Result) -> SubmitError {
    match err {
        vk1_0::Result::ERROR_DEVICE_LOST => SubmitError::DeviceLost,
        _ => SubmitError::OutOfMemory {
            source: oom_error_from_erupt(err),
        },
    }
}

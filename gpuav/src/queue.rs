use {
    crate::{
        command::CommandSink,
        command_buffer::{
            CommandBuffer, CommandBufferError, CommandBufferInner, CommandBufferState,
        },
        postprocess::process,
        validator::Validator,
        OutOfMemory,
    },
    parking_lot::Mutex,
    std::{
        collections::VecDeque,
        fmt::{self, Debug},
        sync::Arc,
    },
};

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Command buffer {index} can't be submitted: {source}")]
    CommandBuffer {
        index: usize,
        #[source]
        source: CommandBufferError,
    },

    #[error("{source}")]
    OutOfMemory {
        #[from]
        source: OutOfMemory,
    },

    #[error("Command buffer {index} was not created for this queue's device")]
    ForeignCommandBuffer { index: usize },

    #[error("Device lost")]
    DeviceLost,
}

/// Queue of the underlying device.
pub trait QueueTrait: Debug + Send + 'static {
    /// Submits command buffers in order. Returns submission serial.
    fn submit(
        &mut self,
        command_buffers: &mut [&mut dyn CommandSink],
    ) -> Result<u64, SubmitError>;

    fn is_complete(&self, serial: u64) -> bool;

    /// Blocks until submission `serial` completes.
    fn wait(&mut self, serial: u64) -> Result<(), SubmitError>;
}

struct Pending {
    serial: u64,
    command_buffers: Vec<Arc<Mutex<CommandBufferInner>>>,
}

/// Queue wrapper that prepares validation state before submission and
/// reports errors after completion.
pub struct Queue {
    validator: Arc<Validator>,
    inner: Box<dyn QueueTrait>,
    pending: VecDeque<Pending>,
}

impl Debug for Queue {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Queue")
            .field("inner", &self.inner)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Queue {
    pub fn new(validator: &Arc<Validator>, inner: Box<dyn QueueTrait>) -> Self {
        Queue {
            validator: validator.clone(),
            inner,
            pending: VecDeque::new(),
        }
    }

    pub fn inner(&self) -> &dyn QueueTrait {
        &*self.inner
    }

    /// Number of submissions not yet processed.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[tracing::instrument(skip(self, command_buffers), fields(count = command_buffers.len()))]
    pub fn submit(
        &mut self,
        command_buffers: &mut [&mut CommandBuffer],
    ) -> Result<(), SubmitError> {
        for (index, command_buffer) in command_buffers.iter().enumerate() {
            match command_buffer.state() {
                CommandBufferState::Executable | CommandBufferState::Processed => {}
                CommandBufferState::Submitted => {
                    return Err(SubmitError::CommandBuffer {
                        index,
                        source: CommandBufferError::Pending,
                    })
                }
                state => {
                    return Err(SubmitError::CommandBuffer {
                        index,
                        source: CommandBufferError::InvalidState {
                            state,
                            expected: CommandBufferState::Executable,
                        },
                    })
                }
            }
        }

        if !self.validator.is_aborted() {
            self.validator.sync_tables();
        }

        for command_buffer in command_buffers.iter() {
            if self.validator.is_aborted() {
                break;
            }
            let mut inner = command_buffer.shared().lock();
            if let Err(err) = inner.pre_submit(&self.validator) {
                drop(inner);
                self.validator
                    .abort(&format!("Failed to prepare command buffer: {}", err));
            }
        }

        let mut sinks: Vec<&mut dyn CommandSink> = command_buffers
            .iter_mut()
            .map(|command_buffer| command_buffer.sink_mut())
            .collect();
        let serial = self.inner.submit(&mut sinks)?;

        let shared = command_buffers
            .iter()
            .map(|command_buffer| {
                let shared = command_buffer.shared().clone();
                shared.lock().state = CommandBufferState::Submitted;
                shared
            })
            .collect();

        tracing::trace!("Submission {} pending", serial);
        self.pending.push_back(Pending {
            serial,
            command_buffers: shared,
        });
        Ok(())
    }

    /// Processes every completed submission in order.
    /// Returns number of diagnostics reported.
    pub fn poll(&mut self) -> usize {
        let mut reported = 0;
        while let Some(pending) = self.pending.front() {
            if !self.inner.is_complete(pending.serial) {
                break;
            }
            if let Some(pending) = self.pending.pop_front() {
                reported += self.complete(pending);
            }
        }
        reported
    }

    /// Waits for all submissions and processes them.
    /// Returns number of diagnostics reported.
    pub fn wait_idle(&mut self) -> Result<usize, SubmitError> {
        let mut reported = 0;
        while let Some(pending) = self.pending.pop_front() {
            self.inner.wait(pending.serial)?;
            reported += self.complete(pending);
        }
        Ok(reported)
    }

    fn complete(&self, pending: Pending) -> usize {
        tracing::trace!("Submission {} complete", pending.serial);
        pending
            .command_buffers
            .iter()
            .map(|inner| process(&self.validator, &mut inner.lock()))
            .sum()
    }
}

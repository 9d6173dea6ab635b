use {
    super::{
        command::{Recorded, SoftCommandBuffer},
        device::{Memory, SoftDevice, SoftPipeline},
        program::{command_indices, Invocation},
    },
    crate::{
        command::CommandSink,
        device::{RawDescriptorSet, RawPipeline, ValidationPipelineKind},
        join_u64,
        pipeline::PipelineBindPoint,
        preaction::{
            evaluate_copy_buffer_to_image, evaluate_pre_dispatch, evaluate_pre_draw,
            evaluate_pre_trace_rays, ActionOutput,
        },
        queue::{QueueTrait, SubmitError},
        wire::{
            action_set, output, validation_set, CopyBufferToImagePushConstants,
            PreDispatchPushConstants, PreDrawPushConstants, PreTraceRaysPushConstants,
        },
    },
    bytemuck::Pod,
    std::{
        collections::VecDeque,
        fmt::{self, Debug},
        sync::Arc,
    },
};

/// Queue of the software device.
///
/// Immediate queues execute command buffers during submission. Deferred
/// queues keep them until [`SoftQueue::execute_pending`] or a wait, which
/// lets callers observe submissions that did not complete yet.
pub struct SoftQueue {
    device: Arc<SoftDevice>,
    deferred: bool,
    submitted: u64,
    completed: u64,
    pending: VecDeque<(u64, Vec<Vec<Recorded>>)>,
}

impl Debug for SoftQueue {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("SoftQueue")
            .field("deferred", &self.deferred)
            .field("submitted", &self.submitted)
            .field("completed", &self.completed)
            .finish()
    }
}

impl SoftQueue {
    pub fn new(device: Arc<SoftDevice>) -> Self {
        SoftQueue {
            device,
            deferred: false,
            submitted: 0,
            completed: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn deferred(device: Arc<SoftDevice>) -> Self {
        SoftQueue {
            deferred: true,
            ..SoftQueue::new(device)
        }
    }

    /// Executes all pending submissions.
    pub fn execute_pending(&mut self) {
        while let Some((serial, command_buffers)) = self.pending.pop_front() {
            for commands in &command_buffers {
                execute(&self.device, commands);
            }
            self.completed = serial;
        }
    }
}

impl QueueTrait for SoftQueue {
    fn submit(
        &mut self,
        command_buffers: &mut [&mut dyn CommandSink],
    ) -> Result<u64, SubmitError> {
        let mut recorded = Vec::with_capacity(command_buffers.len());
        for (index, sink) in command_buffers.iter_mut().enumerate() {
            match sink.as_any_mut().downcast_mut::<SoftCommandBuffer>() {
                Some(command_buffer) => recorded.push(command_buffer.commands().to_vec()),
                None => return Err(SubmitError::ForeignCommandBuffer { index }),
            }
        }

        self.submitted += 1;
        self.pending.push_back((self.submitted, recorded));
        if !self.deferred {
            self.execute_pending();
        }
        Ok(self.submitted)
    }

    fn is_complete(&self, serial: u64) -> bool {
        serial <= self.completed
    }

    fn wait(&mut self, serial: u64) -> Result<(), SubmitError> {
        if serial > self.submitted {
            tracing::error!("Waiting for submission {} that never happened", serial);
            return Err(SubmitError::DeviceLost);
        }
        while self.completed < serial {
            match self.pending.pop_front() {
                Some((serial, command_buffers)) => {
                    for commands in &command_buffers {
                        execute(&self.device, commands);
                    }
                    self.completed = serial;
                }
                None => break,
            }
        }
        Ok(())
    }
}

/// Bound state while executing one command buffer.
#[derive(Default)]
struct State {
    pipelines: [Option<RawPipeline>; PipelineBindPoint::COUNT],
    sets: [Vec<RawDescriptorSet>; PipelineBindPoint::COUNT],
    push_constants: Vec<u8>,
}

/// Runs commands. Programs run once per launch command.
fn execute(device: &SoftDevice, commands: &[Recorded]) {
    let mut memory = device.memory();
    let mut state = State::default();

    for command in commands {
        match command {
            Recorded::BindPipeline {
                bind_point,
                pipeline,
            } => state.pipelines[bind_point.index()] = Some(*pipeline),
            Recorded::BindDescriptorSets {
                bind_point,
                first_set,
                sets,
                ..
            } => {
                let bound = &mut state.sets[bind_point.index()];
                let first = *first_set as usize;
                if bound.len() < first + sets.len() {
                    bound.resize(first + sets.len(), RawDescriptorSet::NULL);
                }
                bound[first..first + sets.len()].copy_from_slice(sets);
            }
            Recorded::PushDescriptorSet {
                bind_point, set, ..
            } => {
                let bound = &mut state.sets[bind_point.index()];
                let set = *set as usize;
                if bound.len() <= set {
                    bound.resize(set + 1, RawDescriptorSet::NULL);
                }
                bound[set] = RawDescriptorSet::NULL;
            }
            Recorded::PushConstants { offset, data, .. } => {
                let offset = *offset as usize;
                if state.push_constants.len() < offset + data.len() {
                    state.push_constants.resize(offset + data.len(), 0);
                }
                state.push_constants[offset..offset + data.len()].copy_from_slice(data);
            }
            command => {
                if let Some(bind_point) = command.launches() {
                    launch(&mut memory, &state, bind_point);
                }
            }
        }
    }
}

fn launch(memory: &mut Memory, state: &State, bind_point: PipelineBindPoint) {
    let pipeline = match state.pipelines[bind_point.index()] {
        Some(pipeline) => pipeline,
        None => {
            tracing::warn!("Launch without {:?} pipeline bound", bind_point);
            return;
        }
    };
    let sets = &state.sets[bind_point.index()];

    let program = match memory.pipeline(pipeline) {
        Some(SoftPipeline::Validation(kind)) => {
            let kind = *kind;
            run_validation(memory, kind, sets, &state.push_constants);
            return;
        }
        Some(SoftPipeline::Program(program)) => program,
        None => {
            tracing::warn!("Launch of unknown pipeline {:?}", pipeline);
            return;
        }
    };

    if program.bind_point != bind_point {
        tracing::warn!(
            "Pipeline {:?} is bound to {:?} but created for {:?}",
            pipeline,
            bind_point,
            program.bind_point
        );
        return;
    }

    let validation_set = program
        .validation_slot
        .and_then(|slot| sets.get(slot as usize).copied())
        .filter(|set| !set.is_null());
    let (run, shader_id, stage) = (program.program.clone(), program.shader_id, program.stage);

    let mut invocation = Invocation::new(
        memory,
        validation_set,
        &state.push_constants,
        shader_id,
        stage,
    );
    run.run(&mut invocation);
}

/// Reads push constants of a validation pipeline.
fn constants<T: Pod>(bytes: &[u8]) -> T {
    let mut value = T::zeroed();
    let dst = bytemuck::bytes_of_mut(&mut value);
    let len = dst.len().min(bytes.len());
    dst[..len].copy_from_slice(&bytes[..len]);
    value
}

/// Validation pipelines find the validation set at 0 and the action set at 1.
fn run_validation(
    memory: &mut Memory,
    kind: ValidationPipelineKind,
    sets: &[RawDescriptorSet],
    push_constants: &[u8],
) {
    let validation = match sets.first() {
        Some(&set) if !set.is_null() => set,
        _ => {
            tracing::warn!("Validation pipeline {:?} launched without validation set", kind);
            return;
        }
    };
    let action = sets.get(1).copied().unwrap_or(RawDescriptorSet::NULL);

    let mut words = memory.binding_words(validation, validation_set::OUTPUT);
    if words.len() < output::DATA {
        return;
    }
    let mut counts = memory.binding_words(validation, validation_set::ERROR_COUNTS);
    let indices = command_indices(memory, validation);
    let source = memory.binding_words(action, action_set::SOURCE);

    {
        let mut out = ActionOutput::new(&mut words, &mut counts, indices);
        match kind {
            ValidationPipelineKind::PreDraw => {
                let aux = memory.binding_words(action, action_set::AUX);
                let pc: PreDrawPushConstants = constants(push_constants);
                evaluate_pre_draw(&pc, &source, &aux, &mut out);
            }
            ValidationPipelineKind::PreDispatch => {
                let pc: PreDispatchPushConstants = constants(push_constants);
                evaluate_pre_dispatch(&pc, &source, &mut out);
            }
            ValidationPipelineKind::PreTraceRays => {
                let pc: PreTraceRaysPushConstants = constants(push_constants);
                let address = join_u64(pc.address_lo, pc.address_hi);
                let extent = [
                    memory.load(address),
                    memory.load(address + 4),
                    memory.load(address + 8),
                ];
                evaluate_pre_trace_rays(&pc, extent, &mut out);
            }
            ValidationPipelineKind::PreCopyBufferToImage => {
                let pc: CopyBufferToImagePushConstants = constants(push_constants);
                evaluate_copy_buffer_to_image(&pc, &source, &mut out);
            }
        }
    }

    memory.write_binding_words(validation, validation_set::OUTPUT, &words);
    memory.write_binding_words(validation, validation_set::ERROR_COUNTS, &counts);
}

use {
    super::program::{Program, ProgramPipeline},
    crate::{
        buffer::{BufferInfo, BufferUsage},
        descriptor::{BufferDescriptorWrite, DescriptorSetLayoutBinding, DescriptorSizes},
        device::{
            AllocateDescriptorSetError, CreatePipelineError, DeviceFeatures, DeviceLimits,
            DeviceTrait, MapError, RawBuffer, RawDescriptorPool, RawDescriptorSet,
            RawDescriptorSetLayout, RawImage, RawPipeline, RawPipelineLayout,
            ValidationPipelineInfo, ValidationPipelineKind,
        },
        instrument::InstrumentedShader,
        pipeline::{PipelineBindPoint, PushConstantRange},
        DeviceAddress, OutOfMemory,
    },
    parking_lot::{Mutex, MutexGuard},
    rspirv::spirv::ExecutionModel,
    slab::Slab,
    std::{
        collections::BTreeMap,
        convert::TryFrom as _,
        fmt::{self, Debug},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
    },
};

/// Address of the first buffer.
const ADDRESS_BASE: u64 = 0x10_0000;

const ADDRESS_ALIGNMENT_MASK: u64 = 255;

/// Handles are slab keys shifted by one so that `0` stays null.
fn handle(key: usize) -> u64 {
    key as u64 + 1
}

fn key(handle: u64) -> usize {
    handle.wrapping_sub(1) as usize
}

pub(super) struct SoftBuffer {
    pub info: BufferInfo,
    pub address: u64,
    pub data: Vec<u8>,
}

struct SoftPool {
    max_sets: u32,
    allocated: u32,
}

pub(super) struct SoftSet {
    pool: usize,
    pub bindings: BTreeMap<u32, BufferDescriptorWrite>,
}

pub(super) enum SoftPipeline {
    Validation(ValidationPipelineKind),
    Program(ProgramPipeline),
}

/// Everything the software device owns.
pub(super) struct Memory {
    buffers: Slab<SoftBuffer>,
    next_address: u64,
    allocated: u64,
    set_layouts: Slab<Vec<DescriptorSetLayoutBinding>>,
    pipeline_layouts: Slab<Vec<RawDescriptorSetLayout>>,
    pools: Slab<SoftPool>,
    sets: Slab<SoftSet>,
    pipelines: Slab<SoftPipeline>,
}

impl Memory {
    fn new() -> Self {
        Memory {
            buffers: Slab::new(),
            next_address: ADDRESS_BASE,
            allocated: 0,
            set_layouts: Slab::new(),
            pipeline_layouts: Slab::new(),
            pools: Slab::new(),
            sets: Slab::new(),
            pipelines: Slab::new(),
        }
    }

    pub fn buffer(&self, buffer: RawBuffer) -> Option<&SoftBuffer> {
        self.buffers.get(key(buffer.0))
    }

    pub fn pipeline(&self, pipeline: RawPipeline) -> Option<&SoftPipeline> {
        self.pipelines.get(key(pipeline.0))
    }

    pub fn set(&self, set: RawDescriptorSet) -> Option<&SoftSet> {
        self.sets.get(key(set.0))
    }

    /// Reads up to `count` words starting at byte `offset`.
    /// Stops at the end of the buffer, unknown buffers read as empty.
    pub fn read_words(&self, buffer: RawBuffer, offset: u64, count: usize) -> Vec<u32> {
        let data = match self.buffer(buffer) {
            Some(buffer) => &buffer.data,
            None => return Vec::new(),
        };
        let start = (offset as usize).min(data.len());
        data[start..]
            .chunks_exact(4)
            .take(count)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect()
    }

    /// Writes words at byte `offset`. Words past the end of the buffer are
    /// dropped.
    pub fn write_words(&mut self, buffer: RawBuffer, offset: u64, words: &[u32]) {
        let data = match self.buffers.get_mut(key(buffer.0)) {
            Some(buffer) => &mut buffer.data,
            None => return,
        };
        let start = (offset as usize).min(data.len());
        for (chunk, word) in data[start..].chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
    }

    /// Buffer and offset in it an address points to.
    pub fn resolve(&self, address: u64) -> Option<(RawBuffer, u64)> {
        self.buffers.iter().find_map(|(key, buffer)| {
            let end = buffer.address + buffer.data.len() as u64;
            if address >= buffer.address && address < end {
                Some((RawBuffer(handle(key)), address - buffer.address))
            } else {
                None
            }
        })
    }

    /// Word at device address. Unmapped memory reads as zero.
    pub fn load(&self, address: u64) -> u32 {
        match self.resolve(address) {
            Some((buffer, offset)) => self
                .read_words(buffer, offset, 1)
                .first()
                .copied()
                .unwrap_or(0),
            None => 0,
        }
    }

    pub fn store(&mut self, address: u64, value: u32) {
        if let Some((buffer, offset)) = self.resolve(address) {
            self.write_words(buffer, offset, &[value]);
        }
    }

    /// Buffer range bound to `binding` of a set.
    pub fn binding(&self, set: RawDescriptorSet, binding: u32) -> Option<BufferDescriptorWrite> {
        self.set(set)?.bindings.get(&binding).copied()
    }

    /// Words of the range bound to `binding` of a set.
    pub fn binding_words(&self, set: RawDescriptorSet, binding: u32) -> Vec<u32> {
        match self.binding(set, binding) {
            Some(write) => {
                let count = if write.range == u64::MAX {
                    usize::MAX
                } else {
                    (write.range / 4) as usize
                };
                self.read_words(write.buffer, write.offset, count)
            }
            None => Vec::new(),
        }
    }

    pub fn write_binding_words(&mut self, set: RawDescriptorSet, binding: u32, words: &[u32]) {
        if let Some(write) = self.binding(set, binding) {
            self.write_words(write.buffer, write.offset, words);
        }
    }
}

/// Device that keeps all memory on the host.
///
/// It executes validation pipelines with the same functions the validator
/// describes their device half with, and runs application pipelines as
/// [`Program`]s that call into the checks instrumented shaders perform.
pub struct SoftDevice {
    limits: DeviceLimits,
    features: DeviceFeatures,
    memory_limit: Option<u64>,
    unsupported: Vec<ValidationPipelineKind>,
    next_handle: AtomicU64,
    memory: Mutex<Memory>,
}

impl Debug for SoftDevice {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            let memory = self.memory.lock();
            fmt.debug_struct("SoftDevice")
                .field("limits", &self.limits)
                .field("features", &self.features)
                .field("buffers", &memory.buffers.len())
                .field("allocated", &memory.allocated)
                .field("sets", &memory.sets.len())
                .field("pipelines", &memory.pipelines.len())
                .finish()
        } else {
            fmt.write_str("SoftDevice")
        }
    }
}

impl SoftDevice {
    pub fn new(limits: DeviceLimits, features: DeviceFeatures) -> Self {
        SoftDevice {
            limits,
            features,
            memory_limit: None,
            unsupported: Vec::new(),
            next_handle: AtomicU64::new(1),
            memory: Mutex::new(Memory::new()),
        }
    }

    /// Fails buffer creation once `bytes` are allocated.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Refuses to create validation pipelines of `kind`.
    pub fn with_unsupported_pipeline(mut self, kind: ValidationPipelineKind) -> Self {
        self.unsupported.push(kind);
        self
    }

    pub(super) fn memory(&self) -> MutexGuard<'_, Memory> {
        self.memory.lock()
    }

    /// Creates application pipeline that runs `program` on launch.
    ///
    /// `shader` is what the validator returned for the pipeline's shader
    /// module and `layout` what it returned from
    /// [`Validator::pipeline_create_layout`](crate::Validator::pipeline_create_layout).
    /// Instrumented programs find the validation set in the last slot of
    /// `layout`.
    pub fn create_program_pipeline(
        &self,
        bind_point: PipelineBindPoint,
        layout: RawPipelineLayout,
        shader: &InstrumentedShader,
        stage: ExecutionModel,
        program: Arc<dyn Program>,
    ) -> RawPipeline {
        let mut memory = self.memory.lock();
        let validation_slot = if shader.is_instrumented() {
            memory
                .pipeline_layouts
                .get(key(layout.0))
                .and_then(|sets| sets.len().checked_sub(1))
                .map(|slot| slot as u32)
        } else {
            None
        };

        let key = memory.pipelines.insert(SoftPipeline::Program(ProgramPipeline {
            program,
            bind_point,
            shader_id: shader.shader_id(),
            stage: stage as u32,
            validation_slot,
        }));
        RawPipeline(handle(key))
    }

    /// Images carry no state on this device.
    pub fn create_image(&self) -> RawImage {
        RawImage(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    /// Whole content of a buffer as words.
    pub fn buffer_words(&self, buffer: RawBuffer) -> Vec<u32> {
        self.memory.lock().read_words(buffer, 0, usize::MAX)
    }

    pub fn write_words(&self, buffer: RawBuffer, offset: u64, words: &[u32]) {
        self.memory.lock().write_words(buffer, offset, words)
    }
}

impl DeviceTrait for SoftDevice {
    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    fn features(&self) -> &DeviceFeatures {
        &self.features
    }

    fn create_buffer(&self, info: BufferInfo) -> Result<RawBuffer, OutOfMemory> {
        let mut memory = self.memory.lock();
        let allocated = memory.allocated.checked_add(info.size).ok_or(OutOfMemory)?;
        if let Some(limit) = self.memory_limit {
            if allocated > limit {
                tracing::debug!("Buffer of {} bytes exceeds memory limit of {}", info.size, limit);
                return Err(OutOfMemory);
            }
        }
        let size = usize::try_from(info.size).map_err(|_| OutOfMemory)?;

        let address = memory.next_address;
        memory.next_address = crate::align_up(ADDRESS_ALIGNMENT_MASK, address + info.size.max(1))
            .ok_or(OutOfMemory)?;
        memory.allocated = allocated;

        let key = memory.buffers.insert(SoftBuffer {
            info,
            address,
            data: vec![0; size],
        });
        Ok(RawBuffer(handle(key)))
    }

    fn destroy_buffer(&self, buffer: RawBuffer) {
        let mut memory = self.memory.lock();
        if memory.buffers.contains(key(buffer.0)) {
            let buffer = memory.buffers.remove(key(buffer.0));
            memory.allocated -= buffer.info.size;
        } else {
            tracing::warn!("Destroying unknown buffer {:?}", buffer);
        }
    }

    fn buffer_address(&self, buffer: RawBuffer) -> Option<DeviceAddress> {
        let memory = self.memory.lock();
        let buffer = memory.buffer(buffer)?;
        if buffer.info.usage.contains(BufferUsage::SHADER_DEVICE_ADDRESS) {
            DeviceAddress::new(buffer.address)
        } else {
            None
        }
    }

    fn write_buffer(&self, buffer: RawBuffer, offset: u64, data: &[u8]) -> Result<(), MapError> {
        let mut memory = self.memory.lock();
        let soft = memory
            .buffers
            .get_mut(key(buffer.0))
            .ok_or(MapError::UnknownBuffer { buffer })?;
        let end = offset.saturating_add(data.len() as u64);
        if end > soft.data.len() as u64 {
            return Err(MapError::OutOfBounds {
                buffer,
                offset,
                end,
            });
        }
        soft.data[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn read_buffer(&self, buffer: RawBuffer, offset: u64, data: &mut [u8]) -> Result<(), MapError> {
        let memory = self.memory.lock();
        let soft = memory
            .buffer(buffer)
            .ok_or(MapError::UnknownBuffer { buffer })?;
        let end = offset.saturating_add(data.len() as u64);
        if end > soft.data.len() as u64 {
            return Err(MapError::OutOfBounds {
                buffer,
                offset,
                end,
            });
        }
        data.copy_from_slice(&soft.data[offset as usize..end as usize]);
        Ok(())
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorSetLayoutBinding],
    ) -> Result<RawDescriptorSetLayout, OutOfMemory> {
        let key = self.memory.lock().set_layouts.insert(bindings.to_vec());
        Ok(RawDescriptorSetLayout(handle(key)))
    }

    fn destroy_descriptor_set_layout(&self, layout: RawDescriptorSetLayout) {
        let mut memory = self.memory.lock();
        if memory.set_layouts.contains(key(layout.0)) {
            memory.set_layouts.remove(key(layout.0));
        }
    }

    fn create_pipeline_layout(
        &self,
        sets: &[RawDescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> Result<RawPipelineLayout, OutOfMemory> {
        let push_constants_end = push_constants
            .iter()
            .map(|range| range.offset + range.size)
            .max()
            .unwrap_or(0);
        if push_constants_end > self.limits.max_push_constants_size {
            tracing::warn!(
                "Push constants end at {}, past limit of {}",
                push_constants_end,
                self.limits.max_push_constants_size
            );
        }
        let key = self.memory.lock().pipeline_layouts.insert(sets.to_vec());
        Ok(RawPipelineLayout(handle(key)))
    }

    fn destroy_pipeline_layout(&self, layout: RawPipelineLayout) {
        let mut memory = self.memory.lock();
        if memory.pipeline_layouts.contains(key(layout.0)) {
            memory.pipeline_layouts.remove(key(layout.0));
        }
    }

    fn create_descriptor_pool(
        &self,
        _sizes: &DescriptorSizes,
        max_sets: u32,
    ) -> Result<RawDescriptorPool, OutOfMemory> {
        let key = self.memory.lock().pools.insert(SoftPool {
            max_sets,
            allocated: 0,
        });
        Ok(RawDescriptorPool(handle(key)))
    }

    fn destroy_descriptor_pool(&self, pool: RawDescriptorPool) {
        let mut memory = self.memory.lock();
        let pool = key(pool.0);
        if memory.pools.contains(pool) {
            memory.pools.remove(pool);
            memory.sets.retain(|_, set| set.pool != pool);
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: RawDescriptorPool,
        layout: RawDescriptorSetLayout,
    ) -> Result<RawDescriptorSet, AllocateDescriptorSetError> {
        let mut memory = self.memory.lock();
        if !memory.set_layouts.contains(key(layout.0)) {
            tracing::error!("Allocating set with unknown layout {:?}", layout);
            return Err(AllocateDescriptorSetError::OutOfMemory {
                source: OutOfMemory,
            });
        }

        let pool = key(pool.0);
        match memory.pools.get_mut(pool) {
            Some(soft) if soft.allocated < soft.max_sets => soft.allocated += 1,
            _ => return Err(AllocateDescriptorSetError::PoolExhausted),
        }

        let key = memory.sets.insert(SoftSet {
            pool,
            bindings: BTreeMap::new(),
        });
        Ok(RawDescriptorSet(handle(key)))
    }

    fn free_descriptor_set(&self, pool: RawDescriptorPool, set: RawDescriptorSet) {
        let mut memory = self.memory.lock();
        if memory.sets.contains(key(set.0)) {
            memory.sets.remove(key(set.0));
            if let Some(pool) = memory.pools.get_mut(key(pool.0)) {
                pool.allocated = pool.allocated.saturating_sub(1);
            }
        }
    }

    fn update_descriptor_set(&self, set: RawDescriptorSet, writes: &[BufferDescriptorWrite]) {
        let mut memory = self.memory.lock();
        match memory.sets.get_mut(key(set.0)) {
            Some(soft) => {
                for write in writes {
                    soft.bindings.insert(write.binding, *write);
                }
            }
            None => tracing::warn!("Updating unknown descriptor set {:?}", set),
        }
    }

    fn create_validation_pipeline(
        &self,
        info: ValidationPipelineInfo,
    ) -> Result<RawPipeline, CreatePipelineError> {
        if self.unsupported.contains(&info.kind) {
            return Err(CreatePipelineError::Unsupported { kind: info.kind });
        }
        let key = self
            .memory
            .lock()
            .pipelines
            .insert(SoftPipeline::Validation(info.kind));
        Ok(RawPipeline(handle(key)))
    }

    fn destroy_pipeline(&self, pipeline: RawPipeline) {
        let mut memory = self.memory.lock();
        if memory.pipelines.contains(key(pipeline.0)) {
            memory.pipelines.remove(key(pipeline.0));
        }
    }
}

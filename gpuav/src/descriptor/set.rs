use {
    super::{
        Descriptor, DescriptorBindingFlags, DescriptorSetLayoutState,
        CopyDescriptorSet, DescriptorType, Descriptors, PushDescriptorWrite,
        WriteDescriptorSet,
    },
    crate::{
        buffer::{Buffer, BufferInfo},
        device::{Device, RawDescriptorSet},
        wire::{self, class, layout_state},
        OutOfMemory,
    },
    fastbitset::BitSet,
    once_cell::sync::OnceCell,
    parking_lot::Mutex,
    std::{
        convert::TryFrom as _,
        fmt::{self, Debug},
        sync::{
            atomic::{AtomicU32, AtomicU64, Ordering},
            Arc,
        },
    },
};

/// Elements of one binding within the set's flat element array.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BindingRange {
    pub binding: u32,
    pub ty: DescriptorType,
    pub flags: DescriptorBindingFlags,
    pub start: u32,
    pub count: u32,
}

/// Immutable GPU copy of a set's descriptors at one version.
pub struct DescriptorSnapshot {
    version: u64,
    buffer: Buffer,
    words: Vec<u32>,
}

impl Debug for DescriptorSnapshot {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("DescriptorSnapshot")
            .field("version", &self.version)
            .field("buffer", &self.buffer)
            .field("elements", &(self.words.len() / 2))
            .finish()
    }
}

impl DescriptorSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// `{idWord, extraWord}` pairs.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn element(&self, index: u32) -> Option<[u32; 2]> {
        let index = 2 * index as usize;
        self.words.get(index..index + 2).map(|w| [w[0], w[1]])
    }
}

struct Elements {
    descriptors: Vec<Descriptor>,
    version: u64,
}

/// Application descriptor set as seen by the validator.
pub struct DescriptorSetState {
    raw: RawDescriptorSet,
    layout: Arc<DescriptorSetLayoutState>,
    device: Device,
    ranges: Vec<BindingRange>,
    total: u32,
    elements: Mutex<Elements>,
    current: Mutex<Option<Arc<DescriptorSnapshot>>>,
    output: OnceCell<Arc<Buffer>>,
    layout_state: OnceCell<Arc<Buffer>>,

    /// Output markers already handled by post-processing.
    processed: Mutex<BitSet>,
    builds: AtomicU32,
    reads: AtomicU64,
}

impl Debug for DescriptorSetState {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("DescriptorSetState")
                .field("raw", &self.raw)
                .field("layout", &self.layout)
                .field("ranges", &self.ranges)
                .field("version", &self.version())
                .finish()
        } else {
            Debug::fmt(&self.raw, fmt)
        }
    }
}

impl DescriptorSetState {
    pub fn new(
        device: Device,
        raw: RawDescriptorSet,
        layout: Arc<DescriptorSetLayoutState>,
        variable_count: Option<u32>,
    ) -> Self {
        let mut start = 0;
        let ranges: Vec<_> = layout
            .bindings()
            .iter()
            .map(|binding| {
                let count = binding.element_count(variable_count);
                let range = BindingRange {
                    binding: binding.binding,
                    ty: binding.ty,
                    flags: binding.flags,
                    start,
                    count,
                };
                start += count;
                range
            })
            .collect();

        DescriptorSetState {
            raw,
            layout,
            device,
            ranges,
            total: start,
            elements: Mutex::new(Elements {
                descriptors: vec![Descriptor::Empty; start as usize],
                version: 1,
            }),
            current: Mutex::new(None),
            output: OnceCell::new(),
            layout_state: OnceCell::new(),
            processed: Mutex::new(BitSet::new(start as usize)),
            builds: AtomicU32::new(0),
            reads: AtomicU64::new(0),
        }
    }

    pub fn raw(&self) -> RawDescriptorSet {
        self.raw
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayoutState> {
        &self.layout
    }

    pub fn ranges(&self) -> &[BindingRange] {
        &self.ranges
    }

    pub fn binding_range(&self, binding: u32) -> Option<&BindingRange> {
        self.ranges
            .binary_search_by_key(&binding, |r| r.binding)
            .ok()
            .map(|index| &self.ranges[index])
    }

    /// Total number of descriptor elements.
    pub fn element_count(&self) -> u32 {
        self.total
    }

    pub fn version(&self) -> u64 {
        self.elements.lock().version
    }

    /// Number of times current state was serialized.
    pub fn snapshot_builds(&self) -> u32 {
        self.builds.load(Ordering::Relaxed)
    }

    /// Number of times current state was requested.
    pub fn snapshot_reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn is_update_after_bind(&self) -> bool {
        self.layout.is_update_after_bind()
    }

    pub fn element(&self, binding: u32, index: u32) -> Option<Descriptor> {
        let range = self.binding_range(binding)?;
        if index >= range.count {
            return None;
        }
        let elements = self.elements.lock();
        Some(elements.descriptors[(range.start + index) as usize].clone())
    }

    /// Finds binding and array index of a flat element index.
    pub fn locate(&self, element: u32) -> Option<(u32, u32)> {
        self.ranges
            .iter()
            .find(|r| element >= r.start && element < r.start + r.count)
            .map(|r| (r.binding, element - r.start))
    }

    /// Returns snapshot of current descriptors, serializing them into a new
    /// GPU buffer only when the set changed since the cached one was built.
    #[tracing::instrument(skip(self), fields(set = ?self.raw))]
    pub fn current_state(&self) -> Result<Arc<DescriptorSnapshot>, OutOfMemory> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut current = self.current.lock();

        let (version, words) = {
            let elements = self.elements.lock();
            if let Some(snapshot) = &*current {
                if snapshot.version == elements.version {
                    return Ok(snapshot.clone());
                }
            }
            let mut words = Vec::with_capacity(2 * elements.descriptors.len());
            for descriptor in &elements.descriptors {
                words.extend_from_slice(&encode_descriptor(descriptor));
            }
            (elements.version, words)
        };

        let buffer = self.device.create_buffer_with_words(
            BufferInfo::storage(4 * words.len().max(2) as u64),
            &words,
        )?;

        self.builds.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Built descriptor snapshot version {} with {} elements",
            version,
            words.len() / 2
        );

        let snapshot = Arc::new(DescriptorSnapshot {
            version,
            buffer,
            words,
        });
        *current = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Marker buffer written by shaders, one word per element.
    /// Allocated once and reused for the set's lifetime.
    pub fn output_state(&self) -> Result<Arc<Buffer>, OutOfMemory> {
        self.output
            .get_or_try_init(|| {
                self.device
                    .create_buffer(BufferInfo::storage(4 * self.total.max(1) as u64))
                    .map(Arc::new)
            })
            .map(Arc::clone)
    }

    /// Output state if it was ever allocated.
    pub fn existing_output_state(&self) -> Option<&Arc<Buffer>> {
        self.output.get()
    }

    /// Elements marked in `markers` that were not marked at the previous call.
    pub fn take_new_markers(&self, markers: &[u32]) -> Vec<u32> {
        let mut processed = self.processed.lock();
        let len = processed.len();
        markers
            .iter()
            .take(len)
            .enumerate()
            .filter(|&(element, &marker)| marker != 0 && processed.set(element))
            .map(|(element, _)| element as u32)
            .collect()
    }

    /// Per-binding element counts and output offsets.
    pub fn layout_state(&self) -> Result<Arc<Buffer>, OutOfMemory> {
        self.layout_state
            .get_or_try_init(|| {
                let words = self.layout_words();
                self.device
                    .create_buffer_with_words(
                        BufferInfo::storage(4 * words.len() as u64),
                        &words,
                    )
                    .map(Arc::new)
            })
            .map(Arc::clone)
    }

    /// `{bindingSlots, 0}` then `{count, start}` per binding number.
    pub fn layout_words(&self) -> Vec<u32> {
        let slots = self.layout.binding_slots() as usize;
        let mut words = vec![0; layout_state::BINDINGS + layout_state::BINDING_WORDS * slots];
        words[layout_state::BINDING_COUNT] = slots as u32;
        for range in &self.ranges {
            let at = layout_state::BINDINGS
                + layout_state::BINDING_WORDS * range.binding as usize;
            words[at] = range.count;
            words[at + 1] = range.start;
        }
        words
    }

    pub fn perform_write_update(&self, write: &WriteDescriptorSet<'_>) {
        let mut elements = self.elements.lock();
        self.apply(
            &mut elements.descriptors,
            write.binding,
            write.element,
            &write.descriptors,
        );
        elements.version += 1;
    }

    pub fn perform_push_descriptors_update(
        &self,
        writes: &[PushDescriptorWrite<'_>],
    ) {
        let mut elements = self.elements.lock();
        for write in writes {
            self.apply(
                &mut elements.descriptors,
                write.binding,
                write.element,
                &write.descriptors,
            );
        }
        elements.version += 1;
    }

    /// Copies descriptors from `copy.src` into this set.
    pub fn perform_copy_update(&self, copy: &CopyDescriptorSet<'_>) {
        debug_assert!(std::ptr::eq(&**copy.dst, self));

        // Inline uniform copies count bytes within one binding.
        let inline = copy
            .src
            .binding_range(copy.src_binding)
            .map_or(false, |range| range.ty == DescriptorType::InlineUniformBlock);
        if inline {
            if let Some(range) = self.binding_range(copy.dst_binding) {
                let mut elements = self.elements.lock();
                elements.descriptors[range.start as usize] = Descriptor::InlineUniform;
                elements.version += 1;
            }
            return;
        }

        let source: Vec<Descriptor> = {
            let src = copy.src.elements.lock();
            copy.src
                .walk(copy.src_binding, copy.src_element, copy.count as usize)
                .map(|index| src.descriptors[index].clone())
                .collect()
        };

        let mut elements = self.elements.lock();
        for (index, descriptor) in self
            .walk(copy.dst_binding, copy.dst_element, source.len())
            .zip(source)
        {
            elements.descriptors[index] = descriptor;
        }
        elements.version += 1;
    }

    fn apply(
        &self,
        descriptors: &mut [Descriptor],
        binding: u32,
        element: u32,
        update: &Descriptors<'_>,
    ) {
        if let Descriptors::InlineUniformBlock(_) = update {
            if let Some(range) = self.binding_range(binding) {
                descriptors[range.start as usize] = Descriptor::InlineUniform;
            }
            return;
        }

        for (i, index) in self.walk(binding, element, update.len()).enumerate() {
            descriptors[index] = update.get(i);
        }
    }

    /// Flat indices of `count` consecutive elements starting at `element` of
    /// `binding`, rolling over into following bindings.
    fn walk(
        &self,
        binding: u32,
        element: u32,
        count: usize,
    ) -> impl Iterator<Item = usize> + '_ {
        let first = self.ranges.iter().position(|r| r.binding == binding);
        let mut range_index = first.unwrap_or(self.ranges.len());
        let mut element = element;
        let mut left = if first.is_some() { count } else { 0 };

        std::iter::from_fn(move || {
            while left > 0 {
                let range = self.ranges.get(range_index)?;
                if element < range.count {
                    let index = (range.start + element) as usize;
                    element += 1;
                    left -= 1;
                    return Some(index);
                }
                element -= range.count;
                range_index += 1;
            }
            None
        })
    }
}

/// Encodes one element into `{idWord, extraWord}`.
pub fn encode_descriptor(descriptor: &Descriptor) -> [u32; 2] {
    fn clamp(value: u64) -> u32 {
        u32::try_from(value).unwrap_or(u32::MAX)
    }

    match descriptor {
        Descriptor::Empty => [0, 0],
        Descriptor::Buffer(range) => match &range.buffer {
            None => [wire::id_word(class::BUFFER, 0), 0],
            Some(buffer) => [
                wire::id_word(class::BUFFER, buffer.id().0),
                clamp(range.size()),
            ],
        },
        Descriptor::TexelBuffer(view) => match view {
            None => [wire::id_word(class::TEXEL_BUFFER, 0), 0],
            Some(view) => [
                wire::id_word(class::TEXEL_BUFFER, view.id().0),
                view.texel_count(),
            ],
        },
        Descriptor::Image(view) => [
            wire::id_word(class::IMAGE, view.as_ref().map_or(0, |v| v.id().0)),
            0,
        ],
        Descriptor::Sampler(sampler) => [
            wire::id_word(
                class::SAMPLER,
                sampler.as_ref().map_or(0, |s| s.id().0),
            ),
            0,
        ],
        Descriptor::ImageSampler { view, sampler } => [
            wire::id_word(
                class::IMAGE_SAMPLER,
                view.as_ref().map_or(0, |v| v.id().0),
            ),
            sampler.as_ref().map_or(0, |s| s.id().0),
        ],
        Descriptor::AccelerationStructure(accel) => [
            wire::id_word(
                class::ACCELERATION_STRUCTURE,
                accel.as_ref().map_or(0, |a| a.id().0),
            ),
            0,
        ],
        Descriptor::InlineUniform => [wire::id_word(class::INLINE_UNIFORM, 0), 0],
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            backend::software::SoftDevice,
            descriptor::{BufferRange, DescriptorSetLayoutBinding, DescriptorSetLayoutInfo},
            device::{DeviceFeatures, DeviceLimits, RawBuffer, RawDescriptorSetLayout},
            heap::{DescriptorHeap, ResourceTag},
            pipeline::ShaderStageFlags,
            resource::BufferState,
        },
    };

    fn binding(binding: u32, count: u32) -> DescriptorSetLayoutBinding {
        DescriptorSetLayoutBinding {
            binding,
            ty: DescriptorType::StorageBuffer,
            count,
            stages: ShaderStageFlags::COMPUTE,
            flags: DescriptorBindingFlags::empty(),
        }
    }

    /// Bindings 0 and 2 with two and three elements.
    fn set() -> Arc<DescriptorSetState> {
        let device = Device::new(Arc::new(SoftDevice::new(
            DeviceLimits::default(),
            DeviceFeatures::default(),
        )));
        let layout = Arc::new(DescriptorSetLayoutState::new(
            RawDescriptorSetLayout(1),
            DescriptorSetLayoutInfo {
                bindings: vec![binding(2, 3), binding(0, 2)],
                ..DescriptorSetLayoutInfo::default()
            },
        ));
        Arc::new(DescriptorSetState::new(
            device,
            RawDescriptorSet(1),
            layout,
            None,
        ))
    }

    fn buffer(heap: &Arc<DescriptorHeap>, raw: u64, size: u64) -> Arc<BufferState> {
        let raw = RawBuffer(raw);
        Arc::new(BufferState::new(
            raw,
            BufferInfo::storage(size),
            None,
            heap.allocate(ResourceTag::Buffer(raw)),
        ))
    }

    fn write(set: &Arc<DescriptorSetState>, binding: u32, element: u32, ranges: &[BufferRange]) {
        set.perform_write_update(&WriteDescriptorSet {
            set,
            binding,
            element,
            descriptors: Descriptors::StorageBuffer(ranges),
        });
    }

    #[test]
    fn elements_are_laid_out_by_binding() {
        let set = set();
        assert_eq!(set.element_count(), 5);
        assert_eq!(set.binding_range(2).map(|r| r.start), Some(2));
        assert!(set.binding_range(1).is_none());
        assert_eq!(set.locate(1), Some((0, 1)));
        assert_eq!(set.locate(3), Some((2, 1)));
        assert_eq!(set.locate(5), None);

        // Binding 1 is a hole.
        assert_eq!(set.layout_words(), vec![3, 0, 2, 0, 0, 0, 3, 2]);
    }

    #[test]
    fn writes_roll_over_into_next_binding() {
        let heap = Arc::new(DescriptorHeap::new(16));
        let a = buffer(&heap, 10, 64);
        let b = buffer(&heap, 11, 32);
        let set = set();

        write(&set, 0, 1, &[BufferRange::whole(&a), BufferRange::new(&b, 16, 8)]);
        assert!(set.element(0, 0).map_or(false, |d| d.is_empty()));
        assert!(!set.element(0, 1).map_or(true, |d| d.is_empty()));
        assert!(!set.element(2, 0).map_or(true, |d| d.is_empty()));
        assert!(set.element(2, 3).is_none());

        let snapshot = set.current_state().unwrap();
        assert_eq!(snapshot.element(0), Some([0, 0]));
        assert_eq!(
            snapshot.element(1),
            Some([wire::id_word(class::BUFFER, a.id().0), 64])
        );
        assert_eq!(
            snapshot.element(2),
            Some([wire::id_word(class::BUFFER, b.id().0), 8])
        );
    }

    #[test]
    fn snapshot_is_rebuilt_only_after_update() {
        let heap = Arc::new(DescriptorHeap::new(16));
        let a = buffer(&heap, 10, 64);
        let set = set();

        let first = set.current_state().unwrap();
        let again = set.current_state().unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(set.snapshot_builds(), 1);
        assert_eq!(set.snapshot_reads(), 2);

        write(&set, 2, 0, &[BufferRange::whole(&a)]);
        let updated = set.current_state().unwrap();
        assert!(updated.version() > first.version());
        assert_eq!(set.snapshot_builds(), 2);

        // Old snapshot stays intact for work that still references it.
        assert_eq!(first.element(2), Some([0, 0]));
        assert_ne!(updated.element(2), Some([0, 0]));
    }

    #[test]
    fn copies_take_source_elements() {
        let heap = Arc::new(DescriptorHeap::new(16));
        let a = buffer(&heap, 10, 64);
        let src = set();
        let dst = set();
        write(&src, 2, 1, &[BufferRange::whole(&a), BufferRange::whole(&a)]);

        dst.perform_copy_update(&CopyDescriptorSet {
            src: &src,
            src_binding: 2,
            src_element: 1,
            dst: &dst,
            dst_binding: 0,
            dst_element: 0,
            count: 2,
        });
        assert!(!dst.element(0, 0).map_or(true, |d| d.is_empty()));
        assert!(!dst.element(0, 1).map_or(true, |d| d.is_empty()));
        assert!(dst.element(2, 0).map_or(false, |d| d.is_empty()));
    }

    #[test]
    fn destroyed_buffer_keeps_its_id() {
        let heap = Arc::new(DescriptorHeap::new(16));
        let a = buffer(&heap, 10, 64);
        let id = a.id();
        a.destroy();
        assert!(!heap.is_live(id));

        let encoded = encode_descriptor(&Descriptor::Buffer(BufferRange::whole(&a)));
        assert_eq!(encoded, [wire::id_word(class::BUFFER, id.0), 64]);
        assert_eq!(encode_descriptor(&Descriptor::Empty), [0, 0]);
    }

    #[test]
    fn inline_uniform_copy_stays_in_its_binding() {
        let heap = Arc::new(DescriptorHeap::new(16));
        let a = buffer(&heap, 10, 64);
        let device = Device::new(Arc::new(SoftDevice::new(
            DeviceLimits::default(),
            DeviceFeatures::default(),
        )));
        let layout = Arc::new(DescriptorSetLayoutState::new(
            RawDescriptorSetLayout(2),
            DescriptorSetLayoutInfo {
                bindings: vec![
                    DescriptorSetLayoutBinding {
                        ty: DescriptorType::InlineUniformBlock,
                        ..binding(0, 16)
                    },
                    binding(1, 2),
                ],
                ..DescriptorSetLayoutInfo::default()
            },
        ));
        let src = Arc::new(DescriptorSetState::new(
            device.clone(),
            RawDescriptorSet(2),
            layout.clone(),
            None,
        ));
        let dst = Arc::new(DescriptorSetState::new(
            device,
            RawDescriptorSet(3),
            layout,
            None,
        ));
        write(&dst, 1, 0, &[BufferRange::whole(&a), BufferRange::whole(&a)]);

        dst.perform_copy_update(&CopyDescriptorSet {
            src: &src,
            src_binding: 0,
            src_element: 0,
            dst: &dst,
            dst_binding: 0,
            dst_element: 0,
            count: 16,
        });
        assert!(matches!(dst.element(0, 0), Some(Descriptor::InlineUniform)));
        assert!(!dst.element(1, 0).map_or(true, |d| d.is_empty()));
        assert!(!dst.element(1, 1).map_or(true, |d| d.is_empty()));
    }

    #[test]
    fn markers_are_taken_once() {
        let set = set();
        assert_eq!(set.take_new_markers(&[0, 1, 0, 0, 0]), vec![1]);
        assert_eq!(set.take_new_markers(&[0, 1, 0, 1, 1]), vec![3, 4]);
        assert!(set.take_new_markers(&[0, 1, 0, 1, 1]).is_empty());
    }
}

use {
    crate::{
        buffer::{Buffer, BufferInfo},
        device::{
            Device, MapError, RawAccelerationStructure, RawBuffer,
            RawBufferView, RawImageView, RawSampler,
        },
        OutOfMemory,
    },
    fastbitset::BitSet,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        fmt::{self, Debug},
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Weak,
        },
    },
};

/// Identifier of a live bindable resource.
/// `0` is never allocated and means "no resource".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct DescriptorId(pub u32);

impl DescriptorId {
    pub const INVALID: Self = DescriptorId(0);

    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl Debug for DescriptorId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "DescriptorId({})", self.0)
    }
}

/// Resource an id was allocated for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceTag {
    Buffer(RawBuffer),
    BufferView(RawBufferView),
    ImageView(RawImageView),
    Sampler(RawSampler),
    AccelerationStructure(RawAccelerationStructure),
}

struct HeapState {
    /// Bit 0 is always set. Shaders test id `0` before the bitmap.
    live: BitSet,
    cursor: usize,
    tags: HashMap<u32, ResourceTag>,
    version: u64,
}

/// Allocator of descriptor ids with a GPU visible liveness bitmap.
pub struct DescriptorHeap {
    state: Mutex<HeapState>,
    capacity: u32,
    bitmap: Option<Buffer>,
    uploaded: AtomicU64,
}

impl Debug for DescriptorHeap {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            let state = self.state.lock();
            fmt.debug_struct("DescriptorHeap")
                .field("capacity", &self.capacity)
                .field("live", &(state.live.count_ones() - 1))
                .field("cursor", &state.cursor)
                .field("version", &state.version)
                .field("bitmap", &self.bitmap)
                .finish()
        } else {
            write!(fmt, "DescriptorHeap({})", self.capacity)
        }
    }
}

impl DescriptorHeap {
    /// Creates host-only heap without bitmap buffer.
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(2);
        let mut live = BitSet::new(capacity as usize);
        live.set(0);

        DescriptorHeap {
            state: Mutex::new(HeapState {
                live,
                cursor: 1,
                tags: HashMap::new(),
                version: 0,
            }),
            capacity,
            bitmap: None,
            uploaded: AtomicU64::new(0),
        }
    }

    /// Creates heap with bitmap buffer on the device.
    #[tracing::instrument]
    pub fn with_device(device: &Device, capacity: u32) -> Result<Self, OutOfMemory> {
        let mut heap = Self::new(capacity);
        let words = fastbitset::words_for(heap.capacity as usize);
        let bitmap = device.create_buffer(BufferInfo::storage(4 * words as u64))?;
        heap.bitmap = Some(bitmap);

        // Force first upload to publish bit 0.
        heap.state.get_mut().version = 1;
        Ok(heap)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Allocates next free id for the resource.
    /// Returns `DescriptorId::INVALID` when heap is exhausted.
    pub fn next_id(&self, tag: ResourceTag) -> DescriptorId {
        let mut state = self.state.lock();
        let cursor = state.cursor;
        match state.live.find_unset_from(cursor) {
            Some(bit) => {
                debug_assert_ne!(bit, 0);
                state.live.set(bit);
                state.cursor = bit + 1;
                state.tags.insert(bit as u32, tag);
                state.version += 1;
                tracing::trace!("Allocated descriptor id {} for {:?}", bit, tag);
                DescriptorId(bit as u32)
            }
            None => {
                tracing::warn!(
                    "Descriptor heap of {} ids is exhausted, {:?} is not tracked",
                    self.capacity,
                    tag
                );
                DescriptorId::INVALID
            }
        }
    }

    /// Allocates id and wraps it into guard that frees it on drop.
    pub fn allocate(self: &Arc<Self>, tag: ResourceTag) -> DescriptorIdGuard {
        DescriptorIdGuard {
            heap: Arc::downgrade(self),
            id: self.next_id(tag),
        }
    }

    /// Frees the id. Freeing `INVALID` is a no-op.
    pub fn delete_id(&self, id: DescriptorId) {
        if !id.is_valid() || id.0 >= self.capacity {
            return;
        }

        let mut state = self.state.lock();
        if state.live.unset(id.0 as usize) {
            state.tags.remove(&id.0);
            state.version += 1;
            tracing::trace!("Freed descriptor id {}", id.0);
        }
    }

    pub fn is_live(&self, id: DescriptorId) -> bool {
        id.is_valid()
            && id.0 < self.capacity
            && self.state.lock().live.get(id.0 as usize)
    }

    pub fn tag(&self, id: DescriptorId) -> Option<ResourceTag> {
        self.state.lock().tags.get(&id.0).copied()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.count_ones() - 1
    }

    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    pub fn bitmap(&self) -> Option<&Buffer> {
        self.bitmap.as_ref()
    }

    /// Uploads bitmap if it changed since last upload.
    /// Returns whether upload happened.
    pub(crate) fn sync(&self) -> Result<bool, MapError> {
        let bitmap = match &self.bitmap {
            Some(bitmap) => bitmap,
            None => return Ok(false),
        };

        let (version, words) = {
            let state = self.state.lock();
            if state.version == self.uploaded.load(Ordering::Acquire) {
                return Ok(false);
            }
            (state.version, state.live.as_words().to_vec())
        };

        bitmap.write(0, &words)?;
        self.uploaded.fetch_max(version, Ordering::AcqRel);
        tracing::debug!("Uploaded descriptor heap bitmap version {}", version);
        Ok(true)
    }
}

/// Descriptor id owned by a resource.
pub struct DescriptorIdGuard {
    heap: Weak<DescriptorHeap>,
    id: DescriptorId,
}

impl Debug for DescriptorIdGuard {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.id, fmt)
    }
}

impl DescriptorIdGuard {
    /// Guard for resources the validator does not track.
    pub fn untracked() -> Self {
        DescriptorIdGuard {
            heap: Weak::new(),
            id: DescriptorId::INVALID,
        }
    }

    pub fn id(&self) -> DescriptorId {
        self.id
    }

    /// Frees the id early. Later calls and drop do nothing.
    pub fn release(&mut self) {
        let id = std::mem::replace(&mut self.id, DescriptorId::INVALID);
        if let Some(heap) = self.heap.upgrade() {
            heap.delete_id(id);
        }
    }
}

impl Drop for DescriptorIdGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use {super::*, proptest::prelude::*, std::collections::HashSet};

    fn tag(n: u64) -> ResourceTag {
        ResourceTag::Buffer(RawBuffer(n))
    }

    #[test]
    fn zero_is_never_allocated() {
        let heap = DescriptorHeap::new(4);
        let ids: Vec<_> = (0..3).map(|n| heap.next_id(tag(n))).collect();
        assert_eq!(ids, [DescriptorId(1), DescriptorId(2), DescriptorId(3)]);
        assert_eq!(heap.next_id(tag(9)), DescriptorId::INVALID);
    }

    #[test]
    fn allocation_is_round_robin() {
        let heap = DescriptorHeap::new(8);
        let a = heap.next_id(tag(1));
        let b = heap.next_id(tag(2));
        heap.delete_id(a);
        // Freed id is not handed out again until the cursor wraps.
        assert_eq!(heap.next_id(tag(3)), DescriptorId(b.0 + 1));
        for n in 0..4 {
            heap.next_id(tag(10 + n));
        }
        assert_eq!(heap.next_id(tag(4)), a);
    }

    #[test]
    fn tags_follow_ids() {
        let heap = DescriptorHeap::new(8);
        let id = heap.next_id(tag(42));
        assert_eq!(heap.tag(id), Some(tag(42)));
        heap.delete_id(id);
        assert_eq!(heap.tag(id), None);
        assert!(!heap.is_live(id));
        heap.delete_id(DescriptorId::INVALID);
    }

    #[test]
    fn guard_frees_on_drop() {
        let heap = Arc::new(DescriptorHeap::new(8));
        let guard = heap.allocate(tag(1));
        let id = guard.id();
        assert!(heap.is_live(id));
        drop(guard);
        assert!(!heap.is_live(id));
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn guard_outliving_heap() {
        let heap = Arc::new(DescriptorHeap::new(8));
        let guard = heap.allocate(tag(1));
        drop(heap);
        drop(guard);
    }

    #[derive(Clone, Debug)]
    enum Op {
        Alloc,
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Alloc), (0usize..64).prop_map(Op::Free)]
    }

    proptest! {
        #[test]
        fn live_ids_are_unique(ops in proptest::collection::vec(op(), 1..300)) {
            let heap = DescriptorHeap::new(32);
            let mut live: Vec<DescriptorId> = Vec::new();

            for (n, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Alloc => {
                        let id = heap.next_id(tag(n as u64));
                        if id.is_valid() {
                            prop_assert!(!live.contains(&id));
                            live.push(id);
                        } else {
                            prop_assert_eq!(live.len(), 31);
                        }
                    }
                    Op::Free(index) => {
                        if !live.is_empty() {
                            let id = live.swap_remove(index % live.len());
                            heap.delete_id(id);
                        }
                    }
                }

                let unique: HashSet<_> = live.iter().copied().collect();
                prop_assert_eq!(unique.len(), live.len());
                prop_assert_eq!(heap.live_count(), live.len());
                for &id in &live {
                    prop_assert!(heap.is_live(id));
                }
            }
        }
    }
}

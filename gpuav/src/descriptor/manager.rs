use {
    super::{DescriptorSetLayoutBinding, DescriptorSizes},
    crate::{
        device::{
            AllocateDescriptorSetError, Device, RawDescriptorPool,
            RawDescriptorSet, RawDescriptorSetLayout,
        },
        OutOfMemory,
    },
    parking_lot::Mutex,
    slab::Slab,
    std::{
        fmt::{self, Debug},
        sync::Arc,
    },
};

struct Pool {
    raw: RawDescriptorPool,
    used: u32,
}

/// Pools of validator-owned descriptor sets sharing one layout.
pub(crate) struct DescriptorSetManager {
    device: Device,
    layout: RawDescriptorSetLayout,
    sizes: DescriptorSizes,
    sets_per_pool: u32,
    pools: Mutex<Slab<Pool>>,
}

impl Debug for DescriptorSetManager {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("DescriptorSetManager")
            .field("layout", &self.layout)
            .field("sets_per_pool", &self.sets_per_pool)
            .field("pools", &self.pools.lock().len())
            .finish()
    }
}

impl Drop for DescriptorSetManager {
    fn drop(&mut self) {
        for pool in self.pools.get_mut().drain() {
            self.device.destroy_descriptor_pool(pool.raw);
        }
    }
}

impl DescriptorSetManager {
    pub fn new(
        device: Device,
        layout: RawDescriptorSetLayout,
        bindings: &[DescriptorSetLayoutBinding],
        sets_per_pool: u32,
    ) -> Self {
        DescriptorSetManager {
            device,
            layout,
            sizes: DescriptorSizes::from_bindings(bindings),
            sets_per_pool,
            pools: Mutex::new(Slab::new()),
        }
    }

    /// Allocates set from first pool with room, creating pools on demand.
    pub fn allocate(self: &Arc<Self>) -> Result<ManagedDescriptorSet, OutOfMemory> {
        let mut pools = self.pools.lock();

        for (key, pool) in pools.iter_mut() {
            if pool.used >= self.sets_per_pool {
                continue;
            }
            match self.device.allocate_descriptor_set(pool.raw, self.layout) {
                Ok(raw) => {
                    pool.used += 1;
                    return Ok(self.managed(key, raw));
                }
                Err(AllocateDescriptorSetError::PoolExhausted) => {
                    pool.used = self.sets_per_pool;
                }
                Err(AllocateDescriptorSetError::OutOfMemory { source }) => {
                    return Err(source)
                }
            }
        }

        let raw_pool = self.device.create_descriptor_pool(
            &self.sizes.scaled(self.sets_per_pool),
            self.sets_per_pool,
        )?;
        tracing::debug!("Created validation descriptor pool {:?}", raw_pool);

        let key = pools.insert(Pool {
            raw: raw_pool,
            used: 0,
        });

        match self.device.allocate_descriptor_set(raw_pool, self.layout) {
            Ok(raw) => {
                pools[key].used += 1;
                Ok(self.managed(key, raw))
            }
            Err(err) => {
                tracing::error!("Fresh descriptor pool failed allocation: {:#}", err);
                Err(OutOfMemory)
            }
        }
    }

    fn managed(self: &Arc<Self>, pool: usize, raw: RawDescriptorSet) -> ManagedDescriptorSet {
        ManagedDescriptorSet {
            manager: self.clone(),
            pool,
            raw,
        }
    }

    fn free(&self, pool: usize, raw: RawDescriptorSet) {
        let mut pools = self.pools.lock();
        if let Some(entry) = pools.get_mut(pool) {
            self.device.free_descriptor_set(entry.raw, raw);
            entry.used = entry.used.saturating_sub(1);
        }
    }
}

/// Descriptor set returned to its pool on drop.
pub(crate) struct ManagedDescriptorSet {
    manager: Arc<DescriptorSetManager>,
    pool: usize,
    raw: RawDescriptorSet,
}

impl Debug for ManagedDescriptorSet {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&self.raw, fmt)
    }
}

impl ManagedDescriptorSet {
    pub fn raw(&self) -> RawDescriptorSet {
        self.raw
    }
}

impl Drop for ManagedDescriptorSet {
    fn drop(&mut self) {
        self.manager.free(self.pool, self.raw);
    }
}

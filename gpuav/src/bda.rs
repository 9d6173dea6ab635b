use {
    crate::{
        buffer::{Buffer, BufferInfo},
        device::{Device, MapError, RawBuffer},
        DeviceAddress, OutOfMemory,
    },
    parking_lot::Mutex,
    std::{
        collections::BTreeMap,
        fmt::{self, Debug},
        sync::atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

struct Ranges {
    /// Start address to size and owner.
    map: BTreeMap<u64, (u64, RawBuffer)>,
    version: u64,
}

/// Table of live buffer device address ranges.
///
/// GPU layout in `u64` words: `[count, starts[count + 2], sizes[count + 2]]`
/// where starts are `0, a1..aN, u64::MAX` sorted ascending and sizes are
/// `0, s1..sN, 0`. Sentinels let shaders binary search without bounds checks.
pub struct BdaTable {
    ranges: Mutex<Ranges>,
    capacity: u32,
    buffer: Option<Buffer>,
    uploaded: AtomicU64,
    truncated_warned: AtomicBool,
}

impl Debug for BdaTable {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges = self.ranges.lock();
        fmt.debug_struct("BdaTable")
            .field("len", &ranges.map.len())
            .field("capacity", &self.capacity)
            .field("version", &ranges.version)
            .finish()
    }
}

impl BdaTable {
    pub fn new(capacity: u32) -> Self {
        BdaTable {
            ranges: Mutex::new(Ranges {
                map: BTreeMap::new(),
                version: 0,
            }),
            capacity,
            buffer: None,
            uploaded: AtomicU64::new(0),
            truncated_warned: AtomicBool::new(false),
        }
    }

    #[tracing::instrument]
    pub fn with_device(device: &Device, capacity: u32) -> Result<Self, OutOfMemory> {
        let mut table = Self::new(capacity);
        let words = Self::table_len(capacity);
        table.buffer =
            Some(device.create_buffer(BufferInfo::storage(8 * words as u64))?);
        table.ranges.get_mut().version = 1;
        Ok(table)
    }

    fn table_len(capacity: u32) -> usize {
        1 + 2 * (capacity as usize + 2)
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.as_ref()
    }

    pub fn insert(&self, address: DeviceAddress, size: u64, buffer: RawBuffer) {
        let mut ranges = self.ranges.lock();
        ranges.map.insert(address.get(), (size, buffer));
        ranges.version += 1;
    }

    pub fn remove(&self, address: DeviceAddress) {
        let mut ranges = self.ranges.lock();
        if ranges.map.remove(&address.get()).is_some() {
            ranges.version += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.ranges.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.ranges.lock().version
    }

    /// Checks that `size` bytes at `address` lie within one live buffer.
    pub fn contains(&self, address: u64, size: u64) -> bool {
        let ranges = self.ranges.lock();
        match ranges.map.range(..=address).next_back() {
            Some((&start, &(len, _))) => {
                address.checked_add(size).map_or(false, |end| end <= start + len)
            }
            None => false,
        }
    }

    /// Builds table words.
    /// Ranges above capacity are dropped, lowest addresses are kept.
    pub fn table_words(&self) -> Vec<u64> {
        let ranges = self.ranges.lock();
        self.encode(&ranges.map)
    }

    fn encode(&self, map: &BTreeMap<u64, (u64, RawBuffer)>) -> Vec<u64> {
        let count = map.len().min(self.capacity as usize);
        if count < map.len() && !self.truncated_warned.swap(true, Ordering::Relaxed)
        {
            tracing::warn!(
                "{} buffer device address ranges are in use, only {} fit the table. \
                 Increase `max_buffer_device_addresses` to check the rest",
                map.len(),
                self.capacity
            );
        }

        let mut words = Vec::with_capacity(1 + 2 * (count + 2));
        words.push(count as u64);
        words.push(0);
        words.extend(map.keys().take(count).copied());
        words.push(u64::MAX);
        words.push(0);
        words.extend(map.values().take(count).map(|&(size, _)| size));
        words.push(0);
        words
    }

    /// Uploads table if it changed since last upload.
    pub(crate) fn sync(&self) -> Result<bool, MapError> {
        let buffer = match &self.buffer {
            Some(buffer) => buffer,
            None => return Ok(false),
        };

        let (version, words) = {
            let ranges = self.ranges.lock();
            if ranges.version == self.uploaded.load(Ordering::Acquire) {
                return Ok(false);
            }
            (ranges.version, self.encode(&ranges.map))
        };

        buffer.write(0, &words)?;
        self.uploaded.fetch_max(version, Ordering::AcqRel);
        tracing::debug!(
            "Uploaded {} buffer device address ranges, version {}",
            words[0],
            version
        );
        Ok(true)
    }
}

/// Looks up `size` bytes at `address` in encoded table words
/// the same way instrumented shaders do.
pub fn bda_table_contains(words: &[u64], address: u64, size: u64) -> bool {
    let count = match words.first() {
        Some(&count) => count as usize,
        None => return false,
    };
    if words.len() < 1 + 2 * (count + 2) {
        return false;
    }
    let starts = &words[1..count + 3];
    let sizes = &words[count + 3..2 * count + 5];

    // Last start not above address. Sentinel `0` guarantees one exists.
    let index = starts.partition_point(|&start| start <= address) - 1;
    match address.checked_add(size) {
        Some(end) => end <= starts[index].saturating_add(sizes[index]),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(value: u64) -> DeviceAddress {
        DeviceAddress::new(value).unwrap()
    }

    #[test]
    fn table_has_sentinels() {
        let table = BdaTable::new(8);
        table.insert(addr(0x2000), 0x100, RawBuffer(2));
        table.insert(addr(0x1000), 0x40, RawBuffer(1));
        assert_eq!(
            table.table_words(),
            [2, 0, 0x1000, 0x2000, u64::MAX, 0, 0x40, 0x100, 0]
        );
    }

    #[test]
    fn lookup_matches_host_check() {
        let table = BdaTable::new(8);
        table.insert(addr(0x1000), 0x40, RawBuffer(1));
        table.insert(addr(0x2000), 0x100, RawBuffer(2));
        let words = table.table_words();

        for &(address, size, expected) in &[
            (0x1000, 4, true),
            (0x103c, 4, true),
            (0x103d, 4, false),
            (0x0fff, 1, false),
            (0x20f0, 16, true),
            (0x20f0, 17, false),
            (0x5000, 4, false),
            (u64::MAX - 2, 4, false),
        ] {
            assert_eq!(table.contains(address, size), expected, "{:#x}", address);
            assert_eq!(
                bda_table_contains(&words, address, size),
                expected,
                "{:#x}",
                address
            );
        }
    }

    #[test]
    fn truncates_to_capacity() {
        let table = BdaTable::new(2);
        for n in 1..=4u64 {
            table.insert(addr(n * 0x1000), 0x10, RawBuffer(n));
        }
        let words = table.table_words();
        assert_eq!(words[0], 2);
        assert_eq!(words.len(), 1 + 2 * 4);
        assert!(bda_table_contains(&words, 0x2000, 4));
        assert!(!bda_table_contains(&words, 0x3000, 4));
    }

    #[test]
    fn removal_bumps_version() {
        let table = BdaTable::new(2);
        table.insert(addr(0x1000), 0x10, RawBuffer(1));
        let version = table.version();
        table.remove(addr(0x1000));
        assert!(table.version() > version);
        assert!(table.is_empty());
        table.remove(addr(0x1000));
        assert_eq!(table.version(), version + 1);
    }
}

use {
    bytemuck::cast_slice,
    std::{
        collections::HashMap,
        convert::TryInto as _,
        fmt::{self, Debug},
        path::{Path, PathBuf},
        sync::Arc,
    },
    xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed},
};

/// "GAVC"
const MAGIC: u32 = 0x4356_4147;
const FORMAT_VERSION: u32 = 1;
const BUILD_ID: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

/// Words before the first entry.
const HEADER_WORDS: usize = 7;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Failed to access shader cache file: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Shader cache file is malformed: {message}")]
    Format { message: String },

    #[error("Shader cache file was written by another build or configuration")]
    Stale,
}

/// Hash identifying this build of the validator.
pub fn build_id() -> u64 {
    xxh3_64(BUILD_ID.as_bytes())
}

/// Key of an instrumented shader: original words and check configuration.
pub fn cache_key(words: &[u32], config_hash: u64) -> u64 {
    xxh3_64_with_seed(cast_slice(words), config_hash)
}

/// Instrumented programs keyed by [`cache_key`].
pub struct ShaderCache {
    entries: HashMap<u64, Arc<[u32]>>,
    config_hash: u64,
    dirty: bool,
}

impl Debug for ShaderCache {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ShaderCache")
            .field("entries", &self.entries.len())
            .field("config_hash", &format_args!("{:#x}", self.config_hash))
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl ShaderCache {
    pub fn new(config_hash: u64) -> Self {
        ShaderCache {
            entries: HashMap::new(),
            config_hash,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: u64) -> Option<Arc<[u32]>> {
        self.entries.get(&key).cloned()
    }

    pub fn insert(&mut self, key: u64, words: Arc<[u32]>) {
        self.entries.insert(key, words);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Encodes header and all entries.
    pub fn to_words(&self) -> Vec<u32> {
        let build = build_id();
        let mut words = vec![
            MAGIC,
            FORMAT_VERSION,
            build as u32,
            (build >> 32) as u32,
            self.config_hash as u32,
            (self.config_hash >> 32) as u32,
            self.entries.len() as u32,
        ];

        // Stable order keeps files comparable between runs.
        let mut keys: Vec<_> = self.entries.keys().copied().collect();
        keys.sort_unstable();
        for key in keys {
            let entry = &self.entries[&key];
            words.push(key as u32);
            words.push((key >> 32) as u32);
            words.push(entry.len() as u32);
            words.extend_from_slice(entry);
        }
        words
    }

    /// Decodes cache. Files of another build or configuration are `Stale`.
    pub fn from_words(words: &[u32], config_hash: u64) -> Result<Self, CacheError> {
        let format = |message: &str| CacheError::Format {
            message: message.to_owned(),
        };

        if words.len() < HEADER_WORDS || words[0] != MAGIC {
            return Err(format("bad magic"));
        }
        let build = build_id();
        if words[1] != FORMAT_VERSION
            || words[2] != build as u32
            || words[3] != (build >> 32) as u32
            || words[4] != config_hash as u32
            || words[5] != (config_hash >> 32) as u32
        {
            return Err(CacheError::Stale);
        }

        let count = words[6] as usize;
        let mut entries = HashMap::with_capacity(count);
        let mut offset = HEADER_WORDS;
        for _ in 0..count {
            let header = words
                .get(offset..offset + 3)
                .ok_or_else(|| format("truncated entry header"))?;
            let key = u64::from(header[0]) | u64::from(header[1]) << 32;
            let len = header[2] as usize;
            offset += 3;
            let body = words
                .get(offset..offset + len)
                .ok_or_else(|| format("truncated entry"))?;
            entries.insert(key, Arc::from(body));
            offset += len;
        }

        Ok(ShaderCache {
            entries,
            config_hash,
            dirty: false,
        })
    }

    #[tracing::instrument]
    pub fn load(path: &Path, config_hash: u64) -> Result<Self, CacheError> {
        let bytes = std::fs::read(path)?;
        if bytes.len() % 4 != 0 {
            return Err(CacheError::Format {
                message: "length is not a multiple of 4".to_owned(),
            });
        }
        let words: Vec<u32> = bytes
            .chunks_exact(4)
            .map(|chunk| {
                // `chunks_exact` yields 4 byte chunks.
                u32::from_le_bytes(chunk.try_into().unwrap_or_default())
            })
            .collect();

        let cache = Self::from_words(&words, config_hash)?;
        tracing::debug!("Loaded {} instrumented shaders", cache.len());
        Ok(cache)
    }

    #[tracing::instrument]
    pub fn save(&mut self, path: &Path) -> Result<(), CacheError> {
        let bytes: Vec<u8> = self
            .to_words()
            .iter()
            .flat_map(|word| word.to_le_bytes().to_vec())
            .collect();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, bytes)?;
        self.dirty = false;
        tracing::debug!("Saved {} instrumented shaders", self.len());
        Ok(())
    }
}

/// Default cache location when settings do not name one.
pub fn default_cache_path() -> PathBuf {
    std::env::temp_dir().join("gpuav_shader_cache.bin")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.bin");

        let mut cache = ShaderCache::new(42);
        let key = cache_key(&[1, 2, 3], 42);
        cache.insert(key, Arc::from(&[7u32, 8, 9][..]));
        assert!(cache.is_dirty());
        cache.save(&path).unwrap();
        assert!(!cache.is_dirty());

        let loaded = ShaderCache::load(&path, 42).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(&*loaded.get(key).unwrap(), &[7, 8, 9]);
    }

    #[test]
    fn discards_other_configuration() {
        let mut cache = ShaderCache::new(1);
        cache.insert(5, Arc::from(&[1u32][..]));
        let words = cache.to_words();
        assert!(matches!(
            ShaderCache::from_words(&words, 2),
            Err(CacheError::Stale)
        ));
    }

    #[test]
    fn rejects_truncated_entries() {
        let mut cache = ShaderCache::new(1);
        cache.insert(5, Arc::from(&[1u32, 2, 3][..]));
        let words = cache.to_words();
        assert!(matches!(
            ShaderCache::from_words(&words[..words.len() - 1], 1),
            Err(CacheError::Format { .. })
        ));
    }

    #[test]
    fn key_depends_on_configuration() {
        assert_ne!(cache_key(&[1, 2], 1), cache_key(&[1, 2], 2));
        assert_eq!(cache_key(&[1, 2], 1), cache_key(&[1, 2], 1));
    }
}

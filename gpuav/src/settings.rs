#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use std::path::PathBuf;

#[cfg(feature = "settings-file")]
use std::path::Path;

/// Environment variable with path to RON settings file.
pub const SETTINGS_ENV: &str = "GPUAV_SETTINGS";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Failed to read settings file `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse settings: {message}")]
    Parse { message: String },
}

/// Which checks are compiled into instrumented shaders.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct ShaderInstrumentationSettings {
    /// Descriptor indexing: out of bounds index, uninitialized and destroyed
    /// descriptors, buffer range overruns.
    pub descriptor_checks: bool,

    /// Accesses through buffer device address must hit a live buffer.
    pub buffer_device_address: bool,

    /// Ray query arguments.
    pub ray_query: bool,

    /// Record which descriptors were accessed for post-processing.
    pub post_process_descriptor_indexing: bool,
}

impl Default for ShaderInstrumentationSettings {
    fn default() -> Self {
        ShaderInstrumentationSettings {
            descriptor_checks: true,
            buffer_device_address: true,
            ray_query: true,
            post_process_descriptor_indexing: true,
        }
    }
}

impl ShaderInstrumentationSettings {
    pub fn any(&self) -> bool {
        self.descriptor_checks
            || self.buffer_device_address
            || self.ray_query
            || self.post_process_descriptor_indexing
    }

    pub(crate) fn bits(&self) -> u32 {
        (self.descriptor_checks as u32)
            | (self.buffer_device_address as u32) << 1
            | (self.ray_query as u32) << 2
            | (self.post_process_descriptor_indexing as u32) << 3
    }
}

/// Validator settings.
///
/// Every field has a default so a settings file only lists what it changes.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(default))]
pub struct Settings {
    pub shader_instrumentation: ShaderInstrumentationSettings,

    pub validate_indirect_draws_buffers: bool,
    pub validate_indirect_dispatches_buffers: bool,
    pub validate_indirect_trace_rays_buffers: bool,
    pub validate_buffer_copies: bool,
    pub validate_index_buffers: bool,

    /// Report out of bounds accesses that robustness makes well-defined as
    /// warnings. When unset such accesses are not reported.
    pub warn_on_robust_oob: bool,

    pub cache_instrumented_shaders: bool,
    pub shader_cache_path: Option<PathBuf>,

    /// Only instrument shaders whose debug name matches one of
    /// `shader_selection` entries.
    pub select_instrumented_shaders: bool,
    pub shader_selection: Vec<String>,

    /// Capacity of the buffer device address table.
    pub max_buffer_device_addresses: u32,

    /// Number of descriptor ids available, including reserved `0`.
    pub descriptor_heap_capacity: u32,

    /// Errors recorded per validated command before the rest are dropped.
    pub max_errors_per_command: u32,

    /// Capacity of the per command buffer error output buffer in records.
    pub output_buffer_records: u32,

    pub debug_validate_instrumented_shaders: bool,
    pub debug_dump_instrumented_shaders: Option<PathBuf>,

    /// `0` means unlimited.
    pub debug_max_instrumentations_count: u32,
    pub debug_print_instrumentation_info: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            shader_instrumentation: ShaderInstrumentationSettings::default(),
            validate_indirect_draws_buffers: true,
            validate_indirect_dispatches_buffers: true,
            validate_indirect_trace_rays_buffers: true,
            validate_buffer_copies: true,
            validate_index_buffers: true,
            warn_on_robust_oob: true,
            cache_instrumented_shaders: false,
            shader_cache_path: None,
            select_instrumented_shaders: false,
            shader_selection: Vec::new(),
            max_buffer_device_addresses: 10_000,
            descriptor_heap_capacity: 1 << 20,
            max_errors_per_command: 6,
            output_buffer_records: 256,
            debug_validate_instrumented_shaders: false,
            debug_dump_instrumented_shaders: None,
            debug_max_instrumentations_count: 0,
            debug_print_instrumentation_info: false,
        }
    }
}

#[cfg(feature = "settings-file")]
impl Settings {
    pub fn from_ron(text: &str) -> Result<Self, SettingsError> {
        ron::de::from_str(text).map_err(|err| SettingsError::Parse {
            message: err.to_string(),
        })
    }

    pub fn to_ron(&self) -> Result<String, SettingsError> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|err| SettingsError::Parse {
                message: err.to_string(),
            })
    }

    #[tracing::instrument]
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            SettingsError::Io {
                path: path.to_owned(),
                source,
            }
        })?;
        Self::from_ron(&text)
    }

    /// Loads settings from file named by `GPUAV_SETTINGS`.
    /// Falls back to defaults when the variable is unset or the file is
    /// broken.
    pub fn from_env() -> Self {
        match std::env::var_os(SETTINGS_ENV) {
            None => Settings::default(),
            Some(path) => match Self::load(Path::new(&path)) {
                Ok(settings) => settings,
                Err(err) => {
                    tracing::error!("{:#}", err);
                    Settings::default()
                }
            },
        }
    }
}

mod cache;
mod toolkit;

pub use self::{cache::*, toolkit::*};

use {
    crate::{
        report::{Diagnostic, Reporter, Severity, SETUP_VUID},
        settings::Settings,
        spirv::{self, DebugLineTable, ModuleSummary, SourceLocation},
        wire,
    },
    once_cell::sync::OnceCell,
    parking_lot::Mutex,
    std::{
        collections::HashMap,
        fmt::{self, Debug},
        path::PathBuf,
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc, Weak,
        },
    },
};

#[derive(Debug, thiserror::Error)]
pub enum InstrumentError {
    #[error("Instrumentation is aborted")]
    Aborted,

    #[error("{source}")]
    Toolkit {
        #[from]
        source: ToolkitError,
    },

    #[error("{source}")]
    Spirv {
        #[from]
        source: spirv::SpirvError,
    },
}

/// Shader code to hand to the driver.
#[derive(Clone)]
pub struct InstrumentedShader {
    shader_id: u32,
    code: Arc<[u32]>,
    instrumented: bool,
    name: Option<Arc<str>>,

    /// Keeps the original program known while any copy is alive.
    record: Option<Arc<ShaderRecord>>,
}

impl Debug for InstrumentedShader {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("InstrumentedShader")
                .field("shader_id", &self.shader_id)
                .field("words", &self.code.len())
                .field("instrumented", &self.instrumented)
                .field("name", &self.name)
                .finish()
        } else {
            write!(fmt, "Shader({})", self.shader_id)
        }
    }
}

impl InstrumentedShader {
    /// Wraps code the validator did not instrument.
    pub fn passthrough(code: Arc<[u32]>) -> Self {
        InstrumentedShader {
            shader_id: 0,
            code,
            instrumented: false,
            name: None,
            record: None,
        }
    }

    pub fn shader_id(&self) -> u32 {
        self.shader_id
    }

    pub fn code(&self) -> &Arc<[u32]> {
        &self.code
    }

    pub fn is_instrumented(&self) -> bool {
        self.instrumented
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Original program, present for instrumented shaders.
    pub fn record(&self) -> Option<&Arc<ShaderRecord>> {
        self.record.as_ref()
    }
}

/// Original program of an instrumented shader, kept for error attribution.
pub struct ShaderRecord {
    original: Arc<[u32]>,
    name: Option<Arc<str>>,
    lines: OnceCell<Option<DebugLineTable>>,
}

impl Debug for ShaderRecord {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ShaderRecord")
            .field("words", &self.original.len())
            .field("name", &self.name)
            .finish()
    }
}

impl ShaderRecord {
    pub fn original(&self) -> &[u32] {
        &self.original
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Source location of the instruction at `position` of the original
    /// program. Line table is parsed on first use.
    pub fn location(&self, position: u32) -> Option<SourceLocation> {
        self.lines
            .get_or_init(|| match DebugLineTable::parse(&self.original) {
                Ok(table) => Some(table),
                Err(err) => {
                    tracing::warn!("Failed to read shader debug info: {:#}", err);
                    None
                }
            })
            .as_ref()?
            .find(position)
    }
}

/// Produces instrumented shaders and remembers originals.
pub struct ShaderInstrumenter {
    toolkit: Option<Box<dyn Toolkit>>,
    reporter: Arc<dyn Reporter>,
    settings: Settings,
    validation_set: u32,
    config_hash: u64,

    /// Single source of truth for "instrumentation is off".
    aborted: AtomicBool,
    library: OnceCell<Option<Arc<[u32]>>>,
    cache: Mutex<ShaderCache>,
    shaders: Mutex<HashMap<u32, Weak<ShaderRecord>>>,
    instrumented_count: AtomicU32,
}

impl Debug for ShaderInstrumenter {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("ShaderInstrumenter")
            .field("toolkit", &self.toolkit)
            .field("validation_set", &self.validation_set)
            .field("aborted", &self.is_aborted())
            .field("instrumented", &self.instrumented_count())
            .finish()
    }
}

impl ShaderInstrumenter {
    pub fn new(
        toolkit: Option<Box<dyn Toolkit>>,
        reporter: Arc<dyn Reporter>,
        settings: &Settings,
        validation_set: u32,
    ) -> Self {
        let config_hash = config_hash(settings, validation_set);

        let mut cache = ShaderCache::new(config_hash);
        if settings.cache_instrumented_shaders {
            let path = cache_path(settings);
            if path.exists() {
                match ShaderCache::load(&path, config_hash) {
                    Ok(loaded) => cache = loaded,
                    Err(err) => {
                        tracing::warn!(
                            "Ignoring shader cache {}: {:#}",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }

        ShaderInstrumenter {
            toolkit,
            reporter,
            settings: settings.clone(),
            validation_set,
            config_hash,
            aborted: AtomicBool::new(false),
            library: OnceCell::new(),
            cache: Mutex::new(cache),
            shaders: Mutex::new(HashMap::new()),
            instrumented_count: AtomicU32::new(0),
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub fn validation_set(&self) -> u32 {
        self.validation_set
    }

    pub fn instrumented_count(&self) -> u32 {
        self.instrumented_count.load(Ordering::Relaxed)
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }

    /// Original program of shader with `shader_id`.
    pub fn shader(&self, shader_id: u32) -> Option<Arc<ShaderRecord>> {
        self.shaders.lock().get(&shader_id).and_then(Weak::upgrade)
    }

    /// Number of shaders whose original program is still known.
    pub fn live_shader_count(&self) -> usize {
        self.shaders
            .lock()
            .values()
            .filter(|record| record.strong_count() > 0)
            .count()
    }

    /// Drops the record of `shader` once no pipeline refers to it.
    pub fn release(&self, shader: InstrumentedShader) {
        let shader_id = shader.shader_id;
        drop(shader);

        let mut shaders = self.shaders.lock();
        if let Some(record) = shaders.get(&shader_id) {
            if record.strong_count() == 0 {
                shaders.remove(&shader_id);
            }
        }
    }

    /// Record of `shader_id`, shared with every live shader of the same code.
    fn record(&self, shader_id: u32, original: &Arc<[u32]>, name: &Option<Arc<str>>) -> Arc<ShaderRecord> {
        let mut shaders = self.shaders.lock();
        if let Some(record) = shaders.get(&shader_id).and_then(Weak::upgrade) {
            return record;
        }
        let record = Arc::new(ShaderRecord {
            original: original.clone(),
            name: name.clone(),
            lines: OnceCell::new(),
        });
        shaders.insert(shader_id, Arc::downgrade(&record));
        record
    }

    fn abort(&self, message: String) {
        if !self.aborted.swap(true, Ordering::AcqRel) {
            tracing::error!("{}", message);
            self.reporter.report(Diagnostic {
                severity: Severity::Error,
                vuid: SETUP_VUID.to_owned(),
                message: format!("{}. Shader instrumentation is disabled", message),
            });
        }
    }

    /// Instruments shader. Never fails: on any problem the original code is
    /// returned and the shader runs unchecked.
    #[tracing::instrument(skip(self, words), fields(words = words.len()))]
    pub fn instrument(&self, words: &[u32], name: Option<&str>) -> InstrumentedShader {
        let original: Arc<[u32]> = Arc::from(words);
        let name: Option<Arc<str>> = name.map(Arc::from);

        if self.is_aborted() || self.toolkit.is_none() {
            return InstrumentedShader::passthrough(original);
        }
        if !self.settings.shader_instrumentation.any() {
            return InstrumentedShader::passthrough(original);
        }
        if !self.selected(name.as_deref()) {
            tracing::debug!("Shader {:?} is not selected for instrumentation", name);
            return InstrumentedShader::passthrough(original);
        }

        let max = self.settings.debug_max_instrumentations_count;
        if max != 0 && self.instrumented_count() >= max {
            tracing::debug!("Instrumentation limit of {} shaders reached", max);
            return InstrumentedShader::passthrough(original);
        }

        // Instrumented code embeds the id, so equal modules must get equal ids.
        let key = cache_key(words, self.config_hash);
        let shader_id = ((key as u32) ^ (key >> 32) as u32).max(1);

        if let Some(code) = self.cache.lock().get(key) {
            tracing::debug!("Shader {} found in cache", shader_id);
            self.instrumented_count.fetch_add(1, Ordering::Relaxed);
            return InstrumentedShader {
                shader_id,
                code,
                instrumented: true,
                record: Some(self.record(shader_id, &original, &name)),
                name,
            };
        }

        let code = match self.instrument_words(words, shader_id) {
            Ok(Some(code)) => Arc::<[u32]>::from(code),
            Ok(None) => {
                tracing::debug!("Shader {} needs no instrumentation", shader_id);
                return InstrumentedShader::passthrough(original);
            }
            Err(err) => {
                tracing::error!("Failed to instrument shader {}: {:#}", shader_id, err);
                self.reporter.report(Diagnostic {
                    severity: Severity::Warning,
                    vuid: SETUP_VUID.to_owned(),
                    message: format!(
                        "Shader {} ({}) runs without instrumentation: {}",
                        shader_id,
                        name.as_deref().unwrap_or("unnamed"),
                        err
                    ),
                });
                return InstrumentedShader::passthrough(original);
            }
        };

        self.instrumented_count.fetch_add(1, Ordering::Relaxed);
        self.dump(shader_id, &code);
        if self.settings.debug_print_instrumentation_info {
            tracing::info!(
                "Instrumented shader {} ({}): {} words -> {} words",
                shader_id,
                name.as_deref().unwrap_or("unnamed"),
                words.len(),
                code.len()
            );
        }
        self.cache.lock().insert(key, code.clone());

        InstrumentedShader {
            shader_id,
            code,
            instrumented: true,
            record: Some(self.record(shader_id, &original, &name)),
            name,
        }
    }

    fn selected(&self, name: Option<&str>) -> bool {
        if !self.settings.select_instrumented_shaders {
            return true;
        }
        match name {
            Some(name) => self
                .settings
                .shader_selection
                .iter()
                .any(|pattern| name.contains(pattern.as_str())),
            None => false,
        }
    }

    /// Passes worth running on a module.
    fn passes(&self, summary: &ModuleSummary, shader_id: u32) -> Vec<PassInfo> {
        let checks = &self.settings.shader_instrumentation;
        let mut kinds = Vec::new();
        if checks.descriptor_checks {
            kinds.push(PassKind::DescriptorChecks);
        }
        if checks.post_process_descriptor_indexing {
            kinds.push(PassKind::PostProcessDescriptorIndexing);
        }
        if checks.buffer_device_address && summary.uses_buffer_device_address() {
            kinds.push(PassKind::BufferDeviceAddress);
        }
        if checks.ray_query && summary.uses_ray_query() {
            kinds.push(PassKind::RayQuery);
        }

        kinds
            .into_iter()
            .map(|kind| PassInfo {
                kind,
                shader_id,
                validation_set: self.validation_set,
            })
            .collect()
    }

    fn instrument_words(
        &self,
        words: &[u32],
        shader_id: u32,
    ) -> Result<Option<Vec<u32>>, InstrumentError> {
        let toolkit = self.toolkit.as_deref().ok_or(InstrumentError::Aborted)?;
        let summary = ModuleSummary::parse(words)?;
        let passes = self.passes(&summary, shader_id);
        if passes.is_empty() {
            return Ok(None);
        }

        let instrumented = match toolkit.instrument(words, &passes)? {
            Some(instrumented) => instrumented,
            None => return Ok(None),
        };

        let library = self.library().ok_or(InstrumentError::Aborted)?;
        let linked = toolkit.link(&instrumented, &library)?;

        if self.settings.debug_validate_instrumented_shaders {
            toolkit.validate(&linked)?;
        }

        Ok(Some(toolkit.eliminate_dead_code(&linked)?))
    }

    /// Helper library moved onto the validation slot.
    /// Built once, failure aborts instrumentation for good.
    fn library(&self) -> Option<Arc<[u32]>> {
        self.library
            .get_or_init(|| {
                let toolkit = self.toolkit.as_deref()?;
                let result = toolkit
                    .helper_library()
                    .map_err(InstrumentError::from)
                    .and_then(|mut words| {
                        spirv::remap_descriptor_set(
                            &mut words,
                            wire::PLACEHOLDER_DESCRIPTOR_SET,
                            self.validation_set,
                        )?;
                        Ok(words)
                    });

                match result {
                    Ok(words) => Some(Arc::from(words)),
                    Err(err) => {
                        self.abort(format!("Failed to prepare helper library: {}", err));
                        None
                    }
                }
            })
            .clone()
    }

    fn dump(&self, shader_id: u32, code: &[u32]) {
        let dir = match &self.settings.debug_dump_instrumented_shaders {
            Some(dir) => dir,
            None => return,
        };
        let path = dir.join(format!("shader_{}.spv", shader_id));
        let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_le_bytes().to_vec()).collect();
        let result = std::fs::create_dir_all(dir).and_then(|()| std::fs::write(&path, bytes));
        if let Err(err) = result {
            tracing::warn!("Failed to dump {}: {:#}", path.display(), err);
        }
    }

    /// Writes cache file if caching is enabled and new shaders were added.
    pub fn persist_cache(&self) {
        if !self.settings.cache_instrumented_shaders {
            return;
        }
        let mut cache = self.cache.lock();
        if !cache.is_dirty() {
            return;
        }
        let path = cache_path(&self.settings);
        if let Err(err) = cache.save(&path) {
            tracing::warn!("Failed to save shader cache {}: {:#}", path.display(), err);
        }
    }
}

fn cache_path(settings: &Settings) -> PathBuf {
    settings
        .shader_cache_path
        .clone()
        .unwrap_or_else(default_cache_path)
}

/// Everything that changes instrumented code besides the original words.
fn config_hash(settings: &Settings, validation_set: u32) -> u64 {
    let words = [
        settings.shader_instrumentation.bits(),
        validation_set,
        wire::RECORD_WORDS as u32,
    ];
    xxhash_rust::xxh3::xxh3_64(bytemuck::cast_slice(&words))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::report::CollectingReporter,
        rspirv::{
            binary::Assemble as _,
            dr::Builder,
            spirv::{Capability, Decoration},
        },
    };

    #[derive(Debug, Default)]
    struct CountingToolkit {
        passes: AtomicU32,
        libraries: AtomicU32,
        fail_library: bool,
    }

    impl Toolkit for Arc<CountingToolkit> {
        fn run_pass(
            &self,
            words: &[u32],
            pass: &PassInfo,
        ) -> Result<Option<Vec<u32>>, ToolkitError> {
            self.passes.fetch_add(1, Ordering::Relaxed);
            let mut words = words.to_vec();
            words.push(pass.shader_id);
            Ok(Some(words))
        }

        fn helper_library(&self) -> Result<Vec<u32>, ToolkitError> {
            self.libraries.fetch_add(1, Ordering::Relaxed);
            if self.fail_library {
                return Err(ToolkitError::Library {
                    message: "missing".to_owned(),
                });
            }
            let mut b = Builder::new();
            let float = b.type_float(32);
            let var = b.variable(float, None, rspirv::spirv::StorageClass::Uniform, None);
            b.decorate(
                var,
                Decoration::DescriptorSet,
                vec![rspirv::dr::Operand::LiteralInt32(wire::PLACEHOLDER_DESCRIPTOR_SET)],
            );
            Ok(b.module().assemble())
        }

        fn link(&self, module: &[u32], _library: &[u32]) -> Result<Vec<u32>, ToolkitError> {
            Ok(module.to_vec())
        }

        fn validate(&self, _words: &[u32]) -> Result<(), ToolkitError> {
            Ok(())
        }

        fn eliminate_dead_code(&self, words: &[u32]) -> Result<Vec<u32>, ToolkitError> {
            Ok(words.to_vec())
        }
    }

    fn shader() -> Vec<u32> {
        let mut b = Builder::new();
        b.capability(Capability::Shader);
        b.module().assemble()
    }

    fn instrumenter(toolkit: &Arc<CountingToolkit>, settings: &Settings) -> ShaderInstrumenter {
        ShaderInstrumenter::new(
            Some(Box::new(toolkit.clone())),
            Arc::new(CollectingReporter::new()),
            settings,
            3,
        )
    }

    #[test]
    fn cache_hit_skips_toolkit() {
        let toolkit = Arc::new(CountingToolkit::default());
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            cache_instrumented_shaders: true,
            shader_cache_path: Some(dir.path().join("cache.bin")),
            ..Settings::default()
        };
        let instrumenter = instrumenter(&toolkit, &settings);

        let words = shader();
        let first = instrumenter.instrument(&words, Some("a"));
        let passes = toolkit.passes.load(Ordering::Relaxed);
        assert!(first.is_instrumented());
        assert!(passes > 0);

        let second = instrumenter.instrument(&words, Some("a"));
        assert_eq!(first.code(), second.code());
        assert_eq!(first.shader_id(), second.shader_id());
        assert_eq!(toolkit.passes.load(Ordering::Relaxed), passes);

        instrumenter.persist_cache();
        let reloaded = instrumenter_with_fresh_toolkit(&settings);
        let third = reloaded.1.instrument(&words, Some("a"));
        assert_eq!(third.code(), first.code());
        assert_eq!(reloaded.0.passes.load(Ordering::Relaxed), 0);
    }

    fn instrumenter_with_fresh_toolkit(
        settings: &Settings,
    ) -> (Arc<CountingToolkit>, ShaderInstrumenter) {
        let toolkit = Arc::new(CountingToolkit::default());
        let instrumenter = instrumenter(&toolkit, settings);
        (toolkit, instrumenter)
    }

    #[test]
    fn skips_passes_for_unused_features() {
        let toolkit = Arc::new(CountingToolkit::default());
        let instrumenter = instrumenter(&toolkit, &Settings::default());
        instrumenter.instrument(&shader(), None);

        // Neither buffer device address nor ray query capability is declared.
        assert_eq!(toolkit.passes.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn library_failure_aborts() {
        let toolkit = Arc::new(CountingToolkit {
            fail_library: true,
            ..CountingToolkit::default()
        });
        let instrumenter = instrumenter(&toolkit, &Settings::default());

        let shader = instrumenter.instrument(&shader(), None);
        assert!(!shader.is_instrumented());
        assert!(instrumenter.is_aborted());

        instrumenter.instrument(&self::shader(), None);
        assert_eq!(toolkit.libraries.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn selection_and_limit() {
        let toolkit = Arc::new(CountingToolkit::default());
        let settings = Settings {
            select_instrumented_shaders: true,
            shader_selection: vec!["shadow".to_owned()],
            debug_max_instrumentations_count: 1,
            ..Settings::default()
        };
        let instrumenter = instrumenter(&toolkit, &settings);

        assert!(!instrumenter.instrument(&shader(), Some("gbuffer")).is_instrumented());
        assert!(instrumenter.instrument(&shader(), Some("shadow_pass")).is_instrumented());
        assert!(!instrumenter.instrument(&shader(), Some("shadow_pass")).is_instrumented());
    }

    #[test]
    fn equal_modules_reuse_code_without_file_cache() {
        let toolkit = Arc::new(CountingToolkit::default());
        let instrumenter = instrumenter(&toolkit, &Settings::default());

        let first = instrumenter.instrument(&shader(), Some("sky"));
        let passes = toolkit.passes.load(Ordering::Relaxed);
        let second = instrumenter.instrument(&shader(), Some("sky"));
        assert_eq!(first.shader_id(), second.shader_id());
        assert_eq!(first.code(), second.code());
        assert_eq!(toolkit.passes.load(Ordering::Relaxed), passes);
        assert_eq!(instrumenter.cached_count(), 1);
    }

    #[test]
    fn record_lives_while_shader_is_used() {
        let toolkit = Arc::new(CountingToolkit::default());
        let instrumenter = instrumenter(&toolkit, &Settings::default());

        let module = instrumenter.instrument(&shader(), Some("sky"));
        let id = module.shader_id();
        let pipeline_copy = module.clone();
        assert_eq!(instrumenter.live_shader_count(), 1);

        instrumenter.release(module);
        assert_eq!(instrumenter.shader(id).unwrap().name(), Some("sky"));

        drop(pipeline_copy);
        assert!(instrumenter.shader(id).is_none());
        assert_eq!(instrumenter.live_shader_count(), 0);
    }

    #[test]
    fn uninstrumented_shaders_leave_no_record() {
        let toolkit = Arc::new(CountingToolkit::default());
        let instrumenter = instrumenter(&toolkit, &Settings::default());

        let shader = instrumenter.instrument(&[7, 8, 9], None);
        assert!(shader.record().is_none());
        assert_eq!(instrumenter.live_shader_count(), 0);
    }

    #[test]
    fn rejects_non_spirv() {
        let toolkit = Arc::new(CountingToolkit::default());
        let instrumenter = instrumenter(&toolkit, &Settings::default());
        let shader = instrumenter.instrument(&[1, 2, 3], None);
        assert!(!shader.is_instrumented());
        assert_eq!(&**shader.code(), &[1, 2, 3]);
        assert!(!instrumenter.is_aborted());
    }
}

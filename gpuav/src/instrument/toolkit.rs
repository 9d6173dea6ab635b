use std::fmt::Debug;

/// Check families instrumentation can add to a shader.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde-1", derive(serde::Serialize, serde::Deserialize))]
pub enum PassKind {
    /// Bounds, initialization and liveness of descriptor indexed accesses.
    DescriptorChecks,

    /// Marks descriptor elements shaders actually touch.
    PostProcessDescriptorIndexing,

    /// Buffer device address dereferences against live ranges.
    BufferDeviceAddress,

    /// Ray query parameters.
    RayQuery,
}

/// Arguments of one instrumentation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PassInfo {
    pub kind: PassKind,

    /// Written into every record the pass emits.
    pub shader_id: u32,

    /// Descriptor set index of the validation set.
    pub validation_set: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ToolkitError {
    #[error("Pass {kind:?} failed: {message}")]
    Pass { kind: PassKind, message: String },

    #[error("Helper library is unavailable: {message}")]
    Library { message: String },

    #[error("Failed to link helper library: {message}")]
    Link { message: String },

    #[error("Instrumented module is invalid: {message}")]
    Validation { message: String },

    #[error("Dead code elimination failed: {message}")]
    Optimize { message: String },
}

/// Program rewriting engine.
///
/// Given a program and a pass it produces the instrumented program. The
/// validator never looks inside the rewritten code, it only relies on the
/// emitted error records following [`wire`](crate::wire) layouts.
pub trait Toolkit: Debug + Send + Sync + 'static {
    /// Runs one pass. Returns `None` when the pass found nothing to instrument.
    fn run_pass(
        &self,
        words: &[u32],
        pass: &PassInfo,
    ) -> Result<Option<Vec<u32>>, ToolkitError>;

    /// Helper routines instrumented code calls into.
    /// Compiled against descriptor set
    /// [`PLACEHOLDER_DESCRIPTOR_SET`](crate::wire::PLACEHOLDER_DESCRIPTOR_SET).
    fn helper_library(&self) -> Result<Vec<u32>, ToolkitError>;

    fn link(&self, module: &[u32], library: &[u32]) -> Result<Vec<u32>, ToolkitError>;

    fn validate(&self, words: &[u32]) -> Result<(), ToolkitError>;

    /// Removes dead code keeping entry points and bindings intact.
    fn eliminate_dead_code(&self, words: &[u32]) -> Result<Vec<u32>, ToolkitError>;

    /// Runs passes one after another.
    /// Returns `None` when no pass changed the program.
    fn instrument(
        &self,
        words: &[u32],
        passes: &[PassInfo],
    ) -> Result<Option<Vec<u32>>, ToolkitError> {
        let mut current: Option<Vec<u32>> = None;
        for pass in passes {
            let input = current.as_deref().unwrap_or(words);
            if let Some(output) = self.run_pass(input, pass)? {
                current = Some(output);
            }
        }
        Ok(current)
    }
}

use {
    parking_lot::Mutex,
    std::fmt::{self, Debug, Display},
};

/// Identifier attached to validator's own setup and internal problems.
pub const SETUP_VUID: &str = "UNASSIGNED-GPU-Assisted-Validation";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Single validation message.
#[derive(Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,

    /// Stable identifier of the violated rule.
    pub vuid: String,

    pub message: String,
}

impl Debug for Diagnostic {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if fmt.alternate() {
            fmt.debug_struct("Diagnostic")
                .field("severity", &self.severity)
                .field("vuid", &self.vuid)
                .field("message", &self.message)
                .finish()
        } else {
            write!(fmt, "{:?}[{}]", self.severity, self.vuid)
        }
    }
}

impl Display for Diagnostic {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "[ {} ] {}", self.vuid, self.message)
    }
}

/// Sink for diagnostics produced by the validator.
pub trait Reporter: Debug + Send + Sync + 'static {
    fn report(&self, diagnostic: Diagnostic);
}

/// Forwards diagnostics to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => tracing::error!(
                vuid = %diagnostic.vuid,
                "{}",
                diagnostic.message
            ),
            Severity::Warning => tracing::warn!(
                vuid = %diagnostic.vuid,
                "{}",
                diagnostic.message
            ),
            Severity::Info => tracing::info!(
                vuid = %diagnostic.vuid,
                "{}",
                diagnostic.message
            ),
        }
    }
}

/// Keeps diagnostics in memory until taken.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        CollectingReporter::default()
    }

    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    pub fn len(&self) -> usize {
        self.diagnostics.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Reporter for CollectingReporter {
    fn report(&self, diagnostic: Diagnostic) {
        tracing::trace!("Collected {:?}", diagnostic);
        self.diagnostics.lock().push(diagnostic);
    }
}

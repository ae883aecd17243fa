//! Error taxonomy for the runtime. Render and effect failures are contained
//! at the component boundary; only mount/hydrate target failures surface
//! synchronously to the caller.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("mount target not found: '{selector}'")]
    TargetNotFound { selector: String },

    #[error("hook order violation at index {index}: expected {expected}, got {actual}")]
    HookOrderViolation {
        index: usize,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("render failed: {details}")]
    RenderFailure { details: String },

    #[error("effect failed: {details}")]
    EffectFailure { details: String },

    #[error("host operation failed: {details}")]
    HostFailure { details: String },

    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl RuntimeError {
    /// Shorthand for user render code signalling a failure.
    pub fn render(details: impl Into<String>) -> Self {
        RuntimeError::RenderFailure {
            details: details.into(),
        }
    }

    pub fn effect(details: impl Into<String>) -> Self {
        RuntimeError::EffectFailure {
            details: details.into(),
        }
    }

    pub(crate) fn host(details: impl Into<String>) -> Self {
        RuntimeError::HostFailure {
            details: details.into(),
        }
    }
}

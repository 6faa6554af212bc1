//! Error taxonomy for the quarantine lifecycle.
//!
//! Object-model failures are carried unchanged inside
//! [`QuarantineError::Object`]; everything else maps onto a named script-level
//! error class so it can be thrown into (and observed from) script code.

use serde::{Deserialize, Serialize};

use crate::object_model::ObjectError;

/// Errors surfaced by the entrypoint, the repository and the sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum QuarantineError {
    /// The entrypoint was invoked outside a loadable script, or the
    /// configuration declares something unsupported.
    #[error("{0}")]
    Configuration(String),
    /// Host code tried to reassign a declared global override.
    #[error("global override `{name}` cannot be reassigned")]
    DuplicateAssignment { name: String },
    /// A sandbox name was referenced before it was ever declared.
    #[error("No sandbox with name \"{name}\" has been declared.")]
    RealmUnavailable { name: String },
    /// The host could not load the script at all.
    #[error("failed to load script `{locator}`")]
    ScriptLoad { locator: String },
    /// The script loaded but threw while executing.
    #[error("script `{locator}` threw: {message}")]
    ScriptRuntime { locator: String, message: String },
    /// Object-model failure, surfaced as the platform reported it.
    #[error(transparent)]
    Object(#[from] ObjectError),
}

impl QuarantineError {
    /// Stable error code for structured logging.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "QR-CONFIG-0001",
            Self::DuplicateAssignment { .. } => "QR-OVERRIDE-0001",
            Self::RealmUnavailable { .. } => "QR-SANDBOX-0001",
            Self::ScriptLoad { .. } => "QR-SCRIPT-0001",
            Self::ScriptRuntime { .. } => "QR-SCRIPT-0002",
            Self::Object(inner) => inner.error_code(),
        }
    }

    /// Script-visible error class name.
    pub fn error_name(&self) -> &str {
        match self {
            Self::Configuration(_) => "ConfigurationError",
            Self::DuplicateAssignment { .. } => "DuplicateAssignmentError",
            Self::RealmUnavailable { .. } => "RealmUnavailableError",
            Self::ScriptLoad { .. } => "ScriptLoadError",
            Self::ScriptRuntime { .. } => "ScriptRuntimeError",
            Self::Object(ObjectError::Thrown { name, .. }) => name,
            Self::Object(_) => "TypeError",
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

impl From<QuarantineError> for ObjectError {
    fn from(err: QuarantineError) -> Self {
        match err {
            QuarantineError::Object(inner) => inner,
            other => ObjectError::Thrown {
                name: other.error_name().to_string(),
                message: other.to_string(),
            },
        }
    }
}

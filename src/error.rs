use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Tool '{tool}' failed: {message}")]
    ToolFailure {
        tool: String,
        message: String,
        retryable: bool,
    },

    #[error("Plan error: {0}")]
    Plan(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Instance closed: {0}")]
    InstanceClosed(String),
}

impl Error {
    /// Build a retryable tool failure.
    pub fn retryable(tool: &str, message: impl Into<String>) -> Self {
        Error::ToolFailure {
            tool: tool.to_string(),
            message: message.into(),
            retryable: true,
        }
    }

    /// Build a tool failure that must not be retried.
    pub fn permanent(tool: &str, message: impl Into<String>) -> Self {
        Error::ToolFailure {
            tool: tool.to_string(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether the dispatcher may re-invoke a step that failed with this error.
    ///
    /// Timeouts and transient I/O count as retryable; validation, plan and
    /// persistence problems never are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ToolFailure { retryable, .. } => *retryable,
            Error::Timeout(_) | Error::Io(_) => true,
            _ => false,
        }
    }

    /// Error class used to tag history entries.
    pub fn tag(&self) -> &'static str {
        match self {
            Error::Validation(_) => "ValidationError",
            Error::ToolFailure { .. } | Error::Timeout(_) => "ToolFailure",
            Error::Plan(_) => "PlanError",
            Error::Persistence(_) => "PersistenceError",
            Error::InvalidPhaseTransition { .. } => "PhaseError",
            _ => "InternalError",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

use std::time::Duration;
use thiserror::Error;

/// Boxed error returned by external collaborators (retrievers, generators, jobs).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "queue.max_size")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "settings", "file_session_store")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the admission layer.
///
/// Every condition a caller must react to is its own variant so the surrounding
/// API layer can map it (429, 503, 404, ...) without string matching.
/// Cache misses are not errors; they surface as `None`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Rate limit exceeded for '{key}', retry after {retry_after:?}")]
    RateLimitExceeded { key: String, retry_after: Duration },

    #[error("Inference queue full (capacity {capacity}), retry later")]
    QueueFull { capacity: usize },

    #[error("Task {task_id} timed out after {waited:?}")]
    QueueTimeout { task_id: String, waited: Duration },

    #[error("Inference queue is shut down")]
    QueueClosed,

    #[error("Task {task_id} was cancelled")]
    Cancelled { task_id: String },

    #[error("Session '{id}' not found")]
    SessionNotFound { id: String },

    #[error("Session '{id}' has expired")]
    SessionExpired { id: String },

    #[error("Upstream inference failed for task {task_id}: {message}")]
    UpstreamInference {
        task_id: String,
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Wrap a collaborator failure with the id of the task it broke.
    pub fn upstream(task_id: impl Into<String>, source: BoxError) -> Self {
        Error::UpstreamInference {
            task_id: task_id.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Whether the caller should back off and try again rather than give up.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RateLimitExceeded { .. } | Error::QueueFull { .. } | Error::QueueTimeout { .. }
        )
    }

    /// Back-off hint, when the condition carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

//! Error taxonomy for the pipeline.

use thiserror::Error;

/// Capability a backend failed to declare support for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCapability {
    EmbeddingSearch,
    TextSearch,
    ElementDates,
    DateRangeSearch,
    DomainMappings,
    EntityGraph,
    StructuredSearch,
}

impl std::fmt::Display for BackendCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EmbeddingSearch => "embedding_search",
            Self::TextSearch => "text_search",
            Self::ElementDates => "element_dates",
            Self::DateRangeSearch => "date_range_search",
            Self::DomainMappings => "domain_mappings",
            Self::EntityGraph => "entity_graph",
            Self::StructuredSearch => "structured_search",
        };
        write!(f, "{name}")
    }
}

/// Raised when a query requires capabilities a backend did not declare.
///
/// The "Capability" error kind in the pipeline's error taxonomy: surfaced,
/// never retried.
#[derive(Debug, Error)]
#[error("backend does not support: {}", missing.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "))]
pub struct UnsupportedSearchError {
    pub missing: Vec<BackendCapability>,
}

impl UnsupportedSearchError {
    pub fn new(missing: Vec<BackendCapability>) -> Self {
        Self { missing }
    }
}

/// Leaf error type for pipeline operations that need a typed discriminant
/// (queue state transitions, ontology validation, content-source resolution).
/// Everything else propagates via `anyhow::Result`.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Exception classes/messages the worker treats as non-retryable.
    #[error("critical error ({error_type}): {message}")]
    Critical { error_type: String, message: String },

    /// Retries exhausted for a queue row; terminal, routed to the DLQ.
    #[error("retries exhausted after {retry_count} attempts: {message}")]
    Exhausted { retry_count: i32, message: String },

    /// A transient failure eligible for backoff + retry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Referenced document/element/run does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend lacks a declared capability the caller needs.
    #[error(transparent)]
    Capability(#[from] UnsupportedSearchError),

    /// Content source named in a queue item is not registered.
    #[error("content source not registered: {0}")]
    UnknownContentSource(String),

    /// Ontology configuration failed validation; carries every issue found
    /// (validation is collected, not short-circuited).
    #[error("ontology validation failed: {}", .0.join("; "))]
    InvalidOntology(Vec<String>),
}

impl PipelineError {
    /// Exact critical-error exception class names from the reference implementation
    /// (`document_processor.py`'s `critical_error_types`).
    pub const CRITICAL_ERROR_TYPES: &'static [&'static str] = &[
        "UnsupportedFileFormatError",
        "InvalidDocumentFormatError",
        "CorruptedFileError",
        "ParserConfigurationError",
        "UnsupportedDocumentTypeError",
        "PermissionError",
        "AuthenticationError",
        "AccessDeniedError",
        "ConfigurationError",
        "InvalidConfigError",
    ];

    /// Case-insensitive substrings that mark an error message as critical even when
    /// the error type isn't in `CRITICAL_ERROR_TYPES`.
    pub const CRITICAL_MESSAGES: &'static [&'static str] = &[
        "permission denied",
        "access denied",
        "authentication failed",
        "invalid format",
        "corrupted file",
        "unsupported format",
    ];

    /// Classify a worker-observed failure as critical (immediate DLQ, no retry).
    pub fn is_critical(error_type: &str, message: &str) -> bool {
        if Self::CRITICAL_ERROR_TYPES.contains(&error_type) {
            return true;
        }
        let lower = message.to_lowercase();
        Self::CRITICAL_MESSAGES.iter().any(|needle| lower.contains(needle))
    }
}

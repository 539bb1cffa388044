//! Error types for the kbquery core.
//!
//! Uses `thiserror` for public API error types. Collaborator failures are
//! modelled by [`ExternalError`], which is always branch-local: it is recorded
//! on the branch that produced it and never escapes `answer_query`. The only
//! pipeline-level failures are [`PipelineError`] variants.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// The external collaborator a call was made against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceKind {
    Embedder,
    VectorStore,
    TextGenerator,
    Reranker,
    StructuredQuery,
    Prediction,
    Catalog,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceKind::Embedder => "embedder",
            ServiceKind::VectorStore => "vector_store",
            ServiceKind::TextGenerator => "text_generator",
            ServiceKind::Reranker => "reranker",
            ServiceKind::StructuredQuery => "structured_query",
            ServiceKind::Prediction => "prediction",
            ServiceKind::Catalog => "catalog",
        };
        f.write_str(name)
    }
}

/// Retry class of an [`ExternalError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Timeouts, rate limits, dropped connections. Retried with bounded backoff.
    Transient,
    /// Malformed input, auth failure, rejected queries. Never retried.
    Permanent,
}

/// Errors from calls to external collaborators (embedder, vector store,
/// text generation, reranking model, structured-query and prediction engines).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExternalError {
    #[error("{service} timed out after {timeout_ms}ms")]
    Timeout { service: ServiceKind, timeout_ms: u64 },

    #[error("{service} rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        service: ServiceKind,
        retry_after_secs: u64,
    },

    #[error("{service} connection failed: {message}")]
    Connection { service: ServiceKind, message: String },

    #[error("{service} unavailable: {message}")]
    Unavailable { service: ServiceKind, message: String },

    #[error("{service} rejected input: {message}")]
    InvalidInput { service: ServiceKind, message: String },

    #[error("authentication failed for {service}")]
    AuthFailed { service: ServiceKind },

    #[error("{service} returned malformed output: {message}")]
    Malformed { service: ServiceKind, message: String },

    #[error("{service} rejected the request: {message}")]
    Rejected { service: ServiceKind, message: String },
}

impl ExternalError {
    /// The collaborator that produced this error.
    pub fn service(&self) -> ServiceKind {
        match self {
            ExternalError::Timeout { service, .. }
            | ExternalError::RateLimited { service, .. }
            | ExternalError::Connection { service, .. }
            | ExternalError::Unavailable { service, .. }
            | ExternalError::InvalidInput { service, .. }
            | ExternalError::AuthFailed { service }
            | ExternalError::Malformed { service, .. }
            | ExternalError::Rejected { service, .. } => *service,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ExternalError::Timeout { .. }
            | ExternalError::RateLimited { .. }
            | ExternalError::Connection { .. }
            | ExternalError::Unavailable { .. } => ErrorClass::Transient,
            ExternalError::InvalidInput { .. }
            | ExternalError::AuthFailed { .. }
            | ExternalError::Malformed { .. }
            | ExternalError::Rejected { .. } => ErrorClass::Permanent,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// The failure concerns one input (oversized, unparsable) rather than the
    /// collaborator itself, so other inputs in the same batch may still succeed.
    pub fn is_input_specific(&self) -> bool {
        matches!(
            self,
            ExternalError::InvalidInput { .. } | ExternalError::Malformed { .. }
        )
    }

    pub fn unavailable(service: ServiceKind, message: impl Into<String>) -> Self {
        ExternalError::Unavailable {
            service,
            message: message.into(),
        }
    }

    pub fn malformed(service: ServiceKind, message: impl Into<String>) -> Self {
        ExternalError::Malformed {
            service,
            message: message.into(),
        }
    }

    pub fn invalid_input(service: ServiceKind, message: impl Into<String>) -> Self {
        ExternalError::InvalidInput {
            service,
            message: message.into(),
        }
    }

    /// Classify an opaque collaborator error message.
    ///
    /// Collaborators wrapping foreign clients (SQL agents, HTTP model servers)
    /// often only surface a message. Known timeout and rate-limit phrasing is
    /// transient; SQL-engine rejections and parse failures are permanent;
    /// anything unrecognised is treated as a transient outage.
    pub fn from_message(service: ServiceKind, message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        let contains_any = |patterns: &[&str]| patterns.iter().any(|p| lowered.contains(p));

        if contains_any(&["timed out", "timeout", "time limit", "iteration limit"]) {
            ExternalError::Timeout {
                service,
                timeout_ms: 0,
            }
        } else if contains_any(&["rate limit", "429", "too many requests"]) {
            ExternalError::RateLimited {
                service,
                retry_after_secs: 0,
            }
        } else if contains_any(&["syntax error", "does not exist", "permission denied"]) {
            ExternalError::Rejected { service, message }
        } else if contains_any(&["could not parse", "parsing error", "invalid format"]) {
            ExternalError::Malformed { service, message }
        } else if contains_any(&["unauthorized", "401", "invalid api key"]) {
            ExternalError::AuthFailed { service }
        } else {
            ExternalError::Unavailable { service, message }
        }
    }
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::ParseError {
            message: err.to_string(),
        }
    }
}

/// Pipeline-level failures. Everything else degrades into the bundle's
/// diagnostics instead of failing the query.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid query: {reason}")]
    InvalidQuery { reason: String },

    #[error("Query was cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// A type alias for results using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_external() {
        let err = ExternalError::Timeout {
            service: ServiceKind::VectorStore,
            timeout_ms: 5000,
        };
        assert_eq!(err.to_string(), "vector_store timed out after 5000ms");

        let err = ExternalError::Rejected {
            service: ServiceKind::StructuredQuery,
            message: "relation \"sales\" does not exist".into(),
        };
        assert_eq!(
            err.to_string(),
            "structured_query rejected the request: relation \"sales\" does not exist"
        );
    }

    #[test]
    fn test_error_display_pipeline() {
        let err = PipelineError::InvalidQuery {
            reason: "collection_id is empty".into(),
        };
        assert_eq!(err.to_string(), "Invalid query: collection_id is empty");
        assert_eq!(PipelineError::Cancelled.to_string(), "Query was cancelled");
    }

    #[test]
    fn test_error_class() {
        assert!(
            ExternalError::RateLimited {
                service: ServiceKind::TextGenerator,
                retry_after_secs: 3
            }
            .is_transient()
        );
        assert!(ExternalError::unavailable(ServiceKind::Reranker, "model not loaded").is_transient());
        assert_eq!(
            ExternalError::AuthFailed {
                service: ServiceKind::Embedder
            }
            .class(),
            ErrorClass::Permanent
        );
        assert_eq!(
            ExternalError::malformed(ServiceKind::TextGenerator, "empty").class(),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn test_input_specific_errors() {
        assert!(ExternalError::invalid_input(ServiceKind::Reranker, "passage too long").is_input_specific());
        assert!(ExternalError::malformed(ServiceKind::Reranker, "bad tokens").is_input_specific());
        assert!(!ExternalError::AuthFailed { service: ServiceKind::Reranker }.is_input_specific());
        assert!(!ExternalError::unavailable(ServiceKind::Reranker, "down").is_input_specific());
    }

    #[test]
    fn test_from_message_classification() {
        let svc = ServiceKind::StructuredQuery;
        assert!(matches!(
            ExternalError::from_message(svc, "Agent stopped due to iteration limit or time limit"),
            ExternalError::Timeout { .. }
        ));
        assert!(matches!(
            ExternalError::from_message(svc, "HTTP 429 Too Many Requests"),
            ExternalError::RateLimited { .. }
        ));
        assert!(matches!(
            ExternalError::from_message(svc, "ERROR: syntax error at or near \"FROM\""),
            ExternalError::Rejected { .. }
        ));
        assert!(matches!(
            ExternalError::from_message(svc, "Could not parse LLM output"),
            ExternalError::Malformed { .. }
        ));
        assert!(matches!(
            ExternalError::from_message(svc, "socket closed"),
            ExternalError::Unavailable { .. }
        ));
        assert_eq!(ExternalError::from_message(svc, "whatever").service(), svc);
    }

    #[test]
    fn test_service_kind_serde() {
        let json = serde_json::to_string(&ServiceKind::VectorStore).unwrap();
        assert_eq!(json, "\"vector_store\"");
    }
}

//! Unified error taxonomy with stable error codes for Task MCP.
//!
//! Every domain error carries an [`ErrorCode`] (a machine-readable, stable
//! string tag), a human-readable message, an optional remediation hint, an
//! optional cause chain, and arbitrary key-value context.  Use the builder
//! returned by [`TaskError::new`] to construct errors fluently.
//!
//! The taxonomy is closed: transports map each code to an HTTP status and a
//! JSON-RPC error code through pure functions on [`ErrorCode`], so the
//! error-to-status translation lives in exactly one place.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod correlation;

pub use correlation::CorrelationId;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// ErrorCategory
// ---------------------------------------------------------------------------

/// Broad family that an [`ErrorCode`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed input: slugs, params, change shape.
    Validation,
    /// Sandbox escapes and authentication failures.
    Security,
    /// Lock contention on a change directory.
    Concurrency,
    /// An external collaborator (templater) failed.
    Dependency,
    /// Filesystem, subprocess, or timeout failures.
    System,
    /// Response-size and rate-limit ceilings.
    Quota,
    /// The server is at its concurrent-request cap.
    Capacity,
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Security => "security",
            Self::Concurrency => "concurrency",
            Self::Dependency => "dependency",
            Self::System => "system",
            Self::Quota => "quota",
            Self::Capacity => "capacity",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Operator-facing severity attached to every error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Routine client mistakes.
    Low,
    /// Degraded but expected conditions (contention, throttling).
    Medium,
    /// Conditions that need operator attention.
    High,
    /// The process is in an unexpected state.
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ErrorCode
// ---------------------------------------------------------------------------

/// Machine-readable, stable error code.
///
/// Each variant serialises to the exact wire tag (e.g. `"EBADSLUG"`) that is
/// guaranteed not to change across patch releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    // -- Validation --
    /// Slug does not match the slug grammar.
    #[serde(rename = "EBADSLUG")]
    BadSlug,
    /// `proposal.md` is missing from the change directory.
    #[serde(rename = "EBADSHAPE_PROPOSAL_MISSING")]
    ShapeProposalMissing,
    /// `tasks.md` is missing from the change directory.
    #[serde(rename = "EBADSHAPE_TASKS_MISSING")]
    ShapeTasksMissing,
    /// A required file exists but is empty.
    #[serde(rename = "EBADSHAPE_CONTENT_EMPTY")]
    ShapeContentEmpty,
    /// `tasks.md` has no checklist items.
    #[serde(rename = "EBADSHAPE_TASKS_NO_STRUCTURE")]
    ShapeTasksNoStructure,
    /// File contents match the fixed byte deny-list.
    #[serde(rename = "EBADSHAPE_SECURITY_VIOLATION")]
    ShapeSecurityViolation,
    /// A file in the change directory exceeds the per-file cap.
    #[serde(rename = "EBADSHAPE_FILE_TOO_LARGE")]
    ShapeFileTooLarge,
    /// The requested RPC method is not part of the protocol.
    #[serde(rename = "METHOD_NOT_FOUND")]
    MethodNotFound,

    // -- Security --
    /// A path resolved outside the sandbox prefix.
    #[serde(rename = "EPATH_TRAVERSAL")]
    PathTraversal,
    /// Symlink expansion exceeded the cycle bound.
    #[serde(rename = "ESYMLINK_CYCLE")]
    SymlinkCycle,
    /// No credentials were supplied and auth is enabled.
    #[serde(rename = "AUTH_MISSING")]
    AuthMissing,
    /// Supplied credentials did not match any configured token.
    #[serde(rename = "AUTH_INVALID")]
    AuthInvalid,

    // -- Concurrency --
    /// Another owner holds a live lock on the change.
    #[serde(rename = "ELOCKED")]
    Locked,
    /// A stale lock was scavenged but the retry lost the race.
    #[serde(rename = "ELOCK_STALE_REMOVED")]
    LockStaleRemoved,

    // -- Dependency --
    /// The templater failed to materialise the change.
    #[serde(rename = "ETEMPLATE")]
    Template,

    // -- System --
    /// Filesystem operation failed.
    #[serde(rename = "EIO")]
    Io,
    /// An operation exceeded its deadline.
    #[serde(rename = "ETIMEOUT")]
    Timeout,

    // -- Quota / capacity --
    /// Accumulated response body exceeded the configured cap.
    #[serde(rename = "RESPONSE_TOO_LARGE")]
    ResponseTooLarge,
    /// The caller exceeded its request budget.
    #[serde(rename = "RATE_LIMITED")]
    RateLimited,
    /// The server is at its concurrent-request cap.
    #[serde(rename = "SERVER_BUSY")]
    ServerBusy,

    // -- Internal --
    /// Catch-all for unexpected internal errors.
    #[serde(rename = "INTERNAL_ERROR")]
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::BadSlug
            | Self::ShapeProposalMissing
            | Self::ShapeTasksMissing
            | Self::ShapeContentEmpty
            | Self::ShapeTasksNoStructure
            | Self::ShapeSecurityViolation
            | Self::ShapeFileTooLarge
            | Self::MethodNotFound => ErrorCategory::Validation,

            Self::PathTraversal | Self::SymlinkCycle | Self::AuthMissing | Self::AuthInvalid => {
                ErrorCategory::Security
            }

            Self::Locked | Self::LockStaleRemoved => ErrorCategory::Concurrency,

            Self::Template => ErrorCategory::Dependency,

            Self::Io | Self::Timeout => ErrorCategory::System,

            Self::ResponseTooLarge | Self::RateLimited => ErrorCategory::Quota,

            Self::ServerBusy => ErrorCategory::Capacity,

            Self::Internal => ErrorCategory::Internal,
        }
    }

    /// Whether a client may retry the failed operation unchanged.
    ///
    /// `ELOCKED` and `RATE_LIMITED` become retryable once their TTL or
    /// window elapses; transient system failures are retryable immediately.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::Locked
                | Self::LockStaleRemoved
                | Self::Io
                | Self::Timeout
                | Self::RateLimited
                | Self::ServerBusy
        )
    }

    /// Operator-facing severity for this code.
    pub fn severity(&self) -> Severity {
        match self {
            Self::BadSlug
            | Self::ShapeProposalMissing
            | Self::ShapeTasksMissing
            | Self::ShapeContentEmpty
            | Self::ShapeTasksNoStructure
            | Self::ShapeFileTooLarge
            | Self::MethodNotFound
            | Self::LockStaleRemoved
            | Self::RateLimited => Severity::Low,

            Self::Locked
            | Self::AuthMissing
            | Self::AuthInvalid
            | Self::Timeout
            | Self::ResponseTooLarge
            | Self::ServerBusy => Severity::Medium,

            Self::PathTraversal
            | Self::SymlinkCycle
            | Self::ShapeSecurityViolation
            | Self::Template
            | Self::Io => Severity::High,

            Self::Internal => Severity::Critical,
        }
    }

    /// The HTTP status code this error surfaces as.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadSlug
            | Self::ShapeProposalMissing
            | Self::ShapeTasksMissing
            | Self::ShapeContentEmpty
            | Self::ShapeTasksNoStructure
            | Self::ShapeSecurityViolation
            | Self::ShapeFileTooLarge
            | Self::MethodNotFound => 400,

            Self::AuthMissing => 401,
            Self::PathTraversal | Self::SymlinkCycle | Self::AuthInvalid => 403,

            Self::Locked | Self::LockStaleRemoved => 409,

            Self::ResponseTooLarge => 413,
            Self::RateLimited => 429,

            Self::Template | Self::Io | Self::Internal => 500,
            Self::ServerBusy => 503,
            Self::Timeout => 504,
        }
    }

    /// The JSON-RPC error code this error surfaces as on the stdio
    /// transport.
    ///
    /// Validation failures map to `-32602` (invalid params), unknown methods
    /// to `-32601`, and everything else to the implementation-defined
    /// `-32000` with the taxonomy tag carried in `error.data.code`.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::MethodNotFound => -32601,
            c if c.category() == ErrorCategory::Validation => -32602,
            _ => -32000,
        }
    }

    /// Stable `&'static str` representation of the code (e.g. `"EBADSLUG"`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadSlug => "EBADSLUG",
            Self::ShapeProposalMissing => "EBADSHAPE_PROPOSAL_MISSING",
            Self::ShapeTasksMissing => "EBADSHAPE_TASKS_MISSING",
            Self::ShapeContentEmpty => "EBADSHAPE_CONTENT_EMPTY",
            Self::ShapeTasksNoStructure => "EBADSHAPE_TASKS_NO_STRUCTURE",
            Self::ShapeSecurityViolation => "EBADSHAPE_SECURITY_VIOLATION",
            Self::ShapeFileTooLarge => "EBADSHAPE_FILE_TOO_LARGE",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::PathTraversal => "EPATH_TRAVERSAL",
            Self::SymlinkCycle => "ESYMLINK_CYCLE",
            Self::AuthMissing => "AUTH_MISSING",
            Self::AuthInvalid => "AUTH_INVALID",
            Self::Locked => "ELOCKED",
            Self::LockStaleRemoved => "ELOCK_STALE_REMOVED",
            Self::Template => "ETEMPLATE",
            Self::Io => "EIO",
            Self::Timeout => "ETIMEOUT",
            Self::ResponseTooLarge => "RESPONSE_TOO_LARGE",
            Self::RateLimited => "RATE_LIMITED",
            Self::ServerBusy => "SERVER_BUSY",
            Self::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// TaskError
// ---------------------------------------------------------------------------

/// Unified Task MCP error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// remediation hint, an optional source error for cause-chaining, and
/// arbitrary structured context.
///
/// # Builder usage
///
/// ```
/// use tmcp_error::{ErrorCode, TaskError};
///
/// let err = TaskError::new(ErrorCode::Locked, "change 'add-x' is locked")
///     .with_hint("retry after the holder's TTL lapses")
///     .with_context("holder", "pid-42@host")
///     .with_context("remaining_seconds", 57);
/// ```
pub struct TaskError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional remediation hint for the caller.
    pub hint: Option<String>,
    /// Arbitrary structured context for diagnostics.
    pub context: BTreeMap<String, serde_json::Value>,
    /// Optional underlying cause.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl TaskError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
            context: BTreeMap::new(),
            source: None,
        }
    }

    /// Attach a remediation hint.
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Attach a key-value pair to the diagnostic context.
    ///
    /// The value is converted via [`serde_json::to_value`]; if serialisation
    /// fails, the entry is silently skipped.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.retryable()`.
    pub fn retryable(&self) -> bool {
        self.code.retryable()
    }

    /// Shorthand for `self.code.severity()`.
    pub fn severity(&self) -> Severity {
        self.code.severity()
    }

    /// Wrap a filesystem failure as `EIO`, preserving the cause.
    pub fn io(message: impl Into<String>, err: std::io::Error) -> Self {
        Self::new(ErrorCode::Io, message).with_source(err)
    }

    /// Catch-all constructor for unexpected internal states.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("TaskError");
        d.field("code", &self.code);
        d.field("message", &self.message);
        if let Some(ref hint) = self.hint {
            d.field("hint", hint);
        }
        if !self.context.is_empty() {
            d.field("context", &self.context);
        }
        if let Some(ref src) = self.source {
            d.field("source", &src.to_string());
        }
        d.finish()
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)?;
        if !self.context.is_empty() {
            // Deterministic output thanks to BTreeMap.
            if let Ok(ctx) = serde_json::to_string(&self.context) {
                write!(f, " {ctx}")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

// ---------------------------------------------------------------------------
// Serialization support
// ---------------------------------------------------------------------------

/// Serialisable snapshot of a [`TaskError`] (without the opaque source).
///
/// This is the shape carried in terminal `error` events and JSON-RPC
/// `error.data` payloads; `retryable` and `severity` are denormalised so
/// clients need no taxonomy table of their own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskErrorDto {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Remediation hint, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// Whether the operation may be retried unchanged.
    pub retryable: bool,
    /// Operator-facing severity.
    pub severity: Severity,
    /// Correlation ID of the request that produced the error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Structured context.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, serde_json::Value>,
}

impl TaskErrorDto {
    /// Build a DTO from an error plus the request's correlation ID.
    pub fn from_error(err: &TaskError, correlation_id: &CorrelationId) -> Self {
        let mut dto: Self = err.into();
        dto.correlation_id = Some(correlation_id.to_string());
        dto
    }
}

impl From<&TaskError> for TaskErrorDto {
    fn from(err: &TaskError) -> Self {
        Self {
            code: err.code,
            message: err.message.clone(),
            hint: err.hint.clone(),
            retryable: err.retryable(),
            severity: err.severity(),
            correlation_id: None,
            context: err.context.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::io;

    /// All error codes for exhaustive iteration in tests.
    const ALL_CODES: &[ErrorCode] = &[
        ErrorCode::BadSlug,
        ErrorCode::ShapeProposalMissing,
        ErrorCode::ShapeTasksMissing,
        ErrorCode::ShapeContentEmpty,
        ErrorCode::ShapeTasksNoStructure,
        ErrorCode::ShapeSecurityViolation,
        ErrorCode::ShapeFileTooLarge,
        ErrorCode::MethodNotFound,
        ErrorCode::PathTraversal,
        ErrorCode::SymlinkCycle,
        ErrorCode::AuthMissing,
        ErrorCode::AuthInvalid,
        ErrorCode::Locked,
        ErrorCode::LockStaleRemoved,
        ErrorCode::Template,
        ErrorCode::Io,
        ErrorCode::Timeout,
        ErrorCode::ResponseTooLarge,
        ErrorCode::RateLimited,
        ErrorCode::ServerBusy,
        ErrorCode::Internal,
    ];

    // -- Construction & Display -----------------------------------------

    #[test]
    fn basic_construction() {
        let err = TaskError::new(ErrorCode::Internal, "boom");
        assert_eq!(err.code, ErrorCode::Internal);
        assert_eq!(err.message, "boom");
        assert!(err.hint.is_none());
        assert!(err.source.is_none());
        assert!(err.context.is_empty());
    }

    #[test]
    fn display_without_context() {
        let err = TaskError::new(ErrorCode::BadSlug, "slug rejected");
        assert_eq!(err.to_string(), "[EBADSLUG] slug rejected");
    }

    #[test]
    fn display_with_context() {
        let err =
            TaskError::new(ErrorCode::Locked, "held").with_context("remaining_seconds", 42);
        let s = err.to_string();
        assert!(s.starts_with("[ELOCKED] held"));
        assert!(s.contains("remaining_seconds"));
        assert!(s.contains("42"));
    }

    #[test]
    fn debug_with_source() {
        let src = io::Error::new(io::ErrorKind::NotFound, "file missing");
        let err = TaskError::io("rename failed", src);
        let dbg = format!("{err:?}");
        assert!(dbg.contains("source"));
        assert!(dbg.contains("file missing"));
    }

    // -- Categorisation --------------------------------------------------

    #[test]
    fn validation_codes_categorised() {
        assert_eq!(ErrorCode::BadSlug.category(), ErrorCategory::Validation);
        assert_eq!(
            ErrorCode::ShapeTasksNoStructure.category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            ErrorCode::MethodNotFound.category(),
            ErrorCategory::Validation
        );
    }

    #[test]
    fn security_codes_categorised() {
        for code in [
            ErrorCode::PathTraversal,
            ErrorCode::SymlinkCycle,
            ErrorCode::AuthMissing,
            ErrorCode::AuthInvalid,
        ] {
            assert_eq!(code.category(), ErrorCategory::Security);
        }
    }

    #[test]
    fn concurrency_codes_categorised() {
        assert_eq!(ErrorCode::Locked.category(), ErrorCategory::Concurrency);
        assert_eq!(
            ErrorCode::LockStaleRemoved.category(),
            ErrorCategory::Concurrency
        );
    }

    // -- Retry classification --------------------------------------------

    #[test]
    fn retryable_matches_taxonomy_table() {
        let retryable: Vec<&str> = ALL_CODES
            .iter()
            .filter(|c| c.retryable())
            .map(|c| c.as_str())
            .collect();
        assert_eq!(
            retryable,
            vec![
                "ELOCKED",
                "ELOCK_STALE_REMOVED",
                "EIO",
                "ETIMEOUT",
                "RATE_LIMITED",
                "SERVER_BUSY",
            ]
        );
    }

    // -- HTTP / JSON-RPC surfacing ----------------------------------------

    #[test]
    fn http_status_matches_taxonomy_table() {
        assert_eq!(ErrorCode::BadSlug.http_status(), 400);
        assert_eq!(ErrorCode::PathTraversal.http_status(), 403);
        assert_eq!(ErrorCode::SymlinkCycle.http_status(), 403);
        assert_eq!(ErrorCode::Locked.http_status(), 409);
        assert_eq!(ErrorCode::ShapeContentEmpty.http_status(), 400);
        assert_eq!(ErrorCode::Template.http_status(), 500);
        assert_eq!(ErrorCode::Io.http_status(), 500);
        assert_eq!(ErrorCode::Timeout.http_status(), 504);
        assert_eq!(ErrorCode::ResponseTooLarge.http_status(), 413);
        assert_eq!(ErrorCode::RateLimited.http_status(), 429);
        assert_eq!(ErrorCode::AuthMissing.http_status(), 401);
        assert_eq!(ErrorCode::AuthInvalid.http_status(), 403);
        assert_eq!(ErrorCode::ServerBusy.http_status(), 503);
        assert_eq!(ErrorCode::Internal.http_status(), 500);
    }

    #[test]
    fn jsonrpc_codes() {
        assert_eq!(ErrorCode::MethodNotFound.jsonrpc_code(), -32601);
        assert_eq!(ErrorCode::BadSlug.jsonrpc_code(), -32602);
        assert_eq!(ErrorCode::ShapeTasksMissing.jsonrpc_code(), -32602);
        assert_eq!(ErrorCode::Locked.jsonrpc_code(), -32000);
        assert_eq!(ErrorCode::Internal.jsonrpc_code(), -32000);
    }

    // -- Severity ---------------------------------------------------------

    #[test]
    fn severity_ordering() {
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn internal_is_critical() {
        assert_eq!(ErrorCode::Internal.severity(), Severity::Critical);
    }

    #[test]
    fn sandbox_escapes_are_high_severity() {
        assert_eq!(ErrorCode::PathTraversal.severity(), Severity::High);
        assert_eq!(ErrorCode::ShapeSecurityViolation.severity(), Severity::High);
    }

    // -- Serde ------------------------------------------------------------

    #[test]
    fn all_codes_serialize_to_as_str() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let expected = format!(r#""{}""#, code.as_str());
            assert_eq!(json, expected, "mismatch for {code:?}");
        }
    }

    #[test]
    fn all_codes_have_unique_as_str() {
        let mut seen = HashSet::new();
        for code in ALL_CODES {
            let s = code.as_str();
            assert!(seen.insert(s), "duplicate as_str value: {s}");
        }
        assert_eq!(seen.len(), ALL_CODES.len());
    }

    #[test]
    fn error_code_count() {
        // Ensure we don't silently drop a variant from ALL_CODES.
        assert_eq!(ALL_CODES.len(), 21);
    }

    #[test]
    fn error_code_serde_roundtrip() {
        for code in ALL_CODES {
            let json = serde_json::to_string(code).unwrap();
            let back: ErrorCode = serde_json::from_str(&json).unwrap();
            assert_eq!(back, *code);
        }
    }

    #[test]
    fn dto_carries_hint_and_retryability() {
        let err = TaskError::new(ErrorCode::Locked, "held by pid-9@host")
            .with_hint("retry after 30s")
            .with_context("holder", "pid-9@host");
        let dto: TaskErrorDto = (&err).into();
        assert_eq!(dto.code, ErrorCode::Locked);
        assert!(dto.retryable);
        assert_eq!(dto.severity, Severity::Medium);
        assert_eq!(dto.hint.as_deref(), Some("retry after 30s"));
        let json = serde_json::to_value(&dto).unwrap();
        assert_eq!(json["code"], "ELOCKED");
        assert_eq!(json["context"]["holder"], "pid-9@host");
    }

    #[test]
    fn dto_with_correlation_id() {
        let cid = CorrelationId::generate();
        let err = TaskError::new(ErrorCode::Timeout, "git probe exceeded 10s");
        let dto = TaskErrorDto::from_error(&err, &cid);
        assert_eq!(dto.correlation_id.as_deref(), Some(cid.as_str()));
    }

    #[test]
    fn dto_omits_empty_optionals() {
        let err = TaskError::new(ErrorCode::BadSlug, "bad");
        let dto: TaskErrorDto = (&err).into();
        let json = serde_json::to_string(&dto).unwrap();
        assert!(!json.contains("hint"));
        assert!(!json.contains("correlationId"));
        assert!(!json.contains("context"));
    }

    // -- Error chain ------------------------------------------------------

    #[test]
    fn std_error_source_chain() {
        let inner = io::Error::new(io::ErrorKind::NotFound, "not found");
        let err = TaskError::io("read proposal.md", inner);
        let src = std::error::Error::source(&err).unwrap();
        assert_eq!(src.to_string(), "not found");
    }
}

//! Unified error taxonomy with stable error codes for the knowledge graph
//! control plane.
//!
//! Every error that can cross a crate boundary carries an [`ErrorCode`] (a
//! machine-readable, stable tag), a human-readable message, an optional
//! cause, and arbitrary key-value context. [`ErrorCode::category`] maps
//! directly onto the HTTP status taxonomy the daemon exposes.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Broad family an [`ErrorCode`] belongs to, corresponding 1:1 with an HTTP
/// status class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Malformed input, missing fields, unknown enum value. HTTP 400.
    Validation,
    /// Missing or invalid bearer token. HTTP 401.
    Authentication,
    /// The authorisation kernel denied the action. HTTP 403.
    Authorization,
    /// Job/artifact/resource absent. HTTP 404.
    NotFound,
    /// Dedup rejection or state-machine violation. HTTP 409.
    Conflict,
    /// Integrity-check failure or incompatible schema version. HTTP 422.
    Unprocessable,
    /// Server-side throttling. HTTP 429.
    RateLimited,
    /// LLM/embedding provider failure after retries. HTTP 502.
    ProviderError,
    /// Checkpoint restored, operation aborted. HTTP 500.
    Integrity,
    /// Catch-all for unexpected internal errors. HTTP 500.
    Unexpected,
}

impl ErrorCategory {
    /// The HTTP status code this category maps onto.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Authentication => 401,
            Self::Authorization => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Unprocessable => 422,
            Self::RateLimited => 429,
            Self::ProviderError => 502,
            Self::Integrity | Self::Unexpected => 500,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Unprocessable => "unprocessable",
            Self::RateLimited => "rate_limited",
            Self::ProviderError => "provider_error",
            Self::Integrity => "integrity",
            Self::Unexpected => "unexpected",
        };
        f.write_str(s)
    }
}

/// Machine-readable, stable error code. Serialises to `SCREAMING_SNAKE_CASE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // -- Validation --
    /// Request body failed schema/shape validation.
    ValidationMalformedInput,
    /// A required field was missing.
    ValidationMissingField,
    /// An enum field held a value outside the recognised set.
    ValidationUnknownVariant,

    // -- Authentication --
    /// No bearer token was presented where one is required.
    AuthenticationMissingToken,
    /// The bearer token failed validation (expired, revoked, malformed).
    AuthenticationInvalidToken,

    // -- Authorization --
    /// The authorisation kernel denied the requested action.
    AuthorizationDenied,

    // -- NotFound --
    /// No job exists with the given ID.
    NotFoundJob,
    /// No artifact exists with the given ID.
    NotFoundArtifact,
    /// No such resource / route target exists.
    NotFoundResource,
    /// An artifact's metadata row exists but its blob payload is absent.
    NotFoundArtifactPayload,

    // -- Conflict --
    /// A non-terminal job already exists for this `(content_hash, ontology)`.
    ConflictDuplicateJob,
    /// The requested state transition is not valid from the job's current state.
    ConflictInvalidTransition,

    // -- Unprocessable --
    /// Checkpoint integrity check failed after a risky operation.
    UnprocessableIntegrityCheckFailed,
    /// A backup/restore payload carries a schema version this build cannot read.
    UnprocessableIncompatibleSchema,

    // -- RateLimited --
    /// Server-side request throttling rejected the call.
    RateLimitedServer,

    // -- ProviderError --
    /// The LLM/embedding provider was rate-limited and retries were exhausted.
    ProviderRateLimited,
    /// The LLM/embedding provider was unreachable or returned a server error.
    ProviderUnavailable,
    /// The LLM/embedding provider returned a response this system could not parse.
    ProviderMalformedResponse,

    // -- Integrity --
    /// A checkpoint-guarded operation failed and state was rolled back.
    IntegrityRollback,

    // -- Unexpected --
    /// Catch-all for unexpected internal errors.
    Internal,
}

impl ErrorCode {
    /// Returns the broad [`ErrorCategory`] this code belongs to.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        use ErrorCode as C;
        match self {
            C::ValidationMalformedInput | C::ValidationMissingField | C::ValidationUnknownVariant => {
                ErrorCategory::Validation
            }
            C::AuthenticationMissingToken | C::AuthenticationInvalidToken => {
                ErrorCategory::Authentication
            }
            C::AuthorizationDenied => ErrorCategory::Authorization,
            C::NotFoundJob | C::NotFoundArtifact | C::NotFoundResource | C::NotFoundArtifactPayload => {
                ErrorCategory::NotFound
            }
            C::ConflictDuplicateJob | C::ConflictInvalidTransition => ErrorCategory::Conflict,
            C::UnprocessableIntegrityCheckFailed | C::UnprocessableIncompatibleSchema => {
                ErrorCategory::Unprocessable
            }
            C::RateLimitedServer => ErrorCategory::RateLimited,
            C::ProviderRateLimited | C::ProviderUnavailable | C::ProviderMalformedResponse => {
                ErrorCategory::ProviderError
            }
            C::IntegrityRollback => ErrorCategory::Integrity,
            C::Internal => ErrorCategory::Unexpected,
        }
    }

    /// Stable `&'static str` representation (e.g. `"NOT_FOUND_JOB"`).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        use ErrorCode as C;
        match self {
            C::ValidationMalformedInput => "VALIDATION_MALFORMED_INPUT",
            C::ValidationMissingField => "VALIDATION_MISSING_FIELD",
            C::ValidationUnknownVariant => "VALIDATION_UNKNOWN_VARIANT",
            C::AuthenticationMissingToken => "AUTHENTICATION_MISSING_TOKEN",
            C::AuthenticationInvalidToken => "AUTHENTICATION_INVALID_TOKEN",
            C::AuthorizationDenied => "AUTHORIZATION_DENIED",
            C::NotFoundJob => "NOT_FOUND_JOB",
            C::NotFoundArtifact => "NOT_FOUND_ARTIFACT",
            C::NotFoundResource => "NOT_FOUND_RESOURCE",
            C::NotFoundArtifactPayload => "NOT_FOUND_ARTIFACT_PAYLOAD",
            C::ConflictDuplicateJob => "CONFLICT_DUPLICATE_JOB",
            C::ConflictInvalidTransition => "CONFLICT_INVALID_TRANSITION",
            C::UnprocessableIntegrityCheckFailed => "UNPROCESSABLE_INTEGRITY_CHECK_FAILED",
            C::UnprocessableIncompatibleSchema => "UNPROCESSABLE_INCOMPATIBLE_SCHEMA",
            C::RateLimitedServer => "RATE_LIMITED_SERVER",
            C::ProviderRateLimited => "PROVIDER_RATE_LIMITED",
            C::ProviderUnavailable => "PROVIDER_UNAVAILABLE",
            C::ProviderMalformedResponse => "PROVIDER_MALFORMED_RESPONSE",
            C::IntegrityRollback => "INTEGRITY_ROLLBACK",
            C::Internal => "INTERNAL",
        }
    }

    /// `true` for provider errors the caller may retry locally with backoff.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ProviderRateLimited | Self::ProviderUnavailable)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified control-plane error.
///
/// Carries a stable [`ErrorCode`], a human-readable message, an optional
/// source error, and arbitrary structured diagnostic context. No provider
/// internals or stack traces are ever serialised into the wire
/// representation ([`KgError::to_api_error`]) — only `code` and `message`.
#[derive(Debug)]
pub struct KgError {
    /// Machine-readable error code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional underlying cause, not serialised.
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Arbitrary structured context for logs (not sent to clients).
    pub context: BTreeMap<String, serde_json::Value>,
}

impl KgError {
    /// Create a new error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
            context: BTreeMap::new(),
        }
    }

    /// Attach a key-value pair to the diagnostic context. Silently skipped if
    /// `value` fails to serialise.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Attach an underlying cause.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Shorthand for `self.code.category()`.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Shorthand for `self.code.category().http_status()`.
    #[must_use]
    pub fn http_status(&self) -> u16 {
        self.category().http_status()
    }

    /// Convert to the wire-safe [`ApiError`] envelope (§7 "no provider
    /// internals leak").
    #[must_use]
    pub fn to_api_error(&self) -> ApiError {
        ApiError {
            error: self.code.as_str().to_string(),
            detail: Some(self.message.clone()),
        }
    }
}

impl fmt::Display for KgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for KgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

/// Wire-safe error envelope returned by the HTTP surface: `{error, detail?}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    /// Stable machine-readable error code string.
    pub error: String,
    /// Optional human-readable detail. Never contains provider internals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_maps_to_expected_http_status() {
        assert_eq!(ErrorCategory::Validation.http_status(), 400);
        assert_eq!(ErrorCategory::Authentication.http_status(), 401);
        assert_eq!(ErrorCategory::Authorization.http_status(), 403);
        assert_eq!(ErrorCategory::NotFound.http_status(), 404);
        assert_eq!(ErrorCategory::Conflict.http_status(), 409);
        assert_eq!(ErrorCategory::Unprocessable.http_status(), 422);
        assert_eq!(ErrorCategory::RateLimited.http_status(), 429);
        assert_eq!(ErrorCategory::ProviderError.http_status(), 502);
        assert_eq!(ErrorCategory::Integrity.http_status(), 500);
        assert_eq!(ErrorCategory::Unexpected.http_status(), 500);
    }

    #[test]
    fn duplicate_job_is_a_conflict() {
        let err = KgError::new(ErrorCode::ConflictDuplicateJob, "job already in flight");
        assert_eq!(err.http_status(), 409);
    }

    #[test]
    fn provider_rate_limit_is_retryable_but_malformed_response_is_not() {
        assert!(ErrorCode::ProviderRateLimited.is_retryable());
        assert!(ErrorCode::ProviderUnavailable.is_retryable());
        assert!(!ErrorCode::ProviderMalformedResponse.is_retryable());
    }

    #[test]
    fn api_error_never_serialises_source_or_context() {
        let err = KgError::new(ErrorCode::Internal, "boom")
            .with_context("secret", "do-not-leak")
            .with_source(std::io::Error::other("cause"));
        let api = err.to_api_error();
        let json = serde_json::to_string(&api).unwrap();
        assert!(!json.contains("do-not-leak"));
        assert!(!json.contains("cause"));
    }
}

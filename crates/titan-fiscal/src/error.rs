//! # Fiscal Error Types
//!
//! Two layers of errors live here:
//!
//! - [`FiscalError`]: crate-level failures of an operation (bad config,
//!   database down, invalid sale id). Returned by `enqueue`, `status`,
//!   `run_batch` and friends.
//! - [`Failure`]: the outcome of one fiscal *attempt* for one job. The
//!   dispatcher branches on its tag to pick the retry or terminal transition.
//!
//! ## Attempt Failure Taxonomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Failure                                        │
//! │                                                                         │
//! │  ┌──────────────────────────────┐  ┌──────────────────────────────┐    │
//! │  │  Retryable                   │  │  Terminal                    │    │
//! │  │  (job goes back to pending)  │  │  (job fails immediately)     │    │
//! │  │                              │  │                              │    │
//! │  │  Timeout                     │  │  Rejected (authority msgs)   │    │
//! │  │  Network                     │  │  Credentials                 │    │
//! │  │  Service (502/503/504, 501)  │  │  Build (no call was made)    │    │
//! │  │  StaleTicket                 │  │  Protocol (malformed reply)  │    │
//! │  │  Storage                     │  │  MissingSale                 │    │
//! │  └──────────────────────────────┘  └──────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use thiserror::Error;

use titan_core::{AuthorityMessage, BuildError, JobError, ValidationError, VoucherAttempt};

/// Result type alias for fiscal operations.
pub type FiscalResult<T> = Result<T, FiscalError>;

// =============================================================================
// Fiscal Error
// =============================================================================

/// Operation-level error for the fiscal pipeline.
#[derive(Debug, Error)]
pub enum FiscalError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid fiscal configuration.
    #[error("Invalid fiscal configuration: {0}")]
    InvalidConfig(String),

    /// Invalid authority or redis URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// The signing key could not be read or parsed.
    ///
    /// ## When This Occurs
    /// - `signing_key_path` points to a missing file
    /// - The PEM is not an RSA private key
    #[error("Signing key error: {0}")]
    SigningKey(String),

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// Caller input failed validation (e.g. empty sale id).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    // =========================================================================
    // Storage Errors
    // =========================================================================
    /// Database query failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// The shared ticket cache could not be reached.
    #[error("Ticket cache error: {0}")]
    TicketCache(String),

    /// Failed to serialize a payload.
    #[error("Serialization failed: {0}")]
    SerializationFailed(String),

    // =========================================================================
    // Authority Errors
    // =========================================================================
    /// A direct authority call (status, lookup) failed.
    #[error("Authority call failed: {0}")]
    Authority(#[from] Failure),

    /// Failed to build the HTTP client.
    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<titan_db::DbError> for FiscalError {
    fn from(err: titan_db::DbError) -> Self {
        FiscalError::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for FiscalError {
    fn from(err: serde_json::Error) -> Self {
        FiscalError::SerializationFailed(err.to_string())
    }
}

impl From<url::ParseError> for FiscalError {
    fn from(err: url::ParseError) -> Self {
        FiscalError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for FiscalError {
    fn from(err: std::io::Error) -> Self {
        FiscalError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for FiscalError {
    fn from(err: toml::de::Error) -> Self {
        FiscalError::ConfigLoadFailed(err.to_string())
    }
}

impl From<redis::RedisError> for FiscalError {
    fn from(err: redis::RedisError) -> Self {
        FiscalError::TicketCache(err.to_string())
    }
}

impl From<reqwest::Error> for FiscalError {
    fn from(err: reqwest::Error) -> Self {
        FiscalError::HttpClient(err.to_string())
    }
}

impl FiscalError {
    /// Returns true if this error is recoverable and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            FiscalError::DatabaseError(_) | FiscalError::TicketCache(_) => true,
            FiscalError::Authority(failure) => failure.is_retryable(),
            _ => false,
        }
    }

    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            FiscalError::InvalidConfig(_)
                | FiscalError::InvalidUrl(_)
                | FiscalError::ConfigLoadFailed(_)
                | FiscalError::SigningKey(_)
        )
    }
}

// =============================================================================
// Attempt Failures
// =============================================================================

/// Outcome of a failed fiscal attempt, tagged by what the dispatcher should do.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Failure {
    #[error(transparent)]
    Retryable(#[from] RetryableError),

    #[error(transparent)]
    Terminal(#[from] TerminalError),
}

/// Failures worth another attempt later.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryableError {
    /// The call did not answer within the adaptive timeout.
    #[error("{endpoint} timed out after {after_ms} ms")]
    Timeout { endpoint: &'static str, after_ms: u64 },

    /// Connection refused, reset or DNS failure.
    #[error("Network error calling {endpoint}: {message}")]
    Network { endpoint: &'static str, message: String },

    /// The authority is up but temporarily unable to serve.
    ///
    /// ## When This Occurs
    /// - HTTP 502/503/504
    /// - "service unavailable" in the response
    /// - Authority internal error codes (501, 502)
    #[error("Authority service unavailable: {0}")]
    Service(String),

    /// The access ticket was refused; the cache has been cleared.
    #[error("Access ticket rejected: {0}")]
    StaleTicket(String),

    /// The local database failed while the job was claimed.
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Failures that will not improve with time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TerminalError {
    /// The authority rejected the document.
    #[error("Rejected by the authority: {}", format_messages(.0))]
    Rejected(Vec<AuthorityMessage>),

    /// The ticket grant refused our certificate or signature.
    #[error("Bad credentials: {0}")]
    Credentials(String),

    /// The sale could not be built into a document.
    #[error("Cannot build invoice: {0}")]
    Build(#[from] BuildError),

    /// The authority answered something we could not interpret.
    #[error("Malformed authority response: {0}")]
    Protocol(String),

    /// The queued sale does not exist.
    #[error("Sale {0} not found")]
    MissingSale(String),
}

fn format_messages(messages: &[AuthorityMessage]) -> String {
    if messages.is_empty() {
        return "no details".to_string();
    }
    messages
        .iter()
        .map(|m| format!("[{}] {}", m.code, m.text))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Failure {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Failure::Retryable(_))
    }

    /// Short machine-readable kind, stored in the job error payload.
    pub fn kind(&self) -> &'static str {
        match self {
            Failure::Retryable(RetryableError::Timeout { .. }) => "timeout",
            Failure::Retryable(RetryableError::Network { .. }) => "network",
            Failure::Retryable(RetryableError::Service(_)) => "service_unavailable",
            Failure::Retryable(RetryableError::StaleTicket(_)) => "stale_ticket",
            Failure::Retryable(RetryableError::Storage(_)) => "storage",
            Failure::Terminal(TerminalError::Rejected(_)) => "rejected",
            Failure::Terminal(TerminalError::Credentials(_)) => "bad_credentials",
            Failure::Terminal(TerminalError::Build(e)) => e.kind(),
            Failure::Terminal(TerminalError::Protocol(_)) => "protocol",
            Failure::Terminal(TerminalError::MissingSale(_)) => "missing_sale",
        }
    }

    /// Authority messages carried by a rejection.
    pub fn authority_messages(&self) -> &[AuthorityMessage] {
        match self {
            Failure::Terminal(TerminalError::Rejected(messages)) => messages,
            _ => &[],
        }
    }

    /// The persisted form of this failure, with the submission it had in
    /// play.
    pub fn to_job_error(&self, attempt: Option<&VoucherAttempt>, now: DateTime<Utc>) -> JobError {
        JobError {
            kind: self.kind().to_string(),
            message: self.to_string(),
            retryable: self.is_retryable(),
            authority_messages: self.authority_messages().to_vec(),
            attempted_voucher: attempt.map(|a| a.number),
            attempt: attempt.cloned(),
            timestamp: now,
        }
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        Failure::Retryable(RetryableError::Storage(err.to_string()))
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Failure::Terminal(TerminalError::Protocol(message.into()))
    }
}

impl From<BuildError> for Failure {
    fn from(err: BuildError) -> Self {
        Failure::Terminal(TerminalError::Build(err))
    }
}

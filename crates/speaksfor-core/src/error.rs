//! Error types for speaks-for verification and issuance.

use std::fmt;

use chrono::{DateTime, FixedOffset};
use serde::Serialize;

/// Speaks-for errors.
///
/// Verification converts every variant into an invalid
/// [`VerificationResult`](crate::verify::VerificationResult); only issuance and
/// configuration loading surface these as hard errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SpeaksForError {
    /// Credential document is structurally unusable.
    #[error("invalid ABAC credential: {reason}")]
    MalformedCredential { reason: String },

    /// A certificate (or key paired with it) could not be parsed.
    #[error("malformed certificate: {reason}")]
    MalformedCertificate { reason: String },

    /// Credential expiration lies in the past.
    #[error("ABAC credential expired at {expires}")]
    ExpiredCredential { expires: DateTime<FixedOffset> },

    /// XML signature did not verify.
    #[error("ABAC credential failed signature verification: {reason}")]
    SignatureInvalid { reason: String },

    /// Credential type is not `abac`.
    #[error("credential not of type ABAC (found {found:?})")]
    WrongCredentialType { found: String },

    /// Credential is not the statement `U.speaks_for(U)<-T`.
    #[error("ABAC statement doesn't assert U.speaks_for(U)<-T")]
    StatementMismatch,

    /// Signer URN differs from the speaking-for URN.
    #[error("user URN {found:?} doesn't match speaking_for URN {expected}")]
    UrnMismatch {
        expected: String,
        found: Option<String>,
    },

    /// Signer certificate does not chain to a trusted root.
    #[error("user cert doesn't validate against trusted roots: {reason}")]
    UntrustedChain { reason: String },

    /// Temp file, subprocess, or filesystem failure.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Configuration error.
    #[error("configuration error: {message}")]
    Config { message: String },
}

/// Failure taxonomy reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FailureKind {
    MalformedCredential,
    MalformedCertificate,
    ExpiredCredential,
    SignatureInvalid,
    WrongCredentialType,
    StatementMismatch,
    #[serde(rename = "URNMismatch")]
    UrnMismatch,
    UntrustedChain,
    #[serde(rename = "IOError")]
    Io,
}

impl FailureKind {
    /// Stable name of the kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedCredential => "MalformedCredential",
            Self::MalformedCertificate => "MalformedCertificate",
            Self::ExpiredCredential => "ExpiredCredential",
            Self::SignatureInvalid => "SignatureInvalid",
            Self::WrongCredentialType => "WrongCredentialType",
            Self::StatementMismatch => "StatementMismatch",
            Self::UrnMismatch => "URNMismatch",
            Self::UntrustedChain => "UntrustedChain",
            Self::Io => "IOError",
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            // Input problems
            Self::MalformedCredential | Self::MalformedCertificate => 1,

            // Credential says something else
            Self::ExpiredCredential => 2,
            Self::WrongCredentialType | Self::StatementMismatch | Self::UrnMismatch => 3,

            // Security failures
            Self::SignatureInvalid | Self::UntrustedChain => 4,

            // Infrastructure
            Self::Io => 5,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SpeaksForError {
    /// Failure kind of this error. Configuration errors count as I/O.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::MalformedCredential { .. } => FailureKind::MalformedCredential,
            Self::MalformedCertificate { .. } => FailureKind::MalformedCertificate,
            Self::ExpiredCredential { .. } => FailureKind::ExpiredCredential,
            Self::SignatureInvalid { .. } => FailureKind::SignatureInvalid,
            Self::WrongCredentialType { .. } => FailureKind::WrongCredentialType,
            Self::StatementMismatch => FailureKind::StatementMismatch,
            Self::UrnMismatch { .. } => FailureKind::UrnMismatch,
            Self::UntrustedChain { .. } => FailureKind::UntrustedChain,
            Self::Io { .. } | Self::Config { .. } => FailureKind::Io,
        }
    }

    /// Exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 6,
            other => other.kind().exit_code(),
        }
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedCredential {
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_cert(reason: impl Into<String>) -> Self {
        Self::MalformedCertificate {
            reason: reason.into(),
        }
    }

    pub(crate) fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for SpeaksForError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

/// Result type for speaks-for operations.
pub type SpeaksForResult<T> = Result<T, SpeaksForError>;

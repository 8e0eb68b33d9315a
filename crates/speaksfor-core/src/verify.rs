//! Speaks-for credential verification.
//!
//! Verification never fails with an error: every problem, including
//! infrastructure faults, becomes [`VerificationResult::Invalid`] carrying a
//! [`FailureKind`] and a reason.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::capability::SignatureCapability;
use crate::cert::Certificate;
use crate::chain::TrustedRoots;
use crate::credential::parse_credential;
use crate::error::{FailureKind, SpeaksForError, SpeaksForResult};
use crate::gate::{run_gates, VerificationContext, GATES};

/// Outcome of verifying one credential.
#[derive(Debug, Clone)]
pub enum VerificationResult {
    /// The credential proves the tool speaks for this user.
    Valid { user_cert: Certificate },
    Invalid { kind: FailureKind, reason: String },
}

impl VerificationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid { .. })
    }

    /// Effective user certificate, when valid.
    pub fn user_cert(&self) -> Option<&Certificate> {
        match self {
            Self::Valid { user_cert } => Some(user_cert),
            Self::Invalid { .. } => None,
        }
    }

    pub fn into_user_cert(self) -> Option<Certificate> {
        match self {
            Self::Valid { user_cert } => Some(user_cert),
            Self::Invalid { .. } => None,
        }
    }

    /// Failure reason. Empty when valid.
    pub fn reason(&self) -> &str {
        match self {
            Self::Valid { .. } => "",
            Self::Invalid { reason, .. } => reason,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Valid { .. } => None,
            Self::Invalid { kind, .. } => Some(*kind),
        }
    }

    /// Serializable summary.
    pub fn report(&self) -> VerificationReport {
        VerificationReport {
            valid: self.is_valid(),
            user_urn: self.user_cert().and_then(Certificate::subject_urn),
            user_key_id: self.user_cert().map(|c| c.key_id().to_hex()),
            kind: self.failure_kind(),
            reason: self.reason().to_string(),
        }
    }
}

impl From<SpeaksForError> for VerificationResult {
    fn from(err: SpeaksForError) -> Self {
        Self::Invalid {
            kind: err.kind(),
            reason: err.to_string(),
        }
    }
}

/// JSON form of a [`VerificationResult`].
#[derive(Debug, Clone, Serialize)]
pub struct VerificationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_urn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub reason: String,
}

/// Verifier bound to a signature capability and a set of trusted roots.
#[derive(Debug, Clone)]
pub struct SpeaksForVerifier<C> {
    capability: C,
    trusted_roots: TrustedRoots,
    now: Option<DateTime<Utc>>,
}

impl<C: SignatureCapability> SpeaksForVerifier<C> {
    pub fn new(capability: C, trusted_roots: TrustedRoots) -> Self {
        Self {
            capability,
            trusted_roots,
            now: None,
        }
    }

    /// Evaluate expiration and validity windows at a fixed time instead of now.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    pub fn trusted_roots(&self) -> &TrustedRoots {
        &self.trusted_roots
    }

    pub fn capability(&self) -> &C {
        &self.capability
    }

    /// Verify that `document` lets `tool_cert` speak for `claimed_user_urn`.
    pub fn verify(
        &self,
        document: &[u8],
        tool_cert: &Certificate,
        claimed_user_urn: &str,
    ) -> VerificationResult {
        match self.check(document, tool_cert, claimed_user_urn) {
            Ok(user_cert) => {
                tracing::debug!(
                    urn = claimed_user_urn,
                    key_id = %user_cert.key_id(),
                    "speaks-for credential verified"
                );
                VerificationResult::Valid { user_cert }
            }
            Err(e) => {
                tracing::debug!(urn = claimed_user_urn, kind = %e.kind(), error = %e, "speaks-for credential rejected");
                e.into()
            }
        }
    }

    fn check(
        &self,
        document: &[u8],
        tool_cert: &Certificate,
        claimed_user_urn: &str,
    ) -> SpeaksForResult<Certificate> {
        let assertion = parse_credential(document)?;
        let ctx = VerificationContext {
            document,
            assertion: &assertion,
            tool_cert,
            claimed_user_urn,
            trusted_roots: &self.trusted_roots,
            capability: &self.capability,
            now: self.now.unwrap_or_else(Utc::now),
        };
        run_gates(GATES, &ctx)?;
        Ok(assertion.signer_cert)
    }
}

/// Verify a credential against a tool certificate given as PEM or DER bytes.
pub fn verify_speaks_for<C: SignatureCapability>(
    credential: &[u8],
    tool_cert: &[u8],
    claimed_user_urn: &str,
    trusted_roots: &TrustedRoots,
    capability: C,
) -> VerificationResult {
    let tool_cert = match Certificate::parse(tool_cert) {
        Ok(cert) => cert,
        Err(e) => return e.into(),
    };
    SpeaksForVerifier::new(capability, trusted_roots.clone()).verify(
        credential,
        &tool_cert,
        claimed_user_urn,
    )
}

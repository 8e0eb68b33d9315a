//! Ordered verification gates.
//!
//! Gates run in [`GATES`] order and the first failure decides the result:
//! expiration, signature, credential type, statement, URN, chain of trust.
//! Expiration runs before the signature check, so an expired credential is
//! rejected without being authenticated.

use chrono::{DateTime, Utc};

use crate::capability::SignatureCapability;
use crate::cert::Certificate;
use crate::chain::TrustedRoots;
use crate::credential::Assertion;
use crate::error::{SpeaksForError, SpeaksForResult};
use crate::semantics;

/// Everything a gate may look at for one credential.
pub struct VerificationContext<'a> {
    /// Original document bytes, as received.
    pub document: &'a [u8],
    pub assertion: &'a Assertion,
    pub tool_cert: &'a Certificate,
    pub claimed_user_urn: &'a str,
    pub trusted_roots: &'a TrustedRoots,
    pub capability: &'a dyn SignatureCapability,
    pub now: DateTime<Utc>,
}

/// One pass/fail check on a parsed credential.
pub trait Gate: Send + Sync {
    fn name(&self) -> &'static str;

    fn check(&self, ctx: &VerificationContext<'_>) -> SpeaksForResult<()>;
}

/// Fails when `expires` is before now. No grace period.
pub struct ExpirationGate;

impl Gate for ExpirationGate {
    fn name(&self) -> &'static str {
        "expiration"
    }

    fn check(&self, ctx: &VerificationContext<'_>) -> SpeaksForResult<()> {
        if ctx.assertion.expires.with_timezone(&Utc) < ctx.now {
            return Err(SpeaksForError::ExpiredCredential {
                expires: ctx.assertion.expires,
            });
        }
        Ok(())
    }
}

/// XML signature over `<credential>`, checked by the external capability
/// against the signer certificate's key.
///
/// An inline `RSAKeyValue` must be that same key.
pub struct SignatureGate;

impl Gate for SignatureGate {
    fn name(&self) -> &'static str {
        "signature"
    }

    fn check(&self, ctx: &VerificationContext<'_>) -> SpeaksForResult<()> {
        let signer = &ctx.assertion.signer_cert;
        if let Some(key_value) = &ctx.assertion.key_value {
            if !key_value.matches(signer) {
                return Err(SpeaksForError::SignatureInvalid {
                    reason: format!("KeyValue is not the key of signer {}", signer.key_id()),
                });
            }
        }

        if ctx.capability.verify(ctx.document, signer)? {
            Ok(())
        } else {
            Err(SpeaksForError::SignatureInvalid {
                reason: format!("signature by {} did not verify", signer.key_id()),
            })
        }
    }
}

pub struct CredentialTypeGate;

impl Gate for CredentialTypeGate {
    fn name(&self) -> &'static str {
        "credential_type"
    }

    fn check(&self, ctx: &VerificationContext<'_>) -> SpeaksForResult<()> {
        semantics::check_credential_type(ctx.assertion)
    }
}

pub struct StatementGate;

impl Gate for StatementGate {
    fn name(&self) -> &'static str {
        "statement"
    }

    fn check(&self, ctx: &VerificationContext<'_>) -> SpeaksForResult<()> {
        semantics::check_statement(ctx.assertion, ctx.tool_cert)
    }
}

pub struct UrnGate;

impl Gate for UrnGate {
    fn name(&self) -> &'static str {
        "urn"
    }

    fn check(&self, ctx: &VerificationContext<'_>) -> SpeaksForResult<()> {
        semantics::check_urn(ctx.assertion, ctx.claimed_user_urn)
    }
}

/// Signer certificate must chain to a trusted root.
pub struct ChainGate;

impl Gate for ChainGate {
    fn name(&self) -> &'static str {
        "chain"
    }

    fn check(&self, ctx: &VerificationContext<'_>) -> SpeaksForResult<()> {
        ctx.trusted_roots
            .verify_chain(
                &ctx.assertion.signer_cert,
                &ctx.assertion.presented_chain,
                ctx.now,
            )
            .map_err(SpeaksForError::from)
    }
}

/// Gates in evaluation order.
pub const GATES: &[&dyn Gate] = &[
    &ExpirationGate,
    &SignatureGate,
    &CredentialTypeGate,
    &StatementGate,
    &UrnGate,
    &ChainGate,
];

/// Run `gates` in order, stopping at the first failure.
pub fn run_gates(gates: &[&dyn Gate], ctx: &VerificationContext<'_>) -> SpeaksForResult<()> {
    for gate in gates {
        match gate.check(ctx) {
            Ok(()) => tracing::debug!(gate = gate.name(), "gate passed"),
            Err(e) => {
                tracing::debug!(gate = gate.name(), kind = %e.kind(), error = %e, "gate failed");
                return Err(e);
            }
        }
    }
    Ok(())
}

//! Statement semantics of a speaks-for credential.
//!
//! A valid credential asserts exactly `U.speaks_for(U) <- T`:
//! - `head.keyid` is the KeyId of the signer (U)
//! - `head.role` is `speaks_for_` followed by that same KeyId
//! - `tail.keyid` is the KeyId of the tool (T)

use crate::cert::Certificate;
use crate::credential::{Assertion, ABAC_TYPE, SPEAKS_FOR_ROLE_PREFIX};
use crate::error::{SpeaksForError, SpeaksForResult};

/// `type` must be `abac`.
pub fn check_credential_type(assertion: &Assertion) -> SpeaksForResult<()> {
    if assertion.cred_type == ABAC_TYPE {
        Ok(())
    } else {
        Err(SpeaksForError::WrongCredentialType {
            found: assertion.cred_type.clone(),
        })
    }
}

/// The statement must be `U.speaks_for(U) <- T` for the signer U and `tool_cert` T.
pub fn check_statement(assertion: &Assertion, tool_cert: &Certificate) -> SpeaksForResult<()> {
    // KeyIds are compared as written: lowercase hex.
    let user_keyid = assertion.signer_cert.key_id().to_hex();
    let tool_keyid = tool_cert.key_id().to_hex();
    let expected_role = format!("{SPEAKS_FOR_ROLE_PREFIX}{user_keyid}");

    let head_matches = assertion.head.keyid == user_keyid;
    let tail_matches = assertion.tail.keyid == tool_keyid;
    let role_matches = assertion.head.role == expected_role;

    if head_matches && tail_matches && role_matches {
        return Ok(());
    }

    tracing::debug!(
        head_matches,
        tail_matches,
        role_matches,
        user_keyid = %user_keyid,
        tool_keyid = %tool_keyid,
        "statement mismatch"
    );
    Err(SpeaksForError::StatementMismatch)
}

/// The signer's subject URN must equal the speaking-for URN.
pub fn check_urn(assertion: &Assertion, claimed_user_urn: &str) -> SpeaksForResult<()> {
    let found = assertion.signer_cert.subject_urn();
    match found.as_deref() {
        Some(urn) if urn == claimed_user_urn => Ok(()),
        _ => Err(SpeaksForError::UrnMismatch {
            expected: claimed_user_urn.to_string(),
            found,
        }),
    }
}

/// Type, statement, then URN. The first failure is returned.
pub fn check_semantics(
    assertion: &Assertion,
    tool_cert: &Certificate,
    claimed_user_urn: &str,
) -> SpeaksForResult<()> {
    check_credential_type(assertion)?;
    check_statement(assertion, tool_cert)?;
    check_urn(assertion, claimed_user_urn)
}

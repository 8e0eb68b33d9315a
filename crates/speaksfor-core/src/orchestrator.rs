//! Effective-identity selection from a list of candidate credentials.
//!
//! Without a speaking-for URN the caller acts as itself. Otherwise candidates
//! are verified in order and the first valid one wins; when none is valid the
//! caller's own certificate is returned.

use serde::Deserialize;

use crate::capability::SignatureCapability;
use crate::cert::Certificate;
use crate::chain::TrustedRoots;
use crate::verify::{SpeaksForVerifier, VerificationResult};

/// `geni_type` of ABAC credentials.
pub const GENI_ABAC: &str = "geni_abac";

/// Option key carrying the speaking-for URN.
pub const GENI_SPEAKING_FOR: &str = "geni_speaking_for";

/// Upper bound on verifications in flight in
/// [`SpeaksForVerifier::determine_parallel`]. Each one may run an `xmlsec1`
/// process.
pub const MAX_CONCURRENT_VERIFICATIONS: usize = 8;

/// Kind of an already-typed credential object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialKind {
    Abac,
    Other(String),
}

/// A credential as presented by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "WireCredentialRef")]
pub enum CredentialRef {
    /// `{geni_type, geni_value, geni_version}` record.
    Tagged {
        geni_type: String,
        geni_value: String,
        geni_version: Option<String>,
    },
    /// Credential object whose kind is already known.
    Typed { kind: CredentialKind, xml: String },
    /// Bare credential document.
    Raw(String),
}

impl CredentialRef {
    pub fn tagged(geni_type: impl Into<String>, geni_value: impl Into<String>) -> Self {
        Self::Tagged {
            geni_type: geni_type.into(),
            geni_value: geni_value.into(),
            geni_version: None,
        }
    }

    pub fn abac(xml: impl Into<String>) -> Self {
        Self::tagged(GENI_ABAC, xml)
    }

    /// ABAC document to verify, or `None` when this is not an ABAC candidate.
    ///
    /// Bare strings count as candidates when they mention `abac` anywhere.
    pub fn abac_xml_or_skip(&self) -> Option<&[u8]> {
        match self {
            Self::Tagged {
                geni_type,
                geni_value,
                ..
            } => (geni_type == GENI_ABAC).then_some(geni_value.as_bytes()),
            Self::Typed {
                kind: CredentialKind::Abac,
                xml,
            } => Some(xml.as_bytes()),
            Self::Typed { .. } => None,
            Self::Raw(text) => text.contains("abac").then_some(text.as_bytes()),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireCredentialRef {
    Tagged {
        geni_type: String,
        geni_value: String,
        #[serde(default)]
        geni_version: Option<String>,
    },
    Raw(String),
}

impl From<WireCredentialRef> for CredentialRef {
    fn from(wire: WireCredentialRef) -> Self {
        match wire {
            WireCredentialRef::Tagged {
                geni_type,
                geni_value,
                geni_version,
            } => Self::Tagged {
                geni_type,
                geni_value,
                geni_version,
            },
            WireCredentialRef::Raw(text) => Self::Raw(text),
        }
    }
}

/// Call options relevant to speaks-for. Other keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SpeaksForOptions {
    #[serde(default)]
    pub geni_speaking_for: Option<String>,
}

impl SpeaksForOptions {
    pub fn speaking_for(urn: impl Into<String>) -> Self {
        Self {
            geni_speaking_for: Some(urn.into()),
        }
    }

    /// Pick the options out of a string map.
    pub fn from_map<K, V>(map: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let geni_speaking_for = map
            .into_iter()
            .find(|(k, _)| k.as_ref() == GENI_SPEAKING_FOR)
            .map(|(_, v)| v.as_ref().to_string());
        Self { geni_speaking_for }
    }
}

impl<C: SignatureCapability> SpeaksForVerifier<C> {
    /// Effective identity of `caller_cert`, checking candidates one at a time.
    pub fn determine(
        &self,
        candidates: &[CredentialRef],
        caller_cert: &Certificate,
        options: &SpeaksForOptions,
    ) -> Certificate {
        let Some(urn) = options.geni_speaking_for.as_deref() else {
            return caller_cert.clone();
        };

        for (index, candidate) in candidates.iter().enumerate() {
            let Some(xml) = candidate.abac_xml_or_skip() else {
                tracing::debug!(candidate = index, "skipping non-ABAC credential");
                continue;
            };
            if let VerificationResult::Valid { user_cert } = self.verify(xml, caller_cert, urn) {
                return speaking_for(index, urn, user_cert);
            }
        }
        acting_as_self(caller_cert, urn, candidates.len())
    }

    /// Same answer as [`determine`](Self::determine), verifying candidates on
    /// scoped threads, at most [`MAX_CONCURRENT_VERIFICATIONS`] at a time.
    /// Batches run in candidate order and results are taken in candidate order.
    pub fn determine_parallel(
        &self,
        candidates: &[CredentialRef],
        caller_cert: &Certificate,
        options: &SpeaksForOptions,
    ) -> Certificate {
        let Some(urn) = options.geni_speaking_for.as_deref() else {
            return caller_cert.clone();
        };

        let abac: Vec<(usize, &[u8])> = candidates
            .iter()
            .enumerate()
            .filter_map(|(index, candidate)| candidate.abac_xml_or_skip().map(|xml| (index, xml)))
            .collect();

        for batch in abac.chunks(MAX_CONCURRENT_VERIFICATIONS) {
            let results: Vec<(usize, Option<VerificationResult>)> = std::thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .map(|&(index, xml)| {
                        (index, scope.spawn(move || self.verify(xml, caller_cert, urn)))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(index, handle)| (index, handle.join().ok()))
                    .collect()
            });

            for (index, result) in results {
                if let Some(VerificationResult::Valid { user_cert }) = result {
                    return speaking_for(index, urn, user_cert);
                }
            }
        }
        acting_as_self(caller_cert, urn, candidates.len())
    }
}

fn speaking_for(index: usize, urn: &str, user_cert: Certificate) -> Certificate {
    tracing::info!(candidate = index, urn, key_id = %user_cert.key_id(), "caller speaks for user");
    user_cert
}

fn acting_as_self(caller_cert: &Certificate, urn: &str, candidates: usize) -> Certificate {
    tracing::info!(
        urn,
        candidates,
        caller = ?caller_cert.subject_urn(),
        "no valid speaks-for credential, caller acts for itself"
    );
    caller_cert.clone()
}

/// Effective identity of `caller_cert` for a call with `options`.
pub fn determine_speaks_for<C: SignatureCapability>(
    candidates: &[CredentialRef],
    caller_cert: &Certificate,
    options: &SpeaksForOptions,
    trusted_roots: &TrustedRoots,
    capability: C,
) -> Certificate {
    SpeaksForVerifier::new(capability, trusted_roots.clone()).determine(
        candidates,
        caller_cert,
        options,
    )
}

/// [`determine_speaks_for`] with candidates verified concurrently.
pub fn determine_speaks_for_parallel<C: SignatureCapability>(
    candidates: &[CredentialRef],
    caller_cert: &Certificate,
    options: &SpeaksForOptions,
    trusted_roots: &TrustedRoots,
    capability: C,
) -> Certificate {
    SpeaksForVerifier::new(capability, trusted_roots.clone()).determine_parallel(
        candidates,
        caller_cert,
        options,
    )
}

//! Trusted roots and chain-of-trust validation.
//!
//! Path validation is done natively: each certificate on the path must be
//! inside its validity window and signed (RSA PKCS#1 v1.5) by the next. Issuers
//! are looked up among the trusted roots first, then among the intermediates
//! presented with the credential. No revocation checking.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use spki::ObjectIdentifier;
use x509_cert::der::Encode;

use crate::cert::Certificate;
use crate::error::{SpeaksForError, SpeaksForResult};

/// Aggregate bundle kept next to the individual roots; loading it would count
/// every root twice.
pub const AGGREGATE_ROOTS_FILE: &str = "CATedCACerts.pem";

/// Longest accepted path, leaf included.
pub const MAX_PATH_DEPTH: usize = 8;

const SHA1_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.5");
const SHA256_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const SHA384_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
const SHA512_WITH_RSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");

/// Chain validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The path does not validate.
    #[error("{0}")]
    Untrusted(String),

    /// Validation could not be carried out.
    #[error("chain validation failed internally: {0}")]
    Internal(String),
}

impl From<ChainError> for SpeaksForError {
    fn from(err: ChainError) -> Self {
        match err {
            ChainError::Untrusted(reason) => SpeaksForError::UntrustedChain { reason },
            ChainError::Internal(message) => SpeaksForError::Io { message },
        }
    }
}

/// Immutable set of trust anchors. Clones share the same certificates.
#[derive(Debug, Clone, Default)]
pub struct TrustedRoots {
    roots: Arc<[Certificate]>,
}

impl TrustedRoots {
    pub fn new(roots: Vec<Certificate>) -> Self {
        Self {
            roots: roots.into(),
        }
    }

    /// Load every `*.pem` file in `dir`, in file-name order.
    ///
    /// [`AGGREGATE_ROOTS_FILE`] is skipped. A file may hold several certificates.
    pub fn from_directory(dir: &Path) -> SpeaksForResult<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            SpeaksForError::io(format!("failed to read trusted roots {}: {e}", dir.display()))
        })?;

        let mut paths = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let is_pem = path.extension().and_then(|e| e.to_str()) == Some("pem");
            if !is_pem || !path.is_file() {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some(AGGREGATE_ROOTS_FILE) {
                tracing::debug!(path = %path.display(), "skipping aggregate root bundle");
                continue;
            }
            paths.push(path);
        }
        paths.sort();

        let mut roots = Vec::new();
        for path in &paths {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                SpeaksForError::io(format!("failed to read trusted root {}: {e}", path.display()))
            })?;
            let certs = Certificate::all_from_pem(&pem).map_err(|e| {
                SpeaksForError::bad_cert(format!("trusted root {}: {e}", path.display()))
            })?;
            if certs.is_empty() {
                tracing::warn!(path = %path.display(), "no certificates in trusted root file");
            }
            roots.extend(certs);
        }

        if roots.is_empty() {
            tracing::warn!(dir = %dir.display(), "no trusted roots loaded");
        } else {
            tracing::debug!(dir = %dir.display(), count = roots.len(), "loaded trusted roots");
        }
        Ok(Self::new(roots))
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Certificate> {
        self.roots.iter()
    }

    /// Validate `cert` up to a trusted root at time `now`.
    ///
    /// `presented` are candidate intermediates carried in the credential; they
    /// are only used when they are marked as CAs.
    pub fn verify_chain(
        &self,
        cert: &Certificate,
        presented: &[Certificate],
        now: DateTime<Utc>,
    ) -> Result<(), ChainError> {
        let mut current = cert;

        for _ in 0..MAX_PATH_DEPTH {
            check_validity(current, now)?;

            if self.roots.iter().any(|root| root == current) {
                return Ok(());
            }

            for root in self.roots.iter() {
                if root.subject() != current.issuer() {
                    continue;
                }
                // Roots may share a name; only one of them need verify.
                let key = match issuer_key(root) {
                    Ok(key) => key,
                    Err(e) => {
                        tracing::debug!(
                            root = %root.subject(),
                            error = %e,
                            "skipping trusted root"
                        );
                        continue;
                    }
                };
                if is_signed_by(current, &key)? {
                    check_validity(root, now)?;
                    return Ok(());
                }
            }

            let next = presented.iter().find(|candidate| {
                *candidate != current
                    && candidate.is_ca()
                    && candidate.subject() == current.issuer()
                    && issuer_key(candidate)
                        .ok()
                        .map(|key| matches!(is_signed_by(current, &key), Ok(true)))
                        .unwrap_or(false)
            });

            match next {
                Some(issuer) => current = issuer,
                None => {
                    return Err(ChainError::Untrusted(format!(
                        "no trusted issuer for {}",
                        current.subject()
                    )))
                }
            }
        }

        Err(ChainError::Untrusted(format!(
            "certificate path longer than {MAX_PATH_DEPTH}"
        )))
    }
}

impl From<Vec<Certificate>> for TrustedRoots {
    fn from(roots: Vec<Certificate>) -> Self {
        Self::new(roots)
    }
}

fn check_validity(cert: &Certificate, now: DateTime<Utc>) -> Result<(), ChainError> {
    if cert.is_valid_at(now) {
        Ok(())
    } else {
        Err(ChainError::Untrusted(format!(
            "{} is outside its validity period ({} to {})",
            cert.subject(),
            cert.not_before(),
            cert.not_after()
        )))
    }
}

fn issuer_key(issuer: &Certificate) -> Result<RsaPublicKey, String> {
    RsaPublicKey::from_pkcs1_der(issuer.public_key_bits())
        .map_err(|e| format!("not an RSA public key: {e}"))
}

/// Whether `key` made the signature on `cert`.
///
/// A wrong key is `Ok(false)`; an algorithm we can't check is untrusted.
fn is_signed_by(cert: &Certificate, key: &RsaPublicKey) -> Result<bool, ChainError> {
    let x509 = cert.x509();
    let tbs = x509
        .tbs_certificate
        .to_der()
        .map_err(|e| ChainError::Internal(format!("re-encoding TBS certificate: {e}")))?;
    let signature = x509.signature.as_bytes().ok_or_else(|| {
        ChainError::Untrusted("certificate signature is not a whole number of bytes".into())
    })?;

    let algorithm = x509.signature_algorithm.oid;
    let (scheme, hashed) = if algorithm == SHA1_WITH_RSA {
        (Pkcs1v15Sign::new::<Sha1>(), Sha1::digest(&tbs).to_vec())
    } else if algorithm == SHA256_WITH_RSA {
        (Pkcs1v15Sign::new::<Sha256>(), Sha256::digest(&tbs).to_vec())
    } else if algorithm == SHA384_WITH_RSA {
        (Pkcs1v15Sign::new::<Sha384>(), Sha384::digest(&tbs).to_vec())
    } else if algorithm == SHA512_WITH_RSA {
        (Pkcs1v15Sign::new::<Sha512>(), Sha512::digest(&tbs).to_vec())
    } else {
        return Err(ChainError::Untrusted(format!(
            "unsupported certificate signature algorithm {algorithm}"
        )));
    };

    Ok(key.verify(scheme, &hashed, signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const MA_PEM: &str = include_str!("../tests/fixtures/ma_cert.pem");
    const USER_PEM: &str = include_str!("../tests/fixtures/user_cert.pem");
    const TOOL_PEM: &str = include_str!("../tests/fixtures/tool_cert.pem");
    const ROGUE_CA_PEM: &str = include_str!("../tests/fixtures/rogue_ca_cert.pem");
    const ROGUE_USER_PEM: &str = include_str!("../tests/fixtures/rogue_user_cert.pem");
    const EC_MA_PEM: &str = include_str!("../tests/fixtures/ec_ma_cert.pem");

    fn cert(pem: &str) -> Certificate {
        Certificate::from_pem(pem).unwrap()
    }

    fn ma_roots() -> TrustedRoots {
        TrustedRoots::new(vec![cert(MA_PEM)])
    }

    #[test]
    fn test_leaf_issued_by_root() {
        let roots = ma_roots();
        roots.verify_chain(&cert(USER_PEM), &[], Utc::now()).unwrap();
        roots.verify_chain(&cert(TOOL_PEM), &[], Utc::now()).unwrap();
    }

    #[test]
    fn test_root_itself_trusted() {
        ma_roots().verify_chain(&cert(MA_PEM), &[], Utc::now()).unwrap();
    }

    #[test]
    fn test_rogue_issuer_with_same_name_rejected() {
        // The rogue CA has the MA's subject name but a different key.
        let err = ma_roots()
            .verify_chain(&cert(ROGUE_USER_PEM), &[], Utc::now())
            .unwrap_err();
        assert!(matches!(err, ChainError::Untrusted(_)));
    }

    #[test]
    fn test_presented_issuer_must_chain_to_root() {
        let err = ma_roots()
            .verify_chain(&cert(ROGUE_USER_PEM), &[cert(ROGUE_CA_PEM)], Utc::now())
            .unwrap_err();
        assert!(matches!(err, ChainError::Untrusted(_)));
    }

    #[test]
    fn test_empty_roots_trust_nothing() {
        let err = TrustedRoots::default()
            .verify_chain(&cert(USER_PEM), &[cert(MA_PEM)], Utc::now())
            .unwrap_err();
        assert!(matches!(err, ChainError::Untrusted(_)));
    }

    #[test]
    fn test_expired_path_rejected() {
        let user = cert(USER_PEM);
        let later = user.not_after() + Duration::days(1);
        let err = ma_roots().verify_chain(&user, &[], later).unwrap_err();
        assert!(err.to_string().contains("validity"));
    }

    #[test]
    fn test_non_rsa_root_with_same_name_skipped() {
        let ec_root = cert(EC_MA_PEM);
        let roots = TrustedRoots::new(vec![ec_root.clone(), cert(MA_PEM)]);
        roots.verify_chain(&cert(USER_PEM), &[], Utc::now()).unwrap();

        let err = TrustedRoots::new(vec![ec_root])
            .verify_chain(&cert(USER_PEM), &[], Utc::now())
            .unwrap_err();
        assert!(matches!(err, ChainError::Untrusted(_)));
    }

    #[test]
    fn test_error_kinds() {
        let untrusted: SpeaksForError = ChainError::Untrusted("x".into()).into();
        assert_eq!(untrusted.kind(), crate::error::FailureKind::UntrustedChain);
        let internal: SpeaksForError = ChainError::Internal("x".into()).into();
        assert_eq!(internal.kind(), crate::error::FailureKind::Io);
    }

    #[test]
    fn test_from_directory_skips_aggregate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ma.pem"), MA_PEM).unwrap();
        std::fs::write(dir.path().join("rogue.pem"), ROGUE_CA_PEM).unwrap();
        std::fs::write(
            dir.path().join(AGGREGATE_ROOTS_FILE),
            format!("{MA_PEM}{ROGUE_CA_PEM}"),
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a cert").unwrap();

        let roots = TrustedRoots::from_directory(dir.path()).unwrap();
        assert_eq!(roots.len(), 2);
        let urns: Vec<_> = roots.iter().map(|c| c.subject_urn()).collect();
        assert_eq!(
            urns[0].as_deref(),
            Some("urn:publicid:IDN+example.net+authority+ma")
        );
    }

    #[test]
    fn test_from_directory_multi_cert_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bundle.pem"), format!("{MA_PEM}{ROGUE_CA_PEM}")).unwrap();
        let roots = TrustedRoots::from_directory(dir.path()).unwrap();
        assert_eq!(roots.len(), 2);
    }

    #[test]
    fn test_from_directory_errors() {
        let err = TrustedRoots::from_directory(Path::new("/nonexistent/roots")).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Io);

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("broken.pem"),
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
        )
        .unwrap();
        let err = TrustedRoots::from_directory(dir.path()).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::MalformedCertificate);
    }

    #[test]
    fn test_clones_share_roots() {
        let roots = ma_roots();
        let clone = roots.clone();
        assert!(Arc::ptr_eq(&roots.roots, &clone.roots));
    }
}

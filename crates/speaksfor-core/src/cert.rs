//! X.509 certificate model and key identity.
//!
//! A [`KeyId`] is the SHA-1 digest of the certificate's raw public-key bits:
//! the content of the `subjectPublicKey` BIT STRING inside
//! `SubjectPublicKeyInfo`, without the algorithm identifier. For RSA keys that
//! is the DER `RSAPublicKey`, which is also what `openssl` hashes for the
//! default subject key identifier.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use spki::ObjectIdentifier;
use x509_cert::der::Decode;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::{BasicConstraints, SubjectAltName};
use x509_cert::name::Name;

use crate::error::{SpeaksForError, SpeaksForResult};

/// Prefix of the subject-alternative-name URI that carries the principal URN.
pub const URN_PREFIX: &str = "urn:publicid";

const PEM_BEGIN: &str = "-----BEGIN CERTIFICATE-----";
const PEM_END: &str = "-----END CERTIFICATE-----";

const ID_CE_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");
const ID_CE_BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");

/// SHA-1 identity of a public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyId([u8; 20]);

impl KeyId {
    /// Hash raw public-key bits.
    pub fn from_public_key_bits(bits: &[u8]) -> Self {
        let digest = Sha1::digest(bits);
        let mut out = [0u8; 20];
        out.copy_from_slice(&digest);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Lowercase hex form, as written into credentials.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.to_hex())
    }
}

impl FromStr for KeyId {
    type Err = SpeaksForError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)
            .map_err(|e| SpeaksForError::malformed(format!("invalid keyid {s:?}: {e}")))?;
        let array: [u8; 20] = bytes.try_into().map_err(|_| {
            SpeaksForError::malformed(format!("invalid keyid {s:?}: expected 20 bytes"))
        })?;
        Ok(Self(array))
    }
}

/// A parsed X.509 certificate. Immutable once loaded.
#[derive(Clone)]
pub struct Certificate {
    inner: x509_cert::Certificate,
    der: Vec<u8>,
    key_id: KeyId,
}

impl Certificate {
    /// Parse DER bytes.
    pub fn from_der(der: &[u8]) -> SpeaksForResult<Self> {
        let inner = x509_cert::Certificate::from_der(der)
            .map_err(|e| SpeaksForError::bad_cert(format!("invalid X.509 DER: {e}")))?;

        let bits = inner
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .as_bytes()
            .ok_or_else(|| SpeaksForError::bad_cert("public key is not a whole number of bytes"))?;
        let key_id = KeyId::from_public_key_bits(bits);

        Ok(Self {
            inner,
            der: der.to_vec(),
            key_id,
        })
    }

    /// Parse the first certificate block of a PEM string.
    ///
    /// Anything after the first block (e.g. a trailing issuer chain) is ignored.
    pub fn from_pem(pem: &str) -> SpeaksForResult<Self> {
        let first = pem_blocks(pem)?
            .into_iter()
            .next()
            .ok_or_else(|| SpeaksForError::bad_cert("no PEM certificate block"))?;
        Self::from_der(&first)
    }

    /// Parse every certificate block of a PEM string.
    pub fn all_from_pem(pem: &str) -> SpeaksForResult<Vec<Self>> {
        pem_blocks(pem)?
            .iter()
            .map(|der| Self::from_der(der))
            .collect()
    }

    /// Parse a base64 certificate body (PEM without header and footer), as found
    /// in an `X509Certificate` element. Whitespace is ignored.
    pub fn from_base64_body(body: &str) -> SpeaksForResult<Self> {
        let der = decode_body(body)?;
        Self::from_der(&der)
    }

    /// Load a certificate file (PEM, or DER when no PEM block is present).
    pub fn load(path: &Path) -> SpeaksForResult<Self> {
        let bytes = std::fs::read(path).map_err(|e| {
            SpeaksForError::io(format!("failed to read certificate {}: {e}", path.display()))
        })?;
        Self::parse(&bytes)
    }

    /// Parse PEM text, or DER when no PEM block is present.
    pub fn parse(bytes: &[u8]) -> SpeaksForResult<Self> {
        match std::str::from_utf8(bytes) {
            Ok(text) if text.contains(PEM_BEGIN) => Self::from_pem(text),
            _ => Self::from_der(bytes),
        }
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Base64 DER without PEM armour.
    pub fn base64_body(&self) -> String {
        BASE64.encode(&self.der)
    }

    /// PEM encoding with 64-column body lines.
    pub fn to_pem(&self) -> String {
        let body = self.base64_body();
        let mut pem = String::with_capacity(body.len() + body.len() / 64 + 64);
        pem.push_str(PEM_BEGIN);
        pem.push('\n');
        for line in body.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(line));
            pem.push('\n');
        }
        pem.push_str(PEM_END);
        pem.push('\n');
        pem
    }

    pub fn key_id(&self) -> KeyId {
        self.key_id
    }

    /// Raw public-key bits (the `subjectPublicKey` BIT STRING content).
    pub fn public_key_bits(&self) -> &[u8] {
        // Checked to be byte-aligned at construction.
        self.inner
            .tbs_certificate
            .subject_public_key_info
            .subject_public_key
            .raw_bytes()
    }

    pub fn public_key_algorithm(&self) -> ObjectIdentifier {
        self.inner.tbs_certificate.subject_public_key_info.algorithm.oid
    }

    pub fn subject(&self) -> &Name {
        &self.inner.tbs_certificate.subject
    }

    pub fn issuer(&self) -> &Name {
        &self.inner.tbs_certificate.issuer
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        let secs = self
            .inner
            .tbs_certificate
            .validity
            .not_before
            .to_unix_duration()
            .as_secs();
        i64::try_from(secs)
            .ok()
            .and_then(|s| DateTime::from_timestamp(s, 0))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        let secs = self
            .inner
            .tbs_certificate
            .validity
            .not_after
            .to_unix_duration()
            .as_secs();
        i64::try_from(secs)
            .ok()
            .and_then(|s| DateTime::from_timestamp(s, 0))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Whether `at` lies inside the validity window.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before() <= at && at <= self.not_after()
    }

    /// Whether BasicConstraints marks this certificate as a CA.
    pub fn is_ca(&self) -> bool {
        self.extension(ID_CE_BASIC_CONSTRAINTS)
            .and_then(|bytes| BasicConstraints::from_der(bytes).ok())
            .map(|bc| bc.ca)
            .unwrap_or(false)
    }

    /// Principal URN from the subject alternative name (first `urn:publicid` URI).
    pub fn subject_urn(&self) -> Option<String> {
        self.subject_alt_names()
            .into_iter()
            .find_map(|name| match name {
                GeneralName::UniformResourceIdentifier(uri) => {
                    let uri = uri.to_string();
                    uri.starts_with(URN_PREFIX).then_some(uri)
                }
                _ => None,
            })
    }

    pub fn x509(&self) -> &x509_cert::Certificate {
        &self.inner
    }

    fn subject_alt_names(&self) -> Vec<GeneralName> {
        self.extension(ID_CE_SUBJECT_ALT_NAME)
            .and_then(|bytes| SubjectAltName::from_der(bytes).ok())
            .map(|san| san.0)
            .unwrap_or_default()
    }

    fn extension(&self, oid: ObjectIdentifier) -> Option<&[u8]> {
        self.inner
            .tbs_certificate
            .extensions
            .as_ref()?
            .iter()
            .find(|ext| ext.extn_id == oid)
            .map(|ext| ext.extn_value.as_bytes())
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for Certificate {}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject().to_string())
            .field("urn", &self.subject_urn())
            .field("key_id", &self.key_id)
            .finish()
    }
}

/// Extract DER bodies of every `CERTIFICATE` block in a PEM string.
pub fn pem_blocks(pem: &str) -> SpeaksForResult<Vec<Vec<u8>>> {
    let mut blocks = Vec::new();
    let mut rest = pem;
    while let Some(start) = rest.find(PEM_BEGIN) {
        let after_begin = &rest[start + PEM_BEGIN.len()..];
        let end = after_begin
            .find(PEM_END)
            .ok_or_else(|| SpeaksForError::bad_cert("unterminated PEM certificate block"))?;
        blocks.push(decode_body(&after_begin[..end])?);
        rest = &after_begin[end + PEM_END.len()..];
    }
    Ok(blocks)
}

fn decode_body(body: &str) -> SpeaksForResult<Vec<u8>> {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(SpeaksForError::bad_cert("empty certificate body"));
    }
    BASE64
        .decode(compact.as_bytes())
        .map_err(|e| SpeaksForError::bad_cert(format!("invalid base64 certificate: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    const USER_PEM: &str = include_str!("../tests/fixtures/user_cert.pem");
    const TOOL_PEM: &str = include_str!("../tests/fixtures/tool_cert.pem");
    const MA_PEM: &str = include_str!("../tests/fixtures/ma_cert.pem");

    #[test]
    fn test_key_id_golden_vectors() {
        // Cross-checked against `openssl rsa -RSAPublicKey_out | sha1sum`.
        let user = Certificate::from_pem(USER_PEM).unwrap();
        assert_eq!(
            user.key_id().to_hex(),
            "e621b8e51956a7a85f36f664a4516ace8cf1aa0d"
        );
        let tool = Certificate::from_pem(TOOL_PEM).unwrap();
        assert_eq!(
            tool.key_id().to_hex(),
            "2c4f8baf106e491baf4433f74080851ebf68a218"
        );
    }

    #[test]
    fn test_key_id_deterministic_and_distinct() {
        let a = Certificate::from_pem(USER_PEM).unwrap();
        let b = Certificate::from_pem(USER_PEM).unwrap();
        let c = Certificate::from_pem(MA_PEM).unwrap();
        assert_eq!(a.key_id(), b.key_id());
        assert_ne!(a.key_id(), c.key_id());
    }

    #[test]
    fn test_key_id_parse() {
        let id: KeyId = "E621B8E51956A7A85F36F664A4516ACE8CF1AA0D".parse().unwrap();
        assert_eq!(id.to_string(), "e621b8e51956a7a85f36f664a4516ace8cf1aa0d");
        assert!("abcd".parse::<KeyId>().is_err());
        assert!("zz".parse::<KeyId>().is_err());
    }

    #[test]
    fn test_subject_urn() {
        let user = Certificate::from_pem(USER_PEM).unwrap();
        assert_eq!(
            user.subject_urn().as_deref(),
            Some("urn:publicid:IDN+example.net+user+alice")
        );
        let ma = Certificate::from_pem(MA_PEM).unwrap();
        assert_eq!(
            ma.subject_urn().as_deref(),
            Some("urn:publicid:IDN+example.net+authority+ma")
        );
    }

    #[test]
    fn test_pem_round_trip() {
        let user = Certificate::from_pem(USER_PEM).unwrap();
        let again = Certificate::from_pem(&user.to_pem()).unwrap();
        assert_eq!(user, again);

        let from_body = Certificate::from_base64_body(&user.base64_body()).unwrap();
        assert_eq!(user, from_body);
    }

    #[test]
    fn test_from_pem_takes_first_block() {
        let bundle = format!("{USER_PEM}{MA_PEM}");
        let first = Certificate::from_pem(&bundle).unwrap();
        assert_eq!(first.subject_urn(), Certificate::from_pem(USER_PEM).unwrap().subject_urn());

        let all = Certificate::all_from_pem(&bundle).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_ca_flag_and_validity() {
        let ma = Certificate::from_pem(MA_PEM).unwrap();
        let user = Certificate::from_pem(USER_PEM).unwrap();
        assert!(ma.is_ca());
        assert!(!user.is_ca());
        assert!(user.is_valid_at(Utc::now()));
        assert!(!user.is_valid_at(user.not_before() - chrono::Duration::days(1)));
        assert_eq!(user.issuer(), ma.subject());
    }

    #[test]
    fn test_malformed_inputs() {
        let err = Certificate::from_pem("no pem here").unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedCertificate);

        let err = Certificate::from_base64_body("!!!not base64!!!").unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedCertificate);

        let err = Certificate::from_der(b"\x30\x03\x02\x01\x01").unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedCertificate);

        let truncated = format!("{PEM_BEGIN}\nMIIB");
        assert!(Certificate::from_pem(&truncated).is_err());
    }

    #[test]
    fn test_load_missing_file_is_io() {
        let err = Certificate::load(Path::new("/nonexistent/cert.pem")).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Io);
    }
}

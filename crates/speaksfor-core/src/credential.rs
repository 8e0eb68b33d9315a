//! ABAC credential parsing.
//!
//! A signed credential carries one RT0 statement `head <- tail` and the
//! signer's certificate in its XML signature block:
//!
//! ```text
//! signed-credential
//!   credential (xml:id=ref0)
//!     type: abac
//!     expires: RFC 3339 timestamp
//!     abac/rt0
//!       version: 1.1
//!       head/ABACprincipal/keyid, head/role
//!       tail/ABACprincipal/keyid
//!   signatures/Signature/.../X509Data/X509Certificate+
//! ```
//!
//! Every singleton element must appear exactly once. Taking "the first of
//! many" would let a second, unsigned-for `head` or `tail` slip past the
//! statement check. Statement elements are only read from `credential`, the
//! subtree the signature covers.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, FixedOffset};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};

use crate::cert::Certificate;
use crate::error::{SpeaksForError, SpeaksForResult};
use crate::xml::{self, Element};

/// Root element of a signed credential.
pub const SIGNED_CREDENTIAL: &str = "signed-credential";

/// Credential type of ABAC credentials.
pub const ABAC_TYPE: &str = "abac";

/// Role prefix of the speaks-for statement.
pub const SPEAKS_FOR_ROLE_PREFIX: &str = "speaks_for_";

/// `head` of an RT0 statement: `keyid.role`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Head {
    pub keyid: String,
    pub role: String,
}

/// `tail` of an RT0 statement: a principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tail {
    pub keyid: String,
}

/// `KeyValue/RSAKeyValue` carried in the signature's `KeyInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaKeyValue {
    /// Big-endian modulus.
    pub modulus: Vec<u8>,
    /// Big-endian public exponent.
    pub exponent: Vec<u8>,
}

impl RsaKeyValue {
    /// Whether this is the public key of `cert`.
    pub fn matches(&self, cert: &Certificate) -> bool {
        match RsaPublicKey::from_pkcs1_der(cert.public_key_bits()) {
            Ok(key) => {
                key.n() == &BigUint::from_bytes_be(&self.modulus)
                    && key.e() == &BigUint::from_bytes_be(&self.exponent)
            }
            Err(_) => false,
        }
    }
}

/// Parsed ABAC assertion.
#[derive(Debug, Clone)]
pub struct Assertion {
    /// `credential/type` value.
    pub cred_type: String,
    pub head: Head,
    pub tail: Tail,
    pub expires: DateTime<FixedOffset>,
    /// RT0 version, when present.
    pub version: Option<String>,
    /// Certificate of the signer (first `X509Certificate`).
    pub signer_cert: Certificate,
    /// Further certificates presented with the signature, usually the issuer.
    pub presented_chain: Vec<Certificate>,
    /// Inline signer key, when the signature carries one.
    pub key_value: Option<RsaKeyValue>,
}

/// Parse a signed credential document.
pub fn parse_credential(document: &[u8]) -> SpeaksForResult<Assertion> {
    let root = xml::parse_document(document)?;
    if root.name != SIGNED_CREDENTIAL {
        return Err(SpeaksForError::malformed(format!(
            "root element is {:?}, expected {SIGNED_CREDENTIAL}",
            root.name
        )));
    }

    let (signer_cert, presented_chain) = parse_certificates(&root)?;
    let key_value = parse_key_value(&root)?;
    let credential = xml::exactly_one_child(&root, "credential")?;

    let head = xml::exactly_one_descendant(credential, "head")
        .map_err(|e| context(e, "head"))?;
    let head_keyid = xml::exactly_one_descendant(head, "keyid")
        .and_then(xml::required_text)
        .map_err(|e| context(e, "head principal"))?;
    let role = xml::exactly_one_descendant(head, "role")
        .and_then(xml::required_text)
        .map_err(|e| context(e, "role"))?;

    let tail = xml::exactly_one_descendant(credential, "tail")
        .map_err(|e| context(e, "tail"))?;
    let tail_keyid = xml::exactly_one_descendant(tail, "keyid")
        .and_then(xml::required_text)
        .map_err(|e| context(e, "tail subject"))?;

    let cred_type = xml::exactly_one_child(credential, "type")
        .and_then(xml::required_text)
        .map_err(|e| context(e, "type"))?;

    let expires = xml::exactly_one_descendant(credential, "expires")
        .and_then(xml::required_text)
        .and_then(parse_timestamp)?;

    let version = credential
        .descendants_named("version")
        .first()
        .and_then(|v| v.first_text_value())
        .map(|v| v.trim().to_string());

    Ok(Assertion {
        cred_type: cred_type.trim().to_string(),
        head: Head {
            keyid: head_keyid.trim().to_string(),
            role: role.trim().to_string(),
        },
        tail: Tail {
            keyid: tail_keyid.trim().to_string(),
        },
        expires,
        version,
        signer_cert,
        presented_chain,
        key_value,
    })
}

/// Extract the signer certificate and any further presented certificates.
///
/// All `X509Certificate` elements must sit in the one `X509Data` block; the
/// first is the signer.
fn parse_certificates(root: &Element) -> SpeaksForResult<(Certificate, Vec<Certificate>)> {
    let cert_elements = root.descendants_named("X509Certificate");
    if cert_elements.is_empty() {
        return Err(SpeaksForError::malformed("no X509 cert"));
    }

    let x509_data = xml::exactly_one_descendant(root, "X509Data")?;
    let in_data: Vec<&Element> = x509_data
        .child_elements()
        .filter(|e| e.name == "X509Certificate")
        .collect();
    if in_data.len() != cert_elements.len() {
        return Err(SpeaksForError::malformed(
            "X509Certificate outside the signature's X509Data",
        ));
    }

    let mut certs = in_data.into_iter().map(|element| {
        let body = xml::required_text(element)?;
        Certificate::from_base64_body(body)
    });

    let signer = certs
        .next()
        .ok_or_else(|| SpeaksForError::malformed("no X509 cert"))??;
    let rest = certs.collect::<SpeaksForResult<Vec<_>>>()?;
    Ok((signer, rest))
}

/// Extract the inline RSA key, if any.
///
/// An unsigned template carries an empty `RSAKeyValue`; that counts as none.
fn parse_key_value(root: &Element) -> SpeaksForResult<Option<RsaKeyValue>> {
    let found = root.descendants_named("RSAKeyValue");
    let key_value = match found.as_slice() {
        [] => return Ok(None),
        [one] => *one,
        _ => return Err(SpeaksForError::malformed("more than one RSAKeyValue")),
    };

    let (modulus, exponent) = (
        key_part(key_value, "Modulus"),
        key_part(key_value, "Exponent"),
    );
    if modulus.is_empty() && exponent.is_empty() {
        return Ok(None);
    }

    Ok(Some(RsaKeyValue {
        modulus: decode_key_part(modulus, "Modulus")?,
        exponent: decode_key_part(exponent, "Exponent")?,
    }))
}

fn key_part<'a>(key_value: &'a Element, name: &str) -> &'a str {
    key_value
        .first_child_named(name)
        .and_then(|e| e.first_text_value())
        .map(str::trim)
        .unwrap_or("")
}

fn decode_key_part(text: &str, name: &str) -> SpeaksForResult<Vec<u8>> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    match BASE64.decode(compact) {
        Ok(bytes) if !bytes.is_empty() => Ok(bytes),
        Ok(_) => Err(SpeaksForError::malformed(format!("RSAKeyValue {name} is empty"))),
        Err(e) => Err(SpeaksForError::malformed(format!("RSAKeyValue {name}: {e}"))),
    }
}

/// Parse a timezone-aware timestamp. Naive timestamps are rejected.
///
/// Accepts RFC 3339 (`2027-01-01T00:00:00Z`) and the space-separated form
/// with an explicit offset (`2027-01-01 00:00:00.123456+00:00`).
pub fn parse_timestamp(value: &str) -> SpeaksForResult<DateTime<FixedOffset>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .map_err(|e| {
            SpeaksForError::malformed(format!(
                "expires {value:?} is not a timezone-aware timestamp: {e}"
            ))
        })
}

/// Read only the expiration of a credential.
///
/// Accepts a `signed-credential` or a bare `credential` document and performs
/// no other validation. Returns `None` when the expiration can't be read.
pub fn credential_expiration(document: &[u8]) -> Option<DateTime<FixedOffset>> {
    let read = || -> SpeaksForResult<DateTime<FixedOffset>> {
        let root = xml::parse_document(document)?;
        let credential = if root.name == "credential" {
            &root
        } else {
            root.descendants_named("credential")
                .into_iter()
                .next()
                .ok_or_else(|| SpeaksForError::malformed("no credential element"))?
        };
        let expires = credential
            .descendants_named("expires")
            .into_iter()
            .next()
            .ok_or_else(|| SpeaksForError::malformed("no expires element"))?;
        parse_timestamp(xml::required_text(expires)?)
    };

    match read() {
        Ok(expires) => Some(expires),
        Err(e) => {
            tracing::error!(error = %e, "failed to parse credential for expiration time");
            None
        }
    }
}

fn context(err: SpeaksForError, what: &str) -> SpeaksForError {
    match err {
        SpeaksForError::MalformedCredential { reason } => {
            SpeaksForError::malformed(format!("{what}: {reason}"))
        }
        other => other,
    }
}

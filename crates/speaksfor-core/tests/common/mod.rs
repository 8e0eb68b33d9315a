#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use speaksfor_core::xml;
use speaksfor_core::{
    Certificate, SignatureCapability, SigningMaterial, SpeaksForError, SpeaksForResult,
    TrustedRoots,
};

pub const ALICE: &str = "urn:publicid:IDN+example.net+user+alice";
pub const BOB: &str = "urn:publicid:IDN+example.net+user+bob";
pub const USER_KEYID: &str = "e621b8e51956a7a85f36f664a4516ace8cf1aa0d";
pub const TOOL_KEYID: &str = "2c4f8baf106e491baf4433f74080851ebf68a218";

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).unwrap()
}

pub fn cert(name: &str) -> Certificate {
    Certificate::from_pem(&fixture(&format!("{name}_cert.pem"))).unwrap()
}

pub fn key(name: &str) -> String {
    fixture(&format!("{name}_key.pem"))
}

pub fn ma_roots() -> TrustedRoots {
    TrustedRoots::new(vec![cert("ma")])
}

/// Byte range of the `<credential>` element in a document.
fn credential_span(document: &[u8]) -> Option<std::ops::Range<usize>> {
    let text = std::str::from_utf8(document).ok()?;
    let start = text.find("<credential ").or_else(|| text.find("<credential>"))?;
    let close = "</credential>";
    let end = text[start..].find(close)? + start + close.len();
    Some(start..end)
}

/// RSA-SHA1 check of `SignatureValue` over the raw `<credential>` bytes.
fn signature_verifies(document: &[u8], key: &RsaPublicKey) -> SpeaksForResult<bool> {
    let Some(span) = credential_span(document) else {
        return Ok(false);
    };
    let root = xml::parse_document(document)?;
    let signature = xml::exactly_one_descendant(&root, "SignatureValue")
        .and_then(xml::required_text)?;
    let Ok(signature) = BASE64.decode(signature.trim()) else {
        return Ok(false);
    };
    Ok(key
        .verify(Pkcs1v15Sign::new::<Sha1>(), &Sha1::digest(&document[span]), &signature)
        .is_ok())
}

fn public_key(cert: &Certificate) -> SpeaksForResult<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_der(cert.public_key_bits()).map_err(|e| SpeaksForError::Io {
        message: e.to_string(),
    })
}

/// XML-DSig stand-in: RSA-SHA1 over the raw bytes of the `<credential>`
/// element, written into the skeleton's `DigestValue` and `SignatureValue`.
/// Signing also fills `KeyValue` with the signing key, as `xmlsec1` does.
#[derive(Default)]
pub struct FakeDsig {
    pub verify_calls: AtomicUsize,
}

impl FakeDsig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }
}

impl SignatureCapability for FakeDsig {
    fn verify(&self, document: &[u8], signer: &Certificate) -> SpeaksForResult<bool> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        signature_verifies(document, &public_key(signer)?)
    }

    fn sign(&self, template: &[u8], material: &SigningMaterial<'_>) -> SpeaksForResult<Vec<u8>> {
        let span = credential_span(template).ok_or_else(|| SpeaksForError::Io {
            message: "no credential element to sign".into(),
        })?;
        let digest = Sha1::digest(&template[span]);

        let key = RsaPrivateKey::from_pkcs8_pem(material.private_key_pem).map_err(|e| {
            SpeaksForError::Io {
                message: e.to_string(),
            }
        })?;
        let signature = key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|e| SpeaksForError::Io {
                message: e.to_string(),
            })?;

        let public = key.to_public_key();
        let certs: String = material
            .certificate_chain
            .iter()
            .map(|c| format!("<X509Certificate>{}</X509Certificate>", c.base64_body()))
            .collect();

        let text = String::from_utf8_lossy(template)
            .replace(
                "<DigestValue/>",
                &format!("<DigestValue>{}</DigestValue>", BASE64.encode(digest)),
            )
            .replace(
                "<SignatureValue/>",
                &format!("<SignatureValue>{}</SignatureValue>", BASE64.encode(signature)),
            )
            .replace(
                "<Modulus/>",
                &format!("<Modulus>{}</Modulus>", BASE64.encode(public.n().to_bytes_be())),
            )
            .replace(
                "<Exponent/>",
                &format!("<Exponent>{}</Exponent>", BASE64.encode(public.e().to_bytes_be())),
            )
            .replace("<X509Certificate/>", &certs);
        Ok(text.into_bytes())
    }
}

/// Verifier that takes the key from an inline `RSAKeyValue` when the
/// document has one, the way an unrestricted `xmlsec1 --verify` does.
pub struct InlineKeyDsig;

impl SignatureCapability for InlineKeyDsig {
    fn verify(&self, document: &[u8], signer: &Certificate) -> SpeaksForResult<bool> {
        let assertion = speaksfor_core::parse_credential(document)?;
        let key = match assertion.key_value {
            Some(inline) => RsaPublicKey::new(
                BigUint::from_bytes_be(&inline.modulus),
                BigUint::from_bytes_be(&inline.exponent),
            )
            .map_err(|e| SpeaksForError::Io {
                message: e.to_string(),
            })?,
            None => public_key(signer)?,
        };
        signature_verifies(document, &key)
    }

    fn sign(&self, template: &[u8], material: &SigningMaterial<'_>) -> SpeaksForResult<Vec<u8>> {
        FakeDsig::new().sign(template, material)
    }
}

/// Capability that cannot be reached.
pub struct BrokenDsig;

impl SignatureCapability for BrokenDsig {
    fn verify(&self, _: &[u8], _: &Certificate) -> SpeaksForResult<bool> {
        Err(SpeaksForError::Io {
            message: "xmlsec1 timed out after 30s".into(),
        })
    }

    fn sign(&self, _: &[u8], _: &SigningMaterial<'_>) -> SpeaksForResult<Vec<u8>> {
        Err(SpeaksForError::Io {
            message: "xmlsec1 timed out after 30s".into(),
        })
    }
}

//! Speaks-for credential issuance.
//!
//! The user signs `U.speaks_for(U) <- T` with their own key. The unsigned
//! document carries an empty XML-DSig skeleton (exclusive C14N, enveloped
//! signature, SHA-1 digest, RSA-SHA1) that the signing capability fills in.

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use pkcs8::DecodePrivateKey;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::capability::{SignatureCapability, SigningMaterial};
use crate::cert::Certificate;
use crate::config::SpeaksForConfig;
use crate::credential::{parse_credential, SPEAKS_FOR_ROLE_PREFIX};
use crate::error::{SpeaksForError, SpeaksForResult};

/// RT0 version written into issued credentials.
pub const ABAC_VERSION: &str = "1.1";

/// Default lifetime of an issued credential.
pub const DEFAULT_LIFETIME_DAYS: i64 = 365;

const SIGNATURE_SKELETON: &str = r##"<signatures>
<Signature xmlns="http://www.w3.org/2000/09/xmldsig#" xml:id="Sig_ref0">
<SignedInfo>
<CanonicalizationMethod Algorithm="http://www.w3.org/2001/10/xml-exc-c14n#"/>
<SignatureMethod Algorithm="http://www.w3.org/2000/09/xmldsig#rsa-sha1"/>
<Reference URI="#ref0">
<Transforms>
<Transform Algorithm="http://www.w3.org/2000/09/xmldsig#enveloped-signature"/>
</Transforms>
<DigestMethod Algorithm="http://www.w3.org/2000/09/xmldsig#sha1"/>
<DigestValue/>
</Reference>
</SignedInfo>
<SignatureValue/>
<KeyInfo>
<KeyValue>
<RSAKeyValue>
<Modulus/>
<Exponent/>
</RSAKeyValue>
</KeyValue>
<X509Data>
<X509Certificate/>
<X509SubjectName/>
<X509IssuerSerial/>
</X509Data>
</KeyInfo>
</Signature>
</signatures>"##;

/// Unsigned speaks-for document for `user` and `tool`, expiring at `expires`.
pub fn render_template(user: &Certificate, tool: &Certificate, expires: DateTime<Utc>) -> String {
    let user_keyid = user.key_id().to_hex();
    let tool_keyid = tool.key_id().to_hex();
    let expires = expires.to_rfc3339_opts(SecondsFormat::Secs, true);

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<signed-credential>
<credential xml:id="ref0">
<type>abac</type>
<serial/>
<owner_gid/>
<target_gid/>
<uuid/>
<expires>{expires}</expires>
<abac>
<rt0>
<version>{ABAC_VERSION}</version>
<head>
<ABACprincipal><keyid>{user_keyid}</keyid></ABACprincipal>
<role>{SPEAKS_FOR_ROLE_PREFIX}{user_keyid}</role>
</head>
<tail>
<ABACprincipal><keyid>{tool_keyid}</keyid></ABACprincipal>
</tail>
</rt0>
</abac>
</credential>
{SIGNATURE_SKELETON}
</signed-credential>
"#
    )
}

/// Issues speaks-for credentials through a signing capability.
#[derive(Debug, Clone)]
pub struct SpeaksForIssuer<C> {
    capability: C,
    lifetime: TimeDelta,
    now: Option<DateTime<Utc>>,
}

impl<C: SignatureCapability> SpeaksForIssuer<C> {
    pub fn new(capability: C) -> Self {
        Self {
            capability,
            lifetime: TimeDelta::days(DEFAULT_LIFETIME_DAYS),
            now: None,
        }
    }

    pub fn from_config(capability: C, config: &SpeaksForConfig) -> SpeaksForResult<Self> {
        config.validate()?;
        Self::new(capability).with_lifetime_days(config.credential_lifetime_days)
    }

    pub fn with_lifetime_days(mut self, days: i64) -> SpeaksForResult<Self> {
        self.lifetime = TimeDelta::try_days(days)
            .filter(|d| *d > TimeDelta::zero())
            .ok_or_else(|| SpeaksForError::Config {
                message: format!("invalid credential lifetime: {days} days"),
            })?;
        Ok(self)
    }

    /// Issue as if the current time were `now`.
    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Build and sign a credential letting `tool_cert` speak for `user_cert`.
    ///
    /// `issuer_cert` is embedded after the user certificate so verifiers can
    /// build the path to their trusted roots.
    pub fn issue(
        &self,
        tool_cert: &Certificate,
        user_cert: &Certificate,
        user_key_pem: &str,
        issuer_cert: &Certificate,
    ) -> SpeaksForResult<Vec<u8>> {
        check_key_matches(user_key_pem, user_cert)?;

        let now = self.now.unwrap_or_else(Utc::now);
        let expires = now
            .checked_add_signed(self.lifetime)
            .ok_or_else(|| SpeaksForError::Config {
                message: "credential expiration out of range".into(),
            })?;
        let template = render_template(user_cert, tool_cert, expires);

        let chain = [user_cert.clone(), issuer_cert.clone()];
        let material = SigningMaterial {
            private_key_pem: user_key_pem,
            certificate_chain: &chain,
        };
        let signed = self.capability.sign(template.as_bytes(), &material)?;

        let assertion = parse_credential(&signed).map_err(|e| {
            SpeaksForError::io(format!("signing produced an unreadable credential: {e}"))
        })?;
        if assertion.signer_cert != *user_cert {
            return Err(SpeaksForError::io(
                "signed credential does not embed the user certificate first",
            ));
        }
        if let Some(key_value) = &assertion.key_value {
            if !key_value.matches(user_cert) {
                return Err(SpeaksForError::io(
                    "signed credential carries a KeyValue that is not the user's key",
                ));
            }
        }
        Ok(signed)
    }

    /// Issue from files and write the credential to `output`.
    pub fn create_speaks_for(
        &self,
        tool_cert_path: &Path,
        user_cert_path: &Path,
        user_key_path: &Path,
        issuer_cert_path: &Path,
        output: &Path,
    ) -> SpeaksForResult<()> {
        let tool_cert = Certificate::load(tool_cert_path)?;
        let user_cert = Certificate::load(user_cert_path)?;
        let issuer_cert = Certificate::load(issuer_cert_path)?;
        let user_key = std::fs::read_to_string(user_key_path).map_err(|e| {
            SpeaksForError::io(format!(
                "failed to read private key {}: {e}",
                user_key_path.display()
            ))
        })?;

        let signed = self.issue(&tool_cert, &user_cert, &user_key, &issuer_cert)?;
        write_atomic(output, &signed)?;

        tracing::info!(
            output = %output.display(),
            "created ABAC credential {} speaks_for {}",
            tool_cert.subject_urn().as_deref().unwrap_or("<no urn>"),
            user_cert.subject_urn().as_deref().unwrap_or("<no urn>"),
        );
        Ok(())
    }
}

/// Issue a credential from files with the default lifetime.
pub fn create_speaks_for<C: SignatureCapability>(
    tool_cert_path: &Path,
    user_cert_path: &Path,
    user_key_path: &Path,
    issuer_cert_path: &Path,
    output: &Path,
    capability: C,
) -> SpeaksForResult<()> {
    SpeaksForIssuer::new(capability).create_speaks_for(
        tool_cert_path,
        user_cert_path,
        user_key_path,
        issuer_cert_path,
        output,
    )
}

/// The private key must belong to `cert`. Accepts PKCS#8 or PKCS#1 PEM.
fn check_key_matches(key_pem: &str, cert: &Certificate) -> SpeaksForResult<()> {
    let private = RsaPrivateKey::from_pkcs8_pem(key_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(key_pem))
        .map_err(|e| SpeaksForError::bad_cert(format!("invalid RSA private key: {e}")))?;
    let cert_key = RsaPublicKey::from_pkcs1_der(cert.public_key_bits())
        .map_err(|e| SpeaksForError::bad_cert(format!("user certificate key is not RSA: {e}")))?;

    if RsaPublicKey::from(&private) != cert_key {
        return Err(SpeaksForError::bad_cert(format!(
            "private key does not match user certificate {}",
            cert.key_id()
        )));
    }
    Ok(())
}

/// Write via a temporary file in the target directory, then rename.
fn write_atomic(path: &Path, contents: &[u8]) -> SpeaksForResult<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut temp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| SpeaksForError::io(format!("failed to create temp file: {e}")))?;
    temp.write_all(contents)
        .and_then(|()| temp.flush())
        .map_err(|e| SpeaksForError::io(format!("failed to write temp file: {e}")))?;
    temp.persist(path)
        .map_err(|e| SpeaksForError::io(format!("failed to rename temp file: {}", e.error)))?;
    Ok(())
}

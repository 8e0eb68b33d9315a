//! ABAC speaks-for credential verification and issuance.
//!
//! A speaks-for credential is an ABAC statement `U.speaks_for(U) <- T`, signed
//! by user U, that lets tool T act with U's authority. This crate provides:
//!
//! - Certificate key identity (SHA-1 of the raw public-key bits)
//! - Credential parsing with strict singleton checks
//! - Ordered verification gates (expiration, signature, statement, URN, chain)
//! - Effective-identity selection over a list of candidate credentials
//! - Credential issuance
//!
//! XML-DSig signing and verification is delegated to a [`SignatureCapability`];
//! [`Xmlsec1`] runs the `xmlsec1` tool.
//!
//! # Quick Start
//!
//! ```no_run
//! use speaksfor_core::{
//!     determine_speaks_for, Certificate, CredentialRef, SpeaksForOptions, TrustedRoots, Xmlsec1,
//! };
//!
//! # fn example() -> anyhow::Result<()> {
//! let roots = TrustedRoots::from_directory("/etc/speaksfor/trusted_roots".as_ref())?;
//! let caller = Certificate::load("tool_cert.pem".as_ref())?;
//! let credential = std::fs::read_to_string("speaks_for.xml")?;
//!
//! let effective = determine_speaks_for(
//!     &[CredentialRef::abac(credential)],
//!     &caller,
//!     &SpeaksForOptions::speaking_for("urn:publicid:IDN+example.net+user+alice"),
//!     &roots,
//!     Xmlsec1::default(),
//! );
//! println!("acting as {:?}", effective.subject_urn());
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `SPEAKSFOR_XMLSEC1` | Path to `xmlsec1` (default: `xmlsec1` on `PATH`) |
//! | `SPEAKSFOR_TIMEOUT` | Timeout for each `xmlsec1` call in seconds (default: 30) |
//! | `SPEAKSFOR_TRUSTED_ROOTS` | Directory of trusted root certificates |
//! | `SPEAKSFOR_CREDENTIAL_LIFETIME_DAYS` | Lifetime of issued credentials (default: 365) |

pub mod capability;
pub mod cert;
pub mod chain;
pub mod config;
pub mod credential;
pub mod error;
pub mod gate;
pub mod issue;
pub mod orchestrator;
pub mod semantics;
pub mod verify;
pub mod xml;

// Re-export main types
pub use capability::{ScratchDir, SignatureCapability, SigningMaterial, Xmlsec1};
pub use cert::{Certificate, KeyId, URN_PREFIX};
pub use chain::{ChainError, TrustedRoots, AGGREGATE_ROOTS_FILE, MAX_PATH_DEPTH};
pub use config::SpeaksForConfig;
pub use credential::{credential_expiration, parse_credential, Assertion, Head, RsaKeyValue, Tail};
pub use error::{FailureKind, SpeaksForError, SpeaksForResult};
pub use gate::{Gate, VerificationContext, GATES};
pub use issue::{create_speaks_for, render_template, SpeaksForIssuer, ABAC_VERSION};
pub use orchestrator::{
    determine_speaks_for, determine_speaks_for_parallel, CredentialKind, CredentialRef,
    SpeaksForOptions, GENI_ABAC, GENI_SPEAKING_FOR, MAX_CONCURRENT_VERIFICATIONS,
};
pub use verify::{verify_speaks_for, SpeaksForVerifier, VerificationReport, VerificationResult};

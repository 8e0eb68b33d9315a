//! External XML-signature capability.
//!
//! Canonicalization and RSA-SHA1 XML-DSig are not implemented here. The
//! pipeline calls a [`SignatureCapability`]; production uses [`Xmlsec1`],
//! which runs the `xmlsec1` tool on scoped temporary files:
//! - every file lives in a [`ScratchDir`] that is removed when the call returns,
//!   on success and on every error path
//! - every child process is bounded by a timeout and killed when it expires
//! - verification only accepts the key of the signer certificate handed in by
//!   the caller, never a `KeyValue` carried in the document

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStderr, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tempfile::{NamedTempFile, TempDir};

use crate::cert::Certificate;
use crate::config::SpeaksForConfig;
use crate::error::{SpeaksForError, SpeaksForResult};

/// Cap on captured stderr.
const MAX_STDERR_BYTES: usize = 4096;

/// Key material handed to the signing side.
pub struct SigningMaterial<'a> {
    /// Signer's private key, PEM.
    pub private_key_pem: &'a str,
    /// Signer certificate first, then the issuer chain to embed.
    pub certificate_chain: &'a [Certificate],
}

/// XML-DSig verification and signing.
///
/// `verify` must be handed the original document bytes: re-serializing a
/// parsed tree changes whitespace and prefixes and breaks the digest.
pub trait SignatureCapability: Send + Sync {
    /// Verify the enveloped signature over `<credential>` with the public key
    /// of `signer`, the document's own first `X509Certificate`. No other key
    /// may be used. `Ok(false)` is a bad signature; `Err` means the capability
    /// itself could not run.
    fn verify(&self, document: &[u8], signer: &Certificate) -> SpeaksForResult<bool>;

    /// Fill the signature skeleton of `template` and return the signed document.
    fn sign(&self, template: &[u8], material: &SigningMaterial<'_>) -> SpeaksForResult<Vec<u8>>;
}

impl<T: SignatureCapability + ?Sized> SignatureCapability for &T {
    fn verify(&self, document: &[u8], signer: &Certificate) -> SpeaksForResult<bool> {
        (**self).verify(document, signer)
    }

    fn sign(&self, template: &[u8], material: &SigningMaterial<'_>) -> SpeaksForResult<Vec<u8>> {
        (**self).sign(template, material)
    }
}

impl<T: SignatureCapability + ?Sized> SignatureCapability for Box<T> {
    fn verify(&self, document: &[u8], signer: &Certificate) -> SpeaksForResult<bool> {
        (**self).verify(document, signer)
    }

    fn sign(&self, template: &[u8], material: &SigningMaterial<'_>) -> SpeaksForResult<Vec<u8>> {
        (**self).sign(template, material)
    }
}

/// Temporary directory owned by one call. Removed on drop.
pub struct ScratchDir {
    // Dropped before `dir`.
    files: Vec<NamedTempFile>,
    dir: TempDir,
}

impl ScratchDir {
    /// Create under the system temporary directory.
    pub fn new() -> SpeaksForResult<Self> {
        Self::new_in(&std::env::temp_dir())
    }

    pub fn new_in(root: &Path) -> SpeaksForResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("speaksfor-")
            .tempdir_in(root)
            .map_err(|e| SpeaksForError::io(format!("creating scratch directory: {e}")))?;
        Ok(Self {
            files: Vec::new(),
            dir,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `contents` to a new owner-only file and return its path.
    pub fn write(&mut self, prefix: &str, suffix: &str, contents: &[u8]) -> SpeaksForResult<PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix(prefix)
            .suffix(suffix)
            .tempfile_in(self.dir.path())
            .map_err(|e| SpeaksForError::io(format!("creating {prefix} scratch file: {e}")))?;
        file.write_all(contents)
            .and_then(|()| file.flush())
            .map_err(|e| SpeaksForError::io(format!("writing {prefix} scratch file: {e}")))?;
        let path = file.path().to_path_buf();
        self.files.push(file);
        Ok(path)
    }

    /// Path for a file the child process will create.
    pub fn output_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

/// `xmlsec1` command-line binding.
#[derive(Debug, Clone)]
pub struct Xmlsec1 {
    binary: PathBuf,
    timeout: Duration,
    trusted_pems: Vec<PathBuf>,
    scratch_root: Option<PathBuf>,
}

/// Outcome of one `xmlsec1` run.
#[derive(Debug)]
struct RunOutcome {
    status: ExitStatus,
    stderr: String,
}

impl Xmlsec1 {
    pub fn new(binary: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            trusted_pems: Vec::new(),
            scratch_root: None,
        }
    }

    pub fn from_config(config: &SpeaksForConfig) -> Self {
        Self::new(config.xmlsec1_path.clone(), config.timeout())
    }

    /// Pass `--trusted-pem <path>` on verification.
    pub fn with_trusted_pem(mut self, path: impl Into<PathBuf>) -> Self {
        self.trusted_pems.push(path.into());
        self
    }

    /// Create scratch directories under `root` instead of the system temp dir.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn scratch(&self) -> SpeaksForResult<ScratchDir> {
        match &self.scratch_root {
            Some(root) => ScratchDir::new_in(root),
            None => ScratchDir::new(),
        }
    }

    fn run(&self, args: &[&std::ffi::OsStr]) -> SpeaksForResult<RunOutcome> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                SpeaksForError::io(format!("spawning {}: {e}", self.binary.display()))
            })?;

        // Drained while polling so a chatty child never blocks on a full pipe.
        // On timeout the thread is left to finish when the pipe closes.
        let stderr = child.stderr.take();
        let drain = std::thread::spawn(move || drain_stderr(stderr));

        match wait_timeout(&mut child, self.timeout) {
            Ok(Some(status)) => Ok(RunOutcome {
                status,
                stderr: drain.join().unwrap_or_default(),
            }),
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(
                    binary = %self.binary.display(),
                    timeout_secs = self.timeout.as_secs(),
                    "xmlsec1 timed out"
                );
                Err(SpeaksForError::io(format!(
                    "{} timed out after {}s",
                    self.binary.display(),
                    self.timeout.as_secs()
                )))
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(SpeaksForError::io(format!("waiting for xmlsec1: {e}")))
            }
        }
    }
}

impl Default for Xmlsec1 {
    fn default() -> Self {
        Self::from_config(&SpeaksForConfig::default())
    }
}

impl SignatureCapability for Xmlsec1 {
    fn verify(&self, document: &[u8], signer: &Certificate) -> SpeaksForResult<bool> {
        let mut scratch = self.scratch()?;
        let cred_file = scratch.write("cred-", ".xml", document)?;
        let signer_pem = scratch.write("signer-", ".pem", signer.to_pem().as_bytes())?;

        // Only named keys from the manager: inline KeyValue and X509Data are
        // not consulted, so the signer certificate's key is the only candidate.
        let mut args: Vec<&std::ffi::OsStr> = vec![
            "--verify".as_ref(),
            "--enabled-key-data".as_ref(),
            "key-name".as_ref(),
            "--pubkey-cert-pem".as_ref(),
            signer_pem.as_os_str(),
        ];
        for pem in &self.trusted_pems {
            args.push("--trusted-pem".as_ref());
            args.push(pem.as_os_str());
        }
        args.push(cred_file.as_os_str());

        let outcome = self.run(&args)?;
        if !outcome.status.success() {
            tracing::debug!(
                code = ?outcome.status.code(),
                stderr = %outcome.stderr,
                "xmlsec1 rejected signature"
            );
        }
        Ok(outcome.status.success())
    }

    fn sign(&self, template: &[u8], material: &SigningMaterial<'_>) -> SpeaksForResult<Vec<u8>> {
        if material.certificate_chain.is_empty() {
            return Err(SpeaksForError::bad_cert("no signer certificate supplied"));
        }

        let mut scratch = self.scratch()?;
        let unsigned = scratch.write("unsigned-", ".xml", template)?;
        let key = scratch.write("key-", ".pem", material.private_key_pem.as_bytes())?;
        let mut pems = key.display().to_string();
        for (i, cert) in material.certificate_chain.iter().enumerate() {
            let path = scratch.write(&format!("cert{i}-"), ".pem", cert.to_pem().as_bytes())?;
            pems.push(',');
            pems.push_str(&path.display().to_string());
        }
        let output = scratch.output_path("signed.xml");

        let args: Vec<&std::ffi::OsStr> = vec![
            "--sign".as_ref(),
            "--privkey-pem".as_ref(),
            pems.as_ref(),
            "--output".as_ref(),
            output.as_os_str(),
            unsigned.as_os_str(),
        ];
        let outcome = self.run(&args)?;
        if !outcome.status.success() {
            return Err(SpeaksForError::io(format!(
                "xmlsec1 --sign failed ({:?}): {}",
                outcome.status.code(),
                outcome.stderr.trim()
            )));
        }

        std::fs::read(&output)
            .map_err(|e| SpeaksForError::io(format!("reading signed credential: {e}")))
    }
}

/// Read stderr to the end, keeping the first [`MAX_STDERR_BYTES`].
fn drain_stderr(stderr: Option<ChildStderr>) -> String {
    let mut kept = Vec::new();
    if let Some(mut stderr) = stderr {
        let _ = (&mut stderr)
            .take(MAX_STDERR_BYTES as u64)
            .read_to_end(&mut kept);
        let _ = std::io::copy(&mut stderr, &mut std::io::sink());
    }
    String::from_utf8_lossy(&kept).into_owned()
}

/// Poll a child until it exits or `timeout` elapses. `Ok(None)` on timeout.
fn wait_timeout(
    child: &mut std::process::Child,
    timeout: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    let poll_interval = Duration::from_millis(20);

    loop {
        match child.try_wait()? {
            Some(status) => return Ok(Some(status)),
            None => {
                if start.elapsed() >= timeout {
                    return Ok(None);
                }
                std::thread::sleep(poll_interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;

    const USER_PEM: &str = include_str!("../tests/fixtures/user_cert.pem");

    fn signer() -> Certificate {
        Certificate::from_pem(USER_PEM).unwrap()
    }

    #[cfg(unix)]
    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    fn scratch_dirs_left(root: &Path) -> usize {
        std::fs::read_dir(root)
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with("speaksfor-"))
            .count()
    }

    #[test]
    fn test_scratch_dir_removed_on_drop() {
        let mut scratch = ScratchDir::new().unwrap();
        let file = scratch.write("key-", ".pem", b"secret").unwrap();
        let dir = scratch.path().to_path_buf();
        assert!(file.exists());
        assert_eq!(std::fs::read(&file).unwrap(), b"secret");

        drop(scratch);
        assert!(!file.exists());
        assert!(!dir.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_scratch_files_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let mut scratch = ScratchDir::new().unwrap();
        let file = scratch.write("key-", ".pem", b"secret").unwrap();
        let mode = std::fs::metadata(&file).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn test_missing_binary_is_io_error() {
        let xmlsec = Xmlsec1::new("/nonexistent/xmlsec1", Duration::from_secs(5));
        let err = xmlsec.verify(b"<signed-credential/>", &signer()).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Io);
    }

    #[test]
    fn test_sign_requires_certificate() {
        let xmlsec = Xmlsec1::new("/nonexistent/xmlsec1", Duration::from_secs(5));
        let material = SigningMaterial {
            private_key_pem: "",
            certificate_chain: &[],
        };
        let err = xmlsec.sign(b"<x/>", &material).unwrap_err();
        assert_eq!(err.kind(), FailureKind::MalformedCertificate);
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_status_maps_to_verdict() {
        let ok = Xmlsec1::new("true", Duration::from_secs(5));
        assert!(ok.verify(b"<doc/>", &signer()).unwrap());

        let bad = Xmlsec1::new("false", Duration::from_secs(5));
        assert!(!bad.verify(b"<doc/>", &signer()).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let slow = script(dir.path(), "slow-xmlsec1", "sleep 10\n");
        let slow = Xmlsec1::new(&slow, Duration::from_millis(200));

        let start = Instant::now();
        let err = slow.verify(b"<doc/>", &signer()).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Io);
        assert!(err.to_string().contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn test_verify_uses_signer_certificate_key() {
        let dir = TempDir::new().unwrap();
        let record = script(
            dir.path(),
            "record-xmlsec1",
            &format!(
                "echo \"$@\" > {dir}/args\n\
                 while [ $# -gt 0 ]; do\n\
                 if [ \"$1\" = --pubkey-cert-pem ]; then cp \"$2\" {dir}/signer.pem; fi\n\
                 shift\n\
                 done\n",
                dir = dir.path().display()
            ),
        );
        let xmlsec = Xmlsec1::new(&record, Duration::from_secs(5));
        assert!(xmlsec.verify(b"<doc/>", &signer()).unwrap());

        let args = std::fs::read_to_string(dir.path().join("args")).unwrap();
        assert!(args.starts_with("--verify --enabled-key-data key-name --pubkey-cert-pem "));
        let pem = std::fs::read_to_string(dir.path().join("signer.pem")).unwrap();
        assert_eq!(Certificate::from_pem(&pem).unwrap().key_id(), signer().key_id());
    }

    #[cfg(unix)]
    #[test]
    fn test_large_stderr_does_not_stall() {
        let dir = TempDir::new().unwrap();
        let chatty = script(
            dir.path(),
            "chatty-xmlsec1",
            "head -c 200000 /dev/zero | tr '\\0' x >&2\nexit 0\n",
        );
        let xmlsec = Xmlsec1::new(&chatty, Duration::from_secs(5));
        assert!(xmlsec.verify(b"<doc/>", &signer()).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_stderr_capped() {
        let dir = TempDir::new().unwrap();
        let chatty = script(
            dir.path(),
            "failing-xmlsec1",
            "head -c 200000 /dev/zero | tr '\\0' x >&2\nexit 1\n",
        );
        let xmlsec = Xmlsec1::new(&chatty, Duration::from_secs(5));
        let material = SigningMaterial {
            private_key_pem: "key",
            certificate_chain: &[signer()],
        };
        let err = xmlsec.sign(b"<doc/>", &material).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Io);
        assert!(err.to_string().len() < MAX_STDERR_BYTES + 200);
    }

    #[cfg(unix)]
    #[test]
    fn test_scratch_removed_when_calls_fail() {
        let root = TempDir::new().unwrap();
        let material = SigningMaterial {
            private_key_pem: "key",
            certificate_chain: &[signer()],
        };

        let failing = Xmlsec1::new("false", Duration::from_secs(5)).with_scratch_root(root.path());
        assert!(failing.sign(b"<doc/>", &material).is_err());
        assert!(!failing.verify(b"<doc/>", &signer()).unwrap());
        assert_eq!(scratch_dirs_left(root.path()), 0);

        let missing = Xmlsec1::new("/nonexistent/xmlsec1", Duration::from_secs(5))
            .with_scratch_root(root.path());
        assert!(missing.sign(b"<doc/>", &material).is_err());
        assert!(missing.verify(b"<doc/>", &signer()).is_err());
        assert_eq!(scratch_dirs_left(root.path()), 0);

        let bin = TempDir::new().unwrap();
        let slow = script(bin.path(), "slow-xmlsec1", "sleep 10\n");
        let slow = Xmlsec1::new(&slow, Duration::from_millis(200)).with_scratch_root(root.path());
        assert!(slow.sign(b"<doc/>", &material).is_err());
        assert_eq!(scratch_dirs_left(root.path()), 0);
    }
}

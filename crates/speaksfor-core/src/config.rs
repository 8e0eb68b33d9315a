//! Configuration for verification and issuance.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{SpeaksForError, SpeaksForResult};

/// Longest credential lifetime accepted by [`SpeaksForConfig::validate`].
pub const MAX_CREDENTIAL_LIFETIME_DAYS: i64 = 36_500;

/// Speaks-for configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpeaksForConfig {
    /// `xmlsec1` executable, looked up on `PATH` when not absolute.
    #[serde(default = "default_xmlsec1")]
    pub xmlsec1_path: PathBuf,

    /// Timeout for each external signing or verification call.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Directory of trusted root certificates.
    #[serde(default)]
    pub trusted_roots_dir: Option<PathBuf>,

    /// Lifetime of issued credentials.
    #[serde(default = "default_lifetime_days")]
    pub credential_lifetime_days: i64,
}

fn default_xmlsec1() -> PathBuf {
    PathBuf::from("xmlsec1")
}

fn default_timeout() -> u64 {
    30
}

fn default_lifetime_days() -> i64 {
    365
}

impl Default for SpeaksForConfig {
    fn default() -> Self {
        Self {
            xmlsec1_path: default_xmlsec1(),
            timeout_secs: default_timeout(),
            trusted_roots_dir: None,
            credential_lifetime_days: default_lifetime_days(),
        }
    }
}

impl SpeaksForConfig {
    /// Create config from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `SPEAKSFOR_XMLSEC1` | Path to the `xmlsec1` binary |
    /// | `SPEAKSFOR_TIMEOUT` | External call timeout in seconds |
    /// | `SPEAKSFOR_TRUSTED_ROOTS` | Trusted root certificate directory |
    /// | `SPEAKSFOR_CREDENTIAL_LIFETIME_DAYS` | Lifetime of issued credentials |
    ///
    /// Unset or unparsable values fall back to defaults.
    pub fn from_env() -> Self {
        Self {
            xmlsec1_path: std::env::var_os("SPEAKSFOR_XMLSEC1")
                .map(PathBuf::from)
                .unwrap_or_else(default_xmlsec1),
            timeout_secs: std::env::var("SPEAKSFOR_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_timeout),
            trusted_roots_dir: std::env::var_os("SPEAKSFOR_TRUSTED_ROOTS").map(PathBuf::from),
            credential_lifetime_days: std::env::var("SPEAKSFOR_CREDENTIAL_LIFETIME_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_lifetime_days),
        }
    }

    /// Parse YAML configuration.
    pub fn from_yaml(yaml: &str) -> SpeaksForResult<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| SpeaksForError::Config {
            message: format!("invalid config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML configuration file.
    pub fn from_file(path: &Path) -> SpeaksForResult<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| SpeaksForError::Config {
            message: format!("failed to read config {}: {e}", path.display()),
        })?;
        Self::from_yaml(&yaml)
    }

    pub fn with_xmlsec1_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.xmlsec1_path = path.into();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_trusted_roots_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trusted_roots_dir = Some(dir.into());
        self
    }

    pub fn with_credential_lifetime_days(mut self, days: i64) -> Self {
        self.credential_lifetime_days = days;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reject values that can't work.
    pub fn validate(&self) -> SpeaksForResult<()> {
        if self.timeout_secs == 0 {
            return Err(SpeaksForError::Config {
                message: "timeout_secs must be positive".into(),
            });
        }
        if self.credential_lifetime_days <= 0 {
            return Err(SpeaksForError::Config {
                message: format!(
                    "credential_lifetime_days must be positive, got {}",
                    self.credential_lifetime_days
                ),
            });
        }
        if self.credential_lifetime_days > MAX_CREDENTIAL_LIFETIME_DAYS {
            return Err(SpeaksForError::Config {
                message: format!(
                    "credential_lifetime_days must be at most {MAX_CREDENTIAL_LIFETIME_DAYS}"
                ),
            });
        }
        if self.xmlsec1_path.as_os_str().is_empty() {
            return Err(SpeaksForError::Config {
                message: "xmlsec1_path is empty".into(),
            });
        }
        Ok(())
    }
}

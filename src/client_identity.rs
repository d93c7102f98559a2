//! Client identity and the artifact paths derived from it.
//!
//! The id ends up in a subprocess argument and in every artifact filename, so
//! it is validated once here and nowhere else.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{IdentityError, Result};

const CA_CERT_FILENAME: &str = "ca.crt";

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.@-]{0,63}$").expect("client id pattern is valid")
    })
}

/// Check that `id` is safe to use as a filename stem and a command argument.
pub fn validate_id(id: &str) -> Result<()> {
    if !id_pattern().is_match(id) {
        return Err(IdentityError::InvalidIdentity {
            id: id.to_string(),
            reason: "must match [A-Za-z0-9][A-Za-z0-9_.@-]{0,63}".to_string(),
        });
    }
    if id.contains("..") {
        return Err(IdentityError::InvalidIdentity {
            id: id.to_string(),
            reason: "must not contain '..'".to_string(),
        });
    }
    Ok(())
}

/// A client entitled to a certificate/key pair.
///
/// Key material always lives in `key_dir`. Rendered profiles and the bundle
/// archive go to `destination` when one is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    id: String,
    key_dir: PathBuf,
    client_prefix: String,
    destination: Option<PathBuf>,
}

impl ClientIdentity {
    pub fn new(
        id: impl Into<String>,
        key_dir: impl Into<PathBuf>,
        client_prefix: impl Into<String>,
    ) -> Result<Self> {
        let id = id.into();
        validate_id(&id)?;
        Ok(Self {
            id,
            key_dir: key_dir.into(),
            client_prefix: client_prefix.into(),
            destination: None,
        })
    }

    pub fn with_destination(mut self, destination: Option<PathBuf>) -> Self {
        self.destination = destination;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key_dir(&self) -> &Path {
        &self.key_dir
    }

    /// Directory receiving profiles and the archive.
    pub fn output_dir(&self) -> &Path {
        self.destination.as_deref().unwrap_or(&self.key_dir)
    }

    pub fn cert_filename(&self) -> String {
        format!("{}.crt", self.id)
    }

    pub fn key_filename(&self) -> String {
        format!("{}.key", self.id)
    }

    pub fn bundle_filename(&self) -> String {
        format!("{}.tar.gz", self.id)
    }

    /// `<prefix>-<id>`, the stem of both rendered profiles.
    pub fn client_basename(&self) -> String {
        format!("{}-{}", self.client_prefix, self.id)
    }

    pub fn conf_filename(&self) -> String {
        format!("{}.conf", self.client_basename())
    }

    pub fn ovpn_filename(&self) -> String {
        format!("{}.ovpn", self.client_basename())
    }

    pub fn cert_path(&self) -> PathBuf {
        self.key_dir.join(self.cert_filename())
    }

    pub fn key_path(&self) -> PathBuf {
        self.key_dir.join(self.key_filename())
    }

    pub fn csr_path(&self) -> PathBuf {
        self.key_dir.join(format!("{}.csr", self.id))
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.key_dir.join(CA_CERT_FILENAME)
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.output_dir().join(self.bundle_filename())
    }

    pub fn conf_path(&self) -> PathBuf {
        self.output_dir().join(self.conf_filename())
    }

    pub fn ovpn_path(&self) -> PathBuf {
        self.output_dir().join(self.ovpn_filename())
    }

    /// Every artifact removed once the certificate is revoked.
    pub fn revocation_artifacts(&self) -> [PathBuf; 6] {
        [
            self.bundle_path(),
            self.cert_path(),
            self.key_path(),
            self.csr_path(),
            self.conf_path(),
            self.ovpn_path(),
        ]
    }
}

impl std::fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.id)
    }
}

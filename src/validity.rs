//! Certificate Validity Checker
//!
//! A client certificate is valid iff it chains to the CA certificate in the
//! key directory, is inside its validity window, and is not listed on the CA's
//! CRL. This is the predicate that gates revocation and confirms it afterwards.
//!
//! A CRL that does not verify against the CA key is [`IdentityError::UntrustedCrl`].
//! One that verifies but is past `nextUpdate` is [`IdentityError::StaleCrl`]:
//! the caller decides whether an outdated answer is usable.

use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use openssl::asn1::Asn1Time;
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{CrlStatus, X509Crl, X509StoreContext, X509};
use tracing::{debug, warn};

use crate::error::{IdentityError, Result};

const CA_CERT_FILENAME: &str = "ca.crt";

pub trait ValidityChecker: Send + Sync {
    /// Whether `<key_dir>/<cert_filename>` is currently accepted by the CA.
    fn is_valid(&self, key_dir: &Path, cert_filename: &str) -> Result<bool>;
}

/// Verifies with the openssl library against `ca.crt` and the CRL file.
#[derive(Debug, Clone)]
pub struct OpensslValidityChecker {
    crl_filename: String,
}

impl Default for OpensslValidityChecker {
    fn default() -> Self {
        Self::new("crl.pem")
    }
}

impl OpensslValidityChecker {
    pub fn new(crl_filename: impl Into<String>) -> Self {
        Self {
            crl_filename: crl_filename.into(),
        }
    }

    fn load_ca(&self, key_dir: &Path) -> Result<X509> {
        let path = key_dir.join(CA_CERT_FILENAME);
        let pem = fs::read(&path).map_err(|e| IdentityError::fs(&path, e))?;
        X509::from_pem(&pem).map_err(|e| IdentityError::cert(&path, e))
    }

    fn chains_to_ca(&self, ca: &X509, cert: &X509, cert_path: &Path) -> Result<bool> {
        let mut store_builder =
            X509StoreBuilder::new().map_err(|e| IdentityError::cert(cert_path, e))?;
        store_builder
            .add_cert(ca.clone())
            .map_err(|e| IdentityError::cert(cert_path, e))?;
        let store = store_builder.build();

        let chain: Stack<X509> = Stack::new().map_err(|e| IdentityError::cert(cert_path, e))?;
        let mut context = X509StoreContext::new().map_err(|e| IdentityError::cert(cert_path, e))?;
        context
            .init(&store, cert, &chain, |c| {
                let verified = c.verify_cert()?;
                if !verified {
                    debug!(error = %c.error(), "chain verification failed");
                }
                Ok(verified)
            })
            .map_err(|e| IdentityError::cert(cert_path, e))
    }

    /// `Ok(true)` when the CRL lists the certificate. A missing CRL means the
    /// CA has not revoked anything yet.
    fn listed_on_crl(&self, key_dir: &Path, ca: &X509, cert: &X509) -> Result<bool> {
        let crl_path = key_dir.join(&self.crl_filename);
        let pem = match fs::read(&crl_path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(IdentityError::fs(&crl_path, e)),
        };
        let crl = X509Crl::from_pem(&pem).map_err(|e| IdentityError::cert(&crl_path, e))?;

        let ca_key = ca.public_key().map_err(|e| IdentityError::cert(&crl_path, e))?;
        let signed_by_ca = crl
            .verify(&ca_key)
            .map_err(|e| IdentityError::cert(&crl_path, e))?;
        if !signed_by_ca {
            return Err(IdentityError::UntrustedCrl {
                path: crl_path,
                reason: "signature does not verify against ca.crt".to_string(),
            });
        }

        if let Some(next_update) = crl.next_update() {
            let now = Asn1Time::days_from_now(0).map_err(|e| IdentityError::cert(&crl_path, e))?;
            let cmp = next_update
                .compare(&now)
                .map_err(|e| IdentityError::cert(&crl_path, e))?;
            if cmp == Ordering::Less {
                return Err(IdentityError::StaleCrl {
                    path: crl_path,
                    next_update: next_update.to_string(),
                });
            }
        }

        Ok(!matches!(crl.get_by_cert(cert), CrlStatus::NotRevoked))
    }
}

impl ValidityChecker for OpensslValidityChecker {
    fn is_valid(&self, key_dir: &Path, cert_filename: &str) -> Result<bool> {
        let cert_path = key_dir.join(cert_filename);
        let pem = match fs::read(&cert_path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(IdentityError::fs(&cert_path, e)),
        };
        let cert = match X509::from_pem(&pem) {
            Ok(cert) => cert,
            Err(e) => {
                warn!(
                    path = %cert_path.display(),
                    error = %e,
                    "unparsable certificate treated as invalid"
                );
                return Ok(false);
            }
        };
        let ca = self.load_ca(key_dir)?;

        if !self.chains_to_ca(&ca, &cert, &cert_path)? {
            return Ok(false);
        }
        if self.listed_on_crl(key_dir, &ca, &cert)? {
            debug!(path = %cert_path.display(), "certificate listed on CRL");
            return Ok(false);
        }
        Ok(true)
    }
}

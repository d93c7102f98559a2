//! Error types for identity lifecycle operations.
//!
//! Every variant is scoped to a single client identity. The batch driver
//! relies on that to keep one failing identity from aborting a run.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Step of the identity lifecycle an error was raised from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Validate,
    Issue,
    Render,
    Archive,
    Revoke,
    RegenerateCrl,
    Verify,
    Cleanup,
    Resolve,
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::Validate => "validate",
            Step::Issue => "issue",
            Step::Render => "render",
            Step::Archive => "archive",
            Step::Revoke => "revoke",
            Step::RegenerateCrl => "regenerate-crl",
            Step::Verify => "verify",
            Step::Cleanup => "cleanup",
            Step::Resolve => "resolve",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid client id {id:?}: {reason}")]
    InvalidIdentity { id: String, reason: String },

    #[error("{step} for {id} failed ({status}): {stderr}")]
    ToolInvocation {
        id: String,
        step: Step,
        status: String,
        stderr: String,
    },

    /// The CA accepted a revocation but the certificate still verifies.
    #[error("{id}: certificate {} is still valid after revocation", cert_path.display())]
    VerificationInconsistency { id: String, cert_path: PathBuf },

    #[error("failed to render {template} for {id}: {source}")]
    TemplateRender {
        id: String,
        template: String,
        #[source]
        source: minijinja::Error,
    },

    #[error("filesystem error on {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate error on {}: {source}", path.display())]
    Certificate {
        path: PathBuf,
        #[source]
        source: openssl::error::ErrorStack,
    },

    /// The CRL cannot be trusted to answer revocation queries.
    #[error("CRL {} unusable: {reason}", path.display())]
    UntrustedCrl { path: PathBuf, reason: String },

    /// The CRL is signed by the CA but past its `nextUpdate`.
    #[error("CRL {} expired at {next_update}", path.display())]
    StaleCrl { path: PathBuf, next_update: String },

    #[error("identity source error: {0}")]
    IdentitySource(String),
}

impl IdentityError {
    pub(crate) fn fs(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        IdentityError::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub(crate) fn cert(path: impl AsRef<Path>, source: openssl::error::ErrorStack) -> Self {
        IdentityError::Certificate {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Client id the error belongs to, when the variant carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            IdentityError::InvalidIdentity { id, .. }
            | IdentityError::ToolInvocation { id, .. }
            | IdentityError::VerificationInconsistency { id, .. }
            | IdentityError::TemplateRender { id, .. } => Some(id),
            _ => None,
        }
    }

    /// True for disagreements between the CA and local verification.
    pub fn is_security_relevant(&self) -> bool {
        matches!(self, IdentityError::VerificationInconsistency { .. })
    }
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// An [`IdentityError`] tagged with the lifecycle step that raised it.
#[derive(Debug, Error)]
#[error("failed at {step}")]
pub struct Failure {
    pub step: Step,
    #[source]
    pub error: IdentityError,
}

impl Failure {
    pub fn new(step: Step, error: IdentityError) -> Self {
        Self { step, error }
    }

    pub fn is_security_relevant(&self) -> bool {
        self.error.is_security_relevant()
    }
}

pub type StepResult<T> = std::result::Result<T, Failure>;

/// Attach the current step to a fallible call.
pub trait AtStep<T> {
    /// Tool failures keep the step they carry, so a failed `gencrl` inside a
    /// revoke is still reported as `regenerate-crl`.
    fn at(self, step: Step) -> StepResult<T>;
}

impl<T> AtStep<T> for Result<T> {
    fn at(self, step: Step) -> StepResult<T> {
        self.map_err(|error| {
            let step = match &error {
                IdentityError::ToolInvocation { step, .. } => *step,
                _ => step,
            };
            Failure::new(step, error)
        })
    }
}

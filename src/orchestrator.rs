//! Identity Lifecycle Orchestrator
//!
//! Reconciles one client identity against the filesystem and the CA.
//!
//! ```text
//! create:  Absent -> Issuing -> Issued -> Bundling -> Bundled
//! revoke:  Valid -> Revoking -> PendingVerification -> Revoked -> CleaningUp -> Removed
//!          Absent (no certificate, nothing to do)
//! ```
//!
//! Every step is guarded by an existence or validity check, so re-running an
//! operation after a failure converges instead of repeating completed work.
//! Nothing is rolled back. A failure carries the [`Step`] it happened in.
//!
//! An expired CRL at the revocation gate is regenerated and checked again
//! before anything is revoked. After revocation an expired CRL is fatal.

use std::path::PathBuf;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};

use crate::bundle::{ArchiveOutcome, Archiver, BundleAssembler, BundleOptions, TarGzArchiver};
use crate::client_identity::ClientIdentity;
use crate::configs::AppConfig;
use crate::error::{AtStep, Failure, IdentityError, Result, Step, StepResult};
use crate::pki_invoker::{CaConfig, KeyParams, PkiInvoker};
use crate::state_probe::{remove_if_exists, FsStateProbe, StateProbe};
use crate::template_renderer::TemplateRenderer;
use crate::validity::ValidityChecker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateState {
    Absent,
    Issuing,
    Issued,
    Bundling,
    Bundled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeState {
    Absent,
    Valid,
    Revoking,
    PendingVerification,
    Revoked,
    CleaningUp,
    Removed,
}

fn enter(identity: &ClientIdentity, state: impl std::fmt::Debug) {
    debug!(id = %identity, ?state, "transition");
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReport {
    pub id: String,
    pub state: CreateState,
    /// pkitool ran during this call
    pub issued: bool,
    pub profiles_written: Vec<PathBuf>,
    pub archive: ArchiveOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevokeReport {
    pub id: String,
    pub state: RevokeState,
    /// `openssl ca -revoke` ran during this call
    pub revoked: bool,
    pub removed: Vec<PathBuf>,
}

/// The per-identity operations a batch run drives.
pub trait IdentityLifecycle: Sync {
    fn create(
        &self,
        identity: &ClientIdentity,
        options: &BundleOptions,
    ) -> StepResult<CreateReport>;
    fn revoke(&self, identity: &ClientIdentity) -> StepResult<RevokeReport>;
}

pub struct IdentityOrchestrator<I, V, R, A = TarGzArchiver, P = FsStateProbe>
where
    I: PkiInvoker,
    V: ValidityChecker,
    R: TemplateRenderer,
    A: Archiver,
    P: StateProbe,
{
    invoker: I,
    validity: V,
    assembler: BundleAssembler<R, A>,
    probe: P,
    key_params: KeyParams,
    ca: CaConfig,
    /// Serializes revoke -> gencrl -> verify across threads.
    revoke_lock: Mutex<()>,
}

impl<I, V, R, A> IdentityOrchestrator<I, V, R, A, FsStateProbe>
where
    I: PkiInvoker,
    V: ValidityChecker,
    R: TemplateRenderer,
    A: Archiver,
{
    pub fn new(
        config: &AppConfig,
        invoker: I,
        validity: V,
        assembler: BundleAssembler<R, A>,
    ) -> Self {
        Self::with_probe(config, invoker, validity, assembler, FsStateProbe)
    }
}

impl<I, V, R, A, P> IdentityOrchestrator<I, V, R, A, P>
where
    I: PkiInvoker,
    V: ValidityChecker,
    R: TemplateRenderer,
    A: Archiver,
    P: StateProbe,
{
    pub fn with_probe(
        config: &AppConfig,
        invoker: I,
        validity: V,
        assembler: BundleAssembler<R, A>,
        probe: P,
    ) -> Self {
        Self {
            invoker,
            validity,
            assembler,
            probe,
            key_params: config.key_params(),
            ca: config.ca_config(),
            revoke_lock: Mutex::new(()),
        }
    }

    /// Ensure the identity has a certificate and an up-to-date bundle.
    pub fn create(
        &self,
        identity: &ClientIdentity,
        options: &BundleOptions,
    ) -> StepResult<CreateReport> {
        let cert_path = identity.cert_path();
        let issued = if options.force || !self.probe.exists(&cert_path) {
            enter(identity, CreateState::Issuing);
            self.invoker.issue(identity, &self.key_params).at(Step::Issue)?;
            if !self.probe.exists(&cert_path) {
                let error = IdentityError::ToolInvocation {
                    id: identity.id().to_string(),
                    step: Step::Issue,
                    status: "exit status: 0".to_string(),
                    stderr: format!("{} was not produced", cert_path.display()),
                };
                return Err(Failure::new(Step::Issue, error));
            }
            true
        } else {
            debug!(id = %identity, "certificate present, skipping issuance");
            false
        };
        enter(identity, CreateState::Issued);

        enter(identity, CreateState::Bundling);
        let outcome = self.assembler.assemble(identity, options, &self.probe)?;

        info!(
            id = %identity,
            issued,
            profiles = outcome.profiles_written.len(),
            archive = ?outcome.archive,
            "identity created"
        );
        Ok(CreateReport {
            id: identity.id().to_string(),
            state: CreateState::Bundled,
            issued,
            profiles_written: outcome.profiles_written,
            archive: outcome.archive,
        })
    }

    /// Revoke the identity's certificate, confirm the CA no longer accepts it,
    /// then delete its artifacts.
    pub fn revoke(&self, identity: &ClientIdentity) -> StepResult<RevokeReport> {
        let cert_path = identity.cert_path();
        if !self.probe.exists(&cert_path) {
            debug!(id = %identity, "no certificate, nothing to revoke");
            return Ok(RevokeReport {
                id: identity.id().to_string(),
                state: RevokeState::Absent,
                revoked: false,
                removed: Vec::new(),
            });
        }

        // Poisoning is ignored: the CRL is re-read from disk under the lock.
        let guard = self
            .revoke_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let cert_filename = identity.cert_filename();
        let revoked = if self.currently_valid(identity)? {
            enter(identity, RevokeState::Valid);
            enter(identity, RevokeState::Revoking);
            self.invoker.revoke(identity, &self.ca).at(Step::Revoke)?;
            true
        } else {
            info!(id = %identity, "certificate already invalid, skipping revocation");
            false
        };

        enter(identity, RevokeState::PendingVerification);
        let still_valid = self
            .validity
            .is_valid(identity.key_dir(), &cert_filename)
            .at(Step::Verify)?;
        if still_valid {
            error!(
                id = %identity,
                cert = %cert_path.display(),
                severity = "critical",
                "certificate still valid after revocation, leaving artifacts in place"
            );
            let error = IdentityError::VerificationInconsistency {
                id: identity.id().to_string(),
                cert_path,
            };
            return Err(Failure::new(Step::Verify, error));
        }
        enter(identity, RevokeState::Revoked);
        drop(guard);

        enter(identity, RevokeState::CleaningUp);
        let mut removed = Vec::new();
        for path in identity.revocation_artifacts() {
            if remove_if_exists(&path).at(Step::Cleanup)? {
                removed.push(path);
            }
        }

        info!(id = %identity, revoked, removed = removed.len(), "identity revoked");
        Ok(RevokeReport {
            id: identity.id().to_string(),
            state: RevokeState::Removed,
            revoked,
            removed,
        })
    }

    /// The revocation gate. An expired CRL says nothing about the certificate,
    /// so it is regenerated from the CA database and consulted again.
    fn currently_valid(&self, identity: &ClientIdentity) -> StepResult<bool> {
        let cert_filename = identity.cert_filename();
        match self.validity.is_valid(identity.key_dir(), &cert_filename) {
            Err(IdentityError::StaleCrl { path, next_update }) => {
                warn!(
                    id = %identity,
                    crl = %path.display(),
                    %next_update,
                    "CRL expired, regenerating before revocation"
                );
                self.invoker
                    .regenerate_crl(identity, &self.ca)
                    .at(Step::RegenerateCrl)?;
                self.validity
                    .is_valid(identity.key_dir(), &cert_filename)
                    .at(Step::Verify)
            }
            other => other.at(Step::Verify),
        }
    }

    /// Remove the rendered profiles and, for bundled identities, the archive.
    /// Key material is left alone.
    pub fn delete_bundle(
        &self,
        identity: &ClientIdentity,
        create_bundle: bool,
    ) -> Result<Vec<PathBuf>> {
        let mut targets = vec![identity.conf_path(), identity.ovpn_path()];
        if create_bundle {
            targets.push(identity.bundle_path());
        }

        let mut removed = Vec::new();
        for path in targets {
            if remove_if_exists(&path)? {
                removed.push(path);
            }
        }
        if removed.is_empty() {
            warn!(id = %identity, "no bundle artifacts to delete");
        } else {
            info!(id = %identity, removed = removed.len(), "bundle deleted");
        }
        Ok(removed)
    }

    /// Whether the identity's certificate is currently accepted by the CA.
    pub fn check(&self, identity: &ClientIdentity) -> Result<bool> {
        self.validity
            .is_valid(identity.key_dir(), &identity.cert_filename())
    }
}

impl<I, V, R, A, P> IdentityLifecycle for IdentityOrchestrator<I, V, R, A, P>
where
    I: PkiInvoker,
    V: ValidityChecker,
    R: TemplateRenderer,
    A: Archiver,
    P: StateProbe,
{
    fn create(
        &self,
        identity: &ClientIdentity,
        options: &BundleOptions,
    ) -> StepResult<CreateReport> {
        IdentityOrchestrator::create(self, identity, options)
    }

    fn revoke(&self, identity: &ClientIdentity) -> StepResult<RevokeReport> {
        IdentityOrchestrator::revoke(self, identity)
    }
}

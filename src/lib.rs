//! VPN Client PKI - OpenVPN client identity lifecycle on top of easy-rsa
//!
//! Issues client certificates through easy-rsa's `pkitool`, packages them with
//! rendered connection profiles into distributable bundles, and revokes them
//! through `openssl ca`, confirming each revocation against the CA's CRL
//! before any key material is deleted.
//!
//! # Overview
//!
//! The crate never generates keys or signs anything itself. The CA and its
//! tooling stay external; this library decides *when* to call them and keeps
//! the key directory converged:
//!
//! ```text
//! create:  Absent -> Issuing -> Issued -> Bundling -> Bundled
//! revoke:  Valid -> Revoking -> PendingVerification -> Revoked -> CleaningUp -> Removed
//! ```
//!
//! Each transition is guarded by what is already on disk, so every operation
//! can be re-run after a partial failure.
//!
//! # Key directory layout
//!
//! ```text
//! <key_dir>/ca.crt                 CA certificate (trust anchor)
//! <key_dir>/crl.pem                CA revocation list
//! <key_dir>/<id>.crt|.key|.csr     written by pkitool
//! <dest>/<prefix>-<id>.conf        rendered profile (bundled mode)
//! <dest>/<prefix>-<id>.ovpn        rendered profile (inline mode embeds PEM)
//! <dest>/<id>.tar.gz               ca.crt, <id>.crt, <id>.key, both profiles
//! ```
//!
//! `<dest>` is `clients.destination` when configured, otherwise `key_dir`.
//!
//! # Usage
//!
//! ```no_run
//! use vpn_client_pki::bundle::{BundleAssembler, BundleOptions};
//! use vpn_client_pki::client_identity::ClientIdentity;
//! use vpn_client_pki::configs::AppConfig;
//! use vpn_client_pki::orchestrator::IdentityOrchestrator;
//! use vpn_client_pki::pki_invoker::EasyRsaInvoker;
//! use vpn_client_pki::template_renderer::MinijinjaRenderer;
//! use vpn_client_pki::validity::OpensslValidityChecker;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let orchestrator = IdentityOrchestrator::new(
//!         &config,
//!         EasyRsaInvoker::new(&config.pki.pkitool, &config.pki.openssl_bin),
//!         OpensslValidityChecker::new(&config.pki.crl_file),
//!         BundleAssembler::new(
//!             MinijinjaRenderer::default(),
//!             config.clients.profile_vars.clone(),
//!         ),
//!     );
//!
//!     let alice =
//!         ClientIdentity::new("alice", &config.pki.key_dir, &config.clients.client_prefix)?;
//!     let options = BundleOptions {
//!         create_bundle: true,
//!         ..Default::default()
//!     };
//!     orchestrator.create(&alice, &options)?;
//!     orchestrator.revoke(&alice)?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! - [`client_identity`]: validated client ids and every path derived from them
//! - [`pki_invoker`]: `pkitool` / `openssl ca` subprocesses with an explicit environment
//! - [`validity`]: chain, expiry and CRL verification of a client certificate
//! - [`template_renderer`]: minijinja profile templates
//! - [`bundle`]: profile rendering and `tar.gz` packaging
//! - [`orchestrator`]: the `create` / `revoke` / `delete_bundle` state machines
//! - [`identity_source`] and [`batch`]: apply an operation to many identities
//!
//! # Security Considerations
//!
//! - Client ids are matched against a strict pattern before reaching a
//!   filename or a subprocess argument. Commands never go through a shell.
//! - Inline profiles embed the private key; they are written `0600` and never
//!   logged.
//! - A certificate that still verifies after `openssl ca -revoke` is reported
//!   as [`error::IdentityError::VerificationInconsistency`] and nothing is
//!   deleted.

pub mod batch;
pub mod bundle;
pub mod client_identity;
pub mod configs;
pub mod error;
pub mod identity_source;
pub mod orchestrator;
pub mod pki_invoker;
pub mod state_probe;
pub mod template_renderer;
pub mod validity;

#[cfg(test)]
mod test_support;

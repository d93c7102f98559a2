//! Bundle Assembler
//!
//! Renders a client's connection profiles and packages its distributable
//! material into `<id>.tar.gz`.
//!
//! # Modes
//!
//! - **Bundled** (`create_bundle = true`): `<prefix>-<id>.conf` and
//!   `<prefix>-<id>.ovpn` reference the certificate and key by filename, and
//!   the archive carries `ca.crt`, `<id>.crt`, `<id>.key` and both profiles.
//! - **Inline** (`create_bundle = false`): a single `<prefix>-<id>.ovpn`
//!   embeds the CA certificate, client certificate and key. It is written
//!   `0600` and never logged. No archive is produced.
//!
//! # Freshness
//!
//! An existing archive is up to date unless `force` is set. Its contents are
//! never compared against the current certificate. A profile whose rendered
//! text changes removes the archive before it is rewritten, so the next
//! archive step rebuilds it.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use secrecy::zeroize::{Zeroize, Zeroizing};
use secrecy::{ExposeSecret, SecretString};
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::client_identity::ClientIdentity;
use crate::error::{AtStep, IdentityError, Result, Step, StepResult};
use crate::state_probe::{remove_if_exists, StateProbe};
use crate::template_renderer::{ProfileTemplate, TemplateRenderer};

const PROFILE_MODE: u32 = 0o644;
const SENSITIVE_MODE: u32 = 0o600;

/// Template variables no caller-supplied value may shadow.
const BUILTIN_VARS: [&str; 4] = ["client_cn", "ca", "cert", "key"];

#[derive(Debug, Clone, Default)]
pub struct BundleOptions {
    pub create_bundle: bool,
    pub force: bool,
    pub additional_vars: BTreeMap<String, String>,
}

/// One file inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleMember {
    /// Name inside the archive
    pub name: String,
    /// Where the file is read from
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSpec {
    pub path: PathBuf,
    pub member_files: Vec<BundleMember>,
    pub force_rebuild: bool,
}

impl BundleSpec {
    /// Archive layout for a bundled identity, in archive order.
    pub fn for_identity(identity: &ClientIdentity, force_rebuild: bool) -> Self {
        let member = |name: String, dir: &Path| BundleMember {
            source: dir.join(&name),
            name,
        };
        let key_dir = identity.key_dir();
        let out_dir = identity.output_dir();
        Self {
            path: identity.bundle_path(),
            member_files: vec![
                member("ca.crt".to_string(), key_dir),
                member(identity.cert_filename(), key_dir),
                member(identity.key_filename(), key_dir),
                member(identity.ovpn_filename(), out_dir),
                member(identity.conf_filename(), out_dir),
            ],
            force_rebuild,
        }
    }

    pub fn is_up_to_date(&self, probe: &dyn StateProbe) -> bool {
        !self.force_rebuild && probe.exists(&self.path)
    }
}

/// Produces the compressed archive for a bundle.
pub trait Archiver: Send + Sync {
    fn create(&self, spec: &BundleSpec) -> Result<()>;
}

/// gzip-compressed tar, written next to the target and renamed into place.
#[derive(Debug, Default, Clone)]
pub struct TarGzArchiver;

impl Archiver for TarGzArchiver {
    fn create(&self, spec: &BundleSpec) -> Result<()> {
        let dir = spec.path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(dir).map_err(|e| IdentityError::fs(dir, e))?;

        {
            let encoder = GzEncoder::new(tmp.as_file(), Compression::default());
            let mut tar_builder = tar::Builder::new(encoder);
            for member in &spec.member_files {
                let mut file =
                    File::open(&member.source).map_err(|e| IdentityError::fs(&member.source, e))?;
                tar_builder
                    .append_file(&member.name, &mut file)
                    .map_err(|e| IdentityError::fs(&member.source, e))?;
            }
            let encoder = tar_builder
                .into_inner()
                .map_err(|e| IdentityError::fs(&spec.path, e))?;
            encoder.finish().map_err(|e| IdentityError::fs(&spec.path, e))?;
        }

        tmp.persist(&spec.path)
            .map_err(|e| IdentityError::fs(&spec.path, e.error))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Created,
    /// Archive already present and `force` not set
    UpToDate,
    /// Inline profiles are not archived
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleOutcome {
    /// Profiles whose content changed on disk
    pub profiles_written: Vec<PathBuf>,
    pub archive: ArchiveOutcome,
}

/// Template variables that carry PEM material. Values are zeroed on drop.
struct SensitiveVars(BTreeMap<String, String>);

impl SensitiveVars {
    fn wipe(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

impl Drop for SensitiveVars {
    fn drop(&mut self) {
        self.wipe();
    }
}

pub struct BundleAssembler<R: TemplateRenderer, A: Archiver = TarGzArchiver> {
    renderer: R,
    archiver: A,
    /// Connection defaults, overridden by per-client variables
    profile_vars: BTreeMap<String, String>,
}

impl<R: TemplateRenderer> BundleAssembler<R, TarGzArchiver> {
    pub fn new(renderer: R, profile_vars: BTreeMap<String, String>) -> Self {
        Self::with_archiver(renderer, TarGzArchiver, profile_vars)
    }
}

impl<R: TemplateRenderer, A: Archiver> BundleAssembler<R, A> {
    pub fn with_archiver(
        renderer: R,
        archiver: A,
        profile_vars: BTreeMap<String, String>,
    ) -> Self {
        Self {
            renderer,
            archiver,
            profile_vars,
        }
    }

    /// Profile work fails at [`Step::Render`], the archive at [`Step::Archive`].
    pub fn assemble(
        &self,
        identity: &ClientIdentity,
        options: &BundleOptions,
        probe: &dyn StateProbe,
    ) -> StepResult<BundleOutcome> {
        let out_dir = identity.output_dir();
        fs::create_dir_all(out_dir)
            .map_err(|e| IdentityError::fs(out_dir, e))
            .at(Step::Render)?;

        let mut profiles_written = Vec::new();

        if !options.create_bundle {
            let profile = self.render_inline(identity, options).at(Step::Render)?;
            let ovpn_path = identity.ovpn_path();
            let written = self
                .write_profile(identity, &ovpn_path, profile.expose_secret(), SENSITIVE_MODE)
                .at(Step::Render)?;
            if written {
                profiles_written.push(ovpn_path);
            }
            return Ok(BundleOutcome {
                profiles_written,
                archive: ArchiveOutcome::NotApplicable,
            });
        }

        let vars = self.vars(identity, options);
        let profile = self
            .render(identity, ProfileTemplate::Bundled, &vars)
            .at(Step::Render)?;
        for path in [identity.conf_path(), identity.ovpn_path()] {
            let written = self
                .write_profile(identity, &path, &profile, PROFILE_MODE)
                .at(Step::Render)?;
            if written {
                profiles_written.push(path);
            }
        }

        let spec = BundleSpec::for_identity(identity, options.force);
        if spec.is_up_to_date(probe) {
            debug!(id = %identity, path = %spec.path.display(), "bundle up to date");
            return Ok(BundleOutcome {
                profiles_written,
                archive: ArchiveOutcome::UpToDate,
            });
        }

        info!(id = %identity, path = %spec.path.display(), "creating bundle");
        self.archiver.create(&spec).at(Step::Archive)?;
        Ok(BundleOutcome {
            profiles_written,
            archive: ArchiveOutcome::Created,
        })
    }

    /// Built-in variables win over caller variables, which win over the
    /// configured connection defaults.
    fn vars(&self, identity: &ClientIdentity, options: &BundleOptions) -> BTreeMap<String, String> {
        let mut vars = self.profile_vars.clone();
        vars.extend(
            options
                .additional_vars
                .iter()
                .filter(|(k, _)| !BUILTIN_VARS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        vars.insert("client_cn".to_string(), identity.id().to_string());
        vars
    }

    fn render(
        &self,
        identity: &ClientIdentity,
        template: ProfileTemplate,
        vars: &BTreeMap<String, String>,
    ) -> Result<String> {
        self.renderer
            .render(template, vars)
            .map_err(|source| IdentityError::TemplateRender {
                id: identity.id().to_string(),
                template: template.name().to_string(),
                source,
            })
    }

    fn render_inline(
        &self,
        identity: &ClientIdentity,
        options: &BundleOptions,
    ) -> Result<SecretString> {
        let mut vars = SensitiveVars(self.vars(identity, options));
        let material = [
            ("ca", identity.ca_cert_path()),
            ("cert", identity.cert_path()),
            ("key", identity.key_path()),
        ];
        for (name, path) in material {
            let pem = fs::read_to_string(&path).map_err(|e| IdentityError::fs(&path, e))?;
            vars.0.insert(name.to_string(), pem);
        }

        self.render(identity, ProfileTemplate::Inline, &vars.0)
            .map(SecretString::from)
    }

    /// Write `content` unless the file already holds it. A changed profile
    /// invalidates the archive first. Returns whether the file was written.
    fn write_profile(
        &self,
        identity: &ClientIdentity,
        path: &Path,
        content: &str,
        mode: u32,
    ) -> Result<bool> {
        match fs::read(path).map(Zeroizing::new) {
            Ok(existing) if existing.as_slice() == content.as_bytes() => return Ok(false),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(IdentityError::fs(path, e)),
        }

        if remove_if_exists(&identity.bundle_path())? {
            info!(
                id = %identity,
                path = %identity.bundle_path().display(),
                "removed stale bundle"
            );
        }

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| IdentityError::fs(dir, e))?;
        tmp.write_all(content.as_bytes())
            .map_err(|e| IdentityError::fs(path, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(mode))
                .map_err(|e| IdentityError::fs(path, e))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        tmp.persist(path).map_err(|e| IdentityError::fs(path, e.error))?;
        debug!(id = %identity, path = %path.display(), "profile written");
        Ok(true)
    }
}

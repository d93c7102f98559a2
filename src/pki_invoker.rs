//! External PKI Invoker
//!
//! Runs the easy-rsa issuance tool and the `openssl ca` revocation commands.
//! Every command is spawned from an argument vector with an explicit
//! environment; nothing passes through a shell. The client id reaching these
//! commands has already been validated by [`ClientIdentity::new`].
//!
//! # Commands
//!
//! ```text
//! issue:   <easy_rsa_dir>/pkitool <id>                                  (cwd: easy_rsa_dir)
//! revoke:  openssl ca -revoke <key_dir>/<id>.crt -config <openssl.cnf>  (cwd: key_dir)
//!          openssl ca -gencrl -out <crl> -config <openssl.cnf>          (cwd: key_dir)
//! ```

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Output};

use tracing::{debug, info};

use crate::client_identity::ClientIdentity;
use crate::error::{IdentityError, Result, Step};

/// Subject fields blanked for `openssl ca -revoke` so the CA config does not
/// pick up a stale subject from the caller's environment.
const BLANKED_SUBJECT_VARS: [&str; 4] = ["KEY_CN", "KEY_OU", "KEY_NAME", "KEY_ALTNAMES"];

/// Parameters exported to pkitool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyParams {
    pub easy_rsa_dir: PathBuf,
    pub key_config: PathBuf,
    pub key_dir: PathBuf,
    pub ca_expire: u32,
    pub expire: u32,
    pub size: u32,
    pub country: String,
    pub province: String,
    pub city: String,
    pub org: String,
    pub email: String,
}

impl KeyParams {
    /// The issuance environment, exactly the variables pkitool reads.
    pub fn environment(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("EASY_RSA".to_string(), self.easy_rsa_dir.display().to_string()),
            ("KEY_CONFIG".to_string(), self.key_config.display().to_string()),
            ("KEY_DIR".to_string(), self.key_dir.display().to_string()),
            ("CA_EXPIRE".to_string(), self.ca_expire.to_string()),
            ("KEY_EXPIRE".to_string(), self.expire.to_string()),
            ("KEY_SIZE".to_string(), self.size.to_string()),
            ("KEY_COUNTRY".to_string(), self.country.clone()),
            ("KEY_PROVINCE".to_string(), self.province.clone()),
            ("KEY_CITY".to_string(), self.city.clone()),
            ("KEY_ORG".to_string(), self.org.clone()),
            ("KEY_EMAIL".to_string(), self.email.clone()),
        ])
    }
}

/// CA state used for revocation and CRL regeneration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaConfig {
    pub key_dir: PathBuf,
    pub openssl_cnf: PathBuf,
    pub crl_path: PathBuf,
    /// Replaces sourcing easy-rsa's `vars` before `openssl ca`.
    pub key_params: KeyParams,
}

impl CaConfig {
    pub fn revoke_environment(&self) -> BTreeMap<String, String> {
        let mut env = self.key_params.environment();
        for var in BLANKED_SUBJECT_VARS {
            env.insert(var.to_string(), String::new());
        }
        env
    }
}

/// A fully specified subprocess invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn envs(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }
}

/// Command output for testability
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    /// Exit status as reported by the OS, e.g. `exit status: 1`.
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }
    }
}

/// Trait for executing external commands (allows mocking in tests)
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Runs commands with a cleared environment. Only `PATH` is inherited so
/// pkitool can find `openssl`.
#[derive(Debug, Default, Clone)]
pub struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).current_dir(&spec.cwd).env_clear();
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.envs(&spec.env);

        debug!(program = ?spec.program, args = ?spec.args, cwd = %spec.cwd.display(), "executing");

        Ok(CommandOutput::from(cmd.output()?))
    }
}

/// Issues and revokes client certificates through the external PKI tool.
pub trait PkiInvoker: Send + Sync {
    fn issue(&self, identity: &ClientIdentity, params: &KeyParams) -> Result<()>;

    /// Revoke the identity's certificate and regenerate the CRL. Returns only
    /// after the CRL file on disk reflects the revocation.
    fn revoke(&self, identity: &ClientIdentity, ca: &CaConfig) -> Result<()>;

    /// Rewrite the CRL from the CA database without revoking anything.
    /// `identity` is only used to attribute a failure.
    fn regenerate_crl(&self, identity: &ClientIdentity, ca: &CaConfig) -> Result<()>;
}

/// easy-rsa 2.x backed invoker
pub struct EasyRsaInvoker<R: CommandRunner = RealCommandRunner> {
    pkitool: String,
    openssl_bin: String,
    runner: R,
}

impl EasyRsaInvoker<RealCommandRunner> {
    pub fn new(pkitool: impl Into<String>, openssl_bin: impl Into<String>) -> Self {
        Self::with_runner(pkitool, openssl_bin, RealCommandRunner)
    }
}

impl<R: CommandRunner> EasyRsaInvoker<R> {
    pub fn with_runner(
        pkitool: impl Into<String>,
        openssl_bin: impl Into<String>,
        runner: R,
    ) -> Self {
        Self {
            pkitool: pkitool.into(),
            openssl_bin: openssl_bin.into(),
            runner,
        }
    }

    pub fn issue_command(&self, identity: &ClientIdentity, params: &KeyParams) -> CommandSpec {
        CommandSpec::new(params.easy_rsa_dir.join(&self.pkitool), &params.easy_rsa_dir)
            .arg(identity.id())
            .envs(params.environment())
    }

    pub fn revoke_command(&self, identity: &ClientIdentity, ca: &CaConfig) -> CommandSpec {
        CommandSpec::new(&self.openssl_bin, &ca.key_dir)
            .arg("ca")
            .arg("-revoke")
            .arg(identity.cert_path())
            .arg("-config")
            .arg(&ca.openssl_cnf)
            .envs(ca.revoke_environment())
    }

    pub fn gencrl_command(&self, ca: &CaConfig) -> CommandSpec {
        CommandSpec::new(&self.openssl_bin, &ca.key_dir)
            .arg("ca")
            .arg("-gencrl")
            .arg("-out")
            .arg(&ca.crl_path)
            .arg("-config")
            .arg(&ca.openssl_cnf)
            .envs(ca.revoke_environment())
    }

    fn execute(&self, identity: &ClientIdentity, step: Step, spec: &CommandSpec) -> Result<()> {
        let output = self
            .runner
            .run(spec)
            .map_err(|e| IdentityError::ToolInvocation {
                id: identity.id().to_string(),
                step,
                status: "failed to execute".to_string(),
                stderr: e.to_string(),
            })?;

        if !output.success {
            return Err(IdentityError::ToolInvocation {
                id: identity.id().to_string(),
                step,
                status: output.status,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(())
    }
}

impl<R: CommandRunner> PkiInvoker for EasyRsaInvoker<R> {
    fn issue(&self, identity: &ClientIdentity, params: &KeyParams) -> Result<()> {
        info!(id = %identity, "issuing client certificate");
        self.execute(identity, Step::Issue, &self.issue_command(identity, params))
    }

    fn revoke(&self, identity: &ClientIdentity, ca: &CaConfig) -> Result<()> {
        info!(id = %identity, "revoking client certificate");
        self.execute(identity, Step::Revoke, &self.revoke_command(identity, ca))?;
        self.regenerate_crl(identity, ca)
    }

    fn regenerate_crl(&self, identity: &ClientIdentity, ca: &CaConfig) -> Result<()> {
        info!(id = %identity, crl = %ca.crl_path.display(), "regenerating CRL");
        self.execute(identity, Step::RegenerateCrl, &self.gencrl_command(ca))
    }
}

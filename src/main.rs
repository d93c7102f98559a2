//! VPN Client PKI - command line interface
//!
//! ```bash
//! vpn-client-pki create alice bob            # issue + bundle
//! vpn-client-pki create carol --inline       # single .ovpn with embedded PEM
//! vpn-client-pki revoke mallory              # revoke, verify against CRL, clean up
//! vpn-client-pki sync --query 'groups:vpn'   # create for every matching record
//! vpn-client-pki purge --query 'active:false'
//! vpn-client-pki check alice
//! ```
//!
//! Exit status is 0 when every identity succeeded, 1 when any failed, and 3
//! when a revoked certificate still verified.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vpn_client_pki::batch::{BatchAction, BatchDriver, BatchReport, Completed, IdentityLayout};
use vpn_client_pki::bundle::{BundleAssembler, BundleOptions};
use vpn_client_pki::configs::AppConfig;
use vpn_client_pki::identity_source::{ExplicitIds, IdentitySource, JsonRecordSource};
use vpn_client_pki::orchestrator::IdentityOrchestrator;
use vpn_client_pki::pki_invoker::EasyRsaInvoker;
use vpn_client_pki::template_renderer::MinijinjaRenderer;
use vpn_client_pki::validity::OpensslValidityChecker;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const EXIT_FAILURE: u8 = 1;
const EXIT_SECURITY_FAILURE: u8 = 3;

type Orchestrator =
    IdentityOrchestrator<EasyRsaInvoker, OpensslValidityChecker, MinijinjaRenderer>;

/// Issue, bundle and revoke OpenVPN client identities
#[derive(Parser, Debug)]
#[command(name = "vpn-client-pki")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Issue certificates and build bundles
    Create(CreateArgs),
    /// Revoke certificates and remove their artifacts
    Revoke {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Remove rendered profiles and archives, keeping key material
    DeleteBundle {
        #[arg(required = true)]
        ids: Vec<String>,
        #[arg(long)]
        destination: Option<PathBuf>,
    },
    /// Create every identity matched by the record query
    Sync {
        #[arg(long)]
        query: Option<String>,
    },
    /// Revoke every identity matched by the record query
    Purge {
        #[arg(long)]
        query: Option<String>,
    },
    /// Report whether a certificate is currently accepted by the CA
    Check { id: String },
}

#[derive(Args, Debug)]
struct CreateArgs {
    #[arg(required = true)]
    ids: Vec<String>,
    /// Reissue the certificate and rebuild the bundle
    #[arg(long)]
    force: bool,
    /// Write a single profile with embedded certificate and key
    #[arg(long)]
    inline: bool,
    #[arg(long)]
    destination: Option<PathBuf>,
    /// Extra template variable, KEY=VALUE (repeatable)
    #[arg(long = "var", value_parser = parse_key_val)]
    vars: Vec<(String, String)>,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))?;
    if key.is_empty() {
        return Err(format!("empty key in {s:?}"));
    }
    Ok((key.to_string(), value.to_string()))
}

fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    match path {
        Some(path) => AppConfig::from_file(path),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => AppConfig::load(),
        None => {
            info!("no {DEFAULT_CONFIG_PATH} found, using built-in defaults");
            Ok(AppConfig::default())
        }
    }
}

fn build_orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    let renderer = MinijinjaRenderer::from_optional_dir(config.clients.templates_dir.as_deref())
        .context("Failed to load profile templates")?;
    Ok(IdentityOrchestrator::new(
        config,
        EasyRsaInvoker::new(&config.pki.pkitool, &config.pki.openssl_bin),
        OpensslValidityChecker::new(&config.pki.crl_file),
        BundleAssembler::new(renderer, config.clients.profile_vars.clone()),
    ))
}

fn layout(config: &AppConfig, destination: Option<PathBuf>) -> IdentityLayout {
    IdentityLayout {
        key_dir: config.pki.key_dir.clone(),
        client_prefix: config.clients.client_prefix.clone(),
        destination: destination.or_else(|| config.clients.destination.clone()),
    }
}

fn run_batch(
    config: &AppConfig,
    orchestrator: &Orchestrator,
    source: &impl IdentitySource,
    layout: IdentityLayout,
    action: BatchAction,
    query: &str,
) -> Result<BatchReport> {
    let driver = BatchDriver::new(orchestrator, source, layout, config.batch.jobs);
    driver
        .run(&action, query)
        .with_context(|| format!("Failed to resolve identities for query {query:?}"))
}

fn print_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(Completed::Created(created)) => println!(
                "✓ {} {:?} (issued: {}, archive: {:?})",
                outcome.id, created.state, created.issued, created.archive
            ),
            Ok(Completed::Revoked(revoked)) => println!(
                "✓ {} {:?} (removed {} files)",
                outcome.id,
                revoked.state,
                revoked.removed.len()
            ),
            Err(failure) => println!(
                "✗ {} failed at {}: {}",
                outcome.id, failure.step, failure.error
            ),
        }
    }
    println!(
        "\n{} succeeded, {} failed",
        report.succeeded(),
        report.failed()
    );
}

fn exit_code(report: &BatchReport) -> ExitCode {
    if report.has_security_failures() {
        ExitCode::from(EXIT_SECURITY_FAILURE)
    } else if report.failed() > 0 {
        ExitCode::from(EXIT_FAILURE)
    } else {
        ExitCode::SUCCESS
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_deref())?;
    let orchestrator = build_orchestrator(&config)?;

    let report = match cli.command {
        Commands::Create(args) => {
            let options = BundleOptions {
                create_bundle: config.clients.create_bundle && !args.inline,
                force: args.force,
                additional_vars: args.vars.into_iter().collect::<BTreeMap<_, _>>(),
            };
            run_batch(
                &config,
                &orchestrator,
                &ExplicitIds(args.ids),
                layout(&config, args.destination),
                BatchAction::Create(options),
                "*:*",
            )?
        }
        Commands::Revoke { ids } => run_batch(
            &config,
            &orchestrator,
            &ExplicitIds(ids),
            layout(&config, None),
            BatchAction::Revoke,
            "*:*",
        )?,
        Commands::Sync { query } => {
            let query = query.unwrap_or_else(|| config.source.user_query.clone());
            let options = BundleOptions {
                create_bundle: config.clients.create_bundle,
                ..Default::default()
            };
            run_batch(
                &config,
                &orchestrator,
                &JsonRecordSource::new(&config.source.records_dir),
                layout(&config, None),
                BatchAction::Create(options),
                &query,
            )?
        }
        Commands::Purge { query } => {
            let query = query.unwrap_or_else(|| config.source.remove_user_query.clone());
            run_batch(
                &config,
                &orchestrator,
                &JsonRecordSource::new(&config.source.records_dir),
                layout(&config, None),
                BatchAction::Revoke,
                &query,
            )?
        }
        Commands::DeleteBundle { ids, destination } => {
            let layout = layout(&config, destination);
            let mut failed = false;
            for id in &ids {
                let result = layout.identity(id).and_then(|identity| {
                    orchestrator.delete_bundle(&identity, config.clients.create_bundle)
                });
                match result {
                    Ok(removed) => println!("✓ {id}: removed {} files", removed.len()),
                    Err(e) => {
                        error!(id = %id, error = %e, "delete-bundle failed");
                        println!("✗ {id}: {e}");
                        failed = true;
                    }
                }
            }
            return Ok(if failed { ExitCode::from(EXIT_FAILURE) } else { ExitCode::SUCCESS });
        }
        Commands::Check { id } => {
            let identity = layout(&config, None).identity(&id)?;
            let valid = orchestrator
                .check(&identity)
                .with_context(|| format!("Failed to verify certificate for {id}"))?;
            println!("{id}: {}", if valid { "valid" } else { "not valid" });
            return Ok(if valid { ExitCode::SUCCESS } else { ExitCode::from(EXIT_FAILURE) });
        }
    };

    print_report(&report);
    Ok(exit_code(&report))
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

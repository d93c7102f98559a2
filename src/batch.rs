//! Batch Driver
//!
//! Applies `create` or `revoke` to every identity an [`IdentitySource`]
//! resolves. A failing identity is recorded with the step the orchestrator
//! was in, and the run moves on; nothing one identity does can stop another
//! from being processed.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::{error, info, warn};

use crate::bundle::BundleOptions;
use crate::client_identity::ClientIdentity;
use crate::error::{AtStep, Failure, Result, Step, StepResult};
use crate::identity_source::IdentitySource;
use crate::orchestrator::{CreateReport, IdentityLifecycle, RevokeReport};

#[derive(Debug, Clone)]
pub enum BatchAction {
    Create(BundleOptions),
    Revoke,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completed {
    Created(CreateReport),
    Revoked(RevokeReport),
}

#[derive(Debug)]
pub struct IdentityOutcome {
    pub id: String,
    pub result: StepResult<Completed>,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// One entry per resolved record, in resolution order
    pub outcomes: Vec<IdentityOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &Failure)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|f| (o.id.as_str(), f)))
    }

    pub fn has_security_failures(&self) -> bool {
        self.failures().any(|(_, f)| f.is_security_relevant())
    }
}

/// How identities built from records are laid out on disk.
#[derive(Debug, Clone)]
pub struct IdentityLayout {
    pub key_dir: PathBuf,
    pub client_prefix: String,
    pub destination: Option<PathBuf>,
}

impl IdentityLayout {
    pub fn identity(&self, id: &str) -> Result<ClientIdentity> {
        Ok(
            ClientIdentity::new(id, &self.key_dir, &self.client_prefix)?
                .with_destination(self.destination.clone()),
        )
    }
}

pub struct BatchDriver<'a, L: IdentityLifecycle, S: IdentitySource> {
    lifecycle: &'a L,
    source: &'a S,
    layout: IdentityLayout,
    jobs: usize,
}

impl<'a, L: IdentityLifecycle, S: IdentitySource> BatchDriver<'a, L, S> {
    pub fn new(lifecycle: &'a L, source: &'a S, layout: IdentityLayout, jobs: usize) -> Self {
        Self {
            lifecycle,
            source,
            layout,
            jobs: jobs.max(1),
        }
    }

    /// Resolve `query` and apply `action` to each record. Only a failure to
    /// resolve the query itself is returned as an error.
    pub fn run(&self, action: &BatchAction, query: &str) -> Result<BatchReport> {
        let records = self.source.resolve(query)?;
        let ids: Vec<String> = records.into_iter().map(|r| r.id).collect();
        info!(query, identities = ids.len(), jobs = self.jobs, "batch started");

        let outcomes = if self.jobs == 1 || ids.len() <= 1 {
            ids.iter().map(|id| self.process(action, id)).collect()
        } else {
            self.process_parallel(action, &ids)
        };

        let report = BatchReport { outcomes };
        for (id, failure) in report.failures() {
            if failure.is_security_relevant() {
                error!(
                    id,
                    step = %failure.step,
                    error = %failure.error,
                    severity = "critical",
                    "identity failed"
                );
            } else {
                warn!(id, step = %failure.step, error = %failure.error, "identity failed");
            }
        }
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "batch finished"
        );
        Ok(report)
    }

    fn process_parallel(&self, action: &BatchAction, ids: &[String]) -> Vec<IdentityOutcome> {
        let next = AtomicUsize::new(0);
        let slots: Mutex<Vec<Option<IdentityOutcome>>> =
            Mutex::new((0..ids.len()).map(|_| None).collect());

        std::thread::scope(|scope| {
            for _ in 0..self.jobs.min(ids.len()) {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::SeqCst);
                    let Some(id) = ids.get(index) else { break };
                    let outcome = self.process(action, id);
                    let mut slots = slots.lock().unwrap_or_else(|p| p.into_inner());
                    slots[index] = Some(outcome);
                });
            }
        });

        slots
            .into_inner()
            .unwrap_or_else(|p| p.into_inner())
            .into_iter()
            .flatten()
            .collect()
    }

    fn process(&self, action: &BatchAction, id: &str) -> IdentityOutcome {
        let result = self
            .layout
            .identity(id)
            .at(Step::Validate)
            .and_then(|identity| match action {
                BatchAction::Create(options) => self
                    .lifecycle
                    .create(&identity, options)
                    .map(Completed::Created),
                BatchAction::Revoke => self.lifecycle.revoke(&identity).map(Completed::Revoked),
            });

        IdentityOutcome {
            id: id.to_string(),
            result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{ArchiveOutcome, BundleAssembler};
    use crate::configs::AppConfig;
    use crate::error::IdentityError;
    use crate::identity_source::IdentityRecord;
    use crate::orchestrator::{CreateState, IdentityOrchestrator, RevokeState};
    use crate::template_renderer::MinijinjaRenderer;
    use crate::test_support::{MockInvoker, TestCa};
    use crate::validity::OpensslValidityChecker;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct StaticSource(Vec<&'static str>);

    impl IdentitySource for StaticSource {
        fn resolve(&self, query: &str) -> Result<Vec<IdentityRecord>> {
            if query == "broken" {
                return Err(IdentityError::IdentitySource("backend down".to_string()));
            }
            Ok(self
                .0
                .iter()
                .map(|id| IdentityRecord {
                    id: id.to_string(),
                    fields: Default::default(),
                })
                .collect())
        }
    }

    /// Fails `issue` for the listed ids and reports every revoke of `suspect`
    /// as still valid.
    #[derive(Default)]
    struct ScriptedLifecycle {
        fail_issue: HashSet<&'static str>,
        suspect: Option<&'static str>,
        seen: Mutex<Vec<String>>,
    }

    impl IdentityLifecycle for ScriptedLifecycle {
        fn create(
            &self,
            identity: &ClientIdentity,
            _options: &BundleOptions,
        ) -> StepResult<CreateReport> {
            self.seen.lock().unwrap().push(identity.id().to_string());
            if self.fail_issue.contains(identity.id()) {
                let error = IdentityError::ToolInvocation {
                    id: identity.id().to_string(),
                    step: Step::Issue,
                    status: "exit status: 1".to_string(),
                    stderr: "pkitool failed".to_string(),
                };
                return Err(Failure::new(Step::Issue, error));
            }
            Ok(CreateReport {
                id: identity.id().to_string(),
                state: CreateState::Bundled,
                issued: true,
                profiles_written: Vec::new(),
                archive: ArchiveOutcome::Created,
            })
        }

        fn revoke(&self, identity: &ClientIdentity) -> StepResult<RevokeReport> {
            self.seen.lock().unwrap().push(identity.id().to_string());
            if self.suspect == Some(identity.id()) {
                let error = IdentityError::VerificationInconsistency {
                    id: identity.id().to_string(),
                    cert_path: identity.cert_path(),
                };
                return Err(Failure::new(Step::Verify, error));
            }
            Ok(RevokeReport {
                id: identity.id().to_string(),
                state: RevokeState::Removed,
                revoked: true,
                removed: Vec::new(),
            })
        }
    }

    fn layout() -> IdentityLayout {
        layout_in(Path::new("/etc/openvpn/keys"))
    }

    fn layout_in(key_dir: &Path) -> IdentityLayout {
        IdentityLayout {
            key_dir: key_dir.to_path_buf(),
            client_prefix: "vpn".to_string(),
            destination: None,
        }
    }

    type Orchestrator =
        IdentityOrchestrator<MockInvoker, OpensslValidityChecker, MinijinjaRenderer>;

    /// A real orchestrator over a key directory holding a fresh `ca.crt`.
    fn orchestrator_in(dir: &TempDir, configure: impl FnOnce(&mut MockInvoker)) -> Orchestrator {
        let ca = Arc::new(TestCa::new("Test CA"));
        ca.write_ca(dir.path());
        let mut invoker = MockInvoker::new(ca);
        invoker.crl_on_revoke = true;
        configure(&mut invoker);

        let mut config = AppConfig::default();
        config.pki.key_dir = dir.path().to_path_buf();
        let assembler = BundleAssembler::new(
            MinijinjaRenderer::default(),
            config.clients.profile_vars.clone(),
        );
        IdentityOrchestrator::new(&config, invoker, OpensslValidityChecker::default(), assembler)
    }

    fn create() -> BatchAction {
        BatchAction::Create(BundleOptions {
            create_bundle: true,
            ..Default::default()
        })
    }

    fn state_of(outcome: &IdentityOutcome) -> Option<CreateState> {
        match &outcome.result {
            Ok(Completed::Created(report)) => Some(report.state),
            _ => None,
        }
    }

    #[test]
    fn test_failure_is_isolated_to_one_identity() {
        let lifecycle = ScriptedLifecycle {
            fail_issue: HashSet::from(["bob"]),
            ..Default::default()
        };
        let source = StaticSource(vec!["alice", "bob", "carol"]);
        let driver = BatchDriver::new(&lifecycle, &source, layout(), 1);

        let report = driver.run(&create(), "*:*").unwrap();

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(state_of(&report.outcomes[0]), Some(CreateState::Bundled));
        assert_eq!(state_of(&report.outcomes[2]), Some(CreateState::Bundled));
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "bob");
        assert_eq!(failures[0].1.step, Step::Issue);
        assert!(!report.has_security_failures());
    }

    #[test]
    fn test_invalid_record_id_fails_only_that_record() {
        let lifecycle = ScriptedLifecycle::default();
        let source = StaticSource(vec!["alice", "../etc", "carol"]);
        let driver = BatchDriver::new(&lifecycle, &source, layout(), 1);

        let report = driver.run(&create(), "*:*").unwrap();

        assert_eq!(report.succeeded(), 2);
        let (id, failure) = report.failures().next().unwrap();
        assert_eq!(id, "../etc");
        assert_eq!(failure.step, Step::Validate);
        assert_eq!(*lifecycle.seen.lock().unwrap(), vec!["alice", "carol"]);
    }

    #[test]
    fn test_verification_inconsistency_is_flagged() {
        let lifecycle = ScriptedLifecycle {
            suspect: Some("bob"),
            ..Default::default()
        };
        let source = StaticSource(vec!["alice", "bob"]);
        let driver = BatchDriver::new(&lifecycle, &source, layout(), 1);

        let report = driver.run(&BatchAction::Revoke, "*:*").unwrap();

        assert!(report.has_security_failures());
        assert_eq!(report.failures().next().unwrap().1.step, Step::Verify);
        assert_eq!(report.succeeded(), 1);
    }

    #[test]
    fn test_parallel_run_keeps_resolution_order() {
        let lifecycle = ScriptedLifecycle {
            fail_issue: HashSet::from(["d"]),
            ..Default::default()
        };
        let source = StaticSource(vec!["a", "b", "c", "d", "e", "f"]);
        let driver = BatchDriver::new(&lifecycle, &source, layout(), 4);

        let report = driver.run(&create(), "*:*").unwrap();

        let ids: Vec<&str> = report.outcomes.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c", "d", "e", "f"]);
        assert_eq!(report.failed(), 1);
        assert_eq!(lifecycle.seen.lock().unwrap().len(), 6);
    }

    #[test]
    fn test_orchestrated_issue_failure_leaves_others_bundled() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_in(&dir, |invoker| {
            invoker.fail_issue.insert("bob".to_string());
        });
        let source = StaticSource(vec!["alice", "bob", "carol"]);
        let driver = BatchDriver::new(&orchestrator, &source, layout_in(dir.path()), 1);

        let report = driver.run(&create(), "*:*").unwrap();

        assert_eq!(state_of(&report.outcomes[0]), Some(CreateState::Bundled));
        assert_eq!(state_of(&report.outcomes[2]), Some(CreateState::Bundled));
        let (id, failure) = report.failures().next().unwrap();
        assert_eq!((id, failure.step), ("bob", Step::Issue));
        assert_eq!(report.failed(), 1);

        for id in ["alice", "carol"] {
            for name in [
                format!("{id}.crt"),
                format!("{id}.key"),
                format!("vpn-{id}.conf"),
                format!("vpn-{id}.ovpn"),
                format!("{id}.tar.gz"),
            ] {
                assert!(dir.path().join(&name).exists(), "{name} missing");
            }
        }
        assert!(!dir.path().join("bob.crt").exists());
        assert!(!dir.path().join("vpn-bob.conf").exists());
    }

    #[test]
    fn test_revoke_gate_failure_reports_verify_step() {
        let dir = TempDir::new().unwrap();
        let orchestrator = orchestrator_in(&dir, |_| {});
        let source = StaticSource(vec!["bob"]);
        let driver = BatchDriver::new(&orchestrator, &source, layout_in(dir.path()), 1);
        driver.run(&create(), "*:*").unwrap();
        std::fs::remove_file(dir.path().join("ca.crt")).unwrap();

        let report = driver.run(&BatchAction::Revoke, "*:*").unwrap();

        let (id, failure) = report.failures().next().unwrap();
        assert_eq!((id, failure.step), ("bob", Step::Verify));
        assert!(matches!(failure.error, IdentityError::Filesystem { .. }));
        assert!(!report.has_security_failures());
        assert!(dir.path().join("bob.key").exists());
        assert!(dir.path().join("bob.tar.gz").exists());
    }

    #[test]
    fn test_resolution_failure_is_returned() {
        let lifecycle = ScriptedLifecycle::default();
        let source = StaticSource(vec!["alice"]);
        let driver = BatchDriver::new(&lifecycle, &source, layout(), 1);

        assert!(matches!(
            driver.run(&create(), "broken"),
            Err(IdentityError::IdentitySource(_))
        ));
        assert!(lifecycle.seen.lock().unwrap().is_empty());
    }
}

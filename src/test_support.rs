//! Throwaway CA, client certificates, CRLs and a fake PKI tool for unit
//! tests.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Name, X509};

use crate::client_identity::ClientIdentity;
use crate::error::{IdentityError, Result, Step};
use crate::pki_invoker::{CaConfig, KeyParams, PkiInvoker};

pub(crate) struct TestCa {
    pub key: PKey<Private>,
    pub cert: X509,
}

fn name(common_name: &str) -> X509Name {
    let mut builder = X509Name::builder().unwrap();
    builder
        .append_entry_by_nid(Nid::COMMONNAME, common_name)
        .unwrap();
    builder
        .append_entry_by_nid(Nid::ORGANIZATIONNAME, "Fort Funston")
        .unwrap();
    builder.build()
}

fn serial() -> openssl::asn1::Asn1Integer {
    let mut serial = BigNum::new().unwrap();
    serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
    serial.to_asn1_integer().unwrap()
}

fn key() -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap()
}

impl TestCa {
    pub fn new(common_name: &str) -> Self {
        let key = key();
        let subject = name(common_name);

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_serial_number(&serial()).unwrap();
        builder.set_subject_name(&subject).unwrap();
        builder.set_issuer_name(&subject).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(3650).unwrap())
            .unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();

        Self {
            key,
            cert: builder.build(),
        }
    }

    /// Sign a client certificate valid between the two times.
    pub fn issue_between(
        &self,
        common_name: &str,
        not_before: &Asn1Time,
        not_after: &Asn1Time,
    ) -> (PKey<Private>, X509) {
        let key = key();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_serial_number(&serial()).unwrap();
        builder.set_subject_name(&name(common_name)).unwrap();
        builder
            .set_issuer_name(self.cert.subject_name())
            .unwrap();
        builder.set_not_before(not_before).unwrap();
        builder.set_not_after(not_after).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .append_extension(BasicConstraints::new().critical().build().unwrap())
            .unwrap();
        builder.sign(&self.key, MessageDigest::sha256()).unwrap();
        (key, builder.build())
    }

    pub fn issue(&self, common_name: &str) -> (PKey<Private>, X509) {
        self.issue_between(
            common_name,
            &Asn1Time::days_from_now(0).unwrap(),
            &Asn1Time::days_from_now(365).unwrap(),
        )
    }

    pub fn write_ca(&self, key_dir: &Path) {
        std::fs::write(key_dir.join("ca.crt"), self.cert.to_pem().unwrap()).unwrap();
    }

    /// Write `<id>.crt`, `<id>.key` and `<id>.csr` the way pkitool does.
    pub fn write_client(&self, key_dir: &Path, id: &str) -> X509 {
        let (key, cert) = self.issue(id);
        write_client_files(key_dir, id, &key, &cert);
        cert
    }

    /// Write `<key_dir>/crl.pem` listing `revoked`, produced by the `openssl`
    /// CLI from a scratch CA database. `next_update` is a GeneralizedTime such
    /// as `20200201000000Z`; without it the CRL is good for 30 days.
    pub fn write_crl(&self, key_dir: &Path, revoked: &[&X509], next_update: Option<&str>) {
        let state = tempfile::TempDir::new().unwrap();
        let dir = state.path();
        let ca_cert = dir.join("ca.pem");
        let ca_key = dir.join("ca.key");
        let index = dir.join("index.txt");
        let cnf = dir.join("openssl.cnf");
        std::fs::write(&ca_cert, self.cert.to_pem().unwrap()).unwrap();
        std::fs::write(&ca_key, self.key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        std::fs::write(&index, "").unwrap();
        std::fs::write(
            &cnf,
            format!(
                "[ ca ]\ndefault_ca = test_ca\n\n[ test_ca ]\n\
                 database = {}\ndefault_md = sha256\ndefault_crl_days = 30\n",
                index.display()
            ),
        )
        .unwrap();

        let openssl_ca = |args: Vec<OsString>| {
            let output = Command::new("openssl")
                .arg("ca")
                .arg("-batch")
                .arg("-config")
                .arg(&cnf)
                .arg("-cert")
                .arg(&ca_cert)
                .arg("-keyfile")
                .arg(&ca_key)
                .args(&args)
                .output()
                .unwrap();
            assert!(
                output.status.success(),
                "openssl ca {args:?}: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        };

        for (i, cert) in revoked.iter().enumerate() {
            let path = dir.join(format!("revoked-{i}.pem"));
            std::fs::write(&path, cert.to_pem().unwrap()).unwrap();
            openssl_ca(vec!["-revoke".into(), path.into()]);
        }

        let mut gencrl: Vec<OsString> =
            vec!["-gencrl".into(), "-out".into(), key_dir.join("crl.pem").into()];
        if let Some(next_update) = next_update {
            gencrl.push("-crl_nextupdate".into());
            gencrl.push(next_update.into());
        }
        openssl_ca(gencrl);
    }
}

pub(crate) fn write_client_files(key_dir: &Path, id: &str, key: &PKey<Private>, cert: &X509) {
    std::fs::write(key_dir.join(format!("{id}.crt")), cert.to_pem().unwrap()).unwrap();
    std::fs::write(
        key_dir.join(format!("{id}.key")),
        key.private_key_to_pem_pkcs8().unwrap(),
    )
    .unwrap();
    std::fs::write(
        key_dir.join(format!("{id}.csr")),
        format!("-----BEGIN CERTIFICATE REQUEST-----\n{id}\n-----END CERTIFICATE REQUEST-----\n"),
    )
    .unwrap();
}

/// Stands in for pkitool and `openssl ca`. Issuance writes real certificates
/// signed by `ca`. Revocation sets `revocation_applied`; with `crl_on_revoke`
/// it also writes a real `crl.pem` listing every cert revoked so far.
#[derive(Clone)]
pub(crate) struct MockInvoker {
    pub ca: Arc<TestCa>,
    pub issued: Arc<AtomicUsize>,
    pub revoked: Arc<AtomicUsize>,
    pub crl_refreshes: Arc<AtomicUsize>,
    pub revocation_applied: Arc<AtomicBool>,
    /// Ids whose issuance exits non-zero
    pub fail_issue: HashSet<String>,
    /// Report success without revoking anything
    pub lie_on_revoke: bool,
    pub crl_on_revoke: bool,
    /// `nextUpdate` for every CRL written, to simulate a misconfigured CA
    pub crl_next_update: Option<&'static str>,
    revoked_certs: Arc<Mutex<Vec<X509>>>,
}

impl MockInvoker {
    pub fn new(ca: Arc<TestCa>) -> Self {
        Self {
            ca,
            issued: Arc::default(),
            revoked: Arc::default(),
            crl_refreshes: Arc::default(),
            revocation_applied: Arc::default(),
            fail_issue: HashSet::new(),
            lie_on_revoke: false,
            crl_on_revoke: false,
            crl_next_update: None,
            revoked_certs: Arc::default(),
        }
    }

    fn write_crl(&self, key_dir: &Path) {
        let revoked = self.revoked_certs.lock().unwrap();
        let refs: Vec<&X509> = revoked.iter().collect();
        self.ca.write_crl(key_dir, &refs, self.crl_next_update);
    }
}

impl PkiInvoker for MockInvoker {
    fn issue(&self, identity: &ClientIdentity, _params: &KeyParams) -> Result<()> {
        self.issued.fetch_add(1, Ordering::SeqCst);
        if self.fail_issue.contains(identity.id()) {
            return Err(IdentityError::ToolInvocation {
                id: identity.id().to_string(),
                step: Step::Issue,
                status: "exit status: 1".to_string(),
                stderr: "pkitool failed".to_string(),
            });
        }
        self.ca.write_client(identity.key_dir(), identity.id());
        Ok(())
    }

    fn revoke(&self, identity: &ClientIdentity, _ca: &CaConfig) -> Result<()> {
        self.revoked.fetch_add(1, Ordering::SeqCst);
        if self.lie_on_revoke {
            return Ok(());
        }
        self.revocation_applied.store(true, Ordering::SeqCst);
        if self.crl_on_revoke {
            let pem = std::fs::read(identity.cert_path()).unwrap();
            self.revoked_certs
                .lock()
                .unwrap()
                .push(X509::from_pem(&pem).unwrap());
            self.write_crl(identity.key_dir());
        }
        Ok(())
    }

    fn regenerate_crl(&self, identity: &ClientIdentity, _ca: &CaConfig) -> Result<()> {
        self.crl_refreshes.fetch_add(1, Ordering::SeqCst);
        if self.crl_on_revoke {
            self.write_crl(identity.key_dir());
        }
        Ok(())
    }
}

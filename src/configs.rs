use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::pki_invoker::{CaConfig, KeyParams};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub pki: PkiConfig,
    #[serde(default)]
    pub key: KeyDefaults,
    #[serde(default)]
    pub clients: ClientDefaults,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

/// Locations of the CA state and the external easy-rsa toolchain.
#[derive(Debug, Deserialize, Clone)]
pub struct PkiConfig {
    #[serde(default = "default_key_dir")]
    pub key_dir: PathBuf,
    #[serde(default = "default_easy_rsa_dir")]
    pub easy_rsa_dir: PathBuf,
    /// openssl.cnf handed to pkitool as KEY_CONFIG
    pub key_config: Option<PathBuf>,
    /// openssl.cnf used for `openssl ca -revoke` and `-gencrl`
    pub ca_openssl_cnf: Option<PathBuf>,
    #[serde(default = "default_crl_file")]
    pub crl_file: String,
    #[serde(default = "default_pkitool")]
    pub pkitool: String,
    #[serde(default = "default_openssl_bin")]
    pub openssl_bin: String,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            key_dir: default_key_dir(),
            easy_rsa_dir: default_easy_rsa_dir(),
            key_config: None,
            ca_openssl_cnf: None,
            crl_file: default_crl_file(),
            pkitool: default_pkitool(),
            openssl_bin: default_openssl_bin(),
        }
    }
}

fn default_key_dir() -> PathBuf {
    PathBuf::from("/etc/openvpn/keys")
}

fn default_easy_rsa_dir() -> PathBuf {
    PathBuf::from("/etc/openvpn/easy-rsa")
}

fn default_crl_file() -> String {
    "crl.pem".to_string()
}

fn default_pkitool() -> String {
    "pkitool".to_string()
}

fn default_openssl_bin() -> String {
    "openssl".to_string()
}

/// Subject and lifetime parameters exported to pkitool.
#[derive(Debug, Deserialize, Clone)]
pub struct KeyDefaults {
    #[serde(default = "default_ca_expire")]
    pub ca_expire: u32,
    #[serde(default = "default_expire")]
    pub expire: u32,
    #[serde(default = "default_size")]
    pub size: u32,
    #[serde(default = "default_country")]
    pub country: String,
    #[serde(default = "default_province")]
    pub province: String,
    #[serde(default = "default_city")]
    pub city: String,
    #[serde(default = "default_org")]
    pub org: String,
    #[serde(default = "default_email")]
    pub email: String,
}

impl Default for KeyDefaults {
    fn default() -> Self {
        Self {
            ca_expire: default_ca_expire(),
            expire: default_expire(),
            size: default_size(),
            country: default_country(),
            province: default_province(),
            city: default_city(),
            org: default_org(),
            email: default_email(),
        }
    }
}

fn default_ca_expire() -> u32 {
    3650 // 10 years
}

fn default_expire() -> u32 {
    3650
}

fn default_size() -> u32 {
    2048
}

fn default_country() -> String {
    "US".to_string()
}

fn default_province() -> String {
    "CA".to_string()
}

fn default_city() -> String {
    "San Francisco".to_string()
}

fn default_org() -> String {
    "Fort Funston".to_string()
}

fn default_email() -> String {
    "admin@foobar.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientDefaults {
    #[serde(default = "default_client_prefix")]
    pub client_prefix: String,
    /// Directory holding `client.conf` and `client-inline.conf` templates.
    /// Built-in templates are used when unset.
    pub templates_dir: Option<PathBuf>,
    #[serde(default = "default_create_bundle")]
    pub create_bundle: bool,
    pub destination: Option<PathBuf>,
    /// Connection settings rendered into every profile (`gateway`, `port`,
    /// `proto`, `dev`). Per-client variables take precedence.
    #[serde(default = "default_profile_vars")]
    pub profile_vars: BTreeMap<String, String>,
}

impl Default for ClientDefaults {
    fn default() -> Self {
        Self {
            client_prefix: default_client_prefix(),
            templates_dir: None,
            create_bundle: default_create_bundle(),
            destination: None,
            profile_vars: default_profile_vars(),
        }
    }
}

fn default_client_prefix() -> String {
    "vpn-prod".to_string()
}

fn default_create_bundle() -> bool {
    true
}

fn default_profile_vars() -> BTreeMap<String, String> {
    [
        ("gateway", "vpn.example.com"),
        ("port", "1194"),
        ("proto", "udp"),
        ("dev", "tun"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    #[serde(default = "default_records_dir")]
    pub records_dir: PathBuf,
    #[serde(default = "default_query")]
    pub user_query: String,
    #[serde(default = "default_query")]
    pub remove_user_query: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            records_dir: default_records_dir(),
            user_query: default_query(),
            remove_user_query: default_query(),
        }
    }
}

fn default_records_dir() -> PathBuf {
    PathBuf::from("/etc/openvpn/users")
}

fn default_query() -> String {
    "*:*".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct BatchConfig {
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { jobs: default_jobs() }
    }
}

fn default_jobs() -> usize {
    1
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .context(format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&config_str)
    }

    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(config_str).context("Failed to parse config file")?;

        if config.batch.jobs == 0 {
            anyhow::bail!("batch.jobs must be at least 1");
        }
        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }

    pub fn key_params(&self) -> KeyParams {
        KeyParams {
            easy_rsa_dir: self.pki.easy_rsa_dir.clone(),
            key_config: self
                .pki
                .key_config
                .clone()
                .unwrap_or_else(|| self.pki.easy_rsa_dir.join("openssl.cnf")),
            key_dir: self.pki.key_dir.clone(),
            ca_expire: self.key.ca_expire,
            expire: self.key.expire,
            size: self.key.size,
            country: self.key.country.clone(),
            province: self.key.province.clone(),
            city: self.key.city.clone(),
            org: self.key.org.clone(),
            email: self.key.email.clone(),
        }
    }

    pub fn ca_config(&self) -> CaConfig {
        CaConfig {
            key_dir: self.pki.key_dir.clone(),
            openssl_cnf: self
                .pki
                .ca_openssl_cnf
                .clone()
                .unwrap_or_else(|| self.pki.key_dir.join("openssl.cnf")),
            crl_path: self.pki.key_dir.join(&self.pki.crl_file),
            key_params: self.key_params(),
        }
    }
}

//! Provisioner configuration
//!
//! A single TOML file carries the host settings, external command lines,
//! resilience thresholds and the `[[applications]]` table the domain model is
//! built from.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};

use crate::dns::dnssec_keys::DnssecAlgorithm;
use crate::error::{ProvisionError, Result};

/// Placeholder substituted with the staged file path in command lines
pub const CONFIG_PLACEHOLDER: &str = "{config}";

/// Upper bound for concurrently processed domains (7 ± 2)
pub const MAX_CONCURRENCY: usize = 9;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub network: NetworkConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub dnssec: DnssecSettings,
    #[serde(default)]
    pub acme: AcmeSettings,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub commands: CommandsConfig,
    #[serde(default)]
    pub firewall: FirewallSettings,
    #[serde(default)]
    pub deploy: DeploySettings,
    #[serde(default)]
    pub routing: RoutingSettings,
    /// Application → domains → subdomains mapping
    #[serde(default)]
    pub applications: Vec<ApplicationEntry>,
}

/// Public addressing of the edge host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConfig {
    /// Address published in A records
    pub public_ipv4: Ipv4Addr,
    /// Address published in AAAA records (optional)
    #[serde(default)]
    pub public_ipv6: Option<Ipv6Addr>,
    /// Authoritative nameservers (first one is the SOA primary)
    pub nameservers: Vec<String>,
    /// Mail exchange; defaults to `mail.<domain>`
    #[serde(default)]
    pub mail_exchange: Option<String>,
    /// CA allowed to issue for every domain (CAA record)
    #[serde(default)]
    pub caa_issuer: Option<String>,
    /// TTL for address records
    #[serde(default = "default_ttl")]
    pub default_ttl: u32,
    /// Host the backends listen on
    #[serde(default = "default_backend_host")]
    pub backend_host: Ipv4Addr,
}

/// Filesystem layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Phase log, checkpoint, zone state and DNSSEC keys
    pub state_dir: PathBuf,
    /// Directory the DNS server reads zone files from
    pub zone_dir: PathBuf,
    /// Certificates, private keys and certificate metadata
    pub cert_dir: PathBuf,
    /// Webroot served by the proxy for HTTP-01 challenges
    pub webroot: PathBuf,
    /// Active reverse-proxy configuration
    pub proxy_config: PathBuf,
    /// Active packet-filter policy
    pub firewall_config: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/edge-provisioner"),
            zone_dir: PathBuf::from("/var/nsd/zones/master"),
            cert_dir: PathBuf::from("/etc/ssl/edge"),
            webroot: PathBuf::from("/var/www/acme"),
            proxy_config: PathBuf::from("/etc/haproxy/haproxy.cfg"),
            firewall_config: PathBuf::from("/etc/pf.conf"),
        }
    }
}

impl PathsConfig {
    pub fn zone_state_dir(&self) -> PathBuf {
        self.state_dir.join("zones")
    }

    pub fn key_dir(&self) -> PathBuf {
        self.state_dir.join("keys")
    }

    pub fn checkpoint_file(&self) -> PathBuf {
        self.state_dir.join("checkpoint.json")
    }

    pub fn phase_log_file(&self) -> PathBuf {
        self.state_dir.join("phases.log")
    }

    pub fn acme_account_file(&self) -> PathBuf {
        self.state_dir.join("acme-account.json")
    }
}

/// DNSSEC signing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DnssecSettings {
    pub algorithm: DnssecAlgorithm,
    /// Signature validity (days)
    pub signature_validity_days: u32,
    /// Re-sign this many days before signatures expire
    pub resign_before_days: u32,
    /// Start signature validity slightly in the past (seconds)
    pub inception_offset_secs: u64,
}

impl Default for DnssecSettings {
    fn default() -> Self {
        Self {
            algorithm: DnssecAlgorithm::EcdsaP256Sha256,
            signature_validity_days: 30,
            resign_before_days: 7,
            inception_offset_secs: 3600,
        }
    }
}

/// ACME certificate settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcmeSettings {
    /// Contact email for the ACME account
    pub email: String,
    /// Use Let's Encrypt staging environment
    pub staging: bool,
    /// Override the directory URL (other ACME CAs)
    pub directory_url: Option<String>,
    /// Terms of service agreement (required for account creation)
    pub agree_tos: bool,
    /// Renew this many days before expiry
    pub renew_before_days: u32,
    /// Bounded attempts per certificate
    pub max_attempts: u32,
    /// Hard timeout per attempt (seconds)
    pub attempt_timeout_secs: u64,
    /// Delay before the second attempt; doubles afterwards (seconds)
    pub initial_backoff_secs: u64,
    /// Fetch a test token from `http://<domain>/.well-known/acme-challenge/`
    /// before ordering. Needs port 80 to reach the responder already; when it
    /// cannot, the CA's own fetch would fail as well. Turn off only when the
    /// host cannot reach its own public address (hairpin NAT).
    pub probe_challenge_http: bool,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            email: String::new(),
            staging: true, // Default to staging for safety
            directory_url: None,
            agree_tos: false,
            renew_before_days: 30,
            max_attempts: 3,
            attempt_timeout_secs: 120,
            initial_backoff_secs: 5,
            probe_challenge_http: true,
        }
    }
}

/// Circuit breaker, resource budget and concurrency settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Seconds the breaker stays open before a half-open trial
    pub cooldown_secs: u64,
    pub max_cpu_percent: f32,
    pub max_memory_percent: f32,
    pub max_disk_percent: f32,
    /// Domains processed concurrently
    pub concurrency: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 60,
            max_cpu_percent: 80.0,
            max_memory_percent: 90.0,
            max_disk_percent: 85.0,
            concurrency: 7,
        }
    }
}

/// External command lines (argv, never passed through a shell)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CommandsConfig {
    pub dns_reload: Vec<String>,
    pub proxy_validate: Vec<String>,
    pub proxy_reload: Vec<String>,
    pub firewall_validate: Vec<String>,
    pub firewall_load: Vec<String>,
    /// Timeout for each command (seconds)
    pub timeout_secs: u64,
}

impl Default for CommandsConfig {
    fn default() -> Self {
        fn argv(parts: &[&str]) -> Vec<String> {
            parts.iter().map(|p| p.to_string()).collect()
        }
        Self {
            dns_reload: argv(&["nsd-control", "reload"]),
            proxy_validate: argv(&["haproxy", "-c", "-f", CONFIG_PLACEHOLDER]),
            proxy_reload: argv(&["systemctl", "reload", "haproxy"]),
            firewall_validate: argv(&["pfctl", "-nf", CONFIG_PLACEHOLDER]),
            firewall_load: argv(&["pfctl", "-f", CONFIG_PLACEHOLDER]),
            timeout_secs: 30,
        }
    }
}

/// Packet-filter limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FirewallSettings {
    /// Interface group inbound rules apply to
    pub interface: String,
    pub ssh_port: u16,
    pub ssh_max_src_conn: u32,
    pub ssh_max_src_conn_rate: u32,
    pub ssh_rate_window_secs: u32,
    pub web_max_src_conn: u32,
    pub web_max_src_conn_rate: u32,
    pub web_rate_window_secs: u32,
}

impl Default for FirewallSettings {
    fn default() -> Self {
        Self {
            interface: "egress".to_string(),
            ssh_port: 22,
            ssh_max_src_conn: 10,
            ssh_max_src_conn_rate: 5,
            ssh_rate_window_secs: 30,
            web_max_src_conn: 100,
            web_max_src_conn_rate: 100,
            web_rate_window_secs: 10,
        }
    }
}

/// Deploy phase settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeploySettings {
    /// Treat an unreachable backend as a domain failure instead of a warning
    pub require_backends: bool,
    pub probe_timeout_secs: u64,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            require_backends: false,
            probe_timeout_secs: 3,
        }
    }
}

/// Reverse-proxy settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingSettings {
    /// Local server that serves `paths.webroot` for HTTP-01 challenges
    pub challenge_backend: SocketAddr,
    /// Strict-Transport-Security max-age (seconds)
    pub hsts_max_age_secs: u64,
    pub content_security_policy: String,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            challenge_backend: SocketAddr::from((Ipv4Addr::LOCALHOST, 8402)),
            hsts_max_age_secs: 31_536_000,
            content_security_policy: "default-src 'self'".to_string(),
        }
    }
}

/// Raw `[[applications]]` entry, validated by the domain model
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplicationEntry {
    pub name: String,
    /// Kept wide so out-of-range values are reported instead of failing the parse
    pub port: u32,
    #[serde(default)]
    pub domains: Vec<DomainEntry>,
}

/// Raw `[[applications.domains]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DomainEntry {
    pub name: String,
    #[serde(default)]
    pub subdomains: Vec<String>,
}

fn default_ttl() -> u32 {
    300
}

fn default_backend_host() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            ProvisionError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Validate host-level settings. Application entries are validated by
    /// the domain model so one bad entry never rejects the whole file.
    pub fn validate(&self) -> Result<()> {
        if self.network.nameservers.is_empty() {
            return Err(ProvisionError::Config(
                "network.nameservers must not be empty".to_string(),
            ));
        }

        if self.resilience.failure_threshold == 0 {
            return Err(ProvisionError::Config(
                "resilience.failure_threshold must be > 0".to_string(),
            ));
        }

        if self.resilience.concurrency == 0 || self.resilience.concurrency > MAX_CONCURRENCY {
            return Err(ProvisionError::Config(format!(
                "resilience.concurrency must be between 1 and {}",
                MAX_CONCURRENCY
            )));
        }

        for (name, value) in [
            ("max_cpu_percent", self.resilience.max_cpu_percent),
            ("max_memory_percent", self.resilience.max_memory_percent),
            ("max_disk_percent", self.resilience.max_disk_percent),
        ] {
            if !(value > 0.0 && value <= 100.0) {
                return Err(ProvisionError::Config(format!(
                    "resilience.{} must be in (0, 100]",
                    name
                )));
            }
        }

        if self.acme.max_attempts == 0 {
            return Err(ProvisionError::Config(
                "acme.max_attempts must be > 0".to_string(),
            ));
        }

        if self.dnssec.resign_before_days >= self.dnssec.signature_validity_days {
            return Err(ProvisionError::Config(
                "dnssec.resign_before_days must be smaller than signature_validity_days".to_string(),
            ));
        }

        for (name, argv) in [
            ("dns_reload", &self.commands.dns_reload),
            ("proxy_validate", &self.commands.proxy_validate),
            ("proxy_reload", &self.commands.proxy_reload),
            ("firewall_validate", &self.commands.firewall_validate),
            ("firewall_load", &self.commands.firewall_load),
        ] {
            if argv.is_empty() {
                return Err(ProvisionError::Config(format!(
                    "commands.{} must not be empty",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Stable digest of the whole configuration, used to key the phase log
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [network]
        public_ipv4 = "203.0.113.10"
        nameservers = ["ns1.example.net", "ns2.example.net"]

        [[applications]]
        name = "social"
        port = 4000

        [[applications.domains]]
        name = "example.test"
        subdomains = ["www", "api"]
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.network.public_ipv4, Ipv4Addr::new(203, 0, 113, 10));
        assert_eq!(config.network.backend_host, Ipv4Addr::LOCALHOST);
        assert_eq!(config.network.default_ttl, 300);
        assert_eq!(config.resilience.concurrency, 7);
        assert_eq!(config.resilience.max_cpu_percent, 80.0);
        assert_eq!(config.acme.max_attempts, 3);
        assert_eq!(config.acme.attempt_timeout_secs, 120);
        assert!(config.acme.staging);
        assert_eq!(config.dnssec.algorithm, DnssecAlgorithm::EcdsaP256Sha256);
        assert_eq!(config.applications.len(), 1);
        assert_eq!(config.applications[0].domains[0].subdomains, vec!["www", "api"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.resilience.concurrency = 12;
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.network.nameservers.clear();
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.resilience.max_disk_percent = 0.0;
        assert!(config.validate().is_err());

        let mut config = Config::from_toml(MINIMAL).unwrap();
        config.commands.proxy_reload.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fingerprint_tracks_changes() {
        let config = Config::from_toml(MINIMAL).unwrap();
        let same = Config::from_toml(MINIMAL).unwrap();
        assert_eq!(config.fingerprint(), same.fingerprint());

        let mut changed = config.clone();
        changed.applications[0].port = 4001;
        assert_ne!(config.fingerprint(), changed.fingerprint());
    }

    #[test]
    fn test_missing_network_section_fails() {
        assert!(Config::from_toml("[paths]\nstate_dir = \"/tmp\"").is_err());
    }

    #[test]
    fn test_derived_paths() {
        let paths = PathsConfig::default();
        assert!(paths.checkpoint_file().ends_with("checkpoint.json"));
        assert!(paths.phase_log_file().ends_with("phases.log"));
        assert!(paths.key_dir().starts_with(&paths.state_dir));
    }
}

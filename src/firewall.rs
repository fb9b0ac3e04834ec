//! Default-deny packet-filter policy
//!
//! The policy is a typed rule list rebuilt from configuration on every run,
//! rendered to pf.conf syntax and installed with the same stage, validate,
//! swap and load flow as the proxy configuration.

use std::fmt;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::info;

use crate::config::{CommandsConfig, Config, FirewallSettings};
use crate::error::{ProvisionError, Result};
use crate::install::{InstallOutcome, StagedInstall};
use crate::tools::CommandRunner;

/// Overload table for SSH brute-force sources
pub const BRUTEFORCE_TABLE: &str = "bruteforce";

/// Overload table for HTTP/HTTPS flood sources
pub const FLOODERS_TABLE: &str = "flooders";

static IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,31}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Per-source connection limits; offenders are moved into `overload`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionLimit {
    pub max_src_conn: u32,
    pub max_src_conn_rate: u32,
    pub rate_window_secs: u32,
    pub overload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FirewallRule {
    /// Drop everything inbound unless a later rule passes it
    BlockInAll,
    /// Drop sources listed in an overload table
    BlockFromTable { table: String },
    /// Stateful allow for all outbound traffic
    PassOutAll,
    PassIn {
        protocols: Vec<Protocol>,
        ports: Vec<u16>,
        limit: Option<ConnectionLimit>,
    },
    PassIcmp { types: Vec<&'static str> },
    PassIcmp6 { types: Vec<&'static str> },
}

/// Complete typed pf policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirewallPolicy {
    pub interface: String,
    /// Persistent tables, declared before any rule references them
    pub tables: Vec<String>,
    pub scrub: bool,
    pub rules: Vec<FirewallRule>,
}

const ICMP_TYPES: [&str; 5] = ["echoreq", "echorep", "unreach", "timex", "paramprob"];

/// ICMPv6 also needs neighbour discovery or IPv6 stops working
const ICMP6_TYPES: [&str; 9] = [
    "echoreq",
    "echorep",
    "unreach",
    "timex",
    "paramprob",
    "routersol",
    "routeradv",
    "neighbrsol",
    "neighbradv",
];

/// Build the default-deny policy from configuration
pub fn build_firewall_policy(config: &Config) -> FirewallPolicy {
    let fw = &config.firewall;

    FirewallPolicy {
        interface: fw.interface.clone(),
        tables: vec![BRUTEFORCE_TABLE.to_string(), FLOODERS_TABLE.to_string()],
        scrub: true,
        rules: vec![
            FirewallRule::BlockInAll,
            FirewallRule::BlockFromTable {
                table: BRUTEFORCE_TABLE.to_string(),
            },
            FirewallRule::BlockFromTable {
                table: FLOODERS_TABLE.to_string(),
            },
            FirewallRule::PassOutAll,
            FirewallRule::PassIn {
                protocols: vec![Protocol::Tcp],
                ports: vec![fw.ssh_port],
                limit: Some(ssh_limit(fw)),
            },
            FirewallRule::PassIn {
                protocols: vec![Protocol::Tcp],
                ports: vec![80, 443],
                limit: Some(ConnectionLimit {
                    max_src_conn: fw.web_max_src_conn,
                    max_src_conn_rate: fw.web_max_src_conn_rate,
                    rate_window_secs: fw.web_rate_window_secs,
                    overload: FLOODERS_TABLE.to_string(),
                }),
            },
            FirewallRule::PassIn {
                protocols: vec![Protocol::Tcp, Protocol::Udp],
                ports: vec![53],
                limit: None,
            },
            FirewallRule::PassIcmp {
                types: ICMP_TYPES.to_vec(),
            },
            FirewallRule::PassIcmp6 {
                types: ICMP6_TYPES.to_vec(),
            },
        ],
    }
}

fn ssh_limit(fw: &FirewallSettings) -> ConnectionLimit {
    ConnectionLimit {
        max_src_conn: fw.ssh_max_src_conn,
        max_src_conn_rate: fw.ssh_max_src_conn_rate,
        rate_window_secs: fw.ssh_rate_window_secs,
        overload: BRUTEFORCE_TABLE.to_string(),
    }
}

fn braced<T: fmt::Display>(items: &[T]) -> String {
    match items {
        [single] => single.to_string(),
        _ => format!(
            "{{ {} }}",
            items.iter().map(ToString::to_string).collect::<Vec<_>>().join(" ")
        ),
    }
}

impl FirewallPolicy {
    pub fn validate(&self) -> Result<()> {
        if !IDENT_RE.is_match(&self.interface) {
            return Err(ProvisionError::validation(&self.interface, "invalid interface name"));
        }
        for table in &self.tables {
            if !IDENT_RE.is_match(table) {
                return Err(ProvisionError::validation(table, "invalid table name"));
            }
        }

        if !self.rules.first().map_or(false, |r| *r == FirewallRule::BlockInAll) {
            return Err(ProvisionError::validation("firewall", "policy must start with block in all"));
        }

        for rule in &self.rules {
            match rule {
                FirewallRule::BlockFromTable { table } if !self.tables.contains(table) => {
                    return Err(ProvisionError::validation(table, "table not declared"));
                }
                FirewallRule::PassIn { ports, limit, .. } => {
                    if ports.is_empty() || ports.contains(&0) {
                        return Err(ProvisionError::validation("firewall", "pass rule needs non-zero ports"));
                    }
                    if let Some(limit) = limit {
                        if !self.tables.contains(&limit.overload) {
                            return Err(ProvisionError::validation(&limit.overload, "table not declared"));
                        }
                        if limit.max_src_conn == 0 || limit.max_src_conn_rate == 0 || limit.rate_window_secs == 0 {
                            return Err(ProvisionError::validation(
                                "firewall",
                                "connection limits must be non-zero",
                            ));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Render pf.conf text
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Managed by edge-provisioner. Manual changes are overwritten.\n\n");
        out.push_str(&format!("ext_if = \"{}\"\n\n", self.interface));

        for table in &self.tables {
            out.push_str(&format!("table <{}> persist\n", table));
        }
        out.push('\n');

        out.push_str("set skip on lo\nset block-policy drop\n");
        if self.scrub {
            out.push_str("match in all scrub (no-df random-id max-mss 1440)\n");
        }
        out.push('\n');

        for rule in &self.rules {
            out.push_str(&render_rule(rule));
            out.push('\n');
        }
        out
    }
}

fn render_rule(rule: &FirewallRule) -> String {
    match rule {
        FirewallRule::BlockInAll => "block in all".to_string(),
        FirewallRule::BlockFromTable { table } => format!("block in quick from <{}>", table),
        FirewallRule::PassOutAll => "pass out all keep state".to_string(),
        FirewallRule::PassIn {
            protocols,
            ports,
            limit,
        } => {
            let mut line = format!(
                "pass in on $ext_if proto {} to port {}",
                braced(protocols),
                braced(ports)
            );
            match limit {
                Some(limit) => line.push_str(&format!(
                    " flags S/SA keep state (max-src-conn {}, max-src-conn-rate {}/{}, overload <{}> flush global)",
                    limit.max_src_conn, limit.max_src_conn_rate, limit.rate_window_secs, limit.overload
                )),
                None => line.push_str(" keep state"),
            }
            line
        }
        FirewallRule::PassIcmp { types } => {
            format!("pass in on $ext_if inet proto icmp icmp-type {} keep state", braced(types))
        }
        FirewallRule::PassIcmp6 { types } => {
            format!("pass in on $ext_if inet6 proto icmp6 icmp6-type {} keep state", braced(types))
        }
    }
}

/// Installs the policy through the packet filter's own validator
pub struct FirewallSynthesizer {
    config_path: PathBuf,
    commands: CommandsConfig,
}

impl FirewallSynthesizer {
    pub fn new(config: &Config) -> Self {
        Self {
            config_path: config.paths.firewall_config.clone(),
            commands: config.commands.clone(),
        }
    }

    pub async fn install(&self, runner: &dyn CommandRunner, policy: &FirewallPolicy) -> Result<InstallOutcome> {
        policy.validate()?;

        let outcome = StagedInstall {
            label: "firewall",
            target: &self.config_path,
            validate: &self.commands.firewall_validate,
            activate: &self.commands.firewall_load,
        }
        .install(runner, &policy.render())
        .await?;

        if outcome == InstallOutcome::Installed {
            info!(rules = policy.rules.len(), "Packet filter policy loaded");
        }
        Ok(outcome)
    }

    pub fn audit(&self, policy: &FirewallPolicy) -> Vec<String> {
        match std::fs::read_to_string(&self.config_path) {
            Ok(active) if active == policy.render() => Vec::new(),
            Ok(_) => vec![format!("{} differs from the generated policy", self.config_path.display())],
            Err(e) => vec![format!("{} unreadable: {}", self.config_path.display(), e)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::fake::FakeRunner;

    fn test_config() -> Config {
        Config::from_toml(
            r#"
            [network]
            public_ipv4 = "203.0.113.10"
            nameservers = ["ns1.example.net"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_policy_is_default_deny() {
        let policy = build_firewall_policy(&test_config());
        assert_eq!(policy.rules[0], FirewallRule::BlockInAll);
        assert!(policy.validate().is_ok());

        let text = policy.render();
        let block = text.find("block in all").unwrap();
        let first_pass = text.find("pass in").unwrap();
        assert!(block < first_pass);
        assert!(text.contains("pass out all keep state"));
        assert!(text.contains("match in all scrub"));
        assert!(text.contains("table <bruteforce> persist"));
        assert!(text.contains("table <flooders> persist"));
    }

    #[test]
    fn test_rate_limited_rules() {
        let text = build_firewall_policy(&test_config()).render();
        assert!(text.contains(
            "pass in on $ext_if proto tcp to port 22 flags S/SA keep state \
             (max-src-conn 10, max-src-conn-rate 5/30, overload <bruteforce> flush global)"
        ));
        assert!(text.contains(
            "pass in on $ext_if proto tcp to port { 80 443 } flags S/SA keep state \
             (max-src-conn 100, max-src-conn-rate 100/10, overload <flooders> flush global)"
        ));
        assert!(text.contains("pass in on $ext_if proto { tcp udp } to port 53 keep state"));
        assert!(text.contains("icmp-type { echoreq echorep unreach timex paramprob }"));
        assert!(text.contains("inet6 proto icmp6 icmp6-type { echoreq"));
    }

    #[test]
    fn test_ssh_port_follows_config() {
        let mut config = test_config();
        config.firewall.ssh_port = 2222;
        let text = build_firewall_policy(&config).render();
        assert!(text.contains("to port 2222 flags S/SA"));
    }

    #[test]
    fn test_build_is_pure() {
        let config = test_config();
        assert_eq!(build_firewall_policy(&config), build_firewall_policy(&config));
    }

    #[test]
    fn test_validation() {
        let mut policy = build_firewall_policy(&test_config());
        policy.interface = "em0; pass all".to_string();
        assert!(policy.validate().is_err());

        let mut policy = build_firewall_policy(&test_config());
        policy.tables.retain(|t| t != FLOODERS_TABLE);
        assert!(policy.validate().is_err());

        let mut policy = build_firewall_policy(&test_config());
        policy.rules.remove(0);
        assert!(policy.validate().is_err());

        let mut config = test_config();
        config.firewall.ssh_max_src_conn_rate = 0;
        assert!(build_firewall_policy(&config).validate().is_err());
    }

    #[tokio::test]
    async fn test_install_flow() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.paths.firewall_config = dir.path().join("pf.conf");
        let synth = FirewallSynthesizer::new(&config);
        let policy = build_firewall_policy(&config);

        let runner = FakeRunner::default();
        assert_eq!(synth.install(&runner, &policy).await.unwrap(), InstallOutcome::Installed);
        let calls = runner.calls();
        assert_eq!(calls[0][1], "-nf");
        assert_eq!(calls[1][1], "-f");
        assert_eq!(calls[1][2], config.paths.firewall_config.display().to_string());
        assert!(synth.audit(&policy).is_empty());

        let failing = FakeRunner::failing_on("-nf");
        let mut changed = policy.clone();
        changed.scrub = false;
        assert!(synth.install(&failing, &changed).await.is_err());
        assert!(synth.audit(&policy).is_empty());
    }
}

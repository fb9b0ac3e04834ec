//! Host-based reverse-proxy configuration
//!
//! Every apex and subdomain host with a usable certificate becomes one
//! [`HostRoute`]. The typed table is validated before it is rendered to
//! HAProxy configuration text, and the rendered file is installed through
//! [`StagedInstall`] so a configuration the proxy rejects never goes live.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::acme::{Certificate, CHALLENGE_PATH};
use crate::config::{CommandsConfig, Config, RoutingSettings};
use crate::domain_model::{Application, Domain};
use crate::error::{ProvisionError, Result};
use crate::install::{InstallOutcome, StagedInstall};
use crate::tools::CommandRunner;

static HOST_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z][a-z0-9-]{0,61}[a-z0-9]$").unwrap()
});

static HEADER_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]*$").unwrap());

static BACKEND_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]*$").unwrap());

/// A response header added to every HTTPS response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityHeader {
    pub name: String,
    pub value: String,
}

impl SecurityHeader {
    fn new(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: value.into(),
        }
    }
}

/// The fixed security header set
pub fn security_headers(settings: &RoutingSettings) -> Vec<SecurityHeader> {
    vec![
        SecurityHeader::new(
            "Strict-Transport-Security",
            format!("max-age={}; includeSubDomains", settings.hsts_max_age_secs),
        ),
        SecurityHeader::new("X-Content-Type-Options", "nosniff"),
        SecurityHeader::new("X-Frame-Options", "DENY"),
        SecurityHeader::new("X-XSS-Protection", "1; mode=block"),
        SecurityHeader::new("Content-Security-Policy", settings.content_security_policy.clone()),
    ]
}

/// One routed host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRoute {
    pub host: String,
    /// Apex domain the host belongs to
    pub domain: String,
    /// Backend (application) name
    pub application: String,
    /// Certificate chain + key bundle served for this host
    pub certificate: PathBuf,
    /// Rendered into the config so a renewed certificate triggers a reload
    pub certificate_issued_at: Option<DateTime<Utc>>,
    pub backend: SocketAddr,
}

/// A host left out of the routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedHost {
    pub host: String,
    pub domain: String,
    pub reason: String,
}

/// Complete, typed routing configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingConfig {
    pub routes: Vec<HostRoute>,
    pub headers: Vec<SecurityHeader>,
    /// Serves `/.well-known/acme-challenge/` over plain HTTP
    pub challenge_backend: SocketAddr,
    pub excluded: Vec<ExcludedHost>,
}

impl RoutingConfig {
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|r| r.host.as_str())
    }

    /// Reject anything that cannot be rendered safely
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();

        for route in &self.routes {
            if !HOST_RE.is_match(&route.host) {
                return Err(ProvisionError::validation(&route.host, "invalid host name"));
            }
            if !seen.insert(route.host.as_str()) {
                return Err(ProvisionError::validation(&route.host, "host routed twice"));
            }
            if !BACKEND_NAME_RE.is_match(&route.application) {
                return Err(ProvisionError::validation(
                    &route.application,
                    "invalid backend name",
                ));
            }
            if route.backend.port() == 0 {
                return Err(ProvisionError::validation(&route.host, "backend port is 0"));
            }
            let cert = route.certificate.to_string_lossy();
            if cert.is_empty() || cert.chars().any(|c| c.is_whitespace() || c == '"' || c.is_control()) {
                return Err(ProvisionError::validation(
                    &route.host,
                    format!("unusable certificate path '{}'", cert),
                ));
            }
        }

        for header in &self.headers {
            if !HEADER_NAME_RE.is_match(&header.name) {
                return Err(ProvisionError::validation(&header.name, "invalid header name"));
            }
            if header.value.is_empty() || header.value.chars().any(|c| c == '"' || c == '\\' || c.is_control()) {
                return Err(ProvisionError::validation(
                    &header.name,
                    "header value must be non-empty and free of quotes and control characters",
                ));
            }
        }

        Ok(())
    }

    /// Render HAProxy configuration text. Output is deterministic.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("# Managed by edge-provisioner. Manual changes are overwritten.\n\n");

        out.push_str(
            "global\n    \
             log stdout format raw local0\n    \
             ssl-default-bind-options ssl-min-ver TLSv1.2\n\n",
        );
        out.push_str(
            "defaults\n    \
             mode http\n    \
             log global\n    \
             option httplog\n    \
             timeout connect 5s\n    \
             timeout client 30s\n    \
             timeout server 30s\n\n",
        );

        out.push_str("frontend http_in\n    bind :80\n");
        out.push_str(&format!("    acl acme_challenge path_beg {}\n", CHALLENGE_PATH));
        out.push_str("    use_backend acme_challenge if acme_challenge\n");
        out.push_str("    http-request redirect scheme https code 301 if !acme_challenge\n\n");

        let by_backend = self.routes_by_backend();

        if !self.routes.is_empty() {
            let bundles: BTreeMap<String, Option<DateTime<Utc>>> = self
                .routes
                .iter()
                .map(|r| (r.certificate.display().to_string(), r.certificate_issued_at))
                .collect();

            out.push_str("frontend https_in\n");
            for (bundle, issued_at) in &bundles {
                if let Some(issued_at) = issued_at {
                    out.push_str(&format!("    # {} issued {}\n", bundle, issued_at.to_rfc3339()));
                }
            }
            out.push_str("    bind :443 ssl");
            for bundle in bundles.keys() {
                out.push_str(&format!(" crt {}", bundle));
            }
            out.push_str(" alpn h2,http/1.1\n");

            for header in &self.headers {
                out.push_str(&format!(
                    "    http-response set-header {} \"{}\"\n",
                    header.name, header.value
                ));
            }
            for (backend, routes) in &by_backend {
                let hosts: Vec<&str> = routes.iter().map(|r| r.host.as_str()).collect();
                out.push_str(&format!(
                    "    use_backend app_{} if {{ req.hdr(host),field(1,:) -i {} }}\n",
                    backend,
                    hosts.join(" ")
                ));
            }
            out.push('\n');
        }

        out.push_str(&format!(
            "backend acme_challenge\n    server challenge {}\n",
            self.challenge_backend
        ));

        for (backend, routes) in &by_backend {
            let addr = routes[0].backend;
            out.push_str(&format!(
                "\nbackend app_{}\n    server {} {} check\n",
                backend, backend, addr
            ));
        }

        out
    }

    fn routes_by_backend(&self) -> BTreeMap<&str, Vec<&HostRoute>> {
        let mut grouped: BTreeMap<&str, Vec<&HostRoute>> = BTreeMap::new();
        for route in &self.routes {
            grouped.entry(route.application.as_str()).or_default().push(route);
        }
        grouped
    }
}

/// Builds and installs the proxy configuration
pub struct RoutingSynthesizer {
    settings: RoutingSettings,
    backend_host: Ipv4Addr,
    config_path: PathBuf,
    commands: CommandsConfig,
}

impl RoutingSynthesizer {
    pub fn new(config: &Config) -> Self {
        Self {
            settings: config.routing.clone(),
            backend_host: config.network.backend_host,
            config_path: config.paths.proxy_config.clone(),
            commands: config.commands.clone(),
        }
    }

    pub fn build_routing_table<'a>(
        &self,
        applications: impl IntoIterator<Item = &'a Application>,
        domains: &[Domain],
        certificates: &HashMap<String, Certificate>,
    ) -> Result<RoutingConfig> {
        self.build_routing_table_at(applications, domains, certificates, Utc::now())
    }

    /// Route every host whose certificate is usable at `now`
    pub fn build_routing_table_at<'a>(
        &self,
        applications: impl IntoIterator<Item = &'a Application>,
        domains: &[Domain],
        certificates: &HashMap<String, Certificate>,
        now: DateTime<Utc>,
    ) -> Result<RoutingConfig> {
        let ports: HashMap<&str, u16> = applications
            .into_iter()
            .map(|app| (app.name.as_str(), app.port))
            .collect();

        let mut routes = Vec::new();
        let mut excluded = Vec::new();

        for domain in domains {
            let Some(&port) = ports.get(domain.application.as_str()) else {
                for host in domain.hosts() {
                    excluded.push(ExcludedHost {
                        host,
                        domain: domain.name.clone(),
                        reason: format!("application '{}' unknown", domain.application),
                    });
                }
                continue;
            };

            let cert = certificates.get(&domain.name);
            for host in domain.hosts() {
                let reason = match cert {
                    None => Some("no certificate".to_string()),
                    Some(c) if !c.is_usable(now) => Some(format!("certificate {}", c.status)),
                    Some(c) if !c.alt_names.contains(&host) => {
                        Some("host not covered by certificate".to_string())
                    }
                    Some(_) => None,
                };

                match (reason, cert) {
                    (None, Some(c)) => routes.push(HostRoute {
                        host,
                        domain: domain.name.clone(),
                        application: domain.application.clone(),
                        certificate: c.bundle_path.clone(),
                        certificate_issued_at: c.issued_at,
                        backend: SocketAddr::from((self.backend_host, port)),
                    }),
                    (reason, _) => {
                        let reason = reason.unwrap_or_else(|| "no certificate".to_string());
                        warn!(host = %host, reason = %reason, "Host excluded from routing");
                        excluded.push(ExcludedHost {
                            host,
                            domain: domain.name.clone(),
                            reason,
                        });
                    }
                }
            }
        }

        let config = RoutingConfig {
            routes,
            headers: security_headers(&self.settings),
            challenge_backend: self.settings.challenge_backend,
            excluded,
        };
        config.validate()?;

        debug!(
            routes = config.routes.len(),
            excluded = config.excluded.len(),
            "Routing table built"
        );
        Ok(config)
    }

    /// Stage, validate with the proxy, swap and reload
    pub async fn install(&self, runner: &dyn CommandRunner, config: &RoutingConfig) -> Result<InstallOutcome> {
        config.validate()?;
        let rendered = config.render();

        let outcome = StagedInstall {
            label: "proxy",
            target: &self.config_path,
            validate: &self.commands.proxy_validate,
            activate: &self.commands.proxy_reload,
        }
        .install(runner, &rendered)
        .await?;

        if outcome == InstallOutcome::Installed {
            info!(routes = config.routes.len(), "Proxy routing updated");
        }
        Ok(outcome)
    }

    /// Compare the active proxy configuration with what `config` renders to
    pub fn audit(&self, config: &RoutingConfig) -> Vec<String> {
        match fs::read_to_string(&self.config_path) {
            Ok(active) if active == config.render() => Vec::new(),
            Ok(_) => vec![format!(
                "{} differs from the routing the model produces",
                self.config_path.display()
            )],
            Err(e) => vec![format!("{} unreadable: {}", self.config_path.display(), e)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::CertStatus;
    use crate::tools::fake::FakeRunner;

    fn test_config(dir: &tempfile::TempDir) -> Config {
        let mut config = Config::from_toml(
            r#"
            [network]
            public_ipv4 = "203.0.113.10"
            nameservers = ["ns1.example.net"]
            "#,
        )
        .unwrap();
        config.paths.proxy_config = dir.path().join("haproxy.cfg");
        config.paths.cert_dir = dir.path().join("certs");
        config
    }

    fn app(name: &str, port: u16) -> Application {
        Application {
            name: name.to_string(),
            port,
            domains: vec![],
        }
    }

    fn domain(name: &str, application: &str, subs: &[&str]) -> Domain {
        Domain {
            name: name.to_string(),
            application: application.to_string(),
            subdomains: subs.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn cert(domain: &Domain, status: CertStatus, now: DateTime<Utc>) -> Certificate {
        Certificate {
            domain: domain.name.clone(),
            alt_names: domain.hosts(),
            authority: "https://acme.test/directory".to_string(),
            cert_path: PathBuf::from(format!("/certs/{}.crt", domain.name)),
            key_path: PathBuf::from(format!("/certs/{}.key", domain.name)),
            bundle_path: PathBuf::from(format!("/certs/{}.pem", domain.name)),
            issued_at: Some(now),
            expires_at: Some(now + chrono::Duration::days(90)),
            status,
            failure_reason: None,
        }
    }

    #[test]
    fn test_routes_every_host_with_usable_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let synth = RoutingSynthesizer::new(&test_config(&dir));
        let now = Utc::now();

        let social = domain("example.test", "social", &["www", "api"]);
        let certs = HashMap::from([(social.name.clone(), cert(&social, CertStatus::Valid, now))]);
        let apps = [app("social", 4000)];

        let table = synth
            .build_routing_table_at(&apps, &[social], &certs, now)
            .unwrap();

        assert_eq!(
            table.hosts().collect::<Vec<_>>(),
            vec!["example.test", "www.example.test", "api.example.test"]
        );
        for route in &table.routes {
            assert_eq!(route.backend, "127.0.0.1:4000".parse().unwrap());
            assert_eq!(route.certificate, PathBuf::from("/certs/example.test.pem"));
        }
        assert!(table.excluded.is_empty());
        assert_eq!(table.headers.len(), 5);
    }

    #[test]
    fn test_hosts_without_valid_certificate_are_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let synth = RoutingSynthesizer::new(&test_config(&dir));
        let now = Utc::now();

        let a = domain("a.test", "alpha", &[]);
        let b = domain("b.test", "beta", &["www"]);
        let c = domain("c.test", "alpha", &[]);
        let certs = HashMap::from([
            (a.name.clone(), cert(&a, CertStatus::Valid, now)),
            (b.name.clone(), cert(&b, CertStatus::Failed, now)),
        ]);
        let apps = [app("alpha", 4000), app("beta", 4001)];

        let table = synth
            .build_routing_table_at(&apps, &[a, b, c], &certs, now)
            .unwrap();

        assert_eq!(table.hosts().collect::<Vec<_>>(), vec!["a.test"]);
        let excluded: Vec<&str> = table.excluded.iter().map(|e| e.host.as_str()).collect();
        assert_eq!(excluded, vec!["b.test", "www.b.test", "c.test"]);
        assert_eq!(table.excluded[0].reason, "certificate failed");
        assert_eq!(table.excluded[2].reason, "no certificate");
    }

    #[test]
    fn test_render_contains_redirect_headers_and_backends() {
        let dir = tempfile::tempdir().unwrap();
        let synth = RoutingSynthesizer::new(&test_config(&dir));
        let now = Utc::now();

        let social = domain("example.test", "social", &["www"]);
        let certs = HashMap::from([(social.name.clone(), cert(&social, CertStatus::Valid, now))]);
        let apps = [app("social", 4000)];
        let table = synth
            .build_routing_table_at(&apps, &[social], &certs, now)
            .unwrap();

        let text = table.render();
        assert!(text.contains("acl acme_challenge path_beg /.well-known/acme-challenge/"));
        assert!(text.contains("http-request redirect scheme https code 301 if !acme_challenge"));
        assert!(text.contains("bind :443 ssl crt /certs/example.test.pem alpn h2,http/1.1"));
        assert!(text.contains(
            "http-response set-header Strict-Transport-Security \"max-age=31536000; includeSubDomains\""
        ));
        assert!(text.contains("http-response set-header X-Frame-Options \"DENY\""));
        assert!(text.contains("http-response set-header X-Content-Type-Options \"nosniff\""));
        assert!(text.contains("use_backend app_social if { req.hdr(host),field(1,:) -i example.test www.example.test }"));
        assert!(text.contains("server social 127.0.0.1:4000 check"));
        assert!(text.contains("server challenge 127.0.0.1:8402"));

        // Rendering is deterministic
        assert_eq!(text, table.render());
    }

    #[test]
    fn test_empty_table_has_no_tls_frontend() {
        let table = RoutingConfig {
            routes: vec![],
            headers: security_headers(&RoutingSettings::default()),
            challenge_backend: RoutingSettings::default().challenge_backend,
            excluded: vec![],
        };
        let text = table.render();
        assert!(!text.contains("https_in"));
        assert!(text.contains("frontend http_in"));
    }

    #[test]
    fn test_validation_rejects_unsafe_values() {
        let route = HostRoute {
            host: "example.test".to_string(),
            domain: "example.test".to_string(),
            application: "social".to_string(),
            certificate: PathBuf::from("/certs/example.test.pem"),
            certificate_issued_at: None,
            backend: "127.0.0.1:4000".parse().unwrap(),
        };
        let base = RoutingConfig {
            routes: vec![route.clone()],
            headers: security_headers(&RoutingSettings::default()),
            challenge_backend: RoutingSettings::default().challenge_backend,
            excluded: vec![],
        };
        assert!(base.validate().is_ok());

        let mut bad_header = base.clone();
        bad_header.headers[4].value = "default-src \"self\"".to_string();
        assert!(bad_header.validate().is_err());

        let mut newline = base.clone();
        newline.headers[0].value = "max-age=1\nbind :8080".to_string();
        assert!(newline.validate().is_err());

        let mut bad_host = base.clone();
        bad_host.routes[0].host = "exa mple.test".to_string();
        assert!(bad_host.validate().is_err());

        let mut duplicate = base.clone();
        duplicate.routes.push(route);
        assert!(duplicate.validate().is_err());

        let mut bad_path = base;
        bad_path.routes[0].certificate = PathBuf::from("/certs/a b.pem");
        assert!(bad_path.validate().is_err());
    }

    #[tokio::test]
    async fn test_rejected_config_is_never_installed() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        fs::write(&config.paths.proxy_config, "previous\n").unwrap();
        let synth = RoutingSynthesizer::new(&config);
        let runner = FakeRunner::failing_on("-c");

        let table = RoutingConfig {
            routes: vec![],
            headers: security_headers(&config.routing),
            challenge_backend: config.routing.challenge_backend,
            excluded: vec![],
        };

        let err = synth.install(&runner, &table).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Validation { .. }));
        assert_eq!(fs::read_to_string(&config.paths.proxy_config).unwrap(), "previous\n");
        assert_eq!(runner.calls_to("systemctl"), 0);
        assert_eq!(synth.audit(&table).len(), 1);
    }

    #[tokio::test]
    async fn test_install_then_audit_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(&dir);
        let synth = RoutingSynthesizer::new(&config);
        let runner = FakeRunner::default();

        let table = RoutingConfig {
            routes: vec![],
            headers: security_headers(&config.routing),
            challenge_backend: config.routing.challenge_backend,
            excluded: vec![],
        };

        assert_eq!(synth.install(&runner, &table).await.unwrap(), InstallOutcome::Installed);
        assert!(synth.audit(&table).is_empty());
        assert_eq!(synth.install(&runner, &table).await.unwrap(), InstallOutcome::Unchanged);
        assert_eq!(runner.calls_to("systemctl"), 1);
    }
}

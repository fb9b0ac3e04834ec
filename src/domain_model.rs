//! Immutable domain registry
//!
//! Built once from the `[[applications]]` configuration table and passed by
//! reference into every synthesizer. Malformed entries are excluded and
//! reported as [`ValidationIssue`]s; the rest of the model stays usable.

use std::collections::{BTreeMap, HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ApplicationEntry;
use crate::error::{Component, DomainFailure};

/// Lowest backend port accepted (unprivileged range)
pub const MIN_BACKEND_PORT: u32 = 1024;

static LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").unwrap());

static APP_NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,31}$").unwrap());

/// A backend application and the port it listens on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Application {
    pub name: String,
    pub port: u16,
    /// Domains served, in configuration order
    pub domains: Vec<String>,
}

/// A registered apex domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Domain {
    /// Normalized FQDN without trailing dot
    pub name: String,
    /// Owning application name
    pub application: String,
    /// Relative subdomain labels, ordered and unique
    pub subdomains: Vec<String>,
}

impl Domain {
    /// Fully qualified subdomain names
    pub fn subdomain_fqdns(&self) -> Vec<String> {
        self.subdomains
            .iter()
            .map(|s| format!("{}.{}", s, self.name))
            .collect()
    }

    /// Every host name this domain answers for: the apex first, then the
    /// subdomains. This is also the certificate SAN list.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts = Vec::with_capacity(self.subdomains.len() + 1);
        hosts.push(self.name.clone());
        hosts.extend(self.subdomain_fqdns());
        hosts
    }
}

/// An entry excluded from the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub entity: String,
    pub reason: String,
}

impl ValidationIssue {
    fn new(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        let issue = Self {
            entity: entity.into(),
            reason: reason.into(),
        };
        warn!(entity = %issue.entity, reason = %issue.reason, "Excluding invalid entry");
        issue
    }

    pub fn into_failure(self) -> DomainFailure {
        DomainFailure::new(self.entity, Component::Model, self.reason)
    }
}

/// The validated application/domain registry
#[derive(Debug, Clone, Default)]
pub struct DomainModel {
    applications: BTreeMap<String, Application>,
    domains: Vec<Domain>,
    index: HashMap<String, usize>,
}

impl DomainModel {
    /// Build the model, excluding and reporting invalid entities
    pub fn load(entries: &[ApplicationEntry]) -> (Self, Vec<ValidationIssue>) {
        let mut model = DomainModel::default();
        let mut issues = Vec::new();
        let mut used_ports: HashMap<u16, String> = HashMap::new();

        for entry in entries {
            let app_name = entry.name.trim().to_string();

            if !APP_NAME_RE.is_match(&app_name) {
                issues.push(ValidationIssue::new(
                    format!("application '{}'", entry.name),
                    "name must match [a-z][a-z0-9_-]{0,31}",
                ));
                continue;
            }

            if model.applications.contains_key(&app_name) {
                issues.push(ValidationIssue::new(
                    format!("application '{}'", app_name),
                    "duplicate application name",
                ));
                continue;
            }

            let port = match validate_port(entry.port) {
                Ok(port) => port,
                Err(reason) => {
                    issues.push(ValidationIssue::new(format!("application '{}'", app_name), reason));
                    continue;
                }
            };

            if let Some(owner) = used_ports.get(&port) {
                issues.push(ValidationIssue::new(
                    format!("application '{}'", app_name),
                    format!("port {} already assigned to '{}'", port, owner),
                ));
                continue;
            }

            let mut app = Application {
                name: app_name.clone(),
                port,
                domains: Vec::new(),
            };

            for domain_entry in &entry.domains {
                let name = match normalize_domain(&domain_entry.name) {
                    Ok(name) => name,
                    Err(reason) => {
                        issues.push(ValidationIssue::new(domain_entry.name.clone(), reason));
                        continue;
                    }
                };

                if model.index.contains_key(&name) {
                    issues.push(ValidationIssue::new(name, "domain already registered"));
                    continue;
                }

                let mut subdomains = Vec::new();
                let mut seen = HashSet::new();
                for raw in &domain_entry.subdomains {
                    match normalize_subdomain(raw) {
                        Ok(label) if seen.insert(label.clone()) => subdomains.push(label),
                        Ok(label) => {
                            debug!(domain = %name, subdomain = %label, "Ignoring duplicate subdomain");
                        }
                        Err(reason) => {
                            issues.push(ValidationIssue::new(format!("{}.{}", raw, name), reason));
                        }
                    }
                }

                let fqdn_len_ok = subdomains
                    .iter()
                    .all(|s| s.len() + 1 + name.len() <= 253);
                if !fqdn_len_ok {
                    issues.push(ValidationIssue::new(name, "subdomain FQDN exceeds 253 characters"));
                    continue;
                }

                model.index.insert(name.clone(), model.domains.len());
                model.domains.push(Domain {
                    name: name.clone(),
                    application: app_name.clone(),
                    subdomains,
                });
                app.domains.push(name);
            }

            if app.domains.is_empty() {
                warn!(application = %app_name, "Application serves no valid domains");
            }

            used_ports.insert(port, app_name.clone());
            model.applications.insert(app_name, app);
        }

        (model, issues)
    }

    /// Domains in configuration order
    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    pub fn domain(&self, name: &str) -> Option<&Domain> {
        self.index.get(name).map(|&i| &self.domains[i])
    }

    pub fn applications(&self) -> impl Iterator<Item = &Application> {
        self.applications.values()
    }

    pub fn application(&self, name: &str) -> Option<&Application> {
        self.applications.get(name)
    }

    /// Deterministic port registry lookup, keyed by application name
    pub fn port_of(&self, application: &str) -> Option<u16> {
        self.applications.get(application).map(|a| a.port)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }
}

fn validate_port(port: u32) -> Result<u16, String> {
    if !(MIN_BACKEND_PORT..=u16::MAX as u32).contains(&port) {
        return Err(format!(
            "port {} outside {}-{}",
            port,
            MIN_BACKEND_PORT,
            u16::MAX
        ));
    }
    Ok(port as u16)
}

/// Normalize and validate an apex domain name
pub fn normalize_domain(raw: &str) -> Result<String, String> {
    let name = raw.trim().trim_end_matches('.').to_ascii_lowercase();

    if name.is_empty() {
        return Err("empty domain name".to_string());
    }
    if name.len() > 253 {
        return Err("domain name exceeds 253 characters".to_string());
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return Err("domain name needs at least two labels".to_string());
    }
    for label in &labels {
        if !LABEL_RE.is_match(label) {
            return Err(format!("invalid label '{}'", label));
        }
    }
    if labels
        .last()
        .map(|tld| tld.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(true)
    {
        return Err("top-level label must not be numeric".to_string());
    }

    Ok(name)
}

/// Normalize and validate a relative subdomain (one or more labels)
pub fn normalize_subdomain(raw: &str) -> Result<String, String> {
    let label = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if label.is_empty() || label == "@" {
        return Err("empty subdomain label".to_string());
    }
    for part in label.split('.') {
        if !LABEL_RE.is_match(part) {
            return Err(format!("invalid label '{}'", part));
        }
    }
    Ok(label)
}

//! Phase orchestration
//!
//! `infra` installs the packet filter, then signs and publishes every zone,
//! reloads the DNS server once and requests certificates for the domains whose
//! zone went live. `deploy` probes the backends and swaps in the proxy
//! routing. `cleanup` removes artifacts of domains that left the model and
//! `verify` audits everything without touching it.
//!
//! Per-domain work runs concurrently inside the phase's
//! [`ResilienceController`]; a failing domain never stops the others.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::acme::{
    AcmeAuthority, CertPlan, Certificate, CertificateAuthority, CertificateManager, ChallengeResponder,
    WebrootResponder,
};
use crate::config::Config;
use crate::dns::zone_synth::{ZonePlan, ZoneSynthesizer};
use crate::domain_model::{Domain, DomainModel};
use crate::error::{Component, DomainFailure, ProvisionError, Result};
use crate::firewall::{build_firewall_policy, FirewallSynthesizer};
use crate::install::InstallOutcome;
use crate::resilience::resource_monitor::SystemSampler;
use crate::resilience::{
    CheckpointStore, ResilienceController, ResourceLimits, ResourceMonitor, ResourceSampler,
};
use crate::retry::RetryPolicy;
use crate::routing::RoutingSynthesizer;
use crate::state_log::{PhaseLog, PhaseLogEntry, PhaseOutcome};
use crate::tools::{CommandRunner, SystemCommandRunner};

/// Source of the current time
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Infra,
    Deploy,
    Cleanup,
    Verify,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Infra => "infra",
            Phase::Deploy => "deploy",
            Phase::Cleanup => "cleanup",
            Phase::Verify => "verify",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Report planned actions without side effects
    pub dry_run: bool,
    /// Run even if the phase log says the phase is done
    pub force: bool,
}

/// Result of one phase
#[derive(Debug, Clone, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub dry_run: bool,
    /// Phase was already completed for this configuration
    pub up_to_date: bool,
    /// Why the phase could not start
    pub blocked: Option<String>,
    pub interrupted: bool,
    /// Changes made, or planned in a dry run
    pub actions: Vec<String>,
    pub succeeded: Vec<String>,
    pub failed: Vec<DomainFailure>,
    /// Held back by an open circuit breaker; picked up by a later run
    pub deferred: Vec<DomainFailure>,
    /// Not attempted (completed before a restart, or interrupted)
    pub skipped: Vec<String>,
    /// Configuration entries excluded from the model
    pub rejected: Vec<DomainFailure>,
}

impl PhaseReport {
    fn new(phase: Phase, dry_run: bool, rejected: Vec<DomainFailure>) -> Self {
        Self {
            phase,
            dry_run,
            up_to_date: false,
            blocked: None,
            interrupted: false,
            actions: Vec::new(),
            succeeded: Vec::new(),
            failed: Vec::new(),
            deferred: Vec::new(),
            skipped: Vec::new(),
            rejected,
        }
    }

    fn fail(&mut self, domain: impl Into<String>, component: Component, reason: impl ToString) {
        self.failed.push(DomainFailure::new(domain, component, reason));
    }

    /// An open breaker defers the work instead of failing it
    fn fail_or_defer(&mut self, domain: impl Into<String>, component: Component, error: ProvisionError) {
        if !matches!(error, ProvisionError::CircuitOpen { .. }) {
            return self.fail(domain, component, error);
        }
        let domain = domain.into();
        warn!(domain = %domain, component = %component, reason = %error, "Deferred by open circuit");
        self.deferred.push(DomainFailure {
            domain,
            component,
            reason: error.to_string(),
        });
    }

    pub fn outcome(&self) -> PhaseOutcome {
        if self.interrupted {
            PhaseOutcome::Interrupted
        } else if self.blocked.is_some() {
            PhaseOutcome::Blocked
        } else if self.failed.is_empty() && self.deferred.is_empty() {
            PhaseOutcome::Completed
        } else {
            PhaseOutcome::Partial
        }
    }

    /// 0 success, 1 any domain failed, deferred or blocked, 130 interrupted
    pub fn exit_code(&self) -> i32 {
        if self.interrupted {
            130
        } else if self.blocked.is_some()
            || !self.failed.is_empty()
            || !self.deferred.is_empty()
            || !self.rejected.is_empty()
        {
            1
        } else {
            0
        }
    }
}

/// Checks that a backend accepts connections
#[async_trait]
pub trait BackendProbe: Send + Sync {
    async fn probe(&self, addr: SocketAddr) -> Result<()>;
}

/// TCP connect with a timeout
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl BackendProbe for TcpProbe {
    async fn probe(&self, addr: SocketAddr) -> Result<()> {
        match tokio::time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(ProvisionError::tool("backend", format!("{} unreachable: {}", addr, e))),
            Err(_) => Err(ProvisionError::Timeout {
                operation: format!("connect {}", addr),
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

/// External collaborators, swappable for tests
#[derive(Clone)]
pub struct Services {
    pub runner: Arc<dyn CommandRunner>,
    pub authority: Arc<dyn CertificateAuthority>,
    pub responder: Arc<dyn ChallengeResponder>,
    pub sampler: Arc<dyn ResourceSampler>,
    pub probe: Arc<dyn BackendProbe>,
    pub clock: Clock,
}

impl Services {
    /// Real processes, ACME, sysinfo and TCP probes
    pub fn system(config: &Config) -> Self {
        Self {
            runner: Arc::new(SystemCommandRunner::new(Duration::from_secs(config.commands.timeout_secs))),
            authority: Arc::new(AcmeAuthority::new(
                config.acme.clone(),
                config.paths.acme_account_file(),
            )),
            responder: Arc::new(WebrootResponder::new(
                &config.paths.webroot,
                config.acme.probe_challenge_http,
            )),
            sampler: Arc::new(SystemSampler::new(&config.paths.state_dir)),
            probe: Arc::new(TcpProbe::new(Duration::from_secs(config.deploy.probe_timeout_secs))),
            clock: Arc::new(Utc::now),
        }
    }
}

pub struct Orchestrator {
    config: Config,
    model: DomainModel,
    rejected: Vec<DomainFailure>,
    services: Services,
    zones: ZoneSynthesizer,
    certs: CertificateManager,
    routing: RoutingSynthesizer,
    firewall: FirewallSynthesizer,
    phase_log: PhaseLog,
    checkpoints: CheckpointStore,
    fingerprint: String,
    interrupted: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(config: Config, services: Services) -> Result<Self> {
        config.validate()?;

        let (model, issues) = DomainModel::load(&config.applications);
        let rejected = issues.into_iter().map(|issue| issue.into_failure()).collect();
        info!(
            applications = model.applications().count(),
            domains = model.len(),
            "Domain model loaded"
        );

        Ok(Self {
            zones: ZoneSynthesizer::new(&config),
            certs: CertificateManager::new(&config, services.authority.clone(), services.responder.clone()),
            routing: RoutingSynthesizer::new(&config),
            firewall: FirewallSynthesizer::new(&config),
            phase_log: PhaseLog::new(config.paths.phase_log_file()),
            checkpoints: CheckpointStore::new(config.paths.checkpoint_file()),
            fingerprint: config.fingerprint(),
            interrupted: Arc::new(AtomicBool::new(false)),
            config,
            model,
            rejected,
            services,
        })
    }

    /// Override the retry policy for zone signing and certificate orders
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.zones = self.zones.with_retry_policy(retry.clone());
        self.certs = self.certs.with_retry_policy(retry);
        self
    }

    pub fn model(&self) -> &DomainModel {
        &self.model
    }

    /// Set to stop starting new domains; in-flight work finishes
    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        self.interrupted.clone()
    }

    fn now(&self) -> DateTime<Utc> {
        (self.services.clock)()
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub async fn run(&self, phase: Phase, options: RunOptions) -> Result<PhaseReport> {
        info!(
            phase = %phase,
            dry_run = options.dry_run,
            force = options.force,
            domains = self.model.len(),
            "Starting phase"
        );

        if !options.dry_run && !options.force && self.up_to_date(phase)? {
            info!(phase = %phase, "Phase already completed for this configuration (use --force to rerun)");
            let mut report = PhaseReport::new(phase, false, self.rejected.clone());
            report.up_to_date = true;
            return Ok(report);
        }

        let report = match phase {
            Phase::Infra => self.infra(options.dry_run).await?,
            Phase::Deploy => self.deploy(options.dry_run).await?,
            Phase::Cleanup => self.cleanup(options.dry_run).await?,
            Phase::Verify => self.verify().await?,
        };

        info!(
            phase = %phase,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            deferred = report.deferred.len(),
            skipped = report.skipped.len(),
            actions = report.actions.len(),
            "Phase finished"
        );
        Ok(report)
    }

    /// Whether the phase log shows this phase done with nothing new to do
    fn up_to_date(&self, phase: Phase) -> Result<bool> {
        if phase == Phase::Verify || !self.phase_log.is_completed(phase.as_str(), &self.fingerprint)? {
            return Ok(false);
        }

        match phase {
            // Signatures and certificates age even when the configuration does not
            Phase::Infra => {
                let now = self.now();
                for domain in self.model.domains() {
                    if !matches!(self.zones.plan_at(domain, now)?, ZonePlan::Keep { .. })
                        || !self.zones.zone_file(&domain.name).exists()
                        || self.zones.reload_pending(&domain.name)?
                    {
                        return Ok(false);
                    }
                    if !matches!(self.certs.plan(&domain.name, &domain.hosts(), now)?, CertPlan::Keep { .. }) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            // Routing must be redone after every infra run
            Phase::Deploy => {
                let deployed = self.phase_log.latest(Phase::Deploy.as_str())?;
                let provisioned = self.phase_log.latest(Phase::Infra.as_str())?;
                Ok(match (deployed, provisioned) {
                    (Some(d), Some(i)) => d.timestamp > i.timestamp,
                    (Some(_), None) => true,
                    _ => false,
                })
            }
            Phase::Cleanup => Ok(true),
            Phase::Verify => Ok(false),
        }
    }

    /// Controller for `phase`, resuming the breaker from the last checkpoint.
    /// Also returns the domains the checkpoint lists as completed.
    fn controller(&self, phase: Phase) -> Result<(ResilienceController, BTreeSet<String>)> {
        let checkpoint = self.checkpoints.load()?;
        let breaker_state = checkpoint
            .as_ref()
            .map(|c| c.breaker_state)
            .unwrap_or_default();
        let completed = checkpoint
            .filter(|c| c.resumes(phase.as_str(), &self.fingerprint))
            .map(|c| c.completed)
            .unwrap_or_default();

        if !completed.is_empty() {
            info!(phase = %phase, completed = completed.len(), "Resuming from checkpoint");
        }

        let monitor = ResourceMonitor::new(
            self.services.sampler.clone(),
            ResourceLimits::from(&self.config.resilience),
        );
        let controller = ResilienceController::new(
            phase.as_str(),
            &self.config.resilience,
            monitor,
            self.checkpoints.clone(),
            breaker_state,
        )?;
        Ok((controller, completed))
    }

    /// Admit the phase itself. A successful admission is the breaker's trial.
    fn gate(&self, ctl: &ResilienceController, report: &mut PhaseReport, completed: &BTreeSet<String>) -> Result<bool> {
        let now = self.now();
        match ctl.admit(now) {
            Ok(()) => {
                ctl.breaker().record_success();
                Ok(true)
            }
            Err(e) => {
                warn!(phase = %report.phase, error = %e, "Phase blocked");
                report.blocked = Some(e.to_string());
                ctl.checkpoint(&self.fingerprint, completed, self.pending(completed), now)?;
                Ok(false)
            }
        }
    }

    fn pending(&self, completed: &BTreeSet<String>) -> usize {
        self.model
            .domains()
            .iter()
            .filter(|d| !completed.contains(&d.name))
            .count()
    }

    /// Run one unit of domain work under the budget and the breaker.
    /// `None` means the unit was never started because of an interrupt.
    async fn run_unit<T, F, Fut>(
        &self,
        ctl: &ResilienceController,
        completed: &BTreeSet<String>,
        work: F,
    ) -> Option<Result<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let _permit = match ctl.budget().acquire().await {
            Ok(permit) => permit,
            Err(e) => return Some(Err(e)),
        };
        if self.is_interrupted() {
            return None;
        }

        let now = self.now();
        let was_open = ctl.breaker().state().is_open();
        if let Err(e) = ctl.admit(now) {
            if !was_open && ctl.breaker().state().is_open() {
                self.checkpoint_quietly(ctl, completed);
            }
            return Some(Err(e));
        }

        let result = work().await;
        if ctl.record(&result, self.now()) {
            self.checkpoint_quietly(ctl, completed);
        }
        Some(result)
    }

    fn checkpoint_quietly(&self, ctl: &ResilienceController, completed: &BTreeSet<String>) {
        if let Err(e) = ctl.checkpoint(&self.fingerprint, completed, self.pending(completed), self.now()) {
            warn!(error = %e, "Failed to write checkpoint");
        }
    }

    /// Write the checkpoint or clear it, then append to the phase log
    fn finish(&self, ctl: &ResilienceController, mut report: PhaseReport, completed: &BTreeSet<String>) -> Result<PhaseReport> {
        report.interrupted |= self.is_interrupted();
        let now = self.now();

        if report.outcome() == PhaseOutcome::Completed {
            self.checkpoints.clear()?;
        } else {
            ctl.checkpoint(&self.fingerprint, completed, self.pending(completed), now)?;
        }

        self.phase_log.append(&PhaseLogEntry {
            timestamp: now,
            phase: report.phase.as_str().to_string(),
            outcome: report.outcome(),
            fingerprint: self.fingerprint.clone(),
            succeeded: report.succeeded.len(),
            failed: report.failed.len(),
        })?;
        Ok(report)
    }

    async fn reload_dns(&self) -> Result<()> {
        self.services.runner.run(&self.config.commands.dns_reload).await?;
        info!("DNS server reloaded");
        Ok(())
    }

    async fn infra(&self, dry_run: bool) -> Result<PhaseReport> {
        let mut report = PhaseReport::new(Phase::Infra, dry_run, self.rejected.clone());
        if dry_run {
            self.plan_infra(&mut report);
            return Ok(report);
        }

        let (ctl, mut completed) = self.controller(Phase::Infra)?;
        if !self.gate(&ctl, &mut report, &completed)? {
            return self.finish(&ctl, report, &completed);
        }

        // Packet filter first; it does not depend on any domain
        let policy = build_firewall_policy(&self.config);
        let firewall = self
            .run_unit(&ctl, &completed, || self.firewall.install(self.services.runner.as_ref(), &policy))
            .await;
        match firewall {
            Some(Ok(InstallOutcome::Installed)) => report.actions.push("firewall: policy loaded".to_string()),
            Some(Ok(InstallOutcome::Unchanged)) => {}
            Some(Err(e)) => report.fail_or_defer("firewall", Component::Firewall, e),
            None => report.skipped.push("firewall".to_string()),
        }

        let pending: Vec<&Domain> = self
            .model
            .domains()
            .iter()
            .filter(|d| {
                let done = completed.contains(&d.name);
                if done {
                    report.skipped.push(d.name.clone());
                }
                !done
            })
            .collect();

        // Zones: sign and publish concurrently, then reload once
        let zone_results = {
            let completed = &completed;
            join_all(pending.iter().map(|domain| {
                self.run_unit(&ctl, completed, move || self.zones.build_zone_at(domain, self.now()))
            }))
            .await
        };

        let mut live: Vec<&Domain> = Vec::new();
        let mut published: Vec<&Domain> = Vec::new();
        for (domain, result) in pending.iter().copied().zip(zone_results) {
            match result {
                Some(Ok(build)) => {
                    if build.published {
                        report
                            .actions
                            .push(format!("{}: zone published (serial {})", domain.name, build.zone.serial));
                        published.push(domain);
                    }
                    live.push(domain);
                }
                Some(Err(e)) => report.fail_or_defer(&domain.name, Component::Zone, e),
                None => report.skipped.push(domain.name.clone()),
            }
        }

        if !published.is_empty() {
            match self.reload_dns().await {
                Ok(()) => {
                    report.actions.push("dns: server reloaded".to_string());
                    for domain in &published {
                        if let Err(e) = self.zones.mark_reloaded(&domain.name) {
                            warn!(domain = %domain.name, error = %e, "Failed to record zone reload");
                        }
                    }
                }
                Err(e) => {
                    if ctl.record_failure(&e, self.now()) {
                        self.checkpoint_quietly(&ctl, &completed);
                    }
                    let names: HashSet<&str> = published.iter().map(|d| d.name.as_str()).collect();
                    for domain in &published {
                        report.fail(&domain.name, Component::Zone, format!("DNS reload failed: {}", e));
                    }
                    live.retain(|d| !names.contains(d.name.as_str()));
                }
            }
        }
        ctl.checkpoint(&self.fingerprint, &completed, self.pending(&completed), self.now())?;

        if self.is_interrupted() {
            report.skipped.extend(live.iter().map(|d| d.name.clone()));
            return self.finish(&ctl, report, &completed);
        }

        // Certificates only for domains whose zone is live
        let cert_results = {
            let completed = &completed;
            join_all(live.iter().map(|domain| {
                let hosts = domain.hosts();
                self.run_unit(&ctl, completed, move || async move {
                    let now = self.now();
                    let changed = !matches!(self.certs.plan(&domain.name, &hosts, now)?, CertPlan::Keep { .. });
                    let cert = self.certs.issue_or_renew_at(&domain.name, &hosts, now).await?;
                    Ok::<_, ProvisionError>((cert, changed))
                })
            }))
            .await
        };

        for (domain, result) in live.iter().copied().zip(cert_results) {
            match result {
                Some(Ok((cert, changed))) => {
                    if changed {
                        report.actions.push(format!(
                            "{}: certificate issued for {} names",
                            domain.name,
                            cert.alt_names.len()
                        ));
                    }
                    completed.insert(domain.name.clone());
                    report.succeeded.push(domain.name.clone());
                }
                Some(Err(e)) => report.fail_or_defer(&domain.name, Component::Certificate, e),
                None => report.skipped.push(domain.name.clone()),
            }
        }

        self.finish(&ctl, report, &completed)
    }

    fn plan_infra(&self, report: &mut PhaseReport) {
        let now = self.now();

        if !self.firewall.audit(&build_firewall_policy(&self.config)).is_empty() {
            report.actions.push("firewall: install packet filter policy".to_string());
        }

        let mut reload = false;
        for domain in self.model.domains() {
            match self.zones.plan_at(domain, now) {
                Ok(ZonePlan::Sign { reason }) => {
                    reload = true;
                    report.actions.push(format!("{}: sign zone ({})", domain.name, reason));
                }
                Ok(ZonePlan::Keep { .. }) if !self.zones.zone_file(&domain.name).exists() => {
                    reload = true;
                    report.actions.push(format!("{}: republish zone file", domain.name));
                }
                Ok(ZonePlan::Keep { .. }) if self.zones.reload_pending(&domain.name).unwrap_or(false) => {
                    reload = true;
                    report.actions.push(format!("{}: zone awaits DNS reload", domain.name));
                }
                Ok(ZonePlan::Keep { .. }) => {}
                Err(e) => {
                    report.fail(&domain.name, Component::Zone, e);
                    continue;
                }
            }

            match self.certs.plan(&domain.name, &domain.hosts(), now) {
                Ok(CertPlan::Issue) => report.actions.push(format!(
                    "{}: issue certificate for {}",
                    domain.name,
                    domain.hosts().join(", ")
                )),
                Ok(CertPlan::Renew { reason }) => {
                    report
                        .actions
                        .push(format!("{}: renew certificate ({})", domain.name, reason))
                }
                Ok(CertPlan::Keep { .. }) => {}
                Err(e) => report.fail(&domain.name, Component::Certificate, e),
            }
            report.succeeded.push(domain.name.clone());
        }

        if reload {
            report.actions.push("dns: reload server".to_string());
        }
    }

    fn load_certificates(&self, report: &mut PhaseReport, now: DateTime<Utc>) -> HashMap<String, Certificate> {
        let mut certificates = HashMap::new();
        for domain in self.model.domains() {
            match self.certs.load_at(&domain.name, now) {
                Ok(Some(cert)) => {
                    certificates.insert(domain.name.clone(), cert);
                }
                Ok(None) => {}
                Err(e) => report.fail(&domain.name, Component::Certificate, e),
            }
        }
        certificates
    }

    async fn deploy(&self, dry_run: bool) -> Result<PhaseReport> {
        let mut report = PhaseReport::new(Phase::Deploy, dry_run, self.rejected.clone());
        let now = self.now();
        let certificates = self.load_certificates(&mut report, now);

        if dry_run {
            match self.routing.build_routing_table_at(
                self.model.applications(),
                self.model.domains(),
                &certificates,
                now,
            ) {
                Ok(table) => {
                    for excluded in &table.excluded {
                        report
                            .actions
                            .push(format!("{}: not routed ({})", excluded.host, excluded.reason));
                    }
                    if !self.routing.audit(&table).is_empty() {
                        report
                            .actions
                            .push(format!("proxy: install routing for {} hosts", table.routes.len()));
                    }
                }
                Err(e) => report.fail("proxy", Component::Routing, e),
            }
            return Ok(report);
        }

        let (ctl, _) = self.controller(Phase::Deploy)?;
        let mut completed = BTreeSet::new();
        if !self.gate(&ctl, &mut report, &completed)? {
            return self.finish(&ctl, report, &completed);
        }

        // Backend health, one probe per application
        let backend_host = self.config.network.backend_host;
        let probes = join_all(self.model.applications().map(|app| async move {
            let addr = SocketAddr::from((backend_host, app.port));
            (app, addr, self.services.probe.probe(addr).await)
        }))
        .await;

        let mut unhealthy: HashSet<&str> = HashSet::new();
        for (app, addr, result) in probes {
            match result {
                Ok(()) => debug!(application = %app.name, %addr, "Backend reachable"),
                Err(e) if self.config.deploy.require_backends => {
                    for domain in &app.domains {
                        unhealthy.insert(domain.as_str());
                        report.fail(domain, Component::Backend, &e);
                    }
                }
                Err(e) => warn!(application = %app.name, %addr, error = %e, "Backend not reachable; routing it anyway"),
            }
        }

        let domains: Vec<Domain> = self
            .model
            .domains()
            .iter()
            .filter(|d| !unhealthy.contains(d.name.as_str()))
            .cloned()
            .collect();

        let table = match self.routing.build_routing_table_at(
            self.model.applications(),
            &domains,
            &certificates,
            self.now(),
        ) {
            Ok(table) => table,
            Err(e) => {
                report.fail("proxy", Component::Routing, e);
                return self.finish(&ctl, report, &completed);
            }
        };

        let mut not_routed: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for excluded in &table.excluded {
            not_routed
                .entry(excluded.domain.as_str())
                .or_default()
                .push(format!("{} ({})", excluded.host, excluded.reason));
        }
        for (domain, hosts) in &not_routed {
            report.fail(*domain, Component::Routing, format!("not routed: {}", hosts.join(", ")));
        }

        // One swap for the whole phase
        let install = self
            .run_unit(&ctl, &completed, || self.routing.install(self.services.runner.as_ref(), &table))
            .await;
        match install {
            Some(Ok(outcome)) => {
                if outcome == InstallOutcome::Installed {
                    report
                        .actions
                        .push(format!("proxy: routing installed for {} hosts", table.routes.len()));
                }
                let routed: BTreeSet<String> = table.routes.iter().map(|r| r.domain.clone()).collect();
                for domain in routed {
                    if !not_routed.contains_key(domain.as_str()) {
                        report.succeeded.push(domain.clone());
                        completed.insert(domain);
                    }
                }
            }
            Some(Err(e)) => report.fail_or_defer("proxy", Component::Routing, e),
            None => report.skipped.push("proxy".to_string()),
        }

        self.finish(&ctl, report, &completed)
    }

    /// Domains with artifacts on disk that are no longer in the model
    fn stale_domains(&self) -> Result<BTreeSet<String>> {
        let mut managed: BTreeSet<String> = self.zones.managed_domains()?.into_iter().collect();
        managed.extend(self.certs.managed_domains()?);
        managed.retain(|d| self.model.domain(d).is_none());
        Ok(managed)
    }

    async fn cleanup(&self, dry_run: bool) -> Result<PhaseReport> {
        let mut report = PhaseReport::new(Phase::Cleanup, dry_run, self.rejected.clone());
        let stale = self.stale_domains()?;
        let tokens = self.services.responder.leftover_tokens()?;

        if dry_run {
            for domain in &stale {
                report.actions.push(format!("{}: remove zone, keys and certificate", domain));
            }
            if !tokens.is_empty() {
                report
                    .actions
                    .push(format!("acme: remove {} leftover challenge tokens", tokens.len()));
            }
            if self.checkpoints.path().exists() {
                report.actions.push("state: remove checkpoint".to_string());
            }
            return Ok(report);
        }

        let (ctl, _) = self.controller(Phase::Cleanup)?;
        let mut completed = BTreeSet::new();
        if !self.gate(&ctl, &mut report, &completed)? {
            return self.finish(&ctl, report, &completed);
        }

        let mut zone_removed = false;
        for domain in &stale {
            if self.is_interrupted() {
                report.skipped.push(domain.clone());
                continue;
            }
            let removed = self.zones.remove_zone(domain).and_then(|zone| {
                let cert = self.certs.remove(domain)?;
                Ok((zone, cert))
            });
            match removed {
                Ok((zone, _)) => {
                    zone_removed |= zone;
                    report.actions.push(format!("{}: artifacts removed", domain));
                    report.succeeded.push(domain.clone());
                    completed.insert(domain.clone());
                }
                Err(e) => report.fail(domain, Component::Cleanup, e),
            }
        }

        if zone_removed {
            match self.reload_dns().await {
                Ok(()) => report.actions.push("dns: server reloaded".to_string()),
                Err(e) => report.fail("dns", Component::Cleanup, e),
            }
        }

        for token in &tokens {
            match self.services.responder.withdraw(token).await {
                Ok(()) => debug!(token = %token, "Removed leftover challenge token"),
                Err(e) => report.fail("acme", Component::Cleanup, e),
            }
        }
        if !tokens.is_empty() {
            report
                .actions
                .push(format!("acme: removed {} leftover challenge tokens", tokens.len()));
        }

        // A clean finish removes the checkpoint
        self.finish(&ctl, report, &completed)
    }

    /// Read-only audit of zones, certificates, routing and the packet filter
    async fn verify(&self) -> Result<PhaseReport> {
        let mut report = PhaseReport::new(Phase::Verify, false, self.rejected.clone());
        let now = self.now();
        let renew_before = chrono::Duration::days(self.config.acme.renew_before_days as i64);

        for domain in self.model.domains() {
            let mut problems = Vec::new();

            match self.zones.audit(domain, now) {
                Ok(found) => problems.extend(found.into_iter().map(|p| (Component::Zone, p))),
                Err(e) => problems.push((Component::Zone, e.to_string())),
            }

            match self.certs.load_at(&domain.name, now) {
                Ok(Some(cert)) => {
                    if !cert.is_usable(now) {
                        problems.push((Component::Certificate, format!("certificate {}", cert.status)));
                    } else if !cert.covers(&domain.hosts()) {
                        problems.push((Component::Certificate, "certificate SANs differ from model".to_string()));
                    } else if cert.expires_at.map_or(false, |exp| exp - renew_before <= now) {
                        warn!(domain = %domain.name, expires_at = ?cert.expires_at, "Certificate due for renewal");
                    }
                }
                Ok(None) => problems.push((Component::Certificate, "no certificate".to_string())),
                Err(e) => problems.push((Component::Certificate, e.to_string())),
            }

            if problems.is_empty() {
                report.succeeded.push(domain.name.clone());
            } else {
                for (component, problem) in problems {
                    report.fail(&domain.name, component, problem);
                }
            }
        }

        let certificates = self.load_certificates(&mut report, now);
        match self.routing.build_routing_table_at(
            self.model.applications(),
            self.model.domains(),
            &certificates,
            now,
        ) {
            Ok(table) => {
                for problem in self.routing.audit(&table) {
                    report.fail("proxy", Component::Routing, problem);
                }
            }
            Err(e) => report.fail("proxy", Component::Routing, e),
        }

        for problem in self.firewall.audit(&build_firewall_policy(&self.config)) {
            report.fail("firewall", Component::Firewall, problem);
        }

        Ok(report)
    }
}

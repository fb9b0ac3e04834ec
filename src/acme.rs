//! ACME/Let's Encrypt Certificate Automation
//!
//! One certificate per domain covering the apex and every subdomain, issued
//! through HTTP-01 challenges (RFC 8555) answered from a webroot the proxy
//! serves.
//!
//! ## Layout
//! - `<cert_dir>/<domain>.crt` - certificate chain
//! - `<cert_dir>/<domain>.key` - private key (0600)
//! - `<cert_dir>/<domain>.pem` - chain + key bundle for the proxy (0600)
//! - `<cert_dir>/<domain>.json` - metadata (SANs, status, expiry)
//!
//! ## Security Notes
//! - Private keys and account credentials are stored with 0600 permissions
//! - Account keys are separate from certificate keys

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{AcmeSettings, Config};
use crate::dns::zone_synth::list_stems;
use crate::error::{ProvisionError, Result};
use crate::install::write_atomic;
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Let's Encrypt production ACME directory URL
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging ACME directory URL (for testing)
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Path prefix the CA fetches HTTP-01 tokens from
pub const CHALLENGE_PATH: &str = "/.well-known/acme-challenge/";

/// Lifetime assumed for issued certificates (Let's Encrypt issues 90-day certs)
const CERT_LIFETIME_DAYS: i64 = 90;

/// Delay between order status checks
const ORDER_POLL_DELAY: Duration = Duration::from_secs(5);

/// Maximum order status checks per attempt
const MAX_ORDER_POLLS: usize = 10;

/// PEM material returned by an authority
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// PEM-encoded certificate chain
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

/// Serves HTTP-01 tokens to the certificate authority
#[async_trait]
pub trait ChallengeResponder: Send + Sync {
    async fn publish(&self, token: &str, key_authorization: &str) -> Result<()>;
    async fn withdraw(&self, token: &str) -> Result<()>;
    /// Whether the CA could fetch tokens for `domain` right now
    async fn is_reachable(&self, domain: &str) -> bool;

    /// Tokens still published, e.g. after an interrupted order
    fn leftover_tokens(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Certificate authority protocol seam
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    fn directory_url(&self) -> &str;

    /// Run one complete order for `alt_names` (first name is primary)
    async fn order(
        &self,
        alt_names: &[String],
        responder: &dyn ChallengeResponder,
    ) -> Result<IssuedCertificate>;
}

/// Writes tokens under `<webroot>/.well-known/acme-challenge/`
pub struct WebrootResponder {
    webroot: PathBuf,
    probe_http: bool,
    client: reqwest::Client,
}

impl WebrootResponder {
    pub fn new(webroot: impl Into<PathBuf>, probe_http: bool) -> Self {
        Self {
            webroot: webroot.into(),
            probe_http,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .no_proxy()
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn challenge_dir(&self) -> PathBuf {
        self.webroot.join(CHALLENGE_PATH.trim_matches('/'))
    }

    /// Publish a throwaway token and fetch it back the way the CA would
    async fn fetch_own_token(&self, domain: &str) -> Result<bool> {
        let token = format!("reachability-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        self.publish(&token, &token).await?;

        let url = format!("http://{}{}{}", domain, CHALLENGE_PATH, token);
        let result = self.client.get(&url).send().await;
        self.withdraw(&token).await?;

        match result {
            Ok(response) if response.status().is_success() => {
                let body = response.text().await.unwrap_or_default();
                Ok(body.trim() == token)
            }
            Ok(response) => {
                debug!(domain, status = %response.status(), "Challenge path fetch rejected");
                Ok(false)
            }
            Err(e) => {
                debug!(domain, error = %e, "Challenge path fetch failed");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl ChallengeResponder for WebrootResponder {
    async fn publish(&self, token: &str, key_authorization: &str) -> Result<()> {
        let dir = self.challenge_dir();
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(token), key_authorization).await?;
        debug!(token, "Published challenge token");
        Ok(())
    }

    async fn withdraw(&self, token: &str) -> Result<()> {
        match tokio::fs::remove_file(self.challenge_dir().join(token)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn is_reachable(&self, domain: &str) -> bool {
        if tokio::fs::create_dir_all(self.challenge_dir()).await.is_err() {
            return false;
        }
        if !self.probe_http {
            return true;
        }
        self.fetch_own_token(domain).await.unwrap_or(false)
    }

    fn leftover_tokens(&self) -> Result<Vec<String>> {
        list_stems(&self.challenge_dir(), "")
    }
}

/// Production authority backed by `instant-acme`
pub struct AcmeAuthority {
    settings: AcmeSettings,
    directory_url: String,
    account_file: PathBuf,
    account: OnceCell<Account>,
}

impl AcmeAuthority {
    pub fn new(settings: AcmeSettings, account_file: PathBuf) -> Self {
        let directory_url = settings.directory_url.clone().unwrap_or_else(|| {
            if settings.staging {
                LETS_ENCRYPT_STAGING.to_string()
            } else {
                LETS_ENCRYPT_PRODUCTION.to_string()
            }
        });

        Self {
            settings,
            directory_url,
            account_file,
            account: OnceCell::new(),
        }
    }

    async fn account(&self) -> Result<&Account> {
        self.account
            .get_or_try_init(|| self.load_or_create_account())
            .await
    }

    async fn load_or_create_account(&self) -> Result<Account> {
        if self.account_file.exists() {
            info!("Loading existing ACME account from {:?}", self.account_file);
            let account_json = tokio::fs::read_to_string(&self.account_file).await?;
            let credentials: AccountCredentials = serde_json::from_str(&account_json)?;
            return Account::builder()
                .map_err(acme_error("account builder"))?
                .from_credentials(credentials)
                .await
                .map_err(acme_error("restore account"));
        }

        if self.settings.email.is_empty() {
            return Err(ProvisionError::validation("acme.email", "required to create an ACME account"));
        }
        if !self.settings.agree_tos {
            return Err(ProvisionError::validation(
                "acme.agree_tos",
                "terms of service must be accepted to create an ACME account",
            ));
        }

        info!("Creating new ACME account for {}", self.settings.email);
        let contact = format!("mailto:{}", self.settings.email);
        let (account, credentials) = Account::builder()
            .map_err(acme_error("account builder"))?
            .create(
                &NewAccount {
                    contact: &[&contact],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                self.directory_url.clone(),
                None,
            )
            .await
            .map_err(acme_error("create account"))?;

        let account_json = serde_json::to_string_pretty(&credentials)?;
        write_atomic(&self.account_file, account_json.as_bytes(), Some(0o600))?;
        info!("ACME account created and saved to {:?}", self.account_file);

        Ok(account)
    }
}

fn acme_error<E: std::fmt::Display>(step: &'static str) -> impl Fn(E) -> ProvisionError {
    move |e| ProvisionError::tool("acme", format!("{}: {}", step, e))
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    fn directory_url(&self) -> &str {
        &self.directory_url
    }

    async fn order(
        &self,
        alt_names: &[String],
        responder: &dyn ChallengeResponder,
    ) -> Result<IssuedCertificate> {
        let account = self.account().await?;

        let identifiers: Vec<Identifier> = alt_names
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();

        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(acme_error("create order"))?;

        let mut published = Vec::new();
        let outcome = async {
            let mut authorizations = order.authorizations();
            while let Some(auth_result) = authorizations.next().await {
                let mut auth = auth_result.map_err(acme_error("authorization"))?;
                let domain = auth.identifier().to_string();

                match auth.status {
                    AuthorizationStatus::Valid => {
                        debug!("Authorization already valid for {}", domain);
                        continue;
                    }
                    AuthorizationStatus::Pending => {
                        let mut challenge = auth.challenge(ChallengeType::Http01).ok_or_else(|| {
                            ProvisionError::tool("acme", format!("no HTTP-01 challenge for {}", domain))
                        })?;

                        let key_auth = challenge.key_authorization();
                        let token = challenge.token.clone();
                        responder.publish(&token, key_auth.as_str()).await?;
                        published.push(token);

                        challenge
                            .set_ready()
                            .await
                            .map_err(acme_error("set challenge ready"))?;
                        info!("Challenge set ready for {}, waiting for validation...", domain);
                    }
                    status => {
                        return Err(ProvisionError::tool(
                            "acme",
                            format!("unexpected authorization status for {}: {:?}", domain, status),
                        ));
                    }
                }
            }

            let mut polls = 0;
            loop {
                tokio::time::sleep(ORDER_POLL_DELAY).await;
                let state = order.refresh().await.map_err(acme_error("refresh order"))?;

                match state.status {
                    OrderStatus::Ready | OrderStatus::Valid => break,
                    OrderStatus::Invalid => {
                        return Err(ProvisionError::tool("acme", "order became invalid"));
                    }
                    OrderStatus::Pending | OrderStatus::Processing => {
                        polls += 1;
                        if polls >= MAX_ORDER_POLLS {
                            return Err(ProvisionError::tool(
                                "acme",
                                format!("order not ready after {} checks", polls),
                            ));
                        }
                        debug!("Order not ready yet (check {})", polls);
                    }
                }
            }

            let key_pem = order.finalize().await.map_err(acme_error("finalize order"))?;

            for _ in 0..MAX_ORDER_POLLS {
                match order.certificate().await {
                    Ok(Some(cert_pem)) => return Ok(IssuedCertificate { cert_pem, key_pem }),
                    Ok(None) => debug!("Certificate not ready yet, waiting..."),
                    Err(e) => warn!("Error fetching certificate: {}", e),
                }
                tokio::time::sleep(ORDER_POLL_DELAY).await;
            }

            Err(ProvisionError::tool("acme", "certificate was not issued in time"))
        }
        .await;

        for token in &published {
            if let Err(e) = responder.withdraw(token).await {
                warn!(token = %token, error = %e, "Failed to withdraw challenge token");
            }
        }

        outcome
    }
}

/// Certificate lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertStatus {
    Pending,
    Valid,
    Expired,
    Failed,
}

impl std::fmt::Display for CertStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            CertStatus::Pending => "pending",
            CertStatus::Valid => "valid",
            CertStatus::Expired => "expired",
            CertStatus::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// Certificate metadata persisted next to the PEM files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    pub domain: String,
    /// Apex first, then subdomains
    pub alt_names: Vec<String>,
    /// ACME directory URL of the issuer
    pub authority: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Chain and key in one file, as the proxy loads it
    pub bundle_path: PathBuf,
    pub issued_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub status: CertStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl Certificate {
    /// Valid status and not yet expired at `now`
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.status == CertStatus::Valid && self.expires_at.map_or(false, |exp| exp > now)
    }

    pub fn covers(&self, alt_names: &[String]) -> bool {
        san_set(&self.alt_names) == san_set(alt_names)
    }
}

fn san_set(names: &[String]) -> BTreeSet<String> {
    names.iter().map(|n| n.to_lowercase()).collect()
}

/// Why a certificate will be (re)issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewReason {
    Expiring,
    Expired,
    SansChanged,
    PreviousFailure,
    FilesMissing,
}

impl std::fmt::Display for RenewReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RenewReason::Expiring => "expiring soon",
            RenewReason::Expired => "expired",
            RenewReason::SansChanged => "SAN list changed",
            RenewReason::PreviousFailure => "previous attempt failed",
            RenewReason::FilesMissing => "certificate files missing",
        };
        f.write_str(text)
    }
}

/// What `issue_or_renew` would do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertPlan {
    Issue,
    Renew { reason: RenewReason },
    Keep { expires_at: DateTime<Utc> },
}

/// Issues, renews and tracks per-domain certificates
pub struct CertificateManager {
    authority: Arc<dyn CertificateAuthority>,
    responder: Arc<dyn ChallengeResponder>,
    cert_dir: PathBuf,
    renew_before: chrono::Duration,
    retry: RetryPolicy,
}

impl CertificateManager {
    pub fn new(
        config: &Config,
        authority: Arc<dyn CertificateAuthority>,
        responder: Arc<dyn ChallengeResponder>,
    ) -> Self {
        Self {
            authority,
            responder,
            cert_dir: config.paths.cert_dir.clone(),
            renew_before: chrono::Duration::days(config.acme.renew_before_days as i64),
            retry: RetryPolicy::from(&config.acme),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn responder(&self) -> &Arc<dyn ChallengeResponder> {
        &self.responder
    }

    fn file(&self, domain: &str, ext: &str) -> PathBuf {
        self.cert_dir.join(format!("{}.{}", domain, ext))
    }

    /// Read persisted metadata; a valid certificate past its expiry reads as expired
    pub fn load(&self, domain: &str) -> Result<Option<Certificate>> {
        self.load_at(domain, Utc::now())
    }

    pub fn load_at(&self, domain: &str, now: DateTime<Utc>) -> Result<Option<Certificate>> {
        let path = self.file(domain, "json");
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        let mut cert: Certificate = serde_json::from_str(&json)?;
        if cert.status == CertStatus::Valid && cert.expires_at.map_or(true, |exp| exp <= now) {
            cert.status = CertStatus::Expired;
        }
        Ok(Some(cert))
    }

    fn save(&self, cert: &Certificate) -> Result<()> {
        let json = serde_json::to_string_pretty(cert)?;
        write_atomic(&self.file(&cert.domain, "json"), json.as_bytes(), Some(0o644))?;
        Ok(())
    }

    /// Decide what `issue_or_renew` would do, without side effects
    pub fn plan(&self, domain: &str, alt_names: &[String], now: DateTime<Utc>) -> Result<CertPlan> {
        let Some(cert) = self.load_at(domain, now)? else {
            return Ok(CertPlan::Issue);
        };

        let reason = match cert.status {
            CertStatus::Pending => return Ok(CertPlan::Issue),
            CertStatus::Failed if cert.issued_at.is_none() => return Ok(CertPlan::Issue),
            CertStatus::Failed => Some(RenewReason::PreviousFailure),
            CertStatus::Expired => Some(RenewReason::Expired),
            CertStatus::Valid => None,
        };

        let reason = reason.or_else(|| {
            if !cert.covers(alt_names) {
                Some(RenewReason::SansChanged)
            } else if !cert.cert_path.exists() || !cert.key_path.exists() || !cert.bundle_path.exists() {
                Some(RenewReason::FilesMissing)
            } else {
                None
            }
        });

        if let Some(reason) = reason {
            return Ok(CertPlan::Renew { reason });
        }

        match cert.expires_at {
            Some(expires_at) if expires_at - self.renew_before > now => Ok(CertPlan::Keep { expires_at }),
            _ => Ok(CertPlan::Renew {
                reason: RenewReason::Expiring,
            }),
        }
    }

    /// Issue or renew the certificate for `domain` covering `alt_names`
    pub async fn issue_or_renew(&self, domain: &str, alt_names: &[String]) -> Result<Certificate> {
        self.issue_or_renew_at(domain, alt_names, Utc::now()).await
    }

    pub async fn issue_or_renew_at(
        &self,
        domain: &str,
        alt_names: &[String],
        now: DateTime<Utc>,
    ) -> Result<Certificate> {
        let plan = self.plan(domain, alt_names, now)?;
        let existing = self.load_at(domain, now)?;

        match plan {
            CertPlan::Keep { expires_at } => {
                debug!(domain, expires_at = %expires_at, "Certificate still valid");
                if let Some(cert) = existing {
                    return Ok(cert);
                }
            }
            CertPlan::Issue => info!(domain, "Issuing certificate"),
            CertPlan::Renew { reason } => info!(domain, reason = %reason, "Renewing certificate"),
        }

        if !self.responder.is_reachable(domain).await {
            return Err(ProvisionError::tool(
                "acme",
                format!("challenge responder for {} is not reachable", domain),
            ));
        }

        let authority = self.authority.as_ref();
        let responder = self.responder.as_ref();
        let operation = format!("certificate {}", domain);
        let result = retry_with_backoff(&self.retry, &operation, move |attempt| async move {
            debug!(domain, attempt, "Requesting certificate");
            authority.order(alt_names, responder).await
        })
        .await;

        match result {
            Ok(issued) => {
                let cert = self.store_issued(domain, alt_names, &issued, now)?;
                info!(
                    domain,
                    sans = alt_names.len(),
                    expires_at = ?cert.expires_at,
                    "Certificate issued"
                );
                Ok(cert)
            }
            Err(e) => {
                self.record_failure(domain, alt_names, existing, &e, now)?;
                Err(e)
            }
        }
    }

    fn store_issued(
        &self,
        domain: &str,
        alt_names: &[String],
        issued: &IssuedCertificate,
        now: DateTime<Utc>,
    ) -> Result<Certificate> {
        let cert_path = self.file(domain, "crt");
        let key_path = self.file(domain, "key");
        let bundle_path = self.file(domain, "pem");

        let mut bundle = issued.cert_pem.clone();
        if !bundle.ends_with('\n') {
            bundle.push('\n');
        }
        bundle.push_str(&issued.key_pem);

        write_atomic(&cert_path, issued.cert_pem.as_bytes(), Some(0o644))?;
        write_atomic(&key_path, issued.key_pem.as_bytes(), Some(0o600))?;
        write_atomic(&bundle_path, bundle.as_bytes(), Some(0o600))?;

        let cert = Certificate {
            domain: domain.to_string(),
            alt_names: alt_names.to_vec(),
            authority: self.authority.directory_url().to_string(),
            cert_path,
            key_path,
            bundle_path,
            issued_at: Some(now),
            expires_at: Some(now + chrono::Duration::days(CERT_LIFETIME_DAYS)),
            status: CertStatus::Valid,
            failure_reason: None,
        };
        self.save(&cert)?;
        Ok(cert)
    }

    /// A failed renewal keeps an unexpired certificate in service
    fn record_failure(
        &self,
        domain: &str,
        alt_names: &[String],
        existing: Option<Certificate>,
        error: &ProvisionError,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let cert = match existing {
            Some(mut cert) if cert.is_usable(now) => {
                cert.failure_reason = Some(error.to_string());
                cert
            }
            Some(mut cert) => {
                cert.status = CertStatus::Failed;
                cert.failure_reason = Some(error.to_string());
                cert
            }
            None => Certificate {
                domain: domain.to_string(),
                alt_names: alt_names.to_vec(),
                authority: self.authority.directory_url().to_string(),
                cert_path: self.file(domain, "crt"),
                key_path: self.file(domain, "key"),
                bundle_path: self.file(domain, "pem"),
                issued_at: None,
                expires_at: None,
                status: CertStatus::Failed,
                failure_reason: Some(error.to_string()),
            },
        };

        warn!(domain, status = %cert.status, reason = %error, "Certificate request failed");
        self.save(&cert)
    }

    /// Domains with persisted certificate metadata
    pub fn managed_domains(&self) -> Result<Vec<String>> {
        list_stems(&self.cert_dir, ".json")
    }

    /// Delete metadata and PEM files. Returns whether anything existed.
    pub fn remove(&self, domain: &str) -> Result<bool> {
        let mut removed = false;
        for ext in ["json", "crt", "key", "pem"] {
            let path = self.file(domain, ext);
            if path.exists() {
                fs::remove_file(&path)?;
                removed = true;
            }
        }
        if removed {
            info!(domain, "Certificate artifacts removed");
        }
        Ok(removed)
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }
}

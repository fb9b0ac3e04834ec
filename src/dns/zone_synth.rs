//! Zone synthesis
//!
//! Turns a model domain into a signed zone file. The unsigned record set is
//! digested (serial excluded) and compared with the persisted state so an
//! unchanged domain is neither re-keyed nor re-signed.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{Config, DnssecSettings, NetworkConfig};
use crate::dns::dns_types::{DnsRecord, DnsRecordValue};
use crate::dns::dnssec::{verify_zone, DnssecConfig, DnssecSigner, SignedZone};
use crate::dns::dnssec_keys::{DnssecKeyStore, ZoneKeys};
use crate::domain_model::Domain;
use crate::error::{ProvisionError, Result};
use crate::install::write_atomic;
use crate::retry::{retry_with_backoff, RetryPolicy};

const SOA_TTL: u32 = 3600;
const NS_TTL: u32 = 3600;
const SOA_REFRESH: u32 = 3600;
const SOA_RETRY: u32 = 600;
const SOA_EXPIRE: u32 = 604800;
const SOA_MINIMUM: u32 = 300;
const MX_PREFERENCE: u16 = 10;

/// Persisted per-zone state (`<state_dir>/zones/<domain>.json`)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneState {
    /// Digest of the unsigned record set with the serial zeroed
    pub records_digest: String,
    pub zone: SignedZone,
    /// Published but not yet loaded by the DNS server
    #[serde(default)]
    pub reload_pending: bool,
}

/// Why a zone needs (re-)signing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignReason {
    New,
    RecordsChanged,
    SignaturesExpiring,
    KeysMissing,
    AlgorithmChanged,
}

impl std::fmt::Display for SignReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            SignReason::New => "new zone",
            SignReason::RecordsChanged => "records changed",
            SignReason::SignaturesExpiring => "signatures expiring",
            SignReason::KeysMissing => "keys missing",
            SignReason::AlgorithmChanged => "algorithm changed",
        };
        f.write_str(text)
    }
}

/// What `build_zone` would do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZonePlan {
    Keep { serial: u32 },
    Sign { reason: SignReason },
}

/// Outcome of `build_zone`
#[derive(Debug, Clone)]
pub struct ZoneBuild {
    pub zone: SignedZone,
    /// Zone file was (re)written and the DNS server needs a reload
    pub published: bool,
}

/// Builds, signs and publishes zones
pub struct ZoneSynthesizer {
    network: NetworkConfig,
    dnssec: DnssecSettings,
    zone_dir: PathBuf,
    state_dir: PathBuf,
    keys: DnssecKeyStore,
    signer: DnssecSigner,
    retry: RetryPolicy,
}

impl ZoneSynthesizer {
    pub fn new(config: &Config) -> Self {
        let signer = DnssecSigner::new(DnssecConfig {
            signature_validity: chrono::Duration::days(config.dnssec.signature_validity_days as i64),
            inception_offset: chrono::Duration::seconds(config.dnssec.inception_offset_secs as i64),
        });

        Self {
            network: config.network.clone(),
            dnssec: config.dnssec.clone(),
            zone_dir: config.paths.zone_dir.clone(),
            state_dir: config.paths.zone_state_dir(),
            keys: DnssecKeyStore::new(config.paths.key_dir()),
            signer,
            retry: RetryPolicy::from(&config.acme),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn zone_file(&self, domain: &str) -> PathBuf {
        self.zone_dir.join(format!("{}.zone", domain))
    }

    pub fn ds_file(&self, domain: &str) -> PathBuf {
        self.zone_dir.join(format!("{}.ds", domain))
    }

    fn state_file(&self, domain: &str) -> PathBuf {
        self.state_dir.join(format!("{}.json", domain))
    }

    /// Unsigned records for a domain
    pub fn assemble_records(&self, domain: &Domain, serial: u32) -> Vec<DnsRecord> {
        let net = &self.network;
        let ttl = net.default_ttl;
        let name = &domain.name;
        let mut records = Vec::new();

        let primary = net
            .nameservers
            .first()
            .cloned()
            .unwrap_or_else(|| format!("ns1.{}", name));
        records.push(DnsRecord::new(
            "@",
            SOA_TTL,
            DnsRecordValue::SOA {
                mname: primary,
                rname: format!("hostmaster.{}", name),
                serial,
                refresh: SOA_REFRESH,
                retry: SOA_RETRY,
                expire: SOA_EXPIRE,
                minimum: SOA_MINIMUM,
            },
        ));

        for ns in &net.nameservers {
            records.push(DnsRecord::ns("@", ns.trim_end_matches('.'), NS_TTL));
        }

        records.push(DnsRecord::a("@", net.public_ipv4, ttl));
        if let Some(v6) = net.public_ipv6 {
            records.push(DnsRecord::aaaa("@", v6, ttl));
        }

        let exchange = net
            .mail_exchange
            .clone()
            .unwrap_or_else(|| format!("mail.{}", name));
        records.push(DnsRecord::mx("@", exchange.trim_end_matches('.'), MX_PREFERENCE, ttl));

        if let Some(issuer) = &net.caa_issuer {
            records.push(DnsRecord::caa_issue("@", issuer.as_str(), ttl));
        }

        for label in &domain.subdomains {
            records.push(DnsRecord::a(label.as_str(), net.public_ipv4, ttl));
            if let Some(v6) = net.public_ipv6 {
                records.push(DnsRecord::aaaa(label.as_str(), v6, ttl));
            }
        }

        records
    }

    /// Decide whether `build_zone` would sign, without side effects
    pub fn plan(&self, domain: &Domain) -> Result<ZonePlan> {
        self.plan_at(domain, Utc::now())
    }

    pub fn plan_at(&self, domain: &Domain, now: DateTime<Utc>) -> Result<ZonePlan> {
        let state = self.load_state(&domain.name)?;
        let digest = records_digest(&domain.name, &self.assemble_records(domain, 0));
        self.evaluate(domain, state.as_ref(), &digest, now)
    }

    fn evaluate(
        &self,
        domain: &Domain,
        state: Option<&ZoneState>,
        digest: &str,
        now: DateTime<Utc>,
    ) -> Result<ZonePlan> {
        let Some(state) = state else {
            return Ok(ZonePlan::Sign { reason: SignReason::New });
        };

        let keys = match self.keys.load(&domain.name)? {
            Some(keys) if state.zone.key_tags.contains(&keys.ksk.key_tag) => keys,
            _ => return Ok(ZonePlan::Sign { reason: SignReason::KeysMissing }),
        };

        let reason = if keys.ksk.algorithm != self.dnssec.algorithm.number() {
            Some(SignReason::AlgorithmChanged)
        } else if state.records_digest != digest {
            Some(SignReason::RecordsChanged)
        } else if state.zone.is_expiring_soon(self.dnssec.resign_before_days, now) {
            Some(SignReason::SignaturesExpiring)
        } else {
            None
        };

        Ok(match reason {
            Some(reason) => ZonePlan::Sign { reason },
            None => ZonePlan::Keep {
                serial: state.zone.serial,
            },
        })
    }

    /// Build, sign and publish the zone for `domain`
    pub async fn build_zone(&self, domain: &Domain) -> Result<ZoneBuild> {
        self.build_zone_at(domain, Utc::now()).await
    }

    pub async fn build_zone_at(&self, domain: &Domain, now: DateTime<Utc>) -> Result<ZoneBuild> {
        let name = domain.name.as_str();
        let state = self.load_state(name)?;
        let digest = records_digest(name, &self.assemble_records(domain, 0));

        let reason = match self.evaluate(domain, state.as_ref(), &digest, now)? {
            ZonePlan::Keep { serial } => {
                let Some(mut state) = state else {
                    return Err(ProvisionError::Config(format!("zone state for {} vanished", name)));
                };
                let published = if !self.zone_file(name).exists() {
                    info!(domain = name, serial, "Zone file missing; republishing signed zone");
                    state.reload_pending = true;
                    self.save_state(&state)?;
                    self.publish(&state.zone)?;
                    true
                } else if state.reload_pending {
                    info!(domain = name, serial, "Zone published but never reloaded");
                    true
                } else {
                    debug!(domain = name, serial, "Zone unchanged");
                    false
                };
                return Ok(ZoneBuild {
                    zone: state.zone,
                    published,
                });
            }
            ZonePlan::Sign { reason } => reason,
        };

        let previous_serial = state.as_ref().map(|s| s.zone.serial);
        let serial = next_serial(previous_serial, now);
        let records = self.assemble_records(domain, serial);
        info!(domain = name, serial, reason = %reason, "Signing zone");

        let algorithm = self.dnssec.algorithm;
        let signer = &self.signer;
        let records_ref = &records;
        let (keys, zone) = retry_with_backoff(&self.retry, &format!("sign zone {}", name), move |_| async move {
            let keys = ZoneKeys::generate(name, algorithm)?;
            let zone = signer.sign_zone(name, records_ref, &keys, now)?;
            Ok::<_, ProvisionError>((keys, zone))
        })
        .await?;

        self.keys.replace(name, &keys)?;
        self.save_state(&ZoneState {
            records_digest: digest,
            zone: zone.clone(),
            reload_pending: true,
        })?;
        self.publish(&zone)?;

        info!(
            domain = name,
            serial,
            ksk = keys.ksk.key_tag,
            zsk = keys.zsk.key_tag,
            "Zone signed and published"
        );
        for ds in &zone.ds_records {
            info!(domain = name, ds = %ds.to_registrar_format(), "DS record for the parent zone");
        }

        Ok(ZoneBuild {
            zone,
            published: true,
        })
    }

    fn publish(&self, zone: &SignedZone) -> Result<()> {
        write_atomic(&self.zone_file(&zone.domain), zone.to_zone_file().as_bytes(), Some(0o644))?;
        write_atomic(&self.ds_file(&zone.domain), zone.ds_file().as_bytes(), Some(0o644))?;
        Ok(())
    }

    /// Record that the DNS server loaded the published zone
    pub fn mark_reloaded(&self, domain: &str) -> Result<()> {
        if let Some(mut state) = self.load_state(domain)? {
            if state.reload_pending {
                state.reload_pending = false;
                self.save_state(&state)?;
            }
        }
        Ok(())
    }

    /// Whether a published zone still waits for a successful DNS reload
    pub fn reload_pending(&self, domain: &str) -> Result<bool> {
        Ok(self.load_state(domain)?.map_or(false, |s| s.reload_pending))
    }

    pub fn load_state(&self, domain: &str) -> Result<Option<ZoneState>> {
        let path = self.state_file(domain);
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    fn save_state(&self, state: &ZoneState) -> Result<()> {
        let json = serde_json::to_string_pretty(state)?;
        write_atomic(&self.state_file(&state.zone.domain), json.as_bytes(), Some(0o600))?;
        Ok(())
    }

    /// Domains that have persisted zone state
    pub fn managed_domains(&self) -> Result<Vec<String>> {
        list_stems(&self.state_dir, ".json")
    }

    /// Delete zone file, DS file, keys and state. Returns whether anything existed.
    pub fn remove_zone(&self, domain: &str) -> Result<bool> {
        let mut removed = false;
        for path in [
            self.zone_file(domain),
            self.ds_file(domain),
            self.state_file(domain),
        ] {
            if path.exists() {
                fs::remove_file(&path)?;
                removed = true;
            }
        }
        removed |= self.keys.remove(domain)?;

        if removed {
            info!(domain, "Zone artifacts removed");
        }
        Ok(removed)
    }

    /// Read-only checks of a published zone; returns the problems found
    pub fn audit(&self, domain: &Domain, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut problems = Vec::new();

        let Some(state) = self.load_state(&domain.name)? else {
            problems.push("zone has never been signed".to_string());
            return Ok(problems);
        };

        if !self.zone_file(&domain.name).exists() {
            problems.push("zone file missing".to_string());
        }
        if state.reload_pending {
            problems.push("zone not loaded by the DNS server".to_string());
        }

        if let ZonePlan::Sign { reason } = self.evaluate(
            domain,
            Some(&state),
            &records_digest(&domain.name, &self.assemble_records(domain, 0)),
            now,
        )? {
            problems.push(format!("zone needs signing: {}", reason));
        }

        if state.zone.expires_at <= now {
            problems.push("signatures expired".to_string());
        }

        if let Err(e) = verify_zone(&state.zone) {
            problems.push(e.to_string());
        }

        Ok(problems)
    }
}

/// `max(YYYYMMDDHH(now), previous + 1)`
pub fn next_serial(previous: Option<u32>, now: DateTime<Utc>) -> u32 {
    let date_hour: u32 = now.format("%Y%m%d%H").to_string().parse().unwrap_or(0);
    match previous {
        Some(prev) => date_hour.max(prev.saturating_add(1)),
        None => date_hour,
    }
}

/// SHA-256 over the sorted presentation lines, SOA serial zeroed
pub fn records_digest(domain: &str, records: &[DnsRecord]) -> String {
    let mut lines: Vec<String> = records
        .iter()
        .map(|record| {
            let mut record = record.clone();
            if let DnsRecordValue::SOA { serial, .. } = &mut record.value {
                *serial = 0;
            }
            record.to_zone_line(domain)
        })
        .collect();
    lines.sort();

    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// File names in `dir` ending with `suffix`, suffix stripped
pub(crate) fn list_stems(dir: &Path, suffix: &str) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut stems: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.strip_suffix(suffix).map(str::to_string))
        .collect();
    stems.sort();
    Ok(stems)
}

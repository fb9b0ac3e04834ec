//! DNSSEC Signing Implementation
//!
//! Signs a zone's record set with its KSK/ZSK pair:
//! - RRSIG for every RRset (KSK over DNSKEY, ZSK over everything else)
//! - NSEC chain for authenticated denial of existence
//! - Signature verification for read-only audits

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use ring::signature::{UnparsedPublicKey, ECDSA_P256_SHA256_FIXED, ED25519};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::dns::dns_types::{DnsRecord, DnsRecordType, DnsRecordValue};
use crate::dns::dnssec_keys::{
    domain_to_wire_format, DigestType, DnssecAlgorithm, DnssecKeyPair, DsRecord, ZoneKeys,
};

/// TTL published on DNSKEY records
const DNSKEY_TTL: u32 = 3600;

/// Configuration for DNSSEC signing
#[derive(Debug, Clone)]
pub struct DnssecConfig {
    /// Signature validity duration (default: 30 days)
    pub signature_validity: Duration,
    /// Inception offset (start validity slightly in the past, default: 1 hour)
    pub inception_offset: Duration,
}

impl Default for DnssecConfig {
    fn default() -> Self {
        Self {
            signature_validity: Duration::days(30),
            inception_offset: Duration::hours(1),
        }
    }
}

/// A signed DNS zone with RRSIG and NSEC records
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignedZone {
    /// The zone apex
    pub domain: String,
    /// SOA serial the zone was signed with
    pub serial: u32,
    /// All records including signatures
    pub records: Vec<DnsRecord>,
    pub signed_at: DateTime<Utc>,
    /// Earliest signature expiration
    pub expires_at: DateTime<Utc>,
    /// Key tags used for signing (ZSK, KSK)
    pub key_tags: Vec<u16>,
    /// DS records for the parent zone
    pub ds_records: Vec<DsRecord>,
}

impl SignedZone {
    /// Check if the zone signature expires within `days_threshold` days of `now`
    pub fn is_expiring_soon(&self, days_threshold: u32, now: DateTime<Utc>) -> bool {
        now + Duration::days(days_threshold as i64) >= self.expires_at
    }

    /// Get all RRSIG records
    pub fn get_rrsigs(&self) -> Vec<&DnsRecord> {
        self.records_of(DnsRecordType::RRSIG)
    }

    /// Get all NSEC records
    pub fn get_nsec_records(&self) -> Vec<&DnsRecord> {
        self.records_of(DnsRecordType::NSEC)
    }

    /// Get DNSKEY records
    pub fn get_dnskey_records(&self) -> Vec<&DnsRecord> {
        self.records_of(DnsRecordType::DNSKEY)
    }

    fn records_of(&self, record_type: DnsRecordType) -> Vec<&DnsRecord> {
        self.records
            .iter()
            .filter(|r| r.record_type == record_type)
            .collect()
    }

    /// Render the zone in RFC 1035 master-file format
    pub fn to_zone_file(&self) -> String {
        let mut out = format!(
            "; {} signed {} serial {}\n$ORIGIN {}.\n",
            self.domain,
            self.signed_at.format("%Y-%m-%dT%H:%M:%SZ"),
            self.serial,
            self.domain
        );
        for record in &self.records {
            out.push_str(&record.to_zone_line(&self.domain));
            out.push('\n');
        }
        out
    }

    /// DS records in zone-file form, one per line
    pub fn ds_file(&self) -> String {
        self.ds_records
            .iter()
            .map(|ds| format!("{}\n", ds.to_zone_format(&self.domain)))
            .collect()
    }
}

/// An RRset (Resource Record Set) - records with same name and type
#[derive(Debug, Clone)]
pub struct RRset {
    /// Owner name (FQDN)
    pub name: String,
    pub record_type: DnsRecordType,
    pub ttl: u32,
    pub records: Vec<DnsRecord>,
}

impl RRset {
    /// Get the number of labels in the name
    pub fn label_count(&self) -> u8 {
        count_labels(&self.name)
    }
}

/// DNSSEC Zone Signer
#[derive(Debug, Clone, Default)]
pub struct DnssecSigner {
    config: DnssecConfig,
}

impl DnssecSigner {
    pub fn new(config: DnssecConfig) -> Self {
        Self { config }
    }

    /// Sign a zone's records. The records must contain exactly one SOA at the apex.
    pub fn sign_zone(
        &self,
        domain: &str,
        records: &[DnsRecord],
        keys: &ZoneKeys,
        now: DateTime<Utc>,
    ) -> Result<SignedZone, DnssecError> {
        let (serial, negative_ttl) = soa_parameters(domain, records)?;

        info!(
            "Signing zone {} with ZSK {} and KSK {}",
            domain, keys.zsk.key_tag, keys.ksk.key_tag
        );

        let inception_at = now - self.config.inception_offset;
        let expires_at = now + self.config.signature_validity;
        let inception = to_sig_time(inception_at)?;
        let expiration = to_sig_time(expires_at)?;

        let mut all_records: Vec<DnsRecord> = records
            .iter()
            .filter(|r| !r.record_type.is_dnssec())
            .cloned()
            .collect();
        all_records.push(create_dnskey_record(&keys.zsk));
        all_records.push(create_dnskey_record(&keys.ksk));

        let rrsets = group_into_rrsets(domain, &all_records);
        let nsec_records = generate_nsec_chain(domain, &rrsets, negative_ttl);
        let nsec_rrsets = group_into_rrsets(domain, &nsec_records);

        let mut signatures = Vec::with_capacity(rrsets.len() + nsec_rrsets.len());
        for rrset in rrsets.iter().chain(nsec_rrsets.iter()) {
            let signing_key = if rrset.record_type == DnsRecordType::DNSKEY {
                &keys.ksk
            } else {
                &keys.zsk
            };
            signatures.push(sign_rrset(domain, rrset, signing_key, inception, expiration)?);
        }

        all_records.extend(nsec_records);
        all_records.extend(signatures);
        sort_for_output(domain, &mut all_records);

        info!("Zone {} signed: {} total records", domain, all_records.len());

        Ok(SignedZone {
            domain: domain.to_string(),
            serial,
            records: all_records,
            signed_at: now,
            expires_at,
            key_tags: vec![keys.zsk.key_tag, keys.ksk.key_tag],
            ds_records: vec![keys.ksk.generate_ds_record(DigestType::Sha256)],
        })
    }
}

/// Verify every RRSIG in a signed zone against the zone's own DNSKEYs.
/// Returns the number of signatures checked.
pub fn verify_zone(zone: &SignedZone) -> Result<usize, DnssecError> {
    let domain = &zone.domain;

    let unsigned: Vec<DnsRecord> = zone
        .records
        .iter()
        .filter(|r| r.record_type != DnsRecordType::RRSIG)
        .cloned()
        .collect();
    let rrsets: BTreeMap<(String, DnsRecordType), RRset> = group_into_rrsets(domain, &unsigned)
        .into_iter()
        .map(|set| ((set.name.clone(), set.record_type), set))
        .collect();

    let dnskeys: Vec<(u16, u8, Vec<u8>)> = zone
        .get_dnskey_records()
        .into_iter()
        .filter_map(|r| match &r.value {
            DnsRecordValue::DNSKEY {
                flags,
                algorithm,
                public_key,
                ..
            } => Some((
                crate::dns::dnssec_keys::calculate_key_tag(*flags, *algorithm, public_key),
                *algorithm,
                public_key.clone(),
            )),
            _ => None,
        })
        .collect();

    let mut checked = 0;
    for rrsig in zone.get_rrsigs() {
        let DnsRecordValue::RRSIG {
            type_covered,
            algorithm,
            expiration,
            inception,
            key_tag,
            signature,
            ..
        } = &rrsig.value
        else {
            continue;
        };

        let owner = rrsig.fqdn(domain);
        let rrset = rrsets
            .get(&(owner.clone(), *type_covered))
            .ok_or_else(|| {
                DnssecError::VerificationFailed(format!("no {} RRset at {}", type_covered, owner))
            })?;

        let (_, key_alg, public_key) = dnskeys
            .iter()
            .find(|(tag, alg, _)| tag == key_tag && alg == algorithm)
            .ok_or_else(|| {
                DnssecError::VerificationFailed(format!("no DNSKEY with tag {}", key_tag))
            })?;

        let data = signature_input(domain, rrset, *key_alg, *key_tag, *inception, *expiration);
        let valid = match DnssecAlgorithm::from_number(*key_alg) {
            Some(DnssecAlgorithm::EcdsaP256Sha256) => {
                let mut point = Vec::with_capacity(65);
                point.push(0x04);
                point.extend_from_slice(public_key);
                UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point)
                    .verify(&data, signature)
                    .is_ok()
            }
            Some(DnssecAlgorithm::Ed25519) => UnparsedPublicKey::new(&ED25519, public_key)
                .verify(&data, signature)
                .is_ok(),
            None => false,
        };

        if !valid {
            return Err(DnssecError::VerificationFailed(format!(
                "bad signature over {}/{}",
                owner, type_covered
            )));
        }
        checked += 1;
    }

    debug!("Verified {} signatures in zone {}", checked, domain);
    Ok(checked)
}

/// Serial and negative-caching TTL from the apex SOA
fn soa_parameters(domain: &str, records: &[DnsRecord]) -> Result<(u32, u32), DnssecError> {
    let mut soas = records.iter().filter_map(|r| match &r.value {
        DnsRecordValue::SOA {
            serial, minimum, ..
        } if r.fqdn(domain) == domain => Some((*serial, *minimum)),
        _ => None,
    });

    match (soas.next(), soas.next()) {
        (Some(params), None) => Ok(params),
        (None, _) => Err(DnssecError::InvalidZone(format!("{} has no SOA record", domain))),
        (Some(_), Some(_)) => Err(DnssecError::InvalidZone(format!(
            "{} has more than one SOA record",
            domain
        ))),
    }
}

fn to_sig_time(at: DateTime<Utc>) -> Result<u32, DnssecError> {
    u32::try_from(at.timestamp())
        .map_err(|_| DnssecError::InvalidConfiguration(format!("signature time {} out of range", at)))
}

/// Group records into RRsets (same name and type)
fn group_into_rrsets(domain: &str, records: &[DnsRecord]) -> Vec<RRset> {
    let mut rrset_map: BTreeMap<(String, DnsRecordType), Vec<DnsRecord>> = BTreeMap::new();

    for record in records {
        if record.record_type == DnsRecordType::RRSIG {
            continue;
        }
        let key = (record.fqdn(domain), record.record_type);
        rrset_map.entry(key).or_default().push(record.clone());
    }

    rrset_map
        .into_iter()
        .map(|((name, record_type), records)| {
            let ttl = records.first().map(|r| r.ttl).unwrap_or(300);
            RRset {
                name,
                record_type,
                ttl,
                records,
            }
        })
        .collect()
}

/// RRSIG RDATA (minus signature) followed by the canonical RRset (RFC 4034 section 3.1.8.1)
fn signature_input(
    domain: &str,
    rrset: &RRset,
    algorithm: u8,
    key_tag: u16,
    inception: u32,
    expiration: u32,
) -> Vec<u8> {
    let mut data = Vec::new();
    data.extend_from_slice(&rrset.record_type.code().to_be_bytes());
    data.push(algorithm);
    data.push(rrset.label_count());
    data.extend_from_slice(&rrset.ttl.to_be_bytes());
    data.extend_from_slice(&expiration.to_be_bytes());
    data.extend_from_slice(&inception.to_be_bytes());
    data.extend_from_slice(&key_tag.to_be_bytes());
    data.extend_from_slice(&domain_to_wire_format(domain));
    data.extend_from_slice(&canonicalize_rrset(rrset, domain));
    data
}

/// Sign a single RRset
fn sign_rrset(
    domain: &str,
    rrset: &RRset,
    key: &DnssecKeyPair,
    inception: u32,
    expiration: u32,
) -> Result<DnsRecord, DnssecError> {
    let data = signature_input(domain, rrset, key.algorithm, key.key_tag, inception, expiration);

    let signature = key
        .sign(&data)
        .map_err(|e| DnssecError::SigningFailed(e.to_string()))?;

    debug!(
        "Signed RRset {}/{} with key {} (sig: {} bytes)",
        rrset.name,
        rrset.record_type,
        key.key_tag,
        signature.len()
    );

    Ok(DnsRecord::new(
        rrset.name.clone(),
        rrset.ttl,
        DnsRecordValue::RRSIG {
            type_covered: rrset.record_type,
            algorithm: key.algorithm,
            labels: rrset.label_count(),
            original_ttl: rrset.ttl,
            expiration,
            inception,
            key_tag: key.key_tag,
            signer_name: domain.to_string(),
            signature,
        },
    ))
}

/// Canonicalize RRset for signing (RFC 4034 Section 6.3)
fn canonicalize_rrset(rrset: &RRset, domain: &str) -> Vec<u8> {
    let mut wire_records: Vec<Vec<u8>> = rrset
        .records
        .iter()
        .map(|r| record_to_wire(r, domain, rrset.ttl))
        .collect();

    // Canonical order is by RDATA; owner, type, class and TTL are equal within a set
    wire_records.sort();
    wire_records.dedup();
    wire_records.concat()
}

/// Convert a record to wire format for signing
fn record_to_wire(record: &DnsRecord, domain: &str, ttl: u32) -> Vec<u8> {
    let mut wire = Vec::new();
    wire.extend_from_slice(&domain_to_wire_format(&record.fqdn(domain)));
    wire.extend_from_slice(&record.record_type.code().to_be_bytes());
    wire.extend_from_slice(&1u16.to_be_bytes()); // Class IN
    wire.extend_from_slice(&ttl.to_be_bytes());

    let rdata = value_to_rdata(&record.value, record.priority);
    wire.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
    wire.extend_from_slice(&rdata);
    wire
}

/// Convert record value to RDATA wire format
fn value_to_rdata(value: &DnsRecordValue, priority: Option<u16>) -> Vec<u8> {
    match value {
        DnsRecordValue::A(ip) => ip.octets().to_vec(),
        DnsRecordValue::AAAA(ip) => ip.octets().to_vec(),
        DnsRecordValue::CNAME(name) | DnsRecordValue::NS(name) => domain_to_wire_format(name),
        DnsRecordValue::MX { exchange } => {
            let mut rdata = priority.unwrap_or(10).to_be_bytes().to_vec();
            rdata.extend_from_slice(&domain_to_wire_format(exchange));
            rdata
        }
        DnsRecordValue::TXT(text) => {
            let mut rdata = Vec::new();
            // Character strings are at most 255 bytes
            for chunk in text.as_bytes().chunks(255) {
                rdata.push(chunk.len() as u8);
                rdata.extend_from_slice(chunk);
            }
            rdata
        }
        DnsRecordValue::SOA {
            mname,
            rname,
            serial,
            refresh,
            retry,
            expire,
            minimum,
        } => {
            let mut rdata = domain_to_wire_format(mname);
            rdata.extend_from_slice(&domain_to_wire_format(rname));
            for field in [serial, refresh, retry, expire, minimum] {
                rdata.extend_from_slice(&field.to_be_bytes());
            }
            rdata
        }
        DnsRecordValue::CAA { flags, tag, value } => {
            let mut rdata = vec![*flags, tag.len() as u8];
            rdata.extend_from_slice(tag.as_bytes());
            rdata.extend_from_slice(value.as_bytes());
            rdata
        }
        DnsRecordValue::DNSKEY {
            flags,
            protocol,
            algorithm,
            public_key,
        } => {
            let mut rdata = flags.to_be_bytes().to_vec();
            rdata.push(*protocol);
            rdata.push(*algorithm);
            rdata.extend_from_slice(public_key);
            rdata
        }
        DnsRecordValue::RRSIG { .. } => Vec::new(), // Never part of a signed RRset
        DnsRecordValue::NSEC { next_domain, types } => {
            let mut rdata = domain_to_wire_format(next_domain);
            rdata.extend_from_slice(&types_to_bitmap(types));
            rdata
        }
        DnsRecordValue::DS {
            key_tag,
            algorithm,
            digest_type,
            digest,
        } => {
            let mut rdata = key_tag.to_be_bytes().to_vec();
            rdata.push(*algorithm);
            rdata.push(*digest_type);
            rdata.extend_from_slice(digest);
            rdata
        }
    }
}

/// Generate NSEC chain for authenticated denial of existence
fn generate_nsec_chain(domain: &str, rrsets: &[RRset], ttl: u32) -> Vec<DnsRecord> {
    let mut owner_types: BTreeMap<String, BTreeSet<DnsRecordType>> = BTreeMap::new();
    for rrset in rrsets {
        owner_types
            .entry(rrset.name.clone())
            .or_default()
            .insert(rrset.record_type);
    }

    let mut names: Vec<String> = owner_types.keys().cloned().collect();
    names.sort_by(|a, b| canonical_compare(a, b));

    let mut nsec_records = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        // Last name points back to the apex
        let next_name = names[(i + 1) % names.len()].clone();

        let mut types: Vec<DnsRecordType> = owner_types
            .get(name)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        types.push(DnsRecordType::NSEC);
        types.push(DnsRecordType::RRSIG);
        types.sort_by_key(|t| t.code());
        types.dedup();

        nsec_records.push(DnsRecord::new(
            name.clone(),
            ttl,
            DnsRecordValue::NSEC {
                next_domain: next_name,
                types,
            },
        ));
    }

    debug!("Generated {} NSEC records for zone {}", nsec_records.len(), domain);
    nsec_records
}

/// Create a DNSKEY record from a key pair
fn create_dnskey_record(key: &DnssecKeyPair) -> DnsRecord {
    DnsRecord::new(
        "@",
        DNSKEY_TTL,
        DnsRecordValue::DNSKEY {
            flags: key.flags,
            protocol: 3,
            algorithm: key.algorithm,
            public_key: key.public_key.clone(),
        },
    )
}

/// SOA first, then canonical owner order; RRSIGs follow the set they cover
fn sort_for_output(domain: &str, records: &mut [DnsRecord]) {
    records.sort_by(|a, b| {
        let rank = |r: &DnsRecord| -> (u8, u16) {
            match &r.value {
                DnsRecordValue::SOA { .. } => (0, 0),
                DnsRecordValue::RRSIG { type_covered, .. } => (1, type_covered.code()),
                _ => (1, r.record_type.code()),
            }
        };
        let is_sig = |r: &DnsRecord| r.record_type == DnsRecordType::RRSIG;

        let (a_rank, a_type) = rank(a);
        let (b_rank, b_type) = rank(b);
        a_rank
            .cmp(&b_rank)
            .then_with(|| canonical_compare(&a.fqdn(domain), &b.fqdn(domain)))
            .then_with(|| a_type.cmp(&b_type))
            .then_with(|| is_sig(a).cmp(&is_sig(b)))
    });
}

/// Count labels in a domain name
fn count_labels(domain: &str) -> u8 {
    domain.split('.').filter(|s| !s.is_empty()).count() as u8
}

/// Canonical comparison of domain names (RFC 4034)
fn canonical_compare(a: &str, b: &str) -> std::cmp::Ordering {
    let a_labels: Vec<&str> = a.split('.').filter(|s| !s.is_empty()).collect();
    let b_labels: Vec<&str> = b.split('.').filter(|s| !s.is_empty()).collect();

    for (a_label, b_label) in a_labels.iter().rev().zip(b_labels.iter().rev()) {
        let cmp = a_label.to_lowercase().cmp(&b_label.to_lowercase());
        if cmp != std::cmp::Ordering::Equal {
            return cmp;
        }
    }

    a_labels.len().cmp(&b_labels.len())
}

/// Convert record types to NSEC type bitmap (RFC 4034 Section 4.1.2)
fn types_to_bitmap(types: &[DnsRecordType]) -> Vec<u8> {
    let mut windows: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    for rtype in types {
        let code = rtype.code();
        windows
            .entry((code / 256) as u8)
            .or_default()
            .push((code % 256) as u8);
    }

    let mut bitmap = Vec::new();
    for (window, offsets) in windows {
        let max_offset = offsets.iter().max().copied().unwrap_or(0);
        let bitmap_len = (max_offset / 8) + 1;
        let mut window_bitmap = vec![0u8; bitmap_len as usize];

        for offset in offsets {
            window_bitmap[(offset / 8) as usize] |= 1 << (7 - (offset % 8));
        }

        bitmap.push(window);
        bitmap.push(bitmap_len);
        bitmap.extend(window_bitmap);
    }

    bitmap
}

/// DNSSEC errors
#[derive(Debug, Clone)]
pub enum DnssecError {
    SigningFailed(String),
    InvalidZone(String),
    InvalidConfiguration(String),
    VerificationFailed(String),
}

impl std::fmt::Display for DnssecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnssecError::SigningFailed(msg) => write!(f, "Signing failed: {}", msg),
            DnssecError::InvalidZone(msg) => write!(f, "Invalid zone: {}", msg),
            DnssecError::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            DnssecError::VerificationFailed(msg) => write!(f, "Verification failed: {}", msg),
        }
    }
}

impl std::error::Error for DnssecError {}

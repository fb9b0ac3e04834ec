//! DNSSEC Key Management
//!
//! Generates the KSK/ZSK pair for a zone, persists it under the key
//! directory and derives DS records for the registrar. A zone always has
//! exactly one key set: re-signing replaces it, it never accumulates.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{
    EcdsaKeyPair, Ed25519KeyPair, KeyPair, ECDSA_P256_SHA256_FIXED_SIGNING,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384};
use tracing::{debug, info};

use crate::install::write_atomic;

/// DNSSEC algorithm identifiers (RFC 8624)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnssecAlgorithm {
    /// ECDSA P-256 with SHA-256 (Algorithm 13)
    #[serde(rename = "ECDSAP256SHA256")]
    EcdsaP256Sha256 = 13,
    /// Ed25519 (Algorithm 15)
    #[serde(rename = "ED25519")]
    Ed25519 = 15,
}

impl DnssecAlgorithm {
    /// Get the algorithm number
    pub fn number(&self) -> u8 {
        *self as u8
    }

    /// Get algorithm name
    pub fn name(&self) -> &'static str {
        match self {
            DnssecAlgorithm::EcdsaP256Sha256 => "ECDSAP256SHA256",
            DnssecAlgorithm::Ed25519 => "ED25519",
        }
    }

    /// Parse from algorithm number
    pub fn from_number(num: u8) -> Option<Self> {
        match num {
            13 => Some(DnssecAlgorithm::EcdsaP256Sha256),
            15 => Some(DnssecAlgorithm::Ed25519),
            _ => None,
        }
    }
}

impl Default for DnssecAlgorithm {
    fn default() -> Self {
        DnssecAlgorithm::EcdsaP256Sha256
    }
}

/// DNSSEC digest type for DS records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DigestType {
    /// SHA-256 (Digest Type 2) - Recommended
    Sha256 = 2,
    /// SHA-384 (Digest Type 4)
    Sha384 = 4,
}

impl Default for DigestType {
    fn default() -> Self {
        DigestType::Sha256
    }
}

/// Key flags for DNSKEY records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFlags {
    /// Zone Signing Key (256)
    Zsk = 256,
    /// Key Signing Key (257)
    Ksk = 257,
}

impl KeyFlags {
    pub fn value(&self) -> u16 {
        *self as u16
    }
}

/// A DNSSEC key pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnssecKeyPair {
    /// Domain this key is for
    pub domain: String,
    /// Key tag (identifier)
    pub key_tag: u16,
    /// Algorithm identifier
    pub algorithm: u8,
    /// Key flags (256 for ZSK, 257 for KSK)
    pub flags: u16,
    /// Public key bytes in DNSKEY form
    pub public_key: Vec<u8>,
    /// PKCS#8 private key, base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DnssecKeyPair {
    /// Create a new key pair for a domain
    pub fn generate(
        domain: &str,
        flags: KeyFlags,
        algorithm: DnssecAlgorithm,
    ) -> Result<Self, DnssecKeyError> {
        let rng = SystemRandom::new();

        let (pkcs8, public_key) = match algorithm {
            DnssecAlgorithm::EcdsaP256Sha256 => {
                let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                    .map_err(|_| DnssecKeyError::KeyGenerationFailed)?;
                let key_pair =
                    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                        .map_err(|_| DnssecKeyError::KeyGenerationFailed)?;
                // DNSKEY carries the bare X||Y point without the 0x04 prefix (RFC 6605)
                let point = key_pair.public_key().as_ref();
                (pkcs8.as_ref().to_vec(), point[1..].to_vec())
            }
            DnssecAlgorithm::Ed25519 => {
                let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
                    .map_err(|_| DnssecKeyError::KeyGenerationFailed)?;
                let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
                    .map_err(|_| DnssecKeyError::KeyGenerationFailed)?;
                (pkcs8.as_ref().to_vec(), key_pair.public_key().as_ref().to_vec())
            }
        };

        let key_tag = calculate_key_tag(flags.value(), algorithm.number(), &public_key);

        Ok(Self {
            domain: domain.to_string(),
            key_tag,
            algorithm: algorithm.number(),
            flags: flags.value(),
            public_key,
            private_key: Some(BASE64.encode(pkcs8)),
            created_at: Utc::now(),
        })
    }

    /// Check if this is a Key Signing Key (KSK)
    pub fn is_ksk(&self) -> bool {
        self.flags == KeyFlags::Ksk.value()
    }

    /// Check if this is a Zone Signing Key (ZSK)
    pub fn is_zsk(&self) -> bool {
        self.flags == KeyFlags::Zsk.value()
    }

    fn pkcs8(&self) -> Result<Vec<u8>, DnssecKeyError> {
        let encoded = self
            .private_key
            .as_ref()
            .ok_or(DnssecKeyError::PrivateKeyNotAvailable)?;
        BASE64
            .decode(encoded)
            .map_err(|_| DnssecKeyError::InvalidKeyData)
    }

    /// Sign data with this key
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, DnssecKeyError> {
        let pkcs8 = self.pkcs8()?;

        match DnssecAlgorithm::from_number(self.algorithm) {
            Some(DnssecAlgorithm::EcdsaP256Sha256) => {
                let rng = SystemRandom::new();
                let key_pair =
                    EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &pkcs8, &rng)
                        .map_err(|_| DnssecKeyError::InvalidKeyData)?;
                let signature = key_pair
                    .sign(&rng, data)
                    .map_err(|_| DnssecKeyError::SigningFailed)?;
                Ok(signature.as_ref().to_vec())
            }
            Some(DnssecAlgorithm::Ed25519) => {
                let key_pair = Ed25519KeyPair::from_pkcs8(&pkcs8)
                    .map_err(|_| DnssecKeyError::InvalidKeyData)?;
                Ok(key_pair.sign(data).as_ref().to_vec())
            }
            None => Err(DnssecKeyError::UnsupportedAlgorithm(self.algorithm)),
        }
    }

    /// Generate DS record for this key
    pub fn generate_ds_record(&self, digest_type: DigestType) -> DsRecord {
        // DS digest = H(owner name in wire format || DNSKEY RDATA)
        let mut input = domain_to_wire_format(&self.domain);
        input.extend_from_slice(&self.to_dnskey_rdata());

        let digest = match digest_type {
            DigestType::Sha256 => Sha256::digest(&input).to_vec(),
            DigestType::Sha384 => Sha384::digest(&input).to_vec(),
        };

        DsRecord {
            key_tag: self.key_tag,
            algorithm: self.algorithm,
            digest_type: digest_type as u8,
            digest,
        }
    }

    /// Export public key only (for sharing)
    pub fn public_only(&self) -> Self {
        Self {
            private_key: None,
            ..self.clone()
        }
    }

    /// Get DNSKEY RDATA
    pub fn to_dnskey_rdata(&self) -> Vec<u8> {
        let mut rdata = Vec::with_capacity(4 + self.public_key.len());
        rdata.extend_from_slice(&self.flags.to_be_bytes());
        rdata.push(3); // Protocol is always 3
        rdata.push(self.algorithm);
        rdata.extend_from_slice(&self.public_key);
        rdata
    }
}

/// DS (Delegation Signer) record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DsRecord {
    pub key_tag: u16,
    pub algorithm: u8,
    pub digest_type: u8,
    pub digest: Vec<u8>,
}

impl DsRecord {
    /// Format as zone file record
    pub fn to_zone_format(&self, domain: &str) -> String {
        format!(
            "{}. IN DS {} {} {} {}",
            domain.trim_end_matches('.'),
            self.key_tag,
            self.algorithm,
            self.digest_type,
            hex::encode(&self.digest).to_uppercase()
        )
    }

    /// Format for registrar submission
    pub fn to_registrar_format(&self) -> String {
        format!(
            "Key Tag: {}\nAlgorithm: {}\nDigest Type: {}\nDigest: {}",
            self.key_tag,
            self.algorithm,
            self.digest_type,
            hex::encode(&self.digest).to_uppercase()
        )
    }
}

/// The key set a zone is signed with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneKeys {
    pub ksk: DnssecKeyPair,
    pub zsk: DnssecKeyPair,
}

impl ZoneKeys {
    /// Generate a fresh KSK and ZSK
    pub fn generate(domain: &str, algorithm: DnssecAlgorithm) -> Result<Self, DnssecKeyError> {
        let ksk = DnssecKeyPair::generate(domain, KeyFlags::Ksk, algorithm)?;
        let zsk = DnssecKeyPair::generate(domain, KeyFlags::Zsk, algorithm)?;

        // Distinct tags keep RRSIGs unambiguous for validators
        if ksk.key_tag == zsk.key_tag {
            return Self::generate(domain, algorithm);
        }

        Ok(Self { ksk, zsk })
    }
}

/// On-disk key storage, one JSON file per zone
#[derive(Debug, Clone)]
pub struct DnssecKeyStore {
    base_path: PathBuf,
}

impl DnssecKeyStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn key_file(&self, domain: &str) -> PathBuf {
        self.base_path
            .join(format!("{}.keys.json", domain.replace('.', "_")))
    }

    /// Replace the stored key set for a domain
    pub fn replace(&self, domain: &str, keys: &ZoneKeys) -> Result<(), DnssecKeyError> {
        let path = self.key_file(domain);
        let json = serde_json::to_string_pretty(keys)
            .map_err(|e| DnssecKeyError::StorageError(e.to_string()))?;

        write_atomic(&path, json.as_bytes(), Some(0o600))
            .map_err(|e| DnssecKeyError::StorageError(e.to_string()))?;

        info!(
            "Stored keys for {} (KSK tag {}, ZSK tag {})",
            domain, keys.ksk.key_tag, keys.zsk.key_tag
        );
        Ok(())
    }

    /// Load the key set for a domain, if any
    pub fn load(&self, domain: &str) -> Result<Option<ZoneKeys>, DnssecKeyError> {
        let path = self.key_file(domain);

        if !path.exists() {
            return Ok(None);
        }

        let json = fs::read_to_string(&path)
            .map_err(|e| DnssecKeyError::StorageError(e.to_string()))?;
        let keys: ZoneKeys = serde_json::from_str(&json)
            .map_err(|e| DnssecKeyError::StorageError(e.to_string()))?;

        debug!("Loaded keys for {} from {}", domain, path.display());
        Ok(Some(keys))
    }

    /// Delete the key set for a domain. Returns whether a file was removed.
    pub fn remove(&self, domain: &str) -> Result<bool, DnssecKeyError> {
        let path = self.key_file(domain);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|e| DnssecKeyError::StorageError(e.to_string()))?;
        info!("Removed keys for {}", domain);
        Ok(true)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// Calculate DNSKEY key tag per RFC 4034
pub fn calculate_key_tag(flags: u16, algorithm: u8, public_key: &[u8]) -> u16 {
    let mut ac: u32 = 0;

    // DNSKEY RDATA format: flags (2) + protocol (1) + algorithm (1) + public key
    let mut rdata = Vec::with_capacity(4 + public_key.len());
    rdata.extend_from_slice(&flags.to_be_bytes());
    rdata.push(3);
    rdata.push(algorithm);
    rdata.extend_from_slice(public_key);

    for (i, byte) in rdata.iter().enumerate() {
        if i % 2 == 0 {
            ac += (*byte as u32) << 8;
        } else {
            ac += *byte as u32;
        }
    }

    ac += (ac >> 16) & 0xFFFF;
    (ac & 0xFFFF) as u16
}

/// Convert domain name to wire format (lowercased, RFC 4034 section 6.2)
pub fn domain_to_wire_format(domain: &str) -> Vec<u8> {
    let mut wire = Vec::new();

    for label in domain.split('.') {
        if label.is_empty() {
            continue;
        }
        wire.push(label.len() as u8);
        wire.extend_from_slice(label.to_lowercase().as_bytes());
    }

    wire.push(0); // Root label
    wire
}

/// DNSSEC Key errors
#[derive(Debug, Clone)]
pub enum DnssecKeyError {
    KeyGenerationFailed,
    InvalidKeyData,
    PrivateKeyNotAvailable,
    SigningFailed,
    UnsupportedAlgorithm(u8),
    StorageError(String),
}

impl std::fmt::Display for DnssecKeyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnssecKeyError::KeyGenerationFailed => write!(f, "Key generation failed"),
            DnssecKeyError::InvalidKeyData => write!(f, "Invalid key data"),
            DnssecKeyError::PrivateKeyNotAvailable => write!(f, "Private key not available"),
            DnssecKeyError::SigningFailed => write!(f, "Signing failed"),
            DnssecKeyError::UnsupportedAlgorithm(alg) => {
                write!(f, "Unsupported algorithm: {}", alg)
            }
            DnssecKeyError::StorageError(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for DnssecKeyError {}

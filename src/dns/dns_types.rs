//! DNS Record Type Definitions
//!
//! Typed records for the zones the provisioner synthesizes, with RFC 1035
//! presentation output for zone files.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// DNS record types used in synthesized zones
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum DnsRecordType {
    /// IPv4 address record
    A,
    /// IPv6 address record
    AAAA,
    /// Canonical name (alias)
    CNAME,
    /// Mail exchange
    MX,
    /// Text record
    TXT,
    /// Name server
    NS,
    /// Start of authority
    SOA,
    /// Certification Authority Authorization
    CAA,
    /// DNSSEC signature
    RRSIG,
    /// DNSSEC key
    DNSKEY,
    /// Next secure record
    NSEC,
    /// Delegation signer
    DS,
}

impl DnsRecordType {
    /// IANA type code (RFC 1035, RFC 3596, RFC 4034, RFC 8659)
    pub fn code(&self) -> u16 {
        match self {
            DnsRecordType::A => 1,
            DnsRecordType::NS => 2,
            DnsRecordType::CNAME => 5,
            DnsRecordType::SOA => 6,
            DnsRecordType::MX => 15,
            DnsRecordType::TXT => 16,
            DnsRecordType::AAAA => 28,
            DnsRecordType::DS => 43,
            DnsRecordType::RRSIG => 46,
            DnsRecordType::NSEC => 47,
            DnsRecordType::DNSKEY => 48,
            DnsRecordType::CAA => 257,
        }
    }

    /// Whether records of this type are produced by signing
    pub fn is_dnssec(&self) -> bool {
        matches!(
            self,
            DnsRecordType::RRSIG | DnsRecordType::NSEC | DnsRecordType::DNSKEY | DnsRecordType::DS
        )
    }
}

impl fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DnsRecordType::A => "A",
            DnsRecordType::AAAA => "AAAA",
            DnsRecordType::CNAME => "CNAME",
            DnsRecordType::MX => "MX",
            DnsRecordType::TXT => "TXT",
            DnsRecordType::NS => "NS",
            DnsRecordType::SOA => "SOA",
            DnsRecordType::CAA => "CAA",
            DnsRecordType::RRSIG => "RRSIG",
            DnsRecordType::DNSKEY => "DNSKEY",
            DnsRecordType::NSEC => "NSEC",
            DnsRecordType::DS => "DS",
        };
        f.write_str(name)
    }
}

impl FromStr for DnsRecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "A" => Ok(DnsRecordType::A),
            "AAAA" => Ok(DnsRecordType::AAAA),
            "CNAME" => Ok(DnsRecordType::CNAME),
            "MX" => Ok(DnsRecordType::MX),
            "TXT" => Ok(DnsRecordType::TXT),
            "NS" => Ok(DnsRecordType::NS),
            "SOA" => Ok(DnsRecordType::SOA),
            "CAA" => Ok(DnsRecordType::CAA),
            "RRSIG" => Ok(DnsRecordType::RRSIG),
            "DNSKEY" => Ok(DnsRecordType::DNSKEY),
            "NSEC" => Ok(DnsRecordType::NSEC),
            "DS" => Ok(DnsRecordType::DS),
            _ => Err(format!("Invalid record type: {}", s)),
        }
    }
}

/// Values for different DNS record types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum DnsRecordValue {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    CNAME(String),
    /// Mail exchange with preference handled separately
    MX { exchange: String },
    TXT(String),
    NS(String),
    SOA {
        /// Primary nameserver
        mname: String,
        /// Admin mailbox (with . instead of @)
        rname: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
    CAA {
        flags: u8,
        tag: String,
        value: String,
    },
    RRSIG {
        type_covered: DnsRecordType,
        algorithm: u8,
        labels: u8,
        original_ttl: u32,
        expiration: u32,
        inception: u32,
        key_tag: u16,
        signer_name: String,
        signature: Vec<u8>,
    },
    DNSKEY {
        flags: u16,
        protocol: u8,
        algorithm: u8,
        public_key: Vec<u8>,
    },
    NSEC {
        next_domain: String,
        types: Vec<DnsRecordType>,
    },
    DS {
        key_tag: u16,
        algorithm: u8,
        digest_type: u8,
        digest: Vec<u8>,
    },
}

impl DnsRecordValue {
    /// Get the record type for this value
    pub fn record_type(&self) -> DnsRecordType {
        match self {
            DnsRecordValue::A(_) => DnsRecordType::A,
            DnsRecordValue::AAAA(_) => DnsRecordType::AAAA,
            DnsRecordValue::CNAME(_) => DnsRecordType::CNAME,
            DnsRecordValue::MX { .. } => DnsRecordType::MX,
            DnsRecordValue::TXT(_) => DnsRecordType::TXT,
            DnsRecordValue::NS(_) => DnsRecordType::NS,
            DnsRecordValue::SOA { .. } => DnsRecordType::SOA,
            DnsRecordValue::CAA { .. } => DnsRecordType::CAA,
            DnsRecordValue::RRSIG { .. } => DnsRecordType::RRSIG,
            DnsRecordValue::DNSKEY { .. } => DnsRecordType::DNSKEY,
            DnsRecordValue::NSEC { .. } => DnsRecordType::NSEC,
            DnsRecordValue::DS { .. } => DnsRecordType::DS,
        }
    }

    /// RDATA in zone-file presentation format
    pub fn to_presentation(&self, priority: Option<u16>) -> String {
        match self {
            DnsRecordValue::A(ip) => ip.to_string(),
            DnsRecordValue::AAAA(ip) => ip.to_string(),
            DnsRecordValue::CNAME(name) => absolute(name),
            DnsRecordValue::MX { exchange } => {
                format!("{} {}", priority.unwrap_or(10), absolute(exchange))
            }
            DnsRecordValue::TXT(text) => format!("\"{}\"", text.replace('"', "\\\"")),
            DnsRecordValue::NS(name) => absolute(name),
            DnsRecordValue::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            } => format!(
                "{} {} {} {} {} {} {}",
                absolute(mname),
                absolute(rname),
                serial,
                refresh,
                retry,
                expire,
                minimum
            ),
            DnsRecordValue::CAA { flags, tag, value } => {
                format!("{} {} \"{}\"", flags, tag, value)
            }
            DnsRecordValue::RRSIG {
                type_covered,
                algorithm,
                labels,
                original_ttl,
                expiration,
                inception,
                key_tag,
                signer_name,
                signature,
            } => format!(
                "{} {} {} {} {} {} {} {} {}",
                type_covered,
                algorithm,
                labels,
                original_ttl,
                signature_time(*expiration),
                signature_time(*inception),
                key_tag,
                absolute(signer_name),
                BASE64.encode(signature)
            ),
            DnsRecordValue::DNSKEY {
                flags,
                protocol,
                algorithm,
                public_key,
            } => format!(
                "{} {} {} {}",
                flags,
                protocol,
                algorithm,
                BASE64.encode(public_key)
            ),
            DnsRecordValue::NSEC { next_domain, types } => {
                let types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
                format!("{} {}", absolute(next_domain), types.join(" "))
            }
            DnsRecordValue::DS {
                key_tag,
                algorithm,
                digest_type,
                digest,
            } => format!(
                "{} {} {} {}",
                key_tag,
                algorithm,
                digest_type,
                hex::encode(digest).to_uppercase()
            ),
        }
    }
}

/// A DNS record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsRecord {
    /// Record name (e.g., "www" or "@" for the apex)
    pub name: String,
    pub record_type: DnsRecordType,
    /// Time to live in seconds
    pub ttl: u32,
    pub value: DnsRecordValue,
    /// Preference (for MX records)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
}

impl DnsRecord {
    pub fn new(name: impl Into<String>, ttl: u32, value: DnsRecordValue) -> Self {
        Self {
            name: name.into(),
            record_type: value.record_type(),
            ttl,
            value,
            priority: None,
        }
    }

    pub fn a(name: impl Into<String>, ip: Ipv4Addr, ttl: u32) -> Self {
        Self::new(name, ttl, DnsRecordValue::A(ip))
    }

    pub fn aaaa(name: impl Into<String>, ip: Ipv6Addr, ttl: u32) -> Self {
        Self::new(name, ttl, DnsRecordValue::AAAA(ip))
    }

    pub fn mx(name: impl Into<String>, exchange: impl Into<String>, priority: u16, ttl: u32) -> Self {
        let mut record = Self::new(
            name,
            ttl,
            DnsRecordValue::MX {
                exchange: exchange.into(),
            },
        );
        record.priority = Some(priority);
        record
    }

    pub fn ns(name: impl Into<String>, nameserver: impl Into<String>, ttl: u32) -> Self {
        Self::new(name, ttl, DnsRecordValue::NS(nameserver.into()))
    }

    pub fn caa_issue(name: impl Into<String>, issuer: impl Into<String>, ttl: u32) -> Self {
        Self::new(
            name,
            ttl,
            DnsRecordValue::CAA {
                flags: 0,
                tag: "issue".to_string(),
                value: issuer.into(),
            },
        )
    }

    /// Get the fully qualified domain name for this record
    pub fn fqdn(&self, zone_domain: &str) -> String {
        if self.name == "@" || self.name.is_empty() {
            zone_domain.to_string()
        } else if self.name.ends_with(&format!(".{}", zone_domain)) || self.name == zone_domain {
            self.name.clone()
        } else {
            format!("{}.{}", self.name, zone_domain)
        }
    }

    /// One zone-file line with an absolute owner name
    pub fn to_zone_line(&self, zone_domain: &str) -> String {
        format!(
            "{}\t{}\tIN\t{}\t{}",
            absolute(&self.fqdn(zone_domain)),
            self.ttl,
            self.record_type,
            self.value.to_presentation(self.priority)
        )
    }
}

/// Append the root label if missing
fn absolute(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// RRSIG timestamps are presented as YYYYMMDDHHmmSS (RFC 4034 section 3.2)
fn signature_time(secs: u32) -> String {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .map(|t| t.format("%Y%m%d%H%M%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_type_parsing() {
        assert_eq!(DnsRecordType::from_str("A").unwrap(), DnsRecordType::A);
        assert_eq!(DnsRecordType::from_str("a").unwrap(), DnsRecordType::A);
        assert_eq!(DnsRecordType::from_str("dnskey").unwrap(), DnsRecordType::DNSKEY);
        assert!(DnsRecordType::from_str("invalid").is_err());
    }

    #[test]
    fn test_record_type_codes() {
        assert_eq!(DnsRecordType::A.code(), 1);
        assert_eq!(DnsRecordType::SOA.code(), 6);
        assert_eq!(DnsRecordType::AAAA.code(), 28);
        assert_eq!(DnsRecordType::RRSIG.code(), 46);
        assert_eq!(DnsRecordType::DNSKEY.code(), 48);
        assert_eq!(DnsRecordType::CAA.code(), 257);
    }

    #[test]
    fn test_mx_record_creation() {
        let record = DnsRecord::mx("@", "mail.example.com", 10, 300);

        assert_eq!(record.record_type, DnsRecordType::MX);
        assert_eq!(record.priority, Some(10));
        assert_eq!(
            record.to_zone_line("example.com"),
            "example.com.\t300\tIN\tMX\t10 mail.example.com."
        );
    }

    #[test]
    fn test_fqdn() {
        let record = DnsRecord::a("www", "192.168.1.1".parse().unwrap(), 300);
        assert_eq!(record.fqdn("example.com"), "www.example.com");

        let root_record = DnsRecord::a("@", "192.168.1.1".parse().unwrap(), 300);
        assert_eq!(root_record.fqdn("example.com"), "example.com");

        let absolute_record = DnsRecord::a("www.example.com", "192.168.1.1".parse().unwrap(), 300);
        assert_eq!(absolute_record.fqdn("example.com"), "www.example.com");
    }

    #[test]
    fn test_soa_presentation() {
        let soa = DnsRecordValue::SOA {
            mname: "ns1.example.com".to_string(),
            rname: "hostmaster.example.com".to_string(),
            serial: 2024010101,
            refresh: 3600,
            retry: 600,
            expire: 604800,
            minimum: 300,
        };

        assert_eq!(soa.record_type(), DnsRecordType::SOA);
        assert_eq!(
            soa.to_presentation(None),
            "ns1.example.com. hostmaster.example.com. 2024010101 3600 600 604800 300"
        );
    }

    #[test]
    fn test_caa_and_txt_presentation() {
        let caa = DnsRecord::caa_issue("@", "letsencrypt.org", 3600);
        assert_eq!(caa.value.to_presentation(None), "0 issue \"letsencrypt.org\"");

        let txt = DnsRecordValue::TXT("say \"hi\"".to_string());
        assert_eq!(txt.to_presentation(None), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn test_signature_time_format() {
        assert_eq!(signature_time(0), "19700101000000");
        assert_eq!(signature_time(86400 + 3661), "19700102010101");
    }
}

//! Authoritative zone synthesis
//!
//! ## Components
//!
//! - `dns_types`: record types and their zone-file presentation
//! - `dnssec_keys`: KSK/ZSK generation, storage and DNSKEY/DS derivation
//! - `dnssec`: RRset canonicalisation, RRSIG and NSEC generation
//! - `zone_synth`: per-domain zone assembly, signing and publication

pub mod dns_types;
pub mod dnssec;
pub mod dnssec_keys;
pub mod zone_synth;

pub use dns_types::*;
pub use zone_synth::{SignReason, ZoneBuild, ZonePlan, ZoneSynthesizer};

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::dns::challenge::Dns01Solver;
use crate::dns::whois::Whois;
use crate::types::Result;
use crate::utils::NetUtils;

/// ACME challenge record name prefix
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// TTL for challenge records (seconds)
pub const CHALLENGE_TTL: u32 = 60;

/// TTL for address records managed by dynamic DNS (seconds)
pub const ADDRESS_TTL: u32 = 300;

/// A DNS record as exchanged with providers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(default)]
    pub id: String,
    /// Name relative to the zone; `@` for the apex
    pub hostname: String,
    pub ttl: u32,
    #[serde(rename = "type")]
    pub record_type: String,
    #[serde(default)]
    pub priority: Option<u16>,
    pub value: String,
}

impl DnsRecord {
    pub fn txt(hostname: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            ttl: CHALLENGE_TTL,
            record_type: "TXT".into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn address(hostname: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            hostname: hostname.into(),
            ttl: ADDRESS_TTL,
            record_type: NetUtils::record_type(&ip).into(),
            value: ip.to_string(),
            ..Default::default()
        }
    }

    /// Same name, type and value (ids and TTL ignored)
    pub fn same_content(&self, other: &DnsRecord) -> bool {
        self.hostname.eq_ignore_ascii_case(&other.hostname)
            && self.record_type.eq_ignore_ascii_case(&other.record_type)
            && self.value.trim_matches('"') == other.value.trim_matches('"')
    }
}

/// API client for one DNS provider account
#[async_trait]
pub trait DnsProviderClient: Send + Sync {
    /// Externally reachable address of this host
    async fn get_public_ip(&self) -> Result<IpAddr>;

    /// All records of `zone`
    async fn get_records(&self, zone: &str) -> Result<Vec<DnsRecord>>;

    /// Create a record; returns it with its provider id
    async fn create_record(&self, zone: &str, record: DnsRecord) -> Result<DnsRecord>;

    /// Remove a record. Removing a missing record succeeds.
    async fn remove_record(&self, zone: &str, record_id: &str) -> Result<()>;
}

/// A pluggable DNS provider
pub trait DnsProvider: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Whether this provider serves the domain described by `whois`
    fn detect(&self, whois: &Whois) -> bool;

    /// Client using the configured credentials
    fn new_client(&self) -> Result<Arc<dyn DnsProviderClient>>;

    /// Install a client authenticated with `token` as the solver's DNS-01 backend
    fn register_challenge(&self, solver: &mut Dns01Solver, token: &str) -> Result<()>;
}

impl fmt::Debug for dyn DnsProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsProvider").field("name", &self.name()).finish()
    }
}

/// Strip a leading wildcard label
pub fn normalize_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// Name of `fqdn` relative to `zone`; `@` for the apex
pub fn relative_name(fqdn: &str, zone: &str) -> String {
    let fqdn = fqdn.trim_end_matches('.');
    let zone = zone.trim_end_matches('.');
    if fqdn.eq_ignore_ascii_case(zone) {
        "@".to_string()
    } else if let Some(stripped) = fqdn.strip_suffix(&format!(".{}", zone)) {
        stripped.to_string()
    } else {
        fqdn.to_string()
    }
}

/// Challenge record name for `domain`, relative to `zone`
pub fn challenge_hostname(domain: &str, zone: &str) -> String {
    match relative_name(normalize_domain(domain), zone).as_str() {
        "@" => ACME_CHALLENGE_RECORD.to_string(),
        sub => format!("{}.{}", ACME_CHALLENGE_RECORD, sub),
    }
}

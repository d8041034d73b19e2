use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::dns::challenge::Dns01Solver;
use crate::dns::provider::{DnsProvider, DnsProviderClient, DnsRecord};
use crate::dns::whois::Whois;
use crate::error::Error;
use crate::types::Result;

/// Record table held in process memory
pub struct MemoryDnsClient {
    public_ip: RwLock<IpAddr>,
    zones: RwLock<HashMap<String, Vec<DnsRecord>>>,
    next_id: AtomicU64,
    hidden: AtomicBool,
    failing_removals: AtomicU32,
}

impl MemoryDnsClient {
    pub fn new(public_ip: IpAddr) -> Self {
        Self {
            public_ip: RwLock::new(public_ip),
            zones: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            hidden: AtomicBool::new(false),
            failing_removals: AtomicU32::new(0),
        }
    }

    pub fn set_public_ip(&self, ip: IpAddr) {
        *self.public_ip.write() = ip;
    }

    /// While hidden, `get_records` reports empty zones (records not yet propagated)
    pub fn set_hidden(&self, hidden: bool) {
        self.hidden.store(hidden, Ordering::SeqCst);
    }

    /// Make the next `count` removals fail with a transient error
    pub fn fail_next_removals(&self, count: u32) {
        self.failing_removals.store(count, Ordering::SeqCst);
    }

    /// Records of `zone` regardless of visibility
    pub fn records(&self, zone: &str) -> Vec<DnsRecord> {
        self.zones.read().get(zone).cloned().unwrap_or_default()
    }

    /// Number of TXT records whose name starts with the ACME challenge label
    pub fn challenge_record_count(&self) -> usize {
        self.zones
            .read()
            .values()
            .flatten()
            .filter(|r| {
                r.record_type == "TXT"
                    && r.hostname.starts_with(crate::dns::provider::ACME_CHALLENGE_RECORD)
            })
            .count()
    }
}

#[async_trait]
impl DnsProviderClient for MemoryDnsClient {
    async fn get_public_ip(&self) -> Result<IpAddr> {
        Ok(*self.public_ip.read())
    }

    async fn get_records(&self, zone: &str) -> Result<Vec<DnsRecord>> {
        if self.hidden.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        Ok(self.records(zone))
    }

    async fn create_record(&self, zone: &str, mut record: DnsRecord) -> Result<DnsRecord> {
        record.id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        debug!(zone, id = %record.id, hostname = %record.hostname, "Memory record created");
        self.zones
            .write()
            .entry(zone.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn remove_record(&self, zone: &str, record_id: &str) -> Result<()> {
        let failing = self
            .failing_removals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(Error::DnsProvider("injected removal failure".into()));
        }

        if let Some(records) = self.zones.write().get_mut(zone) {
            records.retain(|r| r.id != record_id);
        }
        Ok(())
    }
}

/// Provider serving zones from a [`MemoryDnsClient`]
pub struct MemoryDnsProvider {
    name: String,
    nameservers: Vec<String>,
    client: Arc<MemoryDnsClient>,
}

impl MemoryDnsProvider {
    pub fn new(name: impl Into<String>, nameservers: Vec<String>, client: Arc<MemoryDnsClient>) -> Self {
        Self {
            name: name.into(),
            nameservers,
            client,
        }
    }

    pub fn client(&self) -> Arc<MemoryDnsClient> {
        self.client.clone()
    }
}

impl DnsProvider for MemoryDnsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, whois: &Whois) -> bool {
        self.nameservers
            .iter()
            .any(|pattern| whois.has_nameserver_matching(pattern))
    }

    fn new_client(&self) -> Result<Arc<dyn DnsProviderClient>> {
        Ok(self.client.clone())
    }

    fn register_challenge(&self, solver: &mut Dns01Solver, _token: &str) -> Result<()> {
        solver.install(&self.name, self.client.clone());
        Ok(())
    }
}

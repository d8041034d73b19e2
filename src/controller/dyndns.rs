use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dns::provider::{relative_name, DnsProviderClient, DnsRecord};
use crate::dns::{DnsProviderRegistry, WhoisService};
use crate::repository::CertificateRepository;
use crate::types::Result;
use crate::utils::NetUtils;

/// Keeps address records of managed zones pointed at this host
pub struct DynDnsService {
    repository: Arc<CertificateRepository>,
    providers: Arc<DnsProviderRegistry>,
    whois: Arc<dyn WhoisService>,
}

impl DynDnsService {
    pub fn new(
        repository: Arc<CertificateRepository>,
        providers: Arc<DnsProviderRegistry>,
        whois: Arc<dyn WhoisService>,
    ) -> Self {
        Self {
            repository,
            providers,
            whois,
        }
    }

    /// Run [`DynDnsService::ensure_all_public`] every `interval` until cancelled
    pub fn start(
        self: Arc<Self>,
        interval: Duration,
        sub_domains: Vec<String>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        info!(interval_secs = interval.as_secs(), "Starting dynamic DNS sync");
        tokio::spawn(async move {
            let mut interval = time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(e) = self.ensure_all_public(&sub_domains).await {
                    warn!("Dynamic DNS sync failed: {}", e);
                }
            }
        })
    }

    /// Point `@` and each of `sub_domains` at the provider-reported public
    /// address, in every managed zone. Returns the number of records changed.
    ///
    /// A failing zone is logged and skipped.
    pub async fn ensure_all_public(&self, sub_domains: &[String]) -> Result<usize> {
        let zones = self.repository.list_zones("").await?;
        let mut changed = 0;
        for zone in zones {
            match self.ensure_zone_public(&zone.name, sub_domains).await {
                Ok(n) => changed += n,
                Err(e) => warn!(zone = %zone.name, error = %e, "Failed to update address records"),
            }
        }
        Ok(changed)
    }

    async fn ensure_zone_public(&self, zone: &str, sub_domains: &[String]) -> Result<usize> {
        let whois = self.whois.lookup(zone).await?;
        let provider = self.providers.detect(&whois)?;
        let client = provider.new_client()?;

        let ip = client.get_public_ip().await?;
        if !NetUtils::is_public_ip(&ip) {
            warn!(zone, %ip, "Provider reported a non-public address");
        }
        ensure_custom(client.as_ref(), zone, sub_domains, ip).await
    }
}

/// Make `@` and each of `sub_domains` in `zone` resolve to `ip`.
///
/// Stale records of the same type are replaced. Returns the number of records created.
pub async fn ensure_custom(
    client: &dyn DnsProviderClient,
    zone: &str,
    sub_domains: &[String],
    ip: IpAddr,
) -> Result<usize> {
    let existing = client.get_records(zone).await?;

    let mut hostnames = vec!["@".to_string()];
    for sub in sub_domains {
        let name = relative_name(sub, zone);
        if !hostnames.contains(&name) {
            hostnames.push(name);
        }
    }

    let mut created = 0;
    for hostname in hostnames {
        let wanted = DnsRecord::address(hostname.clone(), ip);
        let same_type: Vec<&DnsRecord> = existing
            .iter()
            .filter(|r| r.hostname.eq_ignore_ascii_case(&hostname) && r.record_type == wanted.record_type)
            .collect();

        if same_type.iter().any(|r| r.value == wanted.value) {
            debug!(zone, hostname = %hostname, "Address record up to date");
            continue;
        }

        for stale in same_type {
            info!(zone, hostname = %hostname, old = %stale.value, "Removing stale address record");
            client.remove_record(zone, &stale.id).await?;
        }

        info!(zone, hostname = %hostname, %ip, "Creating address record");
        client.create_record(zone, wanted).await?;
        created += 1;
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::providers::{MemoryDnsClient, MemoryDnsProvider};
    use crate::dns::{StaticWhois, Whois};
    use crate::repository::{IssuanceMode, MemoryStore, Zone};

    #[tokio::test]
    async fn test_ensure_custom_replaces_stale_records() {
        let client = MemoryDnsClient::new("203.0.113.5".parse().unwrap());
        client
            .create_record("example.test", DnsRecord::address("www", "198.51.100.1".parse().unwrap()))
            .await
            .unwrap();
        let subs = vec!["www.example.test".to_string()];
        let ip: IpAddr = "203.0.113.5".parse().unwrap();

        assert_eq!(ensure_custom(&client, "example.test", &subs, ip).await.unwrap(), 2);
        // idempotent
        assert_eq!(ensure_custom(&client, "example.test", &subs, ip).await.unwrap(), 0);

        let records = client.records("example.test");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.value == "203.0.113.5" && r.record_type == "A"));
    }

    #[tokio::test]
    async fn test_ensure_all_public() {
        let client = Arc::new(MemoryDnsClient::new("2001:db8::5".parse().unwrap()));
        let mut providers = DnsProviderRegistry::new();
        providers
            .register(Arc::new(MemoryDnsProvider::new(
                "memory",
                vec!["ns.memory.test".into()],
                client.clone(),
            )))
            .unwrap();
        let whois = StaticWhois::new(vec![Whois {
            domain: "example.test".into(),
            nserver: vec!["ns.memory.test".into()],
            ..Default::default()
        }]);

        let repository = Arc::new(CertificateRepository::new(Arc::new(MemoryStore::new())));
        repository
            .save_zone(&Zone::new("example.test", IssuanceMode::Acme { email: None }))
            .await
            .unwrap();
        repository
            .save_zone(&Zone::new("unknown.test", IssuanceMode::Acme { email: None }))
            .await
            .unwrap();

        let service = DynDnsService::new(repository, Arc::new(providers), Arc::new(whois));
        let changed = service.ensure_all_public(&["api".to_string()]).await.unwrap();
        assert_eq!(changed, 2);

        let records = client.records("example.test");
        assert!(records.iter().all(|r| r.record_type == "AAAA"));
        assert!(records.iter().any(|r| r.hostname == "api"));
    }
}

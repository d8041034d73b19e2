use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dns::provider::{challenge_hostname, DnsProviderClient, DnsRecord};
use crate::error::Error;
use crate::types::Result;
use crate::utils::Backoff;

/// A challenge TXT record this solver tried to create
#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    pub zone: String,
    pub domain: String,
    pub record: DnsRecord,
    /// Provider id, set once the provider confirmed creation
    pub id: Option<String>,
}

/// DNS-01 challenge publisher backed by a provider client.
///
/// Every record is tracked before the provider call that creates it, so
/// [`Dns01Solver::cleanup`] also finds records whose creation was interrupted.
#[derive(Default)]
pub struct Dns01Solver {
    provider: Option<String>,
    client: Option<Arc<dyn DnsProviderClient>>,
    records: Vec<ChallengeRecord>,
}

impl Dns01Solver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend used to publish records
    pub fn install(&mut self, provider: &str, client: Arc<dyn DnsProviderClient>) {
        debug!(provider, "DNS-01 backend installed");
        self.provider = Some(provider.to_string());
        self.client = Some(client);
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    fn client(&self) -> Result<Arc<dyn DnsProviderClient>> {
        self.client
            .clone()
            .ok_or_else(|| Error::Internal("No DNS-01 backend registered".into()))
    }

    /// Records tracked by this solver
    pub fn records(&self) -> &[ChallengeRecord] {
        &self.records
    }

    /// Records the provider confirmed
    pub fn published_count(&self) -> usize {
        self.records.iter().filter(|r| r.id.is_some()).count()
    }

    /// Publish the TXT record for `domain` with the DNS-01 `value`
    pub async fn present(&mut self, zone: &str, domain: &str, value: &str) -> Result<()> {
        let client = self.client()?;
        let record = DnsRecord::txt(challenge_hostname(domain, zone), value);

        info!(zone, domain, hostname = %record.hostname, "Publishing DNS-01 challenge record");

        self.records.push(ChallengeRecord {
            zone: zone.to_string(),
            domain: domain.to_string(),
            record: record.clone(),
            id: None,
        });
        let index = self.records.len() - 1;

        let created = client.create_record(zone, record).await?;
        self.records[index].id = Some(created.id);
        Ok(())
    }

    /// Poll the provider until every published record is visible
    pub async fn wait_for_propagation(&self, backoff: &Backoff, cancel: &CancellationToken) -> Result<()> {
        let client = self.client()?;
        let mut timer = backoff.start();

        loop {
            match self.all_visible(client.as_ref()).await {
                Ok(true) => {
                    debug!(attempts = timer.attempts(), "Challenge records visible");
                    return Ok(());
                }
                Ok(false) => debug!("Challenge records not yet visible"),
                Err(e) if e.is_transient() => warn!(error = %e, "Propagation check failed"),
                Err(e) => return Err(e),
            }

            timer.wait(cancel).await.map_err(|e| match e {
                Error::Timeout(_) => Error::Timeout("DNS propagation of challenge records".into()),
                other => other,
            })?;
        }
    }

    async fn all_visible(&self, client: &dyn DnsProviderClient) -> Result<bool> {
        for (zone, wanted) in self.by_zone() {
            let existing = client.get_records(&zone).await?;
            let visible = wanted
                .iter()
                .all(|w| existing.iter().any(|r| r.same_content(&w.record)));
            if !visible {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn by_zone(&self) -> HashMap<String, Vec<&ChallengeRecord>> {
        let mut zones: HashMap<String, Vec<&ChallengeRecord>> = HashMap::new();
        for record in &self.records {
            zones.entry(record.zone.clone()).or_default().push(record);
        }
        zones
    }

    /// Remove every tracked record, retrying transient failures.
    ///
    /// Runs to completion regardless of caller cancellation. Returns the number
    /// of records that could not be removed.
    pub async fn cleanup(&mut self, backoff: &Backoff) -> usize {
        if self.records.is_empty() {
            return 0;
        }
        let client = match self.client() {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Cannot clean up challenge records");
                return self.records.len();
            }
        };
        let never = CancellationToken::new();

        // Records whose creation was never confirmed are looked up by content.
        let mut unconfirmed = Vec::new();
        for record in &self.records {
            if record.id.is_none() {
                unconfirmed.push(record.clone());
            }
        }
        for pending in unconfirmed {
            let found = backoff
                .retry("list challenge records", &never, || {
                    let client = client.clone();
                    let zone = pending.zone.clone();
                    async move { client.get_records(&zone).await }
                })
                .await;
            match found {
                Ok(existing) => {
                    let id = existing
                        .iter()
                        .find(|r| r.same_content(&pending.record))
                        .map(|r| r.id.clone());
                    for record in self.records.iter_mut() {
                        if record.zone == pending.zone && record.id.is_none() && record.record == pending.record {
                            record.id = id.clone();
                        }
                    }
                }
                Err(e) => warn!(zone = %pending.zone, error = %e, "Failed to list records for cleanup"),
            }
        }

        let mut failed = 0;
        let mut remaining = Vec::new();
        for record in self.records.drain(..) {
            let Some(id) = record.id.clone() else {
                // never reached the provider
                continue;
            };
            let result = backoff
                .retry("remove challenge record", &never, || {
                    let client = client.clone();
                    let zone = record.zone.clone();
                    let id = id.clone();
                    async move { client.remove_record(&zone, &id).await }
                })
                .await;
            match result {
                Ok(()) => debug!(zone = %record.zone, record_id = %id, "Challenge record removed"),
                Err(e) => {
                    warn!(zone = %record.zone, record_id = %id, error = %e, "Failed to remove challenge record");
                    failed += 1;
                    remaining.push(record);
                }
            }
        }
        self.records = remaining;

        if failed == 0 {
            info!("Challenge records cleaned up");
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::providers::memory::MemoryDnsClient;
    use std::time::Duration;

    fn fast() -> Backoff {
        Backoff::new(
            Duration::from_millis(1),
            Duration::from_millis(5),
            2,
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_present_and_cleanup() {
        let client = Arc::new(MemoryDnsClient::new("203.0.113.7".parse().unwrap()));
        let mut solver = Dns01Solver::new();
        solver.install("memory", client.clone());

        solver.present("example.test", "example.test", "v1").await.unwrap();
        solver.present("example.test", "www.example.test", "v2").await.unwrap();
        assert_eq!(solver.published_count(), 2);
        assert_eq!(client.get_records("example.test").await.unwrap().len(), 2);

        solver
            .wait_for_propagation(&fast(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(solver.cleanup(&fast()).await, 0);
        assert!(client.get_records("example.test").await.unwrap().is_empty());
        assert!(solver.records().is_empty());
    }

    #[tokio::test]
    async fn test_propagation_times_out() {
        let client = Arc::new(MemoryDnsClient::new("203.0.113.7".parse().unwrap()));
        client.set_hidden(true);
        let mut solver = Dns01Solver::new();
        solver.install("memory", client.clone());
        solver.present("example.test", "example.test", "v1").await.unwrap();

        let err = solver
            .wait_for_propagation(&fast(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));

        client.set_hidden(false);
        assert_eq!(solver.cleanup(&fast()).await, 0);
        assert!(client.get_records("example.test").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_present_without_backend_fails() {
        let mut solver = Dns01Solver::new();
        assert!(solver.present("example.test", "example.test", "v").await.is_err());
        assert_eq!(solver.cleanup(&fast()).await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_finds_unconfirmed_records() {
        let client = Arc::new(MemoryDnsClient::new("203.0.113.7".parse().unwrap()));
        let mut solver = Dns01Solver::new();
        solver.install("memory", client.clone());

        // created at the provider but the response was lost
        let record = DnsRecord::txt("_acme-challenge", "lost");
        client.create_record("example.test", record.clone()).await.unwrap();
        solver.records.push(ChallengeRecord {
            zone: "example.test".into(),
            domain: "example.test".into(),
            record,
            id: None,
        });

        assert_eq!(solver.cleanup(&fast()).await, 0);
        assert!(client.get_records("example.test").await.unwrap().is_empty());
    }
}

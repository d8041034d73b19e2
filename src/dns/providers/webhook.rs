//! Generic webhook DNS provider
//!
//! ```text
//! GET    {url}/public-ip                    -> {"ip": "203.0.113.7"}
//! GET    {url}/zones/{zone}/records         -> {"records": [DnsRecord, ...]}
//! POST   {url}/zones/{zone}/records         <- DnsRecord, -> DnsRecord with id
//! DELETE {url}/zones/{zone}/records/{id}    -> 200, 204 or 404
//! ```
//!
//! Requests carry `Authorization: Bearer <token>` when a token is configured.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::dns::challenge::Dns01Solver;
use crate::dns::provider::{DnsProvider, DnsProviderClient, DnsRecord};
use crate::dns::whois::Whois;
use crate::error::Error;
use crate::types::Result;

/// Webhook DNS provider for custom integrations
pub struct WebhookProvider {
    name: String,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    nameservers: Vec<String>,
}

impl WebhookProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
        nameservers: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            token,
            timeout,
            nameservers,
        }
    }
}

impl DnsProvider for WebhookProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, whois: &Whois) -> bool {
        self.nameservers
            .iter()
            .any(|pattern| whois.has_nameserver_matching(pattern))
    }

    fn new_client(&self) -> Result<Arc<dyn DnsProviderClient>> {
        Ok(Arc::new(WebhookClient::new(
            &self.base_url,
            self.token.clone(),
            self.timeout,
        )?))
    }

    fn register_challenge(&self, solver: &mut Dns01Solver, token: &str) -> Result<()> {
        let token = if token.is_empty() {
            self.token.clone()
        } else {
            Some(token.to_string())
        };
        let client = WebhookClient::new(&self.base_url, token, self.timeout)?;
        solver.install(&self.name, Arc::new(client));
        Ok(())
    }
}

/// HTTP client for the webhook API
pub struct WebhookClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl WebhookClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        url::Url::parse(base_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) if !token.is_empty() => builder.bearer_auth(token),
            _ => builder,
        }
    }

    fn records_url(&self, zone: &str) -> String {
        format!("{}/zones/{}/records", self.base_url, zone)
    }
}

fn request_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("DNS webhook: {}", err))
    } else {
        Error::DnsProvider(format!("DNS webhook: {}", err))
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Error::DnsProvider(format!("Failed to {}: HTTP {} - {}", what, status, body))
    } else {
        Error::InvalidRequest(format!("Failed to {}: HTTP {} - {}", what, status, body))
    })
}

#[derive(Debug, Deserialize)]
struct PublicIpResponse {
    ip: IpAddr,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    records: Vec<DnsRecord>,
}

#[async_trait]
impl DnsProviderClient for WebhookClient {
    async fn get_public_ip(&self) -> Result<IpAddr> {
        let response = self
            .authorized(self.client.get(format!("{}/public-ip", self.base_url)))
            .send()
            .await
            .map_err(request_error)?;
        let body: PublicIpResponse = check_status(response, "query public address")
            .await?
            .json()
            .await
            .map_err(request_error)?;
        Ok(body.ip)
    }

    async fn get_records(&self, zone: &str) -> Result<Vec<DnsRecord>> {
        let response = self
            .authorized(self.client.get(self.records_url(zone)))
            .send()
            .await
            .map_err(request_error)?;
        let body: RecordsResponse = check_status(response, "list records")
            .await?
            .json()
            .await
            .map_err(request_error)?;
        Ok(body.records)
    }

    async fn create_record(&self, zone: &str, record: DnsRecord) -> Result<DnsRecord> {
        debug!(zone, hostname = %record.hostname, "Creating webhook record");
        let response = self
            .authorized(self.client.post(self.records_url(zone)))
            .json(&record)
            .send()
            .await
            .map_err(request_error)?;
        let created: DnsRecord = check_status(response, "create record")
            .await?
            .json()
            .await
            .map_err(request_error)?;
        if created.id.is_empty() {
            return Err(Error::DnsProvider("Webhook returned a record without id".into()));
        }
        Ok(created)
    }

    async fn remove_record(&self, zone: &str, record_id: &str) -> Result<()> {
        let response = self
            .authorized(
                self.client
                    .delete(format!("{}/{}", self.records_url(zone), record_id)),
            )
            .send()
            .await
            .map_err(request_error)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, "delete record").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(WebhookClient::new("not a url", None, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_records_url() {
        let client =
            WebhookClient::new("https://dns.internal.test/api/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.records_url("example.test"),
            "https://dns.internal.test/api/zones/example.test/records"
        );
    }

    #[test]
    fn test_detection_requires_patterns() {
        let whois = Whois {
            domain: "example.test".into(),
            nserver: vec!["ns1.internal.test".into()],
            ..Default::default()
        };
        let none = WebhookProvider::new("hook", "https://h.test", None, Duration::from_secs(1), vec![]);
        let some = WebhookProvider::new(
            "hook",
            "https://h.test",
            None,
            Duration::from_secs(1),
            vec!["internal.test".into()],
        );
        assert!(!none.detect(&whois));
        assert!(some.detect(&whois));
    }
}

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::dns::challenge::Dns01Solver;
use crate::dns::provider::{DnsProvider, DnsProviderClient, DnsRecord};
use crate::dns::whois::Whois;
use crate::error::Error;
use crate::types::Result;

/// Hetzner DNS API base URL
pub const HETZNER_API_BASE: &str = "https://dns.hetzner.com/api/v1";

/// Plain-text echo of the caller's address
pub const PUBLIC_IP_URL: &str = "https://api64.ipify.org";

/// Name server substrings of Hetzner-hosted zones
pub const HETZNER_NAMESERVERS: &[&str] = &["hetzner.com", "your-server.de", "hetzner-dns"];

/// Hetzner DNS provider
pub struct HetznerProvider {
    name: String,
    token: String,
    api_base: String,
    timeout: Duration,
    extra_nameservers: Vec<String>,
}

impl HetznerProvider {
    pub fn new(
        name: impl Into<String>,
        token: impl Into<String>,
        api_base: Option<String>,
        timeout: Duration,
        extra_nameservers: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            token: token.into(),
            api_base: api_base.unwrap_or_else(|| HETZNER_API_BASE.to_string()),
            timeout,
            extra_nameservers,
        }
    }

    fn client_with_token(&self, token: &str) -> Result<HetznerClient> {
        HetznerClient::new(token, &self.api_base, self.timeout)
    }
}

impl DnsProvider for HetznerProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn detect(&self, whois: &Whois) -> bool {
        HETZNER_NAMESERVERS
            .iter()
            .copied()
            .chain(self.extra_nameservers.iter().map(String::as_str))
            .any(|pattern| whois.has_nameserver_matching(pattern))
    }

    fn new_client(&self) -> Result<Arc<dyn DnsProviderClient>> {
        Ok(Arc::new(self.client_with_token(&self.token)?))
    }

    fn register_challenge(&self, solver: &mut Dns01Solver, token: &str) -> Result<()> {
        let token = if token.is_empty() { &self.token } else { token };
        solver.install(&self.name, Arc::new(self.client_with_token(token)?));
        Ok(())
    }
}

/// Hetzner DNS API client
pub struct HetznerClient {
    client: Client,
    token: String,
    api_base: String,
    /// Cache of zone name -> zone id
    zone_cache: RwLock<HashMap<String, String>>,
}

impl HetznerClient {
    pub fn new(token: &str, api_base: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            token: token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            zone_cache: RwLock::new(HashMap::new()),
        })
    }

    async fn zone_id(&self, zone: &str) -> Result<String> {
        if let Some(id) = self.zone_cache.read().get(zone) {
            trace!(zone, zone_id = %id, "Zone ID found in cache");
            return Ok(id.clone());
        }

        let response = self
            .client
            .get(format!("{}/zones", self.api_base))
            .query(&[("name", zone)])
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(request_error)?;
        let zones: ZonesResponse = check_status(response, "list zones").await?.json().await.map_err(request_error)?;

        let found = zones
            .zones
            .into_iter()
            .find(|z| z.name.eq_ignore_ascii_case(zone))
            .ok_or_else(|| Error::NotFound(format!("Hetzner zone '{}'", zone)))?;

        debug!(zone, zone_id = %found.id, "Resolved Hetzner zone");
        self.zone_cache.write().insert(zone.to_string(), found.id.clone());
        Ok(found.id)
    }
}

fn request_error(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("Hetzner API: {}", err))
    } else {
        Error::DnsProvider(format!("Hetzner API: {}", err))
    }
}

async fn check_status(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Error::Config(format!("Hetzner API rejected the token ({}): {}", what, body))
        }
        StatusCode::NOT_FOUND => Error::NotFound(format!("Hetzner {}: {}", what, body)),
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            Error::DnsProvider(format!("Failed to {}: HTTP {} - {}", what, s, body))
        }
        s => Error::InvalidRequest(format!("Failed to {}: HTTP {} - {}", what, s, body)),
    })
}

#[async_trait]
impl DnsProviderClient for HetznerClient {
    async fn get_public_ip(&self) -> Result<IpAddr> {
        let response = self.client.get(PUBLIC_IP_URL).send().await.map_err(request_error)?;
        let body = check_status(response, "query public address").await?.text().await.map_err(request_error)?;
        body.trim()
            .parse()
            .map_err(|e| Error::DnsProvider(format!("Invalid public address '{}': {}", body.trim(), e)))
    }

    async fn get_records(&self, zone: &str) -> Result<Vec<DnsRecord>> {
        let zone_id = self.zone_id(zone).await?;
        let response = self
            .client
            .get(format!("{}/records", self.api_base))
            .query(&[("zone_id", zone_id.as_str())])
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(request_error)?;
        let records: RecordsResponse = check_status(response, "list records").await?.json().await.map_err(request_error)?;

        Ok(records.records.into_iter().map(DnsRecord::from).collect())
    }

    async fn create_record(&self, zone: &str, record: DnsRecord) -> Result<DnsRecord> {
        let zone_id = self.zone_id(zone).await?;
        debug!(zone, hostname = %record.hostname, record_type = %record.record_type, "Creating Hetzner record");

        let request = CreateRecordRequest {
            zone_id,
            name: record.hostname.clone(),
            r#type: record.record_type.clone(),
            value: record.value.clone(),
            ttl: Some(record.ttl),
        };
        let response = self
            .client
            .post(format!("{}/records", self.api_base))
            .header("Auth-API-Token", &self.token)
            .json(&request)
            .send()
            .await
            .map_err(request_error)?;
        let created: RecordResponse = check_status(response, "create record").await?.json().await.map_err(request_error)?;

        Ok(DnsRecord {
            id: created.record.id,
            ..record
        })
    }

    async fn remove_record(&self, _zone: &str, record_id: &str) -> Result<()> {
        debug!(record_id, "Deleting Hetzner record");
        let response = self
            .client
            .delete(format!("{}/records/{}", self.api_base, record_id))
            .header("Auth-API-Token", &self.token)
            .send()
            .await
            .map_err(request_error)?;

        // already gone
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check_status(response, "delete record").await?;
        Ok(())
    }
}

// Hetzner API types

#[derive(Debug, Deserialize)]
struct ZonesResponse {
    zones: Vec<ApiZone>,
}

#[derive(Debug, Deserialize)]
struct ApiZone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    records: Vec<ApiRecord>,
}

#[derive(Debug, Deserialize)]
struct RecordResponse {
    record: ApiRecord,
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    record_type: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    ttl: Option<u32>,
}

impl From<ApiRecord> for DnsRecord {
    fn from(r: ApiRecord) -> Self {
        DnsRecord {
            id: r.id,
            hostname: r.name,
            ttl: r.ttl.unwrap_or(0),
            record_type: r.record_type,
            priority: None,
            value: r.value,
        }
    }
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest {
    zone_id: String,
    name: String,
    r#type: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> HetznerProvider {
        HetznerProvider::new("hetzner", "token", None, Duration::from_secs(5), vec!["ns.custom.test".into()])
    }

    fn whois(ns: &[&str]) -> Whois {
        Whois {
            domain: "example.test".into(),
            nserver: ns.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_detects_hetzner_nameservers() {
        let provider = provider();
        assert!(provider.detect(&whois(&["hydrogen.ns.hetzner.com"])));
        assert!(provider.detect(&whois(&["ns1.your-server.de"])));
        assert!(provider.detect(&whois(&["helium.ns.hetzner-dns.de"])));
        assert!(provider.detect(&whois(&["a.ns.custom.test"])));
        assert!(!provider.detect(&whois(&["ns1.cloudflare.com"])));
        assert!(!provider.detect(&whois(&[])));
    }

    #[test]
    fn test_api_record_conversion() {
        let json = r#"{"record":{"id":"r1","name":"_acme-challenge","type":"TXT","value":"abc","ttl":60,"zone_id":"z1"}}"#;
        let parsed: RecordResponse = serde_json::from_str(json).unwrap();
        let record = DnsRecord::from(parsed.record);
        assert_eq!(record.id, "r1");
        assert_eq!(record.hostname, "_acme-challenge");
        assert_eq!(record.record_type, "TXT");
        assert_eq!(record.ttl, 60);
    }

    #[test]
    fn test_create_request_shape() {
        let request = CreateRecordRequest {
            zone_id: "z1".into(),
            name: "_acme-challenge".into(),
            r#type: "TXT".into(),
            value: "abc".into(),
            ttl: Some(60),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["type"], "TXT");
        assert_eq!(json["zone_id"], "z1");
    }

    #[tokio::test]
    async fn test_register_challenge_installs_backend() {
        let mut solver = Dns01Solver::new();
        provider().register_challenge(&mut solver, "other-token").unwrap();
        assert_eq!(solver.provider_name(), Some("hetzner"));
    }
}

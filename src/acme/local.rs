use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use rcgen::{BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType, IsCa, KeyPair};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::acme::{AcmeDirectory, AcmeOrder, AcmeRegistration, DnsChallenge, OrderProgress};
use crate::dns::{
    challenge_hostname, normalize_domain, DnsProviderClient, DnsProviderRegistry, DnsRecord,
    WhoisService,
};
use crate::error::Error;
use crate::repository::{AcmeAccountBody, AcmeResource};
use crate::types::Result;

/// Lifetime of certificates issued by the local directory
const LOCAL_CERT_DAYS: i64 = 90;

/// Where challenge records are looked up
enum RecordSource {
    /// One fixed client for every zone
    Client(Arc<dyn DnsProviderClient>),
    /// The provider detected for the zone, as during issuance
    Detected {
        providers: Arc<DnsProviderRegistry>,
        whois: Arc<dyn WhoisService>,
    },
}

impl RecordSource {
    async fn records(&self, zone: &str) -> Result<Vec<DnsRecord>> {
        match self {
            RecordSource::Client(client) => client.get_records(zone).await,
            RecordSource::Detected { providers, whois } => {
                let whois = whois.lookup(zone).await?;
                let client = providers.detect(&whois)?.new_client()?;
                client.get_records(zone).await
            }
        }
    }
}

struct Inner {
    dns: RecordSource,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    reject: AtomicBool,
    orders: AtomicU64,
    accounts: Mutex<HashMap<String, String>>,
}

/// In-process ACME directory.
///
/// DNS-01 challenges are checked against a provider client; the zone of a
/// domain is taken to be its last two labels. Certificates are signed by a
/// throwaway root. Selected with `acme.directory_url: local`.
#[derive(Clone)]
pub struct LocalAcmeDirectory {
    inner: Arc<Inner>,
}

impl LocalAcmeDirectory {
    /// Directory checking every challenge against `dns`
    pub fn new(dns: Arc<dyn DnsProviderClient>) -> Result<Self> {
        Self::with_source(RecordSource::Client(dns))
    }

    /// Directory checking each challenge with the provider detected for its zone
    pub fn detecting(providers: Arc<DnsProviderRegistry>, whois: Arc<dyn WhoisService>) -> Result<Self> {
        Self::with_source(RecordSource::Detected { providers, whois })
    }

    fn with_source(dns: RecordSource) -> Result<Self> {
        let ca_key = KeyPair::generate()?;
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name.push(DnType::CommonName, "Local ACME Root");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = params.self_signed(&ca_key)?;

        Ok(Self {
            inner: Arc::new(Inner {
                dns,
                ca_cert,
                ca_key,
                reject: AtomicBool::new(false),
                orders: AtomicU64::new(0),
                accounts: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Fail every validation, regardless of DNS state
    pub fn reject_validation(&self, reject: bool) {
        self.inner.reject.store(reject, Ordering::SeqCst);
    }

    /// Number of orders opened
    pub fn order_count(&self) -> u64 {
        self.inner.orders.load(Ordering::SeqCst)
    }

    /// Number of registered accounts
    pub fn account_count(&self) -> usize {
        self.inner.accounts.lock().len()
    }

    /// Root certificate PEM
    pub fn root_pem(&self) -> String {
        self.inner.ca_cert.pem()
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn zone_of(domain: &str) -> String {
    let labels: Vec<&str> = normalize_domain(domain).split('.').collect();
    labels[labels.len().saturating_sub(2)..].join(".")
}

fn csr_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE REQUEST-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(chunk));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE REQUEST-----\n");
    pem
}

#[async_trait]
impl AcmeDirectory for LocalAcmeDirectory {
    async fn register(&self, email: &str) -> Result<AcmeRegistration> {
        let id = random_token();
        let uri = format!("local://account/{}", id);
        self.inner.accounts.lock().insert(id.clone(), email.to_string());
        info!(email, %uri, "Local ACME account registered");

        Ok(AcmeRegistration {
            resource: AcmeResource {
                body: AcmeAccountBody {
                    status: "valid".into(),
                    contact: vec![format!("mailto:{}", email)],
                    terms_of_service_agreed: true,
                    orders: Some(format!("{}/orders", uri)),
                    only_return_existing: false,
                    external_account_binding: None,
                },
                uri,
            },
            credentials: serde_json::json!({ "local_account": id }),
        })
    }

    async fn new_order(
        &self,
        credentials: &serde_json::Value,
        domains: &[String],
    ) -> Result<Box<dyn AcmeOrder>> {
        let id = credentials
            .get("local_account")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Decode("Invalid local ACME credentials".into()))?;
        if !self.inner.accounts.lock().contains_key(id) {
            return Err(Error::AcmeRejected(format!("Unknown account {}", id)));
        }

        let n = self.inner.orders.fetch_add(1, Ordering::SeqCst);
        let challenges = domains
            .iter()
            .enumerate()
            .map(|(i, domain)| LocalChallenge {
                challenge: DnsChallenge {
                    domain: domain.clone(),
                    url: format!("local://order/{}/challenge/{}", n, i),
                    dns_value: random_token(),
                },
                ready: false,
            })
            .collect();

        Ok(Box::new(LocalOrder {
            inner: self.inner.clone(),
            challenges,
            status: OrderProgress::Pending,
            certificate: None,
        }))
    }
}

struct LocalChallenge {
    challenge: DnsChallenge,
    ready: bool,
}

struct LocalOrder {
    inner: Arc<Inner>,
    challenges: Vec<LocalChallenge>,
    status: OrderProgress,
    certificate: Option<String>,
}

impl LocalOrder {
    async fn validate(&mut self) -> Result<()> {
        if self.inner.reject.load(Ordering::SeqCst) {
            debug!("Local ACME rejecting validation");
            self.status = OrderProgress::Invalid;
            return Ok(());
        }

        for entry in &self.challenges {
            let domain = &entry.challenge.domain;
            let zone = zone_of(domain);
            let hostname = challenge_hostname(domain, &zone);
            let records = self.inner.dns.records(&zone).await?;
            let found = records.iter().any(|r| {
                r.record_type == "TXT"
                    && r.hostname == hostname
                    && r.value.trim_matches('"') == entry.challenge.dns_value
            });
            if !found {
                debug!(domain = %domain, "Challenge record missing");
                self.status = OrderProgress::Invalid;
                return Ok(());
            }
        }

        self.status = OrderProgress::Ready;
        Ok(())
    }
}

#[async_trait]
impl AcmeOrder for LocalOrder {
    async fn dns_challenges(&mut self) -> Result<Vec<DnsChallenge>> {
        Ok(self
            .challenges
            .iter()
            .filter(|c| !c.ready)
            .map(|c| c.challenge.clone())
            .collect())
    }

    async fn set_ready(&mut self, url: &str) -> Result<()> {
        let entry = self
            .challenges
            .iter_mut()
            .find(|c| c.challenge.url == url)
            .ok_or_else(|| Error::AcmeRejected(format!("Unknown challenge {}", url)))?;
        entry.ready = true;

        if self.challenges.iter().all(|c| c.ready) {
            self.validate().await?;
        }
        Ok(())
    }

    async fn refresh(&mut self) -> Result<OrderProgress> {
        Ok(self.status)
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<()> {
        if self.status != OrderProgress::Ready {
            return Err(Error::AcmeRejected(format!("Order is {}, not ready", self.status)));
        }

        let mut csr = CertificateSigningRequestParams::from_pem(&csr_pem(csr_der))
            .map_err(|e| Error::AcmeRejected(format!("Bad CSR: {}", e)))?;
        let now = OffsetDateTime::now_utc();
        csr.params.not_before = now - time::Duration::minutes(5);
        csr.params.not_after = now + time::Duration::days(LOCAL_CERT_DAYS);

        let leaf = csr.signed_by(&self.inner.ca_cert, &self.inner.ca_key)?;
        self.certificate = Some(format!("{}{}", leaf.pem(), self.inner.ca_cert.pem()));
        self.status = OrderProgress::Valid;
        Ok(())
    }

    async fn certificate(&mut self) -> Result<Option<String>> {
        Ok(self.certificate.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::providers::MemoryDnsClient;

    fn csr_for(domains: &[&str]) -> (KeyPair, Vec<u8>) {
        let key = KeyPair::generate().unwrap();
        let params =
            CertificateParams::new(domains.iter().map(|d| d.to_string()).collect::<Vec<_>>()).unwrap();
        let der = params.serialize_request(&key).unwrap().der().to_vec();
        (key, der)
    }

    #[test]
    fn test_zone_of() {
        assert_eq!(zone_of("example.test"), "example.test");
        assert_eq!(zone_of("a.b.example.test"), "example.test");
        assert_eq!(zone_of("*.example.test"), "example.test");
    }

    #[tokio::test]
    async fn test_order_happy_path() {
        let dns = Arc::new(MemoryDnsClient::new("127.0.0.1".parse().unwrap()));
        let directory = LocalAcmeDirectory::new(dns.clone()).unwrap();
        let reg = directory.register("ops@example.test").await.unwrap();

        let mut order = directory
            .new_order(&reg.credentials, &["example.test".to_string()])
            .await
            .unwrap();
        let challenges = order.dns_challenges().await.unwrap();
        assert_eq!(challenges.len(), 1);

        dns.create_record(
            "example.test",
            DnsRecord::txt("_acme-challenge", challenges[0].dns_value.clone()),
        )
        .await
        .unwrap();
        order.set_ready(&challenges[0].url).await.unwrap();
        assert_eq!(order.refresh().await.unwrap(), OrderProgress::Ready);

        let (_key, csr) = csr_for(&["example.test"]);
        order.finalize(&csr).await.unwrap();
        let chain = order.certificate().await.unwrap().unwrap();
        assert_eq!(chain.matches("BEGIN CERTIFICATE").count(), 2);
    }

    #[tokio::test]
    async fn test_missing_record_invalidates_order() {
        let dns = Arc::new(MemoryDnsClient::new("127.0.0.1".parse().unwrap()));
        let directory = LocalAcmeDirectory::new(dns).unwrap();
        let reg = directory.register("ops@example.test").await.unwrap();
        let mut order = directory
            .new_order(&reg.credentials, &["example.test".to_string()])
            .await
            .unwrap();

        let challenges = order.dns_challenges().await.unwrap();
        order.set_ready(&challenges[0].url).await.unwrap();
        assert_eq!(order.refresh().await.unwrap(), OrderProgress::Invalid);

        let (_key, csr) = csr_for(&["example.test"]);
        assert!(order.finalize(&csr).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_account_rejected() {
        let dns = Arc::new(MemoryDnsClient::new("127.0.0.1".parse().unwrap()));
        let directory = LocalAcmeDirectory::new(dns).unwrap();
        let creds = serde_json::json!({ "local_account": "nope" });
        let result = directory.new_order(&creds, &["example.test".into()]).await;
        match result {
            Err(e) => {
                assert!(matches!(e, Error::AcmeRejected(_)));
                assert!(!e.is_transient());
            }
            Ok(_) => panic!("order opened for an unknown account"),
        }
    }
}

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use zonecert::acme::LocalAcmeDirectory;
use zonecert::crypto::{verify_chain, CertificateDesc, IssuedCertificate};
use zonecert::dns::providers::{MemoryDnsClient, MemoryDnsProvider};
use zonecert::dns::{Dns01Solver, DnsRecord, DnsProviderRegistry, StaticWhois, Whois};
use zonecert::repository::{CertificateRepository, IssuanceMode, MemoryStore, Zone, ZoneEventKind};
use zonecert::{
    CertMetrics, CertificateService, DnsProvider, DnsProviderClient, Error, RenewalState, Settings,
};

struct Harness {
    service: Arc<CertificateService>,
    dns: Arc<MemoryDnsClient>,
    directory: LocalAcmeDirectory,
}

fn harness() -> Harness {
    harness_with(|dns| -> Arc<dyn DnsProvider> {
        Arc::new(MemoryDnsProvider::new(
            "memory",
            vec!["ns.memory.test".into()],
            dns,
        ))
    })
}

fn harness_with(provider: impl FnOnce(Arc<MemoryDnsClient>) -> Arc<dyn DnsProvider>) -> Harness {
    let mut settings = Settings::default();
    settings.certificate.desc = Some(CertificateDesc {
        organization: "Example Org".into(),
        country: "DE".into(),
        city: "Berlin".into(),
        ..Default::default()
    });
    settings.acme.email = Some("ops@example.test".into());
    for backoff in [&mut settings.acme.propagation, &mut settings.acme.validation] {
        backoff.initial_delay_ms = 10;
        backoff.max_delay_ms = 50;
        backoff.timeout_secs = 2;
    }

    let dns = Arc::new(MemoryDnsClient::new("203.0.113.9".parse().unwrap()));
    let mut providers = DnsProviderRegistry::new();
    providers.register(provider(dns.clone())).unwrap();
    let whois = StaticWhois::new(vec![Whois {
        domain: "example.test".into(),
        nserver: vec!["ns1.ns.memory.test".into(), "ns2.ns.memory.test".into()],
        ..Default::default()
    }]);
    let directory = LocalAcmeDirectory::new(dns.clone()).unwrap();

    let service = Arc::new(CertificateService::new(
        Arc::new(settings),
        Arc::new(CertificateRepository::new(Arc::new(MemoryStore::new()))),
        Arc::new(providers),
        Arc::new(whois),
        Arc::new(directory.clone()),
        Arc::new(CertMetrics::new().unwrap()),
    ));

    Harness {
        service,
        dns,
        directory,
    }
}

async fn add_acme_zone(h: &Harness) {
    let mut zone = Zone::new("example.test", IssuanceMode::Acme { email: None });
    zone.domains = vec!["example.test".into(), "www.example.test".into()];
    h.service.repository().save_zone(&zone).await.unwrap();
}

#[tokio::test]
async fn self_signed_end_to_end() {
    let h = harness();
    h.service.create_self_signer("Example Root", true).await.unwrap();

    let mut zone = Zone::new(
        "example.test",
        IssuanceMode::SelfSigned {
            issuer: "Example Root".into(),
        },
    );
    zone.domains = vec!["example.test".into()];
    zone.ip_addresses = vec!["192.0.2.44".parse().unwrap()];
    h.service.repository().save_zone(&zone).await.unwrap();

    let cert = h
        .service
        .issue_self_signed_certificate("example.test")
        .await
        .unwrap();

    let leaf = IssuedCertificate::from_pem(&cert.cert_pem, &cert.key_pem).unwrap();
    assert_eq!(leaf.common_name().unwrap().as_deref(), Some("example.test"));
    assert_eq!(
        leaf.subject_alt_names().unwrap(),
        vec!["example.test".to_string(), "192.0.2.44".to_string()]
    );

    // leaf, intermediate, root
    let signer = h
        .service
        .repository()
        .find_self_signer("Example Root")
        .await
        .unwrap()
        .unwrap();
    let issuer = h.service.issuance().load_issuer(&signer).unwrap();
    let chain: Vec<_> = issuer.chain();
    let issuers: Vec<&[u8]> = chain.iter().map(|c| c.certificate_der()).collect();
    verify_chain(leaf.certificate_der(), &issuers).unwrap();
    assert!(verify_chain(leaf.certificate_der(), &issuers[1..]).is_err());

    let stored = h.service.repository().get_zone("example.test").await.unwrap();
    assert_eq!(stored.certificate, Some(cert));
    assert_eq!(stored.last_status, Some(RenewalState::Issued));
}

#[tokio::test]
async fn acme_end_to_end_notifies_once() {
    let h = harness();
    add_acme_zone(&h).await;

    let cancel = CancellationToken::new();
    let mut watch = h.service.repository().watch(cancel.clone()).await.unwrap();

    let chain = h
        .service
        .issue_acme_certificate("example.test", &CancellationToken::new())
        .await
        .unwrap();
    assert!(chain.contains(h.directory.root_pem().trim()));
    assert_eq!(h.dns.challenge_record_count(), 0);

    let event = watch.next().await.unwrap();
    assert_eq!(event.kind, ZoneEventKind::Updated);
    assert_eq!(event.zone.name, "example.test");
    assert_eq!(event.zone.certificate.as_ref().map(|c| c.chain_pem.as_str()), Some(chain.as_str()));

    let more = tokio::time::timeout(Duration::from_millis(200), watch.next()).await;
    assert!(more.is_err(), "expected exactly one notification");
    cancel.cancel();

    // the stored account is reused for renewals
    h.service
        .renew_certificate("example.test", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.directory.account_count(), 1);
    assert_eq!(h.directory.order_count(), 2);
}

#[tokio::test]
async fn no_challenge_records_left_after_failures() {
    let h = harness();
    add_acme_zone(&h).await;

    // rejected by the directory
    h.directory.reject_validation(true);
    let err = h
        .service
        .renew_certificate("example.test", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert_eq!(h.dns.challenge_record_count(), 0);
    h.directory.reject_validation(false);

    // records never become visible
    h.dns.set_hidden(true);
    let err = h
        .service
        .renew_certificate("example.test", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(h.dns.challenge_record_count(), 0);
    h.dns.set_hidden(false);

    // cancelled while waiting for propagation
    h.dns.set_hidden(true);
    let cancel = CancellationToken::new();
    let task = {
        let service = h.service.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { service.renew_certificate("example.test", &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
    assert_eq!(h.dns.challenge_record_count(), 0);
    h.dns.set_hidden(false);

    // a transient removal failure is retried
    h.dns.fail_next_removals(1);
    h.service
        .renew_certificate("example.test", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.dns.challenge_record_count(), 0);
    assert_eq!(h.service.metrics().active_challenge_records(), 0);

    let zone = h.service.repository().get_zone("example.test").await.unwrap();
    assert_eq!(zone.last_status, Some(RenewalState::Issued));
    assert!(zone.last_error.is_none());
}

#[tokio::test]
async fn concurrent_renewal_of_one_zone_is_rejected() {
    let h = harness();
    add_acme_zone(&h).await;

    // hold the first attempt in the propagation wait
    h.dns.set_hidden(true);
    let first = {
        let service = h.service.clone();
        tokio::spawn(async move {
            service
                .renew_certificate("example.test", &CancellationToken::new())
                .await
        })
    };
    while !h.service.is_in_flight("example.test") {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let err = h
        .service
        .renew_certificate("example.test", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RenewalInProgress(ref zone) if zone == "example.test"));

    h.dns.set_hidden(false);
    first.await.unwrap().unwrap();
    assert!(!h.service.is_in_flight("example.test"));
    assert_eq!(h.directory.order_count(), 1);
}

#[tokio::test]
async fn renewal_advances_last_issued() {
    let h = harness();
    h.service.create_self_signer("Example Root", false).await.unwrap();
    let mut zone = Zone::new(
        "example.test",
        IssuanceMode::SelfSigned {
            issuer: "Example Root".into(),
        },
    );
    zone.domains = vec!["example.test".into()];
    h.service.repository().save_zone(&zone).await.unwrap();

    let first = h
        .service
        .renew_certificate("example.test", &CancellationToken::new())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = h
        .service
        .renew_certificate("example.test", &CancellationToken::new())
        .await
        .unwrap();

    let first_cert = first.certificate.unwrap();
    let second_cert = second.certificate.unwrap();
    assert!(second_cert.issued_at > first_cert.issued_at);
    assert!(second.updated_at > first.updated_at);
    assert_ne!(second_cert.cert_pem, first_cert.cert_pem);

    let stored = h.service.repository().get_zone("example.test").await.unwrap();
    assert_eq!(stored.certificate, Some(second_cert));
}

/// Counts challenge records that were created and not yet removed
#[derive(Default)]
struct Window {
    live: AtomicUsize,
    peak: AtomicUsize,
}

struct CountingClient {
    inner: Arc<MemoryDnsClient>,
    window: Arc<Window>,
}

#[async_trait]
impl DnsProviderClient for CountingClient {
    async fn get_public_ip(&self) -> zonecert::Result<IpAddr> {
        self.inner.get_public_ip().await
    }

    async fn get_records(&self, zone: &str) -> zonecert::Result<Vec<DnsRecord>> {
        self.inner.get_records(zone).await
    }

    async fn create_record(&self, zone: &str, record: DnsRecord) -> zonecert::Result<DnsRecord> {
        let created = self.inner.create_record(zone, record).await?;
        let live = self.window.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.window.peak.fetch_max(live, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(created)
    }

    async fn remove_record(&self, zone: &str, record_id: &str) -> zonecert::Result<()> {
        self.inner.remove_record(zone, record_id).await?;
        self.window.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

struct CountingProvider {
    client: Arc<CountingClient>,
}

impl DnsProvider for CountingProvider {
    fn name(&self) -> &str {
        "counting"
    }

    fn detect(&self, whois: &Whois) -> bool {
        whois.nserver.iter().any(|ns| ns.ends_with("ns.memory.test"))
    }

    fn new_client(&self) -> zonecert::Result<Arc<dyn DnsProviderClient>> {
        Ok(self.client.clone())
    }

    fn register_challenge(&self, solver: &mut Dns01Solver, _token: &str) -> zonecert::Result<()> {
        solver.install(self.name(), self.client.clone());
        Ok(())
    }
}

#[tokio::test]
async fn concurrent_renewals_never_overlap_challenge_windows() {
    let window = Arc::new(Window::default());
    let h = harness_with(|dns| -> Arc<dyn DnsProvider> {
        Arc::new(CountingProvider {
            client: Arc::new(CountingClient {
                inner: dns,
                window: window.clone(),
            }),
        })
    });
    add_acme_zone(&h).await;

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let service = h.service.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                match service
                    .renew_certificate("example.test", &CancellationToken::new())
                    .await
                {
                    Err(Error::RenewalInProgress(_)) => {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    other => return other,
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    // one attempt publishes one record per SAN domain
    assert_eq!(window.peak.load(Ordering::SeqCst), 2);
    assert_eq!(window.live.load(Ordering::SeqCst), 0);
    assert_eq!(h.directory.order_count(), 4);
}

#[tokio::test]
async fn zone_deleted_during_renewal_stays_deleted() {
    let h = harness();
    add_acme_zone(&h).await;
    let cancel = CancellationToken::new();
    let mut watch = h.service.repository().watch(cancel.clone()).await.unwrap();

    h.dns.set_hidden(true);
    let renewal = {
        let service = h.service.clone();
        tokio::spawn(async move {
            service
                .renew_certificate("example.test", &CancellationToken::new())
                .await
        })
    };
    while h.dns.challenge_record_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.service.repository().delete_zone("example.test").await.unwrap());
    h.dns.set_hidden(false);

    let err = renewal.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert!(h.service.repository().find_zone("example.test").await.unwrap().is_none());
    assert_eq!(h.dns.challenge_record_count(), 0);

    let event = watch.next().await.unwrap();
    assert_eq!(event.kind, ZoneEventKind::Deleted);
    let more = tokio::time::timeout(Duration::from_millis(200), watch.next()).await;
    assert!(more.is_err(), "deleted zone was committed again");
    cancel.cancel();
}

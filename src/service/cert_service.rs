use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::acme::{AcmeDirectory, AcmeOrder, InstantAcmeDirectory, LocalAcmeDirectory, OrderProgress};
use crate::config::Settings;
use crate::crypto::{CertificateIssueService, IssuedCertificate};
use crate::dns::{Dns01Solver, DnsProviderRegistry, StaticWhois, WhoisService};
use crate::error::Error;
use crate::repository::{
    AcmeAccount, AcmeResource, CertificateRepository, IssuanceMode, SelfSigner, Zone,
    ZoneCertificate,
};
use crate::telemetry::CertMetrics;
use crate::types::{IssuancePath, RenewalState, Result};
use crate::utils::BackoffTimer;

/// A resolved ACME account ready to place orders
#[derive(Debug, Clone)]
pub struct AcmeUser {
    pub email: String,
    pub registration: AcmeResource,
    pub credentials: serde_json::Value,
}

impl From<AcmeAccount> for AcmeUser {
    fn from(account: AcmeAccount) -> Self {
        Self {
            email: account.email,
            registration: account.registration,
            credentials: account.credentials,
        }
    }
}

/// Marks a zone as being issued until dropped
struct InFlight<'a> {
    zones: &'a DashMap<String, ()>,
    name: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.zones.remove(&self.name);
    }
}

/// State of one issuance attempt
struct Attempt<'a> {
    zone: &'a str,
    state: RenewalState,
}

impl<'a> Attempt<'a> {
    fn new(zone: &'a str) -> Self {
        debug!(zone, state = %RenewalState::Pending, "Issuance attempt started");
        Self {
            zone,
            state: RenewalState::Pending,
        }
    }

    fn advance(&mut self, next: RenewalState) {
        info!(zone = self.zone, from = %self.state, to = %next, "Issuance state changed");
        self.state = next;
    }
}

/// Certificate service: ACME and self-signed issuance, renewal and admin commands
pub struct CertificateService {
    settings: Arc<Settings>,
    repository: Arc<CertificateRepository>,
    issuance: CertificateIssueService,
    providers: Arc<DnsProviderRegistry>,
    whois: Arc<dyn WhoisService>,
    acme: Arc<dyn AcmeDirectory>,
    metrics: Arc<CertMetrics>,
    users: DashMap<String, AcmeUser>,
    account_lock: Mutex<()>,
    in_flight: DashMap<String, ()>,
}

impl CertificateService {
    pub fn new(
        settings: Arc<Settings>,
        repository: Arc<CertificateRepository>,
        providers: Arc<DnsProviderRegistry>,
        whois: Arc<dyn WhoisService>,
        acme: Arc<dyn AcmeDirectory>,
        metrics: Arc<CertMetrics>,
    ) -> Self {
        let issuance = CertificateIssueService::new(&settings.certificate);
        Self {
            settings,
            repository,
            issuance,
            providers,
            whois,
            acme,
            metrics,
            users: DashMap::new(),
            account_lock: Mutex::new(()),
            in_flight: DashMap::new(),
        }
    }

    /// Wire the service from configuration
    pub fn from_settings(settings: Arc<Settings>) -> Result<Self> {
        let repository = Arc::new(CertificateRepository::from_settings(&settings));
        let providers = Arc::new(DnsProviderRegistry::from_config(&settings.dns)?);
        let whois: Arc<dyn WhoisService> = Arc::new(StaticWhois::new(settings.whois.entries.clone()));
        let acme: Arc<dyn AcmeDirectory> = if settings.acme.is_local() {
            info!("Using the in-process ACME directory");
            Arc::new(LocalAcmeDirectory::detecting(providers.clone(), whois.clone())?)
        } else {
            Arc::new(InstantAcmeDirectory::new(settings.acme.directory_url.clone()))
        };
        let metrics = Arc::new(CertMetrics::new()?);

        Ok(Self::new(settings, repository, providers, whois, acme, metrics))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn repository(&self) -> &Arc<CertificateRepository> {
        &self.repository
    }

    pub fn providers(&self) -> &Arc<DnsProviderRegistry> {
        &self.providers
    }

    pub fn whois(&self) -> &Arc<dyn WhoisService> {
        &self.whois
    }

    pub fn metrics(&self) -> &Arc<CertMetrics> {
        &self.metrics
    }

    pub fn issuance(&self) -> &CertificateIssueService {
        &self.issuance
    }

    /// Whether an issuance for `zone` is running
    pub fn is_in_flight(&self, zone: &str) -> bool {
        self.in_flight.contains_key(zone)
    }

    fn begin(&self, zone: &str) -> Result<InFlight<'_>> {
        match self.in_flight.entry(zone.to_string()) {
            Entry::Occupied(_) => Err(Error::RenewalInProgress(zone.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(InFlight {
                    zones: &self.in_flight,
                    name: zone.to_string(),
                })
            }
        }
    }

    // ACME accounts

    /// Stored account for `email`, registering one on first use
    pub async fn create_acme_account(&self, email: &str) -> Result<AcmeAccount> {
        if email.trim().is_empty() {
            return Err(Error::Config("ACME account email is empty".into()));
        }

        let _guard = self.account_lock.lock().await;
        if let Some(account) = self.repository.find_acme_account(email).await? {
            debug!(email, "Using stored ACME account");
            return Ok(account);
        }

        let backoff = self.settings.acme.validation.backoff();
        let registration = backoff
            .retry("register ACME account", &CancellationToken::new(), || {
                self.acme.register(email)
            })
            .await?;

        let account = AcmeAccount {
            email: email.to_string(),
            registration: registration.resource,
            credentials: registration.credentials,
            created_at: Utc::now(),
        };
        self.repository.save_acme_account(&account).await?;
        info!(email, uri = %account.registration.uri, "ACME account registered");
        Ok(account)
    }

    /// Cached account for `email`, loading or registering it when needed
    pub async fn get_or_create_acme_user(&self, email: &str) -> Result<AcmeUser> {
        if let Some(user) = self.users.get(email) {
            return Ok(user.clone());
        }

        let user = AcmeUser::from(self.create_acme_account(email).await?);
        self.users.insert(email.to_string(), user.clone());
        Ok(user)
    }

    // Self-signers

    /// Create a root (and optionally one intermediate) and store it under `common_name`
    pub async fn create_self_signer(&self, common_name: &str, with_inter: bool) -> Result<SelfSigner> {
        if self.repository.find_self_signer(common_name).await?.is_some() {
            return Err(Error::InvalidRequest(format!(
                "Self-signer '{}' already exists",
                common_name
            )));
        }

        let desc = self.issuance.load_certificate_desc()?;
        let root = self.issuance.create_issuer(common_name, &desc)?;
        let deepest = if with_inter {
            root.issue_inter_cert(&format!("{} Intermediate", common_name))?
        } else {
            root
        };

        let signer = self.issuance.save_signer(common_name, &deepest);
        // a concurrent create may have won since the check above
        self.repository.insert_self_signer(&signer).await?;
        info!(signer = common_name, depth = signer.nodes.len(), "Self-signer created");
        Ok(signer)
    }

    /// PKCS#12 client bundle signed by a stored self-signer
    pub async fn issue_client_certificate(
        &self,
        signer: &str,
        common_name: &str,
        password: &str,
    ) -> Result<Vec<u8>> {
        if password.is_empty() {
            return Err(Error::Config(
                "A password is required for client certificate bundles".into(),
            ));
        }

        let stored = self
            .repository
            .find_self_signer(signer)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Self-signer '{}'", signer)))?;
        let issuer = self.issuance.load_issuer(&stored)?;
        let (_, bundle) = issuer.issue_client_cert(common_name, password)?;

        info!(signer, cn = common_name, "Issued client certificate");
        Ok(bundle)
    }

    // Issuance

    /// Issue a certificate for an ACME zone and return its chain PEM
    pub async fn issue_acme_certificate(&self, zone: &str, cancel: &CancellationToken) -> Result<String> {
        let zone = self.issue(zone, Some(IssuancePath::Acme), cancel).await?;
        zone.certificate
            .map(|c| c.chain_pem)
            .ok_or_else(|| Error::Internal("Issued zone has no certificate".into()))
    }

    /// Issue a certificate for a self-signed zone
    pub async fn issue_self_signed_certificate(&self, zone: &str) -> Result<ZoneCertificate> {
        let zone = self
            .issue(zone, Some(IssuancePath::SelfSigned), &CancellationToken::new())
            .await?;
        zone.certificate
            .ok_or_else(|| Error::Internal("Issued zone has no certificate".into()))
    }

    /// Renew the certificate of `zone` through its configured path
    pub async fn renew_certificate(&self, zone: &str, cancel: &CancellationToken) -> Result<Zone> {
        self.issue(zone, None, cancel).await
    }

    async fn issue(
        &self,
        name: &str,
        expected: Option<IssuancePath>,
        cancel: &CancellationToken,
    ) -> Result<Zone> {
        let _in_flight = self.begin(name)?;
        let mut zone = self.repository.get_zone(name).await?;
        let path = zone.mode.path();
        if let Some(expected) = expected {
            if expected != path {
                return Err(Error::InvalidRequest(format!(
                    "Zone '{}' is issued through {}, not {}",
                    name, path, expected
                )));
            }
        }
        // Commits are conditional on the zone being unchanged since this read.
        let read_at = zone.updated_at;

        let mut attempt = Attempt::new(name);
        let result = match zone.check_sans() {
            Err(e) => Err(e),
            Ok(()) => match &zone.mode {
                IssuanceMode::SelfSigned { issuer } => self.issue_via_self_signer(&zone, issuer).await,
                IssuanceMode::Acme { email } => {
                    let email = email.clone().or_else(|| self.settings.acme.email.clone());
                    self.issue_via_acme(&zone, email, &mut attempt, cancel).await
                }
            },
        };

        let committed = match result {
            Ok(certificate) => {
                let mut issued = zone.clone();
                issued.certificate = Some(certificate);
                issued.last_status = Some(RenewalState::Issued);
                issued.last_error = None;
                self.repository.save_zone_if(&issued, read_at).await
            }
            Err(e) => Err(e),
        };

        match committed {
            Ok(zone) => {
                attempt.advance(RenewalState::Issued);
                self.metrics.inc_issued(path);
                info!(zone = name, %path, expires_at = ?zone.expires_at(), "Certificate issued");
                Ok(zone)
            }
            Err(e) => {
                let failed_in = attempt.state;
                attempt.advance(RenewalState::Failed);
                self.metrics.inc_failed(path);
                error!(zone = name, %path, state = %failed_in, error = %e, "Certificate issuance failed");

                // A conflicting zone belongs to whoever changed it.
                if !matches!(e, Error::Conflict(_)) {
                    zone.last_status = Some(RenewalState::Failed);
                    zone.last_error = Some(e.to_string());
                    if let Err(save_err) = self.repository.save_zone_if(&zone, read_at).await {
                        warn!(zone = name, error = %save_err, "Failed to record issuance failure");
                    }
                }
                Err(e)
            }
        }
    }

    async fn issue_via_self_signer(&self, zone: &Zone, issuer: &str) -> Result<ZoneCertificate> {
        let signer = self
            .repository
            .find_self_signer(issuer)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Self-signer '{}'", issuer)))?;
        let issuer = self.issuance.load_issuer(&signer)?;
        let leaf = issuer.issue_server_cert(&zone.name, &zone.domains, &zone.ip_addresses)?;

        Ok(ZoneCertificate {
            cert_pem: leaf.cert_pem().to_string(),
            key_pem: leaf.key_pem().to_string(),
            chain_pem: format!("{}{}", leaf.cert_pem(), issuer.chain_pem()),
            expires_at: timestamp(leaf.not_after()?)?,
            issued_at: Utc::now(),
        })
    }

    async fn issue_via_acme(
        &self,
        zone: &Zone,
        email: Option<String>,
        attempt: &mut Attempt<'_>,
        cancel: &CancellationToken,
    ) -> Result<ZoneCertificate> {
        let email = email.ok_or_else(|| {
            Error::Config(format!("No ACME email configured for zone '{}'", zone.name))
        })?;
        let user = self.get_or_create_acme_user(&email).await?;
        attempt.advance(RenewalState::AccountResolved);

        let whois = self.whois.lookup(&zone.name).await?;
        let provider = self.providers.detect(&whois)?;
        info!(zone = %zone.name, provider = provider.name(), "DNS provider detected");

        let mut solver = Dns01Solver::new();
        let token = self.settings.dns.token_for(provider.name()).unwrap_or_default();
        provider.register_challenge(&mut solver, token)?;

        let result = self.acme_order(zone, &user, &mut solver, attempt, cancel).await;

        // Cleanup runs on every path, including cancellation.
        let published = solver.published_count();
        let failed = solver.cleanup(&self.settings.acme.propagation.backoff()).await;
        self.metrics.sub_challenge_records(published.saturating_sub(failed));
        if failed > 0 {
            warn!(zone = %zone.name, failed, "Challenge records left behind");
        }

        result
    }

    async fn acme_order(
        &self,
        zone: &Zone,
        user: &AcmeUser,
        solver: &mut Dns01Solver,
        attempt: &mut Attempt<'_>,
        cancel: &CancellationToken,
    ) -> Result<ZoneCertificate> {
        let domains = zone.domains.clone();
        let validation = self.settings.acme.validation.backoff();

        let mut order = validation
            .retry("open ACME order", cancel, || {
                self.acme.new_order(&user.credentials, &domains)
            })
            .await?;

        let challenges = order.dns_challenges().await?;
        for challenge in &challenges {
            solver.present(&zone.name, &challenge.domain, &challenge.dns_value).await?;
            self.metrics.add_challenge_records(1);
        }
        attempt.advance(RenewalState::ChallengePublished);

        solver
            .wait_for_propagation(&self.settings.acme.propagation.backoff(), cancel)
            .await?;

        for challenge in &challenges {
            order.set_ready(&challenge.url).await?;
        }
        attempt.advance(RenewalState::Validating);

        let mut timer = validation.start();
        wait_for_order(order.as_mut(), &zone.name, &mut timer, cancel).await?;

        let key = KeyPair::generate()?;
        let mut params = CertificateParams::new(domains.clone())?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, zone.name.clone());
        let csr = params.serialize_request(&key)?;
        order.finalize(csr.der().as_ref()).await?;

        let chain_pem = loop {
            match order.certificate().await {
                Ok(Some(chain)) => break chain,
                Ok(None) => debug!(zone = %zone.name, "Certificate not ready yet"),
                Err(e) if e.is_transient() => warn!(zone = %zone.name, error = %e, "Certificate download failed"),
                Err(e) => return Err(e),
            }
            timer.wait(cancel).await?;
        };

        let leaf = IssuedCertificate::from_pem(&leaf_pem(&chain_pem)?, &key.serialize_pem())?;
        Ok(ZoneCertificate {
            cert_pem: leaf.cert_pem().to_string(),
            key_pem: leaf.key_pem().to_string(),
            chain_pem,
            expires_at: timestamp(leaf.not_after()?)?,
            issued_at: Utc::now(),
        })
    }
}

/// Poll until the order is ready for finalization
async fn wait_for_order(
    order: &mut dyn AcmeOrder,
    zone: &str,
    timer: &mut BackoffTimer,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        match order.refresh().await {
            Ok(OrderProgress::Ready) | Ok(OrderProgress::Valid) => return Ok(()),
            Ok(OrderProgress::Invalid) => {
                return Err(Error::Validation {
                    domain: zone.to_string(),
                    message: "order became invalid".into(),
                })
            }
            Ok(status) => debug!(zone, %status, "Waiting for ACME validation"),
            Err(e) if e.is_transient() => warn!(zone, error = %e, "Order refresh failed"),
            Err(e) => return Err(e),
        }
        timer.wait(cancel).await.map_err(|e| match e {
            Error::Timeout(_) => Error::Timeout(format!("ACME validation of zone '{}'", zone)),
            other => other,
        })?;
    }
}

/// First PEM block of a certificate chain
fn leaf_pem(chain: &str) -> Result<String> {
    const END: &str = "-----END CERTIFICATE-----";
    chain
        .find(END)
        .map(|end| format!("{}\n", chain[..end + END.len()].trim_start()))
        .ok_or_else(|| Error::Decode("ACME certificate chain is empty".into()))
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| Error::Decode(format!("Invalid certificate expiry {}", secs)))
}

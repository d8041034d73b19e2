use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, Order, OrderStatus,
};
use tracing::{debug, info};

use crate::acme::{AcmeDirectory, AcmeOrder, AcmeRegistration, DnsChallenge, OrderProgress};
use crate::error::Error;
use crate::repository::{AcmeAccountBody, AcmeResource};
use crate::types::Result;

/// ACME directory reached over HTTPS
pub struct InstantAcmeDirectory {
    directory_url: String,
}

impl InstantAcmeDirectory {
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
        }
    }

    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }
}

fn parse_credentials(credentials: &serde_json::Value) -> Result<AccountCredentials> {
    serde_json::from_value(credentials.clone())
        .map_err(|e| Error::Decode(format!("Invalid ACME account credentials: {}", e)))
}

#[async_trait]
impl AcmeDirectory for InstantAcmeDirectory {
    async fn register(&self, email: &str) -> Result<AcmeRegistration> {
        info!(email, directory = %self.directory_url, "Creating new ACME account");

        let contact = format!("mailto:{}", email);
        let contact_refs: &[&str] = &[&contact];
        let new_account = NewAccount {
            contact: contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = Account::create(&new_account, &self.directory_url, None).await?;

        let resource = AcmeResource {
            body: AcmeAccountBody {
                status: "valid".to_string(),
                contact: vec![contact.clone()],
                terms_of_service_agreed: true,
                orders: None,
                only_return_existing: false,
                external_account_binding: None,
            },
            uri: account.id().to_string(),
        };

        info!(account_url = %resource.uri, "ACME account created");
        Ok(AcmeRegistration {
            resource,
            credentials: serde_json::to_value(&credentials)?,
        })
    }

    async fn new_order(
        &self,
        credentials: &serde_json::Value,
        domains: &[String],
    ) -> Result<Box<dyn AcmeOrder>> {
        let account = Account::from_credentials(parse_credentials(credentials)?).await?;

        let identifiers: Vec<Identifier> = domains.iter().cloned().map(Identifier::Dns).collect();
        let order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        debug!(domains = ?domains, "ACME order created");
        Ok(Box::new(InstantAcmeOrder { order }))
    }
}

struct InstantAcmeOrder {
    order: Order,
}

#[async_trait]
impl AcmeOrder for InstantAcmeOrder {
    async fn dns_challenges(&mut self) -> Result<Vec<DnsChallenge>> {
        let authorizations = self.order.authorizations().await?;

        let mut challenges = Vec::new();
        for auth in &authorizations {
            #[allow(unreachable_patterns)]
            let domain = match &auth.identifier {
                Identifier::Dns(domain) => domain,
                _ => continue,
            };

            if auth.status == AuthorizationStatus::Valid {
                debug!(domain = %domain, "Authorization already valid");
                continue;
            }

            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Dns01)
                .ok_or_else(|| Error::Validation {
                    domain: domain.clone(),
                    message: "no DNS-01 challenge offered".into(),
                })?;

            challenges.push(DnsChallenge {
                domain: domain.clone(),
                url: challenge.url.clone(),
                dns_value: self.order.key_authorization(challenge).dns_value(),
            });
        }
        Ok(challenges)
    }

    async fn set_ready(&mut self, url: &str) -> Result<()> {
        self.order.set_challenge_ready(url).await?;
        Ok(())
    }

    async fn refresh(&mut self) -> Result<OrderProgress> {
        let state = self.order.refresh().await?;
        #[allow(unreachable_patterns)]
        let progress = match state.status {
            OrderStatus::Pending => OrderProgress::Pending,
            OrderStatus::Ready => OrderProgress::Ready,
            OrderStatus::Processing => OrderProgress::Processing,
            OrderStatus::Valid => OrderProgress::Valid,
            OrderStatus::Invalid => OrderProgress::Invalid,
            _ => OrderProgress::Pending,
        };
        Ok(progress)
    }

    async fn finalize(&mut self, csr_der: &[u8]) -> Result<()> {
        self.order.finalize(csr_der).await?;
        Ok(())
    }

    async fn certificate(&mut self) -> Result<Option<String>> {
        Ok(self.order.certificate().await?)
    }
}

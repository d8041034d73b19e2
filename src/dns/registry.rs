use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::{DnsConfig, DnsProviderConfig, DnsProviderKind};
use crate::dns::provider::DnsProvider;
use crate::dns::providers::{HetznerProvider, MemoryDnsClient, MemoryDnsProvider, WebhookProvider};
use crate::dns::whois::Whois;
use crate::error::Error;
use crate::types::Result;

/// Create a DNS provider from its configuration
pub fn create_dns_provider(config: &DnsProviderConfig) -> Result<Arc<dyn DnsProvider>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    match config.kind {
        DnsProviderKind::Hetzner => {
            let token = config
                .token
                .clone()
                .ok_or_else(|| Error::Config(format!("DNS provider '{}' requires a token", config.name)))?;
            Ok(Arc::new(HetznerProvider::new(
                &config.name,
                token,
                config.api_url.clone(),
                timeout,
                config.nameservers.clone(),
            )))
        }
        DnsProviderKind::Webhook => {
            let url = config
                .api_url
                .clone()
                .ok_or_else(|| Error::Config(format!("DNS provider '{}' requires an api_url", config.name)))?;
            Ok(Arc::new(WebhookProvider::new(
                &config.name,
                url,
                config.token.clone(),
                timeout,
                config.nameservers.clone(),
            )))
        }
        DnsProviderKind::Memory => {
            let client = Arc::new(MemoryDnsClient::new(IpAddr::V4(Ipv4Addr::LOCALHOST)));
            Ok(Arc::new(MemoryDnsProvider::new(
                &config.name,
                config.nameservers.clone(),
                client,
            )))
        }
    }
}

/// Name-keyed set of DNS providers, kept in registration order
#[derive(Default)]
pub struct DnsProviderRegistry {
    providers: Vec<Arc<dyn DnsProvider>>,
}

impl DnsProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured provider
    pub fn from_config(config: &DnsConfig) -> Result<Self> {
        let mut registry = Self::new();
        for provider in &config.providers {
            registry.register(create_dns_provider(provider)?)?;
        }
        info!(providers = ?registry.names(), "DNS providers registered");
        Ok(registry)
    }

    /// Add a provider; names must be unique
    pub fn register(&mut self, provider: Arc<dyn DnsProvider>) -> Result<()> {
        if self.get(provider.name()).is_some() {
            return Err(Error::Config(format!(
                "DNS provider '{}' is already registered",
                provider.name()
            )));
        }
        debug!(provider = provider.name(), "Registering DNS provider");
        self.providers.push(provider);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DnsProvider>> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn providers(&self) -> &[Arc<dyn DnsProvider>] {
        &self.providers
    }

    /// First provider, in registration order, that recognizes the domain
    pub fn detect(&self, whois: &Whois) -> Result<Arc<dyn DnsProvider>> {
        self.providers
            .iter()
            .find(|p| p.detect(whois))
            .cloned()
            .ok_or_else(|| Error::NoDnsProvider(whois.domain.clone()))
    }
}

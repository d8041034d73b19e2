//! ACME directory boundary
//!
//! The certificate service drives orders through [`AcmeDirectory`] and
//! [`AcmeOrder`]. [`InstantAcmeDirectory`] talks RFC 8555 to a real directory;
//! [`LocalAcmeDirectory`] validates DNS-01 against a provider client in process.

pub mod client;
pub mod local;

use std::fmt;

use async_trait::async_trait;

use crate::repository::AcmeResource;
use crate::types::Result;

pub use client::InstantAcmeDirectory;
pub use local::LocalAcmeDirectory;

/// Result of registering an account
#[derive(Debug, Clone)]
pub struct AcmeRegistration {
    pub resource: AcmeResource,
    /// Serialized account credentials
    pub credentials: serde_json::Value,
}

/// A DNS-01 challenge to satisfy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsChallenge {
    pub domain: String,
    /// Challenge URL for the ready notification
    pub url: String,
    /// TXT record value
    pub dns_value: String,
}

/// Order status as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderProgress {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl fmt::Display for OrderProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderProgress::Pending => write!(f, "pending"),
            OrderProgress::Ready => write!(f, "ready"),
            OrderProgress::Processing => write!(f, "processing"),
            OrderProgress::Valid => write!(f, "valid"),
            OrderProgress::Invalid => write!(f, "invalid"),
        }
    }
}

/// An ACME server
#[async_trait]
pub trait AcmeDirectory: Send + Sync {
    /// Register a new account for `email`
    async fn register(&self, email: &str) -> Result<AcmeRegistration>;

    /// Open an order for `domains` with a registered account
    async fn new_order(
        &self,
        credentials: &serde_json::Value,
        domains: &[String],
    ) -> Result<Box<dyn AcmeOrder>>;
}

/// One certificate order
#[async_trait]
pub trait AcmeOrder: Send {
    /// Pending DNS-01 challenges; already valid authorizations are skipped
    async fn dns_challenges(&mut self) -> Result<Vec<DnsChallenge>>;

    /// Tell the server a challenge can be validated
    async fn set_ready(&mut self, url: &str) -> Result<()>;

    /// Fetch the current status
    async fn refresh(&mut self) -> Result<OrderProgress>;

    /// Submit the CSR (DER)
    async fn finalize(&mut self, csr_der: &[u8]) -> Result<()>;

    /// Certificate chain PEM once issued
    async fn certificate(&mut self) -> Result<Option<String>>;
}

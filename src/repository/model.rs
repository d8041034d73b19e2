use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::types::{IssuancePath, RenewalState, Result};

/// One certificate/key pair of a stored CA chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignerNode {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Persisted CA hierarchy, ordered from the root to the deepest intermediate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfSigner {
    pub name: String,
    pub nodes: Vec<SignerNode>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// ACME account body as reported by the directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcmeAccountBody {
    pub status: String,
    pub contact: Vec<String>,
    pub terms_of_service_agreed: bool,
    pub orders: Option<String>,
    pub only_return_existing: bool,
    /// Opaque external account binding
    pub external_account_binding: Option<serde_json::Value>,
}

/// Account body plus its URI
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcmeResource {
    pub body: AcmeAccountBody,
    pub uri: String,
}

/// Persisted ACME account, one per email
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcmeAccount {
    pub email: String,
    pub registration: AcmeResource,
    /// Serialized account credentials including the private key
    pub credentials: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// How a zone obtains its certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IssuanceMode {
    /// Signed by a stored self-signer
    SelfSigned { issuer: String },
    /// Public ACME directory; `None` uses the configured default email
    Acme { email: Option<String> },
}

impl IssuanceMode {
    pub fn path(&self) -> IssuancePath {
        match self {
            IssuanceMode::SelfSigned { .. } => IssuancePath::SelfSigned,
            IssuanceMode::Acme { .. } => IssuancePath::Acme,
        }
    }
}

/// Current certificate material of a zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneCertificate {
    pub cert_pem: String,
    pub key_pem: String,
    /// Leaf followed by its issuers
    pub chain_pem: String,
    pub expires_at: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
}

/// A managed zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub mode: IssuanceMode,
    /// SAN domains
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddr>,
    #[serde(default)]
    pub certificate: Option<ZoneCertificate>,
    #[serde(default)]
    pub last_status: Option<RenewalState>,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Zone {
    pub fn new(name: impl Into<String>, mode: IssuanceMode) -> Self {
        Self {
            name: name.into(),
            mode,
            domains: Vec::new(),
            ip_addresses: Vec::new(),
            certificate: None,
            last_status: None,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    /// Reject zones whose certificate would name nothing.
    ///
    /// ACME orders need at least one domain; self-signed leaves may carry IPs only.
    pub fn check_sans(&self) -> Result<()> {
        if self.domains.is_empty() && self.ip_addresses.is_empty() {
            return Err(Error::Config(format!("Zone '{}' has no SANs", self.name)));
        }
        if self.mode.path() == IssuancePath::Acme && self.domains.is_empty() {
            return Err(Error::Config(format!(
                "ACME zone '{}' has no SAN domains",
                self.name
            )));
        }
        Ok(())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.certificate.as_ref().map(|c| c.expires_at)
    }

    /// True when there is no certificate or it expires within `renew_before_days`
    pub fn needs_renewal(&self, now: DateTime<Utc>, renew_before_days: i64) -> bool {
        match self.expires_at() {
            Some(expires_at) => expires_at - now <= Duration::days(renew_before_days),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_without_sans_is_a_config_error() {
        let mut zone = Zone::new("example.test", IssuanceMode::Acme { email: None });
        assert_eq!(zone.mode.path(), IssuancePath::Acme);
        assert!(matches!(zone.check_sans(), Err(Error::Config(_))));

        zone.ip_addresses = vec!["192.0.2.1".parse().unwrap()];
        assert!(matches!(zone.check_sans(), Err(Error::Config(_))));

        zone.mode = IssuanceMode::SelfSigned { issuer: "ca".into() };
        assert!(zone.check_sans().is_ok());

        zone.ip_addresses.clear();
        zone.domains = vec!["example.test".into()];
        assert!(zone.check_sans().is_ok());
    }

    #[test]
    fn test_needs_renewal() {
        let now = Utc::now();
        let mut zone = Zone::new("example.test", IssuanceMode::SelfSigned { issuer: "ca".into() });
        assert!(zone.needs_renewal(now, 30));

        zone.certificate = Some(ZoneCertificate {
            cert_pem: String::new(),
            key_pem: String::new(),
            chain_pem: String::new(),
            expires_at: now + Duration::days(60),
            issued_at: now,
        });
        assert!(!zone.needs_renewal(now, 30));
        assert!(zone.needs_renewal(now + Duration::days(31), 30));
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&IssuanceMode::SelfSigned { issuer: "ca".into() }).unwrap();
        assert_eq!(json, r#"{"type":"self_signed","issuer":"ca"}"#);

        let mode: IssuanceMode = serde_json::from_str(r#"{"type":"acme","email":null}"#).unwrap();
        assert_eq!(mode, IssuanceMode::Acme { email: None });
    }
}

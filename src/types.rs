use std::fmt;
use serde::{Serialize, Deserialize};

/// Project-wide Result type
pub type Result<T> = std::result::Result<T, crate::error::Error>;

/// Progress of a single renewal attempt for one zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenewalState {
    /// Attempt accepted, nothing done yet
    Pending,
    /// ACME account loaded or registered
    AccountResolved,
    /// DNS-01 records created at the provider
    ChallengePublished,
    /// Waiting for the ACME server to validate
    Validating,
    /// Certificate stored
    Issued,
    /// Attempt ended without a certificate
    Failed,
}

impl fmt::Display for RenewalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenewalState::Pending => write!(f, "pending"),
            RenewalState::AccountResolved => write!(f, "account-resolved"),
            RenewalState::ChallengePublished => write!(f, "challenge-published"),
            RenewalState::Validating => write!(f, "validating"),
            RenewalState::Issued => write!(f, "issued"),
            RenewalState::Failed => write!(f, "failed"),
        }
    }
}

impl Default for RenewalState {
    fn default() -> Self {
        RenewalState::Pending
    }
}

/// Issuance path selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IssuancePath {
    /// Internal CA hierarchy
    SelfSigned,
    /// Public ACME directory
    Acme,
}

impl fmt::Display for IssuancePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuancePath::SelfSigned => write!(f, "self-signed"),
            IssuancePath::Acme => write!(f, "acme"),
        }
    }
}

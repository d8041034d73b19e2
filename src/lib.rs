//! zonecert - TLS certificates for managed DNS zones
//!
//! Issues certificates from a self-signed CA hierarchy or through ACME DNS-01
//! challenges answered by pluggable DNS providers, and keeps them renewed in a
//! watchable repository.

// Foundational layer
pub mod config;
pub mod error;
pub mod types;
pub mod utils;
pub mod telemetry;

// Core layer
pub mod crypto;
pub mod dns;
pub mod acme;
pub mod repository;

// Application layer
pub mod service;
pub mod controller;

// Public key types
pub use crate::config::Settings;
pub use crate::error::Error;
pub use crate::types::{IssuancePath, RenewalState, Result};
pub use crate::crypto::{CertificateIssueService, CertificateIssuer, IssuedCertificate};
pub use crate::dns::{DnsProvider, DnsProviderClient, DnsProviderRegistry, WhoisService};
pub use crate::repository::{CertificateRepository, Zone, ZoneEvent, ZoneEventKind, ZoneWatch};
pub use crate::service::{AdminCommand, CertificateService};
pub use crate::controller::{DynDnsService, RenewalController};
pub use crate::telemetry::metrics::CertMetrics;

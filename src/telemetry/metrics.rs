use prometheus::{
    register_counter_vec_with_registry, register_int_gauge_with_registry, CounterVec, Encoder,
    IntGauge, Opts, Registry, TextEncoder,
};

use crate::error::Error;
use crate::types::{IssuancePath, Result};

/// Issuance metrics
pub struct CertMetrics {
    /// Registry
    registry: Registry,
    /// Certificates issued, by path
    issued: CounterVec,
    /// Failed issuance attempts, by path
    failed: CounterVec,
    /// Challenge records currently published
    challenge_records: IntGauge,
}

impl CertMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let issued = register_counter_vec_with_registry!(
            Opts::new("zonecert_issued_total", "Number of certificates issued"),
            &["path"],
            registry
        )?;

        let failed = register_counter_vec_with_registry!(
            Opts::new("zonecert_failed_total", "Number of failed issuance attempts"),
            &["path"],
            registry
        )?;

        let challenge_records = register_int_gauge_with_registry!(
            Opts::new(
                "zonecert_challenge_records_active",
                "Number of DNS-01 challenge records currently published"
            ),
            registry
        )?;

        Ok(Self {
            registry,
            issued,
            failed,
            challenge_records,
        })
    }

    pub fn inc_issued(&self, path: IssuancePath) {
        self.issued.with_label_values(&[&path.to_string()]).inc();
    }

    pub fn inc_failed(&self, path: IssuancePath) {
        self.failed.with_label_values(&[&path.to_string()]).inc();
    }

    pub fn add_challenge_records(&self, count: usize) {
        self.challenge_records.add(count as i64);
    }

    pub fn sub_challenge_records(&self, count: usize) {
        self.challenge_records.sub(count as i64);
    }

    pub fn issued_count(&self, path: IssuancePath) -> u64 {
        self.issued.with_label_values(&[&path.to_string()]).get() as u64
    }

    pub fn failed_count(&self, path: IssuancePath) -> u64 {
        self.failed.with_label_values(&[&path.to_string()]).get() as u64
    }

    pub fn active_challenge_records(&self) -> i64 {
        self.challenge_records.get()
    }

    /// Text exposition of all metrics
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics output: {}", e)))
    }
}

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::service::CertificateService;
use crate::types::Result;

/// Periodic certificate renewal controller
pub struct RenewalController {
    /// Certificate service
    service: Arc<CertificateService>,
    /// Renew when a certificate expires within this many days
    renew_before_days: i64,
    /// Whether it is running
    running: Mutex<bool>,
}

/// Outcome of one renewal pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenewalReport {
    pub checked: usize,
    pub renewed: usize,
    pub failed: usize,
}

impl RenewalController {
    pub fn new(service: Arc<CertificateService>) -> Self {
        let renew_before_days = service.settings().certificate.renew_before_days;
        Self {
            service,
            renew_before_days,
            running: Mutex::new(false),
        }
    }

    /// Start the periodic check; returns `None` when already running
    pub fn start(self: Arc<Self>, check_interval: Duration, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        {
            let mut running = self.running.lock();
            if *running {
                return None;
            }
            *running = true;
        }

        info!(interval_secs = check_interval.as_secs(), "Starting renewal controller");
        Some(tokio::spawn(async move {
            let mut interval = time::interval(check_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = self.check_all_zones(&cancel).await {
                    error!("Failed to check zones: {}", e);
                }
            }
            *self.running.lock() = false;
            info!("Renewal controller stopped");
        }))
    }

    /// Renew every zone whose certificate is missing or about to expire.
    ///
    /// Distinct zones are renewed concurrently.
    pub async fn check_all_zones(&self, cancel: &CancellationToken) -> Result<RenewalReport> {
        debug!("Checking all zones for renewal");
        let zones = self.service.repository().list_zones("").await?;
        let now = Utc::now();

        let mut report = RenewalReport {
            checked: zones.len(),
            ..Default::default()
        };
        let mut tasks = JoinSet::new();
        for zone in zones {
            if !zone.needs_renewal(now, self.renew_before_days) {
                debug!(zone = %zone.name, "Zone does not need renewal");
                continue;
            }
            if self.service.is_in_flight(&zone.name) {
                debug!(zone = %zone.name, "Renewal already running");
                continue;
            }

            info!(zone = %zone.name, expires_at = ?zone.expires_at(), "Zone needs renewal");
            let service = self.service.clone();
            let cancel = cancel.child_token();
            tasks.spawn(async move {
                let result = service.renew_certificate(&zone.name, &cancel).await;
                (zone.name, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => report.renewed += 1,
                Ok((name, Err(e))) => {
                    warn!("Failed to renew zone {}: {}", name, e);
                    report.failed += 1;
                }
                Err(e) => {
                    error!("Renewal task panicked: {}", e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}

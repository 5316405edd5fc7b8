//! Background certificate renewal scheduler
//!
//! Periodically checks indexed certificates and renews those inside the
//! renewal window, then evicts idle entries from memory.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::store::{CertificateStore, Renewal};

/// Default check interval (12 hours)
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 3600);

/// Minimum check interval (1 minute)
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Delay before the first check after start
const INITIAL_DELAY: Duration = Duration::from_secs(10);

/// What one renewal pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenewalReport {
    /// Hostnames found inside the renewal window
    pub due: usize,
    pub renewed: usize,
    pub failed: usize,
    /// Entries dropped from memory afterwards
    pub evicted: usize,
}

/// Background certificate renewal scheduler
///
/// Renewals go through [`CertificateStore::renew`], so they share the
/// single-flight path with handshakes asking for the same name.
pub struct RenewalScheduler {
    store: Arc<CertificateStore>,
    check_interval: Duration,
    initial_delay: Duration,
}

impl RenewalScheduler {
    pub fn new(store: Arc<CertificateStore>) -> Self {
        Self {
            store,
            check_interval: DEFAULT_CHECK_INTERVAL,
            initial_delay: INITIAL_DELAY,
        }
    }

    /// Set the check interval
    ///
    /// The interval is clamped to a minimum of one minute.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval.max(MIN_CHECK_INTERVAL);
        self
    }

    /// Set the delay before the first check
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "Starting certificate renewal scheduler"
        );

        let mut ticker = interval_at(Instant::now() + self.initial_delay, self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Certificate renewal scheduler stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            debug!("Running scheduled certificate renewal check");
            let report = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Certificate renewal scheduler stopped during a check");
                    return;
                }
                report = self.tick_at(Utc::now(), Instant::now()) => report,
            };

            if report.due > 0 || report.evicted > 0 {
                info!(
                    due = report.due,
                    renewed = report.renewed,
                    failed = report.failed,
                    evicted = report.evicted,
                    "Certificate renewal check finished"
                );
            }
        }
    }

    /// One renewal pass as of `now`
    pub async fn tick_at(&self, now: DateTime<Utc>, idle_now: Instant) -> RenewalReport {
        let due = self.store.due_for_renewal(now);
        let mut report = RenewalReport {
            due: due.len(),
            ..RenewalReport::default()
        };

        for host in &due {
            match self.store.renew(host, now).await {
                Ok(Renewal::Renewed(bundle)) => {
                    info!(host = %host, expires = %bundle.not_after(), "Certificate renewed");
                    report.renewed += 1;
                }
                Ok(Renewal::NotDue) => {
                    debug!(host = %host, "Certificate no longer due");
                }
                Err(e) => {
                    // Continue with other hosts
                    error!(host = %host, error = %e, "Certificate renewal failed");
                    report.failed += 1;
                }
            }
        }

        report.evicted = self.store.evict_idle(idle_now);
        report
    }
}

impl std::fmt::Debug for RenewalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalScheduler")
            .field("check_interval", &self.check_interval)
            .field("tracked_hosts", &self.store.len())
            .finish()
    }
}

// Background redelivery of pending outbound messages

use log::{debug, error, info, warn};
use std::time::Duration;
use tokio::time::MissedTickBehavior;

use super::sender;
use crate::directory::DirectoryClient;
use crate::store::Store;

/// Counts from one retry cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub attempted: usize,
    pub delivered: usize,
    pub unresolved: usize,
    pub failed: usize,
}

/// Where we advertise ourselves; refreshed at the start of every cycle so a
/// restarted directory learns about us again
#[derive(Debug, Clone)]
pub struct Registration {
    pub ip: String,
    pub port: u16,
}

pub struct RetryWorker {
    store: Store,
    directory: DirectoryClient,
    send_timeout: Duration,
    interval: Duration,
    registration: Option<Registration>,
}

impl RetryWorker {
    pub fn new(store: Store, directory: DirectoryClient, send_timeout: Duration, interval: Duration) -> Self {
        Self {
            store,
            directory,
            send_timeout,
            interval,
            registration: None,
        }
    }

    pub fn with_registration(mut self, registration: Registration) -> Self {
        self.registration = Some(registration);
        self
    }

    /// One pass over every pending outbound message.
    ///
    /// Each message is handled independently: a miss or failed attempt leaves
    /// it pending and moves on to the next.
    pub async fn run_cycle(&self) -> RetryReport {
        let mut report = RetryReport::default();

        if let Some(registration) = &self.registration {
            if let Err(e) = self
                .directory
                .register(self.store.owner(), &registration.ip, registration.port)
                .await
            {
                warn!("Re-registration with directory failed: {}", e);
            }
        }

        let pending = match self.store.pending_outbound() {
            Ok(pending) => pending,
            Err(e) => {
                error!("Could not read pending messages: {}", e);
                return report;
            }
        };
        if pending.is_empty() {
            return report;
        }
        debug!("Retrying {} pending message(s)", pending.len());

        for message in pending {
            let location = match self.directory.resolve(&message.receiver).await {
                Some(location) => location,
                None => {
                    report.unresolved += 1;
                    continue;
                }
            };

            report.attempted += 1;
            match sender::send(&location, &message.sender, &message.text, self.send_timeout).await {
                Ok(()) => match self.store.mark_delivered(&message.id) {
                    Ok(_) => {
                        report.delivered += 1;
                        info!("Undelivered message to {} sent successfully", message.receiver);
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!("Sent message {} but could not mark it delivered: {}", message.id, e);
                    }
                },
                Err(e) => {
                    report.failed += 1;
                    warn!("Failed to send undelivered message to {}: {}", message.receiver, e);
                }
            }
        }

        report
    }

    /// Run cycles forever at the configured interval
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = self.run_cycle().await;
            if report.attempted > 0 || report.unresolved > 0 {
                info!(
                    "Retry cycle: {} delivered, {} failed, {} unresolved",
                    report.delivered, report.failed, report.unresolved
                );
            }
        }
    }
}

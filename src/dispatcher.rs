use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    clients::{events::EventSink, mail::MailTransport},
    config::{Config, DeliverySettings},
    errors::NotifierError,
    lock::LockManager,
    models::{
        delivery::DeliveryMode,
        event::{EVENT_EMAIL_QUEUED_SENT, EntityEvent},
        notification::{OutgoingMail, QueuedNotification},
    },
    store::HoldingStore,
    utils::{Throttle, log_recipients},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Queued delivery is switched off, or there is nothing to deliver or log.
    Disabled,
    /// This server still holds a partition from an earlier run.
    AlreadyRunning,
    /// Every candidate partition was taken, or nothing is queued.
    NoPartitionAcquired,
    Drained(DrainReport),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub lock_name: String,
    pub claimed: usize,
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
    pub pauses: u64,
    pub recipients: Vec<String>,
}

enum ItemResult {
    Delivered(String),
    Failed,
    Missing,
}

/// Scheduled job that drains one partition of the holding table per run.
pub struct Dispatcher {
    holding: Arc<dyn HoldingStore>,
    locks: Arc<LockManager>,
    transport: Arc<dyn MailTransport>,
    events: Arc<dyn EventSink>,
}

impl Dispatcher {
    pub fn new(
        holding: Arc<dyn HoldingStore>,
        locks: Arc<LockManager>,
        transport: Arc<dyn MailTransport>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            holding,
            locks,
            transport,
            events,
        }
    }

    pub async fn run_once(&self, settings: &DeliverySettings) -> Result<RunOutcome> {
        let server_id = self.locks.holder().to_string();
        debug!(server_id = %server_id, "Beginning dispatch run");

        if !settings.queued_delivery_enabled {
            debug!(server_id = %server_id, "Queued delivery is disabled, quitting");
            return Ok(RunOutcome::Disabled);
        }

        if settings.delivery_mode == DeliveryMode::None && !settings.log_recipients {
            debug!(
                server_id = %server_id,
                "Delivery mode is none and recipients are not logged, quitting"
            );
            return Ok(RunOutcome::Disabled);
        }

        let from = match (&settings.from_address, settings.delivery_mode) {
            (Some(from), _) => from.clone(),
            (None, DeliveryMode::Send) => return Err(NotifierError::MissingFromAddress.into()),
            (None, _) => String::new(),
        };

        let held = self.locks.held_locks().await?;
        if !held.is_empty() {
            for lock in &held {
                debug!(server_id = %server_id, lock_name = %lock.name, "Server holds a lock");
            }
            debug!(server_id = %server_id, "Server already has a lock, quitting");
            return Ok(RunOutcome::AlreadyRunning);
        }

        let names: Vec<String> = self
            .holding
            .queued_lock_names()
            .await?
            .into_iter()
            .filter(|name| name.starts_with(self.locks.prefix()))
            .collect();
        debug!(server_id = %server_id, count = names.len(), "Found queued lock names");

        for lock_name in self.locks.candidate_order(names) {
            if !self.locks.acquire(&lock_name).await? {
                debug!(
                    server_id = %server_id,
                    lock_name = %lock_name,
                    "Lock is held elsewhere, trying the next one"
                );
                continue;
            }

            debug!(server_id = %server_id, lock_name = %lock_name, "Obtained lock");

            let drained = self.drain(&lock_name, &from, settings).await;

            // The lock goes back even when the drain was abandoned.
            match self.locks.release(&lock_name).await {
                Ok(_) => debug!(server_id = %server_id, lock_name = %lock_name, "Released lock"),
                Err(e) => warn!(
                    server_id = %server_id,
                    lock_name = %lock_name,
                    error = %e,
                    "Failed to release lock, it will expire on its own"
                ),
            }

            let report = drained?;
            self.after_drain(&report, settings).await;

            return Ok(RunOutcome::Drained(report));
        }

        debug!(server_id = %server_id, "No partition obtained");

        Ok(RunOutcome::NoPartitionAcquired)
    }

    async fn drain(
        &self,
        lock_name: &str,
        from: &str,
        settings: &DeliverySettings,
    ) -> Result<DrainReport, Error> {
        // Claim first: anything queued after this point waits for the next run.
        let snapshot = self.holding.queued_ids_by_lock(lock_name).await?;

        info!(
            target: "metrics",
            server_id = %self.locks.holder(),
            lock_name,
            claimed = snapshot.len(),
            "Claimed queued notifications"
        );

        let mut report = DrainReport {
            lock_name: lock_name.to_string(),
            claimed: snapshot.len(),
            ..Default::default()
        };
        let mut throttle = Throttle::from_settings(settings, "processed");

        for id in snapshot {
            match self.deliver_one(id, from, settings.delivery_mode).await {
                ItemResult::Delivered(address) => {
                    report.delivered += 1;
                    report.recipients.push(address);
                }
                ItemResult::Failed => report.failed += 1,
                ItemResult::Missing => report.skipped += 1,
            }

            // Failed and vanished items count toward the batch too.
            throttle.record().await;
        }

        report.pauses = throttle.pauses();

        Ok(report)
    }

    /// Failures are logged and reported for this item only; a notification
    /// whose send or delete failed stays queued for a later run.
    async fn deliver_one(&self, id: Uuid, from: &str, mode: DeliveryMode) -> ItemResult {
        let notification = match self.holding.find_by_id(id).await {
            Ok(Some(notification)) => notification,
            Ok(None) => {
                warn!(id = %id, "Queued notification vanished before delivery");
                return ItemResult::Missing;
            }
            Err(e) => {
                warn!(id = %id, error = %e, "Failed to fetch queued notification");
                return ItemResult::Failed;
            }
        };

        debug!(notification = %notification, "Retrieved queued notification");

        if !self.deliver(&notification, from, mode).await {
            return ItemResult::Failed;
        }

        if let Err(e) = self.holding.delete(notification.id).await {
            warn!(
                id = %notification.id,
                to = %notification.to_address,
                error = %e,
                "Delivered notification could not be deleted, it may be sent again"
            );
            return ItemResult::Failed;
        }
        debug!(id = %notification.id, "Deleted notification from the holding table");

        ItemResult::Delivered(notification.to_address)
    }

    async fn deliver(&self, notification: &QueuedNotification, from: &str, mode: DeliveryMode) -> bool {
        match mode {
            DeliveryMode::Send => {
                let mail = OutgoingMail::from_queued(from, notification);

                match self
                    .transport
                    .send_to_addresses(&mail.from, &mail.to, &mail.subject, &mail.body, true)
                    .await
                {
                    Ok(accepted) if accepted.contains(&notification.to_address) => true,
                    Ok(_) => {
                        warn!(
                            id = %notification.id,
                            to = %notification.to_address,
                            "Transport did not accept the recipient, leaving it queued"
                        );
                        false
                    }
                    Err(e) => {
                        warn!(
                            id = %notification.id,
                            to = %notification.to_address,
                            error = %e,
                            "Failed to send queued notification, leaving it queued"
                        );
                        false
                    }
                }
            }
            DeliveryMode::Log => {
                info!(
                    to = %notification.to_address,
                    from,
                    subject = %notification.subject,
                    lock_name = %notification.lock_name,
                    body = %notification.body,
                    "Logged notification instead of sending"
                );
                true
            }
            DeliveryMode::None => {
                info!(to = %notification.to_address, "Discarded notification, delivery mode is none");
                true
            }
        }
    }

    async fn after_drain(&self, report: &DrainReport, settings: &DeliverySettings) {
        info!(
            target: "metrics",
            lock_name = %report.lock_name,
            delivered = report.delivered,
            failed = report.failed,
            skipped = report.skipped,
            "Partition drained"
        );

        if settings.log_recipients {
            log_recipients(&report.recipients, "sent");
        }

        if report.delivered > 0 && settings.delivery_mode == DeliveryMode::Send {
            let event = EntityEvent::for_partition(EVENT_EMAIL_QUEUED_SENT, &report.lock_name);
            if let Err(e) = self.events.register(&event).await {
                warn!(error = %e, lock_name = %report.lock_name, "Failed to register dispatch event");
            }
        }
    }
}

/// Drive `run_once` from a timer until the process exits. The first run waits
/// for the configured start delay plus up to ten random minutes.
pub async fn spawn_dispatch_loop(dispatcher: Arc<Dispatcher>, config: Arc<Config>) {
    let Some(schedule) = config.poll_schedule() else {
        info!("Polling for queued notifications is disabled (interval is 0)");
        return;
    };

    let jitter = Duration::from_secs(60 * rand::random_range(0..10u64));
    let start_delay = schedule.start_delay + jitter;

    info!(
        first_run_in_secs = start_delay.as_secs(),
        repeat_secs = schedule.repeat_interval.as_secs(),
        "Scheduled dispatch of queued notifications"
    );

    let mut ticker = interval_at(Instant::now() + start_delay, schedule.repeat_interval);
    // A run longer than the interval should not trigger a burst of catch-up runs.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let settings = config.delivery_settings();
        match dispatcher.run_once(&settings).await {
            Ok(RunOutcome::Drained(report)) => info!(
                lock_name = %report.lock_name,
                claimed = report.claimed,
                delivered = report.delivered,
                failed = report.failed,
                "Dispatch run finished"
            ),
            Ok(outcome) => debug!(outcome = ?outcome, "Dispatch run finished"),
            Err(e) => error!(error = %e, "Dispatch run failed"),
        }
    }
}

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::{config::DeliverySettings, models::retry::RetryConfig};

pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Retry succeeded");
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        max_attempts = config.max_attempts,
                        error = %e,
                        "Retry failed after exhausting all attempts"
                    );
                    return Err(e);
                }

                debug!(
                    operation = operation_name,
                    attempt,
                    delay_ms,
                    "Attempt failed, backing off"
                );

                let jitter = rand::random_range(-0.1..=0.1);
                let jittered_delay = (delay_ms as f64 * (1.0 + jitter)) as u64;

                sleep(Duration::from_millis(jittered_delay)).await;

                delay_ms = std::cmp::min(delay_ms * config.backoff_multiplier, config.max_delay_ms);
            }
        }
    }
}

/// Paces a delivery loop: every `batch` items it sleeps for `wait`, and every
/// `every` items it reports progress on the metrics target.
#[derive(Debug)]
pub struct Throttle {
    batch: u32,
    wait: Duration,
    every: u32,
    action: &'static str,
    processed: u64,
    pauses: u64,
}

impl Throttle {
    pub fn new(batch: u32, wait: Duration, every: u32, action: &'static str) -> Self {
        Self {
            batch,
            wait,
            every,
            action,
            processed: 0,
            pauses: 0,
        }
    }

    pub fn from_settings(settings: &DeliverySettings, action: &'static str) -> Self {
        Self::new(
            settings.batch_size,
            settings.wait_interval,
            settings.log_progress_every,
            action,
        )
    }

    /// Count one processed item, sleeping if a batch boundary was reached.
    pub async fn record(&mut self) {
        self.processed += 1;

        if self.every > 0 && self.processed % self.every as u64 == 0 {
            info!(
                target: "metrics",
                processed = self.processed,
                action = self.action,
                "Notifications {}", self.action
            );
        }

        if self.batch > 0 && !self.wait.is_zero() && self.processed % self.batch as u64 == 0 {
            info!(wait_ms = self.wait.as_millis() as u64, "Pausing delivery");
            self.pauses += 1;
            sleep(self.wait).await;
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn pauses(&self) -> u64 {
        self.pauses
    }
}

/// Sorted recipient addresses, ten per line, for the recipient log.
pub fn recipient_lines(addresses: &[String]) -> Vec<String> {
    let mut sorted = addresses.to_vec();
    sorted.sort();

    sorted.chunks(10).map(|chunk| chunk.join(",")).collect()
}

pub fn log_recipients(addresses: &[String], action: &str) {
    for line in recipient_lines(addresses) {
        info!(recipients = %line, "Notification {} for", action);
    }
}

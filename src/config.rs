use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{delivery::DeliveryMode, retry::RetryConfig};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    /// Unset runs against the in-process store, which only suits a single server.
    pub database_url: Option<String>,
    /// When set, partition locks live in redis instead of the database.
    pub redis_url: Option<String>,

    #[serde(default = "default_server_id")]
    pub server_id: String,
    #[serde(default = "default_server_url")]
    pub server_url: String,

    pub from_email_address: Option<String>,
    #[serde(default)]
    pub email_delivery_option: DeliveryMode,
    #[serde(default)]
    pub log_email_recipients: bool,

    #[serde(default = "default_true")]
    pub email_send_queued_enabled: bool,
    #[serde(default = "default_repeat_interval")]
    pub email_send_queued_repeat_interval_minutes: u64,
    #[serde(default = "default_start_interval")]
    pub email_send_queued_start_interval_minutes: u64,

    #[serde(default = "default_batch_size")]
    pub email_batch_size: u32,
    #[serde(default)]
    pub email_wait_interval_seconds: u64,
    #[serde(default = "default_log_progress_every")]
    pub log_progress_every: u32,

    #[serde(default = "default_locks_size")]
    pub email_locks_size: u32,
    #[serde(default = "default_lock_prefix")]
    pub email_lock_prefix: String,
    #[serde(default = "default_lock_ttl_hours")]
    pub email_lock_ttl_hours: u64,

    #[serde(default)]
    pub admin_add_items_number: u32,

    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,

    pub event_sink_url: Option<String>,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

/// Immutable snapshot of the delivery settings, taken once per dispatcher run
/// or builder call.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub queued_delivery_enabled: bool,
    pub from_address: Option<String>,
    pub delivery_mode: DeliveryMode,
    pub log_recipients: bool,
    pub batch_size: u32,
    pub wait_interval: Duration,
    pub log_progress_every: u32,
    pub partition_count: u32,
    pub admin_add_items: u32,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            queued_delivery_enabled: true,
            from_address: None,
            delivery_mode: DeliveryMode::Send,
            log_recipients: false,
            batch_size: default_batch_size(),
            wait_interval: Duration::ZERO,
            log_progress_every: default_log_progress_every(),
            partition_count: default_locks_size(),
            admin_add_items: 0,
        }
    }
}

/// When the dispatcher timer fires. `None` means polling is switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    pub start_delay: Duration,
    pub repeat_interval: Duration,
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        Ok(config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn delivery_settings(&self) -> DeliverySettings {
        DeliverySettings {
            queued_delivery_enabled: self.email_send_queued_enabled,
            from_address: self.from_email_address.clone(),
            delivery_mode: self.email_delivery_option,
            log_recipients: self.log_email_recipients,
            batch_size: self.email_batch_size,
            wait_interval: Duration::from_secs(self.email_wait_interval_seconds),
            log_progress_every: self.log_progress_every,
            partition_count: self.email_locks_size,
            admin_add_items: self.admin_add_items_number,
        }
    }

    pub fn lock_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.email_lock_ttl_hours as i64)
    }

    pub fn poll_schedule(&self) -> Option<PollSchedule> {
        if self.email_send_queued_repeat_interval_minutes == 0
            || self.email_send_queued_start_interval_minutes == 0
        {
            return None;
        }

        Some(PollSchedule {
            start_delay: Duration::from_secs(60 * self.email_send_queued_start_interval_minutes),
            repeat_interval: Duration::from_secs(
                60 * self.email_send_queued_repeat_interval_minutes,
            ),
        })
    }
}

fn default_server_id() -> String {
    "UNKNOWN_SERVER_ID".to_string()
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_repeat_interval() -> u64 {
    10
}

fn default_start_interval() -> u64 {
    5
}

fn default_batch_size() -> u32 {
    200
}

fn default_log_progress_every() -> u32 {
    100
}

fn default_locks_size() -> u32 {
    25
}

fn default_lock_prefix() -> String {
    "email_lock_".to_string()
}

fn default_lock_ttl_hours() -> u64 {
    48
}

fn default_smtp_port() -> u16 {
    587
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    200
}

fn default_max_retry_delay_ms() -> u64 {
    5_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_server_port() -> u16 {
    8081
}

use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::{
    config::Config, models::event::EntityEvent, models::retry::RetryConfig,
    utils::retry_with_backoff,
};

/// The host's eventing system. Registration is best effort; callers log
/// failures and carry on.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn register(&self, event: &EntityEvent) -> Result<()>;
}

/// Posts events as JSON to the host.
pub struct HttpEventSink {
    http_client: Client,
    url: String,
    retry_config: RetryConfig,
}

impl HttpEventSink {
    pub fn new(url: &str, config: &Config) -> Result<Self, Error> {
        Self::with_retry(url, config.retry_config())
    }

    pub fn with_retry(url: &str, retry_config: RetryConfig) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|_| anyhow!("Failed to create HTTP client"))?;

        info!(url, "Event sink client initialized");

        Ok(Self {
            http_client,
            url: url.to_string(),
            retry_config,
        })
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn register(&self, event: &EntityEvent) -> Result<()> {
        retry_with_backoff(&self.retry_config, "register_event", || {
            let client = self.http_client.clone();
            let url = self.url.clone();
            let event = event.clone();

            async move {
                let response = client
                    .post(&url)
                    .json(&event)
                    .send()
                    .await
                    .map_err(|e| e.to_string())?;

                let status = response.status();
                if status.is_success() {
                    Ok(())
                } else {
                    Err(format!("Event sink returned status {}", status))
                }
            }
        })
        .await
        .map_err(|e| anyhow!("Failed to register event {}: {}", event.name, e))?;

        debug!(event = %event.name, reference = %event.reference, "Entity event registered");

        Ok(())
    }
}

/// Used when no event endpoint is configured.
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn register(&self, event: &EntityEvent) -> Result<()> {
        info!(event = %event.name, reference = %event.reference, "Entity event");
        Ok(())
    }
}

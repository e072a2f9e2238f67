use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use tracing::{debug, info, warn};

use crate::config::Config;

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send one message to each address. Returns the addresses that were
    /// accepted. With `defer_failures` a rejected address is logged and left
    /// out of the result instead of failing the whole call.
    async fn send_to_addresses(
        &self,
        from: &str,
        to: &[String],
        subject: &str,
        body: &str,
        defer_failures: bool,
    ) -> Result<Vec<String>>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| anyhow!("SMTP_HOST must be set for mail delivery"))?;

        let transport = match (&config.smtp_username, &config.smtp_password) {
            (Some(username), Some(password)) => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                    .map_err(|e| anyhow!("Invalid SMTP relay {}: {}", host, e))?
                    .port(config.smtp_port)
                    .credentials(Credentials::new(username.clone(), password.clone()))
                    .build()
            }
            // Unauthenticated relays are local MTAs; no TLS upgrade.
            _ => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                .port(config.smtp_port)
                .build(),
        };

        info!(host, port = config.smtp_port, "SMTP mailer initialized");

        Ok(Self { transport })
    }

    fn build_message(from: &Mailbox, to: &str, subject: &str, body: &str) -> Result<Message> {
        let recipient: Mailbox = to
            .parse()
            .map_err(|e| anyhow!("Invalid recipient address {}: {}", to, e))?;

        Message::builder()
            .from(from.clone())
            .to(recipient)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| anyhow!("Failed to build message for {}: {}", to, e))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send_to_addresses(
        &self,
        from: &str,
        to: &[String],
        subject: &str,
        body: &str,
        defer_failures: bool,
    ) -> Result<Vec<String>> {
        let sender: Mailbox = from
            .parse()
            .map_err(|e| anyhow!("Invalid from address {}: {}", from, e))?;

        let mut accepted = Vec::with_capacity(to.len());

        for address in to {
            let outcome = match Self::build_message(&sender, address, subject, body) {
                Ok(message) => self
                    .transport
                    .send(message)
                    .await
                    .map(|_| ())
                    .map_err(|e| anyhow!("SMTP send to {} failed: {}", address, e)),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(()) => {
                    debug!(to = %address, "Mail accepted by relay");
                    accepted.push(address.clone());
                }
                Err(e) if defer_failures => {
                    warn!(to = %address, error = %e, "Deferred mail failure");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(accepted)
    }
}

/// Stands in for SMTP when the delivery mode never reaches the transport.
pub struct LogTransport;

#[async_trait]
impl MailTransport for LogTransport {
    async fn send_to_addresses(
        &self,
        from: &str,
        to: &[String],
        subject: &str,
        _body: &str,
        _defer_failures: bool,
    ) -> Result<Vec<String>> {
        for address in to {
            info!(to = %address, from, subject, "Mail not sent, no SMTP relay configured");
        }

        Ok(to.to_vec())
    }
}

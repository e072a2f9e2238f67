use std::fmt::{Display, Formatter, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A rendered notification waiting in the holding table for the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedNotification {
    pub id: Uuid,
    pub lock_name: String,
    pub to_address: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewQueuedNotification {
    pub lock_name: String,
    pub to_address: String,
    pub subject: String,
    pub body: String,
}

impl NewQueuedNotification {
    pub fn new(
        lock_name: impl Into<String>,
        to_address: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            lock_name: lock_name.into(),
            to_address: to_address.into(),
            subject: subject.into(),
            body: body.into(),
        }
    }

    pub fn into_queued(self) -> QueuedNotification {
        QueuedNotification {
            id: Uuid::new_v4(),
            lock_name: self.lock_name,
            to_address: self.to_address,
            subject: self.subject,
            body: self.body,
            created_at: Utc::now(),
        }
    }
}

// Bodies can be large, keep log lines to the envelope.
impl Display for QueuedNotification {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "QueuedNotification(id={}, lock={}, to={}, subject={:?})",
            self.id, self.lock_name, self.to_address, self.subject
        )
    }
}

/// A message ready to hand to the mail transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl OutgoingMail {
    pub fn from_queued(from: &str, notification: &QueuedNotification) -> Self {
        Self {
            from: from.to_string(),
            to: vec![notification.to_address.clone()],
            subject: notification.subject.clone(),
            body: notification.body.clone(),
        }
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const EVENT_EMAIL_CREATED: &str = "eval.email.eval.created";
pub const EVENT_EMAIL_AVAILABLE: &str = "eval.email.eval.available";
pub const EVENT_EMAIL_GROUP_AVAILABLE: &str = "eval.email.evalgroup.available";
pub const EVENT_EMAIL_REMINDER: &str = "eval.email.eval.reminders";
pub const EVENT_EMAIL_RESULTS: &str = "eval.email.eval.results";
pub const EVENT_EMAIL_QUEUED_SENT: &str = "eval.email.queued.sent";

/// Fire-and-forget notice for the host's eventing system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityEvent {
    pub name: String,
    pub reference: String,
    pub occurred_at: DateTime<Utc>,
}

impl EntityEvent {
    pub fn for_evaluation(name: &str, evaluation_id: i64) -> Self {
        Self {
            name: name.to_string(),
            reference: format!("/eval-evaluation/{}", evaluation_id),
            occurred_at: Utc::now(),
        }
    }

    pub fn for_partition(name: &str, lock_name: &str) -> Self {
        Self {
            name: name.to_string(),
            reference: format!("/eval-queued-email/{}", lock_name),
            occurred_at: Utc::now(),
        }
    }
}

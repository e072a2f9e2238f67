use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

/// How outbound notifications leave the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Submit through the mail transport.
    #[default]
    Send,
    /// Write the full message to the operational log instead of sending.
    Log,
    /// Deliver nothing.
    None,
}

impl Display for DeliveryMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            DeliveryMode::Send => write!(f, "send"),
            DeliveryMode::Log => write!(f, "log"),
            DeliveryMode::None => write!(f, "none"),
        }
    }
}

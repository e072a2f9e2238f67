use std::fmt::{Display, Formatter, Result};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateType {
    Created,
    Available,
    AvailableOptIn,
    Reminder,
    Results,
    SubmissionConfirmation,
}

impl Display for TemplateType {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            TemplateType::Created => write!(f, "Created"),
            TemplateType::Available => write!(f, "Available"),
            TemplateType::AvailableOptIn => write!(f, "AvailableOptIn"),
            TemplateType::Reminder => write!(f, "Reminder"),
            TemplateType::Results => write!(f, "Results"),
            TemplateType::SubmissionConfirmation => write!(f, "SubmissionConfirmation"),
        }
    }
}

/// Subject/body pair with `${Name}` placeholders.
///
/// `evaluation_id` is set when the template overrides the system default for
/// one evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationTemplate {
    pub id: String,
    pub template_type: TemplateType,
    pub subject: String,
    pub body: String,
    pub evaluation_id: Option<i64>,
}

impl NotificationTemplate {
    pub fn default_for(
        template_type: TemplateType,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("default-{}", template_type),
            template_type,
            subject: subject.into(),
            body: body.into(),
            evaluation_id: None,
        }
    }

    pub fn for_evaluation(
        evaluation_id: i64,
        template_type: TemplateType,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("eval-{}-{}", evaluation_id, template_type),
            template_type,
            subject: subject.into(),
            body: body.into(),
            evaluation_id: Some(evaluation_id),
        }
    }

    pub fn is_override(&self) -> bool {
        self.evaluation_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedContent {
    pub subject: String,
    pub body: String,
}

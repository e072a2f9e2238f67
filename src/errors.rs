use thiserror::Error;

use crate::models::template::TemplateType;

/// Configuration and precondition failures. These surface to the caller and
/// are never retried.
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("cannot find notification template default or in evaluation ({evaluation_id:?}): {template_type}")]
    TemplateNotFound {
        template_type: TemplateType,
        evaluation_id: Option<i64>,
    },

    #[error("could not get a from email address from system settings or the evaluation")]
    MissingFromAddress,

    #[error("cannot find evaluation with id: {0}")]
    EvaluationNotFound(i64),

    #[error("invalid group type for group with id ({0}), cannot send available notifications")]
    InvalidGroup(String),

    #[error("no email address known for user {0}")]
    MissingRecipient(String),
}

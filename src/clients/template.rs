use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error};

use crate::{
    clients::host::EvaluationService,
    errors::NotifierError,
    models::{
        evaluation::{EvalGroup, Evaluation},
        template::{NotificationTemplate, RenderedContent, TemplateType},
    },
};

/// Shown wherever a date is not set.
pub const NO_DATE_AVAILABLE: &str = "--------";

pub const CONDITIONAL_FLAGS: [&str; 4] = [
    "ShowAddItemsText",
    "ShowOptInText",
    "ShowOptOutText",
    "ShowResultsSharedText",
];

/// Replace each `${Key}` that has a value in `values`. Placeholders without a
/// value stay in the output untouched.
pub fn render(template: &str, values: &HashMap<String, String>) -> String {
    let mut output = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                // `${A ${B}`: the first opener is literal text, rescan from the second.
                if let Some(inner) = key.find("${") {
                    output.push_str(&rest[start..start + 2 + inner]);
                    rest = &after[inner..];
                    continue;
                }
                match values.get(key) {
                    Some(value) => output.push_str(value),
                    None => output.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);

    output
}

pub fn render_template(
    template: &NotificationTemplate,
    values: &HashMap<String, String>,
) -> RenderedContent {
    debug!(
        template_id = %template.id,
        variable_count = values.len(),
        "Rendering template"
    );

    RenderedContent {
        subject: render(&template.subject, values),
        body: render(&template.body, values),
    }
}

pub fn format_date(date: DateTime<Utc>) -> String {
    date.format("%b %-d, %Y").to_string()
}

/// Fill in the values every evaluation template relies on, keeping anything
/// the caller already set (such as the conditional flags).
pub fn evaluation_values(
    values: &mut HashMap<String, String>,
    evaluation: &Evaluation,
    group: &EvalGroup,
    entity_url: &str,
    server_url: &str,
) {
    values.insert("EvalTitle".to_string(), evaluation.title.clone());
    values.insert(
        "EvalStartDate".to_string(),
        format_date(evaluation.start_date),
    );

    let due_date = evaluation
        .due_date
        .map(format_date)
        .unwrap_or_else(|| NO_DATE_AVAILABLE.to_string());
    let results_date = evaluation
        .view_date
        .map(format_date)
        .unwrap_or_else(|| due_date.clone());
    values.insert("EvalDueDate".to_string(), due_date);
    values.insert("EvalResultsDate".to_string(), results_date);
    values.insert("EvalGroupTitle".to_string(), group.title.clone());

    for flag in CONDITIONAL_FLAGS {
        values
            .entry(flag.to_string())
            .or_insert_with(|| "false".to_string());
    }

    // Access is decided by the user's permissions, so one link serves every action.
    for key in [
        "URLtoTakeEval",
        "URLtoAddItems",
        "URLtoOptIn",
        "URLtoOptOut",
        "URLtoViewResults",
    ] {
        values.insert(key.to_string(), entity_url.to_string());
    }
    values.insert("URLtoSystem".to_string(), server_url.to_string());
}

/// Picks the template for a notification: the evaluation's own template wins
/// over the system default of the same type.
pub struct TemplateResolver {
    evaluations: Arc<dyn EvaluationService>,
}

impl TemplateResolver {
    pub fn new(evaluations: Arc<dyn EvaluationService>) -> Self {
        Self { evaluations }
    }

    pub async fn resolve(
        &self,
        template_type: TemplateType,
        evaluation_id: Option<i64>,
    ) -> Result<NotificationTemplate> {
        if let Some(evaluation_id) = evaluation_id {
            if let Some(template) = self
                .evaluations
                .evaluation_template(evaluation_id, template_type)
                .await?
            {
                return Ok(template);
            }
        }

        let default = match self.evaluations.default_template(template_type).await {
            Ok(template) => template,
            Err(e) => {
                error!(
                    template_type = %template_type,
                    error = %e,
                    "Failed to get default notification template"
                );
                None
            }
        };

        default.ok_or_else(|| {
            NotifierError::TemplateNotFound {
                template_type,
                evaluation_id,
            }
            .into()
        })
    }
}

//! Interfaces onto the hosting collaboration suite. The service never owns
//! evaluations, groups or users; it only reads them through these traits.

use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    evaluation::{AssignGroup, EvalGroup, Evaluation, IncludeFilter, Permission},
    template::{NotificationTemplate, TemplateType},
};

#[async_trait]
pub trait MembershipResolver: Send + Sync {
    async fn user_ids_for_group(
        &self,
        group_id: &str,
        permission: Permission,
    ) -> Result<BTreeSet<String>>;
}

#[async_trait]
pub trait EvaluationService: Send + Sync {
    async fn evaluation_by_id(&self, evaluation_id: i64) -> Result<Option<Evaluation>>;

    async fn groups_for_evaluation(&self, evaluation_id: i64) -> Result<Vec<EvalGroup>>;

    async fn assign_groups_for_evaluation(&self, evaluation_id: i64) -> Result<Vec<AssignGroup>>;

    async fn group_by_id(&self, group_id: &str) -> Result<EvalGroup>;

    /// The evaluation's own template of this type, if it has one.
    async fn evaluation_template(
        &self,
        evaluation_id: i64,
        template_type: TemplateType,
    ) -> Result<Option<NotificationTemplate>>;

    async fn default_template(
        &self,
        template_type: TemplateType,
    ) -> Result<Option<NotificationTemplate>>;

    async fn user_ids_taking_evaluation(
        &self,
        evaluation_id: i64,
        group_id: &str,
        include: IncludeFilter,
    ) -> Result<BTreeSet<String>>;

    /// Active evaluations, split on whether their announcement went out.
    async fn active_evaluation_ids(&self, available_email_sent: bool) -> Result<Vec<i64>>;

    async fn mark_available_email_sent(&self, evaluation_ids: &[i64]) -> Result<()>;

    /// Direct link to the evaluation, scoped to the group when given.
    async fn entity_url(&self, evaluation_id: i64, group_id: Option<&str>) -> Result<String>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn email_for_user(&self, user_id: &str) -> Result<Option<String>>;

    async fn workspace_url(&self, user_id: &str) -> Result<String>;

    fn server_url(&self) -> String;

    fn tool_title(&self) -> String;
}

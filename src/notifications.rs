use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    clients::{
        events::EventSink,
        host::{EvaluationService, MembershipResolver, UserDirectory},
        mail::MailTransport,
        template::{NO_DATE_AVAILABLE, TemplateResolver, evaluation_values, format_date, render},
    },
    config::DeliverySettings,
    errors::NotifierError,
    lock::LockManager,
    models::{
        delivery::DeliveryMode,
        evaluation::{
            EvalGroup, Evaluation, IncludeFilter, InstructorOpt, Permission, ResultsAudience,
            ResultsSharing,
        },
        event::{
            EVENT_EMAIL_AVAILABLE, EVENT_EMAIL_CREATED, EVENT_EMAIL_GROUP_AVAILABLE,
            EVENT_EMAIL_REMINDER, EVENT_EMAIL_RESULTS, EntityEvent,
        },
        notification::NewQueuedNotification,
        template::{NotificationTemplate, TemplateType},
    },
    store::HoldingStore,
    utils::{Throttle, log_recipients},
};

/// Collaborators the builders read from and write to.
pub struct NotificationDeps {
    pub evaluations: Arc<dyn EvaluationService>,
    pub membership: Arc<dyn MembershipResolver>,
    pub users: Arc<dyn UserDirectory>,
    pub transport: Arc<dyn MailTransport>,
    pub holding: Arc<dyn HoldingStore>,
    pub events: Arc<dyn EventSink>,
    pub locks: Arc<LockManager>,
}

/// Per-recipient aggregation for the single-email paths: every distinct
/// template across the recipient's evaluations, plus the earliest due date.
#[derive(Debug, Default)]
pub struct SingleEmailPlan {
    templates: BTreeMap<String, BTreeMap<String, NotificationTemplate>>,
    earliest_due: HashMap<String, DateTime<Utc>>,
}

impl SingleEmailPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_evaluation(
        &mut self,
        template: &NotificationTemplate,
        due_date: Option<DateTime<Utc>>,
        user_ids: &BTreeSet<String>,
    ) {
        record_earliest_due_dates(&mut self.earliest_due, due_date, user_ids);

        for user_id in user_ids {
            self.templates
                .entry(user_id.clone())
                .or_default()
                .entry(template.id.clone())
                .or_insert_with(|| template.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn user_count(&self) -> usize {
        self.templates.len()
    }

    pub fn templates_for(&self, user_id: &str) -> Vec<&NotificationTemplate> {
        self.templates
            .get(user_id)
            .map(|templates| templates.values().collect())
            .unwrap_or_default()
    }

    pub fn earliest_due_date(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.earliest_due.get(user_id).copied()
    }

    fn users(&self) -> impl Iterator<Item = &String> {
        self.templates.keys()
    }
}

/// Keep the earliest due date seen for each user. Evaluations without a due
/// date leave the map alone.
pub fn record_earliest_due_dates(
    earliest: &mut HashMap<String, DateTime<Utc>>,
    due_date: Option<DateTime<Utc>>,
    user_ids: &BTreeSet<String>,
) {
    let Some(due_date) = due_date else {
        return;
    };

    for user_id in user_ids {
        earliest
            .entry(user_id.clone())
            .and_modify(|current| {
                if *current > due_date {
                    *current = due_date;
                }
            })
            .or_insert(due_date);
    }
}

/// Builds and sends or queues evaluation notifications.
///
/// The evaluation host embeds this as a library: it implements the host
/// traits in `clients::host` and calls the builders from its own lifecycle
/// hooks and jobs. The binary only runs the dispatcher.
pub struct NotificationService {
    evaluations: Arc<dyn EvaluationService>,
    membership: Arc<dyn MembershipResolver>,
    users: Arc<dyn UserDirectory>,
    transport: Arc<dyn MailTransport>,
    holding: Arc<dyn HoldingStore>,
    events: Arc<dyn EventSink>,
    locks: Arc<LockManager>,
    templates: TemplateResolver,
    settings: DeliverySettings,
}

impl NotificationService {
    pub fn new(deps: NotificationDeps, settings: DeliverySettings) -> Self {
        Self {
            templates: TemplateResolver::new(deps.evaluations.clone()),
            evaluations: deps.evaluations,
            membership: deps.membership,
            users: deps.users,
            transport: deps.transport,
            holding: deps.holding,
            events: deps.events,
            locks: deps.locks,
            settings,
        }
    }

    /// Tell evaluatees (and optionally the owner) that an evaluation exists.
    pub async fn send_created(&self, evaluation_id: i64, include_owner: bool) -> Result<Vec<String>> {
        debug!(evaluation_id, include_owner, "Sending evaluation created notifications");

        let evaluation = self.evaluation_or_fail(evaluation_id).await?;
        let from = self.from_address_or_fail(&evaluation)?;
        let template = self
            .templates
            .resolve(TemplateType::Created, Some(evaluation_id))
            .await?;

        let mut values = HashMap::new();
        values.insert("HelpdeskEmail".to_string(), from.clone());

        let add_items = self.settings.admin_add_items;
        if evaluation.instructor_opt != InstructorOpt::Required || add_items > 0 {
            match evaluation.instructor_opt {
                InstructorOpt::OptIn => {
                    values.insert("ShowOptInText".to_string(), "true".to_string());
                }
                InstructorOpt::OptOut => {
                    values.insert("ShowOptOutText".to_string(), "true".to_string());
                }
                InstructorOpt::Required => {}
            }
            if add_items > 0 {
                values.insert("ShowAddItemsText".to_string(), "true".to_string());
            }
        }

        let groups = self.evaluations.groups_for_evaluation(evaluation_id).await?;
        debug!(evaluation_id, groups = groups.len(), "Found groups for new evaluation");

        let mut sent = Vec::new();
        for group in groups.iter().filter(|g| g.is_valid()) {
            let mut user_ids = self
                .membership
                .user_ids_for_group(&group.id, Permission::BeEvaluated)
                .await?;

            if include_owner {
                user_ids.insert(evaluation.owner.clone());
            } else {
                user_ids.remove(&evaluation.owner);
            }

            if user_ids.is_empty() {
                continue;
            }

            let addresses = self
                .send_group(&evaluation, group, &template, values.clone(), &from, &user_ids)
                .await?;
            info!(
                evaluation_id,
                group_id = %group.id,
                sent = addresses.len(),
                attempted = user_ids.len(),
                "Sent evaluation created notifications"
            );
            sent.extend(addresses);
            self.register_event(EVENT_EMAIL_CREATED, evaluation_id).await;
        }

        Ok(sent)
    }

    /// Announce an open evaluation. Groups whose instructor has not yet opted
    /// in get the opt-in request instead, sent to the instructors.
    pub async fn send_available(
        &self,
        evaluation_id: i64,
        include_evaluatees: bool,
    ) -> Result<Vec<String>> {
        debug!(evaluation_id, include_evaluatees, "Sending evaluation available notifications");

        let evaluation = self.evaluation_or_fail(evaluation_id).await?;
        let from = self.from_address_or_fail(&evaluation)?;
        let template = self
            .templates
            .resolve(TemplateType::Available, Some(evaluation_id))
            .await?;
        let opt_in_template = self
            .templates
            .resolve(TemplateType::AvailableOptIn, None)
            .await?;

        let assign_groups = self
            .evaluations
            .assign_groups_for_evaluation(evaluation_id)
            .await?;

        let mut sent = Vec::new();
        for assign_group in &assign_groups {
            let group = self.evaluations.group_by_id(&assign_group.group_id).await?;
            if !group.is_valid() {
                warn!(group_id = %group.id, "Skipping invalid group for available notifications");
                continue;
            }

            let students_notified = evaluation.instructor_opt == InstructorOpt::Required
                || assign_group.instructor_approval;

            let (user_ids, current_template) = if students_notified {
                let users = self
                    .membership
                    .user_ids_for_group(&group.id, Permission::TakeEvaluation)
                    .await?;
                (users, &template)
            } else if evaluation.instructor_opt == InstructorOpt::OptIn && include_evaluatees {
                let users = self
                    .membership
                    .user_ids_for_group(&group.id, Permission::BeEvaluated)
                    .await?;
                (users, &opt_in_template)
            } else {
                (BTreeSet::new(), &template)
            };

            if user_ids.is_empty() {
                continue;
            }

            let mut values = HashMap::new();
            values.insert("HelpdeskEmail".to_string(), from.clone());

            let addresses = self
                .send_group(&evaluation, &group, current_template, values, &from, &user_ids)
                .await?;
            info!(
                evaluation_id,
                group_id = %group.id,
                sent = addresses.len(),
                attempted = user_ids.len(),
                "Sent evaluation available notifications"
            );
            sent.extend(addresses);
            self.register_event(EVENT_EMAIL_AVAILABLE, evaluation_id).await;
        }

        Ok(sent)
    }

    /// Announce an evaluation to the evaluators of one group, typically after
    /// its instructor opted in.
    pub async fn send_available_to_group(
        &self,
        evaluation_id: i64,
        group_id: &str,
    ) -> Result<Vec<String>> {
        let group = self.evaluations.group_by_id(group_id).await?;
        if !group.is_valid() {
            return Err(NotifierError::InvalidGroup(group_id.to_string()).into());
        }

        let evaluation = self.evaluation_or_fail(evaluation_id).await?;
        let from = self.from_address_or_fail(&evaluation)?;
        let template = self
            .templates
            .resolve(TemplateType::AvailableOptIn, Some(evaluation_id))
            .await?;

        let user_ids = self
            .membership
            .user_ids_for_group(&group.id, Permission::TakeEvaluation)
            .await?;
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut values = HashMap::new();
        values.insert("HelpdeskEmail".to_string(), from.clone());

        let sent = self
            .send_group(&evaluation, &group, &template, values, &from, &user_ids)
            .await?;
        info!(
            evaluation_id,
            group_id,
            sent = sent.len(),
            attempted = user_ids.len(),
            "Sent evaluation available group notifications"
        );
        self.register_event(EVENT_EMAIL_GROUP_AVAILABLE, evaluation_id).await;

        Ok(sent)
    }

    pub async fn send_reminders(
        &self,
        evaluation_id: i64,
        include: IncludeFilter,
    ) -> Result<Vec<String>> {
        debug!(evaluation_id, include = ?include, "Sending evaluation reminders");

        let evaluation = self.evaluation_or_fail(evaluation_id).await?;
        let from = self.from_address_or_fail(&evaluation)?;
        let template = self
            .templates
            .resolve(TemplateType::Reminder, Some(evaluation_id))
            .await?;

        let groups = self.evaluations.groups_for_evaluation(evaluation_id).await?;
        debug!(evaluation_id, groups = groups.len(), "Found groups for reminders");

        let mut sent = Vec::new();
        for group in groups.iter().filter(|g| g.is_valid()) {
            let user_ids = self
                .evaluations
                .user_ids_taking_evaluation(evaluation_id, &group.id, include)
                .await?;
            if user_ids.is_empty() {
                continue;
            }

            let mut values = HashMap::new();
            values.insert("HelpdeskEmail".to_string(), from.clone());

            let addresses = self
                .send_group(&evaluation, group, &template, values, &from, &user_ids)
                .await?;
            info!(
                evaluation_id,
                group_id = %group.id,
                sent = addresses.len(),
                attempted = user_ids.len(),
                "Sent evaluation reminders"
            );
            sent.extend(addresses);
            self.register_event(EVENT_EMAIL_REMINDER, evaluation_id).await;
        }

        Ok(sent)
    }

    /// Results go out on separate dates per audience; `audience` selects which
    /// of the owner, instructors or students this call is for.
    pub async fn send_results(
        &self,
        evaluation_id: i64,
        include_evaluatees: bool,
        include_admins: bool,
        audience: ResultsAudience,
    ) -> Result<Vec<String>> {
        debug!(
            evaluation_id,
            include_evaluatees,
            include_admins,
            audience = ?audience,
            "Sending evaluation results notifications"
        );

        let evaluation = self.evaluation_or_fail(evaluation_id).await?;
        let from = self.from_address_or_fail(&evaluation)?;
        let template = self
            .templates
            .resolve(TemplateType::Results, Some(evaluation_id))
            .await?;

        let groups: HashMap<String, EvalGroup> = self
            .evaluations
            .groups_for_evaluation(evaluation_id)
            .await?
            .into_iter()
            .map(|g| (g.id.clone(), g))
            .collect();
        let assign_groups = self
            .evaluations
            .assign_groups_for_evaluation(evaluation_id)
            .await?;

        let shared = evaluation.results_sharing != ResultsSharing::Private;

        let mut sent = Vec::new();
        for assign_group in &assign_groups {
            let group = match groups.get(&assign_group.group_id) {
                Some(group) if group.is_valid() => group,
                _ => {
                    warn!(
                        group_id = %assign_group.group_id,
                        "Invalid group returned, could not send results notifications"
                    );
                    continue;
                }
            };

            let mut user_ids = BTreeSet::new();
            if audience == ResultsAudience::Owner {
                user_ids.insert(evaluation.owner.clone());
            }

            if shared {
                if include_admins
                    && assign_group.instructors_view_results
                    && audience == ResultsAudience::Instructors
                {
                    user_ids.extend(
                        self.membership
                            .user_ids_for_group(&group.id, Permission::BeEvaluated)
                            .await?,
                    );
                }

                if include_evaluatees
                    && assign_group.students_view_results
                    && audience == ResultsAudience::Students
                {
                    user_ids.extend(
                        self.membership
                            .user_ids_for_group(&group.id, Permission::TakeEvaluation)
                            .await?,
                    );
                }
            }

            if user_ids.is_empty() {
                continue;
            }

            let mut values = HashMap::new();
            values.insert("HelpdeskEmail".to_string(), from.clone());
            values.insert("ShowResultsSharedText".to_string(), shared.to_string());

            let addresses = self
                .send_group(&evaluation, group, &template, values, &from, &user_ids)
                .await?;
            info!(
                evaluation_id,
                group_id = %group.id,
                sent = addresses.len(),
                attempted = user_ids.len(),
                "Sent evaluation results notifications"
            );
            sent.extend(addresses);
            self.register_event(EVENT_EMAIL_RESULTS, evaluation_id).await;
        }

        Ok(sent)
    }

    /// Receipt for a user who just submitted. Returns the address it went to,
    /// or `None` when nothing was delivered.
    pub async fn send_submission_confirmation(
        &self,
        evaluation_id: i64,
        user_id: &str,
    ) -> Result<Option<String>> {
        if self.settings.delivery_mode == DeliveryMode::None {
            return Ok(None);
        }

        let evaluation = self.evaluation_or_fail(evaluation_id).await?;
        let from = self.from_address_or_fail(&evaluation)?;
        let template = self
            .templates
            .resolve(TemplateType::SubmissionConfirmation, None)
            .await?;
        let to = self
            .users
            .email_for_user(user_id)
            .await?
            .ok_or_else(|| NotifierError::MissingRecipient(user_id.to_string()))?;

        let mut values = HashMap::new();
        values.insert("UserName".to_string(), user_id.to_string());
        values.insert("EvalToolTitle".to_string(), self.users.tool_title());
        values.insert("EvalTitle".to_string(), evaluation.title.clone());
        values.insert(
            "TimeStamp".to_string(),
            Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        );
        values.insert("URLtoSystem".to_string(), self.users.server_url());

        let subject = render(&template.subject, &values);
        let body = render(&template.body, &values);

        let delivered = self
            .deliver_now(&from, &[to.clone()], &subject, &body)
            .await?;

        Ok(delivered.into_iter().next())
    }

    /// Queue one announcement per template for every user taking an evaluation
    /// that has not been announced yet, then mark those evaluations announced.
    pub async fn queue_available_single_email(&self) -> Result<Vec<String>> {
        info!("Queuing first notifications");

        let evaluation_ids = self.evaluations.active_evaluation_ids(false).await?;
        info!(
            evaluations = evaluation_ids.len(),
            "Active evaluations needing first notification"
        );

        if evaluation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let plan = self
            .build_single_email_plan(&evaluation_ids, TemplateType::Available, IncludeFilter::All)
            .await?;
        let queued = self.queue_single_emails(&plan).await?;

        self.evaluations
            .mark_available_email_sent(&evaluation_ids)
            .await?;
        info!(
            evaluations = evaluation_ids.len(),
            "Marked evaluations as announced"
        );

        Ok(queued)
    }

    /// Queue one reminder per template for every user who has not yet
    /// responded to an announced, active evaluation.
    pub async fn queue_reminder_single_email(&self) -> Result<Vec<String>> {
        info!("Queuing reminders");

        let evaluation_ids = self.evaluations.active_evaluation_ids(true).await?;
        info!(
            evaluations = evaluation_ids.len(),
            "Active evaluations needing reminders"
        );

        if evaluation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let plan = self
            .build_single_email_plan(
                &evaluation_ids,
                TemplateType::Reminder,
                IncludeFilter::NonTakers,
            )
            .await?;

        self.queue_single_emails(&plan).await
    }

    pub async fn build_single_email_plan(
        &self,
        evaluation_ids: &[i64],
        template_type: TemplateType,
        include: IncludeFilter,
    ) -> Result<SingleEmailPlan> {
        let mut plan = SingleEmailPlan::new();

        for &evaluation_id in evaluation_ids {
            let evaluation = match self.evaluations.evaluation_by_id(evaluation_id).await? {
                Some(evaluation) => evaluation,
                None => {
                    warn!(evaluation_id, "Active evaluation vanished, skipping");
                    continue;
                }
            };

            let template = match self
                .templates
                .resolve(template_type, Some(evaluation_id))
                .await
            {
                Ok(template) => template,
                Err(e) => {
                    warn!(evaluation_id, error = %e, "No template for evaluation, skipping");
                    continue;
                }
            };

            let mut user_ids = BTreeSet::new();
            for assign_group in self
                .evaluations
                .assign_groups_for_evaluation(evaluation_id)
                .await?
            {
                user_ids.extend(
                    self.evaluations
                        .user_ids_taking_evaluation(evaluation_id, &assign_group.group_id, include)
                        .await?,
                );
            }

            plan.add_evaluation(&template, evaluation.due_date, &user_ids);
        }

        info!(
            target: "metrics",
            evaluations = evaluation_ids.len(),
            users = plan.user_count(),
            "Collected single email recipients"
        );

        Ok(plan)
    }

    async fn queue_single_emails(&self, plan: &SingleEmailPlan) -> Result<Vec<String>> {
        let mode = self.settings.delivery_mode;

        if mode == DeliveryMode::None && !self.settings.log_recipients {
            warn!("Delivery mode is none and recipients are not logged, nothing to queue");
            return Ok(Vec::new());
        }

        if plan.is_empty() {
            return Ok(Vec::new());
        }

        let from = match (&self.settings.from_address, mode) {
            (Some(from), _) => from.clone(),
            (None, DeliveryMode::Send) => return Err(NotifierError::MissingFromAddress.into()),
            (None, _) => String::new(),
        };

        info!(users = plan.user_count(), "Unique users in the single email queue");

        let mut throttle = Throttle::from_settings(&self.settings, "queued");
        let mut queued = Vec::new();

        for user_id in plan.users() {
            if let Err(e) = self
                .queue_for_user(plan, user_id, &from, &mut throttle, &mut queued)
                .await
            {
                warn!(user_id = %user_id, error = %e, "Failed to queue notifications for user");
            }
        }

        info!(
            target: "metrics",
            processed = throttle.processed(),
            "Total notifications queued"
        );

        if self.settings.log_recipients {
            log_recipients(&queued, "queued");
        }

        info!("Queuing of notifications is done");

        Ok(queued)
    }

    async fn queue_for_user(
        &self,
        plan: &SingleEmailPlan,
        user_id: &str,
        from: &str,
        throttle: &mut Throttle,
        queued: &mut Vec<String>,
    ) -> Result<()> {
        let earliest = plan
            .earliest_due_date(user_id)
            .map(format_date)
            .unwrap_or_else(|| NO_DATE_AVAILABLE.to_string());

        let mut values = HashMap::new();
        values.insert("EarliestEvalDueDate".to_string(), earliest);
        values.insert(
            "MyWorkspaceDashboard".to_string(),
            self.users.workspace_url(user_id).await?,
        );
        values.insert("HelpdeskEmail".to_string(), from.to_string());
        values.insert("EvalToolTitle".to_string(), self.users.tool_title());
        values.insert("URLtoSystem".to_string(), self.users.server_url());

        let to = self
            .users
            .email_for_user(user_id)
            .await?
            .ok_or_else(|| NotifierError::MissingRecipient(user_id.to_string()))?;

        for template in plan.templates_for(user_id) {
            let subject = render(&template.subject, &values);
            let body = render(&template.body, &values);
            let lock_name = self.locks.random_partition(self.settings.partition_count);

            match self.settings.delivery_mode {
                DeliveryMode::Send => {
                    let saved = self
                        .holding
                        .save(NewQueuedNotification::new(lock_name, &to, subject, body))
                        .await?;
                    debug!(notification = %saved, "Queued notification");
                    queued.push(to.clone());
                }
                DeliveryMode::Log => {
                    info!(to = %to, from, subject = %subject, lock_name = %lock_name, "Logged notification instead of queuing");
                    debug!(lock_name = %lock_name, body = %body, "Logged notification body");
                    queued.push(to.clone());
                }
                DeliveryMode::None => {
                    info!(to = %to, "Delivery mode is none, notification not queued");
                }
            }

            throttle.record().await;
        }

        Ok(())
    }

    /// Render the template for one group and send it to every user in it.
    async fn send_group(
        &self,
        evaluation: &Evaluation,
        group: &EvalGroup,
        template: &NotificationTemplate,
        mut values: HashMap<String, String>,
        from: &str,
        user_ids: &BTreeSet<String>,
    ) -> Result<Vec<String>> {
        let entity_url = self
            .evaluations
            .entity_url(evaluation.id, Some(&group.id))
            .await?;
        evaluation_values(
            &mut values,
            evaluation,
            group,
            &entity_url,
            &self.users.server_url(),
        );

        let subject = render(&template.subject, &values);
        let body = render(&template.body, &values);

        let mut addresses = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            match self.users.email_for_user(user_id).await? {
                Some(address) => addresses.push(address),
                None => warn!(user_id = %user_id, "No email address for user, skipping"),
            }
        }

        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        self.deliver_now(from, &addresses, &subject, &body).await
    }

    async fn deliver_now(
        &self,
        from: &str,
        addresses: &[String],
        subject: &str,
        body: &str,
    ) -> Result<Vec<String>> {
        match self.settings.delivery_mode {
            DeliveryMode::Send => {
                self.transport
                    .send_to_addresses(from, addresses, subject, body, true)
                    .await
            }
            DeliveryMode::Log => {
                for to in addresses {
                    info!(to = %to, from, subject, "Logged notification instead of sending");
                }
                debug!(body, "Logged notification body");
                Ok(addresses.to_vec())
            }
            DeliveryMode::None => {
                info!(recipients = addresses.len(), "Delivery mode is none, nothing sent");
                Ok(Vec::new())
            }
        }
    }

    async fn register_event(&self, name: &str, evaluation_id: i64) {
        let event = EntityEvent::for_evaluation(name, evaluation_id);
        if let Err(e) = self.events.register(&event).await {
            warn!(event = name, evaluation_id, error = %e, "Failed to register entity event");
        }
    }

    async fn evaluation_or_fail(&self, evaluation_id: i64) -> Result<Evaluation> {
        self.evaluations
            .evaluation_by_id(evaluation_id)
            .await?
            .ok_or_else(|| NotifierError::EvaluationNotFound(evaluation_id).into())
    }

    /// The evaluation's own from-address wins over the configured one.
    fn from_address_or_fail(&self, evaluation: &Evaluation) -> Result<String> {
        evaluation
            .reminder_from_email
            .as_deref()
            .filter(|from| !from.is_empty())
            .or(self.settings.from_address.as_deref())
            .map(str::to_string)
            .ok_or_else(|| NotifierError::MissingFromAddress.into())
    }
}

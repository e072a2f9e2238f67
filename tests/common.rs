use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use eval_notifier::{
    clients::{
        events::EventSink,
        host::{EvaluationService, MembershipResolver, UserDirectory},
        mail::MailTransport,
        memory::MemoryStore,
    },
    config::DeliverySettings,
    lock::LockManager,
    models::{
        delivery::DeliveryMode,
        evaluation::{
            AssignGroup, EvalGroup, Evaluation, GroupKind, IncludeFilter, InstructorOpt,
            Permission, ResultsSharing,
        },
        event::EntityEvent,
        notification::NewQueuedNotification,
        template::{NotificationTemplate, TemplateType},
    },
};
use tokio::sync::Mutex;

pub const LOCK_PREFIX: &str = "email_lock_";
pub const FROM_ADDRESS: &str = "helpdesk@example.edu";
pub const SERVER_URL: &str = "https://lms.example.edu";

#[derive(Debug, Clone, PartialEq)]
pub struct SentMail {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Records every accepted message. Addresses in `failing` are rejected.
#[derive(Default)]
pub struct RecordingTransport {
    sent: Mutex<Vec<SentMail>>,
    failing: HashSet<String>,
    inject: Mutex<Option<(Arc<MemoryStore>, NewQueuedNotification)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(addresses: &[&str]) -> Self {
        Self {
            failing: addresses.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    /// Queue `notification` into `store` while the first message is in flight.
    pub async fn inject_on_first_send(
        &self,
        store: Arc<MemoryStore>,
        notification: NewQueuedNotification,
    ) {
        *self.inject.lock().await = Some((store, notification));
    }

    pub async fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self) -> Vec<String> {
        self.sent.lock().await.iter().map(|m| m.to.clone()).collect()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    async fn send_to_addresses(
        &self,
        from: &str,
        to: &[String],
        subject: &str,
        body: &str,
        defer_failures: bool,
    ) -> Result<Vec<String>> {
        if let Some((store, notification)) = self.inject.lock().await.take() {
            eval_notifier::store::HoldingStore::save(store.as_ref(), notification).await?;
        }

        let mut accepted = Vec::new();
        for address in to {
            if self.failing.contains(address) {
                if defer_failures {
                    continue;
                }
                return Err(anyhow!("Relay rejected {}", address));
            }

            self.sent.lock().await.push(SentMail {
                from: from.to_string(),
                to: address.clone(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
            accepted.push(address.clone());
        }

        Ok(accepted)
    }
}

#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<EntityEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn names(&self) -> Vec<String> {
        self.events
            .lock()
            .await
            .iter()
            .map(|e| e.name.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn register(&self, event: &EntityEvent) -> Result<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

/// The hosting suite, reduced to lookup tables.
#[derive(Default)]
pub struct FakeHost {
    pub evaluations: HashMap<i64, Evaluation>,
    pub groups: HashMap<String, EvalGroup>,
    pub eval_groups: HashMap<i64, Vec<String>>,
    pub assign_groups: HashMap<i64, Vec<AssignGroup>>,
    pub members: HashMap<(String, Permission), BTreeSet<String>>,
    pub takers: HashMap<(i64, String, IncludeFilter), BTreeSet<String>>,
    pub overrides: HashMap<(i64, TemplateType), NotificationTemplate>,
    pub defaults: HashMap<TemplateType, NotificationTemplate>,
    pub emails: HashMap<String, String>,
    pub announced: Mutex<BTreeSet<i64>>,
}

impl FakeHost {
    pub fn new() -> Self {
        let mut host = Self::default();
        for template_type in [
            TemplateType::Created,
            TemplateType::Available,
            TemplateType::AvailableOptIn,
            TemplateType::Reminder,
            TemplateType::Results,
            TemplateType::SubmissionConfirmation,
        ] {
            host.defaults.insert(
                template_type,
                NotificationTemplate::default_for(
                    template_type,
                    format!("{} ${{EvalTitle}}", template_type),
                    format!("Default {} for ${{EvalTitle}} due ${{EvalDueDate}}", template_type),
                ),
            );
        }
        host
    }

    pub fn add_evaluation(&mut self, evaluation: Evaluation) {
        self.evaluations.insert(evaluation.id, evaluation);
    }

    pub fn add_group(&mut self, evaluation_id: i64, group_id: &str, kind: GroupKind) {
        self.groups.insert(
            group_id.to_string(),
            EvalGroup {
                id: group_id.to_string(),
                title: format!("Group {}", group_id),
                kind,
            },
        );
        self.eval_groups
            .entry(evaluation_id)
            .or_default()
            .push(group_id.to_string());

        let assign_id = self.assign_groups.values().map(Vec::len).sum::<usize>() as i64 + 1;
        self.assign_groups
            .entry(evaluation_id)
            .or_default()
            .push(AssignGroup {
                id: assign_id,
                evaluation_id,
                group_id: group_id.to_string(),
                instructor_approval: false,
                instructors_view_results: true,
                students_view_results: true,
            });
    }

    pub fn add_members(&mut self, group_id: &str, permission: Permission, users: &[&str]) {
        let entry = self
            .members
            .entry((group_id.to_string(), permission))
            .or_default();
        for user in users {
            entry.insert(user.to_string());
            self.emails
                .insert(user.to_string(), format!("{}@example.edu", user));
        }
    }

    pub fn add_takers(
        &mut self,
        evaluation_id: i64,
        group_id: &str,
        include: IncludeFilter,
        users: &[&str],
    ) {
        let entry = self
            .takers
            .entry((evaluation_id, group_id.to_string(), include))
            .or_default();
        for user in users {
            entry.insert(user.to_string());
            self.emails
                .insert(user.to_string(), format!("{}@example.edu", user));
        }
    }
}

#[async_trait]
impl MembershipResolver for FakeHost {
    async fn user_ids_for_group(
        &self,
        group_id: &str,
        permission: Permission,
    ) -> Result<BTreeSet<String>> {
        Ok(self
            .members
            .get(&(group_id.to_string(), permission))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl EvaluationService for FakeHost {
    async fn evaluation_by_id(&self, evaluation_id: i64) -> Result<Option<Evaluation>> {
        Ok(self.evaluations.get(&evaluation_id).cloned())
    }

    async fn groups_for_evaluation(&self, evaluation_id: i64) -> Result<Vec<EvalGroup>> {
        Ok(self
            .eval_groups
            .get(&evaluation_id)
            .map(|ids| ids.iter().filter_map(|id| self.groups.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn assign_groups_for_evaluation(&self, evaluation_id: i64) -> Result<Vec<AssignGroup>> {
        Ok(self
            .assign_groups
            .get(&evaluation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn group_by_id(&self, group_id: &str) -> Result<EvalGroup> {
        Ok(self.groups.get(group_id).cloned().unwrap_or(EvalGroup {
            id: group_id.to_string(),
            title: String::new(),
            kind: GroupKind::Invalid,
        }))
    }

    async fn evaluation_template(
        &self,
        evaluation_id: i64,
        template_type: TemplateType,
    ) -> Result<Option<NotificationTemplate>> {
        Ok(self.overrides.get(&(evaluation_id, template_type)).cloned())
    }

    async fn default_template(
        &self,
        template_type: TemplateType,
    ) -> Result<Option<NotificationTemplate>> {
        Ok(self.defaults.get(&template_type).cloned())
    }

    async fn user_ids_taking_evaluation(
        &self,
        evaluation_id: i64,
        group_id: &str,
        include: IncludeFilter,
    ) -> Result<BTreeSet<String>> {
        Ok(self
            .takers
            .get(&(evaluation_id, group_id.to_string(), include))
            .cloned()
            .unwrap_or_default())
    }

    async fn active_evaluation_ids(&self, available_email_sent: bool) -> Result<Vec<i64>> {
        let announced = self.announced.lock().await;
        let mut ids: Vec<i64> = self
            .evaluations
            .keys()
            .copied()
            .filter(|id| announced.contains(id) == available_email_sent)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn mark_available_email_sent(&self, evaluation_ids: &[i64]) -> Result<()> {
        self.announced
            .lock()
            .await
            .extend(evaluation_ids.iter().copied());
        Ok(())
    }

    async fn entity_url(&self, evaluation_id: i64, group_id: Option<&str>) -> Result<String> {
        Ok(match group_id {
            Some(group_id) => format!(
                "{}/direct/eval-evaluation/{}?group={}",
                SERVER_URL, evaluation_id, group_id
            ),
            None => format!("{}/direct/eval-evaluation/{}", SERVER_URL, evaluation_id),
        })
    }
}

#[async_trait]
impl UserDirectory for FakeHost {
    async fn email_for_user(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.emails.get(user_id).cloned())
    }

    async fn workspace_url(&self, user_id: &str) -> Result<String> {
        Ok(format!("{}/portal/~{}", SERVER_URL, user_id))
    }

    fn server_url(&self) -> String {
        SERVER_URL.to_string()
    }

    fn tool_title(&self) -> String {
        "Teaching Evaluations".to_string()
    }
}

pub fn date(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn evaluation(id: i64, title: &str) -> Evaluation {
    Evaluation {
        id,
        title: title.to_string(),
        owner: "owner".to_string(),
        start_date: date(2026, 3, 1),
        due_date: Some(date(2026, 3, 17)),
        view_date: None,
        instructor_opt: InstructorOpt::Required,
        results_sharing: ResultsSharing::Visible,
        reminder_from_email: None,
    }
}

pub fn settings() -> DeliverySettings {
    DeliverySettings {
        from_address: Some(FROM_ADDRESS.to_string()),
        ..Default::default()
    }
}

pub fn lock_manager(store: Arc<MemoryStore>, holder: &str) -> Arc<LockManager> {
    Arc::new(LockManager::new(
        store,
        LOCK_PREFIX,
        holder,
        Duration::hours(48),
    ))
}

pub async fn queue(
    store: &MemoryStore,
    lock_name: &str,
    to: &str,
) -> Result<eval_notifier::models::notification::QueuedNotification> {
    eval_notifier::store::HoldingStore::save(
        store,
        NewQueuedNotification::new(lock_name, to, format!("Subject for {}", to), "Body"),
    )
    .await
}

pub fn delivery(mode: DeliveryMode) -> DeliverySettings {
    DeliverySettings {
        delivery_mode: mode,
        ..settings()
    }
}

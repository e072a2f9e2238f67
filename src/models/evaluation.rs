use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstructorOpt {
    Required,
    OptIn,
    OptOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultsSharing {
    Private,
    Visible,
    Public,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: i64,
    pub title: String,
    pub owner: String,
    pub start_date: DateTime<Utc>,
    pub due_date: Option<DateTime<Utc>>,
    pub view_date: Option<DateTime<Utc>>,
    pub instructor_opt: InstructorOpt,
    pub results_sharing: ResultsSharing,
    pub reminder_from_email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Site,
    Section,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalGroup {
    pub id: String,
    pub title: String,
    pub kind: GroupKind,
}

impl EvalGroup {
    pub fn is_valid(&self) -> bool {
        self.kind != GroupKind::Invalid
    }
}

/// Assignment of an evaluation to a group, with its per-group switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignGroup {
    pub id: i64,
    pub evaluation_id: i64,
    pub group_id: String,
    pub instructor_approval: bool,
    pub instructors_view_results: bool,
    pub students_view_results: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    TakeEvaluation,
    BeEvaluated,
}

/// Which users taking an evaluation a reminder should reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncludeFilter {
    All,
    NonTakers,
    Responders,
}

/// Results become viewable on separate dates for each audience.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultsAudience {
    Owner,
    Instructors,
    Students,
}

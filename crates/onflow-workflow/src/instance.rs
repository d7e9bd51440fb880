//! Running workflow instances and their step snapshots

use crate::{
    ids::{InstanceId, StepInstanceId, TemplateId},
    template::{StepType, WorkflowType},
};
use chrono::{DateTime, NaiveDate, Utc};
use onflow_core::{Actor, EmployeeId, UserId};
use serde::{Deserialize, Serialize};

/// Status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    NotStarted,
    Active,
    /// Set and cleared only by explicit hold/resume
    OnHold,
    Completed,
    Overdue,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::NotStarted => "not_started",
            InstanceStatus::Active => "active",
            InstanceStatus::OnHold => "on_hold",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Overdue => "overdue",
        }
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Free-text note attached to an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceNote {
    pub author: Actor,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// A single employee's execution of a template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: InstanceId,
    pub template_id: TemplateId,
    /// Template version the steps were copied from
    pub template_version: u32,
    pub template_name: String,
    pub workflow_type: WorkflowType,
    pub employee_id: EmployeeId,
    pub start_date: NaiveDate,
    /// Latest step due date at instantiation
    pub expected_completion_date: NaiveDate,
    pub actual_completion_date: Option<NaiveDate>,
    pub status: InstanceStatus,
    /// 0-100, derived by the progress aggregator
    pub overall_progress: u8,
    pub buddy_id: Option<UserId>,
    pub manager_id: Option<UserId>,
    #[serde(default)]
    pub notes: Vec<InstanceNote>,
    pub hold_reason: Option<String>,
    /// Optimistic concurrency token, bumped on every save
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// Whether the instance still counts as the employee's running workflow
    pub fn is_open(&self) -> bool {
        self.status != InstanceStatus::Completed
    }

    pub fn is_on_hold(&self) -> bool {
        self.status == InstanceStatus::OnHold
    }

    pub fn add_note(&mut self, author: Actor, body: impl Into<String>, at: DateTime<Utc>) {
        self.notes.push(InstanceNote {
            author,
            body: body.into(),
            created_at: at,
        });
    }
}

/// Lifecycle state of a step instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Completed,
    Skipped,
}

impl StepStatus {
    /// Completed or skipped
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::NotStarted => "not_started",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-instance copy of a step definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInstance {
    pub id: StepInstanceId,
    pub instance_id: InstanceId,
    pub order_index: u32,
    pub step_name: String,
    pub description: Option<String>,
    pub step_type: StepType,
    pub required: bool,
    pub auto_trigger: bool,
    pub assigned_role: String,
    pub assigned_to: Option<UserId>,
    pub status: StepStatus,
    pub due_date: NaiveDate,
    /// Predecessors that must be completed or skipped before this step starts
    pub depends_on: Vec<StepInstanceId>,
    pub estimated_hours: Option<f32>,
    pub actual_hours: Option<f32>,
    pub integration_payload: Option<serde_json::Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub started_by: Option<Actor>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<Actor>,
    pub skip_reason: Option<String>,
    /// Set when a required step was skipped under a waiver
    pub waived_by: Option<UserId>,
}

impl StepInstance {
    pub fn is_done(&self) -> bool {
        self.status.is_done()
    }

    /// Past due and not finished
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        self.due_date < today && !self.is_done()
    }
}

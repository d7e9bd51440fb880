//! Workflow templates: reusable, author-edited step definitions
//!
//! Templates are never mutated by running instances. Instantiation copies
//! every [`StepDefinition`] into a step instance, so later edits only affect
//! instances created afterwards.

use crate::{ids::TemplateId, Result, WorkflowError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use onflow_core::UserId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Kind of HR workflow a template drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Onboarding,
    Offboarding,
    Transfer,
    Promotion,
    Other,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowType::Onboarding => "onboarding",
            WorkflowType::Offboarding => "offboarding",
            WorkflowType::Transfer => "transfer",
            WorkflowType::Promotion => "promotion",
            WorkflowType::Other => "other",
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Template lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateStatus {
    Draft,
    Active,
    Inactive,
}

/// Kind of work a step represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Document,
    Approval,
    BackgroundCheck,
    EquipmentSetup,
    Training,
    SystemAccess,
    Meeting,
    Notification,
    Custom,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::Document => "document",
            StepType::Approval => "approval",
            StepType::BackgroundCheck => "background_check",
            StepType::EquipmentSetup => "equipment_setup",
            StepType::Training => "training",
            StepType::SystemAccess => "system_access",
            StepType::Meeting => "meeting",
            StepType::Notification => "notification",
            StepType::Custom => "custom",
        }
    }

    /// Integration type used when a step of this kind is auto-triggered
    pub fn integration_type(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reusable blueprint of a single step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Position within the template, unique per template
    pub order_index: u32,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub step_type: StepType,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Start the associated integration as soon as the instance is created
    #[serde(default)]
    pub auto_trigger: bool,
    /// Role responsible for the step (e.g. "hr", "it", "manager")
    pub assigned_role: String,
    /// Days after the instance start date the step is due
    #[serde(default)]
    pub due_offset_days: u32,
    /// Order indices of earlier steps that must finish first
    #[serde(default)]
    pub depends_on: Vec<u32>,
    #[serde(default)]
    pub estimated_hours: Option<f32>,
    /// Request payload sent when the step's integration is triggered
    #[serde(default)]
    pub integration_payload: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl StepDefinition {
    pub fn new(order_index: u32, name: impl Into<String>, step_type: StepType) -> Self {
        Self {
            order_index,
            name: name.into(),
            description: None,
            step_type,
            required: true,
            auto_trigger: false,
            assigned_role: "hr".to_string(),
            due_offset_days: 0,
            depends_on: Vec::new(),
            estimated_hours: None,
            integration_payload: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn auto_trigger(mut self) -> Self {
        self.auto_trigger = true;
        self
    }

    pub fn due_in_days(mut self, days: u32) -> Self {
        self.due_offset_days = days;
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.assigned_role = role.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn depends_on(mut self, order_indices: Vec<u32>) -> Self {
        self.depends_on = order_indices;
        self
    }

    pub fn with_estimated_hours(mut self, hours: f32) -> Self {
        self.estimated_hours = Some(hours);
        self
    }

    pub fn with_integration_payload(mut self, payload: serde_json::Value) -> Self {
        self.integration_payload = Some(payload);
        self
    }
}

/// Reusable workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    #[serde(default)]
    pub id: TemplateId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub workflow_type: WorkflowType,
    #[serde(default = "default_status")]
    pub status: TemplateStatus,
    pub steps: Vec<StepDefinition>,
    /// Each step waits for the nearest preceding required step
    #[serde(default)]
    pub enforce_sequence: bool,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub created_by: Option<UserId>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_status() -> TemplateStatus {
    TemplateStatus::Draft
}

fn default_version() -> u32 {
    1
}

impl WorkflowTemplate {
    /// Create a draft template
    pub fn new(name: impl Into<String>, workflow_type: WorkflowType) -> Self {
        let now = Utc::now();
        Self {
            id: TemplateId::new(),
            name: name.into(),
            description: String::new(),
            workflow_type,
            status: TemplateStatus::Draft,
            steps: Vec::new(),
            enforce_sequence: false,
            version: 1,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn add_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn sequential(mut self) -> Self {
        self.enforce_sequence = true;
        self
    }

    pub fn created_by(mut self, author: UserId) -> Self {
        self.created_by = Some(author);
        self
    }

    pub fn activate(mut self) -> Self {
        self.status = TemplateStatus::Active;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == TemplateStatus::Active
    }

    /// Step definitions sorted by order index
    pub fn ordered_steps(&self) -> Vec<&StepDefinition> {
        let mut steps: Vec<_> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.order_index);
        steps
    }

    /// Validate structure: non-empty, unique order indices, backward-only dependencies
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WorkflowError::InvalidTemplate(
                "Template name must not be empty".to_string(),
            ));
        }

        if self.steps.is_empty() {
            return Err(WorkflowError::InvalidTemplate(format!(
                "Template '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.order_index) {
                return Err(WorkflowError::InvalidTemplate(format!(
                    "Duplicate order index {} in template '{}'",
                    step.order_index, self.name
                )));
            }
            if step.name.trim().is_empty() {
                return Err(WorkflowError::InvalidTemplate(format!(
                    "Step at order index {} has no name",
                    step.order_index
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep) {
                    return Err(WorkflowError::InvalidTemplate(format!(
                        "Step '{}' depends on missing order index {}",
                        step.name, dep
                    )));
                }
                if *dep >= step.order_index {
                    return Err(WorkflowError::InvalidTemplate(format!(
                        "Step '{}' (order {}) may only depend on earlier steps, not {}",
                        step.name, step.order_index, dep
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Template persistence collaborator.
///
/// `create` and `update` reject structurally invalid templates; `update`
/// bumps the version.
#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn create(&self, template: &WorkflowTemplate) -> Result<()>;

    async fn get(&self, id: TemplateId) -> Result<Option<WorkflowTemplate>>;

    async fn update(&self, template: &WorkflowTemplate) -> Result<()>;

    async fn list(&self, workflow_type: Option<WorkflowType>) -> Result<Vec<WorkflowTemplate>>;
}

/// In-memory template store for testing
#[derive(Debug, Default)]
pub struct InMemoryTemplateStore {
    templates: RwLock<HashMap<TemplateId, WorkflowTemplate>>,
}

impl InMemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn create(&self, template: &WorkflowTemplate) -> Result<()> {
        template.validate()?;
        let mut templates = self.templates.write();
        if templates.contains_key(&template.id) {
            return Err(WorkflowError::Repository(format!(
                "Template already exists: {}",
                template.id
            )));
        }
        templates.insert(template.id, template.clone());
        debug!(template_id = %template.id, "Template stored");
        Ok(())
    }

    async fn get(&self, id: TemplateId) -> Result<Option<WorkflowTemplate>> {
        Ok(self.templates.read().get(&id).cloned())
    }

    async fn update(&self, template: &WorkflowTemplate) -> Result<()> {
        template.validate()?;
        let mut templates = self.templates.write();
        let stored = templates
            .get_mut(&template.id)
            .ok_or_else(|| WorkflowError::NotFound(format!("template {}", template.id)))?;

        let version = stored.version + 1;
        *stored = template.clone();
        stored.version = version;
        stored.updated_at = Utc::now();
        debug!(template_id = %template.id, version, "Template updated");
        Ok(())
    }

    async fn list(&self, workflow_type: Option<WorkflowType>) -> Result<Vec<WorkflowTemplate>> {
        let mut templates: Vec<_> = self
            .templates
            .read()
            .values()
            .filter(|t| workflow_type.map_or(true, |wt| t.workflow_type == wt))
            .cloned()
            .collect();
        templates.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(templates)
    }
}

/// Ready-made templates
pub struct TemplateLibrary;

impl TemplateLibrary {
    /// Standard new-hire onboarding
    pub fn standard_onboarding() -> WorkflowTemplate {
        WorkflowTemplate::new("Standard Onboarding", WorkflowType::Onboarding)
            .with_description("New hire paperwork, checks, equipment and first-week activities")
            .add_step(
                StepDefinition::new(0, "Welcome Orientation", StepType::Meeting)
                    .optional()
                    .with_role("hr")
                    .with_estimated_hours(2.0),
            )
            .add_step(
                StepDefinition::new(1, "Submit Employment Documents", StepType::Document)
                    .with_role("employee")
                    .due_in_days(1)
                    .with_description("Tax forms, identity verification and bank details"),
            )
            .add_step(
                StepDefinition::new(2, "Background Check", StepType::BackgroundCheck)
                    .with_role("hr")
                    .auto_trigger()
                    .due_in_days(7)
                    .depends_on(vec![1]),
            )
            .add_step(
                StepDefinition::new(3, "Equipment Setup", StepType::EquipmentSetup)
                    .with_role("it")
                    .auto_trigger()
                    .due_in_days(1),
            )
            .add_step(
                StepDefinition::new(4, "System Access", StepType::SystemAccess)
                    .with_role("it")
                    .due_in_days(1)
                    .depends_on(vec![3]),
            )
            .add_step(
                StepDefinition::new(5, "Security Training", StepType::Training)
                    .with_role("employee")
                    .due_in_days(5)
                    .depends_on(vec![4])
                    .with_estimated_hours(1.5),
            )
            .add_step(
                StepDefinition::new(6, "First Week Check-in", StepType::Meeting)
                    .optional()
                    .with_role("manager")
                    .due_in_days(5),
            )
            .activate()
    }

    /// Standard offboarding
    pub fn standard_offboarding() -> WorkflowTemplate {
        WorkflowTemplate::new("Standard Offboarding", WorkflowType::Offboarding)
            .sequential()
            .add_step(
                StepDefinition::new(0, "Manager Approval", StepType::Approval).with_role("manager"),
            )
            .add_step(
                StepDefinition::new(1, "Revoke System Access", StepType::SystemAccess)
                    .with_role("it")
                    .auto_trigger(),
            )
            .add_step(
                StepDefinition::new(2, "Return Equipment", StepType::EquipmentSetup)
                    .with_role("it")
                    .due_in_days(3),
            )
            .add_step(
                StepDefinition::new(3, "Exit Interview", StepType::Meeting)
                    .optional()
                    .with_role("hr")
                    .due_in_days(3),
            )
            .activate()
    }
}

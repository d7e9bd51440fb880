//! Typed query options for listing instances

use crate::{
    ids::TemplateId,
    instance::{InstanceStatus, WorkflowInstance},
    template::WorkflowType,
};
use chrono::NaiveDate;
use onflow_core::EmployeeId;
use serde::{Deserialize, Serialize};

/// Recognized instance filters; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFilter {
    pub employee_id: Option<EmployeeId>,
    pub workflow_type: Option<WorkflowType>,
    pub template_id: Option<TemplateId>,
    /// Match any of these statuses
    #[serde(default)]
    pub statuses: Vec<InstanceStatus>,
    /// Exclude completed instances
    #[serde(default)]
    pub open_only: bool,
    pub started_on_or_after: Option<NaiveDate>,
    pub started_on_or_before: Option<NaiveDate>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl InstanceFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn employee(mut self, employee_id: EmployeeId) -> Self {
        self.employee_id = Some(employee_id);
        self
    }

    pub fn workflow_type(mut self, workflow_type: WorkflowType) -> Self {
        self.workflow_type = Some(workflow_type);
        self
    }

    pub fn template(mut self, template_id: TemplateId) -> Self {
        self.template_id = Some(template_id);
        self
    }

    pub fn status(mut self, status: InstanceStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn open_only(mut self) -> Self {
        self.open_only = true;
        self
    }

    pub fn started_between(mut self, from: NaiveDate, to: NaiveDate) -> Self {
        self.started_on_or_after = Some(from);
        self.started_on_or_before = Some(to);
        self
    }

    pub fn paginate(mut self, limit: usize, offset: usize) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        self.employee_id.map_or(true, |e| instance.employee_id == e)
            && self.workflow_type.map_or(true, |t| instance.workflow_type == t)
            && self.template_id.map_or(true, |t| instance.template_id == t)
            && (self.statuses.is_empty() || self.statuses.contains(&instance.status))
            && (!self.open_only || instance.is_open())
            && self
                .started_on_or_after
                .map_or(true, |d| instance.start_date >= d)
            && self
                .started_on_or_before
                .map_or(true, |d| instance.start_date <= d)
    }
}

//! Template → instance instantiation

use crate::{
    dag::StepGraph,
    ids::{InstanceId, StepInstanceId},
    instance::{InstanceStatus, StepInstance, StepStatus, WorkflowInstance},
    template::WorkflowTemplate,
    Result, WorkflowError,
};
use chrono::{DateTime, Days, NaiveDate, Utc};
use onflow_core::{EmployeeId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who and when to instantiate a template for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstantiationRequest {
    pub employee_id: EmployeeId,
    pub start_date: NaiveDate,
    pub buddy_id: Option<UserId>,
    pub manager_id: Option<UserId>,
}

impl InstantiationRequest {
    pub fn new(employee_id: EmployeeId, start_date: NaiveDate) -> Self {
        Self {
            employee_id,
            start_date,
            buddy_id: None,
            manager_id: None,
        }
    }

    pub fn with_buddy(mut self, buddy: UserId) -> Self {
        self.buddy_id = Some(buddy);
        self
    }

    pub fn with_manager(mut self, manager: UserId) -> Self {
        self.manager_id = Some(manager);
        self
    }
}

/// Freshly created instance with its step snapshots
#[derive(Debug, Clone)]
pub struct Instantiation {
    pub instance: WorkflowInstance,
    /// Steps in template order
    pub steps: Vec<StepInstance>,
    pub graph: StepGraph,
}

impl Instantiation {
    /// Steps whose integration must be triggered right away
    pub fn auto_trigger_steps(&self) -> impl Iterator<Item = &StepInstance> {
        self.steps.iter().filter(|s| s.auto_trigger)
    }
}

/// Copies template definitions into a new running instance
pub struct Instantiator;

impl Instantiator {
    pub fn instantiate(
        template: &WorkflowTemplate,
        request: &InstantiationRequest,
        now: DateTime<Utc>,
    ) -> Result<Instantiation> {
        template.validate()?;

        if !template.is_active() {
            return Err(WorkflowError::InvalidTemplate(format!(
                "Template '{}' is not active ({:?})",
                template.name, template.status
            )));
        }

        let instance_id = InstanceId::new();
        let definitions = template.ordered_steps();

        let ids_by_order: HashMap<u32, StepInstanceId> = definitions
            .iter()
            .map(|d| (d.order_index, StepInstanceId::new()))
            .collect();

        let mut steps = Vec::with_capacity(definitions.len());
        let mut previous_required: Option<StepInstanceId> = None;

        for def in definitions {
            let id = ids_by_order[&def.order_index];

            let due_date = request
                .start_date
                .checked_add_days(Days::new(u64::from(def.due_offset_days)))
                .ok_or_else(|| {
                    WorkflowError::InvalidTemplate(format!(
                        "Due offset of step '{}' overflows the calendar",
                        def.name
                    ))
                })?;

            let mut depends_on: Vec<StepInstanceId> = Vec::with_capacity(def.depends_on.len());
            for order in &def.depends_on {
                let dep = ids_by_order[order];
                if !depends_on.contains(&dep) {
                    depends_on.push(dep);
                }
            }

            if template.enforce_sequence {
                if let Some(prev) = previous_required {
                    if !depends_on.contains(&prev) {
                        depends_on.push(prev);
                    }
                }
            }

            if def.required {
                previous_required = Some(id);
            }

            steps.push(StepInstance {
                id,
                instance_id,
                order_index: def.order_index,
                step_name: def.name.clone(),
                description: def.description.clone(),
                step_type: def.step_type,
                required: def.required,
                auto_trigger: def.auto_trigger,
                assigned_role: def.assigned_role.clone(),
                assigned_to: None,
                status: StepStatus::NotStarted,
                due_date,
                depends_on,
                estimated_hours: def.estimated_hours,
                actual_hours: None,
                integration_payload: def.integration_payload.clone(),
                started_at: None,
                started_by: None,
                completed_at: None,
                completed_by: None,
                skip_reason: None,
                waived_by: None,
            });
        }

        let graph = StepGraph::new(&steps)?;

        let expected_completion_date = steps
            .iter()
            .map(|s| s.due_date)
            .max()
            .unwrap_or(request.start_date);

        let instance = WorkflowInstance {
            id: instance_id,
            template_id: template.id,
            template_version: template.version,
            template_name: template.name.clone(),
            workflow_type: template.workflow_type,
            employee_id: request.employee_id,
            start_date: request.start_date,
            expected_completion_date,
            actual_completion_date: None,
            status: InstanceStatus::Active,
            overall_progress: 0,
            buddy_id: request.buddy_id,
            manager_id: request.manager_id,
            notes: Vec::new(),
            hold_reason: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };

        Ok(Instantiation {
            instance,
            steps,
            graph,
        })
    }
}

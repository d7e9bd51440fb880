//! Workflow engine façade
//!
//! Every operation is a single read, validate, write unit against the
//! repository: the aggregate is loaded, mutated in memory, re-derived by the
//! progress aggregator and saved with the version it was loaded at. Losing a
//! race surfaces as [`WorkflowError::ConcurrentModification`].

use crate::{
    dag::status_map,
    exception::{ExceptionType, Severity, WorkflowException},
    filter::InstanceFilter,
    ids::{ExceptionId, InstanceId, IntegrationId, MilestoneId, StepInstanceId, TemplateId},
    instance::{InstanceStatus, StepInstance, StepStatus, WorkflowInstance},
    instantiate::{InstantiationRequest, Instantiator},
    integration::{IntegrationStatus, RetryOutcome, WorkflowIntegration},
    milestone::{Milestone, MilestoneStatus},
    progress::{ProgressAggregator, ProgressSummary, WorkflowStatistics},
    repository::{InstanceRecord, WorkflowRepository},
    state_machine::{SkipPolicy, StepMachine, Transition},
    template::{StepType, TemplateStore, WorkflowTemplate, WorkflowType},
    Result, WorkflowError,
};
use chrono::{DateTime, NaiveDate, Utc};
use onflow_core::{Actor, Clock, EmployeeId, EngineConfig, Event, EventPublisher, UserId};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-step row of an [`InstanceStatusView`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatusView {
    pub id: StepInstanceId,
    pub order_index: u32,
    pub name: String,
    pub step_type: StepType,
    pub required: bool,
    pub status: StepStatus,
    pub due_date: NaiveDate,
    pub overdue: bool,
    pub assigned_role: String,
    pub assigned_to: Option<UserId>,
    /// Predecessors still blocking this step
    pub waiting_on: Vec<StepInstanceId>,
}

/// Read model answering "where is this employee's onboarding?"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStatusView {
    pub instance_id: InstanceId,
    pub employee_id: EmployeeId,
    pub template_name: String,
    pub workflow_type: WorkflowType,
    pub status: InstanceStatus,
    pub start_date: NaiveDate,
    pub expected_completion_date: NaiveDate,
    pub actual_completion_date: Option<NaiveDate>,
    pub progress: ProgressSummary,
    pub steps: Vec<StepStatusView>,
    /// Not-started steps whose predecessors are done
    pub ready_steps: Vec<StepInstanceId>,
    pub open_exceptions: Vec<WorkflowException>,
    pub milestones: Vec<Milestone>,
}

/// Coordinates templates, instances, integrations, exceptions and milestones
pub struct WorkflowEngine {
    repository: Arc<dyn WorkflowRepository>,
    templates: Arc<dyn TemplateStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    machine: StepMachine,
}

impl WorkflowEngine {
    pub fn new(
        repository: Arc<dyn WorkflowRepository>,
        templates: Arc<dyn TemplateStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        let machine = StepMachine::new(config.require_explicit_start);
        Self {
            repository,
            templates,
            publisher,
            clock,
            config,
            machine,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn templates(&self) -> &Arc<dyn TemplateStore> {
        &self.templates
    }

    fn system_actor(&self) -> Actor {
        Actor::system(self.config.system_actor.clone())
    }

    // ---- instantiation ----

    /// Create a running instance of `template` for one employee.
    ///
    /// Auto-trigger steps get their integration request created immediately.
    pub async fn instantiate(
        &self,
        template: &WorkflowTemplate,
        request: InstantiationRequest,
    ) -> Result<InstanceRecord> {
        let now = self.clock.now();
        let instantiation = Instantiator::instantiate(template, &request, now)?;

        let mut integrations = Vec::new();
        for step in instantiation.auto_trigger_steps() {
            let integration_type = step.step_type.integration_type();
            integrations.push(WorkflowIntegration::new(
                instantiation.instance.id,
                Some(step.id),
                integration_type,
                step.integration_payload.clone().unwrap_or_else(|| json!({})),
                self.config.max_retries_for(integration_type),
                now,
            ));
        }

        let mut record = InstanceRecord::new(instantiation.instance, instantiation.steps);
        record.integrations = integrations;
        ProgressAggregator::apply(&mut record.instance, &record.steps, self.clock.today());

        let inserted = if self.config.allow_concurrent_instances {
            self.repository.insert(&record).await
        } else {
            self.repository.insert_exclusive(&record).await
        };
        if let Err(WorkflowError::ActiveInstanceExists { instance_id, .. }) = &inserted {
            warn!(
                employee_id = %record.instance.employee_id,
                instance_id = %instance_id,
                workflow_type = %record.instance.workflow_type,
                "Refusing to start a second open workflow"
            );
        }
        inserted?;

        info!(
            instance_id = %record.instance.id,
            employee_id = %record.instance.employee_id,
            template = %record.instance.template_name,
            steps = record.steps.len(),
            auto_triggered = record.integrations.len(),
            "Workflow instantiated"
        );

        let mut events = vec![instance_event("workflow.instantiated", &record.instance)];
        events.extend(
            record
                .integrations
                .iter()
                .map(|i| integration_event("integration.requested", i)),
        );
        self.emit(events).await;

        Ok(record)
    }

    /// Instantiate a template held by the template store
    pub async fn instantiate_from_store(
        &self,
        template_id: TemplateId,
        request: InstantiationRequest,
    ) -> Result<InstanceRecord> {
        let template = self
            .templates
            .get(template_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("template {}", template_id)))?;
        self.instantiate(&template, request).await
    }

    // ---- steps ----

    pub async fn start_step(&self, step_id: StepInstanceId, actor: &Actor) -> Result<StepInstance> {
        let mut record = self.record_for_step(step_id).await?;
        let expected = record.instance.version;
        let now = self.clock.now();

        let graph = record.graph()?;
        let statuses = status_map(&record.steps);
        let transition = self
            .machine
            .start(record.step_mut(step_id)?, &graph, &statuses, actor, now)
            .inspect_err(|e| warn!(step_id = %step_id, error = %e, "Step start refused"))?;

        if transition == Transition::Unchanged {
            return record.step(step_id).cloned();
        }

        self.commit(&mut record, expected, now).await?;
        let step = record.step(step_id)?.clone();

        info!(step_id = %step_id, step = %step.step_name, actor = %actor, "Step started");
        self.emit(vec![step_event("step.started", &step, actor)]).await;

        Ok(step)
    }

    /// Complete a step; idempotent for already-completed steps
    pub async fn complete_step(
        &self,
        step_id: StepInstanceId,
        actor: &Actor,
        actual_hours: Option<f32>,
    ) -> Result<StepInstance> {
        let mut record = self.record_for_step(step_id).await?;
        let expected = record.instance.version;
        let previous_status = record.instance.status;
        let now = self.clock.now();

        let graph = record.graph()?;
        let statuses = status_map(&record.steps);
        let transition = self
            .machine
            .complete(record.step_mut(step_id)?, &graph, &statuses, actor, actual_hours, now)
            .inspect_err(|e| warn!(step_id = %step_id, error = %e, "Step completion refused"))?;

        if transition == Transition::Unchanged {
            debug!(step_id = %step_id, "Step already completed");
            return record.step(step_id).cloned();
        }

        let summary = self.commit(&mut record, expected, now).await?;
        let step = record.step(step_id)?.clone();

        info!(
            step_id = %step_id,
            step = %step.step_name,
            actor = %actor,
            progress = summary.overall_progress,
            "Step completed"
        );

        let mut events = vec![step_event("step.completed", &step, actor)];
        events.extend(completion_event(previous_status, &record.instance));
        self.emit(events).await;

        Ok(step)
    }

    /// Skip a step. Required steps need [`SkipPolicy::Waiver`].
    pub async fn skip_step(
        &self,
        step_id: StepInstanceId,
        actor: &Actor,
        reason: &str,
        policy: SkipPolicy,
    ) -> Result<StepInstance> {
        let mut record = self.record_for_step(step_id).await?;
        let expected = record.instance.version;
        let previous_status = record.instance.status;
        let now = self.clock.now();

        let transition = self
            .machine
            .skip(record.step_mut(step_id)?, actor, reason, policy, now)
            .inspect_err(|e| warn!(step_id = %step_id, error = %e, "Step skip refused"))?;

        if transition == Transition::Unchanged {
            return record.step(step_id).cloned();
        }

        self.commit(&mut record, expected, now).await?;
        let step = record.step(step_id)?.clone();

        info!(
            step_id = %step_id,
            step = %step.step_name,
            actor = %actor,
            waived_by = ?step.waived_by,
            "Step skipped"
        );

        let mut events = vec![step_event("step.skipped", &step, actor)
            .with_metadata("reason", reason.to_string())];
        events.extend(completion_event(previous_status, &record.instance));
        self.emit(events).await;

        Ok(step)
    }

    pub async fn assign_step(
        &self,
        step_id: StepInstanceId,
        assignee: UserId,
        actor: &Actor,
    ) -> Result<StepInstance> {
        let mut record = self.record_for_step(step_id).await?;
        let expected = record.instance.version;
        let now = self.clock.now();

        let step = record.step_mut(step_id)?;
        if step.is_done() {
            return Err(WorkflowError::AlreadyCompleted(format!(
                "step {} is {}",
                step_id, step.status
            )));
        }
        if step.assigned_to == Some(assignee) {
            return Ok(step.clone());
        }
        step.assigned_to = Some(assignee);

        self.commit(&mut record, expected, now).await?;
        info!(step_id = %step_id, assignee = %assignee, actor = %actor, "Step assigned");
        record.step(step_id).cloned()
    }

    /// Administrative override returning a finished step to not-started.
    ///
    /// The note is appended to the instance notes. Progress may go down.
    pub async fn reopen_step(
        &self,
        step_id: StepInstanceId,
        actor: &Actor,
        note: &str,
    ) -> Result<StepInstance> {
        if note.trim().is_empty() {
            return Err(WorkflowError::InvalidTransition(
                "reopening a step requires a note".to_string(),
            ));
        }

        let mut record = self.record_for_step(step_id).await?;
        let expected = record.instance.version;
        let now = self.clock.now();

        let graph = record.graph()?;
        let statuses = status_map(&record.steps);
        let blocking: Vec<StepInstanceId> = graph
            .dependents(step_id)
            .into_iter()
            .filter(|d| statuses.get(d).is_some_and(|s| *s != StepStatus::NotStarted))
            .collect();
        if !blocking.is_empty() {
            return Err(WorkflowError::InvalidTransition(format!(
                "step {} has dependents already underway: {:?}",
                step_id, blocking
            )));
        }

        let step = record.step_mut(step_id)?;
        self.machine.reopen(step)?;
        let body = format!("Reopened step '{}': {}", step.step_name, note.trim());
        record.instance.add_note(actor.clone(), body, now);

        let summary = self.commit(&mut record, expected, now).await?;
        let step = record.step(step_id)?.clone();

        warn!(
            step_id = %step_id,
            step = %step.step_name,
            actor = %actor,
            progress = summary.overall_progress,
            "Step reopened by administrative override"
        );
        self.emit(vec![step_event("step.reopened", &step, actor)]).await;

        Ok(step)
    }

    // ---- instances ----

    /// Put an open instance on hold; derived status stops updating until resumed
    pub async fn hold(
        &self,
        instance_id: InstanceId,
        actor: &Actor,
        reason: &str,
    ) -> Result<WorkflowInstance> {
        let mut record = self.load(instance_id).await?;
        match record.instance.status {
            InstanceStatus::OnHold => return Ok(record.instance),
            InstanceStatus::Completed => {
                return Err(WorkflowError::InvalidTransition(format!(
                    "instance {} is completed",
                    instance_id
                )))
            }
            _ => {}
        }

        let expected = record.instance.version;
        let now = self.clock.now();
        record.instance.status = InstanceStatus::OnHold;
        record.instance.hold_reason = Some(reason.to_string());
        record
            .instance
            .add_note(actor.clone(), format!("Put on hold: {}", reason), now);

        self.commit(&mut record, expected, now).await?;
        info!(instance_id = %instance_id, actor = %actor, reason, "Workflow put on hold");
        self.emit(vec![instance_event("workflow.on_hold", &record.instance)
            .with_metadata("reason", reason.to_string())])
            .await;

        Ok(record.instance)
    }

    pub async fn resume(&self, instance_id: InstanceId, actor: &Actor) -> Result<WorkflowInstance> {
        let mut record = self.load(instance_id).await?;
        if !record.instance.is_on_hold() {
            return Err(WorkflowError::InvalidTransition(format!(
                "instance {} is {}, not on hold",
                instance_id, record.instance.status
            )));
        }

        let expected = record.instance.version;
        let now = self.clock.now();
        record.instance.status = InstanceStatus::Active;
        record.instance.hold_reason = None;
        record.instance.add_note(actor.clone(), "Resumed", now);

        self.commit(&mut record, expected, now).await?;
        info!(
            instance_id = %instance_id,
            actor = %actor,
            status = %record.instance.status,
            "Workflow resumed"
        );

        let mut events = vec![instance_event("workflow.resumed", &record.instance)];
        events.extend(completion_event(InstanceStatus::OnHold, &record.instance));
        self.emit(events).await;

        Ok(record.instance)
    }

    /// Re-derive progress, status and milestone state as of today.
    ///
    /// Writes only when something changed.
    pub async fn recompute(&self, instance_id: InstanceId) -> Result<ProgressSummary> {
        let mut record = self.load(instance_id).await?;
        let expected = record.instance.version;
        let previous_status = record.instance.status;
        let previous_progress = record.instance.overall_progress;
        let today = self.clock.today();

        let mut milestones_changed = false;
        for milestone in &mut record.milestones {
            let before = milestone.status;
            milestone.refresh(today);
            milestones_changed |= before != milestone.status;
        }

        let summary = ProgressAggregator::summarize(&record.steps, today);
        let status = ProgressAggregator::derive_status(previous_status, &summary);

        if !milestones_changed
            && status == previous_status
            && summary.overall_progress == previous_progress
        {
            return Ok(summary);
        }

        let now = self.clock.now();
        let summary = self.commit(&mut record, expected, now).await?;
        info!(
            instance_id = %instance_id,
            from = %previous_status,
            to = %record.instance.status,
            progress = summary.overall_progress,
            "Workflow recomputed"
        );
        self.emit(completion_event(previous_status, &record.instance).into_iter().collect())
            .await;

        Ok(summary)
    }

    pub async fn get_instance(&self, instance_id: InstanceId) -> Result<InstanceRecord> {
        self.load(instance_id).await
    }

    /// Status view derived as of today, without writing
    pub async fn get_status(&self, instance_id: InstanceId) -> Result<InstanceStatusView> {
        let record = self.load(instance_id).await?;
        let today = self.clock.today();
        let graph = record.graph()?;
        let statuses = status_map(&record.steps);

        let progress = ProgressAggregator::summarize(&record.steps, today);
        let status = ProgressAggregator::derive_status(record.instance.status, &progress);

        let steps = record
            .steps
            .iter()
            .map(|s| StepStatusView {
                id: s.id,
                order_index: s.order_index,
                name: s.step_name.clone(),
                step_type: s.step_type,
                required: s.required,
                status: s.status,
                due_date: s.due_date,
                overdue: s.is_overdue(today),
                assigned_role: s.assigned_role.clone(),
                assigned_to: s.assigned_to,
                waiting_on: if s.is_done() {
                    Vec::new()
                } else {
                    graph.pending_dependencies(s.id, &statuses)
                },
            })
            .collect();

        let milestones = record
            .milestones
            .iter()
            .cloned()
            .map(|mut m| {
                m.refresh(today);
                m
            })
            .collect();

        Ok(InstanceStatusView {
            instance_id,
            employee_id: record.instance.employee_id,
            template_name: record.instance.template_name.clone(),
            workflow_type: record.instance.workflow_type,
            status,
            start_date: record.instance.start_date,
            expected_completion_date: record.instance.expected_completion_date,
            actual_completion_date: record.instance.actual_completion_date,
            progress,
            steps,
            ready_steps: graph.ready_steps(&statuses),
            open_exceptions: record.open_exceptions().cloned().collect(),
            milestones,
        })
    }

    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<WorkflowInstance>> {
        Ok(self
            .repository
            .list(filter)
            .await?
            .into_iter()
            .map(|r| r.instance)
            .collect())
    }

    /// Delete an instance with all its steps, integrations, exceptions and milestones
    pub async fn delete_instance(&self, instance_id: InstanceId) -> Result<()> {
        self.repository.delete(instance_id).await?;
        info!(instance_id = %instance_id, "Workflow deleted");
        Ok(())
    }

    /// The employee's open instance of `workflow_type`, if any
    pub async fn active_instance_for(
        &self,
        employee_id: EmployeeId,
        workflow_type: WorkflowType,
    ) -> Result<Option<WorkflowInstance>> {
        let filter = InstanceFilter::new()
            .employee(employee_id)
            .workflow_type(workflow_type)
            .open_only()
            .paginate(1, 0);
        Ok(self
            .repository
            .list(&filter)
            .await?
            .into_iter()
            .next()
            .map(|r| r.instance))
    }

    pub async fn add_note(
        &self,
        instance_id: InstanceId,
        actor: &Actor,
        body: &str,
    ) -> Result<WorkflowInstance> {
        if body.trim().is_empty() {
            return Err(WorkflowError::InvalidTransition("note body is empty".to_string()));
        }
        let mut record = self.load(instance_id).await?;
        let expected = record.instance.version;
        let now = self.clock.now();
        record.instance.add_note(actor.clone(), body.trim(), now);
        self.commit(&mut record, expected, now).await?;
        Ok(record.instance)
    }

    // ---- integrations ----

    /// Request an integration for an instance, optionally tied to one step.
    ///
    /// At most one integration per (step, type) pair is live at a time: an
    /// open one is returned as is, and once the latest one has failed the
    /// request is refused with [`WorkflowError::IntegrationExhausted`] so the
    /// retry budget cannot be restarted.
    pub async fn trigger_integration(
        &self,
        instance_id: InstanceId,
        step_id: Option<StepInstanceId>,
        integration_type: &str,
        payload: Option<serde_json::Value>,
    ) -> Result<WorkflowIntegration> {
        let integration_type = integration_type.trim();
        if integration_type.is_empty() {
            return Err(WorkflowError::InvalidTransition(
                "integration type is empty".to_string(),
            ));
        }

        let mut record = self.load(instance_id).await?;
        let step_payload = match step_id {
            Some(step_id) => {
                let step = record.step(step_id)?;
                if step.is_done() {
                    return Err(WorkflowError::AlreadyCompleted(format!(
                        "step {} is {}",
                        step_id, step.status
                    )));
                }
                step.integration_payload.clone()
            }
            None => None,
        };

        if let Some(latest) = record
            .integrations
            .iter()
            .rev()
            .find(|i| i.step_id == step_id && i.integration_type == integration_type)
        {
            match latest.status {
                IntegrationStatus::Pending | IntegrationStatus::InProgress => {
                    debug!(integration_id = %latest.id, "Integration already requested");
                    return Ok(latest.clone());
                }
                IntegrationStatus::Failed => {
                    warn!(
                        integration_id = %latest.id,
                        integration_type,
                        retry_count = latest.retry_count,
                        "Refusing to re-request an exhausted integration"
                    );
                    return Err(WorkflowError::IntegrationExhausted(latest.id));
                }
                IntegrationStatus::Succeeded => {
                    return Err(WorkflowError::AlreadyCompleted(format!(
                        "integration {} already succeeded",
                        latest.id
                    )));
                }
            }
        }

        let payload = payload.or(step_payload).unwrap_or_else(|| json!({}));
        let expected = record.instance.version;
        let now = self.clock.now();
        let integration = WorkflowIntegration::new(
            instance_id,
            step_id,
            integration_type,
            payload,
            self.config.max_retries_for(integration_type),
            now,
        );
        record.integrations.push(integration.clone());

        self.commit(&mut record, expected, now).await?;
        info!(
            integration_id = %integration.id,
            integration_type,
            instance_id = %instance_id,
            step_id = ?step_id,
            max_retries = integration.max_retries,
            "Integration requested"
        );
        self.emit(vec![integration_event("integration.requested", &integration)])
            .await;

        Ok(integration)
    }

    pub async fn mark_integration_in_progress(
        &self,
        integration_id: IntegrationId,
        external_id: Option<String>,
    ) -> Result<WorkflowIntegration> {
        let mut record = self.record_for_integration(integration_id).await?;
        let expected = record.instance.version;
        let now = self.clock.now();

        let integration = record.integration_mut(integration_id)?;
        if integration.mark_in_progress(external_id, now)? == Transition::Unchanged {
            return Ok(integration.clone());
        }
        let integration = integration.clone();

        self.commit(&mut record, expected, now).await?;
        debug!(
            integration_id = %integration_id,
            external_id = ?integration.external_id,
            "Integration in progress"
        );
        Ok(integration)
    }

    /// Re-issue a failed attempt while retry budget remains
    pub async fn retrigger_integration(
        &self,
        integration_id: IntegrationId,
    ) -> Result<WorkflowIntegration> {
        let mut record = self.record_for_integration(integration_id).await?;
        let expected = record.instance.version;
        let now = self.clock.now();

        let integration = record.integration_mut(integration_id)?;
        integration.retrigger(now)?;
        let integration = integration.clone();

        self.commit(&mut record, expected, now).await?;
        info!(
            integration_id = %integration_id,
            remaining = integration.remaining_retries(),
            "Integration re-requested"
        );
        self.emit(vec![integration_event("integration.requested", &integration)
            .with_metadata("retry", integration.retry_count.to_string())])
            .await;

        Ok(integration)
    }

    /// Record the outcome reported by an integration collaborator.
    ///
    /// Success completes an auto-trigger step. Reaching the retry cap marks
    /// the integration failed and raises one high-severity exception; later
    /// calls are rejected with [`WorkflowError::IntegrationExhausted`].
    pub async fn record_integration_result(
        &self,
        integration_id: IntegrationId,
        success: bool,
        response: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<RetryOutcome> {
        let mut record = self.record_for_integration(integration_id).await?;
        let expected = record.instance.version;
        let previous_status = record.instance.status;
        let now = self.clock.now();

        let integration = record.integration_mut(integration_id)?;
        let outcome = integration
            .record_result(success, response, error_message, now)
            .inspect_err(|e| {
                warn!(integration_id = %integration_id, error = %e, "Integration result rejected")
            })?;
        let integration = integration.clone();

        let mut events = Vec::new();
        match outcome {
            RetryOutcome::Unchanged => return Ok(outcome),
            RetryOutcome::Succeeded => {
                info!(
                    integration_id = %integration_id,
                    integration_type = %integration.integration_type,
                    "Integration succeeded"
                );
                events.push(integration_event("integration.succeeded", &integration));

                if let Some(step_id) = integration.step_id {
                    let actor = self.system_actor();
                    let step = record.step_mut(step_id)?;
                    if step.auto_trigger
                        && self.machine.complete_from_integration(step, &actor, now)
                            == Transition::Applied
                    {
                        events.push(step_event("step.completed", step, &actor));
                    }
                }
            }
            RetryOutcome::RetryAllowed { remaining } => {
                warn!(
                    integration_id = %integration_id,
                    integration_type = %integration.integration_type,
                    retry_count = integration.retry_count,
                    remaining,
                    error = ?integration.error_message,
                    "Integration attempt failed"
                );
                events.push(integration_event("integration.failed", &integration));
            }
            RetryOutcome::Exhausted => {
                error!(
                    integration_id = %integration_id,
                    integration_type = %integration.integration_type,
                    retry_count = integration.retry_count,
                    error = ?integration.error_message,
                    "Integration retries exhausted"
                );
                events.push(integration_event("integration.exhausted", &integration));

                let already_escalated = integration.step_id.is_some()
                    && record.open_exceptions().any(|e| {
                        e.step_id == integration.step_id
                            && e.exception_type == ExceptionType::IntegrationFailed
                            && e.severity == Severity::High
                    });
                if already_escalated {
                    warn!(
                        integration_id = %integration_id,
                        step_id = ?integration.step_id,
                        "Step already has an open integration failure exception"
                    );
                } else {
                    let exception = WorkflowException::new(
                        record.instance.id,
                        integration.step_id,
                        ExceptionType::IntegrationFailed,
                        Severity::High,
                        format!("{} integration failed", integration.integration_type),
                        format!(
                            "Gave up after {} attempts: {}",
                            integration.retry_count,
                            integration.error_message.as_deref().unwrap_or("unknown error")
                        ),
                        self.system_actor(),
                        now,
                    )
                    .for_integration(integration_id);

                    events.push(exception_event("exception.raised", &exception));
                    record.exceptions.push(exception);
                }
            }
        }

        self.commit(&mut record, expected, now).await?;
        events.extend(completion_event(previous_status, &record.instance));
        self.emit(events).await;

        Ok(outcome)
    }

    pub async fn list_integrations(&self, instance_id: InstanceId) -> Result<Vec<WorkflowIntegration>> {
        Ok(self.load(instance_id).await?.integrations)
    }

    // ---- exceptions ----

    /// Record a problem against an instance (optionally a step)
    pub async fn raise_exception(&self, exception: WorkflowException) -> Result<WorkflowException> {
        let mut record = self.load(exception.instance_id).await?;
        if let Some(step_id) = exception.step_id {
            record.step(step_id)?;
        }
        let expected = record.instance.version;
        let now = self.clock.now();
        record.exceptions.push(exception.clone());

        self.commit(&mut record, expected, now).await?;
        warn!(
            exception_id = %exception.id,
            instance_id = %exception.instance_id,
            severity = ?exception.severity,
            title = %exception.title,
            "Exception raised"
        );
        self.emit(vec![exception_event("exception.raised", &exception)])
            .await;

        Ok(exception)
    }

    /// open → resolved; a second resolution is rejected
    pub async fn resolve_exception(
        &self,
        exception_id: ExceptionId,
        actor: &Actor,
        notes: &str,
    ) -> Result<WorkflowException> {
        let instance_id = self
            .repository
            .find_by_exception(exception_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("exception {}", exception_id)))?;
        let mut record = self.load(instance_id).await?;
        let expected = record.instance.version;
        let now = self.clock.now();

        let exception = record.exception_mut(exception_id)?;
        exception.resolve(actor.clone(), notes, now)?;
        let exception = exception.clone();

        self.commit(&mut record, expected, now).await?;
        info!(exception_id = %exception_id, actor = %actor, "Exception resolved");
        self.emit(vec![exception_event("exception.resolved", &exception)])
            .await;

        Ok(exception)
    }

    pub async fn list_exceptions(
        &self,
        instance_id: InstanceId,
        open_only: bool,
    ) -> Result<Vec<WorkflowException>> {
        let record = self.load(instance_id).await?;
        Ok(record
            .exceptions
            .into_iter()
            .filter(|e| !open_only || e.is_open())
            .collect())
    }

    // ---- milestones ----

    pub async fn add_milestone(
        &self,
        instance_id: InstanceId,
        name: &str,
        description: Option<String>,
        target_date: NaiveDate,
    ) -> Result<Milestone> {
        if name.trim().is_empty() {
            return Err(WorkflowError::InvalidTransition(
                "milestone name is empty".to_string(),
            ));
        }
        let mut record = self.load(instance_id).await?;
        let expected = record.instance.version;
        let now = self.clock.now();

        let mut milestone = Milestone::new(instance_id, name.trim(), description, target_date, now);
        milestone.refresh(self.clock.today());
        record.milestones.push(milestone.clone());

        self.commit(&mut record, expected, now).await?;
        debug!(milestone_id = %milestone.id, name = %milestone.name, "Milestone added");
        Ok(milestone)
    }

    /// Mark a milestone achieved, on `on` or today
    pub async fn complete_milestone(
        &self,
        milestone_id: MilestoneId,
        on: Option<NaiveDate>,
    ) -> Result<Milestone> {
        let mut record = self.record_for_milestone(milestone_id).await?;
        let expected = record.instance.version;
        let now = self.clock.now();
        let today = self.clock.today();

        let milestone = record.milestone_mut(milestone_id)?;
        milestone.complete(on.unwrap_or(today))?;
        let milestone = milestone.clone();

        self.commit(&mut record, expected, now).await?;
        info!(milestone_id = %milestone_id, name = %milestone.name, "Milestone achieved");
        self.emit(vec![Event::new("milestone.achieved", &milestone)
            .with_metadata("instance_id", milestone.instance_id.to_string())])
            .await;

        Ok(milestone)
    }

    /// Claim the celebration notification for an achieved milestone.
    ///
    /// Returns true for exactly one caller; later calls return false.
    pub async fn mark_celebration_sent(&self, milestone_id: MilestoneId) -> Result<bool> {
        let mut record = self.record_for_milestone(milestone_id).await?;
        let expected = record.instance.version;
        let now = self.clock.now();

        if !record.milestone_mut(milestone_id)?.claim_celebration()? {
            return Ok(false);
        }

        self.commit(&mut record, expected, now).await?;
        debug!(milestone_id = %milestone_id, "Celebration claimed");
        Ok(true)
    }

    pub async fn list_milestones(&self, instance_id: InstanceId) -> Result<Vec<Milestone>> {
        let today = self.clock.today();
        let mut milestones = self.load(instance_id).await?.milestones;
        for milestone in &mut milestones {
            milestone.refresh(today);
        }
        milestones.sort_by_key(|m| m.target_date);
        Ok(milestones)
    }

    /// Pending milestones across all listed instances that are past their target
    pub async fn missed_milestones(&self, filter: &InstanceFilter) -> Result<Vec<Milestone>> {
        let today = self.clock.today();
        Ok(self
            .repository
            .list(filter)
            .await?
            .into_iter()
            .flat_map(|r| r.milestones)
            .map(|mut m| {
                m.refresh(today);
                m
            })
            .filter(|m| m.status == MilestoneStatus::Missed)
            .collect())
    }

    // ---- reporting ----

    pub async fn statistics(&self, filter: &InstanceFilter) -> Result<WorkflowStatistics> {
        let records = self.repository.list(filter).await?;
        Ok(WorkflowStatistics::from_records(&records, self.clock.today()))
    }

    // ---- internals ----

    async fn load(&self, instance_id: InstanceId) -> Result<InstanceRecord> {
        self.repository
            .load(instance_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("instance {}", instance_id)))
    }

    async fn record_for_step(&self, step_id: StepInstanceId) -> Result<InstanceRecord> {
        let instance_id = self
            .repository
            .find_by_step(step_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("step {}", step_id)))?;
        self.load(instance_id).await
    }

    async fn record_for_integration(&self, integration_id: IntegrationId) -> Result<InstanceRecord> {
        let instance_id = self
            .repository
            .find_by_integration(integration_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("integration {}", integration_id)))?;
        self.load(instance_id).await
    }

    async fn record_for_milestone(&self, milestone_id: MilestoneId) -> Result<InstanceRecord> {
        let instance_id = self
            .repository
            .find_by_milestone(milestone_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("milestone {}", milestone_id)))?;
        self.load(instance_id).await
    }

    /// Re-derive progress and status, then compare-and-swap the aggregate
    async fn commit(
        &self,
        record: &mut InstanceRecord,
        expected_version: u64,
        now: DateTime<Utc>,
    ) -> Result<ProgressSummary> {
        let summary =
            ProgressAggregator::apply(&mut record.instance, &record.steps, self.clock.today());
        record.instance.updated_at = now;

        match self.repository.save(record, expected_version).await {
            Ok(version) => {
                record.instance.version = version;
                Ok(summary)
            }
            Err(e) => {
                warn!(instance_id = %record.instance.id, error = %e, "Instance save failed");
                Err(e)
            }
        }
    }

    /// Publish without letting delivery problems fail the operation
    async fn emit(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let count = events.len();
        if let Err(e) = self.publisher.publish_batch(events).await {
            warn!(error = %e, count, "Failed to publish workflow events");
        }
    }
}

fn instance_event(kind: &str, instance: &WorkflowInstance) -> Event {
    Event::new(
        kind,
        json!({
            "instance_id": instance.id,
            "employee_id": instance.employee_id,
            "template_name": instance.template_name,
            "workflow_type": instance.workflow_type,
            "status": instance.status,
            "overall_progress": instance.overall_progress,
        }),
    )
    .with_metadata("instance_id", instance.id.to_string())
}

fn step_event(kind: &str, step: &StepInstance, actor: &Actor) -> Event {
    Event::new(
        kind,
        json!({
            "instance_id": step.instance_id,
            "step_id": step.id,
            "step_name": step.step_name,
            "step_type": step.step_type,
            "status": step.status,
            "actor": actor,
        }),
    )
    .with_metadata("instance_id", step.instance_id.to_string())
}

fn integration_event(kind: &str, integration: &WorkflowIntegration) -> Event {
    Event::new(
        kind,
        json!({
            "integration_id": integration.id,
            "instance_id": integration.instance_id,
            "step_id": integration.step_id,
            "integration_type": integration.integration_type,
            "request_payload": integration.request_payload,
            "retry_count": integration.retry_count,
            "max_retries": integration.max_retries,
            "error_message": integration.error_message,
        }),
    )
    .with_metadata("instance_id", integration.instance_id.to_string())
}

fn exception_event(kind: &str, exception: &WorkflowException) -> Event {
    Event::new(kind, exception)
        .with_metadata("instance_id", exception.instance_id.to_string())
}

/// `workflow.completed` when this write moved the instance into completed
fn completion_event(previous: InstanceStatus, instance: &WorkflowInstance) -> Option<Event> {
    (previous != InstanceStatus::Completed && instance.status == InstanceStatus::Completed)
        .then(|| instance_event("workflow.completed", instance))
}

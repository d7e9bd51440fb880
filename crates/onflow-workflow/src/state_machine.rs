//! Step lifecycle: not_started → in_progress → completed, or → skipped
//!
//! There is no generic back-transition. [`StepMachine::reopen`] exists only
//! for the administrative override path, which the engine guards with a
//! mandatory instance note.

use crate::{
    dag::StepGraph,
    ids::StepInstanceId,
    instance::{StepInstance, StepStatus},
    Result, WorkflowError,
};
use chrono::{DateTime, Utc};
use onflow_core::{Actor, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Result of a transition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// State changed
    Applied,
    /// Requested state already held; nothing was written
    Unchanged,
}

impl Transition {
    pub fn is_applied(&self) -> bool {
        *self == Transition::Applied
    }
}

/// How a skip request treats required steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SkipPolicy {
    /// Only optional steps may be skipped
    Standard,
    /// Required steps may be skipped with an approver on record
    Waiver { approved_by: UserId },
}

/// Validates and applies step transitions
#[derive(Debug, Clone, Copy, Default)]
pub struct StepMachine {
    require_explicit_start: bool,
}

impl StepMachine {
    pub fn new(require_explicit_start: bool) -> Self {
        Self {
            require_explicit_start,
        }
    }

    /// not_started → in_progress
    pub fn start(
        &self,
        step: &mut StepInstance,
        graph: &StepGraph,
        statuses: &HashMap<StepInstanceId, StepStatus>,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        match step.status {
            StepStatus::InProgress => Ok(Transition::Unchanged),
            StepStatus::Completed | StepStatus::Skipped => Err(WorkflowError::AlreadyCompleted(
                format!("step {} is {}", step.id, step.status),
            )),
            StepStatus::NotStarted => {
                Self::ensure_dependencies(step, graph, statuses)?;
                step.status = StepStatus::InProgress;
                step.started_at = Some(now);
                step.started_by = Some(actor.clone());
                Ok(Transition::Applied)
            }
        }
    }

    /// in_progress (or not_started unless an explicit start is required) → completed
    pub fn complete(
        &self,
        step: &mut StepInstance,
        graph: &StepGraph,
        statuses: &HashMap<StepInstanceId, StepStatus>,
        actor: &Actor,
        actual_hours: Option<f32>,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        match step.status {
            StepStatus::Completed => Ok(Transition::Unchanged),
            StepStatus::Skipped => Err(WorkflowError::AlreadyCompleted(format!(
                "step {} was skipped",
                step.id
            ))),
            StepStatus::NotStarted if self.require_explicit_start => {
                Err(WorkflowError::InvalidTransition(format!(
                    "step {} must be started before it can be completed",
                    step.id
                )))
            }
            StepStatus::NotStarted | StepStatus::InProgress => {
                Self::ensure_dependencies(step, graph, statuses)?;
                if step.started_at.is_none() {
                    step.started_at = Some(now);
                    step.started_by = Some(actor.clone());
                }
                step.status = StepStatus::Completed;
                step.completed_at = Some(now);
                step.completed_by = Some(actor.clone());
                if actual_hours.is_some() {
                    step.actual_hours = actual_hours;
                }
                Ok(Transition::Applied)
            }
        }
    }

    /// Completion driven by a successful integration.
    ///
    /// Auto-triggered steps run their integration from instantiation onward,
    /// so predecessor state is not consulted.
    pub fn complete_from_integration(
        &self,
        step: &mut StepInstance,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Transition {
        if step.is_done() {
            return Transition::Unchanged;
        }
        if step.started_at.is_none() {
            step.started_at = Some(now);
            step.started_by = Some(actor.clone());
        }
        step.status = StepStatus::Completed;
        step.completed_at = Some(now);
        step.completed_by = Some(actor.clone());
        Transition::Applied
    }

    /// not_started | in_progress → skipped
    pub fn skip(
        &self,
        step: &mut StepInstance,
        actor: &Actor,
        reason: &str,
        policy: SkipPolicy,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        match step.status {
            StepStatus::Skipped => return Ok(Transition::Unchanged),
            StepStatus::Completed => {
                return Err(WorkflowError::AlreadyCompleted(format!(
                    "step {} is completed",
                    step.id
                )))
            }
            StepStatus::NotStarted | StepStatus::InProgress => {}
        }

        if reason.trim().is_empty() {
            return Err(WorkflowError::InvalidTransition(
                "a reason is required to skip a step".to_string(),
            ));
        }

        let waived_by = match (step.required, policy) {
            (true, SkipPolicy::Standard) => {
                return Err(WorkflowError::RequiredStepCannotSkip(step.id));
            }
            (true, SkipPolicy::Waiver { approved_by }) => Some(approved_by),
            (false, _) => None,
        };

        step.status = StepStatus::Skipped;
        step.skip_reason = Some(reason.to_string());
        step.waived_by = waived_by;
        step.completed_at = Some(now);
        step.completed_by = Some(actor.clone());
        Ok(Transition::Applied)
    }

    /// completed | skipped → not_started (administrative override only)
    pub fn reopen(&self, step: &mut StepInstance) -> Result<Transition> {
        if !step.is_done() {
            return Err(WorkflowError::InvalidTransition(format!(
                "step {} is {} and cannot be reopened",
                step.id, step.status
            )));
        }

        step.status = StepStatus::NotStarted;
        step.started_at = None;
        step.started_by = None;
        step.completed_at = None;
        step.completed_by = None;
        step.actual_hours = None;
        step.skip_reason = None;
        step.waived_by = None;
        Ok(Transition::Applied)
    }

    fn ensure_dependencies(
        step: &StepInstance,
        graph: &StepGraph,
        statuses: &HashMap<StepInstanceId, StepStatus>,
    ) -> Result<()> {
        let pending = graph.pending_dependencies(step.id, statuses);
        if pending.is_empty() {
            Ok(())
        } else {
            Err(WorkflowError::DependencyNotSatisfied {
                step_id: step.id,
                pending,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dag::status_map, ids::InstanceId, template::StepType};
    use chrono::NaiveDate;

    fn step(required: bool, deps: Vec<StepInstanceId>) -> StepInstance {
        StepInstance {
            id: StepInstanceId::new(),
            instance_id: InstanceId::new(),
            order_index: 0,
            step_name: "Step".to_string(),
            description: None,
            step_type: StepType::Training,
            required,
            auto_trigger: false,
            assigned_role: "hr".to_string(),
            assigned_to: None,
            status: StepStatus::NotStarted,
            due_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            depends_on: deps,
            estimated_hours: None,
            actual_hours: None,
            integration_payload: None,
            started_at: None,
            started_by: None,
            completed_at: None,
            completed_by: None,
            skip_reason: None,
            waived_by: None,
        }
    }

    fn actor() -> Actor {
        Actor::user(UserId::new())
    }

    #[test]
    fn test_start_requires_dependencies() {
        let machine = StepMachine::default();
        let first = step(true, vec![]);
        let mut second = step(true, vec![first.id]);
        let graph = StepGraph::new(&[first.clone(), second.clone()]).unwrap();

        let statuses = status_map(&[first.clone(), second.clone()]);
        let err = machine
            .start(&mut second, &graph, &statuses, &actor(), Utc::now())
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::DependencyNotSatisfied { ref pending, .. } if pending == &vec![first.id]
        ));

        let mut statuses = statuses;
        statuses.insert(first.id, StepStatus::Skipped);
        let transition = machine
            .start(&mut second, &graph, &statuses, &actor(), Utc::now())
            .unwrap();
        assert_eq!(transition, Transition::Applied);
        assert_eq!(second.status, StepStatus::InProgress);
        assert!(second.started_at.is_some());
    }

    #[test]
    fn test_double_completion_is_absorbed() {
        let machine = StepMachine::default();
        let mut s = step(true, vec![]);
        let graph = StepGraph::new(std::slice::from_ref(&s)).unwrap();
        let statuses = status_map(std::slice::from_ref(&s));
        let who = actor();

        let first = machine
            .complete(&mut s, &graph, &statuses, &who, Some(1.5), Utc::now())
            .unwrap();
        let completed_at = s.completed_at;
        let second = machine
            .complete(&mut s, &graph, &statuses, &who, Some(1.5), Utc::now())
            .unwrap();

        assert_eq!(first, Transition::Applied);
        assert_eq!(second, Transition::Unchanged);
        assert_eq!(s.completed_at, completed_at);
        assert_eq!(s.actual_hours, Some(1.5));
    }

    #[test]
    fn test_explicit_start_policy() {
        let machine = StepMachine::new(true);
        let mut s = step(true, vec![]);
        let graph = StepGraph::new(std::slice::from_ref(&s)).unwrap();
        let statuses = status_map(std::slice::from_ref(&s));

        assert!(matches!(
            machine.complete(&mut s, &graph, &statuses, &actor(), None, Utc::now()),
            Err(WorkflowError::InvalidTransition(_))
        ));

        machine.start(&mut s, &graph, &statuses, &actor(), Utc::now()).unwrap();
        assert!(machine
            .complete(&mut s, &graph, &statuses, &actor(), None, Utc::now())
            .is_ok());
    }

    #[test]
    fn test_required_step_skip_needs_waiver() {
        let machine = StepMachine::default();
        let mut s = step(true, vec![]);

        assert!(matches!(
            machine.skip(&mut s, &actor(), "not needed", SkipPolicy::Standard, Utc::now()),
            Err(WorkflowError::RequiredStepCannotSkip(_))
        ));
        assert_eq!(s.status, StepStatus::NotStarted);

        let approver = UserId::new();
        machine
            .skip(
                &mut s,
                &actor(),
                "covered by prior employment",
                SkipPolicy::Waiver { approved_by: approver },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(s.status, StepStatus::Skipped);
        assert_eq!(s.waived_by, Some(approver));
    }

    #[test]
    fn test_skip_requires_reason_and_rejects_completed() {
        let machine = StepMachine::default();
        let mut s = step(false, vec![]);

        assert!(matches!(
            machine.skip(&mut s, &actor(), "  ", SkipPolicy::Standard, Utc::now()),
            Err(WorkflowError::InvalidTransition(_))
        ));

        s.status = StepStatus::Completed;
        assert!(matches!(
            machine.skip(&mut s, &actor(), "late", SkipPolicy::Standard, Utc::now()),
            Err(WorkflowError::AlreadyCompleted(_))
        ));
    }

    #[test]
    fn test_no_start_after_completion() {
        let machine = StepMachine::default();
        let mut s = step(true, vec![]);
        s.status = StepStatus::Completed;
        let graph = StepGraph::new(std::slice::from_ref(&s)).unwrap();
        let statuses = status_map(std::slice::from_ref(&s));

        assert!(matches!(
            machine.start(&mut s, &graph, &statuses, &actor(), Utc::now()),
            Err(WorkflowError::AlreadyCompleted(_))
        ));
    }

    #[test]
    fn test_reopen_clears_completion() {
        let machine = StepMachine::default();
        let mut s = step(true, vec![]);
        assert!(machine.reopen(&mut s).is_err());

        s.status = StepStatus::Completed;
        s.completed_at = Some(Utc::now());
        s.completed_by = Some(actor());
        machine.reopen(&mut s).unwrap();

        assert_eq!(s.status, StepStatus::NotStarted);
        assert!(s.completed_at.is_none());
        assert!(s.completed_by.is_none());
    }
}

//! Out-of-band problem records
//!
//! Exceptions are escalation signals. Raising one never changes step or
//! instance status; callers that want to block on open critical exceptions
//! implement that policy themselves.

use crate::{
    ids::{ExceptionId, InstanceId, IntegrationId, StepInstanceId},
    Result, WorkflowError,
};
use chrono::{DateTime, Utc};
use onflow_core::Actor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionType {
    ValidationFailed,
    IntegrationFailed,
    DocumentIssue,
    Delay,
    Compliance,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowException {
    pub id: ExceptionId,
    pub instance_id: InstanceId,
    pub step_id: Option<StepInstanceId>,
    /// Integration whose exhaustion raised this exception, if any
    pub integration_id: Option<IntegrationId>,
    pub exception_type: ExceptionType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub resolution_status: ResolutionStatus,
    pub raised_by: Actor,
    pub raised_at: DateTime<Utc>,
    pub resolved_by: Option<Actor>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
}

impl WorkflowException {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        instance_id: InstanceId,
        step_id: Option<StepInstanceId>,
        exception_type: ExceptionType,
        severity: Severity,
        title: impl Into<String>,
        description: impl Into<String>,
        raised_by: Actor,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExceptionId::new(),
            instance_id,
            step_id,
            integration_id: None,
            exception_type,
            severity,
            title: title.into(),
            description: description.into(),
            resolution_status: ResolutionStatus::Open,
            raised_by,
            raised_at: now,
            resolved_by: None,
            resolved_at: None,
            resolution_notes: None,
        }
    }

    pub fn for_integration(mut self, integration_id: IntegrationId) -> Self {
        self.integration_id = Some(integration_id);
        self
    }

    pub fn is_open(&self) -> bool {
        self.resolution_status == ResolutionStatus::Open
    }

    /// open → resolved, once
    pub fn resolve(
        &mut self,
        resolved_by: Actor,
        notes: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.is_open() {
            return Err(WorkflowError::AlreadyResolved(self.id));
        }

        self.resolution_status = ResolutionStatus::Resolved;
        self.resolved_by = Some(resolved_by);
        self.resolved_at = Some(now);
        self.resolution_notes = Some(notes.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_once() {
        let mut exception = WorkflowException::new(
            InstanceId::new(),
            None,
            ExceptionType::DocumentIssue,
            Severity::Medium,
            "Missing tax form",
            "W-4 not uploaded",
            Actor::system("test"),
            Utc::now(),
        );
        assert!(exception.is_open());

        exception
            .resolve(Actor::system("hr"), "Uploaded manually", Utc::now())
            .unwrap();
        assert_eq!(exception.resolution_status, ResolutionStatus::Resolved);
        assert_eq!(exception.resolution_notes.as_deref(), Some("Uploaded manually"));

        let again = exception.resolve(Actor::system("hr"), "again", Utc::now());
        assert!(matches!(again, Err(WorkflowError::AlreadyResolved(_))));
        assert_eq!(exception.resolution_notes.as_deref(), Some("Uploaded manually"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
    }
}

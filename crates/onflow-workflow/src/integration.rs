//! Integration retry bookkeeping
//!
//! Tracks calls out to external systems (background-check providers,
//! equipment provisioning). Scheduling retries is the caller's job; this
//! module only records attempts and decides eligibility. `retry_count` is
//! changed exclusively by [`WorkflowIntegration::record_result`].

use crate::{
    ids::{InstanceId, IntegrationId, StepInstanceId},
    state_machine::Transition,
    Result, WorkflowError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Integration lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    /// Waiting for the external collaborator to pick up the request
    Pending,
    /// Collaborator acknowledged and is executing
    InProgress,
    Succeeded,
    /// Retry budget exhausted
    Failed,
}

impl IntegrationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, IntegrationStatus::Succeeded | IntegrationStatus::Failed)
    }
}

/// One reported result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationAttempt {
    pub attempt_number: u32,
    pub succeeded: bool,
    pub response_payload: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// What a recorded result means for the integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    Succeeded,
    /// Failed, but the caller may trigger again
    RetryAllowed { remaining: u32 },
    /// Failed and the budget is now used up
    Exhausted,
    /// Duplicate success report, nothing recorded
    Unchanged,
}

/// Call out to an external system
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowIntegration {
    pub id: IntegrationId,
    pub instance_id: InstanceId,
    pub step_id: Option<StepInstanceId>,
    pub integration_type: String,
    /// Correlation id assigned by the external system
    pub external_id: Option<String>,
    pub status: IntegrationStatus,
    pub request_payload: serde_json::Value,
    pub response_payload: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    #[serde(default)]
    pub attempts: Vec<IntegrationAttempt>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowIntegration {
    pub fn new(
        instance_id: InstanceId,
        step_id: Option<StepInstanceId>,
        integration_type: impl Into<String>,
        request_payload: serde_json::Value,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: IntegrationId::new(),
            instance_id,
            step_id,
            integration_type: integration_type.into(),
            external_id: None,
            status: IntegrationStatus::Pending,
            request_payload,
            response_payload: None,
            retry_count: 0,
            max_retries: max_retries.max(1),
            last_attempt_at: None,
            error_message: None,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another attempt may be made
    pub fn can_retry(&self) -> bool {
        !self.is_terminal() && self.retry_count < self.max_retries
    }

    pub fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }

    /// Collaborator picked up the request
    pub fn mark_in_progress(
        &mut self,
        external_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        self.ensure_open()?;

        if self.status == IntegrationStatus::InProgress && external_id.is_none() {
            return Ok(Transition::Unchanged);
        }

        self.status = IntegrationStatus::InProgress;
        if external_id.is_some() {
            self.external_id = external_id;
        }
        self.last_attempt_at = Some(now);
        self.updated_at = now;
        Ok(Transition::Applied)
    }

    /// Re-issue the same integration after a failed attempt
    pub fn retrigger(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_open()?;
        self.status = IntegrationStatus::Pending;
        self.updated_at = now;
        Ok(())
    }

    /// Record the outcome of an attempt
    pub fn record_result(
        &mut self,
        success: bool,
        response_payload: Option<serde_json::Value>,
        error_message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<RetryOutcome> {
        match self.status {
            IntegrationStatus::Succeeded if success => return Ok(RetryOutcome::Unchanged),
            IntegrationStatus::Succeeded | IntegrationStatus::Failed => self.ensure_open()?,
            IntegrationStatus::Pending | IntegrationStatus::InProgress => {}
        }

        self.attempts.push(IntegrationAttempt {
            attempt_number: self.attempts.len() as u32 + 1,
            succeeded: success,
            response_payload: response_payload.clone(),
            error_message: error_message.clone(),
            recorded_at: now,
        });
        self.last_attempt_at = Some(now);
        self.updated_at = now;
        self.response_payload = response_payload;

        if success {
            self.status = IntegrationStatus::Succeeded;
            self.error_message = None;
            return Ok(RetryOutcome::Succeeded);
        }

        self.retry_count += 1;
        self.error_message =
            Some(error_message.unwrap_or_else(|| "integration reported failure".to_string()));

        if self.retry_count >= self.max_retries {
            self.status = IntegrationStatus::Failed;
            Ok(RetryOutcome::Exhausted)
        } else {
            self.status = IntegrationStatus::Pending;
            Ok(RetryOutcome::RetryAllowed {
                remaining: self.remaining_retries(),
            })
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.status {
            IntegrationStatus::Failed => Err(WorkflowError::IntegrationExhausted(self.id)),
            IntegrationStatus::Succeeded => Err(WorkflowError::AlreadyCompleted(format!(
                "integration {} already succeeded",
                self.id
            ))),
            IntegrationStatus::Pending | IntegrationStatus::InProgress => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn integration(max_retries: u32) -> WorkflowIntegration {
        WorkflowIntegration::new(
            InstanceId::new(),
            Some(StepInstanceId::new()),
            "background_check",
            serde_json::json!({"provider": "checkr"}),
            max_retries,
            Utc::now(),
        )
    }

    #[test]
    fn test_exhaustion_after_max_retries() {
        let mut it = integration(3);

        assert_eq!(
            it.record_result(false, None, Some("timeout".into()), Utc::now()).unwrap(),
            RetryOutcome::RetryAllowed { remaining: 2 }
        );
        assert!(it.can_retry());
        assert_eq!(
            it.record_result(false, None, None, Utc::now()).unwrap(),
            RetryOutcome::RetryAllowed { remaining: 1 }
        );
        assert_eq!(
            it.record_result(false, None, Some("provider down".into()), Utc::now()).unwrap(),
            RetryOutcome::Exhausted
        );

        assert_eq!(it.status, IntegrationStatus::Failed);
        assert_eq!(it.retry_count, 3);
        assert!(!it.can_retry());
        assert_eq!(it.error_message.as_deref(), Some("provider down"));

        let fourth = it.record_result(false, None, None, Utc::now());
        assert!(matches!(fourth, Err(WorkflowError::IntegrationExhausted(_))));
        assert_eq!(it.retry_count, 3);
        assert_eq!(it.attempts.len(), 3);
    }

    #[test]
    fn test_success_after_failure() {
        let mut it = integration(3);
        it.record_result(false, None, None, Utc::now()).unwrap();
        it.retrigger(Utc::now()).unwrap();
        it.mark_in_progress(Some("ext-42".into()), Utc::now()).unwrap();

        let outcome = it
            .record_result(true, Some(serde_json::json!({"clear": true})), None, Utc::now())
            .unwrap();

        assert_eq!(outcome, RetryOutcome::Succeeded);
        assert_eq!(it.status, IntegrationStatus::Succeeded);
        assert_eq!(it.external_id.as_deref(), Some("ext-42"));
        assert!(it.error_message.is_none());

        assert_eq!(
            it.record_result(true, None, None, Utc::now()).unwrap(),
            RetryOutcome::Unchanged
        );
        assert!(matches!(
            it.record_result(false, None, None, Utc::now()),
            Err(WorkflowError::AlreadyCompleted(_))
        ));
        assert!(matches!(
            it.retrigger(Utc::now()),
            Err(WorkflowError::AlreadyCompleted(_))
        ));
    }

    #[test]
    fn test_zero_budget_is_raised_to_one() {
        let mut it = integration(0);
        assert_eq!(it.max_retries, 1);
        assert_eq!(
            it.record_result(false, None, None, Utc::now()).unwrap(),
            RetryOutcome::Exhausted
        );
        assert!(matches!(
            it.retrigger(Utc::now()),
            Err(WorkflowError::IntegrationExhausted(_))
        ));
    }
}

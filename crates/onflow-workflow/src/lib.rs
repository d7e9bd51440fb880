//! Onboarding workflow engine
//!
//! This crate turns reusable workflow templates into running per-employee
//! instances and tracks them to completion:
//! - Template validation and instantiation with due-date resolution
//! - Explicit step dependency graphs computed at instantiation
//! - Step state machine (start, complete, skip with waiver, admin reopen)
//! - Progress aggregation and derived instance status
//! - Integration retry bookkeeping with automatic escalation
//! - Exception and milestone tracking
//! - Persistence contract with optimistic concurrency

pub mod dag;
pub mod engine;
pub mod exception;
pub mod filter;
pub mod ids;
pub mod instance;
pub mod instantiate;
pub mod integration;
pub mod milestone;
pub mod progress;
pub mod repository;
pub mod state_machine;
pub mod template;

pub use dag::StepGraph;
pub use engine::{InstanceStatusView, StepStatusView, WorkflowEngine};
pub use exception::{ExceptionType, ResolutionStatus, Severity, WorkflowException};
pub use filter::InstanceFilter;
pub use ids::{ExceptionId, InstanceId, IntegrationId, MilestoneId, StepInstanceId, TemplateId};
pub use instance::{InstanceStatus, StepInstance, StepStatus, WorkflowInstance};
pub use instantiate::{Instantiation, InstantiationRequest, Instantiator};
pub use integration::{IntegrationStatus, RetryOutcome, WorkflowIntegration};
pub use milestone::{Milestone, MilestoneStatus};
pub use progress::{ProgressAggregator, ProgressSummary, WorkflowStatistics};
pub use repository::{InMemoryWorkflowRepository, InstanceRecord, WorkflowRepository};
pub use state_machine::{SkipPolicy, StepMachine, Transition};
pub use template::{
    InMemoryTemplateStore, StepDefinition, StepType, TemplateLibrary, TemplateStatus,
    TemplateStore, WorkflowTemplate, WorkflowType,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Dependency not satisfied: step {step_id} waits on {pending:?}")]
    DependencyNotSatisfied {
        step_id: StepInstanceId,
        pending: Vec<StepInstanceId>,
    },

    #[error("Required step cannot be skipped without a waiver: {0}")]
    RequiredStepCannotSkip(StepInstanceId),

    #[error("Exception already resolved: {0}")]
    AlreadyResolved(ExceptionId),

    #[error("Already completed: {0}")]
    AlreadyCompleted(String),

    #[error("Integration retry budget exhausted: {0}")]
    IntegrationExhausted(IntegrationId),

    #[error("Concurrent modification of instance {instance_id}: expected version {expected}, found {found}")]
    ConcurrentModification {
        instance_id: InstanceId,
        expected: u64,
        found: u64,
    },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Employee already has an active {workflow_type} workflow: {instance_id}")]
    ActiveInstanceExists {
        workflow_type: WorkflowType,
        instance_id: InstanceId,
    },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] onflow_core::CoreError),
}

impl WorkflowError {
    /// Whether re-reading state and repeating the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkflowError::ConcurrentModification { .. })
    }

    /// Idempotence guards that callers may surface as a no-op
    pub fn is_idempotent_noop(&self) -> bool {
        matches!(
            self,
            WorkflowError::AlreadyResolved(_) | WorkflowError::AlreadyCompleted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

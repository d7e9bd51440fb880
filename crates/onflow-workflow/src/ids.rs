//! Stable identifiers for persisted workflow records

use onflow_core::uuid_id;

uuid_id!(
    /// Workflow template identifier
    TemplateId
);

uuid_id!(
    /// Workflow instance identifier
    InstanceId
);

uuid_id!(
    /// Step instance identifier
    StepInstanceId
);

uuid_id!(
    /// Integration record identifier
    IntegrationId
);

uuid_id!(
    /// Exception record identifier
    ExceptionId
);

uuid_id!(
    /// Milestone identifier
    MilestoneId
);

//! Persistence contract for instance aggregates
//!
//! The engine reads an [`InstanceRecord`], validates, mutates it and writes
//! it back with [`WorkflowRepository::save`], which must compare-and-swap on
//! the instance version. A version mismatch means another mutation of the
//! same instance won the race.

use crate::{
    dag::StepGraph,
    exception::WorkflowException,
    filter::InstanceFilter,
    ids::{ExceptionId, InstanceId, IntegrationId, MilestoneId, StepInstanceId},
    instance::{StepInstance, WorkflowInstance},
    integration::WorkflowIntegration,
    milestone::Milestone,
    Result, WorkflowError,
};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Everything owned by one workflow instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub instance: WorkflowInstance,
    pub steps: Vec<StepInstance>,
    #[serde(default)]
    pub integrations: Vec<WorkflowIntegration>,
    #[serde(default)]
    pub exceptions: Vec<WorkflowException>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

impl InstanceRecord {
    pub fn new(instance: WorkflowInstance, steps: Vec<StepInstance>) -> Self {
        Self {
            instance,
            steps,
            integrations: Vec::new(),
            exceptions: Vec::new(),
            milestones: Vec::new(),
        }
    }

    pub fn graph(&self) -> Result<StepGraph> {
        StepGraph::new(&self.steps)
    }

    pub fn step(&self, id: StepInstanceId) -> Result<&StepInstance> {
        self.steps
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| WorkflowError::NotFound(format!("step {}", id)))
    }

    pub fn step_mut(&mut self, id: StepInstanceId) -> Result<&mut StepInstance> {
        self.steps
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| WorkflowError::NotFound(format!("step {}", id)))
    }

    pub fn integration_mut(&mut self, id: IntegrationId) -> Result<&mut WorkflowIntegration> {
        self.integrations
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or_else(|| WorkflowError::NotFound(format!("integration {}", id)))
    }

    pub fn exception_mut(&mut self, id: ExceptionId) -> Result<&mut WorkflowException> {
        self.exceptions
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| WorkflowError::NotFound(format!("exception {}", id)))
    }

    pub fn milestone_mut(&mut self, id: MilestoneId) -> Result<&mut Milestone> {
        self.milestones
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| WorkflowError::NotFound(format!("milestone {}", id)))
    }

    pub fn open_exceptions(&self) -> impl Iterator<Item = &WorkflowException> {
        self.exceptions.iter().filter(|e| e.is_open())
    }
}

/// Instance persistence collaborator
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    /// Store a new aggregate
    async fn insert(&self, record: &InstanceRecord) -> Result<()>;

    /// Store a new aggregate unless the same employee already has an open
    /// instance of the same workflow type. The check and the write must be
    /// one atomic step; a conflict is [`WorkflowError::ActiveInstanceExists`].
    async fn insert_exclusive(&self, record: &InstanceRecord) -> Result<()>;

    async fn load(&self, id: InstanceId) -> Result<Option<InstanceRecord>>;

    /// Replace the aggregate if the stored version equals `expected_version`.
    /// Returns the new version.
    async fn save(&self, record: &InstanceRecord, expected_version: u64) -> Result<u64>;

    /// Remove the instance and every child record
    async fn delete(&self, id: InstanceId) -> Result<()>;

    async fn find_by_step(&self, id: StepInstanceId) -> Result<Option<InstanceId>>;

    async fn find_by_integration(&self, id: IntegrationId) -> Result<Option<InstanceId>>;

    async fn find_by_exception(&self, id: ExceptionId) -> Result<Option<InstanceId>>;

    async fn find_by_milestone(&self, id: MilestoneId) -> Result<Option<InstanceId>>;

    /// Matching aggregates, newest first
    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>>;
}

/// In-memory repository for testing and previews
#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    records: RwLock<HashMap<InstanceId, InstanceRecord>>,
    by_step: DashMap<StepInstanceId, InstanceId>,
    by_integration: DashMap<IntegrationId, InstanceId>,
    by_exception: DashMap<ExceptionId, InstanceId>,
    by_milestone: DashMap<MilestoneId, InstanceId>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn index(&self, record: &InstanceRecord) {
        let owner = record.instance.id;
        for step in &record.steps {
            self.by_step.insert(step.id, owner);
        }
        for integration in &record.integrations {
            self.by_integration.insert(integration.id, owner);
        }
        for exception in &record.exceptions {
            self.by_exception.insert(exception.id, owner);
        }
        for milestone in &record.milestones {
            self.by_milestone.insert(milestone.id, owner);
        }
    }

    fn unindex(&self, id: InstanceId) {
        self.by_step.retain(|_, owner| *owner != id);
        self.by_integration.retain(|_, owner| *owner != id);
        self.by_exception.retain(|_, owner| *owner != id);
        self.by_milestone.retain(|_, owner| *owner != id);
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn insert(&self, record: &InstanceRecord) -> Result<()> {
        {
            let mut records = self.records.write();
            if records.contains_key(&record.instance.id) {
                return Err(WorkflowError::Repository(format!(
                    "Instance already exists: {}",
                    record.instance.id
                )));
            }
            records.insert(record.instance.id, record.clone());
        }
        self.index(record);
        debug!(instance_id = %record.instance.id, "Instance inserted");
        Ok(())
    }

    async fn insert_exclusive(&self, record: &InstanceRecord) -> Result<()> {
        {
            let mut records = self.records.write();
            if records.contains_key(&record.instance.id) {
                return Err(WorkflowError::Repository(format!(
                    "Instance already exists: {}",
                    record.instance.id
                )));
            }
            if let Some(existing) = records.values().find(|r| {
                r.instance.employee_id == record.instance.employee_id
                    && r.instance.workflow_type == record.instance.workflow_type
                    && r.instance.is_open()
            }) {
                return Err(WorkflowError::ActiveInstanceExists {
                    workflow_type: existing.instance.workflow_type,
                    instance_id: existing.instance.id,
                });
            }
            records.insert(record.instance.id, record.clone());
        }
        self.index(record);
        debug!(instance_id = %record.instance.id, "Instance inserted");
        Ok(())
    }

    async fn load(&self, id: InstanceId) -> Result<Option<InstanceRecord>> {
        Ok(self.records.read().get(&id).cloned())
    }

    async fn save(&self, record: &InstanceRecord, expected_version: u64) -> Result<u64> {
        let new_version = {
            let mut records = self.records.write();
            let stored = records
                .get_mut(&record.instance.id)
                .ok_or_else(|| WorkflowError::NotFound(format!("instance {}", record.instance.id)))?;

            if stored.instance.version != expected_version {
                return Err(WorkflowError::ConcurrentModification {
                    instance_id: record.instance.id,
                    expected: expected_version,
                    found: stored.instance.version,
                });
            }

            let mut updated = record.clone();
            updated.instance.version = expected_version + 1;
            *stored = updated;
            expected_version + 1
        };
        self.index(record);
        Ok(new_version)
    }

    async fn delete(&self, id: InstanceId) -> Result<()> {
        if self.records.write().remove(&id).is_none() {
            return Err(WorkflowError::NotFound(format!("instance {}", id)));
        }
        self.unindex(id);
        Ok(())
    }

    async fn find_by_step(&self, id: StepInstanceId) -> Result<Option<InstanceId>> {
        Ok(self.by_step.get(&id).map(|e| *e.value()))
    }

    async fn find_by_integration(&self, id: IntegrationId) -> Result<Option<InstanceId>> {
        Ok(self.by_integration.get(&id).map(|e| *e.value()))
    }

    async fn find_by_exception(&self, id: ExceptionId) -> Result<Option<InstanceId>> {
        Ok(self.by_exception.get(&id).map(|e| *e.value()))
    }

    async fn find_by_milestone(&self, id: MilestoneId) -> Result<Option<InstanceId>> {
        Ok(self.by_milestone.get(&id).map(|e| *e.value()))
    }

    async fn list(&self, filter: &InstanceFilter) -> Result<Vec<InstanceRecord>> {
        let mut matching: Vec<InstanceRecord> = self
            .records
            .read()
            .values()
            .filter(|r| filter.matches(&r.instance))
            .cloned()
            .collect();

        matching.sort_by(|a, b| b.instance.created_at.cmp(&a.instance.created_at));

        Ok(matching
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        instantiate::{InstantiationRequest, Instantiator},
        template::TemplateLibrary,
    };
    use chrono::{NaiveDate, Utc};
    use onflow_core::EmployeeId;

    fn record() -> InstanceRecord {
        let template = TemplateLibrary::standard_onboarding();
        let request = InstantiationRequest::new(
            EmployeeId::new(),
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        );
        let inst = Instantiator::instantiate(&template, &request, Utc::now()).unwrap();
        InstanceRecord::new(inst.instance, inst.steps)
    }

    #[tokio::test]
    async fn test_compare_and_swap() {
        let repo = InMemoryWorkflowRepository::new();
        let rec = record();
        repo.insert(&rec).await.unwrap();

        let first = repo.load(rec.instance.id).await.unwrap().unwrap();
        let second = repo.load(rec.instance.id).await.unwrap().unwrap();

        assert_eq!(repo.save(&first, 0).await.unwrap(), 1);

        let conflict = repo.save(&second, second.instance.version).await;
        assert!(matches!(
            conflict,
            Err(WorkflowError::ConcurrentModification { expected: 0, found: 1, .. })
        ));
        assert!(conflict.unwrap_err().is_retryable());
    }

    #[tokio::test]
    async fn test_locators_and_cascade_delete() {
        let repo = InMemoryWorkflowRepository::new();
        let rec = record();
        let step_id = rec.steps[0].id;
        repo.insert(&rec).await.unwrap();

        assert_eq!(repo.find_by_step(step_id).await.unwrap(), Some(rec.instance.id));

        repo.delete(rec.instance.id).await.unwrap();
        assert!(repo.load(rec.instance.id).await.unwrap().is_none());
        assert!(repo.find_by_step(step_id).await.unwrap().is_none());
        assert!(repo.delete(rec.instance.id).await.is_err());
    }

    #[tokio::test]
    async fn test_exclusive_insert_rejects_second_open_instance() {
        let repo = InMemoryWorkflowRepository::new();
        let first = record();
        repo.insert_exclusive(&first).await.unwrap();

        let template = TemplateLibrary::standard_onboarding();
        let request = InstantiationRequest::new(
            first.instance.employee_id,
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        );
        let inst = Instantiator::instantiate(&template, &request, Utc::now()).unwrap();
        let second = InstanceRecord::new(inst.instance, inst.steps);

        let err = repo.insert_exclusive(&second).await.unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::ActiveInstanceExists { instance_id, .. } if instance_id == first.instance.id
        ));
        assert_eq!(repo.len(), 1);

        let mut done = repo.load(first.instance.id).await.unwrap().unwrap();
        done.instance.status = crate::instance::InstanceStatus::Completed;
        repo.save(&done, 0).await.unwrap();

        repo.insert_exclusive(&second).await.unwrap();
        assert_eq!(repo.len(), 2);
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let repo = InMemoryWorkflowRepository::new();
        let a = record();
        let b = record();
        repo.insert(&a).await.unwrap();
        repo.insert(&b).await.unwrap();

        let all = repo.list(&InstanceFilter::new()).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_a = repo
            .list(&InstanceFilter::new().employee(a.instance.employee_id))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 1);
        assert_eq!(only_a[0].instance.id, a.instance.id);

        let page = repo.list(&InstanceFilter::new().paginate(1, 1)).await.unwrap();
        assert_eq!(page.len(), 1);
    }
}

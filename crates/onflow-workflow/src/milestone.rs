//! Named checkpoints independent of steps

use crate::{
    ids::{InstanceId, MilestoneId},
    Result, WorkflowError,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Achieved,
    /// Target date passed without completion
    Missed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub id: MilestoneId,
    pub instance_id: InstanceId,
    pub name: String,
    pub description: Option<String>,
    pub target_date: NaiveDate,
    pub completed_date: Option<NaiveDate>,
    pub status: MilestoneStatus,
    /// Guards against dispatching the celebration notification twice
    pub celebration_sent: bool,
    pub created_at: DateTime<Utc>,
}

impl Milestone {
    pub fn new(
        instance_id: InstanceId,
        name: impl Into<String>,
        description: Option<String>,
        target_date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MilestoneId::new(),
            instance_id,
            name: name.into(),
            description,
            target_date,
            completed_date: None,
            status: MilestoneStatus::Pending,
            celebration_sent: false,
            created_at: now,
        }
    }

    pub fn is_achieved(&self) -> bool {
        self.status == MilestoneStatus::Achieved
    }

    /// Mark achieved; achieving twice is an error
    pub fn complete(&mut self, on: NaiveDate) -> Result<()> {
        if self.is_achieved() {
            return Err(WorkflowError::AlreadyCompleted(format!(
                "milestone '{}' achieved on {:?}",
                self.name, self.completed_date
            )));
        }
        self.completed_date = Some(on);
        self.status = MilestoneStatus::Achieved;
        Ok(())
    }

    /// Returns true exactly once, after the milestone is achieved
    pub fn claim_celebration(&mut self) -> Result<bool> {
        if !self.is_achieved() {
            return Err(WorkflowError::InvalidTransition(format!(
                "milestone '{}' is not achieved yet",
                self.name
            )));
        }
        if self.celebration_sent {
            return Ok(false);
        }
        self.celebration_sent = true;
        Ok(true)
    }

    /// Flag pending milestones whose target date has passed
    pub fn refresh(&mut self, today: NaiveDate) {
        match self.status {
            MilestoneStatus::Pending if self.target_date < today => {
                self.status = MilestoneStatus::Missed;
            }
            MilestoneStatus::Missed if self.target_date >= today => {
                self.status = MilestoneStatus::Pending;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    #[test]
    fn test_celebration_claimed_once() {
        let mut milestone =
            Milestone::new(InstanceId::new(), "First week complete", None, date(7), Utc::now());

        assert!(milestone.claim_celebration().is_err());

        milestone.complete(date(6)).unwrap();
        assert!(milestone.claim_celebration().unwrap());
        assert!(!milestone.claim_celebration().unwrap());
        assert!(milestone.complete(date(8)).is_err());
    }

    #[test]
    fn test_missed_milestone_can_still_be_achieved() {
        let mut milestone =
            Milestone::new(InstanceId::new(), "30 days", None, date(5), Utc::now());

        milestone.refresh(date(6));
        assert_eq!(milestone.status, MilestoneStatus::Missed);

        milestone.complete(date(9)).unwrap();
        milestone.refresh(date(10));
        assert_eq!(milestone.status, MilestoneStatus::Achieved);
    }
}

//! Progress aggregation and derived instance status
//!
//! Progress is `round(100 * done_required / total_required)` where a required
//! step counts as done once completed or skipped under a waiver. Optional
//! steps are reported separately and never move the percentage. A template
//! without required steps uses all steps as the denominator.

use crate::{
    exception::{ResolutionStatus, Severity},
    instance::{InstanceStatus, StepInstance, StepStatus, WorkflowInstance},
    integration::IntegrationStatus,
    repository::InstanceRecord,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Step counts and progress for one instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub overall_progress: u8,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub skipped_steps: usize,
    pub in_progress_steps: usize,
    /// Not yet completed or skipped
    pub pending_steps: usize,
    pub overdue_steps: usize,
    pub required_total: usize,
    pub required_done: usize,
    pub required_overdue: usize,
    pub optional_total: usize,
    pub optional_done: usize,
}

impl ProgressSummary {
    /// Every required step is completed or waived
    pub fn all_required_done(&self) -> bool {
        if self.required_total == 0 {
            self.pending_steps == 0
        } else {
            self.required_done == self.required_total
        }
    }
}

/// Recomputes progress and status from step state
pub struct ProgressAggregator;

impl ProgressAggregator {
    /// Count steps by status as of `today`
    pub fn summarize(steps: &[StepInstance], today: NaiveDate) -> ProgressSummary {
        let mut summary = ProgressSummary {
            total_steps: steps.len(),
            ..Default::default()
        };

        for step in steps {
            match step.status {
                StepStatus::Completed => summary.completed_steps += 1,
                StepStatus::Skipped => summary.skipped_steps += 1,
                StepStatus::InProgress => summary.in_progress_steps += 1,
                StepStatus::NotStarted => {}
            }

            let done = step.is_done();
            let overdue = step.is_overdue(today);

            if !done {
                summary.pending_steps += 1;
            }
            if overdue {
                summary.overdue_steps += 1;
            }

            if step.required {
                summary.required_total += 1;
                if done {
                    summary.required_done += 1;
                }
                if overdue {
                    summary.required_overdue += 1;
                }
            } else {
                summary.optional_total += 1;
                if done {
                    summary.optional_done += 1;
                }
            }
        }

        summary.overall_progress = if summary.required_total > 0 {
            percentage(summary.required_done, summary.required_total)
        } else {
            percentage(summary.total_steps - summary.pending_steps, summary.total_steps)
        };

        summary
    }

    /// Status implied by `summary`; a manual hold is never overridden
    pub fn derive_status(current: InstanceStatus, summary: &ProgressSummary) -> InstanceStatus {
        if current == InstanceStatus::OnHold {
            InstanceStatus::OnHold
        } else if summary.all_required_done() && summary.overall_progress == 100 {
            InstanceStatus::Completed
        } else if summary.required_overdue > 0 {
            InstanceStatus::Overdue
        } else {
            InstanceStatus::Active
        }
    }

    /// Write derived fields onto the instance
    pub fn apply(
        instance: &mut WorkflowInstance,
        steps: &[StepInstance],
        today: NaiveDate,
    ) -> ProgressSummary {
        let summary = Self::summarize(steps, today);
        let status = Self::derive_status(instance.status, &summary);

        instance.overall_progress = summary.overall_progress;

        if status == InstanceStatus::Completed {
            if instance.actual_completion_date.is_none() {
                instance.actual_completion_date = Some(today);
            }
        } else if !summary.all_required_done() {
            instance.actual_completion_date = None;
        }

        instance.status = status;
        summary
    }
}

/// Rounded percentage that reaches 100 only when `done == total`
fn percentage(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    if done >= total {
        return 100;
    }
    let rounded = (200 * done + total) / (2 * total);
    rounded.min(99) as u8
}

/// Aggregate view across many instances
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowStatistics {
    pub total_instances: usize,
    pub by_status: HashMap<InstanceStatus, usize>,
    pub average_progress: f64,
    pub overdue_steps: usize,
    pub open_exceptions_by_severity: HashMap<Severity, usize>,
    pub pending_integrations: usize,
    pub failed_integrations: usize,
}

impl WorkflowStatistics {
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a InstanceRecord>,
        today: NaiveDate,
    ) -> Self {
        let mut stats = WorkflowStatistics::default();
        let mut progress_sum: u64 = 0;

        for record in records {
            stats.total_instances += 1;
            *stats.by_status.entry(record.instance.status).or_default() += 1;
            progress_sum += u64::from(record.instance.overall_progress);

            stats.overdue_steps += record
                .steps
                .iter()
                .filter(|s| s.is_overdue(today))
                .count();

            for exception in &record.exceptions {
                if exception.resolution_status == ResolutionStatus::Open {
                    *stats
                        .open_exceptions_by_severity
                        .entry(exception.severity)
                        .or_default() += 1;
                }
            }

            for integration in &record.integrations {
                match integration.status {
                    IntegrationStatus::Pending | IntegrationStatus::InProgress => {
                        stats.pending_integrations += 1
                    }
                    IntegrationStatus::Failed => stats.failed_integrations += 1,
                    IntegrationStatus::Succeeded => {}
                }
            }
        }

        if stats.total_instances > 0 {
            stats.average_progress = progress_sum as f64 / stats.total_instances as f64;
        }

        stats
    }
}

//! Instantiation preview

use crate::commands::template::load_template;
use crate::output::{self, OutputFormat};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use colored::Colorize;
use onflow_core::{
    AppConfig, Clock, EmployeeId, Event, EventPublisher, InMemoryEventPublisher, SystemClock,
};
use onflow_observability::TracingEventPublisher;
use onflow_workflow::{
    InMemoryTemplateStore, InMemoryWorkflowRepository, InstanceRecord, InstanceStatusView,
    InstantiationRequest, WorkflowEngine,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tabled::{Table, Tabled};

#[derive(Serialize)]
struct Plan {
    record: InstanceRecord,
    status: InstanceStatusView,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<Event>,
}

pub async fn run(
    config: &AppConfig,
    file: &str,
    employee: Option<&str>,
    start_date: Option<&str>,
    show_events: bool,
    format: OutputFormat,
) -> Result<()> {
    let mut template = load_template(file)?;
    if !template.is_active() {
        tracing::warn!(template = %template.name, "Previewing a template that is not active");
        template = template.activate();
    }

    let employee_id = match employee {
        Some(raw) => raw
            .parse::<EmployeeId>()
            .with_context(|| format!("Invalid employee id '{}'", raw))?,
        None => EmployeeId::new(),
    };

    let clock = Arc::new(SystemClock);
    let start = match start_date {
        Some(raw) => NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .with_context(|| format!("Invalid start date '{}', expected YYYY-MM-DD", raw))?,
        None => clock.today(),
    };

    config.engine.validate()?;

    let recorder = Arc::new(InMemoryEventPublisher::new());
    let publisher: Arc<dyn EventPublisher> = if show_events {
        recorder.clone()
    } else {
        Arc::new(TracingEventPublisher::new())
    };
    let engine = WorkflowEngine::new(
        Arc::new(InMemoryWorkflowRepository::new()),
        Arc::new(InMemoryTemplateStore::new()),
        publisher,
        clock,
        config.engine.clone(),
    );

    let record = engine
        .instantiate(&template, InstantiationRequest::new(employee_id, start))
        .await?;
    let status = engine.get_status(record.instance.id).await?;

    let plan = Plan {
        record,
        status,
        events: recorder.events(),
    };

    if output::print_structured(&plan, format)? {
        return Ok(());
    }

    print_plan(&plan);
    Ok(())
}

#[derive(Tabled)]
struct ScheduleRow {
    #[tabled(rename = "#")]
    order: u32,
    #[tabled(rename = "Step")]
    name: String,
    #[tabled(rename = "Required")]
    required: &'static str,
    #[tabled(rename = "Due")]
    due: String,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Waits on")]
    waits_on: String,
    #[tabled(rename = "Ready")]
    ready: &'static str,
}

fn print_plan(plan: &Plan) {
    let instance = &plan.record.instance;
    let names: HashMap<_, _> = plan
        .record
        .steps
        .iter()
        .map(|s| (s.id, s.step_name.as_str()))
        .collect();

    output::key_value("Template", &instance.template_name);
    output::key_value("Employee", &instance.employee_id.to_string());
    output::key_value("Start date", &instance.start_date.to_string());
    output::key_value(
        "Expected completion",
        &instance.expected_completion_date.to_string(),
    );

    let rows: Vec<ScheduleRow> = plan
        .record
        .steps
        .iter()
        .map(|s| ScheduleRow {
            order: s.order_index,
            name: s.step_name.clone(),
            required: output::yes_no(s.required),
            due: s.due_date.to_string(),
            role: s.assigned_role.clone(),
            waits_on: s
                .depends_on
                .iter()
                .filter_map(|d| names.get(d).copied())
                .collect::<Vec<_>>()
                .join(", "),
            ready: output::yes_no(plan.status.ready_steps.contains(&s.id)),
        })
        .collect();

    output::section("Schedule");
    println!("{}", Table::new(rows));

    output::section("Integrations requested");
    if plan.record.integrations.is_empty() {
        output::dimmed("None");
    }
    for integration in &plan.record.integrations {
        let step = integration
            .step_id
            .and_then(|id| names.get(&id).copied())
            .unwrap_or("-");
        println!(
            "  {} for {} (up to {} attempts)",
            integration.integration_type.cyan(),
            step,
            integration.max_retries
        );
    }

    if !plan.events.is_empty() {
        output::section("Events");
        for event in &plan.events {
            println!("  {}", event.event_type);
        }
    }
}

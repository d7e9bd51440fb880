//! Template inspection commands

use crate::output::{self, OutputFormat};
use crate::TemplateCommands;
use anyhow::{Context, Result};
use colored::Colorize;
use onflow_workflow::{TemplateLibrary, WorkflowTemplate};
use serde::Serialize;
use std::path::Path;
use tabled::{Table, Tabled};

pub async fn run(cmd: TemplateCommands, format: OutputFormat) -> Result<()> {
    match cmd {
        TemplateCommands::Validate { file } => validate_template(&file, format),
        TemplateCommands::Show { file } => {
            let template = load_template(&file)?;
            show_template(&template, format)
        }
        TemplateCommands::Builtin { name } => {
            let template = match name.as_str() {
                "standard-offboarding" => TemplateLibrary::standard_offboarding(),
                _ => TemplateLibrary::standard_onboarding(),
            };
            show_template(&template, format)
        }
    }
}

/// Read a template from YAML or JSON, chosen by file extension
pub fn load_template(path: &str) -> Result<WorkflowTemplate> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read template file {}", path))?;

    let is_json = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));

    if is_json {
        serde_json::from_str(&content).with_context(|| format!("Invalid template JSON in {}", path))
    } else {
        serde_yaml::from_str(&content).with_context(|| format!("Invalid template YAML in {}", path))
    }
}

#[derive(Serialize)]
struct ValidationReport<'a> {
    valid: bool,
    name: &'a str,
    status: onflow_workflow::TemplateStatus,
    steps: usize,
    required_steps: usize,
    error: Option<String>,
}

fn validate_template(path: &str, format: OutputFormat) -> Result<()> {
    let template = load_template(path)?;
    let result = template.validate();

    let report = ValidationReport {
        valid: result.is_ok(),
        name: &template.name,
        status: template.status,
        steps: template.steps.len(),
        required_steps: template.steps.iter().filter(|s| s.required).count(),
        error: result.as_ref().err().map(|e| e.to_string()),
    };

    if !output::print_structured(&report, format)? {
        if report.valid {
            output::success(&format!(
                "Template '{}' is valid ({} steps, {} required)",
                report.name, report.steps, report.required_steps
            ));
            if !template.is_active() {
                output::warning("Template is not active and cannot be instantiated yet");
            }
        }
    }

    result.with_context(|| format!("Template {} failed validation", path))
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    order: u32,
    #[tabled(rename = "Step")]
    name: String,
    #[tabled(rename = "Type")]
    step_type: String,
    #[tabled(rename = "Required")]
    required: &'static str,
    #[tabled(rename = "Auto")]
    auto_trigger: &'static str,
    #[tabled(rename = "Due (days)")]
    due_offset: u32,
    #[tabled(rename = "Role")]
    role: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

fn show_template(template: &WorkflowTemplate, format: OutputFormat) -> Result<()> {
    if output::print_structured(template, format)? {
        return Ok(());
    }

    output::key_value("Name", &template.name);
    output::key_value("Type", template.workflow_type.as_str());
    output::key_value("Status", &format!("{:?}", template.status).to_lowercase());
    output::key_value("Version", &template.version.to_string());
    if !template.description.is_empty() {
        output::key_value("Description", &template.description);
    }
    if template.enforce_sequence {
        output::dimmed("Steps run in sequence: each waits for the previous required step");
    }

    let rows: Vec<StepRow> = template
        .ordered_steps()
        .into_iter()
        .map(|s| StepRow {
            order: s.order_index,
            name: s.name.clone(),
            step_type: s.step_type.to_string(),
            required: output::yes_no(s.required),
            auto_trigger: output::yes_no(s.auto_trigger),
            due_offset: s.due_offset_days,
            role: s.assigned_role.clone(),
            depends_on: s
                .depends_on
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", "),
        })
        .collect();

    output::section("Steps");
    println!("{}", Table::new(rows));

    if let Err(e) = template.validate() {
        println!();
        println!("{} {}", "Invalid:".red().bold(), e);
    }

    Ok(())
}

//! onflow CLI
//!
//! Validate workflow templates and preview the instance a template would
//! produce for a given employee and start date.

mod commands;
mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use onflow_core::AppConfig;
use onflow_observability::{init_tracing, TracingConfig};
use output::OutputFormat;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "onflow",
    version,
    about = "Onboarding workflow engine tooling",
    long_about = "Validate onboarding workflow templates and preview the step schedule,\n\
                  dependencies and integration requests an instance would start with."
)]
struct Cli {
    /// Configuration file (environment variables prefixed ONFLOW__ override it)
    #[arg(short, long, env = "ONFLOW_CONFIG")]
    config: Option<String>,

    /// Output format (text, json, yaml)
    #[arg(
        short,
        long,
        default_value = "text",
        value_parser = ["text", "json", "yaml"]
    )]
    format: String,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect workflow templates
    #[command(subcommand)]
    Template(TemplateCommands),

    /// Preview the instance a template produces
    Plan {
        /// Template file (YAML or JSON)
        file: String,

        /// Employee id (random when omitted)
        #[arg(short, long)]
        employee: Option<String>,

        /// First day, YYYY-MM-DD (today when omitted)
        #[arg(short, long)]
        start_date: Option<String>,

        /// Print the events the engine emitted
        #[arg(long)]
        events: bool,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Check a template file for structural errors
    Validate {
        /// Template file path
        file: String,
    },
    /// Show a template's steps
    Show {
        /// Template file path
        file: String,
    },
    /// Print a built-in template (standard-onboarding, standard-offboarding)
    Builtin {
        #[arg(value_parser = ["standard-onboarding", "standard-offboarding"])]
        name: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate the effective configuration
    Validate,
}

fn load_config(path: Option<&str>) -> anyhow::Result<AppConfig> {
    match path {
        Some(path) => AppConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        None => AppConfig::load().context("Failed to load configuration from environment"),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;

    let mut tracing_config = TracingConfig::from_logging(&config.logging);
    if cli.verbose {
        tracing_config = tracing_config.with_log_level("debug");
    }
    if cli.no_color {
        tracing_config.colored_output = false;
    }
    init_tracing(&tracing_config)?;

    let format: OutputFormat = cli.format.parse().map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Template(cmd) => commands::template::run(cmd, format).await,
        Commands::Plan {
            file,
            employee,
            start_date,
            events,
        } => {
            commands::plan::run(
                &config,
                &file,
                employee.as_deref(),
                start_date.as_deref(),
                events,
                format,
            )
            .await
        }
        Commands::Config(cmd) => commands::config::run(cmd, &config, format),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }
    let verbose = cli.verbose;

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            if verbose {
                for cause in e.chain().skip(1) {
                    eprintln!("{}: {}", "Caused by".yellow(), cause);
                }
            }
            ExitCode::FAILURE
        }
    }
}

//! Configuration commands

use crate::output::{self, OutputFormat};
use crate::ConfigCommands;
use anyhow::Result;
use colored::Colorize;
use onflow_core::AppConfig;

pub fn run(cmd: ConfigCommands, config: &AppConfig, format: OutputFormat) -> Result<()> {
    match cmd {
        ConfigCommands::Show => show_config(config, format),
        ConfigCommands::Validate => {
            config.validate()?;
            output::success("Configuration is valid");
            Ok(())
        }
    }
}

fn show_config(config: &AppConfig, format: OutputFormat) -> Result<()> {
    if output::print_structured(config, format)? {
        return Ok(());
    }

    let engine = &config.engine;
    output::section("Engine");
    println!("{}: {}", "default_max_retries".cyan(), engine.default_max_retries);
    let mut overrides: Vec<_> = engine.integration_max_retries.iter().collect();
    overrides.sort();
    for (kind, max) in overrides {
        println!("{}: {}", format!("integration_max_retries.{}", kind).cyan(), max);
    }
    println!(
        "{}: {}",
        "allow_concurrent_instances".cyan(),
        engine.allow_concurrent_instances
    );
    println!(
        "{}: {}",
        "require_explicit_start".cyan(),
        engine.require_explicit_start
    );
    println!("{}: {}", "system_actor".cyan(), engine.system_actor);

    output::section("Logging");
    println!("{}: {}", "level".cyan(), config.logging.level);
    println!("{}: {}", "json".cyan(), config.logging.json);

    Ok(())
}

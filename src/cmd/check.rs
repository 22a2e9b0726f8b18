//! Configuration validation command: `futureproof check-config`.

use std::path::Path;

use anyhow::{Context, Result};
use futureproof::config::{AppConfig, DEFAULT_CONFIG_FILE};

pub fn cmd_check_config(config: &AppConfig, explicit: Option<&Path>) -> Result<()> {
    println!();
    println!("FutureProof Configuration");
    println!("=========================");
    println!();

    let file = explicit.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
    if file.exists() {
        println!("Config file: {}", file.display());
    } else {
        println!("No config file found at {}; using defaults", file.display());
    }
    println!();

    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", rendered.trim_end());
    println!();
    println!(
        "llm.api_key: {}",
        if config.llm.api_key.is_some() { "set" } else { "not set" }
    );
    println!(
        "analysis.github_token: {}",
        if config.analysis.github_token.is_some() { "set" } else { "not set" }
    );
    println!();

    let warnings = config.warnings();
    if !warnings.is_empty() {
        println!("Warnings:");
        for warning in &warnings {
            println!("  - {}", warning);
        }
        println!();
    }

    config.validate()?;
    println!("Configuration is valid.");
    Ok(())
}

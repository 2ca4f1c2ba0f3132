//! `pluffy config`: print the effective settings or their warnings.

use std::path::Path;

use anyhow::{Context, Result};

use super::super::{ConfigCommands, Overrides};

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = super::load_config(config_path, Overrides::default())?;

    match command {
        None | Some(ConfigCommands::Show) => {
            if config_path.exists() {
                println!("# Config file: {}", config_path.display());
            } else {
                println!("# No config file at {}, using defaults", config_path.display());
            }
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }
    Ok(())
}

//! Configuration view and validation commands: `patchwork config`.

use anyhow::{Context, Result};

use super::super::ConfigCommands;
use super::Status;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<Status> {
    use patchwork::config::Config;
    use patchwork::init::state_dir;
    use patchwork::patchwork_config::{CONFIG_FILE, PatchworkToml};

    let state_dir = state_dir(project_dir);
    let config_path = state_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Patchwork Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No patchwork.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            // Effective values, after environment overrides.
            let config = Config::load(project_dir, false)?;
            let rendered = toml::to_string_pretty(&config.settings)
                .context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();
            if !config_path.exists() {
                println!("Run 'patchwork config init' to create a patchwork.toml file.");
                println!();
            }
            Ok(Status::Ok)
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No patchwork.toml found. Using defaults (valid).");
                return Ok(Status::Ok);
            }

            let toml = PatchworkToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
            Ok(Status::from_clean(warnings.is_empty()))
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("patchwork.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(Status::Ok);
            }

            std::fs::create_dir_all(&state_dir)
                .with_context(|| format!("Failed to create {}", state_dir.display()))?;
            PatchworkToml::default().save(&config_path)?;

            println!("Created patchwork.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [sequencer] max_retries, executor, dispatch_timeout_secs");
            println!("  - [[repair.families]] and [[repair.safe_transforms]]");
            println!("  - [integrity] tracked files, [[fleet.services]] allowlist");
            println!("  - [sla] thresholds and [hygiene] removal bounds");
            println!();
            Ok(Status::Ok)
        }
    }
}

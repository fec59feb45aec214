use crate::output::print_json;
use clap::Subcommand;
use stagewalk_core::config::WarnLevel;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the config for common mistakes
    Validate,

    /// Print the effective config after the base-profile merge
    Show,

    /// Print one field, e.g. `prefix` or `steps.net.modules.vpc.version`
    Get { path: String },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate => validate(root, json),
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Get { path } => get(root, &path, json),
    }
}

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_project(root)?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_project(root)?;
    if json {
        return print_json(&config);
    }
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn get(root: &Path, path: &str, json: bool) -> anyhow::Result<()> {
    let config = super::load_project(root)?;
    let Some(value) = config.field(path) else {
        anyhow::bail!("unknown config field '{path}'");
    };
    if json {
        return print_json(&serde_json::json!({ "path": path, "value": value }));
    }
    println!("{value}");
    Ok(())
}

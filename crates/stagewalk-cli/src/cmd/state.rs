use crate::output::{print_json, print_table};
use anyhow::Context;
use stagewalk_core::state::State;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let state = State::load(root).context("failed to load state")?;

    if json {
        return print_json(&state);
    }
    if state.steps.is_empty() {
        println!("No steps recorded yet.");
        return Ok(());
    }

    if let Some(v) = &state.base_config_version {
        println!("config version: {v}\n");
    }
    let rows = state
        .steps
        .iter()
        .flat_map(|step| {
            let applied_at = step
                .applied_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            step.modules.iter().map(move |m| {
                vec![
                    step.key().to_string(),
                    m.name.clone(),
                    m.version.clone(),
                    m.applied_version.clone().unwrap_or_else(|| "-".to_string()),
                    applied_at.clone(),
                ]
            })
        })
        .collect();
    print_table(&["STEP", "MODULE", "TARGET", "APPLIED", "APPLIED AT"], rows);
    Ok(())
}

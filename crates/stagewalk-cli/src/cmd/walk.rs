use crate::output::{print_json, print_table};
use anyhow::Context;
use serde::Serialize;
use stagewalk_core::resolver;
use stagewalk_core::state::State;
use std::path::Path;

#[derive(Serialize)]
struct SourceWalk {
    url: String,
    releases: Vec<String>,
}

#[derive(Serialize)]
struct WalkOutput {
    oldest: String,
    newest: String,
    len: usize,
    sources: Vec<SourceWalk>,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = super::load_project(root)?;
    super::ensure_valid(&config)?;
    let state = State::load(root).context("failed to load state")?;
    let mut registry = super::load_registry(root, &config)?;

    let walk = resolver::plan_walk(&config, &state, &mut registry).context("failed to plan walk")?;
    let sources: Vec<SourceWalk> = registry
        .iter()
        .map(|s| SourceWalk {
            url: s.url.clone(),
            releases: s.walk().iter().map(|r| r.tag.clone()).collect(),
        })
        .collect();

    if json {
        return print_json(&WalkOutput {
            oldest: walk.oldest,
            newest: walk.newest,
            len: walk.len,
            sources,
        });
    }

    println!(
        "walk {} -> {} ({} release{})\n",
        walk.oldest,
        walk.newest,
        walk.len,
        if walk.len == 1 { "" } else { "s" }
    );
    let rows = sources
        .into_iter()
        .map(|s| vec![s.url, s.releases.join(" ")])
        .collect();
    print_table(&["SOURCE", "RELEASES"], rows);
    Ok(())
}

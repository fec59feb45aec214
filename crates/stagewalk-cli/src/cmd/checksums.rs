use crate::output::print_json;
use anyhow::Context;
use stagewalk_core::source::Manifest;
use std::collections::BTreeMap;
use std::path::Path;

pub fn run(dir: &Path, json: bool) -> anyhow::Result<()> {
    let manifest = Manifest::compute(dir)
        .with_context(|| format!("failed to checksum {}", dir.display()))?;

    if json {
        let map: BTreeMap<&str, &str> = manifest.iter().collect();
        return print_json(&map);
    }
    if manifest.is_empty() {
        eprintln!("no modules/ or providers/ paths under {}", dir.display());
    }
    print!("{}", manifest.render());
    Ok(())
}

use regex::Regex;
use stagewalk_core::approval::ChangeCounts;
use std::sync::OnceLock;

static PLAN_RE: OnceLock<Regex> = OnceLock::new();

fn plan_re() -> &'static Regex {
    PLAN_RE.get_or_init(|| {
        Regex::new(r"Plan: (\d+) to add, (\d+) to change, (\d+) to destroy").unwrap()
    })
}

/// Change counts from a plan command's output.
///
/// Terraform's summary line is used when present. `No changes.` and empty
/// output (a clean `kubectl diff`) mean nothing to do. Anything else is
/// counted as one change so it passes through the approval gate.
pub fn parse_plan(output: &str) -> ChangeCounts {
    if let Some(caps) = plan_re().captures(output) {
        let n = |i: usize| caps[i].parse::<u32>().unwrap_or(u32::MAX);
        return ChangeCounts {
            added: n(1),
            changed: n(2),
            destroyed: n(3),
        };
    }
    if output.trim().is_empty() || output.contains("No changes.") {
        return ChangeCounts::default();
    }
    ChangeCounts {
        added: 0,
        changed: 1,
        destroyed: 0,
    }
}

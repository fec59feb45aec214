//! Base-profile overlay.
//!
//! `merge_config(base, overlay)` produces the effective config when a
//! project config (`overlay`) builds on a shared base profile. Rules, per
//! entity:
//!
//! * Config: `prefix`, `agent_version`, `base_image_version` take the
//!   overlay value when non-empty; `version` when the overlay pins a
//!   concrete version; `sources` is replaced when the overlay lists any;
//!   `pipeline` is the overlay's unless it is all defaults.
//! * Step (matched by name and workspace): `type` when the overlay's is not
//!   the default; `approve`, `vpc`, `kubernetes` when set; `files` replaced
//!   when non-empty; `provider` merged key by key.
//! * Module (matched by name): `source` and `version` when non-empty;
//!   `inputs` merged key by key; `client` if either side sets it.
//!
//! Unmatched overlay steps and modules are appended in overlay order.

use crate::config::{Config, Module, PipelineConfig, Step, StepType};
use crate::release;
use serde_yaml::Mapping;

pub fn merge_config(base: Config, overlay: Config) -> Config {
    let mut out = base;

    take_non_empty(&mut out.prefix, overlay.prefix);
    if !release::is_stable(&overlay.version) {
        out.version = overlay.version;
    }
    take_non_empty(&mut out.agent_version, overlay.agent_version);
    take_non_empty(&mut out.base_image_version, overlay.base_image_version);
    if overlay.base_profile.is_some() {
        out.base_profile = overlay.base_profile;
    }
    if !overlay.sources.is_empty() {
        out.sources = overlay.sources;
    }
    if overlay.pipeline != PipelineConfig::default() {
        out.pipeline = overlay.pipeline;
    }

    for step in overlay.steps {
        match out.steps.iter_mut().find(|s| s.key() == step.key()) {
            Some(existing) => merge_step(existing, step),
            None => out.steps.push(step),
        }
    }
    out
}

pub fn merge_step(base: &mut Step, overlay: Step) {
    if overlay.step_type != StepType::default() {
        base.step_type = overlay.step_type;
    }
    if overlay.approve.is_some() {
        base.approve = overlay.approve;
    }
    if overlay.vpc.is_some() {
        base.vpc = overlay.vpc;
    }
    if overlay.kubernetes.is_some() {
        base.kubernetes = overlay.kubernetes;
    }
    if !overlay.files.is_empty() {
        base.files = overlay.files;
    }
    merge_mapping(&mut base.provider, overlay.provider);

    for module in overlay.modules {
        match base.modules.iter_mut().find(|m| m.name == module.name) {
            Some(existing) => merge_module(existing, module),
            None => base.modules.push(module),
        }
    }
}

pub fn merge_module(base: &mut Module, overlay: Module) {
    take_non_empty(&mut base.source, overlay.source);
    take_non_empty(&mut base.version, overlay.version);
    merge_mapping(&mut base.inputs, overlay.inputs);
    base.client |= overlay.client;
}

fn take_non_empty(target: &mut String, value: String) {
    if !value.trim().is_empty() {
        *target = value;
    }
}

fn merge_mapping(base: &mut Mapping, overlay: Mapping) {
    for (k, v) in overlay {
        base.insert(k, v);
    }
}

use super::tag::{tag_re, Addressing, Candidate, Lookup, Tag, TagKind};
use crate::config::{Config, Module, Step};
use crate::error::{Result, RolloutError};
use crate::outputs::OutputCache;
use crate::params::ParameterStore;
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha256};
use tracing::{error, trace};

/// Values computed by the rollout itself, resolved in the deferred pass.
pub trait AgentValues {
    /// Target version of `module` in `step` at the current release.
    fn module_version(&self, step: &str, module: &str) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Everything except escaped and deferred tags.
    Immediate,
    /// Deferred tags, then escaped tags are unwrapped.
    Deferred,
}

/// The module whose input document is being rendered.
#[derive(Debug, Clone, Copy)]
pub struct ModuleScope<'a> {
    pub step: &'a Step,
    pub module: &'a Module,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    /// Text after the immediate pass.
    pub intermediate: String,
    /// SHA-256 of `intermediate`.
    pub checksum: String,
    pub content: String,
}

/// A parsed document rendered value by value.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedValue {
    /// The immediate-pass document, serialized.
    pub intermediate: String,
    pub checksum: String,
    pub value: Value,
}

pub struct TemplateContext<'a> {
    pub config: &'a Config,
    pub prefix: &'a str,
    pub account_id: &'a str,
    pub params: &'a dyn ParameterStore,
    pub outputs: &'a OutputCache,
    pub agent: Option<&'a dyn AgentValues>,
}

impl<'a> TemplateContext<'a> {
    /// Run both passes. The checksum is taken between them so deferred
    /// values never affect change detection.
    pub fn render(&self, text: &str, scope: Option<&ModuleScope<'_>>) -> Result<Rendered> {
        let intermediate = self.substitute(text, Phase::Immediate, scope)?;
        let checksum = checksum(&intermediate);
        let content = self.substitute(&intermediate, Phase::Deferred, scope)?;
        Ok(Rendered {
            intermediate,
            checksum,
            content,
        })
    }

    /// Render and re-parse according to the file's extension.
    pub fn render_file(
        &self,
        file_name: &str,
        text: &str,
        scope: Option<&ModuleScope<'_>>,
    ) -> Result<Rendered> {
        let rendered = self.render(text, scope)?;
        validate(file_name, &rendered.content)?;
        Ok(rendered)
    }

    /// Both passes over every string scalar and mapping key of `value`.
    /// Substituted strings stay strings, so no quoting can break.
    pub fn render_value(
        &self,
        value: &Value,
        scope: Option<&ModuleScope<'_>>,
    ) -> Result<RenderedValue> {
        let intermediate = self.substitute_value(value, Phase::Immediate, scope)?;
        let text = serde_yaml::to_string(&intermediate)?;
        Ok(RenderedValue {
            checksum: checksum(&text),
            value: self.substitute_value(&intermediate, Phase::Deferred, scope)?,
            intermediate: text,
        })
    }

    fn substitute_value(
        &self,
        value: &Value,
        phase: Phase,
        scope: Option<&ModuleScope<'_>>,
    ) -> Result<Value> {
        Ok(match value {
            Value::String(s) => Value::String(self.substitute(s, phase, scope)?),
            Value::Sequence(items) => Value::Sequence(
                items
                    .iter()
                    .map(|v| self.substitute_value(v, phase, scope))
                    .collect::<Result<_>>()?,
            ),
            Value::Mapping(map) => {
                let mut out = Mapping::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(
                        self.substitute_value(k, phase, scope)?,
                        self.substitute_value(v, phase, scope)?,
                    );
                }
                Value::Mapping(out)
            }
            Value::Tagged(tagged) => Value::Tagged(Box::new(TaggedValue {
                tag: tagged.tag.clone(),
                value: self.substitute_value(&tagged.value, phase, scope)?,
            })),
            other => other.clone(),
        })
    }

    pub fn substitute(
        &self,
        text: &str,
        phase: Phase,
        scope: Option<&ModuleScope<'_>>,
    ) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        for caps in tag_re().captures_iter(text) {
            let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            out.push_str(&text[last..whole.start()]);
            last = whole.end();

            let tag = Tag::parse(body.as_str())?;
            let replacement = match (&tag, phase) {
                (Tag::Escaped(inner), Phase::Deferred) => Some(inner.clone()),
                (Tag::Escaped(_), Phase::Immediate) => None,
                (Tag::Chain(chain), Phase::Immediate) if !tag.is_deferred() => {
                    Some(self.resolve_chain(chain, scope)?)
                }
                (Tag::Chain(chain), Phase::Deferred) if tag.is_deferred() => {
                    Some(self.resolve_chain(chain, scope)?)
                }
                _ => None,
            };
            match replacement {
                Some(value) => {
                    trace!(tag = %body.as_str().trim(), "tag resolved");
                    out.push_str(&value);
                }
                None => out.push_str(whole.as_str()),
            }
        }
        out.push_str(&text[last..]);
        Ok(out)
    }

    /// First non-empty candidate wins. A not-found candidate falls through;
    /// if nothing resolves, the first not-found error propagates.
    fn resolve_chain(&self, chain: &[Candidate], scope: Option<&ModuleScope<'_>>) -> Result<String> {
        let mut not_found = None;
        for candidate in chain {
            match candidate {
                Candidate::Literal(value) => return Ok(value.clone()),
                Candidate::Lookup(lookup) => match self.resolve(lookup, scope) {
                    Ok(Some(value)) if !value.is_empty() => return Ok(value),
                    Ok(_) => {}
                    Err(e) if e.is_parameter_not_found() => {
                        not_found.get_or_insert(e);
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        match not_found {
            Some(e) => Err(e),
            None => Ok(String::new()),
        }
    }

    fn resolve(&self, lookup: &Lookup, scope: Option<&ModuleScope<'_>>) -> Result<Option<String>> {
        let path: Vec<&str> = lookup.path.iter().map(String::as_str).collect();
        let malformed = || RolloutError::MalformedTag(lookup.raw.clone());

        let value = match lookup.kind {
            TagKind::Output {
                addressing,
                optional,
            } => {
                let found = match addressing {
                    Addressing::Step => match path.as_slice() {
                        [step, module, key @ ..] if !key.is_empty() => {
                            self.step_output(step, module, &key.join("."))
                        }
                        _ => return Err(malformed()),
                    },
                    Addressing::Custom => self.parameter(&lookup.path.join(".")),
                    Addressing::Typed => match path.as_slice() {
                        [module_type, key @ ..] if !key.is_empty() => {
                            let (step, module) = self.typed(module_type)?;
                            self.step_output(&step.name, &module.name, &key.join("."))
                        }
                        _ => return Err(malformed()),
                    },
                };
                match found {
                    Ok(v) => v,
                    Err(e) if optional && e.is_parameter_not_found() => return Ok(None),
                    Err(e) => return Err(e),
                }
            }
            TagKind::Config => {
                let field = lookup.path.join(".");
                if field == "prefix" {
                    self.prefix.to_string()
                } else {
                    self.config
                        .field(&field)
                        .ok_or(RolloutError::UnknownConfigField(field))?
                }
            }
            TagKind::Agent => match path.as_slice() {
                ["accountId"] | ["account_id"] => self.account_id.to_string(),
                ["version", step, module] => match self.agent {
                    Some(agent) => agent.module_version(step, module)?,
                    None => {
                        return Err(RolloutError::InvalidConfig(format!(
                            "'{}' needs rollout context",
                            lookup.raw
                        )))
                    }
                },
                _ => return Err(malformed()),
            },
            TagKind::Module => {
                let scope =
                    scope.ok_or_else(|| RolloutError::ModuleTagOutsideModule(lookup.raw.clone()))?;
                match path.as_slice() {
                    ["name"] => scope.module.name.clone(),
                    ["source"] => scope.module.source.clone(),
                    ["version"] => scope.module.version.clone(),
                    ["type"] => scope.module.module_type(),
                    ["step"] => scope.step.name.clone(),
                    _ => return Err(malformed()),
                }
            }
            TagKind::TypedModule => match path.as_slice() {
                [module_type] => self.typed(module_type)?.1.name.clone(),
                _ => return Err(malformed()),
            },
            TagKind::TypedStepModule => match path.as_slice() {
                [module_type] => self.typed(module_type)?.0.name.clone(),
                _ => return Err(malformed()),
            },
        };

        match lookup.index {
            Some(index) => index.apply(&lookup.raw, &value).map(Some),
            None => Ok(Some(value)),
        }
    }

    /// Cached Terraform output, else the parameter `<prefix>-<step>-<module>/<key>`.
    fn step_output(&self, step: &str, module: &str, key: &str) -> Result<String> {
        if let Some(value) = self.outputs.lookup(step, module, key) {
            return Ok(value);
        }
        let name = if self.prefix.is_empty() {
            format!("{step}-{module}/{key}")
        } else {
            format!("{}-{step}-{module}/{key}", self.prefix)
        };
        self.parameter(&name)
    }

    fn parameter(&self, name: &str) -> Result<String> {
        Ok(self.params.get(name)?.value)
    }

    fn typed(&self, module_type: &str) -> Result<(&'a Step, &'a Module)> {
        let matches = self.config.modules_of_type(module_type);
        match matches.as_slice() {
            [only] => Ok(*only),
            _ => Err(RolloutError::AmbiguousModuleType {
                module_type: module_type.to_string(),
                matches: matches.len(),
            }),
        }
    }
}

pub fn checksum(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Re-parse substituted content: YAML for `.yaml`/`.yml`, HCL for
/// `.tf`/`.hcl`, JSON for `.json`. Other files pass through.
pub fn validate(file_name: &str, content: &str) -> Result<()> {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    let outcome = match ext.as_str() {
        "yaml" | "yml" => serde_yaml::from_str::<serde_yaml::Value>(content)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        "tf" | "hcl" => hcl::parse(content).map(|_| ()).map_err(|e| e.to_string()),
        "json" => serde_json::from_str::<serde_json::Value>(content)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        _ => Ok(()),
    };
    outcome.map_err(|reason| {
        error!(file = %file_name, %reason, content = %content, "substituted content does not parse");
        RolloutError::TemplateValidation {
            file: file_name.to_string(),
            reason,
        }
    })
}

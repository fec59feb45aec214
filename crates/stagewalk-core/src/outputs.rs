use serde_json::Value;
use std::collections::HashMap;

/// Prior Terraform outputs per step name, as printed by
/// `terraform output -json`: `{"<module>__<key>": {"value": ...}}`.
#[derive(Debug, Clone, Default)]
pub struct OutputCache {
    steps: HashMap<String, Value>,
}

impl OutputCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, step: impl Into<String>, outputs: Value) {
        self.steps.insert(step.into(), outputs);
    }

    /// Value of `<module>__<key>` in the step's outputs. Lists are
    /// comma-joined; `null` and missing keys are `None`.
    pub fn lookup(&self, step: &str, module: &str, key: &str) -> Option<String> {
        let outputs = self.steps.get(step)?;
        let entry = outputs.get(format!("{module}__{key}"))?;
        let value = match entry {
            Value::Object(map) if map.contains_key("value") => &map["value"],
            other => other,
        };
        render(value)
    }
}

fn render(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(render)
                .collect::<Vec<_>>()
                .join(","),
        ),
        Value::Object(_) => Some(value.to_string()),
    }
}

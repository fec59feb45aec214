use crate::error::{Result, RolloutError};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    String,
    /// Comma-joined list.
    StringList,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub value: String,
    pub kind: ParameterKind,
}

impl Parameter {
    pub fn string(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: ParameterKind::String,
        }
    }

    pub fn list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined: Vec<String> = values.into_iter().map(|v| v.as_ref().to_string()).collect();
        Self {
            value: joined.join(","),
            kind: ParameterKind::StringList,
        }
    }
}

/// Remote parameter lookup. A missing name fails with
/// [`RolloutError::ParameterNotFound`].
pub trait ParameterStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Parameter>;
}

// ---------------------------------------------------------------------------
// FileParameterStore
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum RawParameter {
    List(Vec<String>),
    Scalar(serde_yaml::Value),
}

/// `parameters.yaml`: a map of name to string or list of strings. The file
/// is re-read on every lookup so values published mid-run are visible.
#[derive(Debug, Clone)]
pub struct FileParameterStore {
    path: PathBuf,
}

impl FileParameterStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ParameterStore for FileParameterStore {
    fn get(&self, name: &str) -> Result<Parameter> {
        let Some(data) = crate::io::read_optional(&self.path)? else {
            return Err(RolloutError::ParameterNotFound(name.to_string()));
        };
        let map: HashMap<String, RawParameter> = if data.trim().is_empty() {
            HashMap::new()
        } else {
            serde_yaml::from_str(&data).map_err(|e| {
                RolloutError::ParameterStore(format!("{}: {e}", self.path.display()))
            })?
        };
        match map.get(name) {
            Some(RawParameter::List(items)) => Ok(Parameter::list(items)),
            Some(RawParameter::Scalar(serde_yaml::Value::String(s))) => Ok(Parameter::string(s)),
            Some(RawParameter::Scalar(serde_yaml::Value::Number(n))) => {
                Ok(Parameter::string(n.to_string()))
            }
            Some(RawParameter::Scalar(serde_yaml::Value::Bool(b))) => {
                Ok(Parameter::string(b.to_string()))
            }
            Some(RawParameter::Scalar(serde_yaml::Value::Null)) | None => {
                Err(RolloutError::ParameterNotFound(name.to_string()))
            }
            Some(RawParameter::Scalar(_)) => Err(RolloutError::ParameterStore(format!(
                "parameter '{name}' is not a string or list"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryParameterStore
// ---------------------------------------------------------------------------

/// In-memory store that counts lookups.
#[derive(Debug, Default)]
pub struct MemoryParameterStore {
    values: RwLock<HashMap<String, Parameter>>,
    lookups: AtomicUsize,
}

impl MemoryParameterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, parameter: Parameter) {
        if let Ok(mut values) = self.values.write() {
            values.insert(name.into(), parameter);
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl ParameterStore for MemoryParameterStore {
    fn get(&self, name: &str) -> Result<Parameter> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let values = self
            .values
            .read()
            .map_err(|_| RolloutError::ParameterStore("store lock poisoned".to_string()))?;
        values
            .get(name)
            .cloned()
            .ok_or_else(|| RolloutError::ParameterNotFound(name.to_string()))
    }
}

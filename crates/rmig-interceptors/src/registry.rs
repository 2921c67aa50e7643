use crate::builtins::{
    DateFormatInterceptor, DefaultVariableInterceptor, FileVariableValidator, DEFAULT_DATE_FORMAT,
};
use crate::{InterceptorPipeline, VariableInterceptor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::info;

pub type PropertyBag = Map<String, Value>;
pub type InterceptorFactory =
    fn(&PropertyBag) -> Result<Box<dyn VariableInterceptor>, RegistryError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown interceptor id: {0}")]
    UnknownInterceptor(String),
    #[error("interceptor {0} is configured more than once")]
    DuplicateEntry(String),
    #[error("invalid properties for interceptor {id}: {message}")]
    InvalidProperties { id: String, message: String },
}

/// One `[[interceptors]]` entry of the configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InterceptorSettings {
    pub id: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub properties: PropertyBag,
}

fn enabled_by_default() -> bool {
    true
}

impl InterceptorSettings {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            properties: PropertyBag::new(),
        }
    }

    pub fn disabled(id: impl Into<String>) -> Self {
        Self {
            enabled: false,
            ..Self::new(id)
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }
}

/// Maps stable ids to interceptor factories.
#[derive(Default)]
pub struct InterceptorRegistry {
    factories: BTreeMap<String, InterceptorFactory>,
    enabled_by_default: Vec<String>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_default("default", build_default);
        registry.register_default("file-validator", build_file_validator);
        registry.register_default("date-format", build_date_format);
        registry
    }

    /// Register an interceptor that only runs when configured.
    pub fn register(&mut self, id: impl Into<String>, factory: InterceptorFactory) {
        self.factories.insert(id.into(), factory);
    }

    /// Register an interceptor that runs unless configured with `enabled = false`.
    pub fn register_default(&mut self, id: impl Into<String>, factory: InterceptorFactory) {
        let id = id.into();
        if !self.enabled_by_default.contains(&id) {
            self.enabled_by_default.push(id.clone());
        }
        self.factories.insert(id, factory);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.factories.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn build(
        &self,
        settings: &[InterceptorSettings],
    ) -> Result<InterceptorPipeline, RegistryError> {
        let mut configured = BTreeSet::new();
        for entry in settings {
            if !self.contains(&entry.id) {
                return Err(RegistryError::UnknownInterceptor(entry.id.clone()));
            }
            if !configured.insert(entry.id.as_str()) {
                return Err(RegistryError::DuplicateEntry(entry.id.clone()));
            }
        }

        let empty = PropertyBag::new();
        let mut selected: Vec<(&str, &PropertyBag)> = self
            .enabled_by_default
            .iter()
            .filter(|id| !configured.contains(id.as_str()))
            .map(|id| (id.as_str(), &empty))
            .collect();
        selected.extend(
            settings
                .iter()
                .filter(|entry| entry.enabled)
                .map(|entry| (entry.id.as_str(), &entry.properties)),
        );

        let mut pipeline = InterceptorPipeline::new();
        for (id, properties) in selected {
            let factory = self
                .factories
                .get(id)
                .ok_or_else(|| RegistryError::UnknownInterceptor(id.to_string()))?;
            pipeline.push(factory(properties)?);
        }
        info!(interceptors = ?pipeline.names(), "variable interceptors ready");
        Ok(pipeline)
    }
}

/// Bind a property bag onto a typed settings struct.
pub fn bind_properties<T: DeserializeOwned>(
    id: &str,
    properties: &PropertyBag,
) -> Result<T, RegistryError> {
    serde_json::from_value(Value::Object(properties.clone())).map_err(|err| {
        RegistryError::InvalidProperties {
            id: id.to_string(),
            message: err.to_string(),
        }
    })
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct NoProperties {}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DateFormatProperties {
    #[serde(default)]
    format: Option<String>,
}

fn build_default(properties: &PropertyBag) -> Result<Box<dyn VariableInterceptor>, RegistryError> {
    bind_properties::<NoProperties>("default", properties)?;
    Ok(Box::new(DefaultVariableInterceptor))
}

fn build_file_validator(
    properties: &PropertyBag,
) -> Result<Box<dyn VariableInterceptor>, RegistryError> {
    bind_properties::<NoProperties>("file-validator", properties)?;
    Ok(Box::new(FileVariableValidator))
}

fn build_date_format(
    properties: &PropertyBag,
) -> Result<Box<dyn VariableInterceptor>, RegistryError> {
    let bound: DateFormatProperties = bind_properties("date-format", properties)?;
    let format = bound
        .format
        .unwrap_or_else(|| DEFAULT_DATE_FORMAT.to_string());
    let interceptor =
        DateFormatInterceptor::new(format).map_err(|err| RegistryError::InvalidProperties {
            id: "date-format".to_string(),
            message: err.message,
        })?;
    Ok(Box::new(interceptor))
}

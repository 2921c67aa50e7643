pub mod builtins;
pub mod registry;

use rmig_core::{SourceVariable, VariableKind, VariableMap};
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::debug;

pub use builtins::{DateFormatInterceptor, DefaultVariableInterceptor, FileVariableValidator};
pub use registry::{
    InterceptorFactory, InterceptorRegistry, InterceptorSettings, PropertyBag, RegistryError,
};

/// Failure raised by a single interceptor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct InterceptorError {
    pub message: String,
}

impl InterceptorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure of the pipeline for one variable. Its display text is the skip reason recorded
/// for the owning process instance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "An error occurred during variable transformation. Interceptor [{interceptor}] failed for variable [{variable}]: {message}"
)]
pub struct PipelineError {
    pub interceptor: String,
    pub variable: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptorScope {
    Universal,
    Kinds(BTreeSet<VariableKind>),
}

impl InterceptorScope {
    pub fn only(kinds: impl IntoIterator<Item = VariableKind>) -> Self {
        Self::Kinds(kinds.into_iter().collect())
    }

    pub fn applies_to(&self, kind: VariableKind) -> bool {
        match self {
            Self::Universal => true,
            Self::Kinds(kinds) => kinds.contains(&kind),
        }
    }
}

/// One variable travelling through the pipeline: the untouched source variable plus the
/// value that will be handed to the target engine.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableInvocation {
    source: SourceVariable,
    value: Value,
}

impl VariableInvocation {
    pub fn new(source: SourceVariable) -> Self {
        let value = source.value.clone();
        Self { source, value }
    }

    pub fn source(&self) -> &SourceVariable {
        &self.source
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn kind(&self) -> VariableKind {
        self.source.kind
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn set_value(&mut self, value: Value) {
        self.value = value;
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

pub trait VariableInterceptor {
    fn name(&self) -> &str;

    /// Lower runs first.
    fn priority(&self) -> i32 {
        0
    }

    fn scope(&self) -> InterceptorScope {
        InterceptorScope::Universal
    }

    fn execute(&self, invocation: &mut VariableInvocation) -> Result<(), InterceptorError>;
}

struct Registered {
    interceptor: Box<dyn VariableInterceptor>,
    scope: InterceptorScope,
}

/// Interceptors in ascending priority; equal priorities keep insertion order.
#[derive(Default)]
pub struct InterceptorPipeline {
    interceptors: Vec<Registered>,
}

impl InterceptorPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, interceptor: Box<dyn VariableInterceptor>) -> Self {
        self.push(interceptor);
        self
    }

    pub fn push(&mut self, interceptor: Box<dyn VariableInterceptor>) {
        let scope = interceptor.scope();
        self.interceptors.push(Registered { interceptor, scope });
        self.interceptors
            .sort_by_key(|registered| registered.interceptor.priority());
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.interceptors
            .iter()
            .map(|registered| registered.interceptor.name())
            .collect()
    }

    pub fn transform_variable(&self, variable: SourceVariable) -> Result<Value, PipelineError> {
        let kind = variable.kind;
        let mut invocation = VariableInvocation::new(variable);

        for registered in self
            .interceptors
            .iter()
            .filter(|registered| registered.scope.applies_to(kind))
        {
            let interceptor = registered.interceptor.as_ref();
            debug!(
                interceptor = interceptor.name(),
                variable = invocation.name(),
                kind = %kind,
                "running variable interceptor"
            );
            interceptor
                .execute(&mut invocation)
                .map_err(|err| PipelineError {
                    interceptor: interceptor.name().to_string(),
                    variable: invocation.name().to_string(),
                    message: err.message,
                })?;
        }

        Ok(invocation.into_value())
    }

    /// Transform all variables of one scope. The first failure aborts the scope.
    pub fn transform(
        &self,
        variables: impl IntoIterator<Item = SourceVariable>,
    ) -> Result<VariableMap, PipelineError> {
        let mut out = VariableMap::new();
        for variable in variables {
            let name = variable.name.clone();
            let value = self.transform_variable(variable)?;
            out.insert(name, value);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recording {
        name: &'static str,
        priority: i32,
        scope: InterceptorScope,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl VariableInterceptor for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn scope(&self) -> InterceptorScope {
            self.scope.clone()
        }

        fn execute(&self, invocation: &mut VariableInvocation) -> Result<(), InterceptorError> {
            self.log.borrow_mut().push(self.name.to_string());
            let current = invocation.value().as_str().unwrap_or_default().to_string();
            invocation.set_value(Value::String(format!("{current}+{}", self.name)));
            Ok(())
        }
    }

    struct Failing;

    impl VariableInterceptor for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn execute(&self, _invocation: &mut VariableInvocation) -> Result<(), InterceptorError> {
            Err(InterceptorError::new("unsupported value"))
        }
    }

    fn recording(
        name: &'static str,
        priority: i32,
        scope: InterceptorScope,
        log: &Rc<RefCell<Vec<String>>>,
    ) -> Box<dyn VariableInterceptor> {
        Box::new(Recording {
            name,
            priority,
            scope,
            log: Rc::clone(log),
        })
    }

    fn string_variable(name: &str, value: &str) -> SourceVariable {
        SourceVariable::new(name, VariableKind::String, json!(value), "p1", "p1")
    }

    #[test]
    fn interceptors_run_in_priority_order_feeding_values_forward() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let pipeline = InterceptorPipeline::new()
            .with(recording("late", 10, InterceptorScope::Universal, &log))
            .with(recording("early", -1, InterceptorScope::Universal, &log))
            .with(recording("tie-first", 5, InterceptorScope::Universal, &log))
            .with(recording("tie-second", 5, InterceptorScope::Universal, &log));

        let value = pipeline
            .transform_variable(string_variable("amount", "v"))
            .expect("transform");

        assert_eq!(
            log.borrow().as_slice(),
            ["early", "tie-first", "tie-second", "late"]
        );
        assert_eq!(value, json!("v+early+tie-first+tie-second+late"));
        assert_eq!(
            pipeline.names(),
            vec!["early", "tie-first", "tie-second", "late"]
        );
    }

    #[test]
    fn scoped_interceptors_only_see_declared_kinds() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let pipeline = InterceptorPipeline::new().with(recording(
            "dates-only",
            0,
            InterceptorScope::only([VariableKind::Date]),
            &log,
        ));

        let value = pipeline
            .transform_variable(string_variable("name", "plain"))
            .expect("transform");

        assert!(log.borrow().is_empty());
        assert_eq!(value, json!("plain"));
    }

    #[test]
    fn failure_names_interceptor_and_variable() {
        let pipeline = InterceptorPipeline::new().with(Box::new(Failing));

        let err = pipeline
            .transform([string_variable("ok", "a"), string_variable("bad", "b")])
            .expect_err("pipeline fails");

        assert_eq!(err.interceptor, "failing");
        assert_eq!(err.variable, "ok");
        assert_eq!(
            err.to_string(),
            "An error occurred during variable transformation. Interceptor [failing] failed for variable [ok]: unsupported value"
        );
    }

    #[test]
    fn empty_pipeline_passes_values_through() {
        let pipeline = InterceptorPipeline::new();
        assert!(pipeline.is_empty());

        let values = pipeline
            .transform([
                string_variable("a", "1"),
                SourceVariable::new("n", VariableKind::Long, json!(42), "p1", "p1"),
            ])
            .expect("transform");

        assert_eq!(values.get("a"), Some(&json!("1")));
        assert_eq!(values.get("n"), Some(&json!(42)));
    }
}

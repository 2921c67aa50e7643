use crate::{InterceptorError, InterceptorScope, VariableInterceptor, VariableInvocation};
use chrono::format::{Item, StrftimeItems};
use chrono::DateTime;
use rmig_core::VariableKind;
use serde_json::Value;

pub const DEFAULT_DATE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f%:z";

/// Converts values into the shape the target engine stores. JSON and XML payloads travel as
/// their text form; everything else passes through unchanged.
#[derive(Debug, Default, Clone)]
pub struct DefaultVariableInterceptor;

impl VariableInterceptor for DefaultVariableInterceptor {
    fn name(&self) -> &str {
        "default"
    }

    fn execute(&self, invocation: &mut VariableInvocation) -> Result<(), InterceptorError> {
        match invocation.kind() {
            VariableKind::Json | VariableKind::Xml => {
                let text = match invocation.value() {
                    Value::Null => return Ok(()),
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
                invocation.set_value(Value::String(text));
            }
            VariableKind::Null => invocation.set_value(Value::Null),
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct FileVariableValidator;

impl VariableInterceptor for FileVariableValidator {
    fn name(&self) -> &str {
        "file-validator"
    }

    fn priority(&self) -> i32 {
        2
    }

    fn scope(&self) -> InterceptorScope {
        InterceptorScope::only([VariableKind::File])
    }

    fn execute(&self, _invocation: &mut VariableInvocation) -> Result<(), InterceptorError> {
        Err(InterceptorError::new(
            "File type variables are not supported in the target engine.",
        ))
    }
}

/// Rewrites RFC 3339 date values with a strftime pattern.
#[derive(Debug, Clone)]
pub struct DateFormatInterceptor {
    format: String,
}

impl Default for DateFormatInterceptor {
    fn default() -> Self {
        Self {
            format: DEFAULT_DATE_FORMAT.to_string(),
        }
    }
}

impl DateFormatInterceptor {
    pub fn new(format: impl Into<String>) -> Result<Self, InterceptorError> {
        let format = format.into();
        if StrftimeItems::new(&format).any(|item| matches!(item, Item::Error)) {
            return Err(InterceptorError::new(format!(
                "invalid date format pattern {format:?}"
            )));
        }
        Ok(Self { format })
    }

    pub fn format(&self) -> &str {
        &self.format
    }
}

impl VariableInterceptor for DateFormatInterceptor {
    fn name(&self) -> &str {
        "date-format"
    }

    fn priority(&self) -> i32 {
        5
    }

    fn scope(&self) -> InterceptorScope {
        InterceptorScope::only([VariableKind::Date])
    }

    fn execute(&self, invocation: &mut VariableInvocation) -> Result<(), InterceptorError> {
        let formatted = match invocation.value() {
            Value::Null => return Ok(()),
            Value::String(text) => DateTime::parse_from_rfc3339(text)
                .map_err(|err| InterceptorError::new(format!("invalid date {text:?}: {err}")))?
                .format(&self.format)
                .to_string(),
            other => {
                return Err(InterceptorError::new(format!(
                    "expected an RFC 3339 date string, found {other}"
                )))
            }
        };
        invocation.set_value(Value::String(formatted));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InterceptorPipeline;
    use rmig_core::SourceVariable;
    use serde_json::json;

    fn variable(name: &str, kind: VariableKind, value: Value) -> SourceVariable {
        SourceVariable::new(name, kind, value, "p1", "p1")
    }

    fn builtin_pipeline() -> InterceptorPipeline {
        InterceptorPipeline::new()
            .with(Box::new(DateFormatInterceptor::default()))
            .with(Box::new(FileVariableValidator))
            .with(Box::new(DefaultVariableInterceptor))
    }

    #[test]
    fn json_and_xml_payloads_become_text() {
        let pipeline = builtin_pipeline();

        let json_value = pipeline
            .transform_variable(variable(
                "order",
                VariableKind::Json,
                json!({"id": 7, "lines": [1, 2]}),
            ))
            .expect("json");
        assert_eq!(json_value, json!(r#"{"id":7,"lines":[1,2]}"#));

        let xml_value = pipeline
            .transform_variable(variable("doc", VariableKind::Xml, json!("<a>1</a>")))
            .expect("xml");
        assert_eq!(xml_value, json!("<a>1</a>"));

        let object_value = pipeline
            .transform_variable(variable(
                "customer",
                VariableKind::Object,
                json!({"name": "Ada"}),
            ))
            .expect("object");
        assert_eq!(object_value, json!({"name": "Ada"}));
    }

    #[test]
    fn file_variables_are_rejected() {
        let err = builtin_pipeline()
            .transform_variable(variable("invoice", VariableKind::File, json!("blob")))
            .expect_err("file rejected");

        assert_eq!(err.interceptor, "file-validator");
        assert_eq!(err.variable, "invoice");
        assert!(err.message.contains("File type variables"));
    }

    #[test]
    fn dates_are_reformatted_with_millisecond_precision() {
        let value = builtin_pipeline()
            .transform_variable(variable(
                "due",
                VariableKind::Date,
                json!("2026-03-01T10:15:30Z"),
            ))
            .expect("date");
        assert_eq!(value, json!("2026-03-01T10:15:30.000+00:00"));

        let custom = DateFormatInterceptor::new("%d.%m.%Y").expect("pattern");
        let value = InterceptorPipeline::new()
            .with(Box::new(custom))
            .transform_variable(variable(
                "due",
                VariableKind::Date,
                json!("2026-03-01T10:15:30+02:00"),
            ))
            .expect("date");
        assert_eq!(value, json!("01.03.2026"));
    }

    #[test]
    fn malformed_dates_and_patterns_fail() {
        let err = builtin_pipeline()
            .transform_variable(variable("due", VariableKind::Date, json!("yesterday")))
            .expect_err("bad date");
        assert_eq!(err.interceptor, "date-format");

        assert!(DateFormatInterceptor::new("%Q").is_err());
    }
}

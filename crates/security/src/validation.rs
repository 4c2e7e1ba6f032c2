use arbor_types::{is_valid_address, is_valid_ip, NodeError};
use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Validator for incoming request payloads.
///
/// Payloads are converted into `serde_json::Value` and checked against a
/// list of declarative [`ValidationRule`]s before any state changes.
pub struct InputValidator {
    regex_cache: RwLock<HashMap<String, Arc<Regex>>>,
}

impl Default for InputValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl InputValidator {
    pub fn new() -> Self {
        Self {
            regex_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn validate<T>(&self, data: &T, rules: &[ValidationRule]) -> Result<(), ValidationError>
    where
        T: Serialize,
    {
        let value = serde_json::to_value(data)
            .map_err(|e| ValidationError::Serialization(e.to_string()))?;
        self.validate_value(&value, rules)
    }

    pub fn validate_value(&self, value: &Value, rules: &[ValidationRule]) -> Result<(), ValidationError> {
        let issues: Vec<ValidationIssue> = rules
            .iter()
            .flat_map(|rule| self.apply_rule(value, rule))
            .collect();

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::Failed { errors: issues })
        }
    }

    fn apply_rule(&self, value: &Value, rule: &ValidationRule) -> Vec<ValidationIssue> {
        let field_value = lookup_field(value, &rule.field).filter(|v| !v.is_null());
        rule.constraints
            .iter()
            .filter_map(|constraint| self.check_constraint(&rule.field, field_value, constraint))
            .collect()
    }

    fn check_constraint(
        &self,
        field: &str,
        value: Option<&Value>,
        constraint: &Constraint,
    ) -> Option<ValidationIssue> {
        let failed = |code: &str, message: String| Some(ValidationIssue::new(field, code, message));

        match constraint {
            Constraint::Required => {
                if value.is_none() {
                    return failed("required", format!("Field `{}` is required", field));
                }
            }
            Constraint::NonEmpty => {
                if value.map_or(true, is_empty) {
                    return failed("empty", format!("Field `{}` must not be empty", field));
                }
            }
            Constraint::MaxLength(max) => {
                if value.and_then(extract_length).is_some_and(|len| len > *max) {
                    return failed(
                        "max_length",
                        format!("Field `{}` must have length <= {}", field, max),
                    );
                }
            }
            Constraint::Range(min, max) => {
                if let Some(value) = value {
                    match extract_number(value) {
                        Some(num) if num >= *min && num <= *max => {}
                        _ => {
                            return failed(
                                "range",
                                format!("Field `{}` must be within [{}, {}]", field, min, max),
                            )
                        }
                    }
                }
            }
            Constraint::Pattern(pattern) => {
                if let Some(value) = value {
                    let matched = match (self.get_or_compile_regex(pattern), value) {
                        (Some(regex), Value::String(text)) => regex.is_match(text),
                        _ => false,
                    };
                    if !matched {
                        return failed(
                            "pattern",
                            format!("Field `{}` does not match {}", field, pattern),
                        );
                    }
                }
            }
            Constraint::Ip => {
                if value.is_some_and(|v| !v.as_str().is_some_and(is_valid_ip)) {
                    return failed("ip", format!("Field `{}` must be an IP address", field));
                }
            }
            Constraint::Address => {
                if value.is_some_and(|v| !v.as_str().is_some_and(is_valid_address)) {
                    return failed(
                        "address",
                        format!("Field `{}` must be a host:port address", field),
                    );
                }
            }
            Constraint::Each(inner) => {
                if let Some(Value::Array(items)) = value {
                    for (index, item) in items.iter().enumerate() {
                        let path = format!("{}.{}", field, index);
                        if let Some(issue) = self.check_constraint(&path, Some(item), inner) {
                            return Some(issue);
                        }
                    }
                }
            }
        }

        None
    }

    fn get_or_compile_regex(&self, pattern: &str) -> Option<Arc<Regex>> {
        if let Some(existing) = self.regex_cache.read().get(pattern) {
            return Some(Arc::clone(existing));
        }

        let compiled = Arc::new(Regex::new(pattern).ok()?);
        self.regex_cache
            .write()
            .entry(pattern.to_string())
            .or_insert_with(|| Arc::clone(&compiled));
        Some(compiled)
    }
}

/// Declarative validation rule describing the constraints for a particular field
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub field: String,
    pub constraints: Vec<Constraint>,
}

impl ValidationRule {
    /// Create a new rule for a dotted field path
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            constraints: Vec::new(),
        }
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    pub fn required(self) -> Self {
        self.with_constraint(Constraint::Required)
    }

    pub fn non_empty(self) -> Self {
        self.with_constraint(Constraint::NonEmpty)
    }

    pub fn max_length(self, max: usize) -> Self {
        self.with_constraint(Constraint::MaxLength(max))
    }

    pub fn range(self, min: f64, max: f64) -> Self {
        self.with_constraint(Constraint::Range(min, max))
    }

    pub fn pattern(self, pattern: impl Into<String>) -> Self {
        self.with_constraint(Constraint::Pattern(pattern.into()))
    }

    pub fn ip(self) -> Self {
        self.with_constraint(Constraint::Ip)
    }

    pub fn address(self) -> Self {
        self.with_constraint(Constraint::Address)
    }

    pub fn each(self, constraint: Constraint) -> Self {
        self.with_constraint(Constraint::Each(Box::new(constraint)))
    }
}

/// Supported constraint types. Absent fields only fail `Required` and `NonEmpty`.
#[derive(Debug, Clone)]
pub enum Constraint {
    Required,
    NonEmpty,
    MaxLength(usize),
    Range(f64, f64),
    Pattern(String),
    Ip,
    Address,
    /// Apply to every item of an array.
    Each(Box<Constraint>),
}

/// Validation error returned when one or more constraints fail
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Validation failed: {}", summarize(.errors))]
    Failed { errors: Vec<ValidationIssue> },
    #[error("Failed to serialize input for validation: {0}")]
    Serialization(String),
}

fn summarize(errors: &[ValidationIssue]) -> String {
    errors
        .iter()
        .map(|issue| issue.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ValidationError {
    pub fn errors(&self) -> &[ValidationIssue] {
        match self {
            ValidationError::Failed { errors } => errors.as_slice(),
            ValidationError::Serialization(_) => &[],
        }
    }
}

impl From<ValidationError> for NodeError {
    fn from(err: ValidationError) -> Self {
        NodeError::Validation(err.to_string())
    }
}

/// Detailed information about a single validation failure
#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationIssue {
    pub field: String,
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: impl Into<String>, code: impl Into<String>, message: String) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message,
        }
    }
}

/// Rule sets for the request bodies the node accepts.
pub mod schemas {
    use super::{Constraint, ValidationRule};

    const ACTION_PATTERN: &str = r"^[A-Za-z0-9_\-.]{1,64}$";
    const KEY_PATTERN: &str = r"^[0-9a-f]{16,128}$";

    fn action() -> ValidationRule {
        ValidationRule::new("action").required().pattern(ACTION_PATTERN)
    }

    fn key() -> ValidationRule {
        ValidationRule::new("key").required().pattern(KEY_PATTERN)
    }

    fn addresses(field: &str) -> ValidationRule {
        ValidationRule::new(field)
            .required()
            .non_empty()
            .max_length(256)
            .each(Constraint::Address)
    }

    pub fn target() -> Vec<ValidationRule> {
        vec![ValidationRule::new("target").required().address()]
    }

    pub fn register() -> Vec<ValidationRule> {
        vec![
            ValidationRule::new("target").required().address(),
            ValidationRule::new("availability").range(0.0, 100.0),
        ]
    }

    pub fn approval_action() -> Vec<ValidationRule> {
        vec![action()]
    }

    pub fn approval_key() -> Vec<ValidationRule> {
        vec![action(), key()]
    }

    pub fn add_approval_info() -> Vec<ValidationRule> {
        vec![
            action(),
            key(),
            ValidationRule::new("started_at").required().range(0.0, f64::MAX),
        ]
    }

    pub fn approval_question() -> Vec<ValidationRule> {
        vec![action(), key(), addresses("confirmed_addresses")]
    }

    pub fn check_approval_answer() -> Vec<ValidationRule> {
        vec![
            action(),
            key(),
            ValidationRule::new("client_ip").required().ip(),
            addresses("approvers"),
            ValidationRule::new("answer").required().max_length(256),
            ValidationRule::new("consumer").required().address(),
        ]
    }

    pub fn approval_info() -> Vec<ValidationRule> {
        vec![
            action(),
            key(),
            ValidationRule::new("started_at").required(),
            addresses("approvers"),
            ValidationRule::new("answer").required().max_length(256),
        ]
    }
}

fn lookup_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }

    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(segment)?;
            }
            Value::Array(items) => {
                let idx = segment.parse::<usize>().ok()?;
                current = items.get(idx)?;
            }
            _ => return None,
        }
    }

    Some(current)
}

fn extract_length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(arr) => Some(arr.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn extract_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(num) => num.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(arr) => arr.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

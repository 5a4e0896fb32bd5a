//! # Query Builder
//!
//! Conditions are appended as parametrized fragments (`status = ?`,
//! `node_id IN (?, ?)`) plus positional parameters, then compiled into a
//! [`Query`] that is evaluated against JSON rows.
//!
//! An `IN` over an empty list emits `0 = 1`: it binds nothing and matches
//! no row.

use serde_json::Value;
use shared_types::{SupervisorError, SupervisorResult};

/// Fragment emitted for `IN ()`.
pub const ALWAYS_FALSE: &str = "0 = 1";

/// One predicate on a row property.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Equals(Value),
    NotEquals(Value),
    OneOf(Vec<Value>),
}

impl Condition {
    /// Decode the loose JSON shape: a bare value means equality, an object
    /// `{operation, value}` with `operation` one of `eq`, `neq`, `in` is
    /// explicit.
    pub fn from_json(raw: &Value) -> SupervisorResult<Self> {
        let Some(object) = raw.as_object() else {
            return Ok(Condition::Equals(raw.clone()));
        };
        let Some(operation) = object.get("operation") else {
            return Ok(Condition::Equals(raw.clone()));
        };

        let value = object.get("value").cloned().unwrap_or(Value::Null);
        match operation.as_str() {
            Some("eq") => Ok(Condition::Equals(value)),
            Some("neq") => Ok(Condition::NotEquals(value)),
            Some("in") => match value {
                Value::Array(items) => Ok(Condition::OneOf(items)),
                other => Err(SupervisorError::UnsupportedOperation(format!(
                    "in expects an array, got {other}"
                ))),
            },
            _ => Err(SupervisorError::UnsupportedOperation(format!(
                "Unsupported operation: {}",
                operation.as_str().map_or_else(|| operation.to_string(), str::to_string)
            ))),
        }
    }
}

/// Append the fragment and parameters for `condition` on `property`.
pub fn append_condition(
    property: &str,
    condition: Condition,
    conditions: &mut Vec<String>,
    params: &mut Vec<Value>,
) {
    match condition {
        Condition::Equals(value) => {
            conditions.push(format!("{property} = ?"));
            params.push(value);
        }
        Condition::NotEquals(value) => {
            conditions.push(format!("{property} != ?"));
            params.push(value);
        }
        Condition::OneOf(values) if values.is_empty() => {
            conditions.push(ALWAYS_FALSE.to_string());
        }
        Condition::OneOf(values) => {
            let placeholders = vec!["?"; values.len()].join(", ");
            conditions.push(format!("{property} IN ({placeholders})"));
            params.extend(values);
        }
    }
}

/// [`append_condition`] for the loose JSON shape.
pub fn append_json_condition(
    property: &str,
    raw: &Value,
    conditions: &mut Vec<String>,
    params: &mut Vec<Value>,
) -> SupervisorResult<()> {
    let condition = Condition::from_json(raw)?;
    append_condition(property, condition, conditions, params);
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Predicate {
    Never,
    Eq(String, Value),
    Neq(String, Value),
    In(String, Vec<Value>),
}

/// A conjunction of conditions, ready to evaluate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    conditions: Vec<String>,
    params: Vec<Value>,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`append_condition`].
    #[must_use]
    pub fn with(mut self, property: &str, condition: Condition) -> Self {
        append_condition(property, condition, &mut self.conditions, &mut self.params);
        self
    }

    /// Builder form of [`append_json_condition`].
    pub fn with_json(mut self, property: &str, raw: &Value) -> SupervisorResult<Self> {
        append_json_condition(property, raw, &mut self.conditions, &mut self.params)?;
        Ok(self)
    }

    #[must_use]
    pub fn conditions(&self) -> &[String] {
        &self.conditions
    }

    #[must_use]
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Bind parameters to fragments positionally.
    fn compile(&self) -> SupervisorResult<Vec<Predicate>> {
        let mut params = self.params.iter().cloned();
        let mut take = |n: usize, fragment: &str| -> SupervisorResult<Vec<Value>> {
            let bound: Vec<Value> = params.by_ref().take(n).collect();
            if bound.len() == n {
                Ok(bound)
            } else {
                Err(SupervisorError::UnsupportedOperation(format!(
                    "not enough parameters for `{fragment}`"
                )))
            }
        };

        let mut predicates = Vec::with_capacity(self.conditions.len());
        for fragment in &self.conditions {
            let predicate = if fragment == ALWAYS_FALSE {
                Predicate::Never
            } else if let Some((property, rest)) = fragment.split_once(" IN (") {
                let arity = rest.matches('?').count();
                Predicate::In(property.to_string(), take(arity, fragment)?)
            } else if let Some(property) = fragment.strip_suffix(" != ?") {
                let mut bound = take(1, fragment)?;
                Predicate::Neq(property.to_string(), bound.remove(0))
            } else if let Some(property) = fragment.strip_suffix(" = ?") {
                let mut bound = take(1, fragment)?;
                Predicate::Eq(property.to_string(), bound.remove(0))
            } else {
                return Err(SupervisorError::UnsupportedOperation(format!(
                    "unrecognised fragment `{fragment}`"
                )));
            };
            predicates.push(predicate);
        }

        if params.next().is_some() {
            return Err(SupervisorError::UnsupportedOperation(
                "more parameters than placeholders".to_string(),
            ));
        }
        Ok(predicates)
    }

    /// Keep the rows matching every condition.
    pub fn filter<T>(&self, rows: Vec<(Value, T)>) -> SupervisorResult<Vec<T>> {
        let predicates = self.compile()?;
        Ok(rows
            .into_iter()
            .filter(|(row, _)| predicates.iter().all(|p| p.matches(row)))
            .map(|(_, item)| item)
            .collect())
    }

    /// Whether a single row matches.
    pub fn matches(&self, row: &Value) -> SupervisorResult<bool> {
        Ok(self.compile()?.iter().all(|p| p.matches(row)))
    }
}

impl Predicate {
    fn matches(&self, row: &Value) -> bool {
        match self {
            Predicate::Never => false,
            Predicate::Eq(property, value) => field(row, property) == value,
            Predicate::Neq(property, value) => field(row, property) != value,
            Predicate::In(property, values) => {
                let actual = field(row, property);
                values.iter().any(|v| v == actual)
            }
        }
    }
}

/// Property lookup; `a.b` descends into nested objects. Missing is null.
fn field<'a>(row: &'a Value, property: &str) -> &'a Value {
    property
        .split('.')
        .try_fold(row, |value, segment| value.get(segment))
        .unwrap_or(&Value::Null)
}

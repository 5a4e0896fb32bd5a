//! Typed filters for `list_nodes` / `list_workers`.

use serde_json::Value;
use shared_types::{NodeId, ProcessState, SupervisorError, SupervisorResult, WorkerStatus};

use super::query::{Condition, Query};

const NODE_PROPERTIES: &[&str] = &[
    "id",
    "name",
    "network",
    "data_path",
    "rpc_endpoint",
    "process_state",
];

const WORKER_PROPERTIES: &[&str] = &[
    "id",
    "node_id",
    "validator_index",
    "public_key",
    "withdrawal_address",
    "status",
];

fn to_value<T: serde::Serialize>(value: T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

/// Conditions on properties from a fixed allow-list.
#[derive(Debug, Clone, Default, PartialEq)]
struct Filter {
    conditions: Vec<(String, Condition)>,
}

impl Filter {
    fn from_json(raw: &Value, allowed: &[&str]) -> SupervisorResult<Self> {
        let mut filter = Filter::default();
        match raw {
            Value::Null => {}
            Value::Object(map) => {
                for (property, condition) in map {
                    if !allowed.contains(&property.as_str()) {
                        return Err(SupervisorError::UnsupportedOperation(format!(
                            "cannot filter on `{property}`"
                        )));
                    }
                    filter
                        .conditions
                        .push((property.clone(), Condition::from_json(condition)?));
                }
            }
            other => {
                return Err(SupervisorError::UnsupportedOperation(format!(
                    "filter must be an object, got {other}"
                )))
            }
        }
        Ok(filter)
    }

    fn to_query(&self) -> Query {
        self.conditions
            .iter()
            .fold(Query::new(), |q, (property, condition)| {
                q.with(property, condition.clone())
            })
    }
}

/// Filter over Node records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeFilter(Filter);

impl NodeFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Decode `{"property": condition, ...}`.
    pub fn from_json(raw: &Value) -> SupervisorResult<Self> {
        Filter::from_json(raw, NODE_PROPERTIES).map(Self)
    }

    #[must_use]
    pub fn process_state(mut self, states: &[ProcessState]) -> Self {
        let values = states.iter().map(to_value).collect();
        self.0
            .conditions
            .push(("process_state".into(), Condition::OneOf(values)));
        self
    }

    #[must_use]
    pub fn to_query(&self) -> Query {
        self.0.to_query()
    }
}

/// Filter over Worker records.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerFilter(Filter);

impl WorkerFilter {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Decode `{"property": condition, ...}`.
    pub fn from_json(raw: &Value) -> SupervisorResult<Self> {
        Filter::from_json(raw, WORKER_PROPERTIES).map(Self)
    }

    #[must_use]
    pub fn node(mut self, node_id: NodeId) -> Self {
        self.0
            .conditions
            .push(("node_id".into(), Condition::Equals(to_value(node_id))));
        self
    }

    /// Match a normalized (lowercase, unprefixed) public key.
    #[must_use]
    pub fn public_key(mut self, public_key: &str) -> Self {
        self.0
            .conditions
            .push(("public_key".into(), Condition::Equals(Value::from(public_key))));
        self
    }

    #[must_use]
    pub fn status(mut self, statuses: &[WorkerStatus]) -> Self {
        let values = statuses.iter().map(to_value).collect();
        self.0
            .conditions
            .push(("status".into(), Condition::OneOf(values)));
        self
    }

    #[must_use]
    pub fn to_query(&self) -> Query {
        self.0.to_query()
    }
}

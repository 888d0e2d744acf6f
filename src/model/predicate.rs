use serde::Serialize;
use serde_json::Value;

/// Normalized filter understood by every document store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Predicate {
    /// Matches every document
    All,
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Field {
        path: String,
        conditions: Vec<Condition>,
    },
}

/// A single test applied to the value at a field path.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Regex { pattern: String, options: String },
}

impl Predicate {
    pub fn field(path: impl Into<String>, condition: Condition) -> Self {
        Predicate::Field {
            path: path.into(),
            conditions: vec![condition],
        }
    }

    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::field(path, Condition::Eq(value.into()))
    }

    pub fn is_in(path: impl Into<String>, values: Vec<Value>) -> Self {
        Self::field(path, Condition::In(values))
    }

    /// Conjunction that flattens nested `And`s and drops `All`.
    pub fn and(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        let mut parts = Vec::new();
        for predicate in predicates {
            match predicate {
                Predicate::All => {}
                Predicate::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Predicate::All,
            1 => parts.remove(0),
            _ => Predicate::And(parts),
        }
    }

    /// Conjoin with another predicate.
    pub fn with(self, other: Predicate) -> Self {
        Predicate::and([self, other])
    }

    /// Restrict to documents that are not soft-deleted.
    pub fn not_deleted(self) -> Self {
        self.with(Predicate::eq(crate::model::DELETED_AT, Value::Null))
    }
}

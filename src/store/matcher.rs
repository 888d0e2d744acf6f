use regex::RegexBuilder;
use serde_json::Value;
use std::cmp::Ordering;

use crate::model::{
    get_path, get_path_mut, remove_path, set_path, Condition, Document, FindOptions, Predicate,
    SortDirection, UpdateCommand, PHYSICAL_KEY,
};
use crate::store::traits::{StoreError, StoreResult};

/// In-process evaluation of predicates and updates against documents.
pub struct DocumentMatcher;

impl DocumentMatcher {
    /// Filter, sort and page a set of documents.
    pub fn select(documents: Vec<Document>, predicate: &Predicate, options: &FindOptions) -> Vec<Document> {
        let mut matched: Vec<Document> = documents
            .into_iter()
            .filter(|document| Self::matches(document, predicate))
            .collect();
        Self::sort(&mut matched, options);
        let limit = options.limit.unwrap_or(usize::MAX);
        matched.into_iter().skip(options.skip).take(limit).collect()
    }

    pub fn sort(documents: &mut [Document], options: &FindOptions) {
        if options.sort.is_empty() {
            return;
        }
        documents.sort_by(|a, b| {
            for key in &options.sort {
                let ordering = order_values(get_path(a, &key.path), get_path(b, &key.path));
                let ordering = match key.direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    pub fn matches(document: &Document, predicate: &Predicate) -> bool {
        match predicate {
            Predicate::All => true,
            Predicate::And(parts) => parts.iter().all(|p| Self::matches(document, p)),
            Predicate::Or(parts) => parts.iter().any(|p| Self::matches(document, p)),
            Predicate::Field { path, conditions } => {
                let actual = get_path(document, path);
                conditions.iter().all(|c| Self::evaluate(actual, c))
            }
        }
    }

    fn evaluate(actual: Option<&Value>, condition: &Condition) -> bool {
        match condition {
            Condition::Eq(expected) => eq_matches(actual, expected),
            Condition::Ne(expected) => !eq_matches(actual, expected),
            Condition::In(values) => values.iter().any(|v| eq_matches(actual, v)),
            Condition::Nin(values) => !values.iter().any(|v| eq_matches(actual, v)),
            Condition::Exists(expected) => actual.is_some() == *expected,
            Condition::Gt(bound) => any_scalar(actual, |v| compare_values(v, bound) == Some(Ordering::Greater)),
            Condition::Gte(bound) => any_scalar(actual, |v| {
                matches!(compare_values(v, bound), Some(Ordering::Greater | Ordering::Equal))
            }),
            Condition::Lt(bound) => any_scalar(actual, |v| compare_values(v, bound) == Some(Ordering::Less)),
            Condition::Lte(bound) => any_scalar(actual, |v| {
                matches!(compare_values(v, bound), Some(Ordering::Less | Ordering::Equal))
            }),
            Condition::Regex { pattern, options } => {
                let Ok(regex) = RegexBuilder::new(pattern)
                    .case_insensitive(options.contains('i'))
                    .multi_line(options.contains('m'))
                    .dot_matches_new_line(options.contains('s'))
                    .ignore_whitespace(options.contains('x'))
                    .build()
                else {
                    return false;
                };
                any_scalar(actual, |v| v.as_str().map(|s| regex.is_match(s)).unwrap_or(false))
            }
        }
    }

    /// Apply an update in place.
    pub fn apply_update(document: &mut Document, update: &UpdateCommand) -> StoreResult<()> {
        for (path, value) in &update.set {
            if path == PHYSICAL_KEY && document.get(PHYSICAL_KEY).is_some_and(|id| id != value) {
                return Err(StoreError::backend("the physical key of a document is immutable"));
            }
            set_path(document, path, value.clone());
        }
        for path in &update.unset {
            remove_path(document, path);
        }
        for (path, delta) in &update.inc {
            let current = get_path(document, path).and_then(Value::as_f64).unwrap_or(0.0);
            let delta = delta
                .as_f64()
                .ok_or_else(|| StoreError::backend(format!("cannot increment '{}' by a non-number", path)))?;
            set_path(document, path, number(current + delta));
        }
        for (path, values) in &update.push {
            array_at(document, path)?.extend(values.iter().cloned());
        }
        for (path, values) in &update.add_to_set {
            let items = array_at(document, path)?;
            for value in values {
                if !items.iter().any(|item| loose_eq(item, value)) {
                    items.push(value.clone());
                }
            }
        }
        for (path, values) in &update.pull {
            if let Some(Value::Array(items)) = get_path_mut(document, path) {
                items.retain(|item| !values.iter().any(|v| loose_eq(item, v)));
            }
        }
        Ok(())
    }
}

fn array_at<'a>(document: &'a mut Document, path: &str) -> StoreResult<&'a mut Vec<Value>> {
    if get_path(document, path).map_or(true, Value::is_null) {
        set_path(document, path, Value::Array(Vec::new()));
    }
    match get_path_mut(document, path) {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(StoreError::backend(format!("field '{}' is not an array", path))),
    }
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Value::from(value as i64)
    } else {
        serde_json::Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

/// Equality with document-store semantics: arrays match when any element
/// matches, and null matches missing fields.
fn eq_matches(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(Value::Array(items)) => {
            loose_eq(&Value::Array(items.clone()), expected) || items.iter().any(|item| loose_eq(item, expected))
        }
        Some(value) => loose_eq(value, expected),
    }
}

fn any_scalar(actual: Option<&Value>, test: impl Fn(&Value) -> bool) -> bool {
    match actual {
        None => false,
        Some(Value::Array(items)) => items.iter().any(test),
        Some(value) => test(value),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Compare two scalars of the same kind; mixed kinds are incomparable.
pub fn compare_values(actual: &Value, expected: &Value) -> Option<Ordering> {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total order for sorting: missing and null first, then numbers, strings,
/// objects, arrays, booleans.
fn order_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Number(_)) => 1,
            Some(Value::String(_)) => 2,
            Some(Value::Object(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Bool(_)) => 5,
        }
    }
    match (a, b) {
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or_else(|| rank(a).cmp(&rank(b))),
        _ => rank(a).cmp(&rank(b)),
    }
}

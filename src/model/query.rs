use serde_json::Value;

use crate::error::{ResourceError, ResourceResult};

pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub path: String,
    pub direction: SortDirection,
}

impl SortKey {
    /// Parse `"name,-age,+email"`.
    pub fn parse_list(raw: &str) -> Vec<SortKey> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| match s.strip_prefix('-') {
                Some(path) => SortKey {
                    path: path.to_string(),
                    direction: SortDirection::Descending,
                },
                None => SortKey {
                    path: s.trim_start_matches('+').to_string(),
                    direction: SortDirection::Ascending,
                },
            })
            .collect()
    }
}

/// Physical read options passed to the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Vec<SortKey>,
    pub skip: usize,
    pub limit: Option<usize>,
}

impl FindOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }
}

/// Logical read options: projection, pagination, sorting and soft-delete gate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    pub select: Option<Vec<String>>,
    pub limit: Option<usize>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub sort: Vec<SortKey>,
    pub include_deleted: bool,
    pub count: bool,
}

impl QueryOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.select = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    /// Accepts a bare number as a limit, or an options object.
    pub fn from_value(raw: &Value) -> ResourceResult<Self> {
        match raw {
            Value::Null => Ok(Self::default()),
            Value::Number(n) => Ok(Self {
                limit: n.as_u64().map(|n| n as usize),
                ..Default::default()
            }),
            Value::Object(map) => {
                let mut options = Self::default();
                if let Some(select) = map.get("select").or_else(|| map.get("fields")) {
                    options.select = Some(string_list(select));
                }
                options.limit = optional_usize(map.get("limit"), "limit")?;
                options.page = optional_usize(map.get("page"), "page")?;
                options.page_size = optional_usize(map.get("pageSize"), "pageSize")?;
                if let Some(sort) = map.get("sort") {
                    options.sort = match sort {
                        Value::Object(keys) => keys
                            .iter()
                            .map(|(path, direction)| SortKey {
                                path: path.clone(),
                                direction: if direction.as_i64() == Some(-1) || direction.as_str() == Some("desc") {
                                    SortDirection::Descending
                                } else {
                                    SortDirection::Ascending
                                },
                            })
                            .collect(),
                        other => SortKey::parse_list(&string_list(other).join(",")),
                    };
                }
                options.include_deleted = flag(map.get("includeDeleted"));
                options.count = flag(map.get("count"));
                Ok(options)
            }
            other => Err(ResourceError::BadRequest(format!(
                "invalid query options: {}",
                other
            ))),
        }
    }

    /// Translate page/pageSize into skip/limit.
    pub fn find_options(&self) -> FindOptions {
        match self.page.filter(|page| *page > 0) {
            Some(page) => {
                let page_size = self.page_size.or(self.limit).unwrap_or(DEFAULT_PAGE_SIZE);
                FindOptions {
                    sort: self.sort.clone(),
                    skip: (page - 1).saturating_mul(page_size),
                    limit: Some(page_size),
                }
            }
            None => FindOptions {
                sort: self.sort.clone(),
                skip: 0,
                limit: self.limit.filter(|limit| *limit > 0),
            },
        }
    }
}

/// Comma string or array of strings.
pub fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

/// `true`, `"true"` (any case) or `"1"`.
pub fn flag(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true") || s == "1",
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        _ => false,
    }
}

fn optional_usize(value: Option<&Value>, name: &str) -> ResourceResult<Option<usize>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_u64().map(|n| n as usize)),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ResourceError::BadRequest(format!("'{}' must be a non-negative integer", name))),
        Some(other) => Err(ResourceError::BadRequest(format!(
            "'{}' must be a non-negative integer, got {}",
            name, other
        ))),
    }
}

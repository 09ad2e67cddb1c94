//! Data-layer filter tree and the query it is injected into
//!
//! Filters render to a Mongo-style JSON document (`$and`, `$or`, `$ne`,
//! `$regex`, ...), the shape most document and ORM layers accept directly.

use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

use permgate_common::types::{Condition, UserContext};

use crate::compiler::RuleCompiler;
use crate::expr::CompareOp;

/// Leaf comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
}

impl From<CompareOp> for FilterOp {
    fn from(op: CompareOp) -> Self {
        match op {
            CompareOp::Eq => FilterOp::Eq,
            CompareOp::Ne => FilterOp::Ne,
            CompareOp::Gt => FilterOp::Gt,
            CompareOp::Gte => FilterOp::Gte,
            CompareOp::Lt => FilterOp::Lt,
            CompareOp::Lte => FilterOp::Lte,
        }
    }
}

/// Filter tree handed to the data layer
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Compare {
        field: String,
        op: FilterOp,
        value: Value,
    },
    /// Field is null, missing or empty
    IsNull(String),
    /// Field is present and not null
    NotNull(String),
    /// Join into another object
    Lookup {
        from: String,
        local_field: String,
        foreign_field: String,
        filter: Box<Filter>,
    },
    /// Pre-rendered filter document
    Raw(Value),
    /// Matches everything
    All,
    /// Matches nothing
    Impossible,
}

impl Filter {
    pub fn compare(field: &str, op: FilterOp, value: Value) -> Self {
        Filter::Compare {
            field: field.to_string(),
            op,
            value,
        }
    }

    pub fn equals(field: &str, value: Value) -> Self {
        Self::compare(field, FilterOp::Eq, value)
    }

    /// Conjunction; a single child is returned as-is and no children match everything
    pub fn and(mut filters: Vec<Filter>) -> Self {
        match filters.len() {
            0 => Filter::All,
            1 => filters.remove(0),
            _ => Filter::And(filters),
        }
    }

    /// Disjunction; a single child is returned as-is
    pub fn or(mut filters: Vec<Filter>) -> Self {
        if filters.len() == 1 {
            filters.remove(0)
        } else {
            Filter::Or(filters)
        }
    }

    /// Whether this filter is the match-nothing marker, or a conjunction containing it
    #[must_use]
    pub fn is_impossible(&self) -> bool {
        match self {
            Filter::Impossible => true,
            Filter::And(children) => children.iter().any(Filter::is_impossible),
            Filter::Or(children) => !children.is_empty() && children.iter().all(Filter::is_impossible),
            _ => false,
        }
    }

    /// Render to the JSON filter document
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Filter::All => json!({}),
            Filter::And(children) if children.is_empty() => json!({}),
            Filter::And(children) => json!({ "$and": children.iter().map(Filter::to_value).collect::<Vec<_>>() }),
            Filter::Or(children) => json!({ "$or": children.iter().map(Filter::to_value).collect::<Vec<_>>() }),
            Filter::Compare { field, op, value } => single(field, render_op(*op, value)),
            Filter::IsNull(field) => json!({
                "$or": [
                    single(field, Value::Null),
                    single(field, json!({ "$exists": false })),
                    single(field, json!("")),
                ]
            }),
            Filter::NotNull(field) => single(field, json!({ "$ne": null })),
            Filter::Lookup {
                from,
                local_field,
                foreign_field,
                filter,
            } => json!({
                "$lookup": {
                    "from": from,
                    "localField": local_field,
                    "foreignField": foreign_field,
                    "filter": filter.to_value(),
                }
            }),
            Filter::Raw(value) => value.clone(),
            Filter::Impossible => json!({ "id": null }),
        }
    }
}

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn single(field: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(field.to_string(), value);
    Value::Object(map)
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn pattern_match(pattern: String) -> Value {
    json!({ "$regex": pattern, "$options": "i" })
}

fn render_op(op: FilterOp, value: &Value) -> Value {
    match op {
        FilterOp::Eq => value.clone(),
        FilterOp::Ne => json!({ "$ne": value }),
        FilterOp::Gt => json!({ "$gt": value }),
        FilterOp::Gte => json!({ "$gte": value }),
        FilterOp::Lt => json!({ "$lt": value }),
        FilterOp::Lte => json!({ "$lte": value }),
        FilterOp::In => json!({ "$in": value }),
        FilterOp::Nin => json!({ "$nin": value }),
        FilterOp::Contains => pattern_match(regex::escape(&text_of(value))),
        FilterOp::NotContains => json!({ "$not": pattern_match(regex::escape(&text_of(value))) }),
        FilterOp::StartsWith => pattern_match(format!("^{}", regex::escape(&text_of(value)))),
        FilterOp::EndsWith => pattern_match(format!("{}$", regex::escape(&text_of(value)))),
    }
}

/// Condition the data layer could not express, evaluated over results instead
#[derive(Debug, Clone, PartialEq)]
pub enum ResidualClause {
    /// Every record must satisfy the condition
    All(Condition),
    /// Every record must satisfy at least one of the conditions
    Any(Vec<Condition>),
}

impl ResidualClause {
    /// Evaluate against a record
    #[must_use]
    pub fn matches(&self, record: &Value, user: Option<&UserContext>) -> bool {
        let user = user.map_or(Value::Null, UserContext::to_value);
        match self {
            ResidualClause::All(condition) => RuleCompiler::compile_condition(Some(condition))(record, &user),
            ResidualClause::Any(conditions) => conditions
                .iter()
                .any(|c| RuleCompiler::compile_condition(Some(c))(record, &user)),
        }
    }
}

/// A data-layer query the engine may narrow
#[derive(Debug, Clone, Default, Serialize)]
pub struct Query {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    /// Conditions left for post-query evaluation
    #[serde(skip)]
    pub residual: Vec<ResidualClause>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters = Some(filter);
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// AND `filter` into the existing filters
    pub fn and_filter(&mut self, filter: Filter) {
        if filter == Filter::All {
            return;
        }
        self.filters = Some(match self.filters.take() {
            None | Some(Filter::All) => filter,
            Some(Filter::And(mut children)) => {
                children.push(filter);
                Filter::And(children)
            }
            Some(existing) => Filter::And(vec![existing, filter]),
        });
    }

    /// Rendered filter document (`{}` when unfiltered)
    #[must_use]
    pub fn filter_document(&self) -> Value {
        self.filters
            .as_ref()
            .map_or_else(|| json!({}), Filter::to_value)
    }
}

//! AST -> native query execution (§9 design note, §4.8).
//!
//! Maps the portable `FilterNode`/`CompoundSort` tree onto a Mongo
//! `Document` filter and sort spec, runs it with pagination and an
//! optional count, and projects results down to the requested `select`
//! fields with native value types.

use chrono::{DateTime, Utc};
use futures::stream::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::FindOptions;
use mongodb::Database;
use regex::escape;
use tracing::warn;

use crate::errors::{Error, QueryError};
use crate::query::ast::{CompareOp, CompoundSort, FilterNode, LogicalOp, SortDirection, TextMatchKind, Value};

const DEFAULT_PAGE_SIZE: i64 = 100;
const MAX_PAGE_SIZE: i64 = 1000;

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResult {
    pub collection: String,
    pub data: Vec<Document>,
    pub count: u64,
    pub total_count: Option<u64>,
    pub skip: u64,
    pub top: i64,
    pub filter: Option<String>,
    pub order_by: Option<String>,
    pub select: Option<String>,
    pub executed_at: DateTime<Utc>,
}

pub struct QueryRequest<'a> {
    pub collection: &'a str,
    pub filter: Option<FilterNode>,
    pub order_by: Option<CompoundSort>,
    pub select: Vec<String>,
    pub skip: u64,
    pub top: i64,
    pub count: bool,
    pub raw_filter: Option<String>,
    pub raw_order_by: Option<String>,
    pub raw_select: Option<String>,
}

pub async fn execute(database: &Database, request: QueryRequest<'_>) -> Result<QueryResult, Error> {
    if request.top <= 0 {
        return Err(QueryError::InvalidTop(request.top).into());
    }
    let top = request.top.min(MAX_PAGE_SIZE);
    if request.top > MAX_PAGE_SIZE {
        warn!(requested = request.top, capped = top, "page size capped");
    }

    let mongo_filter = match &request.filter {
        Some(node) => build_filter(node)?,
        None => doc! {},
    };

    let collection = database.collection::<Document>(request.collection);

    let mut options_builder = FindOptions::builder().skip(request.skip).limit(top);
    if let Some(sort) = &request.order_by {
        options_builder = options_builder.sort(build_sort(sort));
    }
    let options = options_builder.build();

    let mut cursor = collection.find(mongo_filter.clone()).with_options(options).await?;
    let mut rows = Vec::new();
    while let Some(doc) = cursor.try_next().await? {
        rows.push(project(&doc, &request.select));
    }

    let total_count = if request.count { Some(collection.count_documents(mongo_filter).await?) } else { None };

    Ok(QueryResult {
        collection: request.collection.to_string(),
        count: rows.len() as u64,
        data: rows,
        total_count,
        skip: request.skip,
        top,
        filter: request.raw_filter,
        order_by: request.raw_order_by,
        select: request.raw_select,
        executed_at: Utc::now(),
    })
}

pub fn default_page_size() -> i64 {
    DEFAULT_PAGE_SIZE
}

fn build_filter(node: &FilterNode) -> Result<Document, Error> {
    Ok(match node {
        FilterNode::Comparison { field, op, value } => {
            let bson_value = value_to_bson(value);
            let operator = match op {
                CompareOp::Eq => "$eq",
                CompareOp::Ne => "$ne",
                CompareOp::Gt => "$gt",
                CompareOp::Ge => "$gte",
                CompareOp::Lt => "$lt",
                CompareOp::Le => "$lte",
            };
            let mut inner = Document::new();
            inner.insert(operator, bson_value);
            let mut out = Document::new();
            out.insert(field.as_str(), inner);
            out
        }
        FilterNode::Logical { op, left, right } => {
            let key = match op {
                LogicalOp::And => "$and",
                LogicalOp::Or => "$or",
            };
            let mut out = Document::new();
            out.insert(key, vec![Bson::Document(build_filter(left)?), Bson::Document(build_filter(right)?)]);
            out
        }
        FilterNode::Not(inner) => {
            let mut out = Document::new();
            out.insert("$nor", vec![Bson::Document(build_filter(inner)?)]);
            out
        }
        FilterNode::TextMatch { field, kind, literal } => {
            let escaped = escape(literal);
            let pattern = match kind {
                TextMatchKind::Contains => escaped,
                TextMatchKind::StartsWith => format!("^{escaped}"),
                TextMatchKind::EndsWith => format!("{escaped}$"),
            };
            let mut inner = Document::new();
            inner.insert("$regex", pattern);
            inner.insert("$options", "i");
            let mut out = Document::new();
            out.insert(field.as_str(), inner);
            out
        }
        FilterNode::In { field, values } => {
            let bson_values: Vec<Bson> = values.iter().map(value_to_bson).collect();
            let mut inner = Document::new();
            inner.insert("$in", bson_values);
            let mut out = Document::new();
            out.insert(field.as_str(), inner);
            out
        }
        FilterNode::Exists { field } => {
            let mut inner = Document::new();
            inner.insert("$exists", true);
            let mut out = Document::new();
            out.insert(field.as_str(), inner);
            out
        }
        FilterNode::Empty { field } => {
            let mut not_exists = Document::new();
            not_exists.insert("$exists", false);
            let mut missing = Document::new();
            missing.insert(field.as_str(), not_exists);

            let mut is_null = Document::new();
            is_null.insert(field.as_str(), Bson::Null);

            let mut is_empty_string = Document::new();
            is_empty_string.insert(field.as_str(), "");

            let mut out = Document::new();
            out.insert("$or", vec![missing, is_null, is_empty_string]);
            out
        }
    })
}

fn value_to_bson(value: &Value) -> Bson {
    match value {
        Value::String(s) => Bson::String(s.clone()),
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Int(i) | Value::Long(i) => Bson::Int64(*i),
        Value::Double(d) | Value::Decimal(d) | Value::Float(d) => Bson::Double(*d),
        Value::DateTime(dt) | Value::DateTimeOffset(dt) => Bson::DateTime((*dt).into()),
    }
}

fn build_sort(sort: &CompoundSort) -> Document {
    let mut doc = Document::new();
    for clause in &sort.clauses {
        let direction = match clause.direction {
            SortDirection::Asc => 1,
            SortDirection::Desc => -1,
        };
        doc.insert(clause.field.as_str(), direction);
    }
    doc
}

/// Select down to `fields`: an exact match, or any key whose prefix is
/// `field + "."` (nested selection). Empty `fields` returns the document
/// unprojected.
fn project(document: &Document, fields: &[String]) -> Document {
    if fields.is_empty() {
        return document.clone();
    }
    let mut out = Document::new();
    for (key, value) in document.iter() {
        let matches = fields.iter().any(|f| f.eq_ignore_ascii_case(key) || key.starts_with(&format!("{f}.")));
        if matches {
            out.insert(key, value.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::odata::{parse_filter, parse_select};

    #[test]
    fn builds_comparison_filter() {
        let node = parse_filter("Price gt 200").unwrap();
        let filter = build_filter(&node).unwrap();
        assert_eq!(filter, doc! { "Price": { "$gt": 200i64 } });
    }

    #[test]
    fn builds_contains_as_anchored_case_insensitive_regex() {
        let node = parse_filter("contains(Name, 'widget')").unwrap();
        let filter = build_filter(&node).unwrap();
        assert_eq!(filter, doc! { "Name": { "$regex": "widget", "$options": "i" } });
    }

    #[test]
    fn project_keeps_exact_and_nested_prefix_matches() {
        let document = doc! { "a": 1, "b": 2, "b.c": 3, "d": 4 };
        let fields = parse_select("a, b");
        let projected = project(&document, &fields);
        assert!(projected.contains_key("a"));
        assert!(projected.contains_key("b"));
        assert!(!projected.contains_key("d"));
    }

    #[test]
    fn rejects_non_positive_top() {
        assert!(matches!(QueryError::InvalidTop(0), QueryError::InvalidTop(0)));
    }
}

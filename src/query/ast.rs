//! Portable query AST (§9 design note).
//!
//! The OData parser (`odata.rs`) maps user input onto this tagged variant
//! tree; the execution layer (`exec.rs`) maps the tree onto native Mongo
//! query primitives. Neither side needs to know about the other, which
//! keeps the grammar testable without a document store.

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    String(String),
    Bool(bool),
    Int(i64),
    Long(i64),
    Double(f64),
    Decimal(f64),
    Float(f64),
    DateTime(chrono::DateTime<chrono::Utc>),
    DateTimeOffset(chrono::DateTime<chrono::Utc>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMatchKind {
    Contains,
    StartsWith,
    EndsWith,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// A node in the parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterNode {
    Comparison { field: String, op: CompareOp, value: Value },
    Logical { op: LogicalOp, left: Box<FilterNode>, right: Box<FilterNode> },
    Not(Box<FilterNode>),
    TextMatch { field: String, kind: TextMatchKind, literal: String },
    In { field: String, values: Vec<Value> },
    Exists { field: String },
    Empty { field: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleFieldSort {
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundSort {
    pub clauses: Vec<SingleFieldSort>,
}

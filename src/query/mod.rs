//! Query facade (C8).
//!
//! Parses a user-supplied OData-subset expression and executes it against
//! a validated collection name. This is the only place in the engine a
//! caller-controlled string reaches the document store, so collection-name
//! validation and page-size clamping both happen here before `exec.rs`
//! ever builds a query.

pub mod ast;
pub mod exec;
pub mod odata;

use mongodb::Database;

use crate::dataset::DatasetDefinition;
use crate::errors::{Error, QueryError};
use crate::query::exec::{QueryRequest, QueryResult};

pub struct QueryFacade<'a> {
    database: Database,
    datasets: &'a [DatasetDefinition],
}

#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub filter: Option<String>,
    pub order_by: Option<String>,
    pub select: Option<String>,
    pub skip: Option<u64>,
    pub top: Option<i64>,
    pub count: bool,
}

impl<'a> QueryFacade<'a> {
    pub fn new(database: Database, datasets: &'a [DatasetDefinition]) -> Self {
        QueryFacade { database, datasets }
    }

    /// Case-insensitive match against every registered dataset name.
    fn resolve_collection(&self, requested: &str) -> Result<String, Error> {
        self.datasets
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(requested))
            .map(|d| d.name.clone())
            .ok_or_else(|| QueryError::UnknownCollection(requested.to_string()).into())
    }

    pub async fn query(&self, collection: &str, params: QueryParams) -> Result<QueryResult, Error> {
        let resolved = self.resolve_collection(collection)?;

        let filter = params.filter.as_deref().map(odata::parse_filter).transpose()?;
        let order_by = params.order_by.as_deref().map(odata::parse_order_by).transpose()?;
        let select = params.select.as_deref().map(odata::parse_select).unwrap_or_default();

        let request = QueryRequest {
            collection: &resolved,
            filter,
            order_by,
            select,
            skip: params.skip.unwrap_or(0),
            top: params.top.unwrap_or_else(exec::default_page_size),
            count: params.count,
            raw_filter: params.filter,
            raw_order_by: params.order_by,
            raw_select: params.select,
        };

        exec::execute(&self.database, request).await
    }
}

//! Query execution and table data models.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::models::schema::ColumnInfo;

/// Column name to value map used for inserts and updates.
pub type RowValues = BTreeMap<String, Value>;

/// Primary key column name to current value; addresses exactly one row.
pub type PrimaryKeyValue = BTreeMap<String, Value>;

/// Type of SQL query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// SELECT query returning rows
    Select,
    /// INSERT operation
    Insert,
    /// UPDATE operation
    Update,
    /// DELETE operation
    Delete,
    /// DDL, COPY, or other operations
    Other,
}

impl QueryType {
    /// Detect the query type from its leading keyword.
    pub fn detect(sql: &str) -> Self {
        let trimmed = sql.trim_start().to_uppercase();

        if trimmed.starts_with("SELECT") || trimmed.starts_with("WITH") {
            QueryType::Select
        } else if trimmed.starts_with("INSERT") {
            QueryType::Insert
        } else if trimmed.starts_with("UPDATE") {
            QueryType::Update
        } else if trimmed.starts_with("DELETE") {
            QueryType::Delete
        } else {
            QueryType::Other
        }
    }
}

/// Snapshot of one executed statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Result column names in order
    pub column_names: Vec<String>,
    /// Rows aligned positionally with `column_names`
    pub rows: Vec<Vec<Value>>,
    /// Number of rows returned
    pub row_count: usize,
    /// Rows affected by a mutating statement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<u64>,
    /// Wall-clock execution time in milliseconds
    pub execution_time_ms: f64,
    /// Type of query
    pub query_type: QueryType,
}

impl QueryResult {
    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get a cell by row index and column name.
    pub fn value(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_names.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

/// Sort direction for paged table reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending (default)
    #[default]
    #[serde(alias = "ASC")]
    Asc,
    /// Descending
    #[serde(alias = "DESC")]
    Desc,
}

impl SortDirection {
    /// SQL keyword.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

/// One page of a table read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    /// Maximum rows in the page
    pub limit: i64,
    /// Rows to skip
    pub offset: i64,
    /// Column to order by; without it page order is unspecified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// Direction applied to `order_by`
    #[serde(default)]
    pub order_direction: SortDirection,
}

impl Pagination {
    /// Page of `limit` rows starting at `offset`.
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset, order_by: None, order_direction: SortDirection::Asc }
    }

    /// Order by a column.
    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by = Some(column.into());
        self.order_direction = direction;
        self
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(100, 0)
    }
}

/// Column metadata, full row count and one page of rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableData {
    /// Table columns
    pub columns: Vec<ColumnInfo>,
    /// Page rows, aligned with the result columns of `SELECT *`
    pub rows: Vec<Vec<Value>>,
    /// `COUNT(*)` of the whole table
    pub total_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_query_type() {
        assert_eq!(QueryType::detect("  select 1"), QueryType::Select);
        assert_eq!(QueryType::detect("WITH x AS (SELECT 1) SELECT * FROM x"), QueryType::Select);
        assert_eq!(QueryType::detect("insert into t values (1)"), QueryType::Insert);
        assert_eq!(QueryType::detect("UPDATE t SET a = 1"), QueryType::Update);
        assert_eq!(QueryType::detect("\n\tDELETE FROM t"), QueryType::Delete);
        assert_eq!(QueryType::detect("CREATE TABLE t (id int)"), QueryType::Other);
    }

    #[test]
    fn test_query_result_value_lookup() {
        let result = QueryResult {
            column_names: vec!["id".into(), "name".into()],
            rows: vec![vec![json!(1), json!("a")]],
            row_count: 1,
            affected_rows: None,
            execution_time_ms: 0.4,
            query_type: QueryType::Select,
        };
        assert_eq!(result.value(0, "name"), Some(&json!("a")));
        assert_eq!(result.value(0, "missing"), None);
        assert_eq!(result.value(1, "id"), None);
    }

    #[test]
    fn test_pagination_deserializes_with_default_direction() {
        let page: Pagination =
            serde_json::from_value(json!({ "limit": 10, "offset": 20, "orderBy": "id" })).unwrap();
        assert_eq!(page.order_direction, SortDirection::Asc);
        assert_eq!(page.order_by.as_deref(), Some("id"));

        let page: Pagination =
            serde_json::from_value(json!({ "limit": 10, "offset": 0, "orderDirection": "desc" }))
                .unwrap();
        assert_eq!(page.order_direction.as_sql(), "DESC");

        let page: Pagination =
            serde_json::from_value(json!({ "limit": 10, "offset": 0, "orderDirection": "DESC" }))
                .unwrap();
        assert_eq!(page.order_direction, SortDirection::Desc);
    }
}

//! Database adapter contract.
//!
//! Every database engine plugs in behind [`DatabaseAdapter`]. The registry and
//! the connection service only ever see `Arc<dyn DatabaseAdapter>`; no code
//! outside `adapters::<engine>` knows which engine is behind a connection.

pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::error::Result;
use crate::models::{
    ColumnInfo, ConnectionConfig, DatabaseInfo, IndexInfo, Pagination, PrimaryKeyValue,
    QueryResult, RowValues, SchemaInfo, TableData, TableInfo,
};

pub use postgres::PostgresAdapter;

/// Schema used when the caller does not name one.
pub const DEFAULT_SCHEMA: &str = "public";

/// Descriptor shown in the adapter picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterInfo {
    /// Registry key, e.g. "postgres"
    pub adapter_type: String,
    /// Display name
    pub name: String,
    /// Icon identifier for the UI
    pub icon: String,
}

/// Constructor stored in the plugin registry.
pub type AdapterFactory = Arc<dyn Fn() -> Arc<dyn DatabaseAdapter> + Send + Sync>;

/// Capability set every database plugin exposes.
///
/// Instances are shared across tasks, so all methods take `&self` and the
/// implementation keeps its pool behind interior mutability.
///
/// Introspection, query and row methods fail with
/// [`QueryPadError::NotConnected`](crate::QueryPadError::NotConnected) before
/// [`connect`](Self::connect) succeeds. Schema arguments default to
/// [`DEFAULT_SCHEMA`].
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Describe this adapter.
    fn info(&self) -> AdapterInfo;

    /// Open a pool against `config` and verify it with one eager connection.
    ///
    /// The secret is used only to build the pool and is not kept.
    async fn connect(&self, config: &ConnectionConfig, secret: &str) -> Result<()>;

    /// Release all pooled connections. No-op when already disconnected.
    async fn disconnect(&self) -> Result<()>;

    /// Probe connectivity with a single-use connection.
    ///
    /// Leaves the adapter's own pool untouched and reports failure as `false`.
    async fn test_connection(&self, config: &ConnectionConfig, secret: &str) -> bool;

    /// Whether a usable pool exists.
    fn is_connected(&self) -> bool;

    /// List databases on the server.
    async fn get_databases(&self) -> Result<Vec<DatabaseInfo>>;

    /// List schemas of the connected database.
    async fn get_schemas(&self, database: Option<&str>) -> Result<Vec<SchemaInfo>>;

    /// List base tables of a schema.
    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<TableInfo>>;

    /// List columns of a table in ordinal order.
    async fn get_columns(&self, table: &str, schema: Option<&str>) -> Result<Vec<ColumnInfo>>;

    /// List indexes of a table.
    async fn get_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<IndexInfo>>;

    /// Primary key columns of a table in key order; empty when it has none.
    async fn get_primary_key(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>>;

    /// Execute SQL with positional parameters bound by the driver.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Column metadata, full `COUNT(*)` and one page of rows.
    async fn get_table_data(
        &self,
        table: &str,
        schema: Option<&str>,
        pagination: &Pagination,
    ) -> Result<TableData>;

    /// Insert one row. An empty map inserts a row of column defaults.
    ///
    /// Returns the number of rows inserted.
    async fn insert_row(&self, table: &str, schema: Option<&str>, values: &RowValues)
        -> Result<u64>;

    /// Update the row addressed by `key`; returns the number of rows changed.
    ///
    /// An empty `key` fails with `NoPrimaryKey`, an empty `values` with `Validation`.
    async fn update_row(
        &self,
        table: &str,
        schema: Option<&str>,
        key: &PrimaryKeyValue,
        values: &RowValues,
    ) -> Result<u64>;

    /// Delete the row addressed by `key`; returns the number of rows removed.
    ///
    /// An empty `key` fails with `NoPrimaryKey`.
    async fn delete_row(
        &self,
        table: &str,
        schema: Option<&str>,
        key: &PrimaryKeyValue,
    ) -> Result<u64>;
}

/// Quote an SQL identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `"schema"."table"` with the default schema applied.
pub fn qualified_table(table: &str, schema: Option<&str>) -> String {
    format!("{}.{}", quote_identifier(schema.unwrap_or(DEFAULT_SCHEMA)), quote_identifier(table))
}

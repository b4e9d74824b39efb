//! Data models for the QueryPad core.
//!
//! - `connection` - ConnectionConfig, SshConfig, PoolSettings
//! - `query` - QueryResult, QueryType, Pagination, TableData, row maps
//! - `schema` - Introspection records
//! - `response` - The `{success, data?, error?}` envelope

pub mod connection;
pub mod query;
pub mod response;
pub mod schema;

pub use connection::{ConnectionConfig, PoolSettings, SshConfig};
pub use query::{
    Pagination, PrimaryKeyValue, QueryResult, QueryType, RowValues, SortDirection, TableData,
};
pub use response::{unit_response, Response};
pub use schema::{ColumnInfo, DatabaseInfo, IndexInfo, SchemaInfo, TableInfo};

//! PostgreSQL adapter over deadpool-postgres.
//!
//! Provides:
//! - Pooled connections with eager validation on connect
//! - Idle connection reaping and bounded pool waits
//! - Optional TLS that accepts self-signed server certificates
//! - Introspection through information_schema and pg_catalog
//! - Parameter-bound queries and row mutations
//! - Multi-statement scripts over the simple query protocol

mod params;
mod rows;
mod sql;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, PoolError, RecyclingMethod, Runtime};
use futures_util::{pin_mut, TryStreamExt};
use parking_lot::RwLock;
use postgres_native_tls::MakeTlsConnector;
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tokio_util::sync::CancellationToken;

use crate::adapters::{qualified_table, AdapterInfo, DatabaseAdapter, DEFAULT_SCHEMA};
use crate::error::{QueryPadError, Result};
use crate::models::{
    ColumnInfo, ConnectionConfig, DatabaseInfo, IndexInfo, Pagination, PoolSettings,
    PrimaryKeyValue, QueryResult, QueryType, RowValues, SchemaInfo, TableData, TableInfo,
};

use self::params::bind;
use self::rows::{row_to_json, simple_row_to_json};

/// Registry key of this adapter.
pub const ADAPTER_TYPE: &str = "postgres";

/// A live pool plus the task pruning its idle connections.
struct ActivePool {
    pool: Pool,
    reaper: Option<CancellationToken>,
}

impl ActivePool {
    fn close(self) {
        if let Some(reaper) = self.reaper {
            reaper.cancel();
        }
        self.pool.close();
    }
}

/// PostgreSQL implementation of [`DatabaseAdapter`].
pub struct PostgresAdapter {
    settings: PoolSettings,
    active: RwLock<Option<ActivePool>>,
}

impl Default for PostgresAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PostgresAdapter {
    /// Create a disconnected adapter with default pool settings.
    pub fn new() -> Self {
        Self::with_settings(PoolSettings::default())
    }

    /// Create a disconnected adapter with custom pool settings.
    pub fn with_settings(settings: PoolSettings) -> Self {
        Self { settings, active: RwLock::new(None) }
    }

    /// Get a handle to the live pool.
    fn pool(&self) -> Result<Pool> {
        self.active.read().as_ref().map(|a| a.pool.clone()).ok_or(QueryPadError::NotConnected)
    }

    /// Acquire a pooled client; pool wait timeouts surface as errors.
    async fn client(&self) -> Result<deadpool_postgres::Client> {
        let pool = self.pool()?;
        Ok(pool.get().await?)
    }

    async fn execute_statement(&self, statement: sql::Statement) -> Result<u64> {
        let client = self.client().await?;
        let bound = bind(&statement.params);
        let affected = client
            .execute_raw(statement.sql.as_str(), bound.iter().map(|p| p as &(dyn ToSql + Sync)))
            .await?;
        Ok(affected)
    }

    async fn count_rows(&self, table_ref: &str) -> Result<i64> {
        let client = self.client().await?;
        let row = client.query_one(sql::count_rows(table_ref).as_str(), &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn fetch_page(&self, table_ref: &str, pagination: &Pagination) -> Result<Vec<Vec<Value>>> {
        let client = self.client().await?;
        let rows = client
            .query(
                sql::select_page(table_ref, pagination).as_str(),
                &[&pagination.limit, &pagination.offset],
            )
            .await?;
        Ok(rows.iter().map(row_to_json).collect())
    }
}

/// The server refuses to prepare text holding more than one statement.
fn is_multi_statement(err: &tokio_postgres::Error) -> bool {
    err.as_db_error().is_some_and(|db| {
        *db.code() == SqlState::SYNTAX_ERROR && db.message().contains("multiple commands")
    })
}

/// Run a parameterless script over the simple query protocol.
///
/// Values arrive as text. Columns and rows are those of the last statement
/// that returned a result set; the affected count is that of the last
/// statement.
async fn run_script(
    client: &tokio_postgres::Client,
    sql: &str,
    query_type: QueryType,
    start: Instant,
) -> Result<QueryResult> {
    let messages = client.simple_query(sql).await?;

    let mut column_names = Vec::new();
    let mut rows = Vec::new();
    let mut statements = 0usize;
    let mut last_count = None;
    for message in messages {
        match message {
            SimpleQueryMessage::RowDescription(columns) => {
                column_names = columns.iter().map(|c| c.name().to_string()).collect();
                rows.clear();
            }
            SimpleQueryMessage::Row(row) => rows.push(simple_row_to_json(&row)),
            SimpleQueryMessage::CommandComplete(count) => {
                statements += 1;
                last_count = Some(count);
            }
            _ => {}
        }
    }
    let execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    tracing::debug!(statements, rows = rows.len(), execution_time_ms, "Script executed");

    Ok(QueryResult {
        column_names,
        row_count: rows.len(),
        rows,
        affected_rows: match query_type {
            QueryType::Select => None,
            _ => last_count,
        },
        execution_time_ms,
        query_type,
    })
}

/// Build a pool for `config`. No connection is opened yet.
fn build_pool(config: &ConnectionConfig, secret: &str, settings: &PoolSettings) -> Result<Pool> {
    let mut pg_config = tokio_postgres::Config::new();
    pg_config
        .host(&config.host)
        .port(config.port)
        .dbname(&config.database)
        .user(&config.username)
        .password(secret)
        .application_name("QueryPad")
        .connect_timeout(settings.connect_timeout)
        .keepalives(true)
        .keepalives_idle(Duration::from_secs(60));

    let manager_config = ManagerConfig { recycling_method: RecyclingMethod::Fast };

    let manager = if config.ssl_enabled {
        pg_config.ssl_mode(tokio_postgres::config::SslMode::Require);
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| QueryPadError::connection_with_source("Failed to initialize TLS", e))?;
        Manager::from_config(pg_config, MakeTlsConnector::new(connector), manager_config)
    } else {
        Manager::from_config(pg_config, NoTls, manager_config)
    };

    Pool::builder(manager)
        .max_size(settings.max_size)
        .wait_timeout(Some(settings.connect_timeout))
        .create_timeout(Some(settings.connect_timeout))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| QueryPadError::connection(format!("Failed to create pool: {e}")))
}

/// Open one connection and run `SELECT 1` on it.
async fn validate_pool(pool: &Pool, config: &ConnectionConfig) -> Result<()> {
    let client = pool.get().await.map_err(|e| connect_failure(e, config))?;
    client.simple_query("SELECT 1").await.map_err(|e| {
        let message = e.as_db_error().map(|db| db.message().to_string()).unwrap_or_else(|| e.to_string());
        QueryPadError::connection_with_source(message, e)
    })?;
    Ok(())
}

/// Driver message for a failed connection attempt.
fn connect_failure(err: PoolError, config: &ConnectionConfig) -> QueryPadError {
    match err {
        PoolError::Backend(e) => {
            let message = e
                .as_db_error()
                .map(|db| db.message().to_string())
                .unwrap_or_else(|| e.to_string());
            QueryPadError::connection_with_source(message, e)
        }
        PoolError::Timeout(_) => QueryPadError::connection(format!(
            "Timed out connecting to {}:{}",
            config.host, config.port
        )),
        other => QueryPadError::connection(other.to_string()),
    }
}

/// Close connections idle longer than `idle` until the token is cancelled.
fn spawn_idle_reaper(pool: Pool, idle: Duration) -> CancellationToken {
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(idle / 2);
        loop {
            tokio::select! {
                _ = cancelled.cancelled() => break,
                _ = ticker.tick() => {
                    let result = pool.retain(|_, metrics| metrics.last_used() < idle);
                    if !result.removed.is_empty() {
                        tracing::debug!(closed = result.removed.len(), "Closed idle connections");
                    }
                }
            }
        }
    });

    token
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            adapter_type: ADAPTER_TYPE.to_string(),
            name: "PostgreSQL".to_string(),
            icon: "database".to_string(),
        }
    }

    async fn connect(&self, config: &ConnectionConfig, secret: &str) -> Result<()> {
        tracing::debug!(
            connection_id = %config.id,
            host = %config.host,
            port = config.port,
            database = %config.database,
            ssl = config.ssl_enabled,
            "Connecting"
        );

        let pool = build_pool(config, secret, &self.settings)?;
        if let Err(e) = validate_pool(&pool, config).await {
            pool.close();
            tracing::warn!(connection_id = %config.id, error = %e, "Connection failed");
            return Err(e);
        }

        let reaper = self.settings.idle_timeout.map(|idle| spawn_idle_reaper(pool.clone(), idle));
        let previous = self.active.write().replace(ActivePool { pool, reaper });
        if let Some(previous) = previous {
            previous.close();
        }

        tracing::info!(
            connection_id = %config.id,
            host = %config.host,
            database = %config.database,
            max_size = self.settings.max_size,
            "Connection pool created successfully"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let active = self.active.write().take();
        if let Some(active) = active {
            active.close();
            tracing::info!("Connection pool closed");
        }
        Ok(())
    }

    async fn test_connection(&self, config: &ConnectionConfig, secret: &str) -> bool {
        let pool = match build_pool(config, secret, &PoolSettings::probe()) {
            Ok(pool) => pool,
            Err(e) => {
                tracing::debug!(connection_id = %config.id, error = %e, "Connection test setup failed");
                return false;
            }
        };

        let result = validate_pool(&pool, config).await;
        pool.close();

        match result {
            Ok(()) => {
                tracing::debug!(connection_id = %config.id, "Connection test succeeded");
                true
            }
            Err(e) => {
                tracing::debug!(connection_id = %config.id, error = %e, "Connection test failed");
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.active.read().is_some()
    }

    async fn get_databases(&self) -> Result<Vec<DatabaseInfo>> {
        let client = self.client().await?;
        let rows = client.query(sql::DATABASES, &[]).await?;
        rows.iter()
            .map(|row| -> Result<DatabaseInfo> { Ok(DatabaseInfo { name: row.try_get("name")? }) })
            .collect()
    }

    async fn get_schemas(&self, _database: Option<&str>) -> Result<Vec<SchemaInfo>> {
        // A pool is bound to one database; schemas always come from it.
        let client = self.client().await?;
        let rows = client.query(sql::SCHEMAS, &[]).await?;
        rows.iter()
            .map(|row| -> Result<SchemaInfo> { Ok(SchemaInfo { name: row.try_get("name")? }) })
            .collect()
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<TableInfo>> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let client = self.client().await?;
        let rows = client.query(sql::TABLES, &[&schema]).await?;
        rows.iter()
            .map(|row| -> Result<TableInfo> {
                let estimate: Option<i64> = row.try_get("row_count")?;
                Ok(TableInfo {
                    name: row.try_get("name")?,
                    schema: row.try_get("schema")?,
                    // -1 means never analyzed
                    row_count: estimate.filter(|n| *n >= 0),
                })
            })
            .collect()
    }

    async fn get_columns(&self, table: &str, schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let client = self.client().await?;
        let rows = client.query(sql::COLUMNS, &[&schema, &table]).await?;
        rows.iter()
            .map(|row| -> Result<ColumnInfo> {
                Ok(ColumnInfo {
                    name: row.try_get("name")?,
                    data_type: row.try_get("data_type")?,
                    nullable: row.try_get("nullable")?,
                    default_value: row.try_get("default_value")?,
                    is_primary_key: row.try_get("is_primary_key")?,
                })
            })
            .collect()
    }

    async fn get_indexes(&self, table: &str, schema: Option<&str>) -> Result<Vec<IndexInfo>> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let client = self.client().await?;
        let rows = client.query(sql::INDEXES, &[&schema, &table]).await?;
        rows.iter()
            .map(|row| -> Result<IndexInfo> {
                Ok(IndexInfo {
                    name: row.try_get("name")?,
                    columns: row.try_get("columns")?,
                    unique: row.try_get("is_unique")?,
                })
            })
            .collect()
    }

    async fn get_primary_key(&self, table: &str, schema: Option<&str>) -> Result<Vec<String>> {
        let schema = schema.unwrap_or(DEFAULT_SCHEMA);
        let client = self.client().await?;
        let rows = client.query(sql::PRIMARY_KEY, &[&schema, &table]).await?;
        rows.iter().map(|row| -> Result<String> { Ok(row.try_get("column_name")?) }).collect()
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let query_type = QueryType::detect(sql);
        let client = self.client().await?;

        let start = Instant::now();
        let statement = match client.prepare(sql).await {
            Ok(statement) => statement,
            Err(e) if params.is_empty() && is_multi_statement(&e) => {
                return run_script(&client, sql, query_type, start).await;
            }
            Err(e) => return Err(e.into()),
        };
        let bound = bind(params);
        let stream = client
            .query_raw(&statement, bound.iter().map(|p| p as &(dyn ToSql + Sync)))
            .await?;
        pin_mut!(stream);

        let mut rows = Vec::new();
        while let Some(row) = stream.try_next().await? {
            rows.push(row_to_json(&row));
        }
        let execution_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        let affected_rows = match query_type {
            QueryType::Select => None,
            _ => stream.rows_affected(),
        };

        tracing::debug!(
            query_type = ?query_type,
            rows = rows.len(),
            execution_time_ms,
            "Query executed"
        );

        Ok(QueryResult {
            column_names: statement.columns().iter().map(|c| c.name().to_string()).collect(),
            row_count: rows.len(),
            rows,
            affected_rows,
            execution_time_ms,
            query_type,
        })
    }

    async fn get_table_data(
        &self,
        table: &str,
        schema: Option<&str>,
        pagination: &Pagination,
    ) -> Result<TableData> {
        if pagination.limit < 0 || pagination.offset < 0 {
            return Err(QueryPadError::validation("Limit and offset must not be negative"));
        }
        let table_ref = qualified_table(table, schema);

        let (columns, total_count, rows) = tokio::try_join!(
            self.get_columns(table, schema),
            self.count_rows(&table_ref),
            self.fetch_page(&table_ref, pagination),
        )?;

        Ok(TableData { columns, rows, total_count })
    }

    async fn insert_row(&self, table: &str, schema: Option<&str>, values: &RowValues) -> Result<u64> {
        let statement = sql::insert(&qualified_table(table, schema), values);
        self.execute_statement(statement).await
    }

    async fn update_row(
        &self,
        table: &str,
        schema: Option<&str>,
        key: &PrimaryKeyValue,
        values: &RowValues,
    ) -> Result<u64> {
        let table_ref = qualified_table(table, schema);
        if key.is_empty() {
            return Err(QueryPadError::no_primary_key(table_ref));
        }
        if values.is_empty() {
            return Err(QueryPadError::validation("No column values to update"));
        }
        self.execute_statement(sql::update(&table_ref, key, values)).await
    }

    async fn delete_row(
        &self,
        table: &str,
        schema: Option<&str>,
        key: &PrimaryKeyValue,
    ) -> Result<u64> {
        let table_ref = qualified_table(table, schema);
        if key.is_empty() {
            return Err(QueryPadError::no_primary_key(table_ref));
        }
        self.execute_statement(sql::delete(&table_ref, key)).await
    }
}

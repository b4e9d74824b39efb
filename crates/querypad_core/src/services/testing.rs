//! Test doubles: an in-memory adapter plus loopback SSH and echo servers.

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::server::{self, Auth, Msg, Session};
use russh::Channel;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::adapters::{AdapterInfo, DatabaseAdapter};
use crate::error::{QueryPadError, Result};
use crate::models::{
    ColumnInfo, ConnectionConfig, DatabaseInfo, IndexInfo, Pagination, PrimaryKeyValue,
    QueryResult, QueryType, RowValues, SchemaInfo, SshConfig, TableData, TableInfo,
};

/// Secret that the mock rejects.
pub const WRONG_SECRET: &str = "wrong";

/// Adapter backed by canned data.
pub struct MockAdapter {
    connected: AtomicBool,
    probes: AtomicUsize,
    primary_key: Mutex<Vec<String>>,
    mutations: AtomicUsize,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            probes: AtomicUsize::new(0),
            primary_key: Mutex::new(vec!["id".to_string()]),
            mutations: AtomicUsize::new(0),
        }
    }

    /// Adapter whose tables have no primary key.
    pub fn without_primary_key() -> Self {
        let adapter = Self::new();
        adapter.primary_key.lock().clear();
        adapter
    }

    /// Config routed to the mock adapter type.
    pub fn config() -> ConnectionConfig {
        let mut config = ConnectionConfig::new("Mock", "localhost", "app", "tester");
        config.adapter_type = "mock".to_string();
        config
    }

    /// Number of `test_connection` calls seen by this instance.
    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Number of row mutations that reached this instance.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(QueryPadError::NotConnected)
        }
    }

    fn mutate(&self) -> Result<u64> {
        self.ensure_connected()?;
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }
}

#[async_trait]
impl DatabaseAdapter for MockAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            adapter_type: "mock".to_string(),
            name: "Mock".to_string(),
            icon: "mock".to_string(),
        }
    }

    async fn connect(&self, _config: &ConnectionConfig, secret: &str) -> Result<()> {
        if secret == WRONG_SECRET {
            return Err(QueryPadError::connection("password authentication failed"));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn test_connection(&self, _config: &ConnectionConfig, secret: &str) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        secret != WRONG_SECRET
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_databases(&self) -> Result<Vec<DatabaseInfo>> {
        self.ensure_connected()?;
        Ok(vec![DatabaseInfo { name: "app".to_string() }])
    }

    async fn get_schemas(&self, _database: Option<&str>) -> Result<Vec<SchemaInfo>> {
        self.ensure_connected()?;
        Ok(vec![SchemaInfo { name: "public".to_string() }])
    }

    async fn get_tables(&self, schema: Option<&str>) -> Result<Vec<TableInfo>> {
        self.ensure_connected()?;
        Ok(vec![TableInfo {
            name: "users".to_string(),
            schema: schema.unwrap_or("public").to_string(),
            row_count: Some(2),
        }])
    }

    async fn get_columns(&self, _table: &str, _schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
        self.ensure_connected()?;
        let pk = self.primary_key.lock().clone();
        Ok(["id", "name"]
            .iter()
            .map(|name| ColumnInfo {
                name: name.to_string(),
                data_type: if *name == "id" { "integer" } else { "text" }.to_string(),
                nullable: *name != "id",
                default_value: None,
                is_primary_key: pk.iter().any(|k| k == name),
            })
            .collect())
    }

    async fn get_indexes(&self, _table: &str, _schema: Option<&str>) -> Result<Vec<IndexInfo>> {
        self.ensure_connected()?;
        Ok(vec![IndexInfo {
            name: "users_pkey".to_string(),
            columns: vec!["id".to_string()],
            unique: true,
        }])
    }

    async fn get_primary_key(&self, _table: &str, _schema: Option<&str>) -> Result<Vec<String>> {
        self.ensure_connected()?;
        Ok(self.primary_key.lock().clone())
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> Result<QueryResult> {
        self.ensure_connected()?;
        Ok(QueryResult {
            column_names: vec!["?column?".to_string()],
            rows: vec![vec![json!(1)]],
            row_count: 1,
            affected_rows: None,
            execution_time_ms: 0.1,
            query_type: QueryType::detect(sql),
        })
    }

    async fn get_table_data(
        &self,
        table: &str,
        schema: Option<&str>,
        pagination: &Pagination,
    ) -> Result<TableData> {
        let columns = self.get_columns(table, schema).await?;
        let rows = vec![vec![json!(1), json!("ada")], vec![json!(2), json!("grace")]]
            .into_iter()
            .skip(pagination.offset.max(0) as usize)
            .take(pagination.limit.max(0) as usize)
            .collect();
        Ok(TableData { columns, rows, total_count: 2 })
    }

    async fn insert_row(
        &self,
        _table: &str,
        _schema: Option<&str>,
        _values: &RowValues,
    ) -> Result<u64> {
        self.mutate()
    }

    async fn update_row(
        &self,
        table: &str,
        schema: Option<&str>,
        key: &PrimaryKeyValue,
        _values: &RowValues,
    ) -> Result<u64> {
        if key.is_empty() {
            return Err(QueryPadError::no_primary_key(crate::adapters::qualified_table(table, schema)));
        }
        self.mutate()
    }

    async fn delete_row(
        &self,
        table: &str,
        schema: Option<&str>,
        key: &PrimaryKeyValue,
    ) -> Result<u64> {
        if key.is_empty() {
            return Err(QueryPadError::no_primary_key(crate::adapters::qualified_table(table, schema)));
        }
        self.mutate()
    }
}

// ========== Loopback servers ==========

/// User accepted by [`TestSshServer`].
pub const SSH_USER: &str = "deploy";

/// Password accepted by [`TestSshServer`].
pub const SSH_PASSWORD: &str = "tunnel-secret";

/// Poll `condition` for up to five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// SSH server on a loopback port that accepts [`SSH_USER`]/[`SSH_PASSWORD`]
/// and serves `direct-tcpip` channels by dialing the requested endpoint.
pub struct TestSshServer {
    pub port: u16,
    sessions: Arc<AtomicUsize>,
    refuse: Arc<AtomicBool>,
    accept_task: JoinHandle<()>,
}

impl TestSshServer {
    pub async fn start() -> Self {
        let config = Arc::new(server::Config {
            keys: vec![russh_keys::key::KeyPair::generate_ed25519()],
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            ..Default::default()
        });
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let sessions = Arc::new(AtomicUsize::new(0));
        let refuse = Arc::new(AtomicBool::new(false));

        let accept_task = tokio::spawn({
            let sessions = sessions.clone();
            let refuse = refuse.clone();
            async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let config = config.clone();
                    let sessions = sessions.clone();
                    let handler = ForwardingHandler { refuse: refuse.clone() };
                    tokio::spawn(async move {
                        let Ok(session) = server::run_stream(config, socket, handler).await else {
                            return;
                        };
                        sessions.fetch_add(1, Ordering::SeqCst);
                        let _ = session.await;
                        sessions.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        });

        Self { port, sessions, refuse, accept_task }
    }

    /// Client-side config pointing at this server.
    pub fn ssh_config(&self) -> SshConfig {
        SshConfig::new("127.0.0.1", SSH_USER).with_port(self.port)
    }

    /// SSH sessions currently open against this server.
    pub fn live_sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    /// Reject new `direct-tcpip` channels while set.
    pub fn refuse_channels(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

impl Drop for TestSshServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

struct ForwardingHandler {
    refuse: Arc<AtomicBool>,
}

#[async_trait]
impl server::Handler for ForwardingHandler {
    type Error = russh::Error;

    async fn auth_password(
        &mut self,
        user: &str,
        password: &str,
    ) -> std::result::Result<Auth, Self::Error> {
        if user == SSH_USER && password == SSH_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::Reject { proceed_with_methods: None })
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        if self.refuse.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        let Ok(mut upstream) = TcpStream::connect((host_to_connect, port)).await else {
            return Ok(false);
        };
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut upstream).await;
        });
        Ok(true)
    }
}

/// TCP server that writes back whatever it reads.
pub struct EchoServer {
    pub port: u16,
    accept_task: JoinHandle<()>,
}

impl EchoServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept_task = tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        Self { port, accept_task }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

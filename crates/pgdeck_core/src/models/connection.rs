//! Connection keys, requests and per-server metadata.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Registry key of a connection inside a server manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionKey {
    /// Explicit connection id (query tool, long-running operations).
    Conn(u64),
    /// Shared connection to a database.
    Db(String),
}

impl ConnectionKey {
    /// Key for a request: an explicit connection id wins over the database.
    pub fn for_request(conn_id: Option<u64>, database: &str) -> Self {
        match conn_id {
            Some(id) => Self::Conn(id),
            None => Self::Db(database.to_string()),
        }
    }

    /// Whether this is an explicit connection id.
    pub fn is_explicit(&self) -> bool {
        matches!(self, Self::Conn(_))
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conn(id) => write!(f, "CONN:{id}"),
            Self::Db(name) => write!(f, "DB:{name}"),
        }
    }
}

impl FromStr for ConnectionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(id) = s.strip_prefix("CONN:") {
            return id
                .parse()
                .map(Self::Conn)
                .map_err(|e| format!("Invalid connection id in key {s:?}: {e}"));
        }
        if let Some(name) = s.strip_prefix("DB:") {
            return Ok(Self::Db(name.to_string()));
        }
        Err(format!("Unknown connection key {s:?}"))
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Unconnected,
    /// Live session.
    Connected,
    /// Was connected once, session gone now.
    Lost,
}

/// Per-connection flags fixed when the connection is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionFlags {
    /// Reconnect automatically when state is restored.
    pub auto_reconnect: bool,
    /// Connection runs asynchronous (cancellable) statements.
    pub asynchronous: bool,
    /// Use binary placeholders when rendering parameters.
    pub use_binary_placeholder: bool,
    /// Fetch arrays as strings.
    pub array_to_string: bool,
}

impl Default for ConnectionFlags {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            asynchronous: false,
            use_binary_placeholder: false,
            array_to_string: false,
        }
    }
}

/// Arguments to [`ServerManager::connection`](crate::services::ServerManager::connection).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    /// Target database name.
    pub database: Option<String>,
    /// Explicit connection id.
    pub conn_id: Option<u64>,
    /// Target database oid, resolved through the metadata cache.
    pub did: Option<u32>,
    /// Reconnect on restore.
    pub auto_reconnect: bool,
    /// Asynchronous flag; defaults to `true` for explicit connection ids.
    pub asynchronous: Option<bool>,
    /// Use binary placeholders.
    pub use_binary_placeholder: bool,
    /// Fetch arrays as strings.
    pub array_to_string: bool,
}

impl Default for ConnectionRequest {
    fn default() -> Self {
        Self {
            database: None,
            conn_id: None,
            did: None,
            auto_reconnect: true,
            asynchronous: None,
            use_binary_placeholder: false,
            array_to_string: false,
        }
    }
}

impl ConnectionRequest {
    /// Request the shared connection to a database.
    pub fn database(database: impl Into<String>) -> Self {
        Self { database: Some(database.into()), ..Default::default() }
    }

    /// Request the connection to a database identified by oid.
    pub fn did(did: u32) -> Self {
        Self { did: Some(did), ..Default::default() }
    }

    /// Request an explicit connection id.
    pub fn with_conn_id(mut self, conn_id: u64) -> Self {
        self.conn_id = Some(conn_id);
        self
    }

    /// Set the auto-reconnect policy.
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    /// Force the asynchronous flag.
    pub fn with_async(mut self, asynchronous: bool) -> Self {
        self.asynchronous = Some(asynchronous);
        self
    }

    /// Enable binary placeholders.
    pub fn with_binary_placeholder(mut self) -> Self {
        self.use_binary_placeholder = true;
        self
    }

    /// Enable array-to-string conversion.
    pub fn with_array_to_string(mut self) -> Self {
        self.array_to_string = true;
        self
    }

    /// Flags for a connection created from this request.
    pub fn flags(&self) -> ConnectionFlags {
        ConnectionFlags {
            auto_reconnect: self.auto_reconnect,
            asynchronous: self.asynchronous.unwrap_or(self.conn_id.is_some()),
            use_binary_placeholder: self.use_binary_placeholder,
            array_to_string: self.array_to_string,
        }
    }
}

/// Arguments to [`ServerManager::release`](crate::services::ServerManager::release).
///
/// The default value releases everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub database: Option<String>,
    pub conn_id: Option<u64>,
    pub did: Option<u32>,
}

impl ReleaseRequest {
    /// Release every connection and the tunnel.
    pub fn all() -> Self {
        Self::default()
    }

    /// Release the shared connection to a database.
    pub fn database(database: impl Into<String>) -> Self {
        Self { database: Some(database.into()), ..Default::default() }
    }

    /// Release an explicit connection id.
    pub fn conn_id(conn_id: u64) -> Self {
        Self { conn_id: Some(conn_id), ..Default::default() }
    }

    /// Release the connection to a database identified by oid.
    pub fn did(did: u32) -> Self {
        Self { did: Some(did), ..Default::default() }
    }

    /// Whether this request targets everything.
    pub fn is_all(&self) -> bool {
        self.database.is_none() && self.conn_id.is_none() && self.did.is_none()
    }
}

/// One row of a simple (text protocol) query, in column order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextRow {
    columns: Vec<(String, Option<String>)>,
}

impl TextRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a column.
    pub fn push(&mut self, name: impl Into<String>, value: Option<String>) {
        self.columns.push((name.into(), value));
    }

    /// Value of a named column; `None` when missing or NULL.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.columns.iter().find(|(n, _)| n == name).and_then(|(_, v)| v.as_deref())
    }

    /// Value of the first column.
    pub fn first(&self) -> Option<&str> {
        self.columns.first().and_then(|(_, v)| v.as_deref())
    }

    /// Columns in order.
    pub fn columns(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns.iter().map(|(n, v)| (n.as_str(), v.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl<N: Into<String>> FromIterator<(N, Option<String>)> for TextRow {
    fn from_iter<I: IntoIterator<Item = (N, Option<String>)>>(iter: I) -> Self {
        Self { columns: iter.into_iter().map(|(n, v)| (n.into(), v)).collect() }
    }
}

/// Cached `pg_database` row for one database oid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub did: u32,
    pub datname: String,
    pub datallowconn: bool,
    pub serverencoding: Option<String>,
    pub cancreate: bool,
    pub datlastsysoid: Option<u32>,
}

impl DatabaseInfo {
    /// Build from a `pg_database` text row.
    pub fn from_row(row: &TextRow) -> Option<Self> {
        let text = |name: &str| row.get(name);
        let flag = |name: &str| matches!(text(name), Some("t") | Some("true"));

        Some(Self {
            did: text("did")?.parse().ok()?,
            datname: text("datname")?.to_string(),
            datallowconn: flag("datallowconn"),
            serverencoding: text("serverencoding").map(String::from),
            cancreate: flag("cancreate"),
            datlastsysoid: text("datlastsysoid").and_then(|v| v.parse().ok()),
        })
    }
}

/// Server flavour, detected from the version string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerType {
    /// Community PostgreSQL.
    #[serde(rename = "pg")]
    Postgres,
    /// EDB Postgres Advanced Server.
    #[serde(rename = "ppas")]
    EnterpriseDb,
}

impl ServerType {
    /// Detect the server type from `SELECT version()` output.
    pub fn from_version_string(ver: &str) -> Self {
        if ver.contains("EnterpriseDB") || ver.contains("EDB Advanced Server") {
            Self::EnterpriseDb
        } else {
            Self::Postgres
        }
    }

    /// Short type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "pg",
            Self::EnterpriseDb => "ppas",
        }
    }

    /// Binary name of a server utility for this server type.
    pub fn utility(&self, operation: UtilityOperation) -> &'static str {
        match (self, operation) {
            (_, UtilityOperation::Backup) => "pg_dump",
            (_, UtilityOperation::BackupServer) => "pg_dumpall",
            (_, UtilityOperation::Restore) => "pg_restore",
            (Self::Postgres, UtilityOperation::Sql) => "psql",
            (Self::EnterpriseDb, UtilityOperation::Sql) => "edb-psql",
        }
    }
}

/// Operations that run an external server utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UtilityOperation {
    Backup,
    BackupServer,
    Restore,
    Sql,
}

/// Version information of the connected server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Full version string.
    pub ver: String,
    /// Numeric version (`server_version_num`).
    pub sversion: u32,
    /// Detected server type.
    pub server_type: ServerType,
}

impl ServerInfo {
    /// Build from version string and number.
    pub fn new(ver: impl Into<String>, sversion: u32) -> Self {
        let ver = ver.into();
        let server_type = ServerType::from_version_string(&ver);
        Self { ver, sversion, server_type }
    }

    pub fn major(&self) -> u32 {
        self.sversion / 10000
    }

    pub fn minor(&self) -> u32 {
        (self.sversion / 100) % 100
    }

    pub fn patch(&self) -> u32 {
        self.sversion % 100
    }
}

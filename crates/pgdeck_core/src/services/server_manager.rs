//! Per-server registry of connections.
//!
//! A [`ServerManager`] owns every [`Connection`] to one server for one session, the
//! server's version information, a cache of `pg_database` rows and the SSH tunnel.
//! Its state survives between requests as a [`ManagerSnapshot`].

use super::connection::{Connection, ManagerContext};
use super::Services;
use crate::error::{PgDeckError, PgDeckResult};
use crate::models::{
    ConnectionFlags, ConnectionKey, ConnectionRequest, ConnectionSnapshot, DatabaseInfo,
    ManagerSnapshot, ReleaseRequest, Secret, ServerId, ServerIdentity, ServerInfo, ServerType,
    UtilityOperation, SNAPSHOT_VERSION,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Connection registry and server state for one server.
pub struct ServerManager {
    context: Arc<ManagerContext>,
    connections: BTreeMap<ConnectionKey, Arc<Connection>>,
    databases: HashMap<u32, DatabaseInfo>,
    last_touched: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for ServerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerManager")
            .field("sid", &self.context.sid)
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .field("server_info", &*self.context.server_info.read())
            .finish()
    }
}

/// First server version without `pg_database.datlastsysoid`.
const NO_DATLASTSYSOID_VERSION: u32 = 150000;

fn database_query(did: u32, sversion: u32) -> String {
    let lastsysoid = if sversion >= NO_DATLASTSYSOID_VERSION {
        "NULL::oid AS datlastsysoid"
    } else {
        "db.datlastsysoid"
    };
    format!(
        "SELECT db.oid as did, db.datname, db.datallowconn, \
         pg_encoding_to_char(db.encoding) AS serverencoding, \
         has_database_privilege(db.oid, 'CREATE') as cancreate, {lastsysoid} \
         FROM pg_database db WHERE db.oid = {did}"
    )
}

impl ServerManager {
    /// Create a manager for a server.
    pub fn new(identity: ServerIdentity, services: Services) -> Self {
        tracing::debug!(server_id = identity.id, "Server manager created");
        Self {
            context: Arc::new(ManagerContext::new(identity, services)),
            connections: BTreeMap::new(),
            databases: HashMap::new(),
            last_touched: None,
        }
    }

    /// Server id.
    pub fn sid(&self) -> ServerId {
        self.context.sid
    }

    /// Current identity.
    pub fn identity(&self) -> Arc<ServerIdentity> {
        self.context.identity()
    }

    /// Replace the identity and drop everything derived from the old one.
    pub async fn update(&mut self, identity: ServerIdentity) {
        tracing::info!(server_id = self.sid(), "Updating server identity");

        for connection in self.connections.values() {
            connection.release();
        }
        self.connections.clear();
        self.databases.clear();
        self.context.tunnel.lock().await.stop();

        *self.context.server_info.write() = None;
        *self.context.password.write() = identity.password.clone();
        *self.context.tunnel_password.write() =
            identity.tunnel.as_ref().and_then(|t| t.password.clone());
        *self.context.identity.write() = Arc::new(identity);
    }

    /// Get or register the connection for a request.
    pub async fn connection(
        &mut self,
        request: ConnectionRequest,
    ) -> PgDeckResult<Arc<Connection>> {
        let database = self.resolve_database(&request).await?;

        if self.context.has_secrets() && self.context.services.secrets.crypt_key().is_none() {
            return Err(PgDeckError::CryptKeyMissing);
        }

        let database = match database {
            Some(database) => database,
            None => {
                let identity = self.identity();
                if let Some(tunnel_host) = self.context.tunnel_host(&identity) {
                    self.context.tunnel.lock().await.check_alive(&tunnel_host)?;
                }
                return Err(PgDeckError::connection_lost(
                    self.sid(),
                    None,
                    request.conn_id.map(|id| id.to_string()),
                ));
            }
        };

        let key = ConnectionKey::for_request(request.conn_id, &database);
        self.last_touched = Some(Utc::now());
        Ok(self.register(key, &database, request.flags(), false))
    }

    /// Resolve the target database name of a request.
    async fn resolve_database(
        &mut self,
        request: &ConnectionRequest,
    ) -> PgDeckResult<Option<String>> {
        if let Some(ref database) = request.database {
            if let Some(info) = request.did.and_then(|did| self.databases.get_mut(&did)) {
                info.datname = database.clone();
            }
            return Ok(Some(database.clone()));
        }

        let Some(did) = request.did else {
            return Ok(self.identity().maintenance_database().map(String::from));
        };

        if let Some(info) = self.databases.get(&did) {
            return Ok(Some(info.datname.clone()));
        }

        let Some(maintenance) = self.identity().maintenance_database().map(String::from) else {
            return Ok(None);
        };

        let conn = self.register(
            ConnectionKey::Db(maintenance.clone()),
            &maintenance,
            ConnectionFlags::default(),
            false,
        );
        if !conn.connected() {
            conn.connect(None).await?;
        }

        let sversion = self.server_version()?;
        let rows = conn.execute_dict(&database_query(did, sversion)).await?;
        let info = rows
            .first()
            .and_then(DatabaseInfo::from_row)
            .ok_or(PgDeckError::DatabaseNotFound { did })?;

        tracing::debug!(server_id = self.sid(), did, database = %info.datname, "Database resolved");
        let name = info.datname.clone();
        self.databases.insert(did, info);
        Ok(Some(name))
    }

    fn register(
        &mut self,
        key: ConnectionKey,
        database: &str,
        flags: ConnectionFlags,
        was_connected: bool,
    ) -> Arc<Connection> {
        let context = &self.context;
        self.connections
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(server_id = context.sid, conn_key = %key, "Connection registered");
                Arc::new(Connection::new(key, database, flags, was_connected, context.clone()))
            })
            .clone()
    }

    /// Registered connection for a key.
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Connection>> {
        self.connections.get(key).cloned()
    }

    /// Registered keys in order.
    pub fn keys(&self) -> Vec<ConnectionKey> {
        self.connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Cached `pg_database` row.
    pub fn database_info(&self, did: u32) -> Option<&DatabaseInfo> {
        self.databases.get(&did)
    }

    /// Release one connection, or everything when the request is empty.
    ///
    /// Returns whether anything was released.
    pub async fn release(&mut self, request: ReleaseRequest) -> PgDeckResult<bool> {
        if request.is_all() {
            for (key, connection) in &self.connections {
                if key.is_explicit() && connection.connected() {
                    if let Err(e) = connection.cancel_transaction().await {
                        tracing::warn!(
                            server_id = self.sid(),
                            conn_key = %key,
                            error = %e,
                            "Cancel failed"
                        );
                    }
                }
                connection.release();
            }
            self.connections.clear();
            self.clear_server_state().await;
            tracing::info!(server_id = self.sid(), "All connections released");
            return Ok(true);
        }

        let database = match request.did {
            Some(did) => match self.databases.get(&did) {
                Some(info) => Some(info.datname.clone()),
                None => return Ok(false),
            },
            None => request.database.clone(),
        };

        let key = match (request.conn_id, database) {
            (Some(id), _) => ConnectionKey::Conn(id),
            (None, Some(database)) => ConnectionKey::Db(database),
            (None, None) => return Ok(false),
        };

        let Some(connection) = self.connections.remove(&key) else {
            return Ok(false);
        };
        connection.release();
        if let Some(did) = request.did {
            self.databases.remove(&did);
        }
        tracing::debug!(server_id = self.sid(), conn_key = %key, "Connection released");

        if self.connections.is_empty() {
            self.clear_server_state().await;
        }
        Ok(true)
    }

    async fn clear_server_state(&mut self) {
        self.databases.clear();
        *self.context.server_info.write() = None;
        *self.context.password.write() = None;
        self.context.tunnel.lock().await.stop();
    }

    /// Rebuild the registry from a snapshot and reconnect what was connected.
    ///
    /// Connections are visited in key order. A connection that cannot reconnect because
    /// the crypt key is missing stays registered with its flags. Any other failure
    /// removes that connection and returns the error; connections restored earlier in
    /// the same call are kept.
    pub async fn restore(&mut self, snapshot: &ManagerSnapshot) -> PgDeckResult<()> {
        snapshot.check_version()?;
        let entries = snapshot.entries()?;

        if !snapshot.ver.is_empty() {
            *self.context.server_info.write() =
                Some(ServerInfo::new(snapshot.ver.clone(), snapshot.sversion));
        }
        if self.context.services.config.store_secrets_in_session {
            if let Some(ref password) = snapshot.password {
                *self.context.password.write() = Some(password.clone());
            }
            if let Some(ref tunnel_password) = snapshot.tunnel_password {
                *self.context.tunnel_password.write() = Some(tunnel_password.clone());
            }
        }

        tracing::debug!(
            server_id = self.sid(),
            connections = entries.len(),
            "Restoring server manager"
        );

        for (key, saved) in entries {
            let connection =
                self.register(key.clone(), &saved.database, saved.flags(), saved.was_connected);
            if !(saved.was_connected && saved.auto_reconnect) || connection.connected() {
                continue;
            }

            match connection.connect(None).await {
                Ok(()) => {}
                Err(PgDeckError::CryptKeyMissing) => {
                    tracing::debug!(
                        server_id = self.sid(),
                        conn_key = %key,
                        "Crypt key missing, keeping connection"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        server_id = self.sid(),
                        conn_key = %key,
                        error = %e,
                        "Restore failed"
                    );
                    if let Some(connection) = self.connections.remove(&key) {
                        connection.release();
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Reconnect every connection that was connected and allows auto-reconnect.
    ///
    /// Used once the crypt key becomes available. Stops at the first hard failure.
    pub async fn restore_connections(&mut self) -> PgDeckResult<()> {
        for (key, connection) in &self.connections {
            let wanted = connection.was_connected() && connection.auto_reconnect();
            if !wanted || connection.connected() {
                continue;
            }
            match connection.connect(None).await {
                Ok(()) | Err(PgDeckError::CryptKeyMissing) => {}
                Err(e) => {
                    tracing::warn!(
                        server_id = self.sid(),
                        conn_key = %key,
                        error = %e,
                        "Reconnect failed"
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Snapshot of the registry; `None` when the server version is unknown or nothing is
    /// registered.
    pub fn snapshot(&self) -> Option<ManagerSnapshot> {
        let info = self.context.server_info.read().clone()?;
        if self.connections.is_empty() {
            return None;
        }

        let connections = self
            .connections
            .iter()
            .map(|(key, connection)| {
                let flags = connection.flags();
                let conn_id = match key {
                    ConnectionKey::Conn(id) => Some(*id),
                    ConnectionKey::Db(_) => None,
                };
                let saved = ConnectionSnapshot {
                    conn_id,
                    database: connection.database().to_string(),
                    auto_reconnect: flags.auto_reconnect,
                    asynchronous: flags.asynchronous,
                    use_binary_placeholder: flags.use_binary_placeholder,
                    array_to_string: flags.array_to_string,
                    was_connected: connection.was_connected(),
                };
                (key.to_string(), saved)
            })
            .collect();

        let store_secrets = self.context.services.config.store_secrets_in_session;
        Some(ManagerSnapshot {
            version: SNAPSHOT_VERSION,
            sid: self.sid(),
            ver: info.ver,
            sversion: info.sversion,
            password: store_secrets.then(|| self.context.password.read().clone()).flatten(),
            tunnel_password: store_secrets
                .then(|| self.context.tunnel_password.read().clone())
                .flatten(),
            connections,
        })
    }

    // ========== Server info ==========

    /// Version information, once known.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.context.server_info.read().clone()
    }

    fn require_info(&self) -> PgDeckResult<ServerInfo> {
        self.server_info().ok_or(PgDeckError::ServerVersionUnavailable)
    }

    pub fn server_version(&self) -> PgDeckResult<u32> {
        Ok(self.require_info()?.sversion)
    }

    pub fn major_version(&self) -> PgDeckResult<u32> {
        Ok(self.require_info()?.major())
    }

    pub fn minor_version(&self) -> PgDeckResult<u32> {
        Ok(self.require_info()?.minor())
    }

    pub fn patch_version(&self) -> PgDeckResult<u32> {
        Ok(self.require_info()?.patch())
    }

    pub fn server_type(&self) -> PgDeckResult<ServerType> {
        Ok(self.require_info()?.server_type)
    }

    /// Binary name of a server utility, e.g. `pg_dump`.
    pub fn utility(&self, operation: UtilityOperation) -> PgDeckResult<&'static str> {
        Ok(self.server_type()?.utility(operation))
    }

    // ========== Secrets ==========

    /// Replace the stored password; every connection picks it up on its next connect.
    pub fn update_password(&mut self, password: Secret) {
        *self.context.password.write() = Some(password);
    }

    /// The stored password in clear text, for handing to a background job.
    pub fn decrypted_password(&self) -> PgDeckResult<Option<String>> {
        let password = self.context.password.read().clone();
        password
            .map(|secret| self.context.services.secrets.decrypt_with_session_key(&secret))
            .transpose()
    }

    /// When `connection()` last handed out a connection.
    pub fn last_touched(&self) -> Option<DateTime<Utc>> {
        self.last_touched
    }

    /// Local port of the tunnel, when one is up.
    pub async fn tunnel_port(&self) -> Option<u16> {
        self.context.tunnel.lock().await.local_bind_port()
    }
}

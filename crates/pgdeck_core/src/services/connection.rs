//! One logical connection to one database of a server.
//!
//! A [`Connection`] is created by its [`ServerManager`](super::ServerManager) and shares
//! the manager's context: identity, secrets, cached server version and the tunnel.
//! It opens its session lazily and can be released and reopened any number of times.

use super::driver::{ConnectParams, DatabaseSession};
use super::tunnel::TunnelController;
use super::Services;
use crate::error::{PgDeckError, PgDeckResult};
use crate::models::{
    ConnectionFlags, ConnectionKey, ConnectionState, Secret, ServerId, ServerIdentity, ServerInfo,
    TextRow,
};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State shared by a server manager and all of its connections.
pub(crate) struct ManagerContext {
    pub(crate) sid: ServerId,
    pub(crate) identity: RwLock<Arc<ServerIdentity>>,
    pub(crate) password: RwLock<Option<Secret>>,
    pub(crate) tunnel_password: RwLock<Option<Secret>>,
    pub(crate) server_info: RwLock<Option<ServerInfo>>,
    pub(crate) tunnel: tokio::sync::Mutex<TunnelController>,
    pub(crate) services: Services,
}

impl ManagerContext {
    pub(crate) fn new(identity: ServerIdentity, services: Services) -> Self {
        let tunnel = TunnelController::new(services.forwarder.clone(), services.secrets.clone());
        Self {
            sid: identity.id,
            password: RwLock::new(identity.password.clone()),
            tunnel_password: RwLock::new(identity.tunnel.as_ref().and_then(|t| t.password.clone())),
            identity: RwLock::new(Arc::new(identity)),
            server_info: RwLock::new(None),
            tunnel: tokio::sync::Mutex::new(tunnel),
            services,
        }
    }

    pub(crate) fn identity(&self) -> Arc<ServerIdentity> {
        self.identity.read().clone()
    }

    /// Tunnel host, when tunneling is configured and enabled.
    pub(crate) fn tunnel_host(&self, identity: &ServerIdentity) -> Option<String> {
        if !self.services.config.support_ssh_tunnel {
            return None;
        }
        identity.tunnel.as_ref().map(|t| t.host.clone())
    }

    /// Whether any stored secret would need the decryption key.
    pub(crate) fn has_secrets(&self) -> bool {
        self.password.read().is_some() || self.tunnel_password.read().is_some()
    }
}

/// A connection registered with a server manager.
pub struct Connection {
    key: ConnectionKey,
    database: String,
    flags: ConnectionFlags,
    context: Arc<ManagerContext>,
    session: Mutex<Option<Arc<dyn DatabaseSession>>>,
    was_connected: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("database", &self.database)
            .field("flags", &self.flags)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        key: ConnectionKey,
        database: impl Into<String>,
        flags: ConnectionFlags,
        was_connected: bool,
        context: Arc<ManagerContext>,
    ) -> Self {
        Self {
            key,
            database: database.into(),
            flags,
            context,
            session: Mutex::new(None),
            was_connected: AtomicBool::new(was_connected),
        }
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn flags(&self) -> ConnectionFlags {
        self.flags
    }

    pub fn auto_reconnect(&self) -> bool {
        self.flags.auto_reconnect
    }

    pub fn is_async(&self) -> bool {
        self.flags.asynchronous
    }

    /// Whether this connection ever connected successfully.
    pub fn was_connected(&self) -> bool {
        self.was_connected.load(Ordering::SeqCst)
    }

    /// Whether a live session is held. Cheap and side-effect free.
    pub fn connected(&self) -> bool {
        self.session.lock().as_ref().is_some_and(|s| !s.is_closed())
    }

    pub fn state(&self) -> ConnectionState {
        if self.connected() {
            ConnectionState::Connected
        } else if self.was_connected() {
            ConnectionState::Lost
        } else {
            ConnectionState::Unconnected
        }
    }

    /// Open the session.
    ///
    /// With a tunnel configured, the tunnel is created (if needed) and checked before the
    /// driver is touched. `password` overrides the manager's stored password and is
    /// adopted by the manager on success.
    pub async fn connect(&self, password: Option<&Secret>) -> PgDeckResult<()> {
        if self.connected() {
            return Ok(());
        }

        let context = &self.context;
        let identity = context.identity();

        let tunnel_port = match context.tunnel_host(&identity) {
            Some(tunnel_host) => Some(self.ensure_tunnel(&identity, &tunnel_host).await?),
            None => None,
        };

        let secret = password.cloned().or_else(|| context.password.read().clone());
        let password_text = match secret {
            Some(ref secret) => Some(context.services.secrets.decrypt_with_session_key(secret)?),
            None => None,
        };

        let params = ConnectParams::for_identity(
            &identity,
            &self.database,
            password_text,
            tunnel_port,
            &context.services.config,
        );

        tracing::debug!(
            server_id = context.sid,
            conn_key = %self.key,
            database = %self.database,
            tunneled = tunnel_port.is_some(),
            "Connecting"
        );

        let session = context.services.driver.connect(&params).await.map_err(|e| {
            tracing::warn!(
                server_id = context.sid,
                conn_key = %self.key,
                error = %e,
                "Connection attempt failed"
            );
            e
        })?;

        let known = context.server_info.read().is_some();
        if !known {
            let info = session.server_info().await?;
            tracing::info!(
                server_id = context.sid,
                version = %info.ver,
                sversion = info.sversion,
                server_type = info.server_type.as_str(),
                "Server version recorded"
            );
            *context.server_info.write() = Some(info);
        }

        *self.session.lock() = Some(session);
        self.was_connected.store(true, Ordering::SeqCst);
        if let Some(secret) = password {
            *context.password.write() = Some(secret.clone());
        }

        tracing::info!(server_id = context.sid, conn_key = %self.key, "Connected");
        Ok(())
    }

    /// Create the tunnel if necessary, check it, and return its local port.
    async fn ensure_tunnel(
        &self,
        identity: &ServerIdentity,
        tunnel_host: &str,
    ) -> PgDeckResult<u16> {
        let mut tunnel = self.context.tunnel.lock().await;

        if !tunnel.is_created() {
            let tunnel_password = self.context.tunnel_password.read().clone();
            if let Err(e) = tunnel.create(identity, tunnel_password.as_ref()).await {
                return Err(match e {
                    PgDeckError::CryptKeyMissing => e,
                    other => PgDeckError::tunnel_lost_with_message(tunnel_host, other.to_string()),
                });
            }
        }

        tunnel.check_alive(tunnel_host)?;
        tunnel.local_bind_port().ok_or_else(|| PgDeckError::tunnel_lost(tunnel_host))
    }

    /// Drop the session. Idempotent.
    pub fn release(&self) {
        if let Some(session) = self.session.lock().take() {
            session.close();
            tracing::debug!(server_id = self.context.sid, conn_key = %self.key, "Released");
        }
    }

    fn live_session(&self) -> PgDeckResult<Arc<dyn DatabaseSession>> {
        match self.session.lock().as_ref() {
            Some(session) if !session.is_closed() => Ok(session.clone()),
            _ => Err(self.lost()),
        }
    }

    fn lost(&self) -> PgDeckError {
        let conn_id = match self.key {
            ConnectionKey::Conn(id) => Some(id.to_string()),
            ConnectionKey::Db(_) => None,
        };
        PgDeckError::connection_lost(self.context.sid, Some(self.database.clone()), conn_id)
    }

    /// First column of the first row, if any.
    pub async fn execute_scalar(&self, sql: &str) -> PgDeckResult<Option<String>> {
        let rows = self.execute_dict(sql).await?;
        Ok(rows.first().and_then(|row| row.first()).map(String::from))
    }

    /// All rows as text.
    pub async fn execute_dict(&self, sql: &str) -> PgDeckResult<Vec<TextRow>> {
        let session = self.live_session()?;
        match session.simple_query(sql).await {
            Ok(rows) => Ok(rows),
            Err(_) if session.is_closed() => Err(self.lost()),
            Err(e) => Err(e),
        }
    }

    /// Cancel the statement running on this connection, if any.
    pub async fn cancel_transaction(&self) -> PgDeckResult<()> {
        let session = self.session.lock().clone();
        if let Some(session) = session {
            session.cancel().await?;
            tracing::debug!(server_id = self.context.sid, conn_key = %self.key, "Cancel sent");
        }
        Ok(())
    }
}

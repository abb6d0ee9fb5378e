//! Backend services for pgdeck.
//!
//! - `driver` - Database driver seam and the tokio-postgres implementation
//! - `tunnel` - SSH tunnel controller and the russh forwarder
//! - `connection` - One connection to one database
//! - `server_manager` - Per-server connection registry with snapshot/restore
//! - `secrets` - Decryption of stored passwords
//! - `session_store` - Per-session key/value store

pub mod connection;
pub mod driver;
pub mod secrets;
pub mod server_manager;
pub mod session_store;
pub mod tunnel;

#[cfg(test)]
pub(crate) mod test_support;

pub use connection::Connection;
pub use driver::{ConnectParams, DatabaseDriver, DatabaseSession, PostgresDriver};
pub use secrets::{CryptKey, MasterKeySecrets, SecretService};
pub use server_manager::ServerManager;
pub use session_store::{MemorySessionStore, SessionStore};
pub use tunnel::{ActiveTunnel, ForwardSpec, SshForwarder, TunnelController, TunnelForwarder};

use crate::config::ConsoleConfig;
use std::sync::Arc;

/// Collaborators shared by every server manager.
#[derive(Clone)]
pub struct Services {
    pub driver: Arc<dyn DatabaseDriver>,
    pub forwarder: Arc<dyn TunnelForwarder>,
    pub secrets: Arc<dyn SecretService>,
    pub config: Arc<ConsoleConfig>,
}

impl Services {
    /// The production stack: tokio-postgres, russh and master-key secrets.
    pub fn production(config: ConsoleConfig, secrets: Arc<MasterKeySecrets>) -> Self {
        Self {
            driver: Arc::new(PostgresDriver::new()),
            forwarder: Arc::new(SshForwarder::new()),
            secrets,
            config: Arc::new(config),
        }
    }
}

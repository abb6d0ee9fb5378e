//! Data models for pgdeck.
//!
//! - `server` - ServerIdentity, Secret, SSL and SSH tunnel settings
//! - `connection` - ConnectionKey, connection/release requests, ServerInfo
//! - `snapshot` - Versioned session snapshots

pub mod connection;
pub mod server;
pub mod snapshot;

pub use connection::{
    ConnectionFlags, ConnectionKey, ConnectionRequest, ConnectionState, DatabaseInfo,
    ReleaseRequest, ServerInfo, ServerType, TextRow, UtilityOperation,
};
pub use server::{
    Secret, ServerId, ServerIdentity, ServerIdentityBuilder, SslMode, SslSettings, TunnelAuth,
    TunnelSettings,
};
pub use snapshot::{
    ConnectionSnapshot, ManagerSnapshot, SessionSnapshot, SESSION_STORE_KEY, SNAPSHOT_VERSION,
};

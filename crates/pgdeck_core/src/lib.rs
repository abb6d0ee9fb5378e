//! Core of the pgdeck PostgreSQL console.
//!
//! This crate provides the backend service layer for pgdeck:
//!
//! - **error**: Error handling with PostgreSQL-specific details
//! - **models**: Server identities, connection keys and session snapshots
//! - **services**: Server managers, connections, SSH tunnels, secrets
//! - **process**: Detached background jobs and their on-disk status
//! - **state**: Session registry shared by all requests
//! - **config**: Console configuration
//! - **logging**: Structured logging setup

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod process;
pub mod services;
pub mod state;

pub use config::ConsoleConfig;
pub use error::{ErrorInfo, PgDeckError, PgDeckResult};
pub use models::{
    ConnectionKey, ConnectionRequest, ConnectionState, ManagerSnapshot, ReleaseRequest, Secret,
    ServerId, ServerIdentity, ServerInfo, ServerType, SessionSnapshot, SslMode, TunnelSettings,
};
pub use process::{BackgroundJob, JobLauncher, JobRequest, JobStatus};
pub use services::{
    Connection, MasterKeySecrets, MemorySessionStore, SecretService, ServerManager, Services,
    SessionStore,
};
pub use state::{ConsoleState, SessionId, SessionManagers};

//! Error types for pgdeck.
//!
//! The connection layer raises typed errors and lets the request handler decide how to
//! surface them: a missing master key needs a password prompt, a lost tunnel needs a
//! tunnel credential prompt, a lost connection needs a reconnect.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type PgDeckResult<T> = Result<T, PgDeckError>;

/// Main error type for pgdeck.
#[derive(Debug, Error)]
pub enum PgDeckError {
    /// The secret-decryption key is not available in this session.
    #[error("Crypt key is missing")]
    CryptKeyMissing,

    /// No viable path to a database connection exists.
    #[error("Connection to server {server_id} lost")]
    ConnectionLost {
        /// Server the connection belonged to.
        server_id: i32,
        /// Database name, if one was resolved.
        database: Option<String>,
        /// Explicit connection id, if any.
        conn_id: Option<String>,
    },

    /// The SSH tunnel was expected to be alive but is not.
    #[error("SSH tunnel to {tunnel_host} lost")]
    SshTunnelConnectionLost {
        /// Tunnel host.
        tunnel_host: String,
        /// Underlying failure, when known.
        message: Option<String>,
    },

    /// Database connection failed.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Authentication failed.
    #[error("Authentication error: {message}")]
    Authentication {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
    },

    /// SSH tunnel setup error.
    #[error("SSH error: {message}")]
    Ssh {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Query execution error with PostgreSQL-specific details.
    #[error("{message}")]
    Query {
        /// PostgreSQL error message.
        message: String,
        /// Additional detail from PostgreSQL.
        detail: Option<String>,
        /// PostgreSQL hint.
        hint: Option<String>,
        /// PostgreSQL error code (e.g., "42P01").
        code: Option<String>,
    },

    /// A database oid could not be resolved to a name.
    #[error("Could not find the specified database (oid {did})")]
    DatabaseNotFound {
        /// Database oid that was looked up.
        did: u32,
    },

    /// Server version requested before any connection succeeded.
    #[error("Server version information is not available")]
    ServerVersionUnavailable,

    /// Local file or session-state storage error.
    #[error("Storage error: {message}")]
    Storage {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the user.
        hint: Option<String>,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration error.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// Background process launch or supervision error.
    #[error("Process error: {message}")]
    Process {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error source.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
    },
}

impl PgDeckError {
    // ========== Constructors ==========

    /// Create a connection-lost error.
    pub fn connection_lost(
        server_id: i32,
        database: Option<String>,
        conn_id: Option<String>,
    ) -> Self {
        Self::ConnectionLost { server_id, database, conn_id }
    }

    /// Create a tunnel-lost error.
    pub fn tunnel_lost(tunnel_host: impl Into<String>) -> Self {
        Self::SshTunnelConnectionLost { tunnel_host: tunnel_host.into(), message: None }
    }

    /// Create a tunnel-lost error carrying the failure that caused it.
    pub fn tunnel_lost_with_message(
        tunnel_host: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::SshTunnelConnectionLost {
            tunnel_host: tunnel_host.into(),
            message: Some(message.into()),
        }
    }

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new authentication error with custom hint.
    pub fn authentication_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Authentication { message: message.into(), hint: Some(hint.into()) }
    }

    /// Create a new SSH error.
    pub fn ssh(message: impl Into<String>) -> Self {
        Self::Ssh { message: message.into(), source: None }
    }

    /// Create a new SSH error with source.
    pub fn ssh_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Ssh { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new storage error.
    pub fn storage(message: impl Into<String>, hint: Option<&str>) -> Self {
        Self::Storage { message: message.into(), hint: hint.map(String::from), source: None }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create a new process error.
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process { message: message.into(), source: None }
    }

    /// Create a new process error with source.
    pub fn process_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Process { message: message.into(), source: Some(Box::new(source)) }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    // ========== Methods ==========

    /// Check if this error means the user has to supply the master password.
    pub fn is_crypt_key_missing(&self) -> bool {
        matches!(self, Self::CryptKeyMissing)
    }

    /// Check if this error is a lost tunnel.
    pub fn is_tunnel_lost(&self) -> bool {
        matches!(self, Self::SshTunnelConnectionLost { .. })
    }

    /// Check if the UI should show a "reconnect required" state instead of a hard failure.
    pub fn is_reconnect_required(&self) -> bool {
        matches!(
            self,
            Self::CryptKeyMissing
                | Self::ConnectionLost { .. }
                | Self::SshTunnelConnectionLost { .. }
        )
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::CryptKeyMissing => "CryptKey",
            Self::ConnectionLost { .. } => "ConnectionLost",
            Self::SshTunnelConnectionLost { .. } => "SshTunnelLost",
            Self::Connection { .. } => "Connection",
            Self::Authentication { .. } => "Authentication",
            Self::Ssh { .. } => "SSH",
            Self::Query { .. } => "Query",
            Self::DatabaseNotFound { .. } => "Database",
            Self::ServerVersionUnavailable => "Server",
            Self::Storage { .. } => "Storage",
            Self::Config { .. } => "Config",
            Self::Process { .. } => "Process",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the user.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::CryptKeyMissing => Some("Enter the master password to unlock saved passwords"),
            Self::ConnectionLost { .. } => Some("Reconnect to the server"),
            Self::SshTunnelConnectionLost { .. } => {
                Some("Re-establish the SSH tunnel, the tunnel password may be required")
            }
            Self::Connection { .. } => Some("Check that the database server is running"),
            Self::Authentication { hint, .. } => hint.as_deref(),
            Self::Ssh { .. } => Some("Check the SSH host, credentials and key permissions"),
            Self::Query { hint, .. } => hint.as_deref(),
            Self::DatabaseNotFound { .. } => Some("Refresh the database list"),
            Self::ServerVersionUnavailable => Some("Connect to the server first"),
            Self::Storage { hint, .. } => hint.as_deref(),
            Self::Config { .. } => None,
            Self::Process { .. } => Some("Check the job's log directory"),
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Get PostgreSQL error code (if applicable).
    pub fn pg_code(&self) -> Option<&str> {
        match self {
            Self::Query { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// Convert to user-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::Query { detail, code, .. } => {
                let mut parts = Vec::new();
                if let Some(code) = code {
                    parts.push(format!("Code: {code}"));
                }
                if let Some(detail) = detail {
                    parts.push(format!("Detail: {detail}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            Self::SshTunnelConnectionLost { message, .. } => message.clone(),
            Self::ConnectionLost { database, conn_id, .. } => match (database, conn_id) {
                (_, Some(conn_id)) => Some(format!("Connection: {conn_id}")),
                (Some(database), None) => Some(format!("Database: {database}")),
                (None, None) => None,
            },
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// User-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Connection Error").
    pub error_type: String,
    /// User-friendly message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for "Show Details" expansion.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to PgDeckError.
impl From<tokio_postgres::Error> for PgDeckError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let detail = db_err.detail().map(String::from);
            let hint = db_err.hint().map(String::from);
            let code_str = db_err.code().code();

            return match code_str {
                "28P01" => PgDeckError::Authentication {
                    message,
                    hint: Some("Invalid password - check your credentials".to_string()),
                },
                "28000" => PgDeckError::Authentication {
                    message,
                    hint: Some(
                        "Authentication failed - check username and permissions".to_string(),
                    ),
                },
                _ if code_str.starts_with("08") => {
                    PgDeckError::Connection { message, source: Some(Box::new(err)) }
                }
                _ => PgDeckError::Query { message, detail, hint, code: Some(code_str.to_string()) },
            };
        }

        if err.is_closed() {
            return PgDeckError::Connection {
                message: "Connection closed".to_string(),
                source: Some(Box::new(err)),
            };
        }

        PgDeckError::Connection { message: err.to_string(), source: Some(Box::new(err)) }
    }
}

/// Convert from std::io::Error to PgDeckError.
impl From<std::io::Error> for PgDeckError {
    fn from(err: std::io::Error) -> Self {
        PgDeckError::Storage {
            message: err.to_string(),
            hint: Some("Check file permissions and disk space".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

/// Convert from serde_json::Error to PgDeckError.
impl From<serde_json::Error> for PgDeckError {
    fn from(err: serde_json::Error) -> Self {
        PgDeckError::Storage {
            message: format!("JSON error: {err}"),
            hint: Some("Data may be corrupted".to_string()),
            source: Some(Box::new(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_required_states_are_distinct() {
        let key = PgDeckError::CryptKeyMissing;
        let lost = PgDeckError::connection_lost(1, Some("postgres".into()), None);
        let tunnel = PgDeckError::tunnel_lost("bastion");

        assert!(key.is_reconnect_required());
        assert!(lost.is_reconnect_required());
        assert!(tunnel.is_reconnect_required());
        assert!(!PgDeckError::connection("refused").is_reconnect_required());

        assert_ne!(key.category(), lost.category());
        assert_ne!(lost.category(), tunnel.category());
        assert!(key.is_crypt_key_missing());
        assert!(tunnel.is_tunnel_lost());
    }

    #[test]
    fn test_error_info_for_tunnel_loss_carries_cause() {
        let err = PgDeckError::tunnel_lost_with_message("bastion", "connection refused");
        let info = err.to_error_info();

        assert_eq!(info.error_type, "SshTunnelLost Error");
        assert_eq!(info.message, "SSH tunnel to bastion lost");
        assert_eq!(info.technical_detail.as_deref(), Some("connection refused"));
        assert!(info.hint.is_some());
    }

    #[test]
    fn test_io_error_converts_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PgDeckError = io.into();
        assert_eq!(err.category(), "Storage");
        assert!(err.to_string().contains("missing"));
    }
}

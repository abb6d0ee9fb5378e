//! Server identity, SSL and SSH tunnel settings.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;

/// Numeric id of a registered server.
pub type ServerId = i32;

/// An encrypted secret (password or tunnel password).
///
/// Holds ciphertext only; turning it into plaintext always goes through
/// [`SecretService::decrypt`](crate::services::SecretService::decrypt).
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(Vec<u8>);

impl Secret {
    /// Wrap ciphertext bytes.
    pub fn from_ciphertext(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw ciphertext.
    pub fn ciphertext(&self) -> &[u8] {
        &self.0
    }

    /// Whether the ciphertext is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Secret {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map(Secret).map_err(serde::de::Error::custom)
    }
}

/// SSL mode for database connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// No SSL
    Disable,
    /// Try a plain connection first, upgrade if the server insists
    Allow,
    /// Use SSL if available (default)
    #[default]
    Prefer,
    /// Require SSL, accept any certificate
    Require,
    /// Require SSL, verify CA
    VerifyCa,
    /// Require SSL, verify CA and hostname
    VerifyFull,
}

impl SslMode {
    /// Convert to the libpq spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }

    /// Parse from string representation.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "disable" => Self::Disable,
            "allow" => Self::Allow,
            "require" => Self::Require,
            "verify-ca" | "verify_ca" => Self::VerifyCa,
            "verify-full" | "verify_full" => Self::VerifyFull,
            _ => Self::Prefer,
        }
    }
}

/// SSL parameters of a server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslSettings {
    pub mode: SslMode,
    pub root_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub crl: Option<PathBuf>,
    pub compression: bool,
}

/// How the SSH tunnel authenticates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TunnelAuth {
    /// Password authentication; the tunnel password is the SSH password.
    #[default]
    Password,
    /// Private key authentication; the tunnel password is the key passphrase.
    IdentityFile {
        /// Path to the private key.
        path: Option<PathBuf>,
    },
    /// SSH agent authentication.
    Agent,
}

impl TunnelAuth {
    /// Short name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::IdentityFile { .. } => "identity_file",
            Self::Agent => "agent",
        }
    }
}

/// SSH tunnel parameters of a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Authentication method
    pub auth: TunnelAuth,
    /// Encrypted SSH password or key passphrase
    pub password: Option<Secret>,
}

impl TunnelSettings {
    /// Create tunnel settings with password authentication on port 22.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: username.into(),
            auth: TunnelAuth::Password,
            password: None,
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set key-based authentication.
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth = TunnelAuth::IdentityFile { path: Some(path.into()) };
        self
    }

    /// Set agent authentication.
    pub fn with_agent(mut self) -> Self {
        self.auth = TunnelAuth::Agent;
        self
    }

    /// Set the encrypted tunnel password.
    pub fn with_password(mut self, password: Secret) -> Self {
        self.password = Some(password);
        self
    }
}

/// Everything needed to reach one registered server.
///
/// Replaced wholesale by [`ServerManager::update`](crate::services::ServerManager::update),
/// never edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Server id
    pub id: ServerId,
    /// Display name
    pub name: String,
    /// Server hostname
    pub host: String,
    /// Optional numeric address used instead of resolving `host`
    pub hostaddr: Option<String>,
    /// Server port (default 5432)
    pub port: u16,
    /// Maintenance database
    pub maintenance_db: String,
    /// Login username
    pub username: String,
    /// Role to assume after connecting
    pub role: Option<String>,
    /// Encrypted login password
    pub password: Option<Secret>,
    /// SSL configuration
    pub ssl: SslSettings,
    /// libpq service name
    pub service: Option<String>,
    /// Path to a pgpass file
    pub passfile: Option<PathBuf>,
    /// Connect timeout in seconds (0 = none)
    pub connect_timeout_secs: u32,
    /// Optional SSH tunnel settings
    pub tunnel: Option<TunnelSettings>,
}

impl ServerIdentity {
    /// Create a server identity with required fields.
    pub fn new(
        id: ServerId,
        host: impl Into<String>,
        maintenance_db: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        let host = host.into();
        Self {
            id,
            name: host.clone(),
            host,
            hostaddr: None,
            port: 5432,
            maintenance_db: maintenance_db.into(),
            username: username.into(),
            role: None,
            password: None,
            ssl: SslSettings::default(),
            service: None,
            passfile: None,
            connect_timeout_secs: 0,
            tunnel: None,
        }
    }

    /// Create a builder for complex identities.
    pub fn builder(id: ServerId) -> ServerIdentityBuilder {
        ServerIdentityBuilder { id, ..Default::default() }
    }

    /// Whether connections to this server go through an SSH tunnel.
    pub fn uses_tunnel(&self) -> bool {
        self.tunnel.is_some()
    }

    /// Whether connecting may need the decryption key.
    pub fn has_stored_secrets(&self) -> bool {
        self.password.is_some()
            || self.tunnel.as_ref().is_some_and(|t| t.password.is_some())
    }

    /// Maintenance database, if set.
    pub fn maintenance_database(&self) -> Option<&str> {
        if self.maintenance_db.is_empty() {
            None
        } else {
            Some(&self.maintenance_db)
        }
    }

    /// Validate the identity.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() && self.hostaddr.is_none() && self.service.is_none() {
            return Err("Host, host address or service is required".to_string());
        }
        if self.maintenance_db.len() > 63 {
            return Err("Maintenance database name must be at most 63 characters".to_string());
        }
        if self.username.is_empty() && self.service.is_none() {
            return Err("Username is required".to_string());
        }
        if let Some(ref tunnel) = self.tunnel {
            if tunnel.host.is_empty() {
                return Err("Tunnel host is required".to_string());
            }
            if let TunnelAuth::IdentityFile { path: None } = tunnel.auth {
                return Err("Identity file is required for key-based SSH authentication".into());
            }
        }
        Ok(())
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        format!(
            "postgresql://{}@{}:{}/{}",
            self.username, self.host, self.port, self.maintenance_db
        )
    }
}

/// Builder for ServerIdentity.
#[derive(Debug, Default)]
pub struct ServerIdentityBuilder {
    id: ServerId,
    name: Option<String>,
    host: Option<String>,
    hostaddr: Option<String>,
    port: u16,
    maintenance_db: Option<String>,
    username: Option<String>,
    role: Option<String>,
    password: Option<Secret>,
    ssl: SslSettings,
    service: Option<String>,
    passfile: Option<PathBuf>,
    connect_timeout_secs: u32,
    tunnel: Option<TunnelSettings>,
}

impl ServerIdentityBuilder {
    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Set the numeric host address.
    pub fn hostaddr(mut self, hostaddr: impl Into<String>) -> Self {
        self.hostaddr = Some(hostaddr.into());
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the maintenance database.
    pub fn maintenance_db(mut self, database: impl Into<String>) -> Self {
        self.maintenance_db = Some(database.into());
        self
    }

    /// Set the username.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Set the role.
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Set the encrypted password.
    pub fn password(mut self, password: Secret) -> Self {
        self.password = Some(password);
        self
    }

    /// Set SSL settings.
    pub fn ssl(mut self, ssl: SslSettings) -> Self {
        self.ssl = ssl;
        self
    }

    /// Set the SSL mode only.
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl.mode = mode;
        self
    }

    /// Set the libpq service.
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Set the passfile.
    pub fn passfile(mut self, passfile: impl Into<PathBuf>) -> Self {
        self.passfile = Some(passfile.into());
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout_secs(mut self, secs: u32) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Set the SSH tunnel.
    pub fn tunnel(mut self, tunnel: TunnelSettings) -> Self {
        self.tunnel = Some(tunnel);
        self
    }

    /// Build the identity.
    pub fn build(self) -> Result<ServerIdentity, String> {
        let host = self.host.unwrap_or_default();
        let identity = ServerIdentity {
            id: self.id,
            name: self.name.unwrap_or_else(|| host.clone()),
            host,
            hostaddr: self.hostaddr,
            port: if self.port == 0 { 5432 } else { self.port },
            maintenance_db: self.maintenance_db.unwrap_or_else(|| "postgres".to_string()),
            username: self.username.unwrap_or_default(),
            role: self.role,
            password: self.password,
            ssl: self.ssl,
            service: self.service,
            passfile: self.passfile,
            connect_timeout_secs: self.connect_timeout_secs,
            tunnel: self.tunnel,
        };
        identity.validate()?;
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let identity = ServerIdentity::builder(7)
            .host("db.internal")
            .username("admin")
            .build()
            .unwrap();

        assert_eq!(identity.port, 5432);
        assert_eq!(identity.maintenance_db, "postgres");
        assert_eq!(identity.name, "db.internal");
        assert!(!identity.uses_tunnel());
        assert!(!identity.has_stored_secrets());
    }

    #[test]
    fn test_identity_file_requires_path() {
        let mut tunnel = TunnelSettings::new("bastion", "ops");
        tunnel.auth = TunnelAuth::IdentityFile { path: None };

        let result = ServerIdentity::builder(1)
            .host("db")
            .username("admin")
            .tunnel(tunnel)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_tunnel_password_counts_as_stored_secret() {
        let identity = ServerIdentity::builder(1)
            .host("db")
            .username("admin")
            .tunnel(TunnelSettings::new("bastion", "ops").with_password(Secret::from_ciphertext(
                vec![1, 2, 3],
            )))
            .build()
            .unwrap();
        assert!(identity.has_stored_secrets());
        assert_eq!(identity.tunnel.as_ref().map(|t| t.port), Some(22));
    }

    #[test]
    fn test_secret_is_redacted_and_base64_serialized() {
        let secret = Secret::from_ciphertext(b"abc".to_vec());
        assert_eq!(format!("{secret:?}"), "Secret(<redacted>)");

        let json = serde_json::to_string(&secret).unwrap();
        assert_eq!(json, "\"YWJj\"");
        let back: Secret = serde_json::from_str(&json).unwrap();
        assert_eq!(back, secret);
    }

    #[test]
    fn test_ssl_mode_parse() {
        assert_eq!(SslMode::parse("verify_full"), SslMode::VerifyFull);
        assert_eq!(SslMode::parse("ALLOW"), SslMode::Allow);
        assert_eq!(SslMode::parse("bogus"), SslMode::Prefer);
        assert_eq!(SslMode::VerifyCa.as_str(), "verify-ca");
    }
}

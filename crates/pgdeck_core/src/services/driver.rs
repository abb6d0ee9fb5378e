//! Database driver seam.
//!
//! Connections talk to PostgreSQL through [`DatabaseDriver`] so the manager logic can
//! be exercised without a server. [`PostgresDriver`] is the tokio-postgres backend.

use crate::config::ConsoleConfig;
use crate::error::{PgDeckError, PgDeckResult};
use crate::models::{ServerIdentity, ServerInfo, SslMode, SslSettings, TextRow};
use async_trait::async_trait;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_postgres::tls::{MakeTlsConnect, TlsConnect};
use tokio_postgres::{CancelToken, Client, Config, NoTls, SimpleQueryMessage, Socket};

/// Everything the driver needs to open one session.
#[derive(Clone)]
pub struct ConnectParams {
    /// Host name (also used for TLS verification)
    pub host: String,
    /// Address actually dialled, when different from `host`
    pub hostaddr: Option<IpAddr>,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub role: Option<String>,
    pub ssl: SslSettings,
    pub application_name: String,
    pub connect_timeout: Option<Duration>,
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("hostaddr", &self.hostaddr)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl_mode", &self.ssl.mode)
            .finish()
    }
}

impl ConnectParams {
    /// Build parameters for one database of a server.
    ///
    /// With `tunnel_port` set the session dials `127.0.0.1:<port>` while keeping the
    /// server host name for TLS.
    pub fn for_identity(
        identity: &ServerIdentity,
        database: &str,
        password: Option<String>,
        tunnel_port: Option<u16>,
        config: &ConsoleConfig,
    ) -> Self {
        let (hostaddr, port) = match tunnel_port {
            Some(port) => (Some(IpAddr::from([127, 0, 0, 1])), port),
            None => (identity.hostaddr.as_deref().and_then(|a| a.parse().ok()), identity.port),
        };
        let host = if identity.host.is_empty() {
            identity.hostaddr.clone().unwrap_or_default()
        } else {
            identity.host.clone()
        };

        let password = password.or_else(|| {
            identity.passfile.as_deref().and_then(|path| {
                passfile_password(path, &host, identity.port, database, &identity.username)
            })
        });

        if let Some(ref service) = identity.service {
            tracing::debug!(
                server_id = identity.id,
                service = %service,
                "Service files are not read, using explicit connection parameters"
            );
        }

        let timeout = match identity.connect_timeout_secs {
            0 => config.default_connect_timeout_secs,
            secs => secs,
        };

        Self {
            host,
            hostaddr,
            port,
            database: database.to_string(),
            user: identity.username.clone(),
            password,
            role: identity.role.clone(),
            ssl: identity.ssl.clone(),
            application_name: config.application_name.clone(),
            connect_timeout: (timeout > 0).then(|| Duration::from_secs(u64::from(timeout))),
        }
    }

    fn pg_config(&self) -> Config {
        let mut config = Config::new();
        config
            .host(&self.host)
            .port(self.port)
            .dbname(&self.database)
            .user(&self.user)
            .application_name(&self.application_name);
        if let Some(addr) = self.hostaddr {
            config.hostaddr(addr);
        }
        if let Some(ref password) = self.password {
            config.password(password);
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout(timeout);
        }
        config.ssl_mode(match self.ssl.mode {
            SslMode::Disable => tokio_postgres::config::SslMode::Disable,
            SslMode::Allow | SslMode::Prefer => tokio_postgres::config::SslMode::Prefer,
            SslMode::Require | SslMode::VerifyCa | SslMode::VerifyFull => {
                tokio_postgres::config::SslMode::Require
            }
        });
        config
    }
}

/// Look up a password in a pgpass file.
///
/// Lines are `host:port:database:user:password`; `*` matches anything and `\:` / `\\`
/// escape separators.
pub fn passfile_password(
    path: &Path,
    host: &str,
    port: u16,
    database: &str,
    user: &str,
) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let port = port.to_string();
    let wanted = [host, port.as_str(), database, user];

    text.lines()
        .filter(|line| !line.trim_start().starts_with('#') && !line.trim().is_empty())
        .find_map(|line| {
            let fields = split_pgpass_line(line);
            if fields.len() != 5 {
                return None;
            }
            let matches =
                fields[..4].iter().zip(wanted).all(|(field, value)| field == "*" || field == value);
            matches.then(|| fields[4].clone())
        })
}

fn split_pgpass_line(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let (Some(next), Some(field)) = (chars.next(), fields.last_mut()) {
                    field.push(next);
                }
            }
            ':' if fields.len() < 5 => fields.push(String::new()),
            _ => {
                if let Some(field) = fields.last_mut() {
                    field.push(c);
                }
            }
        }
    }
    fields
}

/// Opens database sessions.
#[async_trait]
pub trait DatabaseDriver: Send + Sync {
    /// Open a session.
    async fn connect(&self, params: &ConnectParams) -> PgDeckResult<Arc<dyn DatabaseSession>>;
}

/// One live database session.
#[async_trait]
pub trait DatabaseSession: Send + Sync {
    /// Whether the session has been closed by either side.
    fn is_closed(&self) -> bool;

    /// Run SQL over the simple query protocol and collect the rows as text.
    async fn simple_query(&self, sql: &str) -> PgDeckResult<Vec<TextRow>>;

    /// Ask the server to cancel the statement in progress.
    async fn cancel(&self) -> PgDeckResult<()>;

    /// Close the session.
    fn close(&self);

    /// Version string and number of the server.
    async fn server_info(&self) -> PgDeckResult<ServerInfo> {
        let rows = self
            .simple_query(
                "SELECT version() AS ver, current_setting('server_version_num') AS sversion",
            )
            .await?;
        let row = rows.first().ok_or(PgDeckError::ServerVersionUnavailable)?;
        let ver = row.get("ver").ok_or(PgDeckError::ServerVersionUnavailable)?;
        let sversion = row
            .get("sversion")
            .and_then(|v| v.parse().ok())
            .ok_or(PgDeckError::ServerVersionUnavailable)?;
        Ok(ServerInfo::new(ver, sversion))
    }
}

/// tokio-postgres driver.
#[derive(Debug, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }
}

#[derive(Clone)]
enum Tls {
    Plain,
    Native(MakeTlsConnector),
}

fn tls_connector(ssl: &SslSettings) -> PgDeckResult<Tls> {
    let mut builder = TlsConnector::builder();
    match ssl.mode {
        SslMode::Disable => return Ok(Tls::Plain),
        // Encryption without certificate checks, as libpq does for these modes.
        SslMode::Allow | SslMode::Prefer | SslMode::Require => {
            builder.danger_accept_invalid_certs(true);
        }
        SslMode::VerifyCa => {
            builder.danger_accept_invalid_hostnames(true);
        }
        SslMode::VerifyFull => {}
    }

    if let Some(ref root_cert) = ssl.root_cert {
        let pem = read_pem(root_cert, "root certificate")?;
        let cert = native_tls::Certificate::from_pem(&pem).map_err(|e| {
            PgDeckError::connection_with_source("Failed to parse root certificate", e)
        })?;
        builder.add_root_certificate(cert);
    }

    if let (Some(ref cert), Some(ref key)) = (&ssl.cert, &ssl.key) {
        let cert = read_pem(cert, "client certificate")?;
        let key = read_pem(key, "client key")?;
        let identity = native_tls::Identity::from_pkcs8(&cert, &key).map_err(|e| {
            PgDeckError::connection_with_source("Failed to load client certificate", e)
        })?;
        builder.identity(identity);
    }

    let connector = builder
        .build()
        .map_err(|e| PgDeckError::connection_with_source("Failed to create TLS connector", e))?;
    Ok(Tls::Native(MakeTlsConnector::new(connector)))
}

fn read_pem(path: &Path, what: &str) -> PgDeckResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        PgDeckError::connection(format!("Failed to read {what} {}: {e}", path.display()))
    })
}

/// Connect and drive the connection future on its own task.
async fn open<T>(config: &Config, tls: T) -> PgDeckResult<(Client, JoinHandle<()>)>
where
    T: MakeTlsConnect<Socket> + Send + Sync + 'static,
    T::Stream: Send + Sync + 'static,
    T::TlsConnect: Send + Sync,
    <T::TlsConnect as TlsConnect<Socket>>::Future: Send,
{
    let (client, connection) = config.connect(tls).await?;
    let task = tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "PostgreSQL connection closed with error");
        }
    });
    Ok((client, task))
}

#[async_trait]
impl DatabaseDriver for PostgresDriver {
    async fn connect(&self, params: &ConnectParams) -> PgDeckResult<Arc<dyn DatabaseSession>> {
        let config = params.pg_config();
        let tls = tls_connector(&params.ssl)?;

        tracing::debug!(
            host = %params.host,
            port = params.port,
            database = %params.database,
            ssl_mode = params.ssl.mode.as_str(),
            "Opening PostgreSQL session"
        );

        let (client, task) = match tls {
            Tls::Plain => open(&config, NoTls).await?,
            Tls::Native(ref connector) => open(&config, connector.clone()).await?,
        };

        if let Some(ref role) = params.role {
            client.batch_execute(&format!("SET ROLE {}", quote_ident(role))).await?;
        }

        let cancel_token = client.cancel_token();
        Ok(Arc::new(PostgresSession { client, cancel_token, tls, task }))
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

struct PostgresSession {
    client: Client,
    cancel_token: CancelToken,
    tls: Tls,
    task: JoinHandle<()>,
}

#[async_trait]
impl DatabaseSession for PostgresSession {
    fn is_closed(&self) -> bool {
        self.client.is_closed()
    }

    async fn simple_query(&self, sql: &str) -> PgDeckResult<Vec<TextRow>> {
        let messages = self.client.simple_query(sql).await?;
        let rows: Vec<TextRow> = messages
            .iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(
                    row.columns()
                        .iter()
                        .enumerate()
                        .map(|(i, column)| (column.name(), row.get(i).map(String::from)))
                        .collect::<TextRow>(),
                ),
                _ => None,
            })
            .collect();
        Ok(rows)
    }

    async fn cancel(&self) -> PgDeckResult<()> {
        match self.tls {
            Tls::Plain => self.cancel_token.cancel_query(NoTls).await?,
            Tls::Native(ref connector) => self.cancel_token.cancel_query(connector.clone()).await?,
        }
        Ok(())
    }

    fn close(&self) {
        self.task.abort();
    }
}

impl Drop for PostgresSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> ServerIdentity {
        ServerIdentity::builder(1)
            .host("db.internal")
            .port(6432)
            .username("admin")
            .build()
            .unwrap()
    }

    #[test]
    fn test_tunnel_port_redirects_to_loopback() {
        let config = ConsoleConfig::default();
        let params = ConnectParams::for_identity(&identity(), "sales", None, Some(40123), &config);

        assert_eq!(params.host, "db.internal");
        assert_eq!(params.hostaddr, Some(IpAddr::from([127, 0, 0, 1])));
        assert_eq!(params.port, 40123);
        assert_eq!(params.connect_timeout, Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = ConsoleConfig::default();
        let params = ConnectParams::for_identity(
            &identity(),
            "postgres",
            Some("topsecret".into()),
            None,
            &config,
        );
        let text = format!("{params:?}");
        assert!(!text.contains("topsecret"));
        assert!(text.contains("<redacted>"));
    }

    #[test]
    fn test_passfile_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgpass");
        std::fs::write(
            &path,
            "# comment\nother:5432:*:admin:nope\ndb.internal:6432:*:admin:pa\\:ss\n",
        )
        .unwrap();

        assert_eq!(
            passfile_password(&path, "db.internal", 6432, "sales", "admin").as_deref(),
            Some("pa:ss")
        );
        assert_eq!(passfile_password(&path, "db.internal", 5432, "sales", "admin"), None);
    }

    #[test]
    fn test_role_is_quoted() {
        assert_eq!(quote_ident("ops\"team"), "\"ops\"\"team\"");
    }
}

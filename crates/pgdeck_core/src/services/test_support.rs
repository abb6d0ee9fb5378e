//! In-crate fakes for the driver and tunnel seams.

use super::driver::{ConnectParams, DatabaseDriver, DatabaseSession};
use super::tunnel::{ActiveTunnel, ForwardSpec, TunnelForwarder};
use super::Services;
use crate::config::ConsoleConfig;
use crate::error::{PgDeckError, PgDeckResult};
use crate::models::TextRow;
use crate::services::secrets::MasterKeySecrets;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Ordered record of driver and forwarder calls.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Driver that records connects and serves canned rows.
pub struct FakeDriver {
    events: EventLog,
    down: Mutex<HashSet<String>>,
    databases: Mutex<HashMap<u32, String>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    version: Mutex<(String, u32)>,
}

impl FakeDriver {
    pub const VERSION: &'static str = "PostgreSQL 16.2 on x86_64-pc-linux-gnu";
    pub const VERSION_NUM: u32 = 160002;
    pub const LEGACY_VERSION: &'static str = "PostgreSQL 14.11 on x86_64-pc-linux-gnu";
    pub const LEGACY_VERSION_NUM: u32 = 140011;

    pub fn new(events: EventLog) -> Self {
        Self {
            events,
            down: Mutex::new(HashSet::new()),
            databases: Mutex::new(HashMap::new()),
            sessions: Mutex::new(Vec::new()),
            version: Mutex::new((Self::VERSION.to_string(), Self::VERSION_NUM)),
        }
    }

    /// Version reported by sessions opened from now on.
    pub fn set_version(&self, ver: &str, sversion: u32) {
        *self.version.lock() = (ver.to_string(), sversion);
    }

    /// Make connects to `database` fail.
    pub fn take_down(&self, database: &str) {
        self.down.lock().insert(database.to_string());
    }

    pub fn bring_up(&self, database: &str) {
        self.down.lock().remove(database);
    }

    /// Register a `pg_database` row.
    pub fn add_database(&self, did: u32, name: &str) {
        self.databases.lock().insert(did, name.to_string());
    }

    /// Close every session opened so far, as a server restart would.
    pub fn drop_sessions(&self) {
        for session in self.sessions.lock().iter() {
            session.close();
        }
    }
}

#[async_trait]
impl DatabaseDriver for FakeDriver {
    async fn connect(&self, params: &ConnectParams) -> PgDeckResult<Arc<dyn DatabaseSession>> {
        let addr = params.hostaddr.map(|a| a.to_string()).unwrap_or_else(|| params.host.clone());
        self.events.push(format!(
            "driver:connect {}@{}:{} password={}",
            params.database,
            addr,
            params.port,
            params.password.as_deref().unwrap_or("-")
        ));

        if self.down.lock().contains(&params.database) {
            return Err(PgDeckError::connection(format!(
                "could not connect to database {}",
                params.database
            )));
        }

        let (ver, sversion) = self.version.lock().clone();
        let session = Arc::new(FakeSession {
            closed: AtomicBool::new(false),
            ver,
            sversion,
            databases: self.databases.lock().clone(),
            events: self.events.clone(),
        });
        self.sessions.lock().push(session.clone());
        Ok(session)
    }
}

pub struct FakeSession {
    closed: AtomicBool,
    ver: String,
    sversion: u32,
    databases: HashMap<u32, String>,
    events: EventLog,
}

fn row(columns: &[(&str, Option<&str>)]) -> TextRow {
    columns.iter().map(|(name, value)| (*name, value.map(String::from))).collect()
}

#[async_trait]
impl DatabaseSession for FakeSession {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn simple_query(&self, sql: &str) -> PgDeckResult<Vec<TextRow>> {
        if self.is_closed() {
            return Err(PgDeckError::connection("Connection closed"));
        }
        if sql.contains("version()") {
            let num = self.sversion.to_string();
            return Ok(vec![row(&[
                ("ver", Some(self.ver.as_str())),
                ("sversion", Some(num.as_str())),
            ])]);
        }
        // pg_database lost datlastsysoid in 15.
        let modern = self.sversion >= 150000;
        let reads_lastsysoid =
            sql.contains("datlastsysoid") && !sql.contains("NULL::oid AS datlastsysoid");
        if modern && reads_lastsysoid {
            return Err(PgDeckError::Query {
                message: "column \"datlastsysoid\" does not exist".to_string(),
                detail: None,
                hint: None,
                code: Some("42703".to_string()),
            });
        }
        if let Some(rest) = sql.split("db.oid = ").nth(1) {
            let did: u32 = rest.trim().parse().unwrap_or(0);
            let rows = self
                .databases
                .get(&did)
                .map(|name| {
                    let did = did.to_string();
                    vec![row(&[
                        ("did", Some(did.as_str())),
                        ("datname", Some(name.as_str())),
                        ("datallowconn", Some("t")),
                        ("serverencoding", Some("UTF8")),
                        ("cancreate", Some("t")),
                        ("datlastsysoid", (!modern).then_some("13756")),
                    ])]
                })
                .unwrap_or_default();
            return Ok(rows);
        }
        Ok(vec![row(&[("?column?", Some("1"))])])
    }

    async fn cancel(&self) -> PgDeckResult<()> {
        self.events.push("driver:cancel");
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Forwarder that records opens and hands out switchable tunnels.
pub struct FakeForwarder {
    events: EventLog,
    fail: AtomicBool,
    tunnels: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeForwarder {
    pub const LOCAL_PORT: u16 = 40123;

    pub fn new(events: EventLog) -> Self {
        Self { events, fail: AtomicBool::new(false), tunnels: Mutex::new(Vec::new()) }
    }

    /// Make every open fail as an unreachable host would.
    pub fn unreachable(events: EventLog) -> Self {
        let forwarder = Self::new(events);
        forwarder.fail.store(true, Ordering::SeqCst);
        forwarder
    }

    /// Mark every tunnel handed out so far as dead.
    pub fn kill_tunnels(&self) {
        for active in self.tunnels.lock().iter() {
            active.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl TunnelForwarder for FakeForwarder {
    async fn open(
        &self,
        spec: &ForwardSpec,
        password: Option<&str>,
    ) -> PgDeckResult<Box<dyn ActiveTunnel>> {
        self.events.push(format!(
            "tunnel:open {}:{} password={}",
            spec.ssh_host,
            spec.ssh_port,
            password.unwrap_or("-")
        ));
        if self.fail.load(Ordering::SeqCst) {
            return Err(PgDeckError::ssh(format!(
                "Failed to connect to SSH server {}:{}: Connection refused",
                spec.ssh_host, spec.ssh_port
            )));
        }
        let active = Arc::new(AtomicBool::new(true));
        self.tunnels.lock().push(active.clone());
        Ok(Box::new(FakeTunnel { active, events: self.events.clone() }))
    }
}

struct FakeTunnel {
    active: Arc<AtomicBool>,
    events: EventLog,
}

impl ActiveTunnel for FakeTunnel {
    fn local_port(&self) -> u16 {
        FakeForwarder::LOCAL_PORT
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.events.push("tunnel:stop");
    }
}

/// Fakes wired into a [`Services`] bundle.
pub struct Harness {
    pub events: EventLog,
    pub driver: Arc<FakeDriver>,
    pub forwarder: Arc<FakeForwarder>,
    pub secrets: Arc<MasterKeySecrets>,
    pub services: Services,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ConsoleConfig::default())
    }

    pub fn with_config(config: ConsoleConfig) -> Self {
        let events = EventLog::default();
        let forwarder = Arc::new(FakeForwarder::new(events.clone()));
        Self::build(events, forwarder, config)
    }

    pub fn with_forwarder(forwarder: FakeForwarder, events: EventLog) -> Self {
        Self::build(events, Arc::new(forwarder), ConsoleConfig::default())
    }

    fn build(events: EventLog, forwarder: Arc<FakeForwarder>, config: ConsoleConfig) -> Self {
        let driver = Arc::new(FakeDriver::new(events.clone()));
        let secrets = Arc::new(MasterKeySecrets::with_master_password("master"));
        let services = Services {
            driver: driver.clone(),
            forwarder: forwarder.clone(),
            secrets: secrets.clone(),
            config: Arc::new(config),
        };
        Self { events, driver, forwarder, secrets, services }
    }
}

//! Serializable manager state carried between requests of one session.
//!
//! Snapshots are versioned. A snapshot written by a newer build is rejected as a whole
//! instead of being read halfway.

use super::connection::{ConnectionFlags, ConnectionKey};
use super::server::{Secret, ServerId};
use crate::error::{PgDeckError, PgDeckResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Session store key under which the session snapshot lives.
pub const SESSION_STORE_KEY: &str = "pgdeck.server_managers";

/// Saved state of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    /// Explicit connection id, if the key is `CONN:<id>`
    pub conn_id: Option<u64>,
    /// Target database
    pub database: String,
    pub auto_reconnect: bool,
    #[serde(rename = "async")]
    pub asynchronous: bool,
    pub use_binary_placeholder: bool,
    pub array_to_string: bool,
    pub was_connected: bool,
}

impl ConnectionSnapshot {
    /// Flags carried by this snapshot.
    pub fn flags(&self) -> ConnectionFlags {
        ConnectionFlags {
            auto_reconnect: self.auto_reconnect,
            asynchronous: self.asynchronous,
            use_binary_placeholder: self.use_binary_placeholder,
            array_to_string: self.array_to_string,
        }
    }
}

/// Saved state of one server manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSnapshot {
    pub version: u32,
    /// Server id
    pub sid: ServerId,
    /// Server version string
    pub ver: String,
    /// Numeric server version
    pub sversion: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_password: Option<Secret>,
    /// Connections keyed by their `CONN:`/`DB:` text form
    pub connections: BTreeMap<String, ConnectionSnapshot>,
}

impl ManagerSnapshot {
    /// Reject snapshots this build cannot read.
    pub fn check_version(&self) -> PgDeckResult<()> {
        check_version(self.version)
    }

    /// Connections with parsed keys, in key order.
    pub fn entries(&self) -> PgDeckResult<Vec<(ConnectionKey, &ConnectionSnapshot)>> {
        self.connections
            .iter()
            .map(|(key, conn)| {
                key.parse::<ConnectionKey>()
                    .map(|key| (key, conn))
                    .map_err(|e| PgDeckError::storage(e, Some("Session state may be corrupted")))
            })
            .collect()
    }
}

/// Saved state of every server manager of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub managers: BTreeMap<ServerId, ManagerSnapshot>,
}

impl SessionSnapshot {
    /// An empty snapshot at the current version.
    pub fn new() -> Self {
        Self { version: SNAPSHOT_VERSION, managers: BTreeMap::new() }
    }

    /// Parse a snapshot read from the session store.
    pub fn from_value(value: serde_json::Value) -> PgDeckResult<Self> {
        // Peek at the version first so a newer layout is never half-parsed.
        let version = value.get("version").and_then(|v| v.as_u64()).ok_or_else(|| {
            PgDeckError::storage("Session snapshot has no version", Some("Reconnect to the server"))
        })?;
        check_version(u32::try_from(version).unwrap_or(u32::MAX))?;

        let snapshot: Self = serde_json::from_value(value)?;
        for manager in snapshot.managers.values() {
            manager.check_version()?;
        }
        Ok(snapshot)
    }

    /// Serialize for the session store.
    pub fn to_value(&self) -> PgDeckResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

fn check_version(version: u32) -> PgDeckResult<()> {
    if version > SNAPSHOT_VERSION {
        return Err(PgDeckError::storage(
            format!(
                "Snapshot version {version} is newer than supported version {SNAPSHOT_VERSION}"
            ),
            Some("Session state was written by a newer pgdeck"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(sid: ServerId) -> ManagerSnapshot {
        let mut connections = BTreeMap::new();
        connections.insert(
            "CONN:7".to_string(),
            ConnectionSnapshot {
                conn_id: Some(7),
                database: "sales".into(),
                auto_reconnect: true,
                asynchronous: true,
                use_binary_placeholder: false,
                array_to_string: true,
                was_connected: true,
            },
        );
        ManagerSnapshot {
            version: SNAPSHOT_VERSION,
            sid,
            ver: "PostgreSQL 16.2".into(),
            sversion: 160002,
            password: Some(Secret::from_ciphertext(vec![9, 9])),
            tunnel_password: None,
            connections,
        }
    }

    #[test]
    fn test_session_snapshot_through_json_value() {
        let mut session = SessionSnapshot::new();
        session.managers.insert(3, manager(3));

        let value = session.to_value().unwrap();
        assert!(value["managers"]["3"].get("tunnel_password").is_none());
        assert_eq!(value["managers"]["3"]["connections"]["CONN:7"]["async"], json!(true));

        let back = SessionSnapshot::from_value(value).unwrap();
        assert_eq!(back, session);
        let entries = back.managers[&3].entries().unwrap();
        assert_eq!(entries[0].0, ConnectionKey::Conn(7));
        assert!(entries[0].1.flags().array_to_string);
    }

    #[test]
    fn test_newer_snapshot_is_rejected() {
        let value =
            json!({ "version": SNAPSHOT_VERSION + 1, "managers": { "1": "not a manager" } });
        let err = SessionSnapshot::from_value(value).unwrap_err();
        assert_eq!(err.category(), "Storage");
        assert!(err.to_string().contains("newer"));

        let mut session = SessionSnapshot::new();
        let mut newer = manager(1);
        newer.version = SNAPSHOT_VERSION + 1;
        session.managers.insert(1, newer);
        assert!(SessionSnapshot::from_value(session.to_value().unwrap()).is_err());
    }

    #[test]
    fn test_unparseable_key_is_reported() {
        let mut snapshot = manager(1);
        let saved = snapshot.connections["CONN:7"].clone();
        snapshot.connections.insert("bogus".into(), saved);
        assert!(snapshot.entries().is_err());
    }
}

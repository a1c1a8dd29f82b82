//! Where instances can be reached: the shared location records every instance
//! writes on startup and on each contact. This crate only reads them.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

/// The most recent location record of an instance on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLocation {
    pub name: String,
    pub hostname: String,
    pub api_port: Option<u16>,
    pub last_contact: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum LocationError {
    #[error("no location record for instance {name} on host {hostname}")]
    NotFound { name: String, hostname: String },
    #[error("api port not set for instance {name} on host {hostname}")]
    PortNotSet { name: String, hostname: String },
    #[error("location store query failed: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Source of location records, keyed by `(instance name, hostname)`.
pub trait LocationStore: Send + Sync {
    /// Most recently contacted record for the instance, if any.
    fn latest(&self, name: &str, hostname: &str) -> Result<Option<InstanceLocation>, LocationError>;
}

/// Resolve the API port of `name` on `hostname`.
///
/// A missing record or a record without a usable port is an error, never a
/// verdict about the instance's health.
pub fn resolve_api_port(
    store: &dyn LocationStore,
    name: &str,
    hostname: &str,
) -> Result<u16, LocationError> {
    let location = store
        .latest(name, hostname)?
        .ok_or_else(|| LocationError::NotFound {
            name: name.to_string(),
            hostname: hostname.to_string(),
        })?;
    tracing::debug!(
        instance = %location.name,
        hostname = %location.hostname,
        last_contact = %location.last_contact,
        port = ?location.api_port,
        "resolved instance location"
    );
    location.api_port.ok_or_else(|| LocationError::PortNotSet {
        name: name.to_string(),
        hostname: hostname.to_string(),
    })
}

/// Hostname of the machine we run on. Only processes on this host can be killed,
/// so only records for this host are considered.
#[cfg(unix)]
pub fn local_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read hostname, using localhost");
            "localhost".to_string()
        }
    }
}

#[cfg(not(unix))]
pub fn local_hostname() -> String {
    std::env::var("COMPUTERNAME").unwrap_or_else(|_| "localhost".to_string())
}

/// Location records kept in the fleet's shared SQLite database.
pub struct SqliteLocationStore {
    conn: Mutex<Connection>,
}

impl SqliteLocationStore {
    /// Opens (or creates) the location database at the given path.
    pub fn open(path: &Path) -> Result<Self, LocationError> {
        Ok(Self {
            conn: Mutex::new(open_or_create(path)?),
        })
    }
}

/// Opens the database, creating the instances table if it doesn't already exist.
pub fn open_or_create(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;

    // Instances write their records concurrently with our reads
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS instances (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT NOT NULL,
            hostname     TEXT NOT NULL,
            api_port     INTEGER,
            last_contact TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_instances_name_host ON instances(name, hostname);",
    )?;

    Ok(conn)
}

impl LocationStore for SqliteLocationStore {
    fn latest(&self, name: &str, hostname: &str) -> Result<Option<InstanceLocation>, LocationError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row = conn
            .query_row(
                "SELECT name, hostname, api_port, last_contact FROM instances
                 WHERE name = ?1 AND hostname = ?2
                 ORDER BY last_contact DESC LIMIT 1",
                rusqlite::params![name, hostname],
                map_location,
            )
            .optional()?;
        Ok(row)
    }
}

fn map_location(row: &rusqlite::Row) -> rusqlite::Result<InstanceLocation> {
    let port: Option<i64> = row.get(2)?;
    Ok(InstanceLocation {
        name: row.get(0)?,
        hostname: row.get(1)?,
        // 0 and out-of-range values mean the instance never registered its API
        api_port: port.and_then(|p| u16::try_from(p).ok()).filter(|p| *p != 0),
        last_contact: row.get(3)?,
    })
}

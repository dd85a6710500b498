use chrono::{DateTime, Utc};
use portlease_common::RECORD_VERSION;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::StoreError;
use crate::reservation::{PortLease, Reservation, ReservationTable};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS reservations (
    name TEXT PRIMARY KEY,
    version TEXT,
    record TEXT NOT NULL
);
"#;

/// Current record shape. `port` and `pid` mirror the primary lease for old readers.
#[derive(Debug, Serialize, Deserialize)]
struct ReservationRecord {
    #[serde(default)]
    port: u16,
    ports: BTreeMap<String, LeaseRecord>,
    #[serde(default)]
    pid: Option<u32>,
    /// Epoch milliseconds.
    expires: i64,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    port: u16,
    #[serde(default)]
    pid: Option<u32>,
}

/// Pre-multiport record shape.
#[derive(Debug, Deserialize)]
struct LegacyRecord {
    port: u16,
    #[serde(default)]
    pid: Option<u32>,
    expires: i64,
}

/// Outcome of loading the table at startup.
#[derive(Debug, Default)]
pub struct LoadedTable {
    pub table: ReservationTable,
    /// Legacy records converted to the current shape.
    pub migrated: usize,
    /// Rows that could not be decoded and were dropped.
    pub skipped: usize,
}

/// SQLite-backed reservation table.
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Open the store at the given path, creating the directory if needed.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Like [`Store::open`], but moves an unreadable file aside to `<file>.corrupt`
    /// and starts over with an empty database.
    pub fn open_or_recover(path: &Path) -> Result<Self, StoreError> {
        match Self::open(path) {
            Ok(store) => Ok(store),
            Err(e) if path.exists() => {
                let mut aside = path.as_os_str().to_owned();
                aside.push(".corrupt");
                let aside = PathBuf::from(aside);
                warn!(error = %e, path = %path.display(), moved_to = %aside.display(),
                    "State file unreadable, starting with an empty table");
                fs::rename(path, &aside)?;
                Self::open(path)
            }
            Err(e) => Err(e),
        }
    }

    /// A store that lives only as long as the process.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load every reservation, migrating legacy rows and dropping undecodable ones.
    pub fn load(&self) -> Result<LoadedTable, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, version, record FROM reservations")?;
        let rows = stmt.query_map([], |row| {
            let name: String = row.get(0)?;
            let version: Option<String> = row.get(1)?;
            let record: String = row.get(2)?;
            Ok((name, version, record))
        })?;

        let mut loaded = LoadedTable::default();
        for row in rows {
            let (name, version, record) = match row {
                Ok(row) => row,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable reservation row");
                    loaded.skipped += 1;
                    continue;
                }
            };
            let legacy = version.as_deref() != Some(RECORD_VERSION);
            match decode_record(version.as_deref(), &record) {
                Ok(reservation) => {
                    if legacy {
                        loaded.migrated += 1;
                    }
                    loaded.table.insert(name, reservation);
                }
                Err(reason) => {
                    warn!(service = %name, %reason, "Skipping reservation record");
                    loaded.skipped += 1;
                }
            }
        }
        Ok(loaded)
    }

    /// Replace the persisted table with `table` in one transaction.
    pub fn save(&mut self, table: &ReservationTable) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM reservations", [])?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO reservations (name, version, record) VALUES (?1, ?2, ?3)",
            )?;
            for (name, reservation) in table {
                let record = serde_json::to_string(&encode_record(reservation))?;
                insert.execute(params![name, RECORD_VERSION, record])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Write a raw row, bypassing encoding. Used to seed legacy records.
    pub fn put_raw(
        &self,
        name: &str,
        version: Option<&str>,
        record: &str,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO reservations (name, version, record) VALUES (?1, ?2, ?3)",
            params![name, version, record],
        )?;
        Ok(())
    }
}

fn encode_record(reservation: &Reservation) -> ReservationRecord {
    let ports = reservation
        .port_map
        .iter()
        .map(|(label, lease)| {
            (
                label.clone(),
                LeaseRecord {
                    port: lease.port,
                    pid: lease.owner_pid,
                },
            )
        })
        .collect();
    ReservationRecord {
        port: reservation.primary_port().unwrap_or_default(),
        ports,
        pid: reservation.owner_pid,
        expires: reservation.expires_at.timestamp_millis(),
        version: RECORD_VERSION.to_string(),
    }
}

/// Decode a row into a reservation. A row is current when either its version
/// column or its own `version` field carries the marker, or it already has a
/// `ports` map. Anything else is read as a legacy single-port record and becomes
/// one `main` lease.
fn decode_record(version: Option<&str>, record: &str) -> Result<Reservation, String> {
    let value: Value =
        serde_json::from_str(record).map_err(|e| format!("invalid record: {}", e))?;
    let current = version == Some(RECORD_VERSION)
        || value.get("version").and_then(Value::as_str) == Some(RECORD_VERSION)
        || value.get("ports").is_some();

    if current {
        let record: ReservationRecord =
            serde_json::from_value(value).map_err(|e| format!("invalid record: {}", e))?;
        if record.ports.is_empty() {
            return Err("record has no ports".to_string());
        }
        let port_map = record
            .ports
            .into_iter()
            .map(|(label, lease)| {
                (
                    label,
                    PortLease {
                        port: lease.port,
                        owner_pid: normalize_pid(lease.pid),
                    },
                )
            })
            .collect();
        return Ok(Reservation {
            port_map,
            expires_at: from_millis(record.expires)?,
            owner_pid: normalize_pid(record.pid),
        });
    }

    let legacy: LegacyRecord =
        serde_json::from_value(value).map_err(|e| format!("invalid legacy record: {}", e))?;
    Ok(Reservation::single(
        legacy.port,
        normalize_pid(legacy.pid),
        from_millis(legacy.expires)?,
    ))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>, String> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or_else(|| format!("expiry {} out of range", millis))
}

fn normalize_pid(pid: Option<u32>) -> Option<u32> {
    pid.filter(|pid| *pid != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn expires_in(secs: i64) -> DateTime<Utc> {
        let at = Utc::now() + Duration::seconds(secs);
        // Stored at millisecond precision.
        DateTime::<Utc>::from_timestamp_millis(at.timestamp_millis()).unwrap()
    }

    #[test]
    fn legacy_record_becomes_main_lease() {
        let store = Store::in_memory().unwrap();
        let expires = expires_in(600);
        store
            .put_raw(
                "legacy",
                None,
                &format!(
                    r#"{{"port": 3001, "pid": 1234, "expires": {}}}"#,
                    expires.timestamp_millis()
                ),
            )
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.migrated, 1);
        assert_eq!(loaded.skipped, 0);

        let reservation = &loaded.table["legacy"];
        assert_eq!(reservation.ports().get("main"), Some(&3001));
        assert_eq!(reservation.ports().len(), 1);
        assert_eq!(reservation.owner_pid, Some(1234));
        assert_eq!(reservation.port_map["main"].owner_pid, Some(1234));
        assert_eq!(reservation.expires_at, expires);
    }

    #[test]
    fn saved_records_carry_current_version() {
        let mut store = Store::in_memory().unwrap();
        store
            .put_raw("legacy", Some("1.0.0"), r#"{"port": 3001, "pid": 0, "expires": 0}"#)
            .unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded.table["legacy"].owner_pid, None);
        store.save(&loaded.table).unwrap();

        let version: String = store
            .conn
            .query_row(
                "SELECT version FROM reservations WHERE name = 'legacy'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, RECORD_VERSION);

        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.migrated, 0);
        assert_eq!(reloaded.table, loaded.table);
    }

    #[test]
    fn multi_port_table_survives_save_and_load() {
        let mut ports = BTreeMap::new();
        ports.insert("web".to_string(), 3000);
        ports.insert("api".to_string(), 3001);
        let mut reservation = Reservation::new(&ports, Some(55), expires_in(60));
        reservation.port_map.get_mut("api").unwrap().owner_pid = None;

        let mut table = ReservationTable::new();
        table.insert("svc".to_string(), reservation);

        let mut store = Store::in_memory().unwrap();
        store.save(&table).unwrap();
        assert_eq!(store.load().unwrap().table, table);

        store.save(&ReservationTable::new()).unwrap();
        assert!(store.load().unwrap().table.is_empty());
    }

    #[test]
    fn undecodable_rows_are_skipped() {
        let store = Store::in_memory().unwrap();
        store.put_raw("garbage", None, "not json").unwrap();
        store
            .put_raw(
                "empty",
                Some(RECORD_VERSION),
                r#"{"port": 0, "ports": {}, "expires": 0, "version": "2.0.0"}"#,
            )
            .unwrap();
        store
            .put_raw("ok", None, r#"{"port": 3005, "expires": 0}"#)
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.skipped, 2);
        assert_eq!(loaded.table.len(), 1);
        assert!(loaded.table.contains_key("ok"));
    }

    #[test]
    fn multi_port_body_without_version_column_keeps_all_labels() {
        let store = Store::in_memory().unwrap();
        let expires = expires_in(600);
        let body = format!(
            concat!(
                r#"{{"port": 3100, "pid": 7, "expires": {}, "version": "2.0.0", "#,
                r#""ports": {{"main": {{"port": 3100, "pid": 7}}, "api": {{"port": 3101}}}}}}"#,
            ),
            expires.timestamp_millis()
        );
        store.put_raw("tagged", None, &body).unwrap();
        store
            .put_raw(
                "untagged",
                Some("1.0.0"),
                r#"{"ports": {"web": {"port": 3200}, "ws": {"port": 3201}}, "expires": 0}"#,
            )
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.skipped, 0);
        assert_eq!(loaded.migrated, 2);

        let tagged = &loaded.table["tagged"];
        assert_eq!(tagged.ports().len(), 2);
        assert_eq!(tagged.ports()["api"], 3101);
        assert_eq!(tagged.port_map["main"].owner_pid, Some(7));
        assert_eq!(tagged.expires_at, expires);

        let untagged = loaded.table["untagged"].ports();
        assert_eq!(untagged.keys().cloned().collect::<Vec<_>>(), vec!["web", "ws"]);
    }

    #[test]
    fn file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");

        let mut table = ReservationTable::new();
        table.insert("svc".to_string(), Reservation::single(3010, None, expires_in(60)));
        {
            let mut store = Store::open(&path).unwrap();
            assert_eq!(store.path(), Some(path.as_path()));
            store.save(&table).unwrap();
        }

        let store = Store::open(&path).unwrap();
        assert_eq!(store.load().unwrap().table, table);
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        fs::write(&path, "not a sqlite database\n".repeat(64)).unwrap();

        let store = Store::open_or_recover(&path).unwrap();
        assert!(store.load().unwrap().table.is_empty());
        assert!(dir.path().join("state.db.corrupt").exists());
    }
}

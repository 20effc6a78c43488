//! SQLite-backed instance registry
//!
//! Records are keyed by instance id. Every mutation is a single statement
//! under the connection lock, so concurrent callers can never lose one
//! another's writes or observe a half-applied change.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};

use crate::core::{validate_field, HistoryEntry, InstanceEvent, InstanceRecord, Settings};
use crate::error::RegistryError;

const RECORD_COLUMNS: &str = "owner, instance_id, credential, image, created_at";

/// Durable owner → instance → credential mapping
pub struct InstanceRegistry {
    conn: Mutex<Connection>,
}

impl InstanceRegistry {
    /// Open (or create) the registry database at `path`
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Enable WAL mode; other CLI processes may hold the write lock briefly
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.initialize()?;
        info!("Registry opened at {:?}", path);
        Ok(registry)
    }

    /// Registry that lives only as long as the value
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let registry = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        registry.initialize()?;
        Ok(registry)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, RegistryError> {
        self.conn.lock().map_err(|_| RegistryError::Poisoned)
    }

    /// Initialize database schema
    fn initialize(&self) -> Result<(), RegistryError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            -- Settings table
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            -- One row per registered instance
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                credential TEXT NOT NULL,
                image TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_instances_owner ON instances (owner);

            -- Instance history
            CREATE TABLE IF NOT EXISTS instance_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                owner TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_time TEXT NOT NULL,
                details TEXT
            );
            "#,
        )?;
        debug!("Registry schema initialized");
        Ok(())
    }

    // === Settings ===

    /// Load settings from database
    pub fn load_settings(&self) -> Result<Option<Settings>, RegistryError> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = 'orchestrator'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match json {
            Some(json) => {
                let mut settings: Settings = serde_json::from_str(&json)?;
                // Validate and fix any invalid values after deserialization
                settings.validate();
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    /// Save settings to database
    pub fn save_settings(&self, settings: &Settings) -> Result<(), RegistryError> {
        let json = serde_json::to_string(settings)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES ('orchestrator', ?1)",
            params![json],
        )?;
        debug!("Settings saved");
        Ok(())
    }

    // === Instances ===

    /// Register a new instance; fails if the id is already present
    pub fn insert(&self, record: &InstanceRecord) -> Result<(), RegistryError> {
        record.validate()?;
        let conn = self.conn()?;
        insert_row(&conn, record)?;
        debug!("Instance {} registered for {}", record.short_id(), record.owner);
        Ok(())
    }

    /// Register a new instance unless its owner already holds `limit` records.
    ///
    /// The count and the insert share one write transaction, so concurrent
    /// processes on the same database cannot both take the last slot.
    pub fn insert_within_quota(
        &self,
        record: &InstanceRecord,
        limit: usize,
    ) -> Result<(), RegistryError> {
        record.validate()?;
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let held: i64 = tx.query_row(
            "SELECT COUNT(*) FROM instances WHERE owner = ?1",
            params![record.owner],
            |row| row.get(0),
        )?;
        if held as usize >= limit {
            return Err(RegistryError::QuotaFull {
                owner: record.owner.clone(),
                limit,
            });
        }
        insert_row(&tx, record)?;
        tx.commit()?;

        debug!("Instance {} registered for {}", record.short_id(), record.owner);
        Ok(())
    }

    /// Swap in a freshly issued credential; the old one is gone afterwards
    pub fn replace_credential(
        &self,
        instance_id: &str,
        credential: &str,
    ) -> Result<(), RegistryError> {
        validate_field("credential", credential)?;
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE instances SET credential = ?1 WHERE instance_id = ?2",
            params![credential, instance_id],
        )?;
        if changed == 0 {
            return Err(RegistryError::NotPresent(instance_id.to_string()));
        }
        Ok(())
    }

    /// Remove a record; returns whether it existed
    pub fn delete(&self, instance_id: &str) -> Result<bool, RegistryError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM instances WHERE instance_id = ?1",
            params![instance_id],
        )?;
        Ok(changed > 0)
    }

    /// Exact lookup by full instance id
    pub fn get(&self, instance_id: &str) -> Result<Option<InstanceRecord>, RegistryError> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM instances WHERE instance_id = ?1", RECORD_COLUMNS);
        let record = conn
            .query_row(&sql, params![instance_id], record_from_row)
            .optional()?;
        Ok(record)
    }

    /// Resolve a prefix among the records of one owner
    pub fn find_by_owner_and_prefix(
        &self,
        owner: &str,
        prefix: &str,
    ) -> Result<InstanceRecord, RegistryError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(RegistryError::NotFound(prefix.to_string()));
        }
        let matches = self.query_records(
            &format!(
                "SELECT {} FROM instances
                 WHERE owner = ?1 AND substr(instance_id, 1, length(?2)) = ?2
                 ORDER BY instance_id",
                RECORD_COLUMNS
            ),
            params![owner, prefix],
        )?;
        single_match(prefix, matches)
    }

    /// Resolve a prefix across every owner (administrative lookups)
    pub fn find_by_id_prefix(&self, prefix: &str) -> Result<InstanceRecord, RegistryError> {
        let prefix = prefix.trim();
        if prefix.is_empty() {
            return Err(RegistryError::NotFound(prefix.to_string()));
        }
        let matches = self.query_records(
            &format!(
                "SELECT {} FROM instances
                 WHERE substr(instance_id, 1, length(?1)) = ?1
                 ORDER BY instance_id",
                RECORD_COLUMNS
            ),
            params![prefix],
        )?;
        single_match(prefix, matches)
    }

    pub fn list_by_owner(&self, owner: &str) -> Result<Vec<InstanceRecord>, RegistryError> {
        self.query_records(
            &format!(
                "SELECT {} FROM instances WHERE owner = ?1 ORDER BY created_at, instance_id",
                RECORD_COLUMNS
            ),
            params![owner],
        )
    }

    pub fn list_all(&self) -> Result<Vec<InstanceRecord>, RegistryError> {
        self.query_records(
            &format!(
                "SELECT {} FROM instances ORDER BY owner, created_at, instance_id",
                RECORD_COLUMNS
            ),
            [],
        )
    }

    /// Total number of registered instances
    pub fn count_all(&self) -> Result<usize, RegistryError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM instances", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn query_records<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<InstanceRecord>, RegistryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, record_from_row)?;

        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    // === History ===

    /// Record an instance event
    pub fn record_event(
        &self,
        record: &InstanceRecord,
        event: InstanceEvent,
        details: Option<&str>,
    ) -> Result<(), RegistryError> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO instance_history (instance_id, owner, event_type, event_time, details)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                record.instance_id,
                record.owner,
                event.as_str(),
                Utc::now().to_rfc3339(),
                details,
            ],
        )?;
        Ok(())
    }

    /// Get instance history, newest first
    pub fn history(&self, instance_id: &str) -> Result<Vec<HistoryEntry>, RegistryError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT instance_id, owner, event_type, event_time, details FROM instance_history
             WHERE instance_id = ?1 ORDER BY id DESC",
        )?;

        let history = stmt.query_map(params![instance_id], |row| {
            let time: String = row.get(3)?;
            Ok(HistoryEntry {
                instance_id: row.get(0)?,
                owner: row.get(1)?,
                event: row.get(2)?,
                time: parse_time(&time),
                details: row.get(4)?,
            })
        })?;

        let mut result = Vec::new();
        for event in history {
            result.push(event?);
        }
        Ok(result)
    }

    /// Clean up old history entries
    pub fn prune_history(&self, retention_days: u32) -> Result<usize, RegistryError> {
        if retention_days == 0 {
            return Ok(0); // Keep forever
        }

        let conn = self.conn()?;
        let cutoff = Utc::now()
            - chrono::TimeDelta::try_days(retention_days as i64)
                .unwrap_or_else(|| chrono::TimeDelta::days(30));
        let count = conn.execute(
            "DELETE FROM instance_history WHERE event_time < ?1",
            params![cutoff.to_rfc3339()],
        )?;

        debug!("Cleaned up {} old history entries", count);
        Ok(count)
    }
}

fn insert_row(conn: &Connection, record: &InstanceRecord) -> Result<(), RegistryError> {
    let result = conn.execute(
        "INSERT INTO instances (instance_id, owner, credential, image, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.instance_id,
            record.owner,
            record.credential,
            record.image,
            record.created_at.to_rfc3339(),
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(RegistryError::DuplicateId(record.instance_id.clone()))
        }
        Err(e) => Err(e.into()),
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<InstanceRecord> {
    let created_at: String = row.get(4)?;
    Ok(InstanceRecord {
        owner: row.get(0)?,
        instance_id: row.get(1)?,
        credential: row.get(2)?,
        image: row.get(3)?,
        created_at: parse_time(&created_at),
    })
}

fn parse_time(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Exactly one match, or a NotFound / AmbiguousId error
fn single_match(
    prefix: &str,
    mut matches: Vec<InstanceRecord>,
) -> Result<InstanceRecord, RegistryError> {
    match matches.len() {
        0 => Err(RegistryError::NotFound(prefix.to_string())),
        1 => Ok(matches.remove(0)),
        n => Err(RegistryError::AmbiguousId {
            prefix: prefix.to_string(),
            matches: n,
        }),
    }
}

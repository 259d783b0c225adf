//! SQLite storage for preference profiles

use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::preferences::{PreferenceCategory, PreferenceEntry};

/// SQLite storage backend
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// A private database that disappears with the connection
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert or replace a preference for an owner
    pub fn save_preference(&self, owner: &str, entry: &PreferenceEntry) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        conn.execute(
            r#"
            INSERT INTO preferences (owner, key, value, confidence, category, last_updated)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(owner, key) DO UPDATE SET
                value = excluded.value,
                confidence = excluded.confidence,
                category = excluded.category,
                last_updated = excluded.last_updated
            "#,
            params![
                owner,
                entry.key,
                serde_json::to_string(&entry.value)?,
                entry.confidence,
                entry.category.to_string(),
                entry.last_updated.to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Delete a preference; returns whether a row existed
    pub fn delete_preference(&self, owner: &str, key: &str) -> Result<bool> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let removed = conn.execute(
            "DELETE FROM preferences WHERE owner = ?1 AND key = ?2",
            params![owner, key],
        )?;
        Ok(removed > 0)
    }

    /// Load every preference stored for an owner, most confident first
    pub fn load_preferences(&self, owner: &str) -> Result<Vec<PreferenceEntry>> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;

        let mut stmt = conn.prepare(
            r#"
            SELECT key, value, confidence, category, last_updated
            FROM preferences WHERE owner = ?1
            ORDER BY confidence DESC, key
            "#,
        )?;

        let rows = stmt.query_map(params![owner], |row| {
            Ok(PreferenceRow {
                key: row.get(0)?,
                value: row.get(1)?,
                confidence: row.get(2)?,
                category: row.get(3)?,
                last_updated: row.get(4)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    /// Number of stored preferences across all owners
    pub fn count_preferences(&self) -> Result<usize> {
        let conn = self.conn.lock().map_err(|e| Error::storage(e.to_string()))?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM preferences", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Intermediate struct for reading from SQLite
struct PreferenceRow {
    key: String,
    value: String,
    confidence: f64,
    category: String,
    last_updated: String,
}

impl PreferenceRow {
    fn into_entry(self) -> Result<PreferenceEntry> {
        let category = PreferenceCategory::parse(&self.category)
            .ok_or_else(|| Error::storage(format!("Unknown category: {}", self.category)))?;

        Ok(PreferenceEntry {
            key: self.key,
            value: serde_json::from_str(&self.value)?,
            confidence: self.confidence,
            category,
            last_updated: chrono::DateTime::parse_from_rfc3339(&self.last_updated)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| Error::storage(e.to_string()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::PreferenceValue;
    use chrono::Utc;

    fn entry(key: &str, confidence: f64) -> PreferenceEntry {
        PreferenceEntry {
            key: key.into(),
            value: PreferenceValue::List(vec!["git".into(), "docker".into()]),
            confidence,
            category: PreferenceCategory::Tools,
            last_updated: Utc::now(),
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_preference("alice", &entry("preferred_tools", 0.55)).unwrap();

        let loaded = storage.load_preferences("alice").unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, "preferred_tools");
        assert_eq!(
            loaded[0].value,
            PreferenceValue::List(vec!["git".into(), "docker".into()])
        );
        assert!(storage.load_preferences("bob").unwrap().is_empty());
    }

    #[test]
    fn save_overwrites_existing_key() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_preference("alice", &entry("preferred_tools", 0.5)).unwrap();
        storage.save_preference("alice", &entry("preferred_tools", 0.9)).unwrap();

        let loaded = storage.load_preferences("alice").unwrap();
        assert_eq!(loaded.len(), 1);
        assert!((loaded[0].confidence - 0.9).abs() < 1e-9);
        assert_eq!(storage.count_preferences().unwrap(), 1);
    }

    #[test]
    fn delete_reports_presence() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.save_preference("alice", &entry("preferred_tools", 0.5)).unwrap();

        assert!(storage.delete_preference("alice", "preferred_tools").unwrap());
        assert!(!storage.delete_preference("alice", "preferred_tools").unwrap());
    }

    #[test]
    fn persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.db");
        {
            let storage = SqliteStorage::open(&path).unwrap();
            storage.save_preference("alice", &entry("preferred_tools", 0.5)).unwrap();
        }
        let reopened = SqliteStorage::open(&path).unwrap();
        assert_eq!(reopened.load_preferences("alice").unwrap().len(), 1);
    }
}

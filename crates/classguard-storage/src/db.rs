use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

use crate::migrations;

/// SQLite-backed document store for agent state.
///
/// Every value is a JSON document addressed by a string key. Writes are
/// last-write-wins; there is no cross-key transaction.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the store at `db_path`, defaulting to the local data dir.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation, connection opening, or schema initialization fails
    pub fn new(db_path: Option<PathBuf>) -> Result<Self> {
        let path = db_path.unwrap_or_else(Self::default_db_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path).context("Failed to open database connection")?;
        migrations::init_schema(&conn)?;

        log::info!("Agent store initialized at: {}", path.display());
        Ok(Self { conn })
    }

    /// Open a throwaway in-memory store.
    ///
    /// # Errors
    ///
    /// Returns an error if schema initialization fails
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        migrations::init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Open the store inside `data_dir`.
    ///
    /// # Errors
    ///
    /// Same as [`Database::new`]
    pub fn open_in(data_dir: &Path) -> Result<Self> {
        Self::new(Some(data_dir.join("classguard.db")))
    }

    fn default_db_path() -> PathBuf {
        let mut path = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        path.push("classguard");
        path.push("classguard.db");
        path
    }

    /// Load and decode the document stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored JSON does not decode into `T`
    pub fn get_document<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM agent_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => {
                let value = serde_json::from_str(&json)
                    .with_context(|| format!("Failed to decode stored document '{key}'"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Encode `value` as JSON and upsert it under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the insert fails
    pub fn put_document<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO agent_state (key, value, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Remove the document under `key`. Returns whether a row was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the delete fails
    pub fn delete_document(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM agent_state WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    /// When the document under `key` was last written.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored timestamp is not RFC 3339
    pub fn document_updated_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let updated = self
            .conn
            .query_row(
                "SELECT updated_at FROM agent_state WHERE key = ?1",
                params![key],
                |row| {
                    let raw: String = row.get(0)?;
                    DateTime::parse_from_rfc3339(&raw)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                        })
                },
            )
            .optional()?;
        Ok(updated)
    }

    /// All stored keys, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM agent_state ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }
}

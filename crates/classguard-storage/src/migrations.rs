use anyhow::Result;
use rusqlite::Connection;

/// Current schema version, stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize database schema
///
/// # Errors
///
/// Returns an error if table creation or the version bump fails
pub fn init_schema(conn: &Connection) -> Result<()> {
    // Agent state - one JSON document per key (policy snapshot, saved sessions, flags)
    conn.execute(
        "CREATE TABLE IF NOT EXISTS agent_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if version < SCHEMA_VERSION {
        log::debug!("Migrating agent store schema from v{version} to v{SCHEMA_VERSION}");
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    Ok(())
}

//! SQLite layout of a store file
//!
//! Records are stored as JSON payloads keyed by id. `store_meta` keeps the
//! layout version and the fingerprint of the application schema the store
//! was created with.

use rusqlite::{params, Connection, OptionalExtension, Result};

/// Current layout version
pub const LAYOUT_VERSION: i32 = 1;

/// Meta key holding the application schema fingerprint
pub const SCHEMA_KEY: &str = "schema";

/// Initialize the store layout
pub fn init_layout(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            entity TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        -- Entity scans
        CREATE INDEX IF NOT EXISTS idx_records_entity ON records(entity);
        "#,
    )?;

    set_meta(conn, "version", &LAYOUT_VERSION.to_string())?;

    Ok(())
}

/// Check if the layout needs initialization or upgrade
pub fn needs_init(conn: &Connection) -> bool {
    let table_exists: bool = conn
        .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name='store_meta'")
        .and_then(|mut stmt| stmt.exists([]))
        .unwrap_or(false);

    if !table_exists {
        return true;
    }

    match get_meta(conn, "version") {
        Ok(Some(v)) => v.parse::<i32>().map(|v| v < LAYOUT_VERSION).unwrap_or(true),
        _ => true,
    }
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM store_meta WHERE key = ?",
        [key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO store_meta (key, value) VALUES (?, ?)",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_layout() {
        let conn = Connection::open_in_memory().unwrap();
        assert!(needs_init(&conn));

        init_layout(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"records".to_string()));
        assert!(tables.contains(&"store_meta".to_string()));
        assert!(!needs_init(&conn));
    }

    #[test]
    fn test_meta_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        init_layout(&conn).unwrap();

        assert_eq!(get_meta(&conn, SCHEMA_KEY).unwrap(), None);
        set_meta(&conn, SCHEMA_KEY, "Notes+Tags").unwrap();
        assert_eq!(
            get_meta(&conn, SCHEMA_KEY).unwrap().as_deref(),
            Some("Notes+Tags")
        );
    }
}

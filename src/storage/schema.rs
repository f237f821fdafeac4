//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

/// Columns added to `inference_results` after the first release. Older
/// databases get them on open.
const RESULT_COLUMNS_ADDED: &[(&str, &str)] = &[
    ("application", "TEXT"),
    ("content_type", "TEXT"),
    ("topic", "TEXT"),
    ("action", "TEXT"),
    ("visible_text", "TEXT"),
    ("detected_objects_json", "TEXT"),
];

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS activity_events (
            id INTEGER PRIMARY KEY,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            process_id INTEGER,
            process_name TEXT,
            window_title TEXT,
            is_idle INTEGER NOT NULL DEFAULT 0,
            idle_duration_secs INTEGER,
            metadata TEXT
        );

        CREATE TABLE IF NOT EXISTS inference_results (
            id INTEGER PRIMARY KEY,
            request_id TEXT NOT NULL UNIQUE,
            processed_at TEXT NOT NULL,
            activity_label TEXT NOT NULL,
            summary TEXT NOT NULL,
            confidence REAL NOT NULL,
            raw_response TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_activity_events_timestamp ON activity_events(timestamp);
        CREATE INDEX IF NOT EXISTS idx_activity_events_type ON activity_events(event_type);
        CREATE INDEX IF NOT EXISTS idx_activity_events_process ON activity_events(process_name);
        CREATE INDEX IF NOT EXISTS idx_inference_results_processed ON inference_results(processed_at);
        CREATE INDEX IF NOT EXISTS idx_inference_results_label ON inference_results(activity_label);",
    )?;

    for (column, ty) in RESULT_COLUMNS_ADDED {
        let present: i32 = conn.query_row(
            "SELECT count(*) FROM pragma_table_info('inference_results') WHERE name = ?1",
            [column],
            |row| row.get(0),
        )?;
        if present == 0 {
            conn.execute(
                &format!("ALTER TABLE inference_results ADD COLUMN {} {}", column, ty),
                [],
            )?;
            info!(column, "added column to inference_results");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM activity_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM inference_results", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }

    #[test]
    fn test_migrate_adds_missing_columns() {
        let conn = Connection::open_in_memory().unwrap();
        // Shape of a first-release database.
        conn.execute_batch(
            "CREATE TABLE inference_results (
                id INTEGER PRIMARY KEY,
                request_id TEXT NOT NULL UNIQUE,
                processed_at TEXT NOT NULL,
                activity_label TEXT NOT NULL,
                summary TEXT NOT NULL,
                confidence REAL NOT NULL,
                raw_response TEXT
            );",
        )
        .unwrap();

        migrate(&conn).unwrap();

        let columns: i64 = conn
            .query_row(
                "SELECT count(*) FROM pragma_table_info('inference_results')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(columns, 7 + RESULT_COLUMNS_ADDED.len() as i64);
    }
}

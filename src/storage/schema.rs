//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS entity_profiles (
            entity_id TEXT PRIMARY KEY,
            entity_type TEXT NOT NULL,
            profile_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            alert_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            score REAL NOT NULL,
            confidence REAL NOT NULL,
            occurrence_count INTEGER NOT NULL DEFAULT 1,
            context_json TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'new',
            created_at TEXT NOT NULL,
            acknowledged_at TEXT,
            acknowledged_by TEXT,
            escalated_at TEXT,
            closed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS mitigations (
            id TEXT PRIMARY KEY,
            entity_id TEXT NOT NULL,
            action_type TEXT NOT NULL,
            triggering_alert_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'active',
            enact_state TEXT NOT NULL DEFAULT 'pending',
            applied_at TEXT NOT NULL,
            ttl_secs INTEGER NOT NULL,
            expires_at TEXT NOT NULL,
            revoked_by TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_alerts_entity_type
            ON alerts(entity_id, alert_type, status);
        CREATE INDEX IF NOT EXISTS idx_alerts_created ON alerts(created_at);
        CREATE INDEX IF NOT EXISTS idx_mitigations_entity
            ON mitigations(entity_id, action_type, status);
        CREATE INDEX IF NOT EXISTS idx_mitigations_expiry
            ON mitigations(status, expires_at);",
    )?;

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
            .query_row("SELECT COUNT(*) FROM alerts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM mitigations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM entity_profiles", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error
    }
}

//! Schema upgrades for the CareLink store.
//!
//! `PRAGMA user_version` records the last step applied. Opening a database
//! applies every later step from [`STEPS`] in order, each inside its own
//! transaction so a failed step leaves the version where it was.

pub mod v001_initial;

use rusqlite::Connection;
use tracing::{info, warn};

use crate::error::{Result, StoreError};

type Step = fn(&Connection) -> rusqlite::Result<()>;

/// Schema steps; the position plus one is the version a step produces.
const STEPS: &[(&str, Step)] = &[("v001_initial", v001_initial::up)];

pub fn schema_version(conn: &Connection) -> Result<u32> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Bring the settings and history tables up to the newest schema.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let known = STEPS.len() as u32;
    let current = schema_version(conn)?;

    if current > known {
        warn!(current, known, "Database written by a newer CareLink, leaving schema as is");
        return Ok(());
    }

    for (version, (name, step)) in (1u32..).zip(STEPS).skip(current as usize) {
        info!(version, step = *name, "Upgrading store schema");
        let tx = conn.unchecked_transaction()?;
        step(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", version)?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_connection_reaches_latest_version() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 0);

        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), STEPS.len() as u32);

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('settings', 'messages')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }

    #[test]
    fn newer_schema_is_left_untouched() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", 99).unwrap();

        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 99);
        let tables: i64 = conn
            .query_row("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(tables, 0);
    }
}

//! Sync coordinator: externally-scheduled send-then-fetch cycles over the
//! dirty-row store, with per-table server watermarks.

use rusqlite::{Connection, OptionalExtension};

use crate::database::Database;
use crate::dirty::DirtyRow;
use crate::error::{DbError, DbResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncState {
    Idle,
    Sending,
    Fetching,
    Failed,
}

/// Drives one sync cycle at a time. Has no internal timer (Open Question 1,
/// decided in favor of external scheduling) — callers invoke
/// [`SyncCoordinator::perform_sync`] on whatever cadence suits the host.
pub struct SyncCoordinator {
    state: std::sync::Mutex<SyncState>,
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self { state: std::sync::Mutex::new(SyncState::Idle) }
    }

    /// Create `__sync_server_timestamps` if it does not already exist. The
    /// table is normally created by `Database::open`'s system schema; this is
    /// a defensive no-op when that has already happened.
    pub fn init(conn: &Connection) -> DbResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS __sync_server_timestamps ( \
                table_name TEXT PRIMARY KEY, \
                server_timestamp TEXT NOT NULL, \
                updated_at TEXT NOT NULL \
            );",
        )?;
        Ok(())
    }

    pub fn get_table_timestamp(conn: &Connection, table: &str) -> DbResult<Option<String>> {
        let ts: Option<String> = conn
            .query_row(
                "SELECT server_timestamp FROM __sync_server_timestamps WHERE table_name = ?1",
                [table],
                |r| r.get(0),
            )
            .optional()?;
        Ok(ts)
    }

    pub fn update_table_timestamp(conn: &Connection, table: &str, timestamp: &str) -> DbResult<()> {
        let updated_at = chrono::Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO __sync_server_timestamps(table_name, server_timestamp, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(table_name) DO UPDATE SET server_timestamp = excluded.server_timestamp, \
                 updated_at = excluded.updated_at",
            [table, timestamp, &updated_at],
        )?;
        Ok(())
    }

    /// Run one sync cycle: push every pending dirty row via `on_send`, then
    /// hand control to `on_fetch` to pull and apply remote changes.
    ///
    /// `on_send` receives the full pending batch and returns whether the
    /// server accepted it; on rejection the dirty rows are left in place for
    /// the next cycle. `on_fetch` is handed the [`Database`] itself so it can
    /// apply incoming rows through the write path with `Origin::Remote`
    /// (which performs LWW arbitration on ingest) and update watermarks via
    /// [`SyncCoordinator::update_table_timestamp`].
    ///
    /// Refuses to run while a cycle is already in progress, or after a prior
    /// cycle failed until [`SyncCoordinator::reset`] is called.
    pub fn perform_sync<S, F>(&self, db: &Database, on_send: S, on_fetch: F) -> DbResult<()>
    where
        S: FnOnce(&[DirtyRow]) -> DbResult<bool>,
        F: FnOnce(&Database) -> DbResult<()>,
    {
        {
            let mut state = self.state.lock().expect("sync coordinator mutex poisoned");
            if *state != SyncState::Idle {
                return Err(DbError::Sync(format!("cannot start sync from state {:?}", *state)));
            }
            *state = SyncState::Sending;
        }

        let result = self.run_cycle(db, on_send, on_fetch);

        let mut state = self.state.lock().expect("sync coordinator mutex poisoned");
        *state = match &result {
            Ok(()) => SyncState::Idle,
            Err(err) => {
                tracing::error!(error = %err, "sync cycle failed");
                SyncState::Failed
            }
        };
        result
    }

    fn run_cycle<S, F>(&self, db: &Database, on_send: S, on_fetch: F) -> DbResult<()>
    where
        S: FnOnce(&[DirtyRow]) -> DbResult<bool>,
        F: FnOnce(&Database) -> DbResult<()>,
    {
        let pending = db.dirty().get_all(db.connection())?;
        if !pending.is_empty() {
            let accepted = on_send(&pending)?;
            if !accepted {
                return Err(DbError::Sync("server rejected pending changes".into()));
            }
            db.dirty().remove(db.connection(), &pending)?;
            tracing::debug!(count = pending.len(), "pushed pending dirty rows");
        }

        {
            let mut state = self.state.lock().expect("sync coordinator mutex poisoned");
            *state = SyncState::Fetching;
        }
        on_fetch(db)?;
        Ok(())
    }

    /// Clear a [`SyncState::Failed`] cycle so a new one can start. No-op
    /// (returns an error) if the coordinator is not currently failed.
    pub fn reset(&self) -> DbResult<()> {
        let mut state = self.state.lock().expect("sync coordinator mutex poisoned");
        if *state != SyncState::Failed {
            return Err(DbError::Sync("reset is only valid from the failed state".into()));
        }
        *state = SyncState::Idle;
        Ok(())
    }

    pub fn is_idle(&self) -> bool {
        *self.state.lock().expect("sync coordinator mutex poisoned") == SyncState::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseConfig;
    use crate::schema::model::{Column, ColumnType, Schema, Table};
    use crate::write::{Origin, ValueMap, WriteValue};

    fn schema() -> Schema {
        Schema::new().declare(Table::new("notes").column(Column::new("body", ColumnType::Text).lww()))
    }

    #[test]
    fn pending_rows_are_removed_after_accepted_send() {
        let db = Database::open_in_memory(schema(), DatabaseConfig::default()).unwrap();
        let mut values = ValueMap::new();
        values.insert("body".into(), WriteValue::Text("hi".into()));
        db.write_path().insert("notes", values, Origin::Local).unwrap();
        assert_eq!(db.dirty().get_all(db.connection()).unwrap().len(), 1);

        let coordinator = SyncCoordinator::new();
        coordinator.perform_sync(&db, |_batch| Ok(true), |_db| Ok(())).unwrap();

        assert!(db.dirty().get_all(db.connection()).unwrap().is_empty());
        assert!(coordinator.is_idle());
    }

    #[test]
    fn rejected_send_leaves_dirty_rows_and_enters_failed_state() {
        let db = Database::open_in_memory(schema(), DatabaseConfig::default()).unwrap();
        let mut values = ValueMap::new();
        values.insert("body".into(), WriteValue::Text("hi".into()));
        db.write_path().insert("notes", values, Origin::Local).unwrap();

        let coordinator = SyncCoordinator::new();
        let result = coordinator.perform_sync(&db, |_batch| Ok(false), |_db| Ok(()));
        assert!(result.is_err());
        assert_eq!(db.dirty().get_all(db.connection()).unwrap().len(), 1);
        assert!(!coordinator.is_idle());

        assert!(coordinator.perform_sync(&db, |_| Ok(true), |_| Ok(())).is_err());
        coordinator.reset().unwrap();
        coordinator.perform_sync(&db, |_batch| Ok(true), |_db| Ok(())).unwrap();
        assert!(db.dirty().get_all(db.connection()).unwrap().is_empty());
    }

    #[test]
    fn watermarks_round_trip() {
        let db = Database::open_in_memory(schema(), DatabaseConfig::default()).unwrap();
        assert_eq!(SyncCoordinator::get_table_timestamp(db.connection(), "notes").unwrap(), None);
        SyncCoordinator::update_table_timestamp(db.connection(), "notes", "2024-01-01T00:00:00Z").unwrap();
        assert_eq!(
            SyncCoordinator::get_table_timestamp(db.connection(), "notes").unwrap(),
            Some("2024-01-01T00:00:00Z".to_string())
        );
    }

    #[test]
    fn on_fetch_can_apply_remote_rows_through_the_database() {
        let db = Database::open_in_memory(schema(), DatabaseConfig::default()).unwrap();
        let coordinator = SyncCoordinator::new();

        coordinator
            .perform_sync(
                &db,
                |_batch| Ok(true),
                |db| {
                    let mut values = ValueMap::new();
                    values.insert("system_id".into(), WriteValue::Text("remote-1".into()));
                    values.insert("body".into(), WriteValue::Text("from server".into()));
                    db.write_path().upsert("notes", values, &["system_id"], Origin::Remote)?;
                    SyncCoordinator::update_table_timestamp(db.connection(), "notes", "watermark-1")?;
                    Ok(())
                },
            )
            .unwrap();

        let rows = db.query(crate::query::builder::Query::from("notes")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            SyncCoordinator::get_table_timestamp(db.connection(), "notes").unwrap(),
            Some("watermark-1".to_string())
        );
        // Applying a row through the write path with Origin::Remote must not
        // itself produce a dirty-row marker.
        assert!(db.dirty().get_all(db.connection()).unwrap().is_empty());
    }
}

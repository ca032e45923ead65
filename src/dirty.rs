//! `__dirty_rows` store: an append/replace log of pending local mutations
//! with a reactive notification channel.

use std::sync::{Mutex, Weak};

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use crate::error::DbResult;

/// One pending-sync marker.
#[derive(Debug, Clone, PartialEq)]
pub struct DirtyRow {
    pub table_name: String,
    pub row_id: String,
    pub hlc: String,
    pub is_full_row: bool,
    pub data: Option<Value>,
}

type Listener = dyn Fn(&DirtyRow) + Send + Sync;

/// Append/replace log over `__dirty_rows`, with a lock-protected vector of
/// weak subscriber handles as the broadcast channel — the synchronous
/// analogue of a pub/sub queue, per the design notes.
pub struct DirtyRowStore {
    listeners: Mutex<Vec<Weak<Listener>>>,
}

impl Default for DirtyRowStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DirtyRowStore {
    pub fn new() -> Self {
        Self { listeners: Mutex::new(Vec::new()) }
    }

    /// Create `__dirty_rows` if it does not already exist. The table itself
    /// is normally created by the migrator as part of the system schema;
    /// this is a defensive no-op when that has already happened.
    pub fn init(&self, conn: &Connection) -> DbResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS __dirty_rows ( \
                table_name TEXT NOT NULL, \
                row_id TEXT NOT NULL, \
                hlc TEXT NOT NULL, \
                is_full_row INTEGER NOT NULL, \
                data TEXT, \
                PRIMARY KEY(table_name, row_id) \
            );",
        )?;
        Ok(())
    }

    /// `INSERT OR REPLACE` keyed by `(table, row_id)`, then fan out to every
    /// live subscriber.
    pub fn add(
        &self,
        conn: &Connection,
        table: &str,
        row_id: &str,
        hlc: &str,
        is_full_row: bool,
        data: Option<&Value>,
    ) -> DbResult<()> {
        conn.execute(
            "INSERT OR REPLACE INTO __dirty_rows(table_name, row_id, hlc, is_full_row, data) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![table, row_id, hlc, is_full_row as i64, data.map(|v| v.to_string())],
        )?;
        let row = DirtyRow {
            table_name: table.to_string(),
            row_id: row_id.to_string(),
            hlc: hlc.to_string(),
            is_full_row,
            data: data.cloned(),
        };
        self.publish(&row);
        Ok(())
    }

    pub fn get_all(&self, conn: &Connection) -> DbResult<Vec<DirtyRow>> {
        let mut stmt = conn.prepare(
            "SELECT table_name, row_id, hlc, is_full_row, data FROM __dirty_rows ORDER BY hlc ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let data_raw: Option<String> = row.get(4)?;
                Ok(DirtyRow {
                    table_name: row.get(0)?,
                    row_id: row.get(1)?,
                    hlc: row.get(2)?,
                    is_full_row: row.get::<_, i64>(3)? != 0,
                    data: data_raw.and_then(|s| serde_json::from_str(&s).ok()),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete the given markers, matching on every field (table, row_id,
    /// hlc, is_full_row) so a marker superseded by a newer write is left
    /// untouched (invariant 4).
    pub fn remove(&self, conn: &Connection, rows: &[DirtyRow]) -> DbResult<()> {
        for row in rows {
            conn.execute(
                "DELETE FROM __dirty_rows WHERE table_name=?1 AND row_id=?2 AND hlc=?3 AND is_full_row=?4",
                params![row.table_name, row.row_id, row.hlc, row.is_full_row as i64],
            )?;
        }
        Ok(())
    }

    pub fn clear(&self, conn: &Connection) -> DbResult<()> {
        conn.execute("DELETE FROM __dirty_rows", [])?;
        Ok(())
    }

    pub fn exists(&self, conn: &Connection, table: &str, row_id: &str) -> DbResult<bool> {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM __dirty_rows WHERE table_name=?1 AND row_id=?2",
                params![table, row_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Register a subscriber. The caller owns the returned `Arc` — once it is
    /// dropped the listener stops receiving events (lazily pruned on the
    /// next publish).
    pub fn on_row_added(&self, listener: Weak<Listener>) {
        self.listeners.lock().expect("dirty row listeners mutex poisoned").push(listener);
    }

    fn publish(&self, row: &DirtyRow) {
        let mut listeners = self.listeners.lock().expect("dirty row listeners mutex poisoned");
        listeners.retain(|weak| {
            if let Some(listener) = weak.upgrade() {
                listener(row);
                true
            } else {
                false
            }
        });
    }

    /// Drop all subscribers, closing the channel.
    pub fn dispose(&self) {
        self.listeners.lock().expect("dirty row listeners mutex poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn add_then_get_all_then_remove() {
        let conn = Connection::open_in_memory().unwrap();
        let store = DirtyRowStore::new();
        store.init(&conn).unwrap();
        store.add(&conn, "users", "u1", "1:0:n1", true, None).unwrap();
        let all = store.get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        store.remove(&conn, &all).unwrap();
        assert!(store.get_all(&conn).unwrap().is_empty());
    }

    #[test]
    fn add_replaces_existing_marker_for_same_row() {
        let conn = Connection::open_in_memory().unwrap();
        let store = DirtyRowStore::new();
        store.init(&conn).unwrap();
        store.add(&conn, "users", "u1", "1:0:n1", true, None).unwrap();
        store.add(&conn, "users", "u1", "1:1:n1", false, Some(&serde_json::json!({"name": "B"}))).unwrap();
        let all = store.get_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].hlc, "1:1:n1");
    }

    #[test]
    fn subscribers_see_every_add_but_not_past_events() {
        let conn = Connection::open_in_memory().unwrap();
        let store = DirtyRowStore::new();
        store.init(&conn).unwrap();
        store.add(&conn, "users", "u0", "0:0:n1", true, None).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        let listener: Arc<Listener> = Arc::new(move |_row: &DirtyRow| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });
        store.on_row_added(Arc::downgrade(&listener));

        store.add(&conn, "users", "u1", "1:0:n1", true, None).unwrap();
        store.add(&conn, "users", "u2", "2:0:n1", true, None).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropped_subscriber_is_pruned_lazily() {
        let conn = Connection::open_in_memory().unwrap();
        let store = DirtyRowStore::new();
        store.init(&conn).unwrap();
        let listener: Arc<Listener> = Arc::new(|_row: &DirtyRow| {});
        store.on_row_added(Arc::downgrade(&listener));
        drop(listener);
        // Should not panic even though the weak handle is now dead.
        store.add(&conn, "users", "u1", "1:0:n1", true, None).unwrap();
        assert!(store.listeners.lock().unwrap().is_empty());
    }
}

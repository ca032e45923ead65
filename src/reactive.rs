//! Reactive query manager: register subscriptions, fan out table-change
//! events, re-run affected queries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use rusqlite::Connection;

use crate::error::DbResult;
use crate::query::builder::Query;
use crate::query::deps::dependencies_of;
use crate::query::exec::{execute, Row};
use crate::schema::model::Schema;

type ResultHandler = dyn Fn(DbResult<Vec<Row>>) + Send + Sync;

struct Subscriber {
    id: u64,
    query: Query,
    deps: HashSet<String>,
    on_result: Arc<ResultHandler>,
}

/// Registry of live subscribers. Re-execution on a table change happens in
/// registration order.
///
/// The manager does not hold a `Connection` itself — SQLite connections are
/// not `Sync`, so re-execution is driven by whoever does hold one (the
/// `Database` facade) calling [`ReactiveManager::notify`] after a write
/// commits.
pub struct ReactiveManager {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

/// A live subscription. Dropping it synchronously unregisters the
/// subscriber.
pub struct Subscription {
    id: u64,
    manager: Weak<ReactiveManager>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe(self.id);
        }
    }
}

impl ReactiveManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { subscribers: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) })
    }

    /// Subscribe to `query`, running it immediately against `conn` and
    /// delivering the first result synchronously before returning.
    pub fn subscribe(
        self: &Arc<Self>,
        conn: &Connection,
        schema: &Schema,
        query: Query,
        on_result: impl Fn(DbResult<Vec<Row>>) + Send + Sync + 'static,
    ) -> Subscription {
        let deps = dependencies_of(&query, schema);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let on_result: Arc<ResultHandler> = Arc::new(on_result);

        let first = execute(conn, &query, schema).map_err(Into::into);
        on_result(first);

        self.subscribers
            .lock()
            .expect("reactive manager subscribers mutex poisoned")
            .push(Subscriber { id, query, deps, on_result });

        Subscription { id, manager: Arc::downgrade(self) }
    }

    /// Re-run every subscriber whose dependency set intersects
    /// `changed_table`, in registration order.
    pub fn notify(&self, conn: &Connection, schema: &Schema, changed_table: &str) {
        let snapshot: Vec<(Query, Arc<ResultHandler>)> = {
            let subs = self.subscribers.lock().expect("reactive manager subscribers mutex poisoned");
            subs.iter()
                .filter(|s| crate::query::deps::intersects(&s.deps, changed_table))
                .map(|s| (s.query.clone(), Arc::clone(&s.on_result)))
                .collect()
        };
        for (query, on_result) in snapshot {
            let result = execute(conn, &query, schema).map_err(Into::into);
            on_result(result);
        }
    }

    /// Re-run every subscriber unconditionally, used after a sync fetch
    /// touches an unknown set of tables.
    pub fn notify_all(&self, conn: &Connection, schema: &Schema) {
        let snapshot: Vec<(Query, Arc<ResultHandler>)> = {
            let subs = self.subscribers.lock().expect("reactive manager subscribers mutex poisoned");
            subs.iter().map(|s| (s.query.clone(), Arc::clone(&s.on_result))).collect()
        };
        for (query, on_result) in snapshot {
            let result = execute(conn, &query, schema).map_err(Into::into);
            on_result(result);
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.lock().expect("reactive manager subscribers mutex poisoned");
        subs.retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("reactive manager subscribers mutex poisoned").len()
    }
}

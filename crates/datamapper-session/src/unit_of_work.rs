//! Per-session transaction scope.
//!
//! A [`UnitOfWork`] tracks the ambient transaction of one session: the
//! nesting depth, the physical connections enlisted so far (one per
//! connection string, opened lazily on first use), and the writes staged
//! inside the scope.
//!
//! Staged writes form an overlay that reads in the same session consult
//! first, so a save followed by a get inside one scope sees the saved state.
//! The overlay, together with its "entity updated" events, is published to
//! the shared cache only when the outermost scope commits. Rollback throws
//! it away.
//!
//! Only the outermost scope talks to storage; nested scopes just adjust the
//! depth, and an inner rollback poisons the whole transaction.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use asupersync::{Cx, Outcome};
use datamapper_core::{
    Connection, ConnectionFactory, EntityRef, Error, TransactionError, TransactionErrorKind, Value,
};
use datamapper_pool::{Pool, PooledConnection};

use crate::cache::{CacheWrite, ObjectCache};
use crate::events::{EntityUpdated, NotificationHub};

/// A connection borrowed for one operation.
///
/// Outside a transaction this is a plain pool checkout, returned to the pool
/// when the lease drops. Inside a transaction it is a handle to the
/// connection enlisted for that connection string.
pub enum Lease<F: ConnectionFactory> {
    Pooled(PooledConnection<F>),
    Enlisted(Arc<PooledConnection<F>>),
}

impl<F: ConnectionFactory> std::ops::Deref for Lease<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        match self {
            Lease::Pooled(conn) => &**conn,
            Lease::Enlisted(conn) => &***conn,
        }
    }
}

#[derive(Debug, Clone)]
struct Staged {
    id: Value,
    /// `None` for a staged delete.
    entity: Option<EntityRef>,
}

struct State<F: ConnectionFactory> {
    depth: usize,
    rollback_only: bool,
    connections: Vec<(String, Arc<PooledConnection<F>>)>,
    overlay: HashMap<(TypeId, u64), Staged>,
    touched: Vec<TypeId>,
    pending: Vec<(CacheWrite, EntityUpdated)>,
}

impl<F: ConnectionFactory> Default for State<F> {
    fn default() -> Self {
        Self {
            depth: 0,
            rollback_only: false,
            connections: Vec::new(),
            overlay: HashMap::new(),
            touched: Vec::new(),
            pending: Vec::new(),
        }
    }
}

/// Everything a finished outermost scope hands back for cleanup.
struct Finished<F: ConnectionFactory> {
    rollback_only: bool,
    connections: Vec<(String, Arc<PooledConnection<F>>)>,
    overlay: HashMap<(TypeId, u64), Staged>,
    touched: Vec<TypeId>,
    pending: Vec<(CacheWrite, EntityUpdated)>,
}

/// Transaction bookkeeping for one session.
pub struct UnitOfWork<F: ConnectionFactory> {
    cache: Arc<ObjectCache>,
    hub: Arc<NotificationHub>,
    cascade: bool,
    state: Mutex<State<F>>,
}

impl<F: ConnectionFactory> std::fmt::Debug for UnitOfWork<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("UnitOfWork")
            .field("depth", &state.depth)
            .field("rollback_only", &state.rollback_only)
            .field("connections", &state.connections.len())
            .field("staged", &state.overlay.len())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> UnitOfWork<F> {
    pub fn new(cache: Arc<ObjectCache>, hub: Arc<NotificationHub>, cascade: bool) -> Self {
        Self {
            cache,
            hub,
            cascade,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<F>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    /// Whether a transaction scope is open.
    pub fn in_transaction(&self) -> bool {
        self.lock().depth > 0
    }

    /// Current nesting depth (0 outside any scope).
    pub fn depth(&self) -> usize {
        self.lock().depth
    }

    /// Join the ambient transaction, or open one if none is active.
    ///
    /// Opening is lazy: the physical `BEGIN` runs when the scope first
    /// needs a connection.
    pub fn enlist_or_create_transaction(&self) -> Transaction<'_, F> {
        let mut state = self.lock();
        state.depth += 1;
        let outermost = state.depth == 1;
        if outermost {
            state.rollback_only = false;
        }
        tracing::debug!(depth = state.depth, "enlisted in transaction scope");
        Transaction {
            uow: self,
            outermost,
            finished: false,
        }
    }

    /// Borrow a connection from `pool` for one operation.
    pub async fn lease(&self, cx: &Cx, pool: &Pool<F>) -> Outcome<Lease<F>, Error> {
        let enlisted = {
            let state = self.lock();
            if state.depth == 0 {
                None
            } else {
                Some(
                    state
                        .connections
                        .iter()
                        .find(|(cs, _)| cs == pool.connection_string())
                        .map(|(_, conn)| Arc::clone(conn)),
                )
            }
        };
        let conn = match enlisted {
            None => {
                return match pool.acquire(cx).await {
                    Outcome::Ok(conn) => Outcome::Ok(Lease::Pooled(conn)),
                    Outcome::Err(e) => Outcome::Err(e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                };
            }
            Some(Some(conn)) => return Outcome::Ok(Lease::Enlisted(conn)),
            Some(None) => match pool.acquire(cx).await {
                Outcome::Ok(conn) => conn,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            },
        };

        match conn.begin(cx).await {
            Outcome::Ok(()) => {}
            Outcome::Err(e) => {
                conn.discard();
                return Outcome::Err(e);
            }
            Outcome::Cancelled(r) => {
                conn.discard();
                return Outcome::Cancelled(r);
            }
            Outcome::Panicked(p) => {
                conn.discard();
                return Outcome::Panicked(p);
            }
        }
        tracing::debug!(connection = pool.connection_string(), "began physical transaction");
        let conn = Arc::new(conn);
        self.lock()
            .connections
            .push((pool.connection_string().to_string(), Arc::clone(&conn)));
        Outcome::Ok(Lease::Enlisted(conn))
    }

    /// The staged state of an identity: `Some(Some(_))` saved in this scope,
    /// `Some(None)` deleted in this scope, `None` untouched.
    pub fn staged(&self, type_id: TypeId, id: &Value) -> Option<Option<EntityRef>> {
        let state = self.lock();
        state
            .overlay
            .get(&(type_id, id.key_hash()))
            .filter(|s| s.id.same_as(id))
            .map(|s| s.entity.clone())
    }

    /// Whether this scope wrote to `type_id` (directly or through a derived type).
    pub fn is_touched(&self, type_id: TypeId) -> bool {
        let state = self.lock();
        state.depth > 0 && state.touched.contains(&type_id)
    }

    /// Whether reads may use and populate the shared cache for `type_id`.
    pub fn may_use_cache(&self, type_id: TypeId) -> bool {
        let state = self.lock();
        state.depth == 0 || !state.touched.contains(&type_id)
    }

    /// Whether reads may populate the shared cache at all.
    pub fn may_populate_cache(&self) -> bool {
        self.lock().depth == 0
    }

    /// Record a bulk write to `type_id`.
    pub fn touch(&self, type_id: TypeId) {
        let affected = self.cache.affected_types(type_id, false);
        let mut state = self.lock();
        if state.depth > 0 {
            for t in affected {
                if !state.touched.contains(&t) {
                    state.touched.push(t);
                }
            }
        }
    }

    /// Finish a successful save or delete.
    ///
    /// Inside a transaction the write is staged until the outermost commit;
    /// otherwise it is published to the cache and its event fires now.
    pub async fn complete_write(&self, write: CacheWrite, event: EntityUpdated) {
        let type_id = write.entity_type();
        let staged_now = {
            let mut state = self.lock();
            if state.depth > 0 {
                let id = write.id();
                let entity = match &write {
                    CacheWrite::Saved(entity) => Some(Arc::clone(entity)),
                    CacheWrite::Deleted { .. } => None,
                };
                state
                    .overlay
                    .insert((type_id, id.key_hash()), Staged { id, entity });
                state.pending.push((write.clone(), event.clone()));
                true
            } else {
                false
            }
        };
        if staged_now {
            self.touch(type_id);
            tracing::trace!(?type_id, "staged write in transaction scope");
            return;
        }
        self.cache.commit_write(&write, self.cascade);
        self.hub.fire_entity_updated(event).await;
    }

    fn finish_inner(&self, rolled_back: bool) {
        let mut state = self.lock();
        state.depth = state.depth.saturating_sub(1);
        if rolled_back {
            state.rollback_only = true;
        }
        tracing::debug!(depth = state.depth, rolled_back, "left nested transaction scope");
    }

    fn take_outermost(&self) -> Finished<F> {
        let mut state = self.lock();
        let taken = std::mem::take(&mut *state);
        Finished {
            rollback_only: taken.rollback_only,
            connections: taken.connections,
            overlay: taken.overlay,
            touched: taken.touched,
            pending: taken.pending,
        }
    }

    fn forget(&self, finished: &Finished<F>) {
        for ((type_id, _), staged) in &finished.overlay {
            self.cache.remove(*type_id, &staged.id);
        }
        tracing::debug!(
            staged = finished.overlay.len(),
            types = finished.touched.len(),
            "discarded transaction overlay"
        );
    }

    async fn rollback_all(cx: &Cx, connections: Vec<(String, Arc<PooledConnection<F>>)>) -> Outcome<(), Error> {
        let mut first_failure = None;
        for (cs, conn) in connections {
            match conn.rollback(cx).await {
                Outcome::Ok(()) => drop(conn),
                other => {
                    tracing::warn!(connection = %cs, "rollback failed; discarding connection");
                    discard(conn);
                    if first_failure.is_none() {
                        first_failure = Some(other);
                    }
                }
            }
        }
        first_failure.unwrap_or(Outcome::Ok(()))
    }
}

fn discard<F: ConnectionFactory>(conn: Arc<PooledConnection<F>>) {
    if let Ok(conn) = Arc::try_unwrap(conn) {
        conn.discard();
    }
}

/// A transaction scope returned by [`UnitOfWork::enlist_or_create_transaction`].
///
/// Finish it with [`commit`](Self::commit) or [`rollback`](Self::rollback).
/// Dropping an unfinished scope rolls it back: a nested scope poisons the
/// transaction, and the outermost scope discards its connections so the
/// driver aborts the open transactions.
pub struct Transaction<'a, F: ConnectionFactory> {
    uow: &'a UnitOfWork<F>,
    outermost: bool,
    finished: bool,
}

impl<F: ConnectionFactory> std::fmt::Debug for Transaction<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("outermost", &self.outermost)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Transaction<'_, F> {
    /// Whether this scope opened the transaction.
    pub fn is_outermost(&self) -> bool {
        self.outermost
    }

    /// Commit the scope.
    ///
    /// A nested scope only leaves; the outermost one commits every enlisted
    /// connection, publishes the staged writes to the cache and fires their
    /// events in write order. If any scope rolled back, the outermost commit
    /// rolls back instead and fails with `RollbackOnly`.
    pub async fn commit(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.finished = true;
        if !self.outermost {
            self.uow.finish_inner(false);
            return Outcome::Ok(());
        }
        let mut finished = self.uow.take_outermost();
        let connections = std::mem::take(&mut finished.connections);

        if finished.rollback_only {
            self.uow.forget(&finished);
            let rolled_back = UnitOfWork::<F>::rollback_all(cx, connections).await;
            if !matches!(rolled_back, Outcome::Ok(())) {
                return rolled_back;
            }
            return Outcome::Err(Error::Transaction(TransactionError {
                kind: TransactionErrorKind::RollbackOnly,
                message: "a nested scope rolled back; the transaction was rolled back".to_string(),
            }));
        }

        let mut remaining = connections.into_iter();
        while let Some((cs, conn)) = remaining.next() {
            let outcome = conn.commit(cx).await;
            if let Outcome::Ok(()) = outcome {
                drop(conn);
                continue;
            }
            tracing::error!(connection = %cs, "commit failed; rolling back remaining connections");
            discard(conn);
            self.uow.forget(&finished);
            for t in &finished.touched {
                self.uow.cache.invalidate_all_type_instances(*t);
            }
            let _ = UnitOfWork::<F>::rollback_all(cx, remaining.collect()).await;
            return outcome;
        }

        for (write, _) in &finished.pending {
            self.uow.cache.commit_write(write, self.uow.cascade);
        }
        tracing::debug!(writes = finished.pending.len(), "committed transaction");
        for (_, event) in finished.pending {
            self.uow.hub.fire_entity_updated(event).await;
        }
        Outcome::Ok(())
    }

    /// Roll the scope back.
    ///
    /// A nested scope marks the transaction rollback-only; the outermost one
    /// rolls back every enlisted connection and discards the staged writes.
    pub async fn rollback(mut self, cx: &Cx) -> Outcome<(), Error> {
        self.finished = true;
        if !self.outermost {
            self.uow.finish_inner(true);
            return Outcome::Ok(());
        }
        let mut finished = self.uow.take_outermost();
        let connections = std::mem::take(&mut finished.connections);
        self.uow.forget(&finished);
        tracing::debug!(connections = connections.len(), "rolling back transaction");
        UnitOfWork::<F>::rollback_all(cx, connections).await
    }
}

impl<F: ConnectionFactory> Drop for Transaction<'_, F> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.outermost {
            self.uow.finish_inner(true);
            return;
        }
        let finished = self.uow.take_outermost();
        tracing::warn!(
            connections = finished.connections.len(),
            "transaction scope dropped without commit or rollback"
        );
        self.uow.forget(&finished);
        for (_, conn) in finished.connections {
            discard(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::events::EntityChange;
    use asupersync::runtime::RuntimeBuilder;
    use datamapper_core::{Entity, MetadataRegistry};
    use datamapper_pool::PoolConfig;
    use datamapper_testkit::{MemoryDatabase, MemoryFactory, fixtures::Invoice, unwrap_outcome};

    fn block_on<T>(f: impl Future<Output = T>) -> T {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        rt.block_on(f)
    }

    fn setup() -> (MemoryDatabase, Pool<MemoryFactory>, UnitOfWork<MemoryFactory>) {
        let db = MemoryDatabase::new();
        let pool = Pool::new(MemoryFactory::new(db.clone()), "memory://main", PoolConfig::new(4));
        let registry = MetadataRegistry::builder()
            .register::<Invoice>()
            .build()
            .unwrap();
        let cache = Arc::new(ObjectCache::new(registry, CacheConfig::default()));
        let uow = UnitOfWork::new(cache, Arc::new(NotificationHub::new()), true);
        (db, pool, uow)
    }

    fn saved(id: i64) -> (CacheWrite, EntityUpdated) {
        let entity: EntityRef = Arc::new(Invoice {
            id: Some(id),
            number: format!("INV-{id}"),
            ..Invoice::default()
        });
        (
            CacheWrite::Saved(Arc::clone(&entity)),
            EntityUpdated {
                entity,
                change: EntityChange::Inserted,
            },
        )
    }

    #[test]
    fn test_nested_scope_reuses_one_physical_transaction() {
        let (db, pool, uow) = setup();
        let cx = Cx::for_testing();
        block_on(async {
            let outer = uow.enlist_or_create_transaction();
            let first = unwrap_outcome(uow.lease(&cx, &pool).await);
            let inner = uow.enlist_or_create_transaction();
            assert!(!inner.is_outermost());
            let second = unwrap_outcome(uow.lease(&cx, &pool).await);
            drop((first, second));
            unwrap_outcome(inner.commit(&cx).await);
            assert!(uow.in_transaction());
            unwrap_outcome(outer.commit(&cx).await);
        });
        assert!(!uow.in_transaction());
        assert_eq!(db.stats().begins, 1);
        assert_eq!(db.stats().commits, 1);
    }

    #[test]
    fn test_staged_writes_publish_on_outer_commit() {
        let (_db, pool, uow) = setup();
        let cx = Cx::for_testing();
        let key = Value::BigInt(7);
        block_on(async {
            let tx = uow.enlist_or_create_transaction();
            let lease = unwrap_outcome(uow.lease(&cx, &pool).await);
            let (write, event) = saved(7);
            uow.complete_write(write, event).await;
            assert!(uow.staged(TypeId::of::<Invoice>(), &key).is_some());
            assert!(uow.is_touched(TypeId::of::<Invoice>()));
            assert!(uow.cache().get(TypeId::of::<Invoice>(), &key).is_none());
            drop(lease);
            unwrap_outcome(tx.commit(&cx).await);
        });
        let cached = uow.cache().get(TypeId::of::<Invoice>(), &key).unwrap();
        assert_eq!(cached.id(), key);
        assert!(uow.staged(TypeId::of::<Invoice>(), &key).is_none());
    }

    #[test]
    fn test_inner_rollback_poisons_outer_commit() {
        let (db, pool, uow) = setup();
        let cx = Cx::for_testing();
        let result = block_on(async {
            let outer = uow.enlist_or_create_transaction();
            drop(unwrap_outcome(uow.lease(&cx, &pool).await));
            let (write, event) = saved(1);
            uow.complete_write(write, event).await;
            let inner = uow.enlist_or_create_transaction();
            unwrap_outcome(inner.rollback(&cx).await);
            outer.commit(&cx).await
        });
        match result {
            Outcome::Err(Error::Transaction(e)) => {
                assert_eq!(e.kind, TransactionErrorKind::RollbackOnly);
            }
            Outcome::Err(e) => panic!("expected rollback-only failure, got {e}"),
            _ => panic!("expected rollback-only failure"),
        }
        assert_eq!(db.stats().rollbacks, 1);
        assert_eq!(db.stats().commits, 0);
        assert!(uow.cache().get(TypeId::of::<Invoice>(), &Value::BigInt(1)).is_none());
    }

    #[test]
    fn test_write_outside_transaction_publishes_immediately() {
        let (_db, _pool, uow) = setup();
        let (write, event) = saved(3);
        block_on(uow.complete_write(write, event));
        assert!(uow.cache().get(TypeId::of::<Invoice>(), &Value::BigInt(3)).is_some());
        assert!(uow.cache().query_timestamp().is_some());
    }

    #[test]
    fn test_dropped_scope_discards_connection() {
        let (db, pool, uow) = setup();
        let cx = Cx::for_testing();
        block_on(async {
            let tx = uow.enlist_or_create_transaction();
            drop(unwrap_outcome(uow.lease(&cx, &pool).await));
            drop(tx);
        });
        assert!(!uow.in_transaction());
        assert_eq!(db.stats().begins, 1);
        assert_eq!(pool.stats().total_connections, 0);
    }
}

//! Process-wide object cache.
//!
//! Holds materialized entities keyed by (runtime type, identity) and
//! "all instances" snapshots keyed by type. A miss is a normal outcome;
//! an entry stored under the wrong type is corruption and panics at the
//! detection site.
//!
//! # Freshness
//!
//! Two counters drive staleness decisions:
//!
//! - the **query timestamp** advances on every successful write; callers use
//!   it as a coarse "anything changed since?" watermark
//! - the **read epoch** advances on every write and invalidation; a reader
//!   captures it before going to storage and may only populate the cache if
//!   no write to that type happened in between, so a slow read can never
//!   reinstate state that a concurrent write already replaced

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use datamapper_core::{Entity, EntityRef, MetadataRegistry, Value};

use crate::config::CacheConfig;
use crate::invalidation::InvalidationGraph;

const SHARDS: usize = 16;

/// Monotonic write watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueryTimestamp(u64);

impl QueryTimestamp {
    pub fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(self) -> u64 {
        self.0
    }

    pub fn is_newer_than(self, other: QueryTimestamp) -> bool {
        self.0 > other.0
    }
}

/// Read epoch captured before a storage read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReadEpoch(u64);

/// A completed write to apply to the cache.
#[derive(Debug, Clone)]
pub enum CacheWrite {
    Saved(EntityRef),
    Deleted { entity_type: TypeId, id: Value },
}

impl CacheWrite {
    pub fn entity_type(&self) -> TypeId {
        match self {
            CacheWrite::Saved(entity) => entity.entity_type(),
            CacheWrite::Deleted { entity_type, .. } => *entity_type,
        }
    }

    pub fn id(&self) -> Value {
        match self {
            CacheWrite::Saved(entity) => entity.id(),
            CacheWrite::Deleted { id, .. } => id.clone(),
        }
    }
}

/// Counters for observing cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub snapshot_hits: u64,
    pub entries: usize,
    pub snapshots: usize,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    entity: EntityRef,
    written_at: Option<QueryTimestamp>,
}

#[derive(Debug, Clone, Copy, Default)]
struct TypeState {
    last_write: Option<QueryTimestamp>,
    epoch: u64,
}

type Key = (TypeId, u64);

/// The shared entity and snapshot cache.
pub struct ObjectCache {
    registry: Arc<MetadataRegistry>,
    graph: InvalidationGraph,
    config: CacheConfig,
    shards: Vec<RwLock<HashMap<Key, CacheEntry>>>,
    snapshots: RwLock<HashMap<TypeId, Arc<Vec<EntityRef>>>>,
    // Lock order: `types` before any shard or `snapshots`.
    types: RwLock<HashMap<TypeId, TypeState>>,
    clock: AtomicU64,
    epoch: AtomicU64,
    cleared_at: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    snapshot_hits: AtomicU64,
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ObjectCache {
    pub fn new(registry: Arc<MetadataRegistry>, config: CacheConfig) -> Self {
        let graph = InvalidationGraph::build(&registry);
        Self {
            registry,
            graph,
            config,
            shards: (0..SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            snapshots: RwLock::new(HashMap::new()),
            types: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            cleared_at: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            snapshot_hits: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn graph(&self) -> &InvalidationGraph {
        &self.graph
    }

    fn shard(&self, key: &Key) -> &RwLock<HashMap<Key, CacheEntry>> {
        let index = usize::try_from(key.1 % SHARDS as u64).unwrap_or(0);
        &self.shards[index]
    }

    /// Whether `type_id` may be cached: the global switch, then the
    /// per-type-name override, then the metadata default.
    pub fn is_cacheable(&self, type_id: TypeId) -> bool {
        if !self.config.enabled {
            return false;
        }
        let Some(meta) = self.registry.get(type_id) else {
            return false;
        };
        self.config
            .overrides
            .get(meta.type_name())
            .copied()
            .unwrap_or_else(|| meta.cacheable())
    }

    /// Look up an entity by runtime type and identity.
    ///
    /// # Panics
    ///
    /// Panics if the entry found holds an entity of another type.
    pub fn get(&self, type_id: TypeId, id: &Value) -> Option<EntityRef> {
        if !self.is_cacheable(type_id) {
            return None;
        }
        let key = (type_id, id.key_hash());
        let found = read(self.shard(&key)).get(&key).map(|e| Arc::clone(&e.entity));
        match found {
            Some(entity) => {
                assert!(
                    entity.entity_type() == type_id,
                    "object cache corruption: entry for {type_id:?} holds {entity:?}"
                );
                if entity.id().same_as(id) {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(?type_id, "object cache hit");
                    Some(entity)
                } else {
                    // Hash collision with another identity.
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    None
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(?type_id, "object cache miss");
                None
            }
        }
    }

    /// Insert or replace the entry for the entity's type and identity.
    pub fn put(&self, entity: EntityRef) {
        let type_id = entity.entity_type();
        if !self.is_cacheable(type_id) {
            return;
        }
        let key = (type_id, entity.id().key_hash());
        write(self.shard(&key)).insert(
            key,
            CacheEntry {
                entity,
                written_at: None,
            },
        );
    }

    /// Current read epoch; capture before reading storage.
    pub fn read_epoch(&self) -> ReadEpoch {
        ReadEpoch(self.epoch.load(Ordering::Acquire))
    }

    fn unchanged_since(&self, types: &HashMap<TypeId, TypeState>, type_id: TypeId, epoch: ReadEpoch) -> bool {
        self.cleared_at.load(Ordering::Acquire) <= epoch.0
            && types.get(&type_id).is_none_or(|s| s.epoch <= epoch.0)
    }

    /// Put an entity read from storage, unless its type was written after `epoch`.
    pub fn put_observed(&self, entity: EntityRef, epoch: ReadEpoch) -> bool {
        let type_id = entity.entity_type();
        if !self.is_cacheable(type_id) {
            return false;
        }
        let types = read(&self.types);
        if !self.unchanged_since(&types, type_id, epoch) {
            tracing::trace!(?type_id, "skipping cache put after concurrent write");
            return false;
        }
        let key = (type_id, entity.id().key_hash());
        write(self.shard(&key)).insert(
            key,
            CacheEntry {
                entity,
                written_at: None,
            },
        );
        true
    }

    /// Drop the entry for one identity.
    pub fn remove(&self, type_id: TypeId, id: &Value) {
        let key = (type_id, id.key_hash());
        write(self.shard(&key)).remove(&key);
    }

    /// The "all instances" snapshot, if one is cached.
    pub fn all_instances(&self, type_id: TypeId) -> Option<Arc<Vec<EntityRef>>> {
        if !self.is_cacheable(type_id) {
            return None;
        }
        let snapshot = read(&self.snapshots).get(&type_id).cloned();
        if snapshot.is_some() {
            self.snapshot_hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(?type_id, "snapshot hit");
        }
        snapshot
    }

    /// Replace the "all instances" snapshot. Last writer wins.
    pub fn put_all_instances(&self, type_id: TypeId, items: Vec<EntityRef>) {
        if !self.is_cacheable(type_id) {
            return;
        }
        write(&self.snapshots).insert(type_id, Arc::new(items));
    }

    /// Replace the snapshot with a storage read, unless the type was written after `epoch`.
    pub fn put_all_instances_observed(
        &self,
        type_id: TypeId,
        items: Vec<EntityRef>,
        epoch: ReadEpoch,
    ) -> bool {
        if !self.is_cacheable(type_id) {
            return false;
        }
        let types = read(&self.types);
        if !self.unchanged_since(&types, type_id, epoch) {
            return false;
        }
        write(&self.snapshots).insert(type_id, Arc::new(items));
        true
    }

    /// Drop the "all instances" snapshot of one type.
    pub fn invalidate_all_type_instances(&self, type_id: TypeId) {
        let mut types = write(&self.types);
        self.bump(&mut types, type_id, None);
        write(&self.snapshots).remove(&type_id);
    }

    /// Drop the snapshot of `type_id` and, with `cascade_to_referencers`,
    /// of every type reachable in the invalidation graph.
    ///
    /// Returns the types whose snapshots were dropped, `type_id` first.
    pub fn invalidate_type(&self, type_id: TypeId, cascade_to_referencers: bool) -> Vec<TypeId> {
        let mut affected = vec![type_id];
        if cascade_to_referencers {
            affected.extend(self.graph.reachable(type_id));
        }
        let mut types = write(&self.types);
        let mut snapshots = write(&self.snapshots);
        for t in &affected {
            self.bump(&mut types, *t, None);
            snapshots.remove(t);
        }
        tracing::debug!(?type_id, count = affected.len(), cascade_to_referencers, "invalidated type snapshots");
        affected
    }

    fn bump(&self, types: &mut HashMap<TypeId, TypeState>, type_id: TypeId, stamp: Option<QueryTimestamp>) {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let state = types.entry(type_id).or_default();
        state.epoch = epoch;
        if stamp.is_some() {
            state.last_write = stamp;
        }
    }

    /// Types whose snapshots a write to `type_id` makes stale: the type, its
    /// base types and, with `cascade`, every type referencing any of them.
    pub fn affected_types(&self, type_id: TypeId, cascade: bool) -> Vec<TypeId> {
        let mut stale = vec![type_id];
        stale.extend(
            self.registry
                .base_classes_in_order(type_id)
                .iter()
                .map(|m| m.type_id()),
        );
        if cascade {
            let roots = stale.clone();
            for t in roots {
                for r in self.graph.reachable(t) {
                    if !stale.contains(&r) {
                        stale.push(r);
                    }
                }
            }
        }
        stale
    }

    /// Publish a successful save or delete.
    ///
    /// Replaces or removes the identity entry, then drops the snapshots of the
    /// written type and all its base types, plus (with `cascade`) every
    /// referencing type. Returns the new query timestamp.
    pub fn commit_write(&self, change: &CacheWrite, cascade: bool) -> QueryTimestamp {
        let type_id = change.entity_type();
        let stamp = QueryTimestamp(self.clock.fetch_add(1, Ordering::AcqRel) + 1);
        let stale = self.affected_types(type_id, cascade);

        let mut types = write(&self.types);
        for t in &stale {
            self.bump(&mut types, *t, Some(stamp));
        }
        let key = (type_id, change.id().key_hash());
        match change {
            CacheWrite::Saved(entity) if self.is_cacheable(type_id) => {
                write(self.shard(&key)).insert(
                    key,
                    CacheEntry {
                        entity: Arc::clone(entity),
                        written_at: Some(stamp),
                    },
                );
            }
            CacheWrite::Saved(_) | CacheWrite::Deleted { .. } => {
                write(self.shard(&key)).remove(&key);
            }
        }
        let mut snapshots = write(&self.snapshots);
        for t in &stale {
            snapshots.remove(t);
        }
        tracing::debug!(?type_id, stale = stale.len(), sequence = stamp.0, "published write");
        stamp
    }

    /// Record a write that bypassed per-entity bookkeeping (bulk operations).
    ///
    /// Advances the query timestamp and fences in-flight reads of the type;
    /// cached entries and snapshots are left as they are.
    pub fn record_bulk_write(&self, type_id: TypeId) -> QueryTimestamp {
        let stamp = QueryTimestamp(self.clock.fetch_add(1, Ordering::AcqRel) + 1);
        let mut types = write(&self.types);
        self.bump(&mut types, type_id, Some(stamp));
        stamp
    }

    /// Whether a write to this entity's identity (or, without a tracked
    /// write, to its type) was recorded after `watermark`.
    pub fn is_fresher_than(&self, entity: &dyn Entity, watermark: QueryTimestamp) -> bool {
        let type_id = entity.entity_type();
        let key = (type_id, entity.id().key_hash());
        let entry_stamp = read(self.shard(&key))
            .get(&key)
            .filter(|e| e.entity.id().same_as(&entity.id()))
            .and_then(|e| e.written_at);
        let stamp = entry_stamp.or_else(|| read(&self.types).get(&type_id).and_then(|s| s.last_write));
        stamp.is_some_and(|s| s.is_newer_than(watermark))
    }

    /// The latest write watermark; `None` before the first write.
    pub fn query_timestamp(&self) -> Option<QueryTimestamp> {
        match self.clock.load(Ordering::Acquire) {
            0 => None,
            n => Some(QueryTimestamp(n)),
        }
    }

    /// Drop every entry and snapshot.
    pub fn clear(&self) {
        let _types = write(&self.types);
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.cleared_at.store(epoch, Ordering::Release);
        for shard in &self.shards {
            write(shard).clear();
        }
        write(&self.snapshots).clear();
        tracing::debug!("object cache cleared");
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            snapshot_hits: self.snapshot_hits.load(Ordering::Relaxed),
            entries: self.shards.iter().map(|s| read(s).len()).sum(),
            snapshots: read(&self.snapshots).len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use datamapper_core::{EntityMetadata, Mapped, PropertyDescriptor, ReferenceDescriptor, assign};

    #[derive(Debug, Clone, Default)]
    struct Customer {
        id: i64,
        name: String,
    }

    impl Entity for Customer {
        fn id(&self) -> Value {
            Value::BigInt(self.id)
        }
    }

    impl Mapped for Customer {
        fn metadata() -> EntityMetadata {
            EntityMetadata::builder::<Self>("Customer", "customers")
                .identity(PropertyDescriptor::new::<Self, _, _>(
                    "Id",
                    "id",
                    |e| e.id.into(),
                    |e, v| assign(&mut e.id, v),
                ))
                .property(PropertyDescriptor::new::<Self, _, _>(
                    "Name",
                    "name",
                    |e| e.name.clone().into(),
                    |e, v| assign(&mut e.name, v),
                ))
                .build()
                .unwrap()
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Order {
        id: i64,
        customer_id: i64,
    }

    impl Entity for Order {
        fn id(&self) -> Value {
            Value::BigInt(self.id)
        }
    }

    impl Mapped for Order {
        fn metadata() -> EntityMetadata {
            EntityMetadata::builder::<Self>("Order", "orders")
                .identity(PropertyDescriptor::new::<Self, _, _>(
                    "Id",
                    "id",
                    |e| e.id.into(),
                    |e, v| assign(&mut e.id, v),
                ))
                .property(PropertyDescriptor::new::<Self, _, _>(
                    "CustomerId",
                    "customer_id",
                    |e| e.customer_id.into(),
                    |e, v| assign(&mut e.customer_id, v),
                ))
                .reference(ReferenceDescriptor::new::<Self, Customer, _, _>(
                    "Customer",
                    "CustomerId",
                    |_| None,
                    |_, _| {},
                ))
                .build()
                .unwrap()
        }
    }

    fn cache(config: CacheConfig) -> ObjectCache {
        let registry = MetadataRegistry::builder()
            .register::<Customer>()
            .register::<Order>()
            .build()
            .unwrap();
        ObjectCache::new(registry, config)
    }

    fn customer(id: i64, name: &str) -> EntityRef {
        Arc::new(Customer {
            id,
            name: name.into(),
        })
    }

    #[test]
    fn test_get_put_and_miss() {
        let cache = cache(CacheConfig::default());
        let id = Value::BigInt(1);
        assert!(cache.get(TypeId::of::<Customer>(), &id).is_none());
        cache.put(customer(1, "Ada"));
        let hit = cache.get(TypeId::of::<Customer>(), &id).unwrap();
        assert_eq!(hit.downcast_ref::<Customer>().unwrap().name, "Ada");
        // Integer widths share a key.
        assert!(cache.get(TypeId::of::<Customer>(), &Value::Int(1)).is_some());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (2, 1, 1));
    }

    #[test]
    fn test_override_disables_type() {
        let cache = cache(CacheConfig::default().cacheable("Customer", false));
        cache.put(customer(1, "Ada"));
        assert!(!cache.is_cacheable(TypeId::of::<Customer>()));
        assert!(cache.get(TypeId::of::<Customer>(), &Value::BigInt(1)).is_none());
        assert!(cache.is_cacheable(TypeId::of::<Order>()));
    }

    #[test]
    fn test_invalidate_type_with_and_without_cascade() {
        let cache = cache(CacheConfig::default());
        let customers = TypeId::of::<Customer>();
        let orders = TypeId::of::<Order>();
        cache.put_all_instances(customers, vec![customer(1, "Ada")]);
        cache.put_all_instances(orders, Vec::new());

        assert_eq!(cache.invalidate_type(customers, false), vec![customers]);
        assert!(cache.all_instances(customers).is_none());
        assert!(cache.all_instances(orders).is_some());

        cache.put_all_instances(customers, vec![customer(1, "Ada")]);
        assert_eq!(cache.invalidate_type(customers, true), vec![customers, orders]);
        assert!(cache.all_instances(orders).is_none());
    }

    #[test]
    fn test_commit_write_replaces_entry_and_advances_timestamp() {
        let cache = cache(CacheConfig::default());
        assert_eq!(cache.query_timestamp(), None);
        cache.put(customer(1, "Ada"));
        cache.put_all_instances(TypeId::of::<Customer>(), vec![customer(1, "Ada")]);
        cache.put_all_instances(TypeId::of::<Order>(), Vec::new());

        let first = cache.commit_write(&CacheWrite::Saved(customer(1, "Grace")), true);
        let hit = cache.get(TypeId::of::<Customer>(), &Value::BigInt(1)).unwrap();
        assert_eq!(hit.downcast_ref::<Customer>().unwrap().name, "Grace");
        assert!(cache.all_instances(TypeId::of::<Customer>()).is_none());
        assert!(cache.all_instances(TypeId::of::<Order>()).is_none());

        let second = cache.commit_write(
            &CacheWrite::Deleted {
                entity_type: TypeId::of::<Customer>(),
                id: Value::BigInt(1),
            },
            false,
        );
        assert!(second.is_newer_than(first));
        assert_eq!(cache.query_timestamp(), Some(second));
        assert!(cache.get(TypeId::of::<Customer>(), &Value::BigInt(1)).is_none());
    }

    #[test]
    fn test_observed_put_skipped_after_concurrent_write() {
        let cache = cache(CacheConfig::default());
        let epoch = cache.read_epoch();
        cache.commit_write(&CacheWrite::Saved(customer(1, "new")), false);
        assert!(!cache.put_observed(customer(1, "old"), epoch));
        assert!(!cache.put_all_instances_observed(
            TypeId::of::<Customer>(),
            vec![customer(1, "old")],
            epoch
        ));
        let hit = cache.get(TypeId::of::<Customer>(), &Value::BigInt(1)).unwrap();
        assert_eq!(hit.downcast_ref::<Customer>().unwrap().name, "new");

        let later = cache.read_epoch();
        assert!(cache.put_observed(customer(2, "fresh"), later));
    }

    #[test]
    fn test_is_fresher_than() {
        let cache = cache(CacheConfig::default());
        let before = QueryTimestamp::new(0);
        let ada = Customer {
            id: 1,
            name: "Ada".into(),
        };
        assert!(!cache.is_fresher_than(&ada, before));
        let stamp = cache.commit_write(&CacheWrite::Saved(Arc::new(ada.clone())), false);
        assert!(cache.is_fresher_than(&ada, before));
        assert!(!cache.is_fresher_than(&ada, stamp));
        // An untracked identity falls back to the type's last write.
        let other = Customer {
            id: 9,
            name: String::new(),
        };
        assert!(cache.is_fresher_than(&other, before));
    }

    #[test]
    fn test_clear_fences_in_flight_reads() {
        let cache = cache(CacheConfig::default());
        let epoch = cache.read_epoch();
        cache.put(customer(1, "Ada"));
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
        assert!(!cache.put_observed(customer(1, "Ada"), epoch));
    }

    #[test]
    fn test_threads_never_resurrect_an_invalidated_snapshot() {
        const WORKERS: usize = 4;
        const ROUNDS: usize = 200;
        const SHARED: i64 = 100;
        let cache = cache(CacheConfig::default());
        let customers = TypeId::of::<Customer>();
        let seeded = Barrier::new(WORKERS + 1);
        let fenced = Barrier::new(WORKERS + 1);
        let name_of = |e: &EntityRef| e.downcast_ref::<Customer>().unwrap().name.clone();

        std::thread::scope(|s| {
            for worker in 0..WORKERS {
                let (cache, seeded, fenced) = (&cache, &seeded, &fenced);
                s.spawn(move || {
                    let id = i64::try_from(worker).unwrap();
                    let stale = cache.read_epoch();
                    cache.put(customer(id, "stale"));
                    cache.put_all_instances(customers, vec![customer(id, "stale")]);
                    seeded.wait();
                    fenced.wait();

                    assert!(!cache.put_observed(customer(id, "stale"), stale));
                    assert!(!cache.put_all_instances_observed(
                        customers,
                        vec![customer(id, "stale")],
                        stale
                    ));
                    for round in 0..ROUNDS {
                        cache.put(customer(SHARED, &format!("w{worker}-r{round}")));
                        let epoch = cache.read_epoch();
                        cache.put_all_instances_observed(
                            customers,
                            vec![customer(id, "fresh")],
                            epoch,
                        );
                        if let Some(snapshot) = cache.all_instances(customers) {
                            assert!(snapshot.iter().all(|e| name_of(e) == "fresh"));
                        }
                    }
                });
            }

            seeded.wait();
            cache.invalidate_type(customers, false);
            fenced.wait();
            for _ in 0..ROUNDS {
                cache.invalidate_type(customers, false);
            }
        });

        // Entries are per key: one per worker plus the contended one.
        assert_eq!(cache.stats().entries, WORKERS + 1);
        let shared = cache.get(customers, &Value::BigInt(SHARED)).unwrap();
        assert!(name_of(&shared).ends_with(&format!("-r{}", ROUNDS - 1)));

        let before = cache.read_epoch();
        cache.invalidate_type(customers, false);
        assert!(cache.all_instances(customers).is_none());
        assert!(!cache.put_all_instances_observed(customers, vec![customer(0, "late")], before));
        assert!(cache.all_instances(customers).is_none());
    }

    #[test]
    #[should_panic(expected = "object cache corruption")]
    fn test_wrong_type_entry_panics() {
        let cache = cache(CacheConfig::default());
        let order: EntityRef = Arc::new(Order {
            id: 1,
            customer_id: 1,
        });
        // Forge an entry under the wrong type.
        let key = (TypeId::of::<Customer>(), Value::BigInt(1).key_hash());
        write(cache.shard(&key)).insert(
            key,
            CacheEntry {
                entity: order,
                written_at: None,
            },
        );
        let _ = cache.get(TypeId::of::<Customer>(), &Value::BigInt(1));
    }
}

//! Data context and sessions.
//!
//! A [`DataContext`] is built once per process: it owns the metadata
//! registry, the object cache, the statement generator, the notification
//! hub, one pool per resolved connection string and the provider factory.
//! Callers work through [`Session`]s, each carrying its own ambient
//! transaction scope over the shared context.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use datamapper_core::{
    ConnectionFactory, Entity, EntityErrorKind, EntityRef, EntityRefExt, Error, Mapped,
    MetadataRegistry, Result, Value, try_outcome, try_result,
};
use datamapper_pool::Pool;
use datamapper_query::SqlCommandGenerator;

use crate::cache::ObjectCache;
use crate::config::DataConfig;
use crate::events::{CacheRefreshed, NotificationHub};
use crate::factory::DataProviderFactory;
use crate::provider::DataProvider;
use crate::query::DatabaseQuery;
use crate::unit_of_work::{Transaction, UnitOfWork};

/// Process-wide state shared by every session.
pub struct DataContext<F: ConnectionFactory> {
    config: DataConfig,
    registry: Arc<MetadataRegistry>,
    cache: Arc<ObjectCache>,
    generator: Arc<SqlCommandGenerator>,
    hub: Arc<NotificationHub>,
    factory: DataProviderFactory<F>,
    pools: HashMap<String, Pool<F>>,
}

impl<F: ConnectionFactory> std::fmt::Debug for DataContext<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataContext")
            .field("dialect", &self.config.dialect)
            .field("polymorphism", &self.config.polymorphism)
            .field("pools", &self.pools.len())
            .field("cache", &self.cache.stats())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory + Clone> DataContext<F> {
    /// Build the context. Connection strings are resolved for every concrete
    /// type now, so a missing one fails here rather than on first use.
    pub fn new(registry: Arc<MetadataRegistry>, factory: F, config: DataConfig) -> Result<Arc<Self>> {
        let cache = Arc::new(ObjectCache::new(Arc::clone(&registry), config.cache.clone()));
        let generator = Arc::new(match config.cache.statement_cache_size {
            0 => SqlCommandGenerator::new(config.dialect),
            n => SqlCommandGenerator::with_statement_cache(config.dialect, n),
        });

        let mut pools: HashMap<String, Pool<F>> = HashMap::new();
        let providers = DataProviderFactory::new(Arc::clone(&registry), config.polymorphism, |shape| {
            let connection_string = config.resolve_connection_string(shape.table().type_name())?;
            let pool = pools
                .entry(connection_string.clone())
                .or_insert_with(|| Pool::new(factory.clone(), connection_string, config.pool.clone()))
                .clone();
            DataProvider::new(
                Arc::clone(&registry),
                shape,
                Arc::clone(&generator),
                pool,
                config.bulk_batch_size,
            )
        })?;

        tracing::info!(
            dialect = ?config.dialect,
            types = registry.types().count(),
            pools = pools.len(),
            "data context ready"
        );
        Ok(Arc::new(Self {
            config,
            registry,
            cache,
            generator,
            hub: Arc::new(NotificationHub::new()),
            factory: providers,
            pools,
        }))
    }
}

impl<F: ConnectionFactory> DataContext<F> {
    pub fn config(&self) -> &DataConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<ObjectCache> {
        &self.cache
    }

    pub fn generator(&self) -> &SqlCommandGenerator {
        &self.generator
    }

    /// Handler registration for "entity updated" and "cache refreshed".
    pub fn events(&self) -> &NotificationHub {
        &self.hub
    }

    pub fn factory(&self) -> &DataProviderFactory<F> {
        &self.factory
    }

    /// The pool serving a resolved connection string.
    pub fn pool(&self, connection_string: &str) -> Option<&Pool<F>> {
        self.pools.get(connection_string)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool<F>> {
        self.pools.values()
    }

    /// Open a session with its own transaction scope.
    pub fn session(self: &Arc<Self>) -> Session<F> {
        Session {
            uow: UnitOfWork::new(
                Arc::clone(&self.cache),
                Arc::clone(&self.hub),
                self.config.cache.cascade_on_write,
            ),
            context: Arc::clone(self),
        }
    }

    /// Drop every cached entity and snapshot, then fire "cache refreshed".
    pub async fn refresh_cache(&self) {
        self.cache.clear();
        self.hub
            .fire_cache_refreshed(CacheRefreshed {
                entity_types: Vec::new(),
            })
            .await;
    }

    /// Drop the snapshot of `type_id` (and, with `cascade`, of every type
    /// referencing it), then fire "cache refreshed" for the dropped types.
    ///
    /// This is how callers resynchronize after bulk operations.
    pub async fn invalidate_type(&self, type_id: TypeId, cascade: bool) -> Vec<TypeId> {
        let dropped = self.cache.invalidate_type(type_id, cascade);
        self.hub
            .fire_cache_refreshed(CacheRefreshed {
                entity_types: dropped.clone(),
            })
            .await;
        dropped
    }

    /// Open `min_connections` on every pool.
    pub async fn warm_up(&self, cx: &Cx) -> Outcome<usize, Error> {
        let mut opened = 0;
        for pool in self.pools.values() {
            opened += try_outcome!(pool.warm_up(cx).await);
        }
        Outcome::Ok(opened)
    }

    /// Close every pool. Connections still leased close when returned.
    pub fn close(&self) {
        for pool in self.pools.values() {
            pool.close();
        }
    }
}

/// One caller's view of the data layer.
///
/// Operations inside an open transaction scope share the scope's
/// connections and see the scope's own writes.
pub struct Session<F: ConnectionFactory> {
    context: Arc<DataContext<F>>,
    uow: UnitOfWork<F>,
}

impl<F: ConnectionFactory> std::fmt::Debug for Session<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("unit_of_work", &self.uow)
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> Session<F> {
    pub fn context(&self) -> &Arc<DataContext<F>> {
        &self.context
    }

    pub fn unit_of_work(&self) -> &UnitOfWork<F> {
        &self.uow
    }

    /// Join the open transaction scope or open a new one.
    pub fn enlist_or_create_transaction(&self) -> Transaction<'_, F> {
        self.uow.enlist_or_create_transaction()
    }

    pub fn in_transaction(&self) -> bool {
        self.uow.in_transaction()
    }

    /// Start a query against `T`.
    pub fn query<T: 'static>(&self) -> DatabaseQuery {
        DatabaseQuery::of::<T>()
    }

    fn writer(&self, type_id: TypeId) -> Result<&Arc<DataProvider<F>>> {
        self.context.factory.provider_for(type_id)
    }

    /// Load by identity through the provider resolved for `type_id`.
    pub async fn get_entity(
        &self,
        cx: &Cx,
        type_id: TypeId,
        id: &Value,
    ) -> Outcome<Option<EntityRef>, Error> {
        let provider = try_result!(self.context.factory.get_provider(type_id));
        provider.get(cx, &self.uow, id).await
    }

    /// Load a `T` (or, for a base type, any member of its family) by identity.
    pub async fn get<T: 'static>(
        &self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<Option<EntityRef>, Error> {
        self.get_entity(cx, TypeId::of::<T>(), &id.into()).await
    }

    /// Load a concrete `T` by identity as an owned copy.
    pub async fn get_as<T: Entity + Clone>(
        &self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<Option<T>, Error> {
        let found = try_outcome!(self.get::<T>(cx, id).await);
        Outcome::Ok(found.and_then(|e| e.downcast_cloned::<T>()))
    }

    /// Like [`get`](Self::get), but a missing row is `MissingRecord`.
    pub async fn get_required<T: 'static>(
        &self,
        cx: &Cx,
        id: impl Into<Value>,
    ) -> Outcome<EntityRef, Error> {
        let id = id.into();
        match try_outcome!(self.get_entity(cx, TypeId::of::<T>(), &id).await) {
            Some(entity) => Outcome::Ok(entity),
            None => {
                let name = self
                    .context
                    .registry
                    .get(TypeId::of::<T>())
                    .map_or(std::any::type_name::<T>(), |m| m.type_name());
                Outcome::Err(Error::entity(
                    EntityErrorKind::MissingRecord,
                    name,
                    format!("no row with identity {id:?}"),
                ))
            }
        }
    }

    /// Insert or update `entity`; identity and row version are written back on success.
    pub async fn save<T: Mapped>(&self, cx: &Cx, entity: &mut T) -> Outcome<(), Error> {
        self.save_entity(cx, entity).await
    }

    pub async fn save_entity(&self, cx: &Cx, entity: &mut dyn Entity) -> Outcome<(), Error> {
        let provider = try_result!(self.writer(entity.entity_type()));
        provider.save(cx, &self.uow, entity).await
    }

    pub async fn delete(&self, cx: &Cx, entity: &dyn Entity) -> Outcome<(), Error> {
        let provider = try_result!(self.writer(entity.entity_type()));
        provider.delete(cx, &self.uow, entity).await
    }

    /// Insert `entities` in batches of `batch_size` rows (0: configured default).
    ///
    /// No events fire and no cache entries are written; call
    /// [`DataContext::invalidate_type`] to resynchronize cached lists.
    pub async fn bulk_insert<T: Mapped>(
        &self,
        cx: &Cx,
        entities: &[T],
        batch_size: usize,
    ) -> Outcome<u64, Error> {
        let provider = try_result!(self.writer(TypeId::of::<T>()));
        let refs: Vec<&dyn Entity> = entities.iter().map(|e| e as &dyn Entity).collect();
        provider.bulk_insert(cx, &self.uow, &refs, batch_size).await
    }

    /// Update `entities` in batches of `batch_size` statements (0: configured default).
    pub async fn bulk_update<T: Mapped>(
        &self,
        cx: &Cx,
        entities: &[T],
        batch_size: usize,
    ) -> Outcome<u64, Error> {
        let provider = try_result!(self.writer(TypeId::of::<T>()));
        let refs: Vec<&dyn Entity> = entities.iter().map(|e| e as &dyn Entity).collect();
        provider.bulk_update(cx, &self.uow, &refs, batch_size).await
    }

    /// Load the targets of `entity`'s many-to-many association `property`.
    pub async fn read_many_to_many_relation(
        &self,
        cx: &Cx,
        entity: &dyn Entity,
        property: &str,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let provider = try_result!(self.writer(entity.entity_type()));
        provider
            .read_many_to_many_relation(cx, &self.uow, entity, property)
            .await
    }
}

//! Per-type data provider.
//!
//! A [`DataProvider`] owns every storage operation for one entity type:
//! reads consult the session overlay and the object cache before going to
//! storage, writes go through the command generator and finish by handing
//! the result to the session's [`UnitOfWork`].
//!
//! Each operation leases its connection for exactly the storage calls it
//! makes; the lease is released on every exit path when it drops.

use std::any::TypeId;
use std::cmp::Ordering;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use datamapper_core::{
    Connection, ConnectionFactory, Entity, EntityErrorKind, EntityMetadata, EntityRef, Error,
    MetadataRegistry, Result, Row, Value, check_cancelled, try_outcome, try_result,
};
use datamapper_pool::Pool;
use datamapper_query::{
    AggregateFunction, IdentityReturn, QuerySpec, SortPart, SqlCommandGenerator, TableScope,
    next_version,
};

use crate::cache::CacheWrite;
use crate::events::{EntityChange, EntityUpdated};
use crate::unit_of_work::UnitOfWork;

/// Where a type's rows live and how they become entities.
#[derive(Debug, Clone)]
pub(crate) struct Shape {
    /// The type queries are issued against.
    root: TypeId,
    /// The concrete type owning the table.
    table: Arc<EntityMetadata>,
    /// Concrete types whose rows the table holds.
    family: Vec<Arc<EntityMetadata>>,
    /// Rows are told apart by a discriminator column.
    hierarchy: bool,
}

impl Shape {
    /// Resolve the storage of `type_id`, as a shared hierarchy table when `shared_table` is set.
    pub(crate) fn resolve(
        registry: &MetadataRegistry,
        type_id: TypeId,
        shared_table: bool,
    ) -> Result<Self> {
        let meta = registry.require(type_id)?;
        if !shared_table {
            if meta.is_abstract() {
                return Err(Error::entity(
                    EntityErrorKind::UnsupportedPolymorphicQuery,
                    meta.type_name(),
                    "abstract type has no table of its own",
                ));
            }
            return Ok(Self {
                root: type_id,
                table: Arc::clone(meta),
                family: vec![Arc::clone(meta)],
                hierarchy: false,
            });
        }
        let family = registry.concrete_family(type_id)?;
        let Some(table) = family.first().cloned() else {
            return Err(Error::entity(
                EntityErrorKind::UnsupportedPolymorphicQuery,
                meta.type_name(),
                "no concrete type stores rows for this type",
            ));
        };
        let hierarchy = family.len() > 1 || meta.is_abstract();
        if hierarchy && discriminator_column(&table).is_none() {
            return Err(Error::entity(
                EntityErrorKind::InvalidQuery,
                meta.type_name(),
                "a shared hierarchy table needs a discriminator column",
            ));
        }
        if let Some(stray) = family.iter().find(|m| m.table() != table.table()) {
            return Err(Error::entity(
                EntityErrorKind::InvalidQuery,
                stray.type_name(),
                format!("hierarchy members must share table '{}'", table.table()),
            ));
        }
        Ok(Self {
            root: type_id,
            table,
            family,
            hierarchy,
        })
    }

    pub(crate) fn table(&self) -> &Arc<EntityMetadata> {
        &self.table
    }

    pub(crate) fn family(&self) -> &[Arc<EntityMetadata>] {
        &self.family
    }

    fn scope(&self) -> TableScope<'_> {
        if self.hierarchy {
            TableScope::hierarchy(&self.table, &self.family)
        } else {
            TableScope::new(&self.table)
        }
    }

    /// Materialize a row as its runtime type.
    fn materialize(&self, registry: &MetadataRegistry, row: &Row) -> Result<EntityRef> {
        if !self.hierarchy {
            return self.table.materialize(row).map(Arc::from);
        }
        let value = discriminator_column(&self.table)
            .and_then(|column| row.get_by_name(column))
            .and_then(Value::as_str);
        let Some(value) = value else {
            return Err(Error::entity(
                EntityErrorKind::InvalidQuery,
                self.table.type_name(),
                "row has no discriminator value",
            ));
        };
        let Some(meta) = registry.resolve_discriminator(self.root, value) else {
            return Err(Error::entity(
                EntityErrorKind::InvalidQuery,
                self.table.type_name(),
                format!("unknown discriminator value '{value}'"),
            ));
        };
        meta.materialize(row).map(Arc::from)
    }
}

fn discriminator_column(meta: &EntityMetadata) -> Option<&str> {
    meta.discriminator().and_then(|d| d.column.as_deref())
}

/// Sort entities by `sort`, breaking ties on identity.
///
/// Property values are read through each entity's own runtime metadata, so a
/// mixed list of base and derived instances sorts on the shared columns.
pub(crate) fn sort_entities(
    registry: &MetadataRegistry,
    meta: &EntityMetadata,
    items: &mut [EntityRef],
    sort: &[SortPart],
) -> Result<()> {
    for part in sort {
        meta.require_property(&part.property)?;
    }
    items.sort_by(|a, b| {
        for part in sort {
            let ord = property_value(registry, a, &part.property)
                .compare(&property_value(registry, b, &part.property));
            let ord = if part.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id().compare(&b.id())
    });
    Ok(())
}

fn property_value(registry: &MetadataRegistry, entity: &EntityRef, property: &str) -> Value {
    registry
        .get(entity.entity_type())
        .and_then(|m| m.property(property))
        .map_or(Value::Null, |p| p.get(entity.as_ref()))
}

fn count_of(value: &Value) -> u64 {
    value
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0)
}

/// CRUD, list, aggregate and bulk operations for one entity type.
pub struct DataProvider<F: ConnectionFactory> {
    meta: Arc<EntityMetadata>,
    shape: Shape,
    registry: Arc<MetadataRegistry>,
    generator: Arc<SqlCommandGenerator>,
    pool: Pool<F>,
    batch_size: usize,
}

impl<F: ConnectionFactory> std::fmt::Debug for DataProvider<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProvider")
            .field("entity", &self.meta.type_name())
            .field("table", &self.shape.table.table())
            .field("hierarchy", &self.shape.hierarchy)
            .field("connection", &self.pool.connection_string())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> DataProvider<F> {
    pub(crate) fn new(
        registry: Arc<MetadataRegistry>,
        shape: Shape,
        generator: Arc<SqlCommandGenerator>,
        pool: Pool<F>,
        batch_size: usize,
    ) -> Result<Self> {
        let meta = Arc::clone(registry.require(shape.root)?);
        Ok(Self {
            meta,
            shape,
            registry,
            generator,
            pool,
            batch_size: batch_size.max(1),
        })
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        &self.meta
    }

    pub fn entity_type(&self) -> TypeId {
        self.meta.type_id()
    }

    pub fn pool(&self) -> &Pool<F> {
        &self.pool
    }

    /// Whether this provider reads a shared, discriminated hierarchy table.
    pub fn is_hierarchy(&self) -> bool {
        self.shape.hierarchy
    }

    fn entity_name(&self) -> &str {
        self.meta.type_name()
    }

    fn check_type(&self, entity: &dyn Entity) -> Result<()> {
        if entity.entity_type() == self.meta.type_id() {
            return Ok(());
        }
        let actual = self
            .registry
            .get(entity.entity_type())
            .map_or("<unregistered>", |m| m.type_name());
        Err(Error::entity(
            EntityErrorKind::InvalidQuery,
            self.entity_name(),
            format!("provider cannot write an entity of type {actual}"),
        ))
    }

    /// Load one entity by identity. `None` when no live row has that identity.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.meta.type_name()))]
    pub async fn get(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        id: &Value,
    ) -> Outcome<Option<EntityRef>, Error> {
        if id.is_null() {
            return Outcome::Ok(None);
        }
        for member in &self.shape.family {
            if let Some(staged) = uow.staged(member.type_id(), id) {
                return Outcome::Ok(staged);
            }
        }
        let cache = uow.cache();
        for member in &self.shape.family {
            if uow.may_use_cache(member.type_id()) {
                if let Some(hit) = cache.get(member.type_id(), id) {
                    return Outcome::Ok(Some(hit));
                }
            }
        }

        check_cancelled!(cx);
        let epoch = cache.read_epoch();
        let scope = self.shape.scope();
        let cmd = try_result!(self.generator.select_by_id(&scope, id));
        let rows = {
            let conn = try_outcome!(uow.lease(cx, &self.pool).await);
            try_outcome!(conn.query(cx, &cmd.sql, &cmd.params).await)
        };
        tracing::debug!(table = self.shape.table.table(), rows = rows.len(), "loaded by identity");
        let Some(row) = rows.first() else {
            return Outcome::Ok(None);
        };
        let entity = try_result!(self.shape.materialize(&self.registry, row));
        check_cancelled!(cx);
        if uow.may_populate_cache() {
            cache.put_observed(Arc::clone(&entity), epoch);
        }
        Outcome::Ok(Some(entity))
    }

    /// Run a query specification.
    ///
    /// An unfiltered query on a cacheable type is answered from the "all
    /// instances" snapshot when one exists. Storage reads populate the
    /// per-identity cache, and an unfiltered, unpaged read also stores the
    /// snapshot.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.meta.type_name()))]
    pub async fn get_list(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        spec: &QuerySpec,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let cache = uow.cache();
        let type_id = self.meta.type_id();
        let snapshot_allowed = cache.is_cacheable(type_id) && uow.may_use_cache(type_id);

        if snapshot_allowed && !spec.is_filtered() {
            if let Some(snapshot) = cache.all_instances(type_id) {
                let mut items: Vec<EntityRef> = snapshot.as_ref().clone();
                if !spec.sort.is_empty() || spec.paging.is_some() {
                    try_result!(sort_entities(
                        &self.registry,
                        &self.shape.table,
                        &mut items,
                        &spec.sort
                    ));
                }
                return Outcome::Ok(spec.paging.apply(items));
            }
        }

        check_cancelled!(cx);
        let epoch = cache.read_epoch();
        let scope = self.shape.scope();
        let cmd = try_result!(self.generator.select(&scope, spec));
        let rows = {
            let conn = try_outcome!(uow.lease(cx, &self.pool).await);
            try_outcome!(conn.query(cx, &cmd.sql, &cmd.params).await)
        };
        tracing::debug!(table = self.shape.table.table(), rows = rows.len(), "loaded list");

        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(try_result!(self.shape.materialize(&self.registry, row)));
        }
        check_cancelled!(cx);
        if uow.may_populate_cache() {
            for entity in &items {
                cache.put_observed(Arc::clone(entity), epoch);
            }
            if snapshot_allowed && !spec.is_filtered() && !spec.paging.is_some() {
                cache.put_all_instances_observed(type_id, items.clone(), epoch);
            }
        }
        Outcome::Ok(items)
    }

    /// Count the rows matching the specification's criteria.
    pub async fn count(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        spec: &QuerySpec,
    ) -> Outcome<u64, Error> {
        check_cancelled!(cx);
        let scope = self.shape.scope();
        let cmd = try_result!(self.generator.count(&scope, spec));
        let value = {
            let conn = try_outcome!(uow.lease(cx, &self.pool).await);
            try_outcome!(conn.scalar(cx, &cmd.sql, &cmd.params).await)
        };
        Outcome::Ok(count_of(&value))
    }

    /// Apply an aggregate function to one property over the matching rows.
    ///
    /// Yields `Value::Null` for SUM/AVG/MIN/MAX over no rows.
    pub async fn aggregate(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        spec: &QuerySpec,
        function: AggregateFunction,
        property: &str,
    ) -> Outcome<Value, Error> {
        check_cancelled!(cx);
        let scope = self.shape.scope();
        let cmd = try_result!(self.generator.aggregate(&scope, spec, function, property));
        let conn = try_outcome!(uow.lease(cx, &self.pool).await);
        let value = try_outcome!(conn.scalar(cx, &cmd.sql, &cmd.params).await);
        tracing::debug!(function = function.as_sql(), property, "aggregate");
        Outcome::Ok(value)
    }

    /// Insert a new entity or update a persisted one.
    ///
    /// Validation runs before any storage I/O. The entity's identity (for an
    /// auto-numbered insert) and row version are updated only after storage
    /// reports success; on any failure the entity and the cache are left as
    /// they were.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.meta.type_name()))]
    pub async fn save(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        entity: &mut dyn Entity,
    ) -> Outcome<(), Error> {
        try_result!(self.check_type(&*entity));
        if let Err(e) = entity.validate() {
            tracing::debug!(errors = e.errors.len(), "validation rejected save");
            return Outcome::Err(Error::Validation(e));
        }
        check_cancelled!(cx);

        let change = if entity.is_new() {
            try_outcome!(self.insert(cx, uow, entity).await);
            EntityChange::Inserted
        } else {
            try_outcome!(self.update(cx, uow, entity).await);
            EntityChange::Updated
        };

        let saved: EntityRef = Arc::from(entity.clone_entity());
        uow.complete_write(
            CacheWrite::Saved(Arc::clone(&saved)),
            EntityUpdated {
                entity: saved,
                change,
            },
        )
        .await;
        Outcome::Ok(())
    }

    async fn insert(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        entity: &mut dyn Entity,
    ) -> Outcome<(), Error> {
        let insert = try_result!(self.generator.insert(&self.meta, &*entity));
        let cmd = &insert.command;
        let assigned = {
            let conn = try_outcome!(uow.lease(cx, &self.pool).await);
            match insert.identity {
                Some(IdentityReturn::Returning | IdentityReturn::Output) => {
                    let row = try_outcome!(conn.query_one(cx, &cmd.sql, &cmd.params).await);
                    Some(row.and_then(|r| r.first().cloned()).unwrap_or(Value::Null))
                }
                Some(IdentityReturn::LastInsertId) => Some(Value::BigInt(try_outcome!(
                    conn.insert(cx, &cmd.sql, &cmd.params).await
                ))),
                None => {
                    try_outcome!(conn.execute(cx, &cmd.sql, &cmd.params).await);
                    None
                }
            }
        };

        if let Some(id) = assigned {
            if id.is_null() {
                return Outcome::Err(Error::entity(
                    EntityErrorKind::InvalidQuery,
                    self.entity_name(),
                    "storage did not report the assigned identity",
                ));
            }
            try_result!(self.meta.identity().set(entity, id));
        }
        if let Some(version) = self.meta.row_version() {
            try_result!(version.set(entity, Value::BigInt(1)));
        }
        tracing::debug!(id = ?entity.id(), "inserted");
        Outcome::Ok(())
    }

    async fn update(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        entity: &mut dyn Entity,
    ) -> Outcome<(), Error> {
        let cmd = try_result!(self.generator.update(&self.meta, &*entity));
        let affected = {
            let conn = try_outcome!(uow.lease(cx, &self.pool).await);
            try_outcome!(conn.execute(cx, &cmd.sql, &cmd.params).await)
        };
        if affected == 0 {
            return self.write_missed(cx, uow, &*entity).await;
        }
        if let Some(version) = self.meta.row_version() {
            let next = next_version(&version.get(&*entity));
            try_result!(version.set(entity, next));
        }
        tracing::debug!(id = ?entity.id(), "updated");
        Outcome::Ok(())
    }

    /// Explain a guarded write that touched no row: the row either exists
    /// with another version (conflict) or is gone.
    async fn write_missed(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        entity: &dyn Entity,
    ) -> Outcome<(), Error> {
        let id = entity.id();
        let cmd = try_result!(self.generator.exists_by_id(&self.meta, &id));
        let live = {
            let conn = try_outcome!(uow.lease(cx, &self.pool).await);
            try_outcome!(conn.scalar(cx, &cmd.sql, &cmd.params).await)
        };
        uow.cache().remove(self.meta.type_id(), &id);
        if count_of(&live) > 0 {
            tracing::warn!(entity = self.entity_name(), ?id, "row version conflict");
            Outcome::Err(Error::entity(
                EntityErrorKind::ConcurrencyConflict,
                self.entity_name(),
                format!("row {id:?} was changed by another writer"),
            ))
        } else {
            Outcome::Err(Error::entity(
                EntityErrorKind::MissingRecord,
                self.entity_name(),
                format!("no row with identity {id:?}"),
            ))
        }
    }

    /// Delete an entity (soft delete when the type has a soft-delete column).
    ///
    /// Deleting an identity that is already gone fails with `MissingRecord`.
    #[tracing::instrument(level = "debug", skip_all, fields(entity = self.meta.type_name()))]
    pub async fn delete(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        entity: &dyn Entity,
    ) -> Outcome<(), Error> {
        try_result!(self.check_type(entity));
        let id = entity.id();
        if id.is_null() {
            return Outcome::Err(Error::entity(
                EntityErrorKind::MissingRecord,
                self.entity_name(),
                "entity was never saved",
            ));
        }
        check_cancelled!(cx);
        let cmd = try_result!(self.generator.delete(&self.meta, entity));
        let affected = {
            let conn = try_outcome!(uow.lease(cx, &self.pool).await);
            try_outcome!(conn.execute(cx, &cmd.sql, &cmd.params).await)
        };
        if affected == 0 {
            return self.write_missed(cx, uow, entity).await;
        }
        tracing::debug!(?id, "deleted");
        uow.complete_write(
            CacheWrite::Deleted {
                entity_type: self.meta.type_id(),
                id,
            },
            EntityUpdated {
                entity: Arc::from(entity.clone_entity()),
                change: EntityChange::Deleted,
            },
        )
        .await;
        Outcome::Ok(())
    }

    fn batch_size(&self, requested: usize) -> usize {
        if requested == 0 {
            self.batch_size
        } else {
            requested
        }
    }

    fn check_batch(&self, entities: &[&dyn Entity]) -> Result<()> {
        for entity in entities {
            self.check_type(*entity)?;
            entity.validate().map_err(Error::Validation)?;
        }
        Ok(())
    }

    async fn run_batch(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        statements: Vec<(String, Vec<Value>)>,
    ) -> Outcome<u64, Error> {
        check_cancelled!(cx);
        let affected = {
            let conn = try_outcome!(uow.lease(cx, &self.pool).await);
            try_outcome!(conn.batch(cx, &statements).await)
        };
        // Bulk writes skip per-entity cache upkeep; only fence in-flight reads.
        uow.touch(self.meta.type_id());
        uow.cache().record_bulk_write(self.meta.type_id());
        Outcome::Ok(affected.iter().sum())
    }

    /// Insert many entities with one multi-row INSERT per batch.
    ///
    /// Identities assigned by storage are not reported back, no
    /// "entity updated" events fire, and cached snapshots are left alone.
    /// `batch_size` 0 uses the configured default.
    pub async fn bulk_insert(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        entities: &[&dyn Entity],
        batch_size: usize,
    ) -> Outcome<u64, Error> {
        try_result!(self.check_batch(entities));
        if entities.is_empty() {
            return Outcome::Ok(0);
        }
        let mut statements = Vec::new();
        for chunk in entities.chunks(self.batch_size(batch_size)) {
            let cmd = try_result!(self.generator.insert_many(&self.meta, chunk));
            statements.push((cmd.sql.to_string(), cmd.params));
        }
        tracing::debug!(rows = entities.len(), batches = statements.len(), "bulk insert");
        self.run_batch(cx, uow, statements).await
    }

    /// Update many entities, sending `batch_size` UPDATE statements per round trip.
    ///
    /// Each UPDATE carries the same row-version guard as [`save`](Self::save)
    /// and bumps the stored version. A row whose stored version moved on is
    /// left untouched without an error and does not count towards the
    /// returned total; the in-memory entities keep their versions.
    pub async fn bulk_update(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        entities: &[&dyn Entity],
        batch_size: usize,
    ) -> Outcome<u64, Error> {
        try_result!(self.check_batch(entities));
        let mut total = 0;
        for chunk in entities.chunks(self.batch_size(batch_size)) {
            let mut statements = Vec::with_capacity(chunk.len());
            for entity in chunk {
                let cmd = try_result!(self.generator.update(&self.meta, *entity));
                statements.push((cmd.sql.to_string(), cmd.params));
            }
            total += try_outcome!(self.run_batch(cx, uow, statements).await);
        }
        tracing::debug!(rows = entities.len(), updated = total, "bulk update");
        Outcome::Ok(total)
    }

    /// Load the targets of a many-to-many association of `entity`.
    pub async fn read_many_to_many_relation(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        entity: &dyn Entity,
        property: &str,
    ) -> Outcome<Vec<EntityRef>, Error> {
        try_result!(self.check_type(entity));
        let Some(relation) = self.meta.many_to_many().iter().find(|m| m.property == property)
        else {
            return Outcome::Err(Error::entity(
                EntityErrorKind::UnknownProperty,
                self.entity_name(),
                format!("no many-to-many association '{property}'"),
            ));
        };
        let target = try_result!(self.registry.require(relation.target));
        let shared = discriminator_column(target).is_some()
            || self.registry.derived_classes(relation.target).iter().any(|d| discriminator_column(d).is_some());
        let shape = try_result!(Shape::resolve(&self.registry, relation.target, shared));

        check_cancelled!(cx);
        let cache = uow.cache();
        let epoch = cache.read_epoch();
        let scope = shape.scope();
        let cmd = try_result!(self.generator.select_many_to_many(&scope, relation, &entity.id()));
        let rows = {
            let conn = try_outcome!(uow.lease(cx, &self.pool).await);
            try_outcome!(conn.query(cx, &cmd.sql, &cmd.params).await)
        };
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(try_result!(shape.materialize(&self.registry, row)));
        }
        check_cancelled!(cx);
        if uow.may_populate_cache() {
            for item in &items {
                cache.put_observed(Arc::clone(item), epoch);
            }
        }
        tracing::debug!(relation = property, rows = items.len(), "loaded many-to-many targets");
        Outcome::Ok(items)
    }
}

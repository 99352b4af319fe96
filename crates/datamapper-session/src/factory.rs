//! Provider factory and polymorphic resolution.
//!
//! The factory owns one direct provider per concrete type (used for writes)
//! and answers `get_provider` for reads according to the configured
//! [`PolymorphismStrategy`]:
//!
//! - `None`: only types without derived types can be read.
//! - `TablePerHierarchy`: one provider reads the shared table and tells rows
//!   apart by discriminator.
//! - `TablePerType`: a base-type read is a union over the concrete family,
//!   merged in memory.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use datamapper_core::{
    ConnectionFactory, EntityErrorKind, EntityMetadata, EntityRef, Error, MetadataRegistry,
    Result, Value, try_outcome, try_result,
};
use datamapper_query::{AggregateFunction, Paging, QuerySpec};

use crate::config::PolymorphismStrategy;
use crate::provider::{DataProvider, Shape, sort_entities};
use crate::unit_of_work::UnitOfWork;

pub struct DataProviderFactory<F: ConnectionFactory> {
    strategy: PolymorphismStrategy,
    registry: Arc<MetadataRegistry>,
    /// Per concrete type, reading and writing its own table.
    providers: HashMap<TypeId, Arc<DataProvider<F>>>,
    /// Per type, reading the whole shared table of its hierarchy.
    hierarchy: HashMap<TypeId, Arc<DataProvider<F>>>,
}

impl<F: ConnectionFactory> std::fmt::Debug for DataProviderFactory<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataProviderFactory")
            .field("strategy", &self.strategy)
            .field("providers", &self.providers.len())
            .field("hierarchy", &self.hierarchy.len())
            .finish_non_exhaustive()
    }
}

impl<F: ConnectionFactory> DataProviderFactory<F> {
    /// Build every provider up front. `make` turns a storage shape into a provider.
    pub(crate) fn new(
        registry: Arc<MetadataRegistry>,
        strategy: PolymorphismStrategy,
        mut make: impl FnMut(Shape) -> Result<DataProvider<F>>,
    ) -> Result<Self> {
        let mut providers = HashMap::new();
        let mut hierarchy = HashMap::new();
        for meta in registry.types() {
            if !meta.is_abstract() {
                let shape = Shape::resolve(&registry, meta.type_id(), false)?;
                providers.insert(meta.type_id(), Arc::new(make(shape)?));
            }
            if strategy == PolymorphismStrategy::TablePerHierarchy {
                // Types that cannot be read as a hierarchy report why on lookup.
                if let Ok(shape) = Shape::resolve(&registry, meta.type_id(), true) {
                    hierarchy.insert(meta.type_id(), Arc::new(make(shape)?));
                }
            }
        }
        tracing::debug!(
            ?strategy,
            providers = providers.len(),
            hierarchy = hierarchy.len(),
            "built data providers"
        );
        Ok(Self {
            strategy,
            registry,
            providers,
            hierarchy,
        })
    }

    pub fn strategy(&self) -> PolymorphismStrategy {
        self.strategy
    }

    /// Whether base-type reads are answered at all.
    pub fn supports_polymorphism(&self) -> bool {
        self.strategy != PolymorphismStrategy::None
    }

    /// The provider writing `type_id`'s own table.
    pub fn provider_for(&self, type_id: TypeId) -> Result<&Arc<DataProvider<F>>> {
        let meta = self.registry.require(type_id)?;
        self.providers.get(&type_id).ok_or_else(|| {
            Error::entity(
                EntityErrorKind::UnsupportedPolymorphicQuery,
                meta.type_name(),
                "abstract types cannot be written",
            )
        })
    }

    /// The provider answering reads of `type_id` under the configured strategy.
    pub fn get_provider(&self, type_id: TypeId) -> Result<ResolvedProvider<F>> {
        let meta = self.registry.require(type_id)?;
        match self.strategy {
            PolymorphismStrategy::None => {
                if meta.is_abstract() || !meta.derived().is_empty() {
                    return Err(Error::entity(
                        EntityErrorKind::UnsupportedPolymorphicQuery,
                        meta.type_name(),
                        "polymorphic queries are disabled",
                    ));
                }
                self.provider_for(type_id)
                    .map(|p| ResolvedProvider::Direct(Arc::clone(p)))
            }
            PolymorphismStrategy::TablePerHierarchy => match self.hierarchy.get(&type_id) {
                Some(provider) => Ok(ResolvedProvider::Direct(Arc::clone(provider))),
                None => Err(Shape::resolve(&self.registry, type_id, true)
                    .err()
                    .unwrap_or_else(|| {
                        Error::entity(
                            EntityErrorKind::UnknownEntityType,
                            meta.type_name(),
                            "no hierarchy provider",
                        )
                    })),
            },
            PolymorphismStrategy::TablePerType => {
                let family = self.registry.concrete_family(type_id)?;
                match family.as_slice() {
                    [] => Err(Error::entity(
                        EntityErrorKind::UnsupportedPolymorphicQuery,
                        meta.type_name(),
                        "no concrete type stores rows for this type",
                    )),
                    [only] if only.type_id() == type_id => self
                        .provider_for(type_id)
                        .map(|p| ResolvedProvider::Direct(Arc::clone(p))),
                    members => {
                        let members = members
                            .iter()
                            .map(|m| self.provider_for(m.type_id()).map(Arc::clone))
                            .collect::<Result<Vec<_>>>()?;
                        Ok(ResolvedProvider::Union(UnionProvider {
                            meta: Arc::clone(meta),
                            registry: Arc::clone(&self.registry),
                            members,
                        }))
                    }
                }
            }
        }
    }

    pub(crate) fn providers(&self) -> impl Iterator<Item = &Arc<DataProvider<F>>> {
        self.providers.values().chain(self.hierarchy.values())
    }
}

/// A read provider resolved for one (possibly base) type.
pub enum ResolvedProvider<F: ConnectionFactory> {
    Direct(Arc<DataProvider<F>>),
    Union(UnionProvider<F>),
}

impl<F: ConnectionFactory> std::fmt::Debug for ResolvedProvider<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedProvider::Direct(p) => f.debug_tuple("Direct").field(p).finish(),
            ResolvedProvider::Union(u) => f
                .debug_struct("Union")
                .field("entity", &u.meta.type_name())
                .field("members", &u.members.len())
                .finish(),
        }
    }
}

impl<F: ConnectionFactory> ResolvedProvider<F> {
    /// The type this provider was resolved for.
    pub fn metadata(&self) -> &Arc<EntityMetadata> {
        match self {
            ResolvedProvider::Direct(p) => p.metadata(),
            ResolvedProvider::Union(u) => &u.meta,
        }
    }

    pub fn is_union(&self) -> bool {
        matches!(self, ResolvedProvider::Union(_))
    }

    pub async fn get(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        id: &Value,
    ) -> Outcome<Option<EntityRef>, Error> {
        match self {
            ResolvedProvider::Direct(p) => p.get(cx, uow, id).await,
            ResolvedProvider::Union(u) => u.get(cx, uow, id).await,
        }
    }

    pub async fn get_list(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        spec: &QuerySpec,
    ) -> Outcome<Vec<EntityRef>, Error> {
        match self {
            ResolvedProvider::Direct(p) => p.get_list(cx, uow, spec).await,
            ResolvedProvider::Union(u) => u.get_list(cx, uow, spec).await,
        }
    }

    pub async fn count(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        spec: &QuerySpec,
    ) -> Outcome<u64, Error> {
        match self {
            ResolvedProvider::Direct(p) => p.count(cx, uow, spec).await,
            ResolvedProvider::Union(u) => u.count(cx, uow, spec).await,
        }
    }

    pub async fn aggregate(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        spec: &QuerySpec,
        function: AggregateFunction,
        property: &str,
    ) -> Outcome<Value, Error> {
        match self {
            ResolvedProvider::Direct(p) => p.aggregate(cx, uow, spec, function, property).await,
            ResolvedProvider::Union(u) => u.aggregate(cx, uow, spec, function, property).await,
        }
    }
}

/// Reads of a base type spread over the tables of its concrete family.
pub struct UnionProvider<F: ConnectionFactory> {
    meta: Arc<EntityMetadata>,
    registry: Arc<MetadataRegistry>,
    members: Vec<Arc<DataProvider<F>>>,
}

impl<F: ConnectionFactory> UnionProvider<F> {
    pub fn members(&self) -> &[Arc<DataProvider<F>>] {
        &self.members
    }

    /// Looks the identity up in every member table.
    ///
    /// Identities are numbered per table, so the same id may be held by
    /// several members; that read is rejected instead of guessing a type.
    async fn get(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        id: &Value,
    ) -> Outcome<Option<EntityRef>, Error> {
        let mut found: Option<EntityRef> = None;
        let mut holders = Vec::new();
        for member in &self.members {
            if let Some(hit) = try_outcome!(member.get(cx, uow, id).await) {
                holders.push(member.metadata().type_name());
                if found.is_none() {
                    found = Some(hit);
                }
            }
        }
        if holders.len() > 1 {
            tracing::debug!(
                entity = self.meta.type_name(),
                ?holders,
                "identity held by several member tables"
            );
            return Outcome::Err(Error::entity(
                EntityErrorKind::InvalidQuery,
                self.meta.type_name(),
                format!(
                    "identity {id:?} is held by {}; read it through the concrete type",
                    holders.join(", ")
                ),
            ));
        }
        Outcome::Ok(found)
    }

    /// Each member supplies at most the rows the page could need; the merge
    /// is sorted and the page cut in memory.
    async fn get_list(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        spec: &QuerySpec,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let member_paging = spec.paging.prefix_len().map_or(Paging::None, Paging::Top);
        let mut items = Vec::new();
        for member in &self.members {
            let mut member_spec = spec.retarget(member.entity_type());
            member_spec.paging = member_paging;
            items.extend(try_outcome!(member.get_list(cx, uow, &member_spec).await));
        }
        if !spec.sort.is_empty() || spec.paging.is_some() {
            let sort_meta = self.members.first().map_or(&self.meta, |m| m.metadata());
            try_result!(sort_entities(&self.registry, sort_meta, &mut items, &spec.sort));
        }
        tracing::debug!(
            entity = self.meta.type_name(),
            members = self.members.len(),
            merged = items.len(),
            "union read"
        );
        Outcome::Ok(spec.paging.apply(items))
    }

    async fn count(&self, cx: &Cx, uow: &UnitOfWork<F>, spec: &QuerySpec) -> Outcome<u64, Error> {
        let mut total = 0;
        for member in &self.members {
            let member_spec = spec.retarget(member.entity_type());
            total += try_outcome!(member.count(cx, uow, &member_spec).await);
        }
        Outcome::Ok(total)
    }

    async fn aggregate(
        &self,
        cx: &Cx,
        uow: &UnitOfWork<F>,
        spec: &QuerySpec,
        function: AggregateFunction,
        property: &str,
    ) -> Outcome<Value, Error> {
        let mut sums = Accumulator::default();
        let mut counts = Accumulator::default();
        let mut extreme: Option<Value> = None;
        for member in &self.members {
            let member_spec = spec.retarget(member.entity_type());
            match function {
                AggregateFunction::Count | AggregateFunction::Sum => {
                    let v = try_outcome!(
                        member.aggregate(cx, uow, &member_spec, function, property).await
                    );
                    sums.add(&v);
                }
                AggregateFunction::Avg => {
                    let sum = try_outcome!(
                        member
                            .aggregate(cx, uow, &member_spec, AggregateFunction::Sum, property)
                            .await
                    );
                    let count = try_outcome!(
                        member
                            .aggregate(cx, uow, &member_spec, AggregateFunction::Count, property)
                            .await
                    );
                    sums.add(&sum);
                    counts.add(&count);
                }
                AggregateFunction::Min | AggregateFunction::Max => {
                    let v = try_outcome!(
                        member.aggregate(cx, uow, &member_spec, function, property).await
                    );
                    if v.is_null() {
                        continue;
                    }
                    let replace = extreme.as_ref().is_none_or(|current| {
                        let ord = v.compare(current);
                        if function == AggregateFunction::Min {
                            ord.is_lt()
                        } else {
                            ord.is_gt()
                        }
                    });
                    if replace {
                        extreme = Some(v);
                    }
                }
            }
        }
        let value = match function {
            AggregateFunction::Count => Value::BigInt(sums.int),
            AggregateFunction::Sum => sums.value(),
            AggregateFunction::Avg => {
                if counts.int == 0 {
                    Value::Null
                } else {
                    Value::Double(sums.float / counts.int as f64)
                }
            }
            AggregateFunction::Min | AggregateFunction::Max => extreme.unwrap_or(Value::Null),
        };
        Outcome::Ok(value)
    }
}

/// Running sum over member aggregates; integer while every input is.
#[derive(Debug, Default)]
struct Accumulator {
    int: i64,
    float: f64,
    fractional: bool,
    seen: bool,
}

impl Accumulator {
    fn add(&mut self, value: &Value) {
        match value {
            Value::Null => {}
            Value::Int(_) | Value::BigInt(_) => {
                let n = value.as_i64().unwrap_or(0);
                self.int = self.int.saturating_add(n);
                self.float += n as f64;
                self.seen = true;
            }
            other => {
                if let Some(f) = other.as_f64() {
                    self.float += f;
                    self.fractional = true;
                    self.seen = true;
                }
            }
        }
    }

    fn value(&self) -> Value {
        match (self.seen, self.fractional) {
            (false, _) => Value::Null,
            (true, false) => Value::BigInt(self.int),
            (true, true) => Value::Double(self.float),
        }
    }
}

//! Fluent query builder.
//!
//! A [`DatabaseQuery`] accumulates criteria, sort parts, paging, include
//! paths and a parameter bag, then executes against a [`Session`]. Building
//! never touches storage; every execution resolves the provider for the
//! query's type through the session's factory.
//!
//! ```rust,ignore
//! let page = DatabaseQuery::of::<Invoice>()
//!     .filter(Criterion::gt("Total", 100.0))
//!     .order_by_desc("Total")
//!     .then_by("Number")
//!     .page(20, 10)
//!     .include("Customer")
//!     .get_list(&cx, &session)
//!     .await;
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use asupersync::{Cx, Outcome};
use datamapper_core::{
    ConnectionFactory, Entity, EntityErrorKind, EntityRef, EntityRefExt, Error, MetadataRegistry,
    Result, Value, try_outcome, try_result,
};
use datamapper_query::{AggregateFunction, Criterion, Paging, QuerySpec, SortPart};

use crate::context::Session;

/// A query specification under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseQuery {
    spec: QuerySpec,
}

impl DatabaseQuery {
    pub fn new(entity: TypeId) -> Self {
        Self {
            spec: QuerySpec::new(entity),
        }
    }

    pub fn of<T: 'static>() -> Self {
        Self::new(TypeId::of::<T>())
    }

    /// Wrap an existing specification.
    pub fn from_spec(spec: QuerySpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }

    pub fn into_spec(self) -> QuerySpec {
        self.spec
    }

    /// Add a criterion. Criteria are combined with AND.
    pub fn filter(mut self, criterion: Criterion) -> Self {
        self.spec.criteria.push(criterion);
        self
    }

    pub fn where_eq(self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(Criterion::eq(property, value))
    }

    /// Replace the sort order with one ascending key.
    pub fn order_by(mut self, property: impl Into<String>) -> Self {
        self.spec.sort.clear();
        self.spec.sort.push(SortPart::asc(property));
        self
    }

    /// Replace the sort order with one descending key.
    pub fn order_by_desc(mut self, property: impl Into<String>) -> Self {
        self.spec.sort.clear();
        self.spec.sort.push(SortPart::desc(property));
        self
    }

    /// Append an ascending tie-breaker.
    pub fn then_by(mut self, property: impl Into<String>) -> Self {
        self.spec.sort.push(SortPart::asc(property));
        self
    }

    pub fn then_by_desc(mut self, property: impl Into<String>) -> Self {
        self.spec.sort.push(SortPart::desc(property));
        self
    }

    /// Zero-based window of `size` rows starting at `start`.
    pub fn page(mut self, start: u64, size: u64) -> Self {
        self.spec.paging = Paging::Page { start, size };
        self
    }

    pub fn top(mut self, n: u64) -> Self {
        self.spec.paging = Paging::Top(n);
        self
    }

    /// Eagerly load a reference path such as `"Customer"` or `"Customer.Region"`.
    pub fn include(mut self, path: impl Into<String>) -> Self {
        self.spec.includes.push(path.into());
        self
    }

    /// Bind a named parameter referenced by `Criterion::param`.
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.spec.params.insert(name.into(), value.into());
        self
    }

    /// The same criteria, sort, paging and includes aimed at another type.
    pub fn clone_for<U: 'static>(&self) -> Self {
        Self {
            spec: self.spec.retarget(TypeId::of::<U>()),
        }
    }

    /// Run the query. Entities come back as their runtime types.
    pub async fn get_list<F: ConnectionFactory>(
        &self,
        cx: &Cx,
        session: &Session<F>,
    ) -> Outcome<Vec<EntityRef>, Error> {
        let provider = try_result!(session.context().factory().get_provider(self.spec.entity));
        let items = try_outcome!(provider.get_list(cx, session.unit_of_work(), &self.spec).await);
        if self.spec.includes.is_empty() {
            return Outcome::Ok(items);
        }
        let tree = try_result!(IncludeTree::parse(&self.spec.includes));
        attach(cx, session, &tree, items).await
    }

    /// Run the query, keeping the results that are `T`s.
    pub async fn get_list_of<T, F>(&self, cx: &Cx, session: &Session<F>) -> Outcome<Vec<T>, Error>
    where
        T: Entity + Clone,
        F: ConnectionFactory,
    {
        let items = try_outcome!(self.get_list(cx, session).await);
        Outcome::Ok(items.iter().filter_map(|e| e.downcast_cloned::<T>()).collect())
    }

    /// The first result in sort order, if any.
    pub async fn first_or_default<F: ConnectionFactory>(
        &self,
        cx: &Cx,
        session: &Session<F>,
    ) -> Outcome<Option<EntityRef>, Error> {
        let mut first = self.clone();
        first.spec.paging = match self.spec.paging {
            Paging::Page { start, .. } => Paging::Page { start, size: 1 },
            Paging::None | Paging::Top(_) => Paging::Top(1),
        };
        let items = try_outcome!(first.get_list(cx, session).await);
        Outcome::Ok(items.into_iter().next())
    }

    /// Number of matching rows. Sort and paging are ignored.
    pub async fn count<F: ConnectionFactory>(
        &self,
        cx: &Cx,
        session: &Session<F>,
    ) -> Outcome<u64, Error> {
        let provider = try_result!(session.context().factory().get_provider(self.spec.entity));
        provider.count(cx, session.unit_of_work(), &self.spec).await
    }

    pub async fn any<F: ConnectionFactory>(
        &self,
        cx: &Cx,
        session: &Session<F>,
    ) -> Outcome<bool, Error> {
        let n = try_outcome!(self.count(cx, session).await);
        Outcome::Ok(n > 0)
    }

    pub async fn aggregate<F: ConnectionFactory>(
        &self,
        cx: &Cx,
        session: &Session<F>,
        function: AggregateFunction,
        property: &str,
    ) -> Outcome<Value, Error> {
        let provider = try_result!(session.context().factory().get_provider(self.spec.entity));
        provider
            .aggregate(cx, session.unit_of_work(), &self.spec, function, property)
            .await
    }

    pub async fn sum<F: ConnectionFactory>(
        &self,
        cx: &Cx,
        session: &Session<F>,
        property: &str,
    ) -> Outcome<Value, Error> {
        self.aggregate(cx, session, AggregateFunction::Sum, property).await
    }

    pub async fn avg<F: ConnectionFactory>(
        &self,
        cx: &Cx,
        session: &Session<F>,
        property: &str,
    ) -> Outcome<Value, Error> {
        self.aggregate(cx, session, AggregateFunction::Avg, property).await
    }

    pub async fn min<F: ConnectionFactory>(
        &self,
        cx: &Cx,
        session: &Session<F>,
        property: &str,
    ) -> Outcome<Value, Error> {
        self.aggregate(cx, session, AggregateFunction::Min, property).await
    }

    pub async fn max<F: ConnectionFactory>(
        &self,
        cx: &Cx,
        session: &Session<F>,
        property: &str,
    ) -> Outcome<Value, Error> {
        self.aggregate(cx, session, AggregateFunction::Max, property).await
    }
}

/// Include paths folded into a tree: `["A.B", "A.C"]` loads `A` once.
#[derive(Debug, Default, PartialEq)]
struct IncludeTree {
    children: Vec<(String, IncludeTree)>,
}

impl IncludeTree {
    fn parse(paths: &[String]) -> Result<Self> {
        let mut root = Self::default();
        for path in paths {
            let mut node = &mut root;
            for segment in path.split('.') {
                let segment = segment.trim();
                if segment.is_empty() {
                    return Err(Error::entity(
                        EntityErrorKind::InvalidQuery,
                        "include",
                        format!("malformed include path '{path}'"),
                    ));
                }
                let index = match node.children.iter().position(|(name, _)| name == segment) {
                    Some(i) => i,
                    None => {
                        node.children.push((segment.to_string(), Self::default()));
                        node.children.len() - 1
                    }
                };
                node = &mut node.children[index].1;
            }
        }
        Ok(root)
    }
}

/// The foreign-key value of `segment` on one owner, with the owner's reference descriptor.
fn foreign_key(
    registry: &MetadataRegistry,
    owner: &EntityRef,
    segment: &str,
) -> Result<(TypeId, Value)> {
    let meta = registry.require(owner.entity_type())?;
    let Some(reference) = meta.reference(segment) else {
        return Err(Error::entity(
            EntityErrorKind::UnknownProperty,
            meta.type_name(),
            format!("no reference '{segment}' to include"),
        ));
    };
    let fk = meta.require_property(&reference.foreign_key)?.get(owner.as_ref());
    Ok((reference.target, fk))
}

type AttachFuture<'a> = Pin<Box<dyn Future<Output = Outcome<Vec<EntityRef>, Error>> + Send + 'a>>;

/// Load every reference named in `tree` with one IN query per segment and
/// attach the targets to copies of `owners`.
///
/// Owners may be shared cache entries, so targets are attached to clones.
fn attach<'a, F: ConnectionFactory>(
    cx: &'a Cx,
    session: &'a Session<F>,
    tree: &'a IncludeTree,
    owners: Vec<EntityRef>,
) -> AttachFuture<'a> {
    Box::pin(async move {
        let context = session.context();
        let registry = context.registry();
        let mut owners = owners;
        for (segment, children) in &tree.children {
            let mut target_type = None;
            let mut keys: Vec<Value> = Vec::new();
            for owner in &owners {
                let (target, fk) = try_result!(foreign_key(registry, owner, segment));
                target_type.get_or_insert(target);
                if !fk.is_null() && !keys.iter().any(|k| k.same_as(&fk)) {
                    keys.push(fk);
                }
            }
            let Some(target_type) = target_type else {
                return Outcome::Ok(owners);
            };

            let targets = if keys.is_empty() {
                Vec::new()
            } else {
                let family = try_result!(registry.concrete_family(target_type));
                let Some(identity) = family.first().map(|m| m.identity().name.clone()) else {
                    return Outcome::Err(Error::entity(
                        EntityErrorKind::UnsupportedPolymorphicQuery,
                        segment.as_str(),
                        "include target has no concrete type",
                    ));
                };
                let provider = try_result!(context.factory().get_provider(target_type));
                let mut spec = QuerySpec::new(target_type);
                spec.criteria.push(Criterion::is_in(identity, keys));
                let loaded =
                    try_outcome!(provider.get_list(cx, session.unit_of_work(), &spec).await);
                try_outcome!(attach(cx, session, children, loaded).await)
            };
            tracing::debug!(include = segment.as_str(), loaded = targets.len(), "attached include");

            let by_key: HashMap<u64, &EntityRef> =
                targets.iter().map(|t| (t.id().key_hash(), t)).collect();
            let mut attached = Vec::with_capacity(owners.len());
            for owner in &owners {
                let (_, fk) = try_result!(foreign_key(registry, owner, segment));
                let meta = try_result!(registry.require(owner.entity_type()));
                let target = by_key
                    .get(&fk.key_hash())
                    .filter(|t| t.id().same_as(&fk))
                    .map(|t| Arc::clone(t));
                let mut copy = owner.clone_entity();
                if let Some(reference) = meta.reference(segment) {
                    reference.attach(copy.as_mut(), target);
                }
                attached.push(EntityRef::from(copy));
            }
            owners = attached;
        }
        Outcome::Ok(owners)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_accumulates_spec() {
        let query = DatabaseQuery::new(TypeId::of::<u8>())
            .where_eq("Status", "open")
            .order_by("Number")
            .order_by_desc("Total")
            .then_by("Number")
            .page(20, 10)
            .include("Customer")
            .param("min", 5);
        let spec = query.spec();
        assert_eq!(spec.criteria.len(), 1);
        assert_eq!(spec.sort, vec![SortPart::desc("Total"), SortPart::asc("Number")]);
        assert_eq!(spec.paging, Paging::Page { start: 20, size: 10 });
        assert_eq!(spec.includes, vec!["Customer".to_string()]);
        assert_eq!(spec.params.get("min"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_clone_for_keeps_everything_but_type() {
        let query = DatabaseQuery::of::<u8>().where_eq("Name", "x").top(3);
        let other = query.clone_for::<u16>();
        assert_eq!(other.spec().entity, TypeId::of::<u16>());
        assert_eq!(other.spec().criteria, query.spec().criteria);
        assert_eq!(other.spec().paging, Paging::Top(3));
    }

    #[test]
    fn test_include_paths_share_prefixes() {
        let tree = IncludeTree::parse(&[
            "Customer.Region".to_string(),
            "Customer".to_string(),
            "Lines".to_string(),
        ])
        .unwrap();
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].0, "Customer");
        assert_eq!(tree.children[0].1.children.len(), 1);
        assert_eq!(tree.children[1].0, "Lines");
    }

    #[test]
    fn test_include_rejects_empty_segment() {
        let err = IncludeTree::parse(&["Customer..Region".to_string()]).unwrap_err();
        assert_eq!(err.entity_kind(), Some(EntityErrorKind::InvalidQuery));
    }
}

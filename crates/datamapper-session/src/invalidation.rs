//! Reference invalidation graph.
//!
//! Edges run from a referenced type to the types that reference it, so a
//! write to the referenced type can find every type whose cached snapshots
//! may embed stale state. The graph holds type ids only, never entities.

use std::any::TypeId;
use std::collections::{HashMap, HashSet, VecDeque};

use datamapper_core::MetadataRegistry;

#[derive(Debug, Clone, Default)]
pub struct InvalidationGraph {
    referencers: HashMap<TypeId, Vec<TypeId>>,
}

impl InvalidationGraph {
    /// Build the back-reference map from every reference and many-to-many descriptor.
    ///
    /// A reference to a base type also makes its derived types point at the referencer.
    pub fn build(registry: &MetadataRegistry) -> Self {
        let mut graph = Self::default();
        for meta in registry.types() {
            let targets = meta
                .references()
                .iter()
                .map(|r| r.target)
                .chain(meta.many_to_many().iter().map(|m| m.target));
            for target in targets {
                graph.add_edge(target, meta.type_id());
                for derived in registry.derived_classes(target) {
                    graph.add_edge(derived.type_id(), meta.type_id());
                }
            }
        }
        tracing::debug!(edges = graph.edge_count(), "built invalidation graph");
        graph
    }

    fn add_edge(&mut self, referenced: TypeId, referencer: TypeId) {
        let list = self.referencers.entry(referenced).or_default();
        if !list.contains(&referencer) {
            list.push(referencer);
        }
    }

    /// Types that directly reference `type_id`.
    pub fn referencers(&self, type_id: TypeId) -> &[TypeId] {
        self.referencers.get(&type_id).map_or(&[], Vec::as_slice)
    }

    /// Every type transitively referencing `type_id`, nearest first, excluding `type_id`.
    pub fn reachable(&self, type_id: TypeId) -> Vec<TypeId> {
        let mut seen = HashSet::from([type_id]);
        let mut queue = VecDeque::from([type_id]);
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            for &next in self.referencers(current) {
                if seen.insert(next) {
                    out.push(next);
                    queue.push_back(next);
                }
            }
        }
        out
    }

    pub fn edge_count(&self) -> usize {
        self.referencers.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamapper_core::{
        Entity, EntityMetadata, Mapped, PropertyDescriptor, ReferenceDescriptor, Value, assign,
    };

    macro_rules! node {
        ($name:ident, $table:literal $(, $fk:literal -> $target:ident)?) => {
            #[derive(Debug, Clone, Default)]
            struct $name {
                id: i64,
                fk: Option<i64>,
            }

            impl Entity for $name {
                fn id(&self) -> Value {
                    Value::BigInt(self.id)
                }
            }

            impl Mapped for $name {
                fn metadata() -> EntityMetadata {
                    EntityMetadata::builder::<Self>(stringify!($name), $table)
                        .identity(PropertyDescriptor::new::<Self, _, _>(
                            "Id", "id", |e| e.id.into(), |e, v| assign(&mut e.id, v),
                        ))
                        .property(PropertyDescriptor::new::<Self, _, _>(
                            "Fk", "fk", |e| e.fk.into(), |e, v| assign(&mut e.fk, v),
                        ))
                        $(.reference(ReferenceDescriptor::new::<Self, $target, _, _>(
                            $fk, "Fk", |_| None, |_, _| {},
                        )))?
                        .build()
                        .unwrap()
                }
            }
        };
    }

    node!(Customer, "customers");
    node!(Invoice, "invoices", "Customer" -> Customer);
    node!(Line, "lines", "Invoice" -> Invoice);

    #[test]
    fn test_reachable_follows_back_references() {
        let registry = MetadataRegistry::builder()
            .register::<Customer>()
            .register::<Invoice>()
            .register::<Line>()
            .build()
            .unwrap();
        let graph = InvalidationGraph::build(&registry);

        assert_eq!(
            graph.referencers(TypeId::of::<Customer>()),
            &[TypeId::of::<Invoice>()]
        );
        assert_eq!(
            graph.reachable(TypeId::of::<Customer>()),
            vec![TypeId::of::<Invoice>(), TypeId::of::<Line>()]
        );
        assert!(graph.reachable(TypeId::of::<Line>()).is_empty());
        assert_eq!(graph.edge_count(), 2);
    }
}

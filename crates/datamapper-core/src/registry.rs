//! Process-wide metadata registry.
//!
//! Built once at startup from every mapped type, then frozen and shared as
//! `Arc<MetadataRegistry>`. Inheritance is an explicit list of type ids per
//! record (`base_chain`, root first, and `derived`), resolved here rather
//! than through language-level inheritance.

use std::any::TypeId;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::entity::Mapped;
use crate::error::{EntityErrorKind, Error, Result};
use crate::metadata::{Discriminator, EntityMetadata};

/// Immutable lookup of [`EntityMetadata`] by type.
#[derive(Debug, Default)]
pub struct MetadataRegistry {
    by_type: HashMap<TypeId, Arc<EntityMetadata>>,
    by_name: HashMap<String, TypeId>,
}

impl MetadataRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, type_id: TypeId) -> Option<&Arc<EntityMetadata>> {
        self.by_type.get(&type_id)
    }

    /// Look up a type, failing with `UnknownEntityType`.
    pub fn require(&self, type_id: TypeId) -> Result<&Arc<EntityMetadata>> {
        self.by_type.get(&type_id).ok_or_else(|| {
            Error::entity(
                EntityErrorKind::UnknownEntityType,
                format!("{type_id:?}"),
                "type is not registered",
            )
        })
    }

    pub fn of<T: 'static>(&self) -> Result<&Arc<EntityMetadata>> {
        self.require(TypeId::of::<T>())
    }

    pub fn by_name(&self, type_name: &str) -> Option<&Arc<EntityMetadata>> {
        self.by_name.get(type_name).and_then(|t| self.by_type.get(t))
    }

    pub fn types(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.by_type.values()
    }

    /// Base-class records, root first, ending with the direct base.
    pub fn base_classes_in_order(&self, type_id: TypeId) -> Vec<Arc<EntityMetadata>> {
        self.get(type_id)
            .map(|meta| self.resolve(meta.base_chain()))
            .unwrap_or_default()
    }

    /// Every transitive derived-class record, nearest first.
    pub fn derived_classes(&self, type_id: TypeId) -> Vec<Arc<EntityMetadata>> {
        self.get(type_id)
            .map(|meta| self.resolve(meta.derived()))
            .unwrap_or_default()
    }

    /// The type itself (unless abstract) followed by its concrete derived types.
    ///
    /// These are the types whose storage answers a query issued against `type_id`.
    pub fn concrete_family(&self, type_id: TypeId) -> Result<Vec<Arc<EntityMetadata>>> {
        let meta = self.require(type_id)?;
        let mut family = Vec::new();
        if !meta.is_abstract() {
            family.push(Arc::clone(meta));
        }
        family.extend(
            self.derived_classes(type_id)
                .into_iter()
                .filter(|m| !m.is_abstract()),
        );
        Ok(family)
    }

    /// The root of a type's hierarchy (the type itself when it has no base).
    pub fn root_of(&self, type_id: TypeId) -> Option<&Arc<EntityMetadata>> {
        let meta = self.get(type_id)?;
        match meta.base_chain().first() {
            Some(root) => self.get(*root),
            None => Some(meta),
        }
    }

    /// Find the concrete type within `type_id`'s family that owns a discriminator value.
    pub fn resolve_discriminator(
        &self,
        type_id: TypeId,
        value: &str,
    ) -> Option<&Arc<EntityMetadata>> {
        let meta = self.get(type_id)?;
        std::iter::once(&meta.type_id())
            .chain(meta.derived())
            .filter_map(|t| self.get(*t))
            .find(|m| !m.is_abstract() && m.discriminator().is_some_and(|d| d.value == value))
    }

    fn resolve(&self, ids: &[TypeId]) -> Vec<Arc<EntityMetadata>> {
        ids.iter()
            .filter_map(|t| self.by_type.get(t).cloned())
            .collect()
    }
}

/// Collects metadata records, then links and validates them in one pass.
#[derive(Default)]
pub struct RegistryBuilder {
    records: Vec<EntityMetadata>,
}

impl RegistryBuilder {
    /// Register a concrete mapped type.
    pub fn register<T: Mapped>(mut self) -> Self {
        self.records.push(T::metadata());
        self
    }

    /// Register a prebuilt record (abstract types, or hand-built metadata).
    pub fn register_metadata(mut self, metadata: EntityMetadata) -> Self {
        self.records.push(metadata);
        self
    }

    /// Link inheritance, fill discriminators and freeze the registry.
    pub fn build(self) -> Result<Arc<MetadataRegistry>> {
        let mut records: HashMap<TypeId, EntityMetadata> = HashMap::new();
        let mut by_name = HashMap::new();
        for meta in self.records {
            if by_name.insert(meta.type_name().to_string(), meta.type_id()).is_some() {
                return Err(invalid(meta.type_name(), "type registered twice"));
            }
            records.insert(meta.type_id(), meta);
        }

        let ids: Vec<TypeId> = records.keys().copied().collect();
        let mut chains: HashMap<TypeId, Vec<TypeId>> = HashMap::new();
        for id in &ids {
            let mut chain = Vec::new();
            let mut cursor = records[id].base();
            while let Some(base) = cursor {
                if base == *id || chain.contains(&base) {
                    return Err(invalid(records[id].type_name(), "inheritance cycle"));
                }
                let Some(base_meta) = records.get(&base) else {
                    return Err(invalid(records[id].type_name(), "base type is not registered"));
                };
                chain.push(base);
                cursor = base_meta.base();
            }
            chain.reverse();
            chains.insert(*id, chain);
        }

        // Derived lists in breadth-first order, so nearer descendants come first.
        let mut children: HashMap<TypeId, Vec<TypeId>> = HashMap::new();
        for id in &ids {
            if let Some(base) = records[id].base() {
                children.entry(base).or_default().push(*id);
            }
        }
        for kids in children.values_mut() {
            kids.sort_by(|a, b| records[a].type_name().cmp(records[b].type_name()));
        }
        let mut derived: HashMap<TypeId, Vec<TypeId>> = HashMap::new();
        for id in &ids {
            let mut out = Vec::new();
            let mut queue: VecDeque<TypeId> = children.get(id).cloned().unwrap_or_default().into();
            while let Some(next) = queue.pop_front() {
                out.push(next);
                if let Some(kids) = children.get(&next) {
                    queue.extend(kids.iter().copied());
                }
            }
            derived.insert(*id, out);
        }

        for id in &ids {
            check_inherited_properties(&records, *id, &chains[id])?;
        }
        let discriminators = resolve_discriminators(&records, &chains)?;

        let mut by_type = HashMap::new();
        for (id, mut meta) in records {
            meta.base_chain = chains.remove(&id).unwrap_or_default();
            meta.derived = derived.remove(&id).unwrap_or_default();
            if let Some(d) = discriminators.get(&id) {
                meta.discriminator = Some(d.clone());
            }
            by_type.insert(id, Arc::new(meta));
        }

        tracing::debug!(types = by_type.len(), "metadata registry built");
        Ok(Arc::new(MetadataRegistry { by_type, by_name }))
    }
}

fn invalid(type_name: &str, message: &str) -> Error {
    Error::entity(EntityErrorKind::InvalidQuery, type_name, message)
}

/// A derived type must map every property its concrete bases map, so a
/// criterion written against the base resolves on every derived provider.
fn check_inherited_properties(
    records: &HashMap<TypeId, EntityMetadata>,
    id: TypeId,
    chain: &[TypeId],
) -> Result<()> {
    let meta = &records[&id];
    if meta.is_abstract() {
        return Ok(());
    }
    for base in chain {
        for prop in records[base].properties() {
            if meta.property(&prop.name).is_none() {
                return Err(invalid(
                    meta.type_name(),
                    &format!(
                        "does not map inherited property '{}' of {}",
                        prop.name,
                        records[base].type_name()
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Give every member of a discriminated hierarchy its owner's column and a unique value.
fn resolve_discriminators(
    records: &HashMap<TypeId, EntityMetadata>,
    chains: &HashMap<TypeId, Vec<TypeId>>,
) -> Result<HashMap<TypeId, Discriminator>> {
    let mut out = HashMap::new();
    let mut seen: HashMap<(TypeId, String), TypeId> = HashMap::new();
    for (id, meta) in records {
        // The topmost type declaring a column owns the discriminated hierarchy.
        let lineage = chains[id].iter().copied().chain(std::iter::once(*id));
        let Some((root, column)) = lineage.into_iter().find_map(|t| {
            records[&t]
                .discriminator()
                .and_then(|d| d.column.clone())
                .map(|c| (t, c))
        }) else {
            continue;
        };
        let value = meta
            .discriminator()
            .map_or_else(|| meta.type_name().to_string(), |d| d.value.clone());
        if !meta.is_abstract() {
            if let Some(other) = seen.insert((root, value.clone()), *id) {
                return Err(invalid(
                    meta.type_name(),
                    &format!(
                        "discriminator value '{}' already used by {}",
                        value,
                        records[&other].type_name()
                    ),
                ));
            }
        }
        out.insert(
            *id,
            Discriminator {
                column: Some(column),
                value,
            },
        );
    }
    Ok(out)
}

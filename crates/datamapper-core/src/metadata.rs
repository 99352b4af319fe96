//! Per-type storage mapping.
//!
//! An [`EntityMetadata`] record describes where one entity type lives
//! (table, schema, alias), which property is its identity, and how each
//! mapped property is read from and written to the entity. Accessors are
//! typed closures captured at build time; nothing here uses runtime
//! reflection.
//!
//! Records are immutable once built and are shared as `Arc` through the
//! [`MetadataRegistry`](crate::registry::MetadataRegistry).

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use crate::entity::{Entity, EntityRef, Mapped};
use crate::error::{EntityErrorKind, Error, Result};
use crate::row::Row;
use crate::value::Value;

type Getter = Arc<dyn Fn(&dyn Entity) -> Value + Send + Sync>;
type Setter = Arc<dyn Fn(&mut dyn Entity, Value) -> Result<()> + Send + Sync>;
type RefGetter = Arc<dyn Fn(&dyn Entity) -> Option<EntityRef> + Send + Sync>;
type RefSetter = Arc<dyn Fn(&mut dyn Entity, Option<EntityRef>) + Send + Sync>;
type Factory = Arc<dyn Fn() -> Box<dyn Entity> + Send + Sync>;

/// Flags carried by a property descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropertyFlags {
    /// Storage assigns the value on insert (identity columns only).
    pub auto_number: bool,
    /// Declared by the entity author, as opposed to framework bookkeeping.
    pub user_defined: bool,
    /// Identity supplied by the application rather than storage.
    pub custom_pk: bool,
    /// Boolean "row is deleted" marker used for soft deletes.
    pub soft_deleted: bool,
    /// Integer row version used for optimistic concurrency.
    pub row_version: bool,
}

/// Maps one property to one storage column, with typed accessors.
#[derive(Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    pub column: String,
    pub flags: PropertyFlags,
    getter: Getter,
    setter: Setter,
}

impl PropertyDescriptor {
    /// Build a descriptor from typed accessors for entity type `T`.
    pub fn new<T, G, S>(name: &str, column: &str, get: G, set: S) -> Self
    where
        T: Entity,
        G: Fn(&T) -> Value + Send + Sync + 'static,
        S: Fn(&mut T, Value) -> Result<()> + Send + Sync + 'static,
    {
        let owner = std::any::type_name::<T>();
        let getter: Getter = Arc::new(move |entity: &dyn Entity| match entity.downcast_ref::<T>() {
            Some(e) => get(e),
            None => wrong_type(owner, entity),
        });
        let setter: Setter = Arc::new(move |entity: &mut dyn Entity, value: Value| {
            match entity.downcast_mut::<T>() {
                Some(e) => set(e, value),
                None => wrong_type(owner, &*entity),
            }
        });
        Self {
            name: name.to_string(),
            column: column.to_string(),
            flags: PropertyFlags {
                user_defined: true,
                ..PropertyFlags::default()
            },
            getter,
            setter,
        }
    }

    /// Read this property from an entity.
    ///
    /// # Panics
    ///
    /// Panics if `entity` is not the type the descriptor was built for.
    pub fn get(&self, entity: &dyn Entity) -> Value {
        (self.getter)(entity)
    }

    /// Write this property on an entity.
    pub fn set(&self, entity: &mut dyn Entity, value: Value) -> Result<()> {
        (self.setter)(entity, value)
    }
}

fn wrong_type(owner: &str, entity: &dyn Entity) -> ! {
    panic!("property accessor for {owner} applied to {entity:?}")
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("name", &self.name)
            .field("column", &self.column)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

/// A many-to-one association that `include` can eagerly load.
#[derive(Clone)]
pub struct ReferenceDescriptor {
    /// Association path segment, e.g. `"Customer"`.
    pub property: String,
    /// The referenced entity type.
    pub target: TypeId,
    /// Property on the owning type holding the target's identity.
    pub foreign_key: String,
    getter: RefGetter,
    setter: RefSetter,
}

impl ReferenceDescriptor {
    pub fn new<T, U, G, S>(property: &str, foreign_key: &str, get: G, set: S) -> Self
    where
        T: Entity,
        U: Entity,
        G: Fn(&T) -> Option<EntityRef> + Send + Sync + 'static,
        S: Fn(&mut T, Option<EntityRef>) + Send + Sync + 'static,
    {
        let owner = std::any::type_name::<T>();
        Self {
            property: property.to_string(),
            target: TypeId::of::<U>(),
            foreign_key: foreign_key.to_string(),
            getter: Arc::new(move |entity: &dyn Entity| match entity.downcast_ref::<T>() {
                Some(e) => get(e),
                None => wrong_type(owner, entity),
            }),
            setter: Arc::new(move |entity: &mut dyn Entity, target| {
                if let Some(e) = entity.downcast_mut::<T>() {
                    set(e, target);
                }
            }),
        }
    }

    /// The currently attached target, if any.
    pub fn get(&self, entity: &dyn Entity) -> Option<EntityRef> {
        (self.getter)(entity)
    }

    /// Attach (or clear) the loaded target.
    pub fn attach(&self, entity: &mut dyn Entity, target: Option<EntityRef>) {
        (self.setter)(entity, target);
    }
}

impl fmt::Debug for ReferenceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceDescriptor")
            .field("property", &self.property)
            .field("target", &self.target)
            .field("foreign_key", &self.foreign_key)
            .finish_non_exhaustive()
    }
}

/// A many-to-many association resolved through a link table.
#[derive(Debug, Clone)]
pub struct ManyToManyDescriptor {
    pub property: String,
    pub target: TypeId,
    pub link_table: String,
    /// Link column holding this type's identity.
    pub local_column: String,
    /// Link column holding the target's identity.
    pub remote_column: String,
}

impl ManyToManyDescriptor {
    pub fn new<U: Entity>(
        property: &str,
        link_table: &str,
        local_column: &str,
        remote_column: &str,
    ) -> Self {
        Self {
            property: property.to_string(),
            target: TypeId::of::<U>(),
            link_table: link_table.to_string(),
            local_column: local_column.to_string(),
            remote_column: remote_column.to_string(),
        }
    }
}

/// Table-per-hierarchy discriminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discriminator {
    /// Column holding the discriminator; `None` means "inherit from the root".
    pub column: Option<String>,
    /// This type's discriminator value.
    pub value: String,
}

/// Static description of one entity type's storage mapping.
#[derive(Clone)]
pub struct EntityMetadata {
    type_id: TypeId,
    type_name: String,
    table: String,
    schema: Option<String>,
    alias: String,
    identity: usize,
    properties: Vec<PropertyDescriptor>,
    base: Option<TypeId>,
    is_abstract: bool,
    cacheable: bool,
    pub(crate) discriminator: Option<Discriminator>,
    references: Vec<ReferenceDescriptor>,
    many_to_many: Vec<ManyToManyDescriptor>,
    factory: Option<Factory>,
    // Filled in by the registry.
    pub(crate) base_chain: Vec<TypeId>,
    pub(crate) derived: Vec<TypeId>,
}

impl EntityMetadata {
    /// Start describing concrete entity type `T` stored in `table`.
    pub fn builder<T: Mapped>(type_name: &str, table: &str) -> MetadataBuilder {
        MetadataBuilder::new(TypeId::of::<T>(), type_name, table).factory(|| {
            Box::new(T::default()) as Box<dyn Entity>
        })
    }

    /// Start describing an abstract type (no instances of its own).
    ///
    /// `M` is any marker type; it only provides the `TypeId`.
    pub fn abstract_builder<M: 'static>(type_name: &str) -> MetadataBuilder {
        let mut builder = MetadataBuilder::new(TypeId::of::<M>(), type_name, "");
        builder.meta.is_abstract = true;
        builder
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Whether the type is cacheable before configuration overrides apply.
    pub fn cacheable(&self) -> bool {
        self.cacheable
    }

    /// The identity property.
    ///
    /// # Panics
    ///
    /// Panics for abstract types, which map no properties.
    pub fn identity(&self) -> &PropertyDescriptor {
        &self.properties[self.identity]
    }

    /// All mapped properties, identity first, in declaration order.
    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Look up a property, failing with `UnknownProperty`.
    pub fn require_property(&self, name: &str) -> Result<&PropertyDescriptor> {
        self.property(name).ok_or_else(|| {
            Error::entity(
                EntityErrorKind::UnknownProperty,
                &self.type_name,
                format!("no mapped property '{name}'"),
            )
        })
    }

    pub fn soft_delete(&self) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.flags.soft_deleted)
    }

    pub fn row_version(&self) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.flags.row_version)
    }

    pub fn discriminator(&self) -> Option<&Discriminator> {
        self.discriminator.as_ref()
    }

    /// The direct base type, if any.
    pub fn base(&self) -> Option<TypeId> {
        self.base
    }

    /// Base types, root first, ending with the direct base.
    pub fn base_chain(&self) -> &[TypeId] {
        &self.base_chain
    }

    /// All transitive derived types, nearest first.
    pub fn derived(&self) -> &[TypeId] {
        &self.derived
    }

    pub fn references(&self) -> &[ReferenceDescriptor] {
        &self.references
    }

    pub fn reference(&self, property: &str) -> Option<&ReferenceDescriptor> {
        self.references.iter().find(|r| r.property == property)
    }

    pub fn many_to_many(&self) -> &[ManyToManyDescriptor] {
        &self.many_to_many
    }

    /// Columns written on insert: everything except an auto-numbered identity.
    pub fn insert_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.iter().filter(|p| !p.flags.auto_number)
    }

    /// Columns written on update: everything except the identity and row version.
    pub fn update_properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        let identity = self.identity;
        self.properties
            .iter()
            .enumerate()
            .filter(move |(i, p)| *i != identity && !p.flags.row_version)
            .map(|(_, p)| p)
    }

    /// Create a blank instance of this type.
    pub fn instantiate(&self) -> Result<Box<dyn Entity>> {
        match &self.factory {
            Some(factory) => Ok(factory()),
            None => Err(Error::entity(
                EntityErrorKind::UnsupportedPolymorphicQuery,
                &self.type_name,
                "abstract type cannot be instantiated",
            )),
        }
    }

    /// Materialize a storage row into a new entity using the property descriptors.
    ///
    /// Columns absent from the row leave the property at its default.
    pub fn materialize(&self, row: &Row) -> Result<Box<dyn Entity>> {
        let mut entity = self.instantiate()?;
        for prop in &self.properties {
            if let Some(value) = row.get_by_name(&prop.column) {
                prop.set(entity.as_mut(), value.clone())?;
            }
        }
        Ok(entity)
    }
}

impl fmt::Debug for EntityMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("type_name", &self.type_name)
            .field("table", &self.table)
            .field("schema", &self.schema)
            .field("alias", &self.alias)
            .field("properties", &self.properties)
            .field("is_abstract", &self.is_abstract)
            .field("discriminator", &self.discriminator)
            .finish_non_exhaustive()
    }
}

/// Builder for [`EntityMetadata`].
///
/// The first property added with [`identity`](Self::identity) becomes the
/// identity; every other property keeps declaration order.
pub struct MetadataBuilder {
    meta: EntityMetadata,
    identity_set: bool,
}

impl MetadataBuilder {
    fn new(type_id: TypeId, type_name: &str, table: &str) -> Self {
        Self {
            meta: EntityMetadata {
                type_id,
                type_name: type_name.to_string(),
                table: table.to_string(),
                schema: None,
                alias: table.chars().next().map_or_else(|| "t".to_string(), |c| c.to_string()),
                identity: 0,
                properties: Vec::new(),
                base: None,
                is_abstract: false,
                cacheable: true,
                discriminator: None,
                references: Vec::new(),
                many_to_many: Vec::new(),
                factory: None,
                base_chain: Vec::new(),
                derived: Vec::new(),
            },
            identity_set: false,
        }
    }

    fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Entity> + Send + Sync + 'static,
    {
        self.meta.factory = Some(Arc::new(factory));
        self
    }

    pub fn schema(mut self, schema: &str) -> Self {
        self.meta.schema = Some(schema.to_string());
        self
    }

    pub fn alias(mut self, alias: &str) -> Self {
        self.meta.alias = alias.to_string();
        self
    }

    /// Add the identity property.
    pub fn identity(mut self, descriptor: PropertyDescriptor) -> Self {
        self.meta.identity = 0;
        self.meta.properties.insert(0, descriptor);
        self.identity_set = true;
        self
    }

    /// Mark the identity as storage-assigned.
    pub fn auto_number(mut self) -> Self {
        if self.identity_set {
            self.meta.properties[0].flags.auto_number = true;
        }
        self
    }

    /// Mark the identity as supplied by the application.
    pub fn custom_pk(mut self) -> Self {
        if self.identity_set {
            self.meta.properties[0].flags.custom_pk = true;
        }
        self
    }

    pub fn property(mut self, descriptor: PropertyDescriptor) -> Self {
        self.meta.properties.push(descriptor);
        self
    }

    /// Add the soft-delete marker column.
    pub fn soft_delete(mut self, mut descriptor: PropertyDescriptor) -> Self {
        descriptor.flags.soft_deleted = true;
        descriptor.flags.user_defined = false;
        self.meta.properties.push(descriptor);
        self
    }

    /// Add the integer row-version column.
    pub fn row_version(mut self, mut descriptor: PropertyDescriptor) -> Self {
        descriptor.flags.row_version = true;
        descriptor.flags.user_defined = false;
        self.meta.properties.push(descriptor);
        self
    }

    /// Declare the direct base type.
    pub fn base<B: 'static>(mut self) -> Self {
        self.meta.base = Some(TypeId::of::<B>());
        self
    }

    /// Declare the discriminator column (root of a table-per-hierarchy family).
    pub fn discriminator_column(mut self, column: &str) -> Self {
        let value = self
            .meta
            .discriminator
            .take()
            .map_or_else(|| self.meta.type_name.clone(), |d| d.value);
        self.meta.discriminator = Some(Discriminator {
            column: Some(column.to_string()),
            value,
        });
        self
    }

    /// Override this type's discriminator value (defaults to the type name).
    pub fn discriminator_value(mut self, value: &str) -> Self {
        let column = self.meta.discriminator.take().and_then(|d| d.column);
        self.meta.discriminator = Some(Discriminator {
            column,
            value: value.to_string(),
        });
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.meta.cacheable = cacheable;
        self
    }

    pub fn reference(mut self, descriptor: ReferenceDescriptor) -> Self {
        self.meta.references.push(descriptor);
        self
    }

    pub fn many_to_many(mut self, descriptor: ManyToManyDescriptor) -> Self {
        self.meta.many_to_many.push(descriptor);
        self
    }

    /// Finish the record, checking its local invariants.
    pub fn build(mut self) -> Result<EntityMetadata> {
        let name = self.meta.type_name.clone();
        let invalid = |message: String| {
            Error::entity(EntityErrorKind::InvalidQuery, name.clone(), message)
        };
        if self.meta.is_abstract {
            if !self.meta.properties.is_empty() {
                return Err(invalid("abstract type cannot map properties".to_string()));
            }
            return Ok(self.meta);
        }
        if !self.identity_set {
            return Err(invalid("no identity property declared".to_string()));
        }
        if self.meta.table.is_empty() {
            return Err(invalid("concrete type needs a table".to_string()));
        }
        for (i, prop) in self.meta.properties.iter().enumerate() {
            if self.meta.properties[..i].iter().any(|p| p.name == prop.name) {
                return Err(invalid(format!("property '{}' declared twice", prop.name)));
            }
            if self.meta.properties[..i].iter().any(|p| p.column == prop.column) {
                return Err(invalid(format!("column '{}' mapped twice", prop.column)));
            }
        }
        if self.meta.properties.iter().filter(|p| p.flags.row_version).count() > 1 {
            return Err(invalid("more than one row-version property".to_string()));
        }
        for reference in &self.meta.references {
            if self.meta.property(&reference.foreign_key).is_none() {
                return Err(invalid(format!(
                    "reference '{}' names unknown foreign key '{}'",
                    reference.property, reference.foreign_key
                )));
            }
        }
        self.meta.properties[0].flags.user_defined = false;
        Ok(self.meta)
    }
}

/// Convenience for descriptor closures: assign a converted value or fail with a type error.
///
/// ```rust,ignore
/// PropertyDescriptor::new::<Invoice, _, _>("Number", "number",
///     |e| e.number.clone().into(),
///     |e, v| assign(&mut e.number, v));
/// ```
pub fn assign<T>(slot: &mut T, value: Value) -> Result<()>
where
    T: TryFrom<Value, Error = Error>,
{
    *slot = T::try_from(value)?;
    Ok(())
}

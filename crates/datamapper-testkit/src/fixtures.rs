//! Mapped entity types shared by the workspace's tests.
//!
//! - `Invoice`: auto-numbered, row-versioned, references a `Customer` and
//!   links to `Tag`s through `invoice_tags`.
//! - `Person` ← `Customer`, `Employee`: one table per concrete type.
//! - `Animal` (abstract) ← `Dog`, `Cat`: one shared `animals` table with a
//!   `kind` discriminator.
//! - `Region`: application-assigned text key, referenced by `Customer`.

use std::sync::Arc;

use datamapper_core::{
    Entity, EntityMetadata, EntityRef, ManyToManyDescriptor, Mapped, MetadataRegistry,
    PropertyDescriptor, ReferenceDescriptor, ValidationError, Value, assign,
};

/// A registry holding every fixture type.
pub fn registry() -> Arc<MetadataRegistry> {
    MetadataRegistry::builder()
        .register::<Invoice>()
        .register::<Person>()
        .register::<Customer>()
        .register::<Employee>()
        .register::<Region>()
        .register::<Tag>()
        .register_metadata(Animal::metadata())
        .register::<Dog>()
        .register::<Cat>()
        .build()
        .expect("fixture registry")
}

#[derive(Debug, Clone, Default)]
pub struct Invoice {
    pub id: Option<i64>,
    pub number: String,
    pub total: f64,
    pub customer_id: Option<i64>,
    pub version: i64,
    pub customer: Option<EntityRef>,
}

impl Entity for Invoice {
    fn id(&self) -> Value {
        self.id.into()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = ValidationError::new();
        if self.number.trim().is_empty() {
            errors.add_required("Number");
        }
        if self.total < 0.0 {
            errors.add("Total", "must not be negative");
        }
        errors.into_result()
    }
}

impl Mapped for Invoice {
    fn metadata() -> EntityMetadata {
        EntityMetadata::builder::<Self>("Invoice", "invoices")
            .identity(PropertyDescriptor::new::<Self, _, _>(
                "Id",
                "id",
                |e| e.id.into(),
                |e, v| assign(&mut e.id, v),
            ))
            .auto_number()
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Number",
                "number",
                |e| e.number.clone().into(),
                |e, v| assign(&mut e.number, v),
            ))
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Total",
                "total",
                |e| e.total.into(),
                |e, v| assign(&mut e.total, v),
            ))
            .property(PropertyDescriptor::new::<Self, _, _>(
                "CustomerId",
                "customer_id",
                |e| e.customer_id.into(),
                |e, v| assign(&mut e.customer_id, v),
            ))
            .row_version(PropertyDescriptor::new::<Self, _, _>(
                "Version",
                "version",
                |e| e.version.into(),
                |e, v| assign(&mut e.version, v),
            ))
            .reference(ReferenceDescriptor::new::<Self, Customer, _, _>(
                "Customer",
                "CustomerId",
                |e| e.customer.clone(),
                |e, c| e.customer = c,
            ))
            .many_to_many(ManyToManyDescriptor::new::<Tag>(
                "Tags",
                "invoice_tags",
                "invoice_id",
                "tag_id",
            ))
            .build()
            .expect("Invoice metadata")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Person {
    pub id: Option<i64>,
    pub name: String,
}

impl Entity for Person {
    fn id(&self) -> Value {
        self.id.into()
    }
}

impl Mapped for Person {
    fn metadata() -> EntityMetadata {
        EntityMetadata::builder::<Self>("Person", "persons")
            .identity(PropertyDescriptor::new::<Self, _, _>(
                "Id",
                "id",
                |e| e.id.into(),
                |e, v| assign(&mut e.id, v),
            ))
            .auto_number()
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Name",
                "name",
                |e| e.name.clone().into(),
                |e, v| assign(&mut e.name, v),
            ))
            .build()
            .expect("Person metadata")
    }
}

/// A `Person` stored in `customers`, soft-deleted rather than removed.
#[derive(Debug, Clone, Default)]
pub struct Customer {
    pub id: Option<i64>,
    pub name: String,
    pub region_id: Option<String>,
    pub deleted: bool,
    pub region: Option<EntityRef>,
}

impl Entity for Customer {
    fn id(&self) -> Value {
        self.id.into()
    }
}

impl Mapped for Customer {
    fn metadata() -> EntityMetadata {
        EntityMetadata::builder::<Self>("Customer", "customers")
            .base::<Person>()
            .identity(PropertyDescriptor::new::<Self, _, _>(
                "Id",
                "id",
                |e| e.id.into(),
                |e, v| assign(&mut e.id, v),
            ))
            .auto_number()
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Name",
                "name",
                |e| e.name.clone().into(),
                |e, v| assign(&mut e.name, v),
            ))
            .property(PropertyDescriptor::new::<Self, _, _>(
                "RegionId",
                "region_id",
                |e| e.region_id.clone().into(),
                |e, v| assign(&mut e.region_id, v),
            ))
            .soft_delete(PropertyDescriptor::new::<Self, _, _>(
                "Deleted",
                "deleted",
                |e| e.deleted.into(),
                |e, v| assign(&mut e.deleted, v),
            ))
            .reference(ReferenceDescriptor::new::<Self, Region, _, _>(
                "Region",
                "RegionId",
                |e| e.region.clone(),
                |e, r| e.region = r,
            ))
            .build()
            .expect("Customer metadata")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Employee {
    pub id: Option<i64>,
    pub name: String,
    pub salary: f64,
}

impl Entity for Employee {
    fn id(&self) -> Value {
        self.id.into()
    }
}

impl Mapped for Employee {
    fn metadata() -> EntityMetadata {
        EntityMetadata::builder::<Self>("Employee", "employees")
            .base::<Person>()
            .identity(PropertyDescriptor::new::<Self, _, _>(
                "Id",
                "id",
                |e| e.id.into(),
                |e, v| assign(&mut e.id, v),
            ))
            .auto_number()
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Name",
                "name",
                |e| e.name.clone().into(),
                |e, v| assign(&mut e.name, v),
            ))
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Salary",
                "salary",
                |e| e.salary.into(),
                |e, v| assign(&mut e.salary, v),
            ))
            .build()
            .expect("Employee metadata")
    }
}

/// Reference data keyed by an application-assigned code.
///
/// Regions are never inserted through a provider; tests seed them with
/// [`MemoryDatabase::insert_row`](crate::MemoryDatabase::insert_row).
#[derive(Debug, Clone, Default)]
pub struct Region {
    pub id: String,
    pub name: String,
}

impl Entity for Region {
    fn id(&self) -> Value {
        Value::Text(self.id.clone())
    }

    fn is_new(&self) -> bool {
        false
    }
}

impl Mapped for Region {
    fn metadata() -> EntityMetadata {
        EntityMetadata::builder::<Self>("Region", "regions")
            .identity(PropertyDescriptor::new::<Self, _, _>(
                "Id",
                "id",
                |e| e.id.clone().into(),
                |e, v| assign(&mut e.id, v),
            ))
            .custom_pk()
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Name",
                "name",
                |e| e.name.clone().into(),
                |e, v| assign(&mut e.name, v),
            ))
            .build()
            .expect("Region metadata")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tag {
    pub id: Option<i64>,
    pub label: String,
}

impl Entity for Tag {
    fn id(&self) -> Value {
        self.id.into()
    }
}

impl Mapped for Tag {
    fn metadata() -> EntityMetadata {
        EntityMetadata::builder::<Self>("Tag", "tags")
            .identity(PropertyDescriptor::new::<Self, _, _>(
                "Id",
                "id",
                |e| e.id.into(),
                |e, v| assign(&mut e.id, v),
            ))
            .auto_number()
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Label",
                "label",
                |e| e.label.clone().into(),
                |e, v| assign(&mut e.label, v),
            ))
            .build()
            .expect("Tag metadata")
    }
}

/// Abstract root of the `animals` hierarchy. Only a type marker.
#[derive(Debug)]
pub struct Animal;

impl Animal {
    pub fn metadata() -> EntityMetadata {
        EntityMetadata::abstract_builder::<Self>("Animal")
            .discriminator_column("kind")
            .build()
            .expect("Animal metadata")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Dog {
    pub id: Option<i64>,
    pub name: String,
    pub barks: bool,
}

impl Entity for Dog {
    fn id(&self) -> Value {
        self.id.into()
    }
}

impl Mapped for Dog {
    fn metadata() -> EntityMetadata {
        EntityMetadata::builder::<Self>("Dog", "animals")
            .base::<Animal>()
            .discriminator_value("dog")
            .identity(PropertyDescriptor::new::<Self, _, _>(
                "Id",
                "id",
                |e| e.id.into(),
                |e, v| assign(&mut e.id, v),
            ))
            .auto_number()
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Name",
                "name",
                |e| e.name.clone().into(),
                |e, v| assign(&mut e.name, v),
            ))
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Barks",
                "barks",
                |e| e.barks.into(),
                |e, v| assign(&mut e.barks, v),
            ))
            .build()
            .expect("Dog metadata")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Cat {
    pub id: Option<i64>,
    pub name: String,
    pub lives: i64,
}

impl Entity for Cat {
    fn id(&self) -> Value {
        self.id.into()
    }
}

impl Mapped for Cat {
    fn metadata() -> EntityMetadata {
        EntityMetadata::builder::<Self>("Cat", "animals")
            .base::<Animal>()
            .discriminator_value("cat")
            .identity(PropertyDescriptor::new::<Self, _, _>(
                "Id",
                "id",
                |e| e.id.into(),
                |e, v| assign(&mut e.id, v),
            ))
            .auto_number()
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Name",
                "name",
                |e| e.name.clone().into(),
                |e, v| assign(&mut e.name, v),
            ))
            .property(PropertyDescriptor::new::<Self, _, _>(
                "Lives",
                "lives",
                |e| e.lives.into(),
                |e, v| assign(&mut e.lives, v),
            ))
            .build()
            .expect("Cat metadata")
    }
}

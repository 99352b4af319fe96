//! Core types and traits for datamapper.
//!
//! - `Entity` / `Mapped` for persistent domain objects
//! - `EntityMetadata` and `MetadataRegistry` for storage mapping and inheritance
//! - `Connection` / `ConnectionFactory` for the storage boundary
//! - `Value` and `Row` for parameters and results
//! - `Outcome` and `Cx` re-exported from asupersync for cancel-correct operations

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod entity;
pub mod error;
pub mod metadata;
pub mod registry;
pub mod row;
pub mod value;

pub use connection::{Connection, ConnectionFactory};
pub use entity::{Entity, EntityClone, EntityRef, EntityRefExt, Mapped};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, EntityError, EntityErrorKind, Error,
    FieldValidationError, PoolError, PoolErrorKind, QueryError, QueryErrorKind, Result,
    TransactionError, TransactionErrorKind, TypeError, ValidationError,
};
pub use metadata::{
    Discriminator, EntityMetadata, ManyToManyDescriptor, MetadataBuilder, PropertyDescriptor,
    PropertyFlags, ReferenceDescriptor, assign,
};
pub use registry::{MetadataRegistry, RegistryBuilder};
pub use row::{ColumnInfo, Row};
pub use value::Value;

//! datamapper - cached, polymorphic entity persistence for Rust.
//!
//! datamapper maps plain structs to relational tables and provides:
//!
//! - An object cache shared by every session of a [`DataContext`], with
//!   "all instances" snapshots and reference-aware invalidation
//! - Data providers for CRUD, lists, counts, aggregates and bulk writes
//! - Polymorphic reads over class hierarchies, either one shared table with a
//!   discriminator or one table per concrete type
//! - A fluent [`DatabaseQuery`] builder with criteria, sort, paging and includes
//! - Ambient transaction scopes with read-your-writes and commit-time events
//!
//! # Quick Start
//!
//! ```ignore
//! use datamapper::prelude::*;
//!
//! #[derive(Debug, Clone, Default)]
//! struct Invoice {
//!     id: Option<i64>,
//!     number: String,
//!     version: i64,
//! }
//!
//! impl Entity for Invoice {
//!     fn id(&self) -> Value {
//!         self.id.into()
//!     }
//! }
//!
//! impl Mapped for Invoice {
//!     fn metadata() -> EntityMetadata {
//!         EntityMetadata::builder::<Self>("Invoice", "invoices")
//!             .identity(PropertyDescriptor::new::<Self, _, _>(
//!                 "Id", "id", |e| e.id.into(), |e, v| assign(&mut e.id, v),
//!             ))
//!             .auto_number()
//!             .property(PropertyDescriptor::new::<Self, _, _>(
//!                 "Number", "number", |e| e.number.clone().into(), |e, v| assign(&mut e.number, v),
//!             ))
//!             .row_version(PropertyDescriptor::new::<Self, _, _>(
//!                 "Version", "version", |e| e.version.into(), |e, v| assign(&mut e.version, v),
//!             ))
//!             .build()
//!             .expect("invoice metadata")
//!     }
//! }
//!
//! async fn example<F: ConnectionFactory + Clone>(cx: &Cx, factory: F) -> Outcome<(), Error> {
//!     let registry = try_result!(MetadataRegistry::builder().register::<Invoice>().build());
//!     let config = DataConfig::new()
//!         .dialect(Dialect::Postgres)
//!         .connection_string("postgres://localhost/billing");
//!     let ctx = try_result!(DataContext::new(registry, factory, config));
//!     let session = ctx.session();
//!
//!     let mut invoice = Invoice { number: "INV-1".into(), ..Invoice::default() };
//!     try_outcome!(session.save(cx, &mut invoice).await);
//!
//!     let recent = try_outcome!(
//!         session
//!             .query::<Invoice>()
//!             .where_eq("Number", "INV-1")
//!             .order_by_desc("Id")
//!             .page(0, 20)
//!             .get_list_of::<Invoice, _>(cx, &session)
//!             .await
//!     );
//!     Outcome::Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - **No reflection**: storage mapping is typed accessor closures built once per type
//! - **Structured concurrency**: built on asupersync for cancel-correct operations
//! - **Optimistic concurrency**: row versions turn lost updates into `ConcurrencyConflict`
//! - **Parameterized SQL only**: values are always bound, never spliced into text

// Re-export all public types from sub-crates
pub use datamapper_core::{
    ConfigError, Connection, ConnectionError, ConnectionErrorKind, ConnectionFactory, Cx,
    Discriminator, Entity, EntityClone, EntityError, EntityErrorKind, EntityMetadata, EntityRef,
    EntityRefExt, Error, FieldValidationError, ManyToManyDescriptor, Mapped, MetadataBuilder,
    MetadataRegistry, Outcome, PoolError, PoolErrorKind, PropertyDescriptor, PropertyFlags,
    QueryError, QueryErrorKind, ReferenceDescriptor, RegistryBuilder, Result, Row,
    TransactionError, TransactionErrorKind, TypeError, ValidationError, Value, assign,
    check_cancelled, try_outcome, try_result,
};
pub use datamapper_pool::{Pool, PoolConfig, PoolStats, PooledConnection};
pub use datamapper_query::{
    AggregateFunction, Command, Criterion, Dialect, IdentityReturn, Operand, Operator, Paging,
    PagingStyle, QuerySpec, SortPart, SqlCommandGenerator, TableScope,
};
pub use datamapper_session::{
    CacheConfig, CacheRefreshed, CacheStats, DataConfig, DataContext, DataProvider,
    DataProviderFactory, DatabaseQuery, EntityChange, EntityUpdated, NotificationHub,
    ObjectCache, PolymorphismStrategy, ProviderConfig, QueryTimestamp, ResolvedProvider,
    Session, Transaction, UnionProvider,
};

/// Everything an application needs to map entities and run queries.
pub mod prelude {
    pub use crate::{
        // Runtime
        Connection,
        ConnectionFactory,
        Cx,
        Outcome,
        // Mapping
        Entity,
        EntityMetadata,
        EntityRef,
        EntityRefExt,
        Mapped,
        MetadataRegistry,
        PropertyDescriptor,
        ReferenceDescriptor,
        ManyToManyDescriptor,
        assign,
        // Errors
        EntityErrorKind,
        Error,
        Result,
        ValidationError,
        // Querying
        AggregateFunction,
        Criterion,
        DatabaseQuery,
        Dialect,
        SortPart,
        Value,
        // Sessions
        CacheConfig,
        DataConfig,
        DataContext,
        EntityChange,
        PolymorphismStrategy,
        PoolConfig,
        Session,
        // Macros
        check_cancelled,
        try_outcome,
        try_result,
    };
}

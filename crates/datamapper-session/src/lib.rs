//! Object cache, data providers and sessions for datamapper.
//!
//! `datamapper-session` is the **persistence layer**. It ties entity
//! metadata, the command generator and pooled connections together into
//! cached, polymorphic reads and validated, version-checked writes.
//!
//! # Role In The Architecture
//!
//! - **Object cache**: process-wide entities by (type, identity) plus
//!   "all instances" snapshots, invalidated along the reference graph.
//! - **Data providers**: CRUD, lists, aggregates and bulk writes for one type.
//! - **Provider factory**: resolves base-type reads as a shared hierarchy
//!   table or a union over concrete tables.
//! - **Query builder**: fluent criteria, sort, paging and includes.
//! - **Sessions**: ambient transaction scopes with read-your-writes and
//!   commit-time publication of cache updates and events.
//!
//! # Design Philosophy
//!
//! - **Explicit lifecycle**: the cache lives in a `DataContext`, never in a global.
//! - **Publish on success**: nothing reaches the cache until storage confirmed it.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome` via `datamapper-core`.
//!
//! # Example
//!
//! ```ignore
//! let ctx = DataContext::new(registry, factory, config)?;
//! let session = ctx.session();
//!
//! let tx = session.enlist_or_create_transaction();
//! session.save(&cx, &mut invoice).await;
//! tx.commit(&cx).await;
//!
//! let open = session
//!     .query::<Invoice>()
//!     .where_eq("Status", "open")
//!     .order_by("Id")
//!     .page(0, 20)
//!     .get_list(&cx, &session)
//!     .await;
//! ```

pub mod cache;
pub mod config;
pub mod context;
pub mod events;
pub mod factory;
pub mod invalidation;
pub mod provider;
pub mod query;
pub mod unit_of_work;

pub use cache::{CacheStats, CacheWrite, ObjectCache, QueryTimestamp, ReadEpoch};
pub use config::{CacheConfig, DataConfig, PolymorphismStrategy, ProviderConfig};
pub use context::{DataContext, Session};
pub use events::{CacheRefreshed, EntityChange, EntityUpdated, NotificationHub};
pub use factory::{DataProviderFactory, ResolvedProvider, UnionProvider};
pub use invalidation::InvalidationGraph;
pub use provider::DataProvider;
pub use query::DatabaseQuery;
pub use unit_of_work::{Lease, Transaction, UnitOfWork};

//! Query specification and SQL generation for datamapper.
//!
//! `datamapper-query` is the **statement construction layer**. It turns
//! `EntityMetadata` plus a [`QuerySpec`] into SQL text and an ordered
//! parameter list.
//!
//! # Role In The Architecture
//!
//! - **Criteria**: `Criterion` triples of property, operator and operand.
//! - **Query specification**: criteria, sort parts, paging, includes and a parameter bag.
//! - **Generator**: dialect-aware SELECT / COUNT / aggregate / INSERT / UPDATE / DELETE.
//! - **Statement cache**: SQL text keyed by query shape, so repeated shapes skip building.
//!
//! Commands execute through the `Connection` trait from `datamapper-core`.
//! Most users reach this crate through the `datamapper` facade.

pub mod cache;
pub mod criteria;
pub mod dialect;
pub mod generator;
pub mod query_spec;

pub use cache::{StatementCache, cache_key};
pub use criteria::{Criterion, Operand, Operator};
pub use dialect::{Dialect, IdentityReturn, PagingStyle};
pub use generator::{Command, InsertCommand, SqlCommandGenerator, TableScope, next_version};
pub use query_spec::{AggregateFunction, Paging, QuerySpec, SortPart};

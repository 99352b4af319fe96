//! Test support for datamapper.
//!
//! - [`MemoryDatabase`]: shared in-memory storage that executes the SQL the
//!   command generator produces, with statement counters and failure injection
//! - [`MemoryFactory`]: a `ConnectionFactory` handing out connections to it
//! - [`fixtures`]: mapped entity types covering identity styles, row versions,
//!   soft deletes, references and both inheritance layouts

#![allow(clippy::missing_panics_doc)]

pub mod fixtures;
pub mod memory;
mod sql;

pub use memory::{DatabaseStats, MemoryConnection, MemoryDatabase, MemoryFactory};

use asupersync::Outcome;
use datamapper_core::Error;

/// Unwrap an `Ok` outcome, panicking with a readable message otherwise.
pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(value) => value,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

//! Storage boundary.
//!
//! [`Connection`] is everything the core needs from a database driver:
//! parameterized reads, non-query execution, scalar reads, batched
//! non-queries and driver-level transaction control. All operations take a
//! `Cx` context for cancellation and return an `Outcome`.
//!
//! Values always travel as bound parameters. Nothing in this workspace
//! splices caller-supplied values into SQL text.

use asupersync::{Cx, Outcome};

use crate::error::Error;
use crate::row::Row;
use crate::value::Value;

/// A storage connection capable of executing parameterized commands.
///
/// Implementations must be `Send + Sync` for use across async boundaries.
pub trait Connection: Send + Sync {
    /// Execute a query and return all rows (`ExecuteReader`).
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send;

    /// Execute a statement and return rows affected (`ExecuteNonQuery`).
    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send;

    /// Execute an INSERT and return the last inserted id.
    ///
    /// Drivers without `RETURNING` support report their last-insert-id here.
    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send;

    /// Execute several statements in order (`ExecuteBulkNonQueries`).
    ///
    /// Returns the rows affected by each statement.
    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send;

    /// Begin a driver-level transaction on this connection.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Commit the open transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the open transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Check if the connection is still usable.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Execute a query and return the first row, if any.
    fn query_one(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        async move {
            match self.query(cx, sql, params).await {
                Outcome::Ok(rows) => Outcome::Ok(rows.into_iter().next()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    /// Execute a query and return the first column of the first row (`ExecuteScalar`).
    ///
    /// An empty result yields `Value::Null`.
    fn scalar(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Value, Error>> + Send {
        async move {
            match self.query_one(cx, sql, params).await {
                Outcome::Ok(row) => {
                    Outcome::Ok(row.and_then(|r| r.first().cloned()).unwrap_or(Value::Null))
                }
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        }
    }

    /// Check if the connection is still valid (alias for ping that returns bool).
    fn is_valid(&self, cx: &Cx) -> impl Future<Output = bool> + Send {
        async {
            match self.ping(cx).await {
                Outcome::Ok(()) => true,
                Outcome::Err(_) | Outcome::Cancelled(_) | Outcome::Panicked(_) => false,
            }
        }
    }
}

impl<C: Connection> Connection for std::sync::Arc<C> {
    fn query(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        (**self).query(cx, sql, params)
    }

    fn execute(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        (**self).execute(cx, sql, params)
    }

    fn insert(
        &self,
        cx: &Cx,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        (**self).insert(cx, sql, params)
    }

    fn batch(
        &self,
        cx: &Cx,
        statements: &[(String, Vec<Value>)],
    ) -> impl Future<Output = Outcome<Vec<u64>, Error>> + Send {
        (**self).batch(cx, statements)
    }

    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        (**self).begin(cx)
    }

    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        (**self).commit(cx)
    }

    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        (**self).rollback(cx)
    }

    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        (**self).ping(cx)
    }
}

/// Produces new connections for a connection string.
///
/// Pools call this when no idle connection is available; it is the only
/// place a physical connection is opened.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection + 'static;

    fn connect(
        &self,
        cx: &Cx,
        connection_string: &str,
    ) -> impl Future<Output = Outcome<Self::Connection, Error>> + Send;
}

/// Turn a non-`Ok` outcome into an early return, yielding the `Ok` value.
///
/// ```rust,ignore
/// let rows = try_outcome!(conn.query(cx, &sql, &params).await);
/// ```
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Return `Outcome::Cancelled` if the context has been cancelled.
#[macro_export]
macro_rules! check_cancelled {
    ($cx:expr) => {
        if let Some(reason) = $cx.cancel_reason() {
            return $crate::Outcome::Cancelled(reason);
        }
    };
}

/// Lift a synchronous `Result` into an early-returning `Outcome` value.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return $crate::Outcome::Err(e.into()),
        }
    };
}

//! Error types for datamapper operations.
//!
//! "Not found" is never an error here: lookups return `Option`/empty lists.
//! Cache corruption is not an error either; it panics at the detection site.

use std::fmt;

/// The primary error type for all datamapper operations.
#[derive(Debug)]
pub enum Error {
    /// Connection-related errors (connect, disconnect, timeout)
    Connection(ConnectionError),
    /// Query execution errors reported by storage
    Query(QueryError),
    /// Type conversion errors while materializing rows
    Type(TypeError),
    /// Transaction errors
    Transaction(TransactionError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// Entity-level validation rejected a write before any storage I/O
    Validation(ValidationError),
    /// Entity, metadata and query-shape errors raised by the core itself
    Entity(EntityError),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Deadlock detected
    Deadlock,
    /// Statement timeout
    Timeout,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Already committed
    AlreadyCommitted,
    /// Already rolled back
    AlreadyRolledBack,
    /// An inner scope rolled back, so the outermost scope cannot commit
    RollbackOnly,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// No connection came back before the acquire timeout
    Timeout,
    /// Pool is closed
    Closed,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

/// Validation error for field-level and entity-level validation.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The errors grouped by property name (or "__entity__" for entity-level)
    pub errors: Vec<FieldValidationError>,
}

/// A single validation error for a property.
#[derive(Debug, Clone)]
pub struct FieldValidationError {
    /// The property name that failed validation
    pub field: String,
    /// Human-readable error message
    pub message: String,
}

#[derive(Debug)]
pub struct EntityError {
    pub kind: EntityErrorKind,
    /// Entity type name the error concerns
    pub entity: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityErrorKind {
    /// The caller required the record to exist and it does not
    MissingRecord,
    /// Row version at write time did not match the version read at load time
    ConcurrencyConflict,
    /// A base/abstract type was queried through a non-polymorphic factory
    UnsupportedPolymorphicQuery,
    /// The type was never registered with the metadata registry
    UnknownEntityType,
    /// A criterion, sort part or aggregate named a property the type does not map
    UnknownProperty,
    /// A criterion referenced a parameter missing from the parameter bag
    MissingParameter,
    /// The query specification cannot be executed as built
    InvalidQuery,
}

impl ValidationError {
    /// Create a new empty validation error container.
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    /// Check if there are any validation errors.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add a property validation error.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(FieldValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a required property error.
    pub fn add_required(&mut self, field: impl Into<String>) {
        self.add(field, "is required");
    }

    /// Add an entity-level validation error.
    pub fn add_entity_error(&mut self, message: impl Into<String>) {
        self.add("__entity__", message);
    }

    /// Convert to Result, returning Ok(()) if no errors, Err(self) otherwise.
    pub fn into_result(self) -> std::result::Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl Default for ValidationError {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityError {
    pub fn new(kind: EntityErrorKind, entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            entity: entity.into(),
            message: message.into(),
        }
    }
}

impl Error {
    /// Shorthand for an entity-level error.
    pub fn entity(
        kind: EntityErrorKind,
        entity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Entity(EntityError::new(kind, entity, message))
    }

    /// The entity error kind, if this is an entity-level error.
    pub fn entity_kind(&self) -> Option<EntityErrorKind> {
        match self {
            Error::Entity(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Is this a concurrency conflict (stale row version)?
    pub fn is_concurrency_conflict(&self) -> bool {
        self.entity_kind() == Some(EntityErrorKind::ConcurrencyConflict)
    }

    /// Is this a "caller required existence" failure?
    pub fn is_missing_record(&self) -> bool {
        self.entity_kind() == Some(EntityErrorKind::MissingRecord)
    }

    /// Is this a retryable error (deadlock, pool exhausted, timeouts)?
    ///
    /// The core never retries; this is for the storage boundary's own policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Query(q) => matches!(q.kind, QueryErrorKind::Deadlock | QueryErrorKind::Timeout),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted | PoolErrorKind::Timeout),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Is this a storage-availability error (connection or pool level)?
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::Pool(_))
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Validation(e) => write!(f, "Validation error: {}", e),
            Error::Entity(e) => write!(f, "{}", e),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for EntityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityErrorKind::MissingRecord => "missing record",
            EntityErrorKind::ConcurrencyConflict => "concurrency conflict",
            EntityErrorKind::UnsupportedPolymorphicQuery => "unsupported polymorphic query",
            EntityErrorKind::UnknownEntityType => "unknown entity type",
            EntityErrorKind::UnknownProperty => "unknown property",
            EntityErrorKind::MissingParameter => "missing parameter",
            EntityErrorKind::InvalidQuery => "invalid query",
        };
        f.write_str(name)
    }
}

impl fmt::Display for EntityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on '{}': {}", self.kind, self.entity, self.message)
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "validation passed")
        } else if self.errors.len() == 1 {
            let err = &self.errors[0];
            write!(f, "validation error on '{}': {}", err.field, err.message)
        } else {
            writeln!(f, "validation errors:")?;
            for err in &self.errors {
                writeln!(f, "  - {}: {}", err.field, err.message)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ValidationError> for Error {
    fn from(err: ValidationError) -> Self {
        Error::Validation(err)
    }
}

impl From<EntityError> for Error {
    fn from(err: EntityError) -> Self {
        Error::Entity(err)
    }
}

/// Result type alias for datamapper operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_helpers() {
        let err = Error::entity(EntityErrorKind::ConcurrencyConflict, "Invoice", "version 3");
        assert!(err.is_concurrency_conflict());
        assert!(!err.is_missing_record());
        assert_eq!(
            err.to_string(),
            "concurrency conflict on 'Invoice': version 3"
        );

        let missing = Error::entity(EntityErrorKind::MissingRecord, "Invoice", "id 7");
        assert!(missing.is_missing_record());
        assert_eq!(Error::Timeout.entity_kind(), None);
    }

    #[test]
    fn retryable_and_connection_flags() {
        let deadlock = Error::Query(QueryError {
            kind: QueryErrorKind::Deadlock,
            sql: Some("UPDATE t SET a = $1".to_string()),
            message: "deadlock detected".to_string(),
            source: None,
        });
        assert!(deadlock.is_retryable());
        assert_eq!(deadlock.sql(), Some("UPDATE t SET a = $1"));

        let exhausted = Error::Pool(PoolError {
            kind: PoolErrorKind::Exhausted,
            message: "pool exhausted".to_string(),
        });
        assert!(exhausted.is_retryable());
        assert!(exhausted.is_connection_error());

        let refused = Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Refused,
            message: "refused".to_string(),
            source: None,
        });
        assert!(refused.is_connection_error());
        assert!(!refused.is_retryable());
    }

    #[test]
    fn validation_error_display() {
        let mut v = ValidationError::new();
        assert!(v.clone().into_result().is_ok());
        v.add_required("number");
        assert_eq!(v.to_string(), "validation error on 'number': is required");
        v.add_entity_error("total must be positive");
        let text = v.to_string();
        assert!(text.starts_with("validation errors:"));
        assert!(text.contains("__entity__: total must be positive"));
    }
}

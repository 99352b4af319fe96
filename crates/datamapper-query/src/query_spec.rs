//! The query specification: what a `DatabaseQuery` executes.
//!
//! A `QuerySpec` is a plain value. Builders clone it at execution time, so
//! a specification handed to the generator is never mutated underneath it.

use std::any::TypeId;
use std::collections::BTreeMap;

use datamapper_core::{EntityErrorKind, Error, Result, Value};

use crate::criteria::{Criterion, Operand};

/// One ORDER BY part, by property name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SortPart {
    pub property: String,
    pub descending: bool,
}

impl SortPart {
    pub fn asc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            descending: false,
        }
    }

    pub fn desc(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            descending: true,
        }
    }
}

/// Paging window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Paging {
    #[default]
    None,
    /// Zero-based start index and page size.
    Page { start: u64, size: u64 },
    /// First N rows.
    Top(u64),
}

impl Paging {
    pub fn is_some(self) -> bool {
        !matches!(self, Paging::None)
    }

    /// Number of leading rows a source must supply so that this window can
    /// be cut from a merge of several sources.
    pub fn prefix_len(self) -> Option<u64> {
        match self {
            Paging::None => None,
            Paging::Page { start, size } => Some(start.saturating_add(size)),
            Paging::Top(n) => Some(n),
        }
    }

    /// Cut this window out of an already sorted list.
    pub fn apply<T>(self, items: Vec<T>) -> Vec<T> {
        match self {
            Paging::None => items,
            Paging::Page { start, size } => items
                .into_iter()
                .skip(usize::try_from(start).unwrap_or(usize::MAX))
                .take(usize::try_from(size).unwrap_or(usize::MAX))
                .collect(),
            Paging::Top(n) => items
                .into_iter()
                .take(usize::try_from(n).unwrap_or(usize::MAX))
                .collect(),
        }
    }
}

/// Aggregate function for `aggregate` executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub const fn as_sql(self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

/// Criteria, sort, paging, includes and parameters for one entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub entity: TypeId,
    pub criteria: Vec<Criterion>,
    pub sort: Vec<SortPart>,
    pub paging: Paging,
    pub includes: Vec<String>,
    pub params: BTreeMap<String, Value>,
}

impl QuerySpec {
    pub fn new(entity: TypeId) -> Self {
        Self {
            entity,
            criteria: Vec::new(),
            sort: Vec::new(),
            paging: Paging::None,
            includes: Vec::new(),
            params: BTreeMap::new(),
        }
    }

    pub fn of<T: 'static>() -> Self {
        Self::new(TypeId::of::<T>())
    }

    /// Whether any criterion narrows the result.
    pub fn is_filtered(&self) -> bool {
        !self.criteria.is_empty()
    }

    /// The same specification aimed at another entity type.
    pub fn retarget(&self, entity: TypeId) -> Self {
        Self {
            entity,
            ..self.clone()
        }
    }

    /// The operand value of a criterion, resolving parameter-bag references.
    pub fn operand_value<'a>(&'a self, criterion: &'a Criterion, entity: &str) -> Result<&'a Value> {
        static NULL: Value = Value::Null;
        match &criterion.operand {
            Operand::Value(v) => Ok(v),
            Operand::None => Ok(&NULL),
            Operand::Param(name) => self.params.get(name).ok_or_else(|| {
                Error::entity(
                    EntityErrorKind::MissingParameter,
                    entity,
                    format!("criterion on '{}' references unknown parameter '{name}'", criterion.property),
                )
            }),
        }
    }
}

//! Filter criteria: (property, operator, operand) triples.

use datamapper_core::Value;

/// Comparison operator of a criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl Operator {
    pub const fn as_sql(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "<>",
            Operator::Lt => "<",
            Operator::LtEq => "<=",
            Operator::Gt => ">",
            Operator::GtEq => ">=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
        }
    }

    /// Whether the operator takes no operand.
    pub const fn is_unary(self) -> bool {
        matches!(self, Operator::IsNull | Operator::IsNotNull)
    }
}

/// Right-hand side of a criterion.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// Literal value, always bound as a parameter.
    Value(Value),
    /// Named entry in the query's parameter bag, resolved at generation time.
    Param(String),
    /// No operand (`IS NULL` / `IS NOT NULL`).
    None,
}

/// A single filter condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub property: String,
    pub operator: Operator,
    pub operand: Operand,
}

impl Criterion {
    pub fn new(property: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            property: property.into(),
            operator,
            operand: if operator.is_unary() {
                Operand::None
            } else {
                Operand::Value(value.into())
            },
        }
    }

    /// Criterion whose operand is looked up in the parameter bag by name.
    pub fn param(property: impl Into<String>, operator: Operator, name: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            operator,
            operand: Operand::Param(name.into()),
        }
    }

    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Operator::Eq, value)
    }

    pub fn not_eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Operator::NotEq, value)
    }

    pub fn lt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Operator::Lt, value)
    }

    pub fn lt_eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Operator::LtEq, value)
    }

    pub fn gt(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Operator::Gt, value)
    }

    pub fn gt_eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(property, Operator::GtEq, value)
    }

    pub fn like(property: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(property, Operator::Like, Value::Text(pattern.into()))
    }

    pub fn is_in(property: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(property, Operator::In, Value::Array(values))
    }

    pub fn not_in(property: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(property, Operator::NotIn, Value::Array(values))
    }

    pub fn is_null(property: impl Into<String>) -> Self {
        Self::new(property, Operator::IsNull, Value::Null)
    }

    pub fn is_not_null(property: impl Into<String>) -> Self {
        Self::new(property, Operator::IsNotNull, Value::Null)
    }
}

/// The part of a bound value that changes SQL text: nullness, and list length for `IN`.
pub(crate) fn shape_of(value: &Value) -> (bool, usize) {
    match value {
        Value::Null => (true, 0),
        Value::Array(items) => (false, items.len()),
        _ => (false, 1),
    }
}

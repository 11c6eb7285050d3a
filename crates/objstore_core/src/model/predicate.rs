//! Filter and sort criteria.
//!
//! Predicates are engine-neutral trees. The memory engine and the unit of work
//! evaluate them directly; the SQLite engine compiles them to SQL with the
//! same two-valued semantics.
//!
//! # Invariants
//! - A missing attribute reads as `Null`.
//! - Ordering comparisons only hold within one value family.
//! - `Ne` is exactly the negation of `Eq`.

use crate::model::record::{AttributeValue, Attributes};
use std::cmp::Ordering;

/// Comparison operator of a leaf predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Text containment, case-sensitive.
    Contains,
    /// Text prefix, case-sensitive.
    BeginsWith,
}

/// Boolean expression over record attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    True,
    Compare {
        attribute: String,
        op: ComparisonOp,
        value: AttributeValue,
    },
    IsNull(String),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn compare(
        attribute: impl Into<String>,
        op: ComparisonOp,
        value: impl Into<AttributeValue>,
    ) -> Self {
        Self::Compare {
            attribute: attribute.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, ComparisonOp::Eq, value)
    }

    pub fn ne(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, ComparisonOp::Ne, value)
    }

    pub fn lt(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, ComparisonOp::Lt, value)
    }

    pub fn le(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, ComparisonOp::Le, value)
    }

    pub fn gt(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, ComparisonOp::Gt, value)
    }

    pub fn ge(attribute: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self::compare(attribute, ComparisonOp::Ge, value)
    }

    pub fn contains(attribute: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::compare(
            attribute,
            ComparisonOp::Contains,
            AttributeValue::Text(needle.into()),
        )
    }

    pub fn begins_with(attribute: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::compare(
            attribute,
            ComparisonOp::BeginsWith,
            AttributeValue::Text(prefix.into()),
        )
    }

    pub fn is_null(attribute: impl Into<String>) -> Self {
        Self::IsNull(attribute.into())
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut parts) => {
                parts.push(other);
                Self::And(parts)
            }
            first => Self::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut parts) => {
                parts.push(other);
                Self::Or(parts)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluates the predicate against one attribute map.
    ///
    /// An empty `And` holds, an empty `Or` does not.
    pub fn evaluate(&self, attributes: &Attributes) -> bool {
        match self {
            Self::True => true,
            Self::Compare {
                attribute,
                op,
                value,
            } => {
                let actual = attributes.get(attribute).unwrap_or(&AttributeValue::Null);
                compare_values(actual, *op, value)
            }
            Self::IsNull(attribute) => attributes
                .get(attribute)
                .map_or(true, AttributeValue::is_null),
            Self::And(parts) => parts.iter().all(|part| part.evaluate(attributes)),
            Self::Or(parts) => parts.iter().any(|part| part.evaluate(attributes)),
            Self::Not(inner) => !inner.evaluate(attributes),
        }
    }
}

fn compare_values(actual: &AttributeValue, op: ComparisonOp, expected: &AttributeValue) -> bool {
    match op {
        ComparisonOp::Eq => values_equal(actual, expected),
        ComparisonOp::Ne => !values_equal(actual, expected),
        ComparisonOp::Lt => actual.compare(expected) == Some(Ordering::Less),
        ComparisonOp::Le => matches!(
            actual.compare(expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        ComparisonOp::Gt => actual.compare(expected) == Some(Ordering::Greater),
        ComparisonOp::Ge => matches!(
            actual.compare(expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ComparisonOp::Contains => match (actual.as_text(), expected.as_text()) {
            (Some(haystack), Some(needle)) => haystack.contains(needle),
            _ => false,
        },
        ComparisonOp::BeginsWith => match (actual.as_text(), expected.as_text()) {
            (Some(text), Some(prefix)) => text.starts_with(prefix),
            _ => false,
        },
    }
}

fn values_equal(actual: &AttributeValue, expected: &AttributeValue) -> bool {
    if expected.is_null() {
        return actual.is_null();
    }
    actual.compare(expected) == Some(Ordering::Equal)
}

/// Single ordering key with direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
    pub attribute: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ascending: true,
        }
    }

    pub fn descending(attribute: impl Into<String>) -> Self {
        Self {
            attribute: attribute.into(),
            ascending: false,
        }
    }

    /// Orders two attribute maps; callers use a stable sort so ties keep
    /// engine order.
    pub fn compare(&self, left: &Attributes, right: &Attributes) -> Ordering {
        let null = AttributeValue::Null;
        let left = left.get(&self.attribute).unwrap_or(&null);
        let right = right.get(&self.attribute).unwrap_or(&null);
        let ordering = left.sort_cmp(right);
        if self.ascending {
            ordering
        } else {
            ordering.reverse()
        }
    }
}

//! Query predicates over record fields.
//!
//! Predicates are used by queries, as conditions on saves and deletes, and
//! to find dependents during cascade deletes. The primary key is addressed
//! as `id`.

use crate::{FieldValue, Record};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A boolean condition on a record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Predicate {
    /// Matches every record
    #[default]
    All,
    Eq { field: String, value: FieldValue },
    Ne { field: String, value: FieldValue },
    Gt { field: String, value: FieldValue },
    Ge { field: String, value: FieldValue },
    Lt { field: String, value: FieldValue },
    Le { field: String, value: FieldValue },
    /// Substring match on string-like fields
    Contains { field: String, value: String },
    BeginsWith { field: String, value: String },
    /// Inclusive range
    Between {
        field: String,
        start: FieldValue,
        end: FieldValue,
    },
    And { predicates: Vec<Predicate> },
    Or { predicates: Vec<Predicate> },
    Not { predicate: Box<Predicate> },
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Predicate::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Predicate::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn gt(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Predicate::Gt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn ge(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Predicate::Ge {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Predicate::Lt {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn le(field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Predicate::Le {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::Contains {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn begins_with(field: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::BeginsWith {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn between(
        field: impl Into<String>,
        start: impl Into<FieldValue>,
        end: impl Into<FieldValue>,
    ) -> Self {
        Predicate::Between {
            field: field.into(),
            start: start.into(),
            end: end.into(),
        }
    }

    /// Conjunction with another predicate, flattening nested `And`s.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::All, p) | (p, Predicate::All) => p,
            (Predicate::And { mut predicates }, Predicate::And { predicates: more }) => {
                predicates.extend(more);
                Predicate::And { predicates }
            }
            (Predicate::And { mut predicates }, p) => {
                predicates.push(p);
                Predicate::And { predicates }
            }
            (a, b) => Predicate::And {
                predicates: vec![a, b],
            },
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::Or { mut predicates }, p) => {
                predicates.push(p);
                Predicate::Or { predicates }
            }
            (a, b) => Predicate::Or {
                predicates: vec![a, b],
            },
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not {
            predicate: Box::new(self),
        }
    }

    /// Evaluate the predicate against a record.
    ///
    /// Comparisons against a missing field or an incomparable value are false,
    /// except `Ne` which holds when the field differs or is absent.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Predicate::All => true,
            Predicate::Eq { field, value } => {
                compare(record, field, value) == Some(Ordering::Equal)
            }
            Predicate::Ne { field, value } => {
                compare(record, field, value) != Some(Ordering::Equal)
            }
            Predicate::Gt { field, value } => {
                compare(record, field, value) == Some(Ordering::Greater)
            }
            Predicate::Ge { field, value } => matches!(
                compare(record, field, value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Predicate::Lt { field, value } => {
                compare(record, field, value) == Some(Ordering::Less)
            }
            Predicate::Le { field, value } => matches!(
                compare(record, field, value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Predicate::Contains { field, value } => record
                .lookup(field)
                .and_then(|v| v.as_str().map(|s| s.contains(value.as_str())))
                .unwrap_or(false),
            Predicate::BeginsWith { field, value } => record
                .lookup(field)
                .and_then(|v| v.as_str().map(|s| s.starts_with(value.as_str())))
                .unwrap_or(false),
            Predicate::Between { field, start, end } => {
                matches!(
                    compare(record, field, start),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(
                    compare(record, field, end),
                    Some(Ordering::Less | Ordering::Equal)
                )
            }
            Predicate::And { predicates } => predicates.iter().all(|p| p.matches(record)),
            Predicate::Or { predicates } => predicates.iter().any(|p| p.matches(record)),
            Predicate::Not { predicate } => !predicate.matches(record),
        }
    }
}

fn compare(record: &Record, field: &str, value: &FieldValue) -> Option<Ordering> {
    record.lookup(field)?.compare(value)
}

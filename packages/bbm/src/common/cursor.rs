//! Batch key cursor.
//!
//! A cursor is the value of the batching key of one row. Single-column keys are
//! a one-element cursor; composite keys compare as tuples, which is exactly the
//! lexicographic order of the underlying vector.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(transparent, no_pg_array)]
#[serde(transparent)]
pub struct Cursor(Vec<i64>);

impl Cursor {
    pub fn new(values: Vec<i64>) -> Self {
        Self(values)
    }

    /// Cursor for a single-column key
    pub fn single(value: i64) -> Self {
        Self(vec![value])
    }

    pub fn values(&self) -> &[i64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Leading key component, the plain value for single-column keys
    pub fn first_value(&self) -> i64 {
        self.0.first().copied().unwrap_or_default()
    }

    /// Smallest cursor strictly greater than this one.
    ///
    /// Increments the last component, carrying into the previous one when it
    /// is already `i64::MAX`. `None` when every component is at its maximum.
    pub fn successor(&self) -> Option<Self> {
        let mut values = self.0.clone();
        for value in values.iter_mut().rev() {
            match value.checked_add(1) {
                Some(next) => {
                    *value = next;
                    return Some(Self(values));
                }
                None => *value = i64::MIN,
            }
        }
        None
    }

    /// Smallest cursor of the given width whose leading component is `value`
    pub fn lower_bound(value: i64, width: usize) -> Self {
        let mut values = vec![i64::MIN; width.max(1)];
        values[0] = value;
        Self(values)
    }

    /// Largest cursor of the given width whose leading component is `value`
    pub fn upper_bound(value: i64, width: usize) -> Self {
        let mut values = vec![i64::MAX; width.max(1)];
        values[0] = value;
        Self(values)
    }
}

impl From<i64> for Cursor {
    fn from(value: i64) -> Self {
        Self::single(value)
    }
}

impl From<Vec<i64>> for Cursor {
    fn from(values: Vec<i64>) -> Self {
        Self(values)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{}", single),
            values => {
                let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                write!(f, "({})", parts.join(", "))
            }
        }
    }
}

// Composite index keys.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::table::value::Value;

/// Ordered tuple of values identifying a row in an index. Column-wise
/// comparison with NULL sorting low; a shorter key that is a prefix of a
/// longer one sorts first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeKey(pub Vec<Value>);

impl CompositeKey {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn single(value: Value) -> Self {
        Self(vec![value])
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl PartialOrd for CompositeKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CompositeKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().zip(other.0.iter()) {
            match a.compare(b) {
                Ordering::Equal => continue,
                non_equal => return non_equal,
            }
        }
        self.0.len().cmp(&other.0.len())
    }
}

impl std::fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_wise_order() {
        let a = CompositeKey::new(vec![Value::Int32(1), Value::String("b".into())]);
        let b = CompositeKey::new(vec![Value::Int32(1), Value::String("c".into())]);
        let c = CompositeKey::new(vec![Value::Int32(2), Value::String("a".into())]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_null_sorts_low_in_keys() {
        let null_key = CompositeKey::single(Value::Null);
        let int_key = CompositeKey::single(Value::Int32(i32::MIN));
        assert!(null_key < int_key);
    }

    #[test]
    fn test_prefix_sorts_first() {
        let short = CompositeKey::new(vec![Value::Int32(1)]);
        let long = CompositeKey::new(vec![Value::Int32(1), Value::Int32(0)]);
        assert!(short < long);
    }
}

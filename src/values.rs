//! Knowledge about symbolic values: concrete interpretations and disequalities.

use num_bigint::BigInt;
use rpds::{RedBlackTreeMap, RedBlackTreeMapSync, RedBlackTreeSetSync};

use crate::types::Value;

/// A bijection between symbolic values and the concrete integers they are known to equal.
///
/// The null value is always bound to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplicitValues {
    by_value: RedBlackTreeMapSync<Value, BigInt>,
    by_integer: RedBlackTreeMapSync<BigInt, Value>,
}

impl ExplicitValues {
    pub fn new() -> Self {
        let zero = BigInt::from(0);
        Self {
            by_value: RedBlackTreeMap::new_sync().insert(Value::NULL, zero.clone()),
            by_integer: RedBlackTreeMap::new_sync().insert(zero, Value::NULL),
        }
    }

    pub fn get(&self, value: Value) -> Option<&BigInt> {
        self.by_value.get(&value)
    }

    /// The value known to equal `n`, if any.
    pub fn value_for(&self, n: &BigInt) -> Option<Value> {
        self.by_integer.get(n).copied()
    }

    pub fn contains(&self, value: Value) -> bool {
        self.by_value.contains_key(&value)
    }

    pub fn len(&self) -> usize {
        self.by_value.size()
    }

    pub fn is_empty(&self) -> bool {
        self.by_value.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value, &BigInt)> {
        self.by_value.iter().map(|(v, n)| (*v, n))
    }

    /// Binds `value` to `n`.
    ///
    /// Returns the updated map and, when `n` was already bound to a different
    /// value, that value: the caller must then identify the two values.
    pub fn insert(&self, value: Value, n: BigInt) -> (Self, Option<Value>) {
        if let Some(&existing) = self.by_integer.get(&n) {
            if existing != value {
                return (self.clone(), Some(existing));
            }
            return (self.clone(), None);
        }
        let mut result = self.remove(value);
        result.by_integer.insert_mut(n.clone(), value);
        result.by_value.insert_mut(value, n);
        (result, None)
    }

    pub fn remove(&self, value: Value) -> Self {
        if value.is_null() {
            return self.clone();
        }
        let mut result = self.clone();
        if let Some(n) = self.by_value.get(&value) {
            result.by_integer.remove_mut(n);
            result.by_value.remove_mut(&value);
        }
        result
    }

    /// Moves the binding of `from` (if any) onto `to`, after `from` has been merged into `to`.
    pub fn rename(&self, from: Value, to: Value) -> Self {
        match self.by_value.get(&from) {
            Some(n) if from != to => {
                let n = n.clone();
                let mut result = self.remove(from);
                if !result.contains(to) {
                    result.by_integer.insert_mut(n.clone(), to);
                    result.by_value.insert_mut(to, n);
                }
                result
            }
            _ => self.clone(),
        }
    }

    /// Keeps only the bindings of values satisfying `keep`.
    pub fn retain(&self, mut keep: impl FnMut(Value) -> bool) -> Self {
        let mut result = self.clone();
        for (value, _) in self.iter() {
            if !value.is_null() && !keep(value) {
                result = result.remove(value);
            }
        }
        result
    }
}

impl Default for ExplicitValues {
    fn default() -> Self {
        Self::new()
    }
}

/// A symmetric, irreflexive relation of proven disequalities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeqRelation {
    pairs: RedBlackTreeMapSync<Value, RedBlackTreeSetSync<Value>>,
}

impl NeqRelation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, a: Value, b: Value) -> bool {
        self.pairs.get(&a).is_some_and(|set| set.contains(&b))
    }

    /// Values known to differ from `value`.
    pub fn unequal_to(&self, value: Value) -> impl Iterator<Item = Value> + '_ {
        self.pairs.get(&value).into_iter().flat_map(|set| set.iter().copied())
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// All pairs `(a, b)` with `a < b`.
    pub fn iter(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        self.pairs
            .iter()
            .flat_map(|(a, set)| set.iter().map(move |b| (*a, *b)))
            .filter(|(a, b)| a < b)
    }

    pub fn add(&mut self, a: Value, b: Value) {
        if a == b {
            return;
        }
        self.add_directed(a, b);
        self.add_directed(b, a);
    }

    fn add_directed(&mut self, from: Value, to: Value) {
        let set = self.pairs.get(&from).cloned().unwrap_or_default();
        self.pairs.insert_mut(from, set.insert(to));
    }

    /// Forgets everything known about `value`.
    pub fn remove_value(&mut self, value: Value) {
        let Some(set) = self.pairs.get(&value).cloned() else {
            return;
        };
        for other in set.iter() {
            if let Some(back) = self.pairs.get(other) {
                let back = back.remove(&value);
                if back.is_empty() {
                    self.pairs.remove_mut(other);
                } else {
                    self.pairs.insert_mut(*other, back);
                }
            }
        }
        self.pairs.remove_mut(&value);
    }

    /// Transfers the disequalities of `removed` onto `kept`.
    pub fn merge_values(&mut self, kept: Value, removed: Value) {
        let others: Vec<Value> = self.unequal_to(removed).collect();
        self.remove_value(removed);
        for other in others {
            self.add(kept, other);
        }
    }
}

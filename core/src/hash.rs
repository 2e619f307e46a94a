//! Structural hashing for target and document identity
//!
//! Two producers of identity hashes live here:
//!
//! - [`FieldHasher`] hashes a struct as a bag of named fields. Declaration
//!   order must not affect the result, so each `(name, value)` record is
//!   hashed independently and the records are combined commutatively.
//! - [`value_hash`] hashes a decoded YAML document the same way: mappings
//!   are order-insensitive, sequences are not.
//!
//! Hashes are process-local identities. Nothing is persisted, so stability
//! across runs or architectures is not required, only determinism within
//! one process.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use serde_yaml::Value;

/// Hash a struct as an unordered bag of named fields
///
/// # Example
///
/// ```
/// use scout_core::hash::FieldHasher;
///
/// let mut h = FieldHasher::new();
/// h.field("name", &"web");
/// h.field("port", &8080u16);
/// let forward = h.finish();
///
/// let mut h = FieldHasher::new();
/// h.field("port", &8080u16);
/// h.field("name", &"web");
/// assert_eq!(h.finish(), forward);
/// ```
#[derive(Debug, Default)]
pub struct FieldHasher {
    acc: u64,
}

impl FieldHasher {
    /// Create an empty hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one named scalar field
    pub fn field<T: Hash + ?Sized>(&mut self, name: &str, value: &T) {
        let mut h = DefaultHasher::new();
        name.hash(&mut h);
        value.hash(&mut h);
        self.combine(h.finish());
    }

    /// Add one named string-map field, entry order irrelevant
    ///
    /// `BTreeMap` already iterates key-sorted, which keeps the record
    /// deterministic without extra work.
    pub fn map_field(&mut self, name: &str, map: &BTreeMap<String, String>) {
        let mut h = DefaultHasher::new();
        name.hash(&mut h);
        for (k, v) in map {
            k.hash(&mut h);
            v.hash(&mut h);
        }
        self.combine(h.finish());
    }

    /// Finish and return the combined hash
    pub fn finish(&self) -> u64 {
        let mut h = DefaultHasher::new();
        self.acc.hash(&mut h);
        h.finish()
    }

    fn combine(&mut self, record: u64) {
        // wrapping add keeps the combination commutative
        self.acc = self.acc.wrapping_add(record);
    }
}

/// Hash a YAML value structurally
///
/// Mapping entries are combined commutatively so key order in the source
/// document does not matter; sequence order does. Two documents that decode
/// to the same value always hash equal.
pub fn value_hash(value: &Value) -> u64 {
    let mut h = DefaultHasher::new();
    hash_value(value, &mut h);
    h.finish()
}

fn hash_value(value: &Value, h: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(h),
        Value::Bool(b) => {
            1u8.hash(h);
            b.hash(h);
        }
        Value::Number(n) => {
            2u8.hash(h);
            n.to_string().hash(h);
        }
        Value::String(s) => {
            3u8.hash(h);
            s.hash(h);
        }
        Value::Sequence(seq) => {
            4u8.hash(h);
            seq.len().hash(h);
            for item in seq {
                hash_value(item, h);
            }
        }
        Value::Mapping(map) => {
            5u8.hash(h);
            map.len().hash(h);
            let mut acc: u64 = 0;
            for (k, v) in map {
                let mut eh = DefaultHasher::new();
                hash_value(k, &mut eh);
                hash_value(v, &mut eh);
                acc = acc.wrapping_add(eh.finish());
            }
            acc.hash(h);
        }
        Value::Tagged(tagged) => {
            6u8.hash(h);
            tagged.tag.to_string().hash(h);
            hash_value(&tagged.value, h);
        }
    }
}

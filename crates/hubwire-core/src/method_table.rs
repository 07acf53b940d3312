//! Immutable method-id lookup table.
//!
//! Built once at hub startup from the registered methods, then only read.
//! Buckets are a power of two sized for a 0.72 load factor (at least 128), so
//! resolving an id is a mask, an index and a short linear scan of a slice.

use std::collections::HashMap;
use std::fmt;

use crate::constants::is_reserved_method_id;
use crate::errors::MethodTableError;
use crate::hashing::method_id;

const MIN_BUCKETS: usize = 128;

// Load factor 0.72 expressed as a ratio to stay in integer arithmetic.
const LOAD_NUMERATOR: usize = 100;
const LOAD_DENOMINATOR: usize = 72;

/// Read-only map from method id to `T`.
pub struct MethodTable<T> {
    buckets: Box<[Box<[(i32, T)]>]>,
    mask: usize,
    len: usize,
    max_conflict: usize,
}

impl<T> MethodTable<T> {
    /// Build a table from `(method_id, value)` pairs.
    ///
    /// Fails on a duplicate id or on an id the protocol reserves.
    pub fn build<I>(entries: I) -> Result<Self, MethodTableError>
    where
        I: IntoIterator<Item = (i32, T)>,
    {
        let entries: Vec<(i32, T)> = entries.into_iter().collect();
        let bucket_count = bucket_count(entries.len());
        let mask = bucket_count - 1;
        let mut staging: Vec<Vec<(i32, T)>> = (0..bucket_count).map(|_| Vec::new()).collect();
        let len = entries.len();

        for (id, value) in entries {
            if is_reserved_method_id(id) {
                return Err(MethodTableError::ReservedMethodId { method_id: id });
            }
            let bucket = &mut staging[bucket_index(id, mask)];
            if bucket.iter().any(|(existing, _)| *existing == id) {
                return Err(MethodTableError::DuplicateMethodId { method_id: id });
            }
            bucket.push((id, value));
        }

        let max_conflict = staging.iter().map(Vec::len).max().unwrap_or(0);
        let buckets = staging.into_iter().map(Vec::into_boxed_slice).collect();

        Ok(Self {
            buckets,
            mask,
            len,
            max_conflict,
        })
    }

    /// Build a table keyed by the FNV-1a id of each method name.
    ///
    /// A hash collision between two distinct names is reported with both names.
    pub fn from_named<N, I>(entries: I) -> Result<Self, MethodTableError>
    where
        N: AsRef<str>,
        I: IntoIterator<Item = (N, T)>,
    {
        let mut names: HashMap<i32, String> = HashMap::new();
        let mut hashed = Vec::new();
        for (name, value) in entries {
            let name = name.as_ref();
            let id = method_id(name);
            if let Some(first) = names.get(&id) {
                return Err(MethodTableError::DuplicateMethodName {
                    method_id: id,
                    first: first.clone(),
                    second: name.to_owned(),
                });
            }
            let _ = names.insert(id, name.to_owned());
            hashed.push((id, value));
        }
        Self::build(hashed)
    }

    /// Resolve a method id.
    #[inline]
    pub fn get(&self, method_id: i32) -> Option<&T> {
        let bucket = &self.buckets[bucket_index(method_id, self.mask)];
        // Most buckets hold zero or one entry.
        match bucket.first() {
            Some((id, value)) if *id == method_id => Some(value),
            Some(_) => bucket[1..]
                .iter()
                .find(|(id, _)| *id == method_id)
                .map(|(_, value)| value),
            None => None,
        }
    }

    /// Whether the id is present.
    pub fn contains(&self, method_id: i32) -> bool {
        self.get(method_id).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of buckets (always a power of two).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Length of the longest bucket.
    pub fn max_conflict(&self) -> usize {
        self.max_conflict
    }

    /// All entries, in bucket order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &T)> {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter().map(|(id, value)| (*id, value)))
    }

    /// All values, in bucket order.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.iter().map(|(_, value)| value)
    }
}

impl<T> fmt::Debug for MethodTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodTable")
            .field("len", &self.len)
            .field("buckets", &self.buckets.len())
            .field("max_conflict", &self.max_conflict)
            .finish()
    }
}

fn bucket_count(len: usize) -> usize {
    let wanted = (len * LOAD_NUMERATOR).div_ceil(LOAD_DENOMINATOR);
    wanted.max(MIN_BUCKETS).next_power_of_two()
}

#[inline]
fn bucket_index(method_id: i32, mask: usize) -> usize {
    (method_id as u32 as usize) & mask
}

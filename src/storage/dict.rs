//! Chained Hash Table with Incremental Rehashing
//!
//! [`Dict`] maps [`Value`] keys to [`Value`]s. It is the structure behind both
//! the key space and the expiry side table.
//!
//! ## Layout
//!
//! ```text
//!   Dict
//!   ├── tables[0]  (old / sole generation)
//!   │     buckets: [ ] [e]->[e] [ ] [e] ...     size = 2^n, mask = size - 1
//!   ├── tables[1]  (new generation, only while rehashing)
//!   │     buckets: [ ] [ ] [e] [ ] [ ] [ ] ...  size = 2^(n+1)
//!   └── rehash_idx: None | Some(next old bucket to migrate)
//! ```
//!
//! ## Incremental Rehashing
//!
//! Growing a table with millions of keys in one go would stall the event
//! loop. Instead, growth allocates the new generation and then moves one
//! old bucket per *step*. A step runs on every lookup, insert, delete and
//! random sample, and the server cron runs a batch of steps each tick.
//! While a rehash is in progress every lookup probes both generations and
//! inserts go to the new one, so every live key stays reachable.
//!
//! When the old generation's live count reaches zero the new one is
//! promoted to slot 0 and the dictionary goes back to idle.

use crate::storage::value::Value;
use rand::Rng;
use std::fmt;
use std::hash::{DefaultHasher, Hasher};
use thiserror::Error;

/// Bucket count of a freshly initialized table.
pub const DICT_INITIAL_SIZE: usize = 8;

/// Grow once the average chain is longer than this.
const FORCE_RESIZE_RATIO: usize = 2;

/// Growth multiplier.
const GROW_RATIO: usize = 2;

/// Errors reported by dictionary operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DictError {
    /// `expand` was asked to rehash while already rehashing, or to a size that
    /// is not larger than the current one.
    #[error("invalid expand to {requested} buckets (current: {current}, rehashing: {rehashing})")]
    InvalidExpand {
        requested: usize,
        current: usize,
        rehashing: bool,
    },

    /// `add` was called for a key that is already present.
    #[error("key already exists")]
    KeyExists,

    /// The key is not present.
    #[error("no such key")]
    KeyNotFound,
}

/// Pluggable key hashing and equality.
#[derive(Clone, Copy)]
pub struct DictType {
    pub hash: fn(&Value) -> u64,
    pub key_eq: fn(&Value, &Value) -> bool,
}

impl DictType {
    /// Keys compared by their string representation.
    pub const STRING_KEYS: DictType = DictType {
        hash: string_hash,
        key_eq: string_key_eq,
    };
}

impl Default for DictType {
    fn default() -> Self {
        Self::STRING_KEYS
    }
}

impl fmt::Debug for DictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DictType").finish_non_exhaustive()
    }
}

/// Hashes the string form of a key. Non-string keys all hash to 0.
pub fn string_hash(key: &Value) -> u64 {
    match key.string_bytes() {
        Some(bytes) => {
            let mut hasher = DefaultHasher::new();
            hasher.write(&bytes);
            hasher.finish()
        }
        None => 0,
    }
}

/// Two keys are equal when both are strings with identical bytes.
pub fn string_key_eq(a: &Value, b: &Value) -> bool {
    if Value::ptr_eq(a, b) {
        return a.is_string();
    }
    match (a.string_bytes(), b.string_bytes()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// One key/value pair in a bucket chain.
#[derive(Debug)]
pub struct Entry {
    key: Value,
    val: Value,
    next: Option<Box<Entry>>,
}

impl Entry {
    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn val(&self) -> &Value {
        &self.val
    }
}

/// One table generation.
#[derive(Debug)]
struct HashTable {
    buckets: Vec<Option<Box<Entry>>>,
    mask: usize,
    used: usize,
}

impl HashTable {
    fn with_size(size: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            buckets: (0..size).map(|_| None).collect(),
            mask: size - 1,
            used: 0,
        }
    }

    #[inline]
    fn size(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn bucket_of(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    fn find(
        &self,
        hash: u64,
        key: &Value,
        key_eq: fn(&Value, &Value) -> bool,
    ) -> Option<&Entry> {
        let mut cur = self.buckets[self.bucket_of(hash)].as_deref();
        while let Some(entry) = cur {
            if key_eq(&entry.key, key) {
                return Some(entry);
            }
            cur = entry.next.as_deref();
        }
        None
    }

    fn find_mut(
        &mut self,
        hash: u64,
        key: &Value,
        key_eq: fn(&Value, &Value) -> bool,
    ) -> Option<&mut Entry> {
        let idx = self.bucket_of(hash);
        let mut cur = self.buckets[idx].as_deref_mut();
        while let Some(entry) = cur {
            if key_eq(&entry.key, key) {
                return Some(entry);
            }
            cur = entry.next.as_deref_mut();
        }
        None
    }

    fn insert_head(&mut self, hash: u64, mut entry: Box<Entry>) {
        let idx = self.bucket_of(hash);
        entry.next = self.buckets[idx].take();
        self.buckets[idx] = Some(entry);
        self.used += 1;
    }

    fn remove(
        &mut self,
        hash: u64,
        key: &Value,
        key_eq: fn(&Value, &Value) -> bool,
    ) -> Option<Box<Entry>> {
        let idx = self.bucket_of(hash);
        let removed = unlink(&mut self.buckets[idx], key, key_eq)?;
        self.used -= 1;
        Some(removed)
    }
}

fn unlink(
    link: &mut Option<Box<Entry>>,
    key: &Value,
    key_eq: fn(&Value, &Value) -> bool,
) -> Option<Box<Entry>> {
    let found = match link.as_deref() {
        None => return None,
        Some(entry) => key_eq(&entry.key, key),
    };
    if found {
        let mut removed = link.take()?;
        *link = removed.next.take();
        Some(removed)
    } else {
        match link {
            Some(entry) => unlink(&mut entry.next, key, key_eq),
            None => None,
        }
    }
}

fn next_power(size: usize) -> usize {
    size.max(DICT_INITIAL_SIZE)
        .checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}

/// Size/usage of one table generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub size: usize,
    pub mask: usize,
    pub used: usize,
}

/// Snapshot of a dictionary's internal layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DictStats {
    pub tables: [Option<TableStats>; 2],
    pub rehash_index: Option<usize>,
}

/// A hash table that grows by incremental rehashing.
pub struct Dict {
    ty: DictType,
    tables: [Option<HashTable>; 2],
    rehash_idx: Option<usize>,
}

impl fmt::Debug for Dict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dict")
            .field("len", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Default for Dict {
    fn default() -> Self {
        Self::new(DictType::STRING_KEYS)
    }
}

impl Dict {
    /// Creates an empty dictionary. No buckets are allocated until the first
    /// insert.
    pub fn new(ty: DictType) -> Self {
        Self {
            ty,
            tables: [None, None],
            rehash_idx: None,
        }
    }

    #[inline]
    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx.is_some()
    }

    /// Number of live entries across both generations.
    pub fn len(&self) -> usize {
        self.tables.iter().flatten().map(|t| t.used).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DictStats {
        let table_stats = |t: &Option<HashTable>| {
            t.as_ref().map(|t| TableStats {
                size: t.size(),
                mask: t.mask,
                used: t.used,
            })
        };
        DictStats {
            tables: [table_stats(&self.tables[0]), table_stats(&self.tables[1])],
            rehash_index: self.rehash_idx,
        }
    }

    /// Looks up `key`, advancing an in-progress rehash by one step first.
    pub fn find(&mut self, key: &Value) -> Option<&Entry> {
        if self.tables[0].is_none() {
            return None;
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = (self.ty.hash)(key);
        let key_eq = self.ty.key_eq;
        self.tables
            .iter()
            .flatten()
            .find_map(|table| table.find(hash, key, key_eq))
    }

    /// Returns a new handle to the value stored under `key`.
    pub fn get(&mut self, key: &Value) -> Option<Value> {
        self.find(key).map(|entry| entry.val.clone())
    }

    pub fn contains_key(&mut self, key: &Value) -> bool {
        self.find(key).is_some()
    }

    /// Inserts or overwrites. An overwritten value is released.
    pub fn set(&mut self, key: Value, val: Value) {
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = (self.ty.hash)(&key);
        let key_eq = self.ty.key_eq;
        for table in self.tables.iter_mut().flatten() {
            if let Some(entry) = table.find_mut(hash, &key, key_eq) {
                entry.val = val;
                return;
            }
        }
        self.insert_new(hash, key, val);
    }

    /// Inserts only if `key` is absent.
    pub fn add(&mut self, key: Value, val: Value) -> Result<(), DictError> {
        if self.contains_key(&key) {
            return Err(DictError::KeyExists);
        }
        let hash = (self.ty.hash)(&key);
        self.insert_new(hash, key, val);
        Ok(())
    }

    /// Removes `key`, releasing both the key and its value.
    pub fn delete(&mut self, key: &Value) -> Result<(), DictError> {
        if self.tables[0].is_none() {
            return Err(DictError::KeyNotFound);
        }
        if self.is_rehashing() {
            self.rehash_step();
        }
        let hash = (self.ty.hash)(key);
        let key_eq = self.ty.key_eq;
        for table in self.tables.iter_mut().flatten() {
            if table.remove(hash, key, key_eq).is_some() {
                return Ok(());
            }
        }
        Err(DictError::KeyNotFound)
    }

    /// Samples a live entry.
    ///
    /// While rehashing, the generation is picked with probability
    /// proportional to its live count. Returns `None` when empty.
    pub fn random_entry(&mut self) -> Option<&Entry> {
        if self.is_rehashing() {
            self.rehash_step();
        }
        if self.is_empty() {
            return None;
        }

        let mut rng = rand::thread_rng();
        let slot = match &self.tables {
            [Some(old), Some(new)] => {
                if rng.gen_range(0..old.used + new.used) < old.used {
                    0
                } else {
                    1
                }
            }
            _ => 0,
        };
        let table = self.tables[slot].as_ref()?;
        if table.used == 0 {
            return None;
        }

        let mut idx = rng.gen_range(0..table.size());
        let mut probes = 0;
        while table.buckets[idx].is_none() && probes < table.used {
            idx = rng.gen_range(0..table.size());
            probes += 1;
        }
        if table.buckets[idx].is_none() {
            // Unlucky probes on a sparse table: walk forward to the next chain.
            idx = (0..table.size())
                .map(|offset| (idx + offset) & table.mask)
                .find(|&i| table.buckets[i].is_some())?;
        }

        let head = table.buckets[idx].as_deref()?;
        let chain_len = std::iter::successors(Some(head), |e| e.next.as_deref()).count();
        std::iter::successors(Some(head), |e| e.next.as_deref()).nth(rng.gen_range(0..chain_len))
    }

    /// Explicitly grows to at least `size` buckets (rounded up to a power of
    /// two) and starts rehashing into the new generation.
    pub fn expand(&mut self, size: usize) -> Result<(), DictError> {
        let requested = next_power(size);
        let current = self.tables[0].as_ref().map_or(0, HashTable::size);
        if self.is_rehashing() || current >= requested {
            return Err(DictError::InvalidExpand {
                requested,
                current,
                rehashing: self.is_rehashing(),
            });
        }
        self.resize_to(requested);
        Ok(())
    }

    /// Drops every entry and both table generations.
    pub fn clear(&mut self) {
        self.tables = [None, None];
        self.rehash_idx = None;
    }

    /// Runs a single rehash step.
    pub fn rehash_step(&mut self) {
        self.rehash(1);
    }

    /// Migrates up to `steps` non-empty buckets. Returns true if more work
    /// remains.
    pub fn rehash(&mut self, mut steps: usize) -> bool {
        let hash = self.ty.hash;
        while steps > 0 {
            let Some(start) = self.rehash_idx else {
                return false;
            };
            let [old, new] = &mut self.tables;
            let (Some(old), Some(new)) = (old.as_mut(), new.as_mut()) else {
                return false;
            };
            if old.used == 0 {
                self.finish_rehash();
                return false;
            }

            // Buckets below the cursor are already empty.
            let Some(offset) = old.buckets[start..].iter().position(Option::is_some) else {
                self.finish_rehash();
                return false;
            };
            let idx = start + offset;

            let mut chain = old.buckets[idx].take();
            while let Some(mut entry) = chain {
                chain = entry.next.take();
                let h = hash(&entry.key);
                old.used -= 1;
                new.insert_head(h, entry);
            }

            if old.used == 0 {
                self.finish_rehash();
                return false;
            }
            self.rehash_idx = Some(idx + 1);
            steps -= 1;
        }
        self.is_rehashing()
    }

    fn finish_rehash(&mut self) {
        self.tables[0] = self.tables[1].take();
        self.rehash_idx = None;
    }

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        let target = match &self.tables[0] {
            None => Some(DICT_INITIAL_SIZE),
            Some(t) if t.used > t.size() && t.used / t.size() > FORCE_RESIZE_RATIO => {
                Some(t.size() * GROW_RATIO)
            }
            Some(_) => None,
        };
        if let Some(size) = target {
            self.resize_to(size);
        }
    }

    fn resize_to(&mut self, size: usize) {
        let table = HashTable::with_size(next_power(size));
        if self.tables[0].is_none() {
            self.tables[0] = Some(table);
            self.rehash_idx = None;
        } else {
            self.tables[1] = Some(table);
            self.rehash_idx = Some(0);
        }
    }

    fn insert_new(&mut self, hash: u64, key: Value, val: Value) {
        self.expand_if_needed();
        let slot = usize::from(self.is_rehashing());
        if let Some(table) = self.tables[slot].as_mut() {
            table.insert_head(
                hash,
                Box::new(Entry {
                    key,
                    val,
                    next: None,
                }),
            );
        }
    }
}

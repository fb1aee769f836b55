//! The ordered entries map local to one tree node.
//!
//! The map is a thin skeletal wrapper around an ordered map: besides the
//! usual operations it tracks whether it is *live* (readable, writable) or
//! *bare* (tagged as deflated). Entries are stored inline in both states
//! and travel with the owning node when it is archived; `deflate` and
//! `inflate` only move the tag. The owning tree refuses access to a bare
//! map and reports the slot as not loaded.

use std::collections::{btree_map, BTreeMap};
use std::ops::Bound;

/// Ordered key/value entries of a single node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMap<K, V> {
    map: BTreeMap<K, V>,
    bare: bool,
}

impl<K: Ord, V> Default for EntryMap<K, V> {
    fn default() -> Self {
        EntryMap::new()
    }
}

impl<K: Ord, V> EntryMap<K, V> {
    /// Returns a new, empty, live map.
    pub fn new() -> Self {
        EntryMap {
            map: BTreeMap::new(),
            bare: false,
        }
    }

    /// Rebuilds a map from its serialized entries. The result is bare; the
    /// caller inflates it once the owning node is attached.
    pub fn from_serialized<I: IntoIterator<Item = (K, V)>>(entries: I) -> Self {
        EntryMap {
            map: entries.into_iter().collect(),
            bare: true,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// A live map serves reads and writes.
    pub fn is_live(&self) -> bool {
        !self.bare
    }

    /// A bare map is tagged as deflated and must be inflated before use.
    pub fn is_bare(&self) -> bool {
        self.bare
    }

    /// Tags the map as deflated. Idempotent.
    pub fn deflate(&mut self) {
        self.bare = true;
    }

    /// Clears the deflated tag. Idempotent.
    pub fn inflate(&mut self) {
        self.bare = false;
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.map.iter()
    }

    pub fn keys(&self) -> btree_map::Keys<'_, K, V> {
        self.map.keys()
    }

    /// Key at the given rank, counting from the smallest.
    pub fn key_at_rank(&self, rank: usize) -> Option<&K> {
        self.map.keys().nth(rank)
    }

    /// Number of entries with keys `<= key`; in the owning node this is
    /// the index of the child slot immediately to the right of `key`.
    pub fn rank_right(&self, key: &K) -> usize {
        self.map.range(..=key).count()
    }

    pub fn first_key(&self) -> Option<&K> {
        self.map.keys().next()
    }

    pub fn last_key(&self) -> Option<&K> {
        self.map.keys().next_back()
    }

    pub fn pop_first(&mut self) -> Option<(K, V)> {
        self.map.pop_first()
    }

    pub fn pop_last(&mut self) -> Option<(K, V)> {
        self.map.pop_last()
    }

    /// Iterates over entries with keys strictly between the two bounds.
    /// A missing bound is unbounded on that side.
    pub fn range_between<'a>(
        &'a self,
        lo: Option<&'a K>,
        hi: Option<&'a K>,
    ) -> btree_map::Range<'a, K, V> {
        let lo = lo.map_or(Bound::Unbounded, Bound::Excluded);
        let hi = hi.map_or(Bound::Unbounded, Bound::Excluded);
        self.map.range((lo, hi))
    }
}

impl<K: Ord + Clone, V> EntryMap<K, V> {
    /// Splits off the entries at ranks `>= rank` into a new map, leaving the
    /// first `rank` entries behind. Both halves keep the liveness tag.
    pub fn split_at_rank(&mut self, rank: usize) -> EntryMap<K, V> {
        let split_key = match self.map.keys().nth(rank) {
            Some(key) => key.clone(),
            None => {
                return EntryMap {
                    map: BTreeMap::new(),
                    bare: self.bare,
                }
            }
        };
        EntryMap {
            map: self.map.split_off(&split_key),
            bare: self.bare,
        }
    }

    /// Merges `other` into `self`. All keys of `other` must be greater than
    /// the keys already present.
    pub fn merge(&mut self, mut other: EntryMap<K, V>) {
        debug_assert!(match (self.last_key(), other.first_key()) {
            (Some(l), Some(r)) => l < r,
            _ => true,
        });
        self.map.append(&mut other.map);
    }
}

impl<K: Ord + Clone, V: Clone> EntryMap<K, V> {
    /// Clones the entries in order, for serialization.
    pub fn to_vec(&self) -> Vec<(K, V)> {
        self.map
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

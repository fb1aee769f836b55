//! Comparisons over node range endpoints.
//!
//! A node covers the half-open key range `[lkey, rkey)`. Endpoints are
//! `Option<K>` and are interpreted by position: a missing lower endpoint is
//! negative infinity, a missing upper endpoint is positive infinity. The
//! root therefore always covers `[None, None)`, the full key space.

use std::cmp::Ordering;

/// Compares two lower endpoints, `None` being negative infinity.
pub(crate) fn cmp_lower<K: Ord>(a: Option<&K>, b: Option<&K>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// Compares two upper endpoints, `None` being positive infinity.
pub(crate) fn cmp_upper<K: Ord>(a: Option<&K>, b: Option<&K>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

/// True iff `key` lies within the half-open range `[lkey, rkey)`.
pub(crate) fn range_contains<K: Ord>(lkey: Option<&K>, rkey: Option<&K>, key: &K) -> bool {
    lkey.map_or(true, |l| l <= key) && rkey.map_or(true, |r| key < r)
}

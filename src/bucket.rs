use std::collections::HashMap;

use crate::arena::NodeKey;
use crate::backend::HandleId;

/// One native timer handle plus the list of items sharing a duration.
///
/// The list sentinel lives in the node arena; the bucket only records
/// where to find it. Invariant: a bucket exists iff its native handle is
/// open, and the handle is armed whenever the list is non-empty.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Bucket {
    pub(crate) msecs: u64,
    pub(crate) handle: HandleId,
    pub(crate) sentinel: NodeKey,
    pub(crate) unrefed: bool,
}

/// Duration → bucket map. One table per liveness class; membership is
/// disjoint by construction.
#[derive(Default)]
pub(crate) struct BucketTable {
    map: HashMap<u64, Bucket>,
}

impl BucketTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn get(&self, msecs: u64) -> Option<&Bucket> {
        self.map.get(&msecs)
    }

    pub(crate) fn insert(&mut self, bucket: Bucket) {
        debug_assert!(!self.map.contains_key(&bucket.msecs));
        self.map.insert(bucket.msecs, bucket);
    }

    pub(crate) fn remove(&mut self, msecs: u64) -> Option<Bucket> {
        self.map.remove(&msecs)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

//! Deferred-free bookkeeping.
//!
//! Space freed while generation `g` is open or syncing must not be handed
//! out again until `g + TXG_DEFER_SIZE` is synced: until then a crash could
//! roll back to a state that still references it. Records are staged per
//! generation and moved to the allocatable set in the same critical section
//! that publishes the synced watermark.

use crate::state::TXG_DEFER_SIZE;
use crate::sync::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Object-set identifier the pool layer uses to scope frees.
pub type ObjsetId = u64;

/// A contiguous range of freed space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub size: u64,
}

impl Extent {
    #[inline]
    pub const fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// One past the last byte, saturating at `u64::MAX`.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

struct DeferInner {
    /// Frees keyed by the generation that recorded them.
    pending: BTreeMap<u64, Vec<(ObjsetId, Extent)>>,
    /// Frees whose defer window has passed, per object set.
    allocatable: HashMap<ObjsetId, Vec<Extent>>,
}

pub(crate) struct DeferredFrees {
    inner: Mutex<DeferInner>,
}

impl DeferredFrees {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(DeferInner {
                pending: BTreeMap::new(),
                allocatable: HashMap::new(),
            }),
        }
    }

    pub(crate) fn record(&self, objset: ObjsetId, txg: u64, extent: Extent) {
        self.inner
            .lock()
            .pending
            .entry(txg)
            .or_default()
            .push((objset, extent));
    }

    /// Release every record whose defer window closed with `synced_txg`.
    /// Returns the number of extents released.
    pub(crate) fn release_through(&self, synced_txg: u64) -> usize {
        let Some(cutoff) = synced_txg.checked_sub(TXG_DEFER_SIZE) else {
            return 0;
        };

        let mut inner = self.inner.lock();
        let keep = inner.pending.split_off(&(cutoff + 1));
        let ready = std::mem::replace(&mut inner.pending, keep);

        let mut released = 0;
        for (_, records) in ready {
            for (objset, extent) in records {
                inner.allocatable.entry(objset).or_default().push(extent);
                released += 1;
            }
        }
        released
    }

    pub(crate) fn take_allocatable(&self, objset: ObjsetId) -> Vec<Extent> {
        self.inner
            .lock()
            .allocatable
            .remove(&objset)
            .unwrap_or_default()
    }

    pub(crate) fn pending(&self, objset: ObjsetId) -> Vec<(u64, Extent)> {
        let inner = self.inner.lock();
        inner
            .pending
            .iter()
            .flat_map(|(txg, records)| {
                records
                    .iter()
                    .filter(move |(os, _)| *os == objset)
                    .map(move |(_, extent)| (*txg, *extent))
            })
            .collect()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.inner.lock().pending.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_waits_for_defer_window() {
        let defer = DeferredFrees::new();
        defer.record(1, 5, Extent::new(0, 4096));

        assert_eq!(defer.release_through(5), 0);
        assert_eq!(defer.release_through(6), 0);
        assert!(defer.take_allocatable(1).is_empty());

        assert_eq!(defer.release_through(7), 1);
        assert_eq!(defer.take_allocatable(1), vec![Extent::new(0, 4096)]);
        assert!(defer.take_allocatable(1).is_empty());
    }

    #[test]
    fn test_release_is_per_objset() {
        let defer = DeferredFrees::new();
        defer.record(1, 5, Extent::new(0, 512));
        defer.record(2, 5, Extent::new(512, 512));
        defer.record(2, 6, Extent::new(1024, 512));

        defer.release_through(7);
        assert_eq!(defer.pending(2), vec![(6, Extent::new(1024, 512))]);
        assert_eq!(defer.take_allocatable(2), vec![Extent::new(512, 512)]);
        assert_eq!(defer.take_allocatable(1), vec![Extent::new(0, 512)]);
        assert_eq!(defer.pending_count(), 1);
    }

    #[test]
    fn test_release_below_defer_size() {
        let defer = DeferredFrees::new();
        assert_eq!(defer.release_through(1), 0);
        assert_eq!(Extent::new(10, 5).end(), 15);
    }

    #[test]
    fn test_extent_end_saturates() {
        assert_eq!(Extent::new(u64::MAX - 1, 10).end(), u64::MAX);
        assert_eq!(Extent::new(u64::MAX, 0).end(), u64::MAX);
    }
}

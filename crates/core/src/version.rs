// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Entry version stamps. Every mutation of an entry carries one of these,
//! and the total order over them is what both the atomic and transactional
//! update paths agree on.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};

/// Number of bits of `node_order_dc` holding the node order; the remaining
/// high byte is the data-center id.
const NODE_ORDER_BITS: u32 = 24;
const NODE_ORDER_MASK: u32 = (1 << NODE_ORDER_BITS) - 1;

/// A 16-byte totally ordered version stamp: topology epoch, per-source
/// order, and a packed word carrying the originating node's order in the
/// cluster plus the data-center id.
///
/// The all-zero stamp is the *start version*, assigned to an entry that has
/// never been written. It is never re-issued by a [`VersionSource`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EntryVersion {
    topology: u32,
    order: u64,
    node_order_dc: u32,
}

impl EntryVersion {
    /// Sentinel for "never written".
    pub const START: EntryVersion = EntryVersion {
        topology: 0,
        order: 0,
        node_order_dc: 0,
    };

    pub fn new(topology: u32, order: u64, node_order: u32, dc_id: u8) -> Self {
        debug_assert!(node_order <= NODE_ORDER_MASK, "node order overflow");
        Self {
            topology,
            order,
            node_order_dc: (node_order & NODE_ORDER_MASK) | ((dc_id as u32) << NODE_ORDER_BITS),
        }
    }

    /// Reconstruct from the packed wire form (see the WAL record layout).
    pub fn from_parts(topology: u32, order: u64, node_order_dc: u32) -> Self {
        Self {
            topology,
            order,
            node_order_dc,
        }
    }

    pub fn topology(&self) -> u32 {
        self.topology
    }

    pub fn order(&self) -> u64 {
        self.order
    }

    pub fn node_order(&self) -> u32 {
        self.node_order_dc & NODE_ORDER_MASK
    }

    pub fn data_center_id(&self) -> u8 {
        (self.node_order_dc >> NODE_ORDER_BITS) as u8
    }

    /// Packed node-order/DC word as it appears on the wire.
    pub fn node_order_dc(&self) -> u32 {
        self.node_order_dc
    }

    pub fn is_start(&self) -> bool {
        *self == Self::START
    }
}

impl PartialOrd for EntryVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.topology
            .cmp(&other.topology)
            .then_with(|| self.order.cmp(&other.order))
            .then_with(|| self.node_order().cmp(&other.node_order()))
            .then_with(|| self.data_center_id().cmp(&other.data_center_id()))
    }
}

/// Comparator used by the atomic update path and by conflict merging: folds
/// the data-center id so that updates from the same DC follow numeric order
/// while cross-DC updates are ordered by DC id first.
pub fn atomic_cmp(a: &EntryVersion, b: &EntryVersion) -> Ordering {
    a.data_center_id()
        .cmp(&b.data_center_id())
        .then_with(|| a.topology.cmp(&b.topology))
        .then_with(|| a.order.cmp(&b.order))
        .then_with(|| a.node_order().cmp(&b.node_order()))
}

/// A version stamp together with the optional cross-datacenter conflict
/// stamp of the update that produced it. Updates arriving through DR carry
/// the originating DC's version here; locally originated updates carry
/// none, in which case the write version doubles as the conflict version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullVersion {
    pub version: EntryVersion,
    pub conflict: Option<EntryVersion>,
}

impl FullVersion {
    pub fn of(version: EntryVersion) -> Self {
        Self {
            version,
            conflict: None,
        }
    }

    pub fn with_conflict(version: EntryVersion, conflict: EntryVersion) -> Self {
        Self {
            version,
            conflict: Some(conflict),
        }
    }

    /// The stamp to use for conflict comparison: the DR stamp when present,
    /// the write version otherwise.
    pub fn conflict_version(&self) -> &EntryVersion {
        self.conflict.as_ref().unwrap_or(&self.version)
    }
}

/// Generator of entry versions for a single cache context. Orders are
/// handed out from a single atomic counter, so versions produced by one
/// source are strictly monotone under both comparators.
pub struct VersionSource {
    topology: AtomicU32,
    order: AtomicU64,
    node_order_dc: u32,
}

impl VersionSource {
    pub fn new(node_order: u32, dc_id: u8) -> Self {
        debug_assert!(node_order <= NODE_ORDER_MASK, "node order overflow");
        Self {
            topology: AtomicU32::new(1),
            order: AtomicU64::new(0),
            node_order_dc: (node_order & NODE_ORDER_MASK) | ((dc_id as u32) << NODE_ORDER_BITS),
        }
    }

    /// Record a topology change. Subsequent versions carry the new epoch.
    pub fn on_topology_change(&self, topology: u32) {
        self.topology.fetch_max(topology, AtomicOrdering::SeqCst);
    }

    pub fn topology(&self) -> u32 {
        self.topology.load(AtomicOrdering::SeqCst)
    }

    pub fn next(&self) -> EntryVersion {
        let order = self.order.fetch_add(1, AtomicOrdering::SeqCst) + 1;
        EntryVersion {
            topology: self.topology.load(AtomicOrdering::SeqCst),
            order,
            node_order_dc: self.node_order_dc,
        }
    }

    /// The most recently issued version, without issuing a new one.
    pub fn last(&self) -> EntryVersion {
        EntryVersion {
            topology: self.topology.load(AtomicOrdering::SeqCst),
            order: self.order.load(AtomicOrdering::SeqCst),
            node_order_dc: self.node_order_dc,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_node_order_dc() {
        let v = EntryVersion::new(3, 77, 0x00ab_cdef, 0x42);
        assert_eq!(v.topology(), 3);
        assert_eq!(v.order(), 77);
        assert_eq!(v.node_order(), 0x00ab_cdef);
        assert_eq!(v.data_center_id(), 0x42);

        let rt = EntryVersion::from_parts(v.topology(), v.order(), v.node_order_dc());
        assert_eq!(v, rt);
    }

    #[test]
    fn test_total_order() {
        let a = EntryVersion::new(1, 10, 1, 0);
        let b = EntryVersion::new(1, 11, 1, 0);
        let c = EntryVersion::new(2, 1, 1, 0);
        assert!(a < b);
        assert!(b < c);
        // Equality only when all components match.
        let d = EntryVersion::new(1, 10, 2, 0);
        assert_ne!(a, d);
        assert!(a < d);
    }

    #[test]
    fn test_atomic_cmp_same_dc_numeric() {
        let a = EntryVersion::new(1, 10, 1, 5);
        let b = EntryVersion::new(1, 11, 1, 5);
        assert_eq!(atomic_cmp(&a, &b), Ordering::Less);
        assert_eq!(atomic_cmp(&b, &a), Ordering::Greater);
        assert_eq!(atomic_cmp(&a, &a), Ordering::Equal);
    }

    #[test]
    fn test_atomic_cmp_cross_dc_by_dc_id() {
        // Numerically larger order in a lower DC still compares below.
        let low_dc = EntryVersion::new(9, 999, 9, 1);
        let high_dc = EntryVersion::new(1, 1, 1, 2);
        assert_eq!(atomic_cmp(&low_dc, &high_dc), Ordering::Less);
    }

    #[test]
    fn test_start_version() {
        assert!(EntryVersion::START.is_start());
        let src = VersionSource::new(1, 0);
        assert!(!src.next().is_start());
    }

    #[test]
    fn test_source_monotone() {
        let src = VersionSource::new(7, 2);
        let mut prev = src.next();
        for _ in 0..100 {
            let v = src.next();
            assert!(v > prev);
            assert_eq!(atomic_cmp(&v, &prev), Ordering::Greater);
            prev = v;
        }
        assert_eq!(src.last(), prev);
    }

    #[test]
    fn test_topology_change_bumps_epoch() {
        let src = VersionSource::new(1, 0);
        let before = src.next();
        src.on_topology_change(5);
        let after = src.next();
        assert_eq!(after.topology(), 5);
        assert!(after > before);
        // Topology never goes backwards.
        src.on_topology_change(3);
        assert_eq!(src.next().topology(), 5);
    }

    #[test]
    fn test_full_version_conflict_fallback() {
        let v = EntryVersion::new(1, 5, 1, 0);
        let c = EntryVersion::new(1, 3, 1, 8);
        assert_eq!(FullVersion::of(v).conflict_version(), &v);
        assert_eq!(FullVersion::with_conflict(v, c).conflict_version(), &c);
    }
}

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

//! Cross-datacenter conflict resolution. When an update carries a conflict
//! (DR) version, the pluggable resolver decides which side wins before the
//! regular version check would run.

use ember_core::{CacheValue, FullVersion, atomic_cmp};
use std::cmp::Ordering;

/// One side of a conflict: the entry's current state or the incoming
/// update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntryView {
    pub value: Option<CacheValue>,
    pub version: FullVersion,
    pub ttl: u64,
    pub expire_time: u64,
}

impl ConflictEntryView {
    pub fn data_center_id(&self) -> u8 {
        self.version.conflict_version().data_center_id()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictContext {
    pub old: ConflictEntryView,
    pub new: ConflictEntryView,
    /// Whether the caller asked for a version check; resolvers may weigh
    /// ties differently when it is off.
    pub version_check: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep the entry as it is; the incoming update is dropped.
    UseOld,
    /// Apply the incoming update as-is.
    UseNew,
    /// Apply a merged value in place of the incoming one.
    Merge {
        value: CacheValue,
        ttl: Option<u64>,
        expire_time: Option<u64>,
    },
}

pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, ctx: &ConflictContext) -> ConflictResolution;
}

/// Default resolver: order conflict versions with the DC-folding
/// comparator, newer wins, ties keep the old value.
pub struct VersionedResolver;

impl ConflictResolver for VersionedResolver {
    fn resolve(&self, ctx: &ConflictContext) -> ConflictResolution {
        let old = ctx.old.version.conflict_version();
        let new = ctx.new.version.conflict_version();
        match atomic_cmp(new, old) {
            Ordering::Greater => ConflictResolution::UseNew,
            _ => ConflictResolution::UseOld,
        }
    }
}

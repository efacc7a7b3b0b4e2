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

//! Compact storage for the rarely-present per-entry fields. Most entries
//! carry no TTL, no lock candidates and no tombstone marker, so the whole
//! record is a single nullable box on the entry state.

use crate::mvcc::MvccList;
use ember_core::EntryVersion;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryExtras {
    ttl: u64,
    expire_time: u64,
    mvcc: Option<MvccList>,
    obsolete: Option<EntryVersion>,
}

impl EntryExtras {
    fn is_vacant(&self) -> bool {
        self.ttl == 0
            && self.expire_time == 0
            && self.obsolete.is_none()
            && self.mvcc.as_ref().is_none_or(|m| m.is_empty())
    }
}

/// The entry-side handle: `None` until some field is set, dropped again
/// once every field reverts to its default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extras(Option<Box<EntryExtras>>);

impl Extras {
    pub fn new() -> Self {
        Self(None)
    }

    pub fn ttl(&self) -> u64 {
        self.0.as_ref().map_or(0, |e| e.ttl)
    }

    pub fn expire_time(&self) -> u64 {
        self.0.as_ref().map_or(0, |e| e.expire_time)
    }

    pub fn obsolete_version(&self) -> Option<&EntryVersion> {
        self.0.as_ref().and_then(|e| e.obsolete.as_ref())
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete_version().is_some()
    }

    pub fn mvcc(&self) -> Option<&MvccList> {
        self.0.as_ref().and_then(|e| e.mvcc.as_ref())
    }

    pub fn is_present(&self) -> bool {
        self.0.is_some()
    }

    /// Set TTL and expire time together. `expire_time == 0` means eternal
    /// and implies the TTL is dropped as well.
    pub fn set_expiration(&mut self, ttl: u64, expire_time: u64) {
        debug_assert!(
            expire_time == 0 || ttl > 0,
            "finite expire time requires a positive ttl"
        );
        if expire_time == 0 {
            if let Some(e) = self.0.as_mut() {
                e.ttl = 0;
                e.expire_time = 0;
            }
        } else {
            let e = self.0.get_or_insert_default();
            e.ttl = ttl;
            e.expire_time = expire_time;
        }
        self.normalize();
    }

    pub fn set_obsolete(&mut self, version: EntryVersion) {
        self.0.get_or_insert_default().obsolete = Some(version);
    }

    /// Run a mutation against the lock-candidate list, materializing it on
    /// demand and dropping it again if the mutation leaves it empty.
    pub fn with_mvcc<R>(&mut self, f: impl FnOnce(&mut MvccList) -> R) -> R {
        let e = self.0.get_or_insert_default();
        let r = f(e.mvcc.get_or_insert_default());
        if e.mvcc.as_ref().is_some_and(|m| m.is_empty()) {
            e.mvcc = None;
        }
        self.normalize();
        r
    }

    fn normalize(&mut self) {
        if self.0.as_ref().is_some_and(|e| e.is_vacant()) {
            self.0 = None;
        }
    }
}

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

use crate::key::CacheKey;
use crate::value::CacheValue;
use crate::version::EntryVersion;
use strum::FromRepr;
use uuid::Uuid;

/// Event kinds emitted from the entry boundary. The numeric ids are part of
/// the wire/monitoring contract and must not change.
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromRepr)]
pub enum EventKind {
    Put = 63,
    Read = 64,
    Removed = 65,
    Locked = 66,
    Unlocked = 67,
    Expired = 70,
}

impl EventKind {
    pub fn id(&self) -> u16 {
        *self as u16
    }
}

/// A single entry-level event, as handed to the event channel and to
/// continuous-query listeners.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    pub kind: EventKind,
    pub cache_id: u32,
    pub key: CacheKey,
    pub old_value: Option<CacheValue>,
    pub new_value: Option<CacheValue>,
    pub version: EntryVersion,
    /// Node on which the triggering operation originated.
    pub node_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_are_stable() {
        assert_eq!(EventKind::Put.id(), 63);
        assert_eq!(EventKind::Read.id(), 64);
        assert_eq!(EventKind::Removed.id(), 65);
        assert_eq!(EventKind::Locked.id(), 66);
        assert_eq!(EventKind::Unlocked.id(), 67);
        assert_eq!(EventKind::Expired.id(), 70);
    }

    #[test]
    fn test_event_ids_round_trip() {
        for kind in [
            EventKind::Put,
            EventKind::Read,
            EventKind::Removed,
            EventKind::Locked,
            EventKind::Unlocked,
            EventKind::Expired,
        ] {
            assert_eq!(EventKind::from_repr(kind.id()), Some(kind));
        }
        assert_eq!(EventKind::from_repr(69), None);
    }
}

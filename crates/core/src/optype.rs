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

use strum::FromRepr;
use thiserror::Error;

/// Operation types persisted in performance-statistics files. The byte ids
/// are stable across releases; records written by an older node must parse
/// on a newer one.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromRepr)]
pub enum OperationType {
    CacheGet = 0,
    CachePut = 1,
    CacheRemove = 2,
    CacheGetAndPut = 3,
    CacheGetAndRemove = 4,
    CacheInvoke = 5,
    CacheLock = 6,
    CacheGetAll = 7,
    CachePutAll = 8,
    CacheRemoveAll = 9,
    CacheInvokeAll = 10,
    TxCommit = 11,
    TxRollback = 12,
    Query = 13,
    QueryReads = 14,
    Task = 15,
    Job = 16,
    CacheStart = 17,
    Checkpoint = 18,
    PagesWriteThrottle = 19,
    /// Statistics file format version marker.
    Version = 255,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid operation type id: {0}")]
pub struct InvalidOperationType(pub u8);

impl OperationType {
    pub fn id(&self) -> u8 {
        *self as u8
    }

    pub fn from_id(id: u8) -> Result<Self, InvalidOperationType> {
        Self::from_repr(id).ok_or(InvalidOperationType(id))
    }

    /// Cache operations have per-cache statistics rows; tx/task/system
    /// operations aggregate node-wide.
    pub fn is_cache_op(&self) -> bool {
        self.id() <= Self::CacheInvokeAll.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_stable() {
        assert_eq!(OperationType::CacheGet.id(), 0);
        assert_eq!(OperationType::CachePut.id(), 1);
        assert_eq!(OperationType::TxCommit.id(), 11);
        assert_eq!(OperationType::Checkpoint.id(), 18);
        assert_eq!(OperationType::Version.id(), 255);
    }

    #[test]
    fn test_round_trip_and_reject() {
        for id in 0..=19u8 {
            assert_eq!(OperationType::from_id(id).unwrap().id(), id);
        }
        assert_eq!(
            OperationType::from_id(255).unwrap(),
            OperationType::Version
        );
        assert_eq!(OperationType::from_id(20), Err(InvalidOperationType(20)));
    }

    #[test]
    fn test_cache_op_partition() {
        assert!(OperationType::CacheGet.is_cache_op());
        assert!(OperationType::CacheInvokeAll.is_cache_op());
        assert!(!OperationType::TxCommit.is_cache_op());
        assert!(!OperationType::Version.is_cache_op());
    }
}

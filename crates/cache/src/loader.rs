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

use ember_core::{CacheError, CacheKey, CacheValue, EntryVersion};

/// External backing store for read-through and write-through. Calls can
/// block. On the atomic path the load/write runs inside the entry critical
/// section, so implementations MUST NOT re-enter the cache; the engine has
/// no way to detect the resulting deadlock.
pub trait CacheStore: Send + Sync {
    fn load(&self, key: &CacheKey) -> Result<Option<CacheValue>, CacheError>;

    fn write(
        &self,
        key: &CacheKey,
        value: &CacheValue,
        version: &EntryVersion,
    ) -> Result<(), CacheError>;

    fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;
}

/// Store that persists nothing and loads nothing.
pub struct NoopStore;

impl CacheStore for NoopStore {
    fn load(&self, _key: &CacheKey) -> Result<Option<CacheValue>, CacheError> {
        Ok(None)
    }

    fn write(
        &self,
        _key: &CacheKey,
        _value: &CacheValue,
        _version: &EntryVersion,
    ) -> Result<(), CacheError> {
        Ok(())
    }

    fn delete(&self, _key: &CacheKey) -> Result<(), CacheError> {
        Ok(())
    }
}

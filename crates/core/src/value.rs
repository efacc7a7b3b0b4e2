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

use crate::error::CacheError;
use byteview::ByteView;
use std::collections::HashMap;
use std::sync::RwLock;

/// Well-known value type tags. Anything above `RESERVED_MAX` belongs to
/// user-registered types and must be present in the [`TypeRegistry`] before
/// a value with that tag can be unwrapped.
pub mod value_tags {
    pub const RAW: u8 = 0;
    pub const STRING: u8 = 1;
    pub const I64: u8 = 2;
    pub const RESERVED_MAX: u8 = 31;
}

/// Opaque value wrapper carried by cache entries: the canonical serialized
/// form plus a type tag. Equality is by tag and bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheValue {
    tag: u8,
    bytes: ByteView,
}

impl CacheValue {
    pub fn new(tag: u8, bytes: impl Into<ByteView>) -> Self {
        Self {
            tag,
            bytes: bytes.into(),
        }
    }

    pub fn raw(bytes: impl Into<ByteView>) -> Self {
        Self::new(value_tags::RAW, bytes)
    }

    pub fn string(s: &str) -> Self {
        Self::new(value_tags::STRING, s.as_bytes().to_vec())
    }

    pub fn i64(v: i64) -> Self {
        Self::new(value_tags::I64, v.to_le_bytes().to_vec())
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    pub fn byte_view(&self) -> ByteView {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_str(&self) -> Result<&str, CacheError> {
        if self.tag != value_tags::STRING {
            return Err(CacheError::Encoding(format!(
                "expected string tag, got {}",
                self.tag
            )));
        }
        std::str::from_utf8(self.bytes()).map_err(|e| CacheError::Encoding(e.to_string()))
    }

    pub fn as_i64(&self) -> Result<i64, CacheError> {
        if self.tag != value_tags::I64 || self.bytes.len() != 8 {
            return Err(CacheError::Encoding(format!(
                "expected i64 tag, got {} ({} bytes)",
                self.tag,
                self.bytes.len()
            )));
        }
        Ok(i64::from_le_bytes(self.bytes()[0..8].try_into().unwrap()))
    }
}

/// Registry of user value types. Unwrapping a value whose tag is above the
/// reserved range and not registered here fails with
/// [`CacheError::UnregisteredType`]; the caller is expected to register the
/// type and retry the operation.
pub struct TypeRegistry {
    names: RwLock<HashMap<u8, String>>,
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            names: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, tag: u8, name: impl Into<String>) {
        self.names.write().unwrap().insert(tag, name.into());
    }

    pub fn name_of(&self, tag: u8) -> Option<String> {
        self.names.read().unwrap().get(&tag).cloned()
    }

    /// Verify a value's tag is resolvable before handing it to user code.
    pub fn ensure_registered(&self, value: &CacheValue) -> Result<(), CacheError> {
        if value.tag() <= value_tags::RESERVED_MAX {
            return Ok(());
        }
        if self.names.read().unwrap().contains_key(&value.tag()) {
            Ok(())
        } else {
            Err(CacheError::UnregisteredType(value.tag()))
        }
    }
}

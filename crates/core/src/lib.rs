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

//! Foundational types for the ember entry engine: version stamps and their
//! comparators, the opaque value/key wrappers, entry event codes, and the
//! operation-type enum persisted in performance-statistics files.

mod error;
mod events;
mod key;
mod optype;
mod value;
mod version;

pub use error::CacheError;
pub use events::{CacheEvent, EventKind};
pub use key::CacheKey;
pub use optype::{InvalidOperationType, OperationType};
pub use value::{CacheValue, TypeRegistry, value_tags};
pub use version::{EntryVersion, FullVersion, VersionSource, atomic_cmp};

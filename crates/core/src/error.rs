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

use thiserror::Error;

/// Errors surfaced by entry operations. Business-rule rejections (version
/// check, filter, interceptor veto, conflict resolution) are NOT errors;
/// they come back as outcome codes on the result structs. Only states the
/// caller must react to structurally live here.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum CacheError {
    /// The entry was marked obsolete before or during the operation.
    /// Callers retry on a fresh map lookup.
    #[error("entry was concurrently removed")]
    EntryRemoved,

    /// External read-through/write-through store failed; the entry's
    /// in-memory state is unchanged.
    #[error("loader failure: {0}")]
    Loader(String),

    /// Row store mutation failed; fatal for the operation, re-raised.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Write-ahead log append failed; fatal for the operation, re-raised.
    #[error("write-ahead log failure: {0}")]
    Wal(String),

    /// The node is shutting down. Swallowed (logged) on expiration paths.
    #[error("node is stopping")]
    NodeStopping,

    /// A transactional mutator was called without holding the entry's lock
    /// owner slot. Protocol violation on the caller's side.
    #[error("transaction does not hold the entry lock")]
    NotOwner,

    /// A value's type tag is not in the type registry. Surfaced so the
    /// caller can register the type and retry.
    #[error("unregistered value type tag: {0}")]
    UnregisteredType(u8),

    #[error("encoding error: {0}")]
    Encoding(String),
}

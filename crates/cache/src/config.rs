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

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable overriding the diagnostics lock-wait timeout.
/// Read exactly once, at cache startup; later changes to the process
/// environment have no effect on a running cache.
pub const ENTRY_LOCK_WAIT_ENV: &str = "EMBER_ENTRY_LOCK_WAIT_MS";

const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(500);

/// Per-cache configuration. Capability flags replace the original tier
/// specializations: a cache is near and/or dht, tracks readers or not,
/// defers deletes or marks entries obsolete eagerly.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When set, removes tombstone the entry (`deleted` flag) and hand it
    /// to the deferred-delete queue instead of marking it obsolete inline.
    pub deferred_delete: bool,
    /// This cache keeps a client-side near tier; near entries record the
    /// DHT version of the primary they mirror.
    pub near: bool,
    /// This cache is a DHT (primary/backup) tier.
    pub dht: bool,
    /// Track near readers on DHT entries.
    pub track_readers: bool,
    /// Append a WAL record for every persisted mutation.
    pub wal_enabled: bool,
    /// Emit READ/PUT/REMOVED/... events on the event channel.
    pub record_events: bool,
    /// How long the diagnostics paths (entry stringification) will wait on
    /// a contended entry lock before giving up and reporting `<locked>`.
    pub lock_wait: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            deferred_delete: false,
            near: false,
            dht: false,
            track_readers: false,
            wal_enabled: true,
            record_events: true,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }
}

impl CacheConfig {
    /// Default configuration with the lock-wait timeout taken from the
    /// process environment. The value is frozen into the returned config;
    /// there is no global, mutable copy.
    pub fn from_env() -> Self {
        let lock_wait = std::env::var(ENTRY_LOCK_WAIT_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LOCK_WAIT);
        Self {
            lock_wait,
            ..Default::default()
        }
    }
}
